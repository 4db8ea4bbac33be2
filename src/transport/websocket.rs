//! WebSocket transport: one binary message per protocol message.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{FrameSink, FrameSource, TransportError, TransportKind, origin_allowed, serve_connection};
use crate::protocol::framing::MessageBuf;
use crate::protocol::{self, MAX_MESSAGE_LEN, MessageType};
use crate::server::ServerState;

/// Longest close reason a WebSocket close frame can carry.
const MAX_CLOSE_REASON: usize = 123;

/// `GET /ws`
pub(crate) async fn handle_upgrade(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    info!(remote = %remote, "websocket connection attempt");

    let Some(permit) = state.admission.try_acquire() else {
        warn!(
            remote = %remote,
            max = state.admission.max(),
            "connection limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Maximum connections reached").into_response();
    };

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.config.allow_origins, origin, host) {
        warn!(remote = %remote, origin = ?origin, "origin not allowed");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    ws.max_message_size(MAX_MESSAGE_LEN)
        .on_failed_upgrade(move |e| error!(remote = %remote, "websocket upgrade failed: {}", e))
        .on_upgrade(move |socket| async move {
            let (sender, receiver) = socket.split();
            let _ = serve_connection(
                &state,
                WsSink::new(sender),
                WsSource::new(receiver),
                TransportKind::WebSocket,
                Some(remote),
            )
            .await;
            drop(permit);
        })
}

pub struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self { sender }
    }

    async fn close_with(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: truncate(reason, MAX_CLOSE_REASON).to_string().into(),
        };
        if let Err(e) = self.sender.send(Message::Close(Some(frame))).await {
            debug!("websocket close failed: {}", e);
        }
        let _ = self.sender.close().await;
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, kind: MessageType, payload: &[u8]) -> Result<(), TransportError> {
        let message = protocol::encode_message(kind, payload);
        self.sender.send(Message::Binary(Bytes::from(message))).await?;
        Ok(())
    }

    async fn finish(&mut self) {
        self.close_with(close_code::NORMAL, "session closed").await;
    }

    async fn abort(&mut self, reason: &str) {
        self.close_with(close_code::ERROR, reason).await;
    }
}

pub struct WsSource {
    receiver: SplitStream<WebSocket>,
}

impl WsSource {
    pub fn new(receiver: SplitStream<WebSocket>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Option<MessageBuf>, TransportError> {
        while let Some(message) = self.receiver.next().await {
            match message? {
                Message::Binary(data) => return Ok(Some(MessageBuf::Shared(data))),
                Message::Text(text) => {
                    return Ok(Some(MessageBuf::Shared(Bytes::copy_from_slice(
                        text.as_str().as_bytes(),
                    ))));
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
        Ok(None)
    }
}

fn truncate(reason: &str, max: usize) -> &str {
    if reason.len() <= max {
        return reason;
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

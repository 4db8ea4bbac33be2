//! WebTransport transport: the client opens one bidirectional stream on
//! which every protocol message is length-prefixed.

use anyhow::Context;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use wtransport::endpoint::endpoint_side::Server;
use wtransport::endpoint::IncomingSession;
use wtransport::{Endpoint, SendStream, ServerConfig, VarInt};

use super::stream::{StreamSink, StreamSource};
use super::{FrameSink, TransportError, TransportKind, origin_allowed, serve_connection};
use crate::protocol::MessageType;
use crate::server::ServerState;
use crate::tls::CertInfo;

/// Path of the WebTransport endpoint.
pub const WEBTRANSPORT_PATH: &str = "/webtransport";

const KEEP_ALIVE: Duration = Duration::from_secs(3);
/// How long a finished session waits for the client to acknowledge the last
/// data and hang up before the connection is closed from this side.
const LINGER: Duration = Duration::from_secs(2);

/// Binds the QUIC endpoint.
pub(crate) fn bind(addr: SocketAddr, cert: &CertInfo) -> anyhow::Result<Endpoint<Server>> {
    let config = ServerConfig::builder()
        .with_bind_address(addr)
        .with_identity(cert.identity())
        .keep_alive_interval(Some(KEEP_ALIVE))
        .build();
    Endpoint::server(config).with_context(|| format!("failed to bind WebTransport on {addr}"))
}

/// Accepts sessions until shutdown, then waits for the running ones.
pub(crate) async fn serve(state: Arc<ServerState>, endpoint: Endpoint<Server>) -> anyhow::Result<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    error!("webtransport connection task failed: {}", e);
                }
            }
            incoming = endpoint.accept() => {
                connections.spawn(handle_incoming(state.clone(), incoming));
            }
        }
    }

    while connections.join_next().await.is_some() {}
    endpoint.close(VarInt::from_u32(0), b"server shutting down");
    info!("webtransport listener stopped");
    Ok(())
}

async fn handle_incoming(state: Arc<ServerState>, incoming: IncomingSession) {
    let request = match incoming.await {
        Ok(request) => request,
        Err(e) => {
            debug!("webtransport handshake failed: {}", e);
            return;
        }
    };
    let remote = request.remote_address();
    info!(remote = %remote, "webtransport connection attempt");

    let path = request.path().split('?').next().unwrap_or_default();
    if path != WEBTRANSPORT_PATH {
        debug!(remote = %remote, path, "unknown webtransport path");
        request.not_found().await;
        return;
    }

    let Some(_permit) = state.admission.try_acquire() else {
        warn!(
            remote = %remote,
            max = state.admission.max(),
            "connection limit reached"
        );
        request.too_many_requests().await;
        return;
    };

    if !origin_allowed(
        &state.config.allow_origins,
        request.origin(),
        Some(request.authority()),
    ) {
        warn!(remote = %remote, origin = ?request.origin(), "origin not allowed");
        request.forbidden().await;
        return;
    }

    let connection = match request.accept().await {
        Ok(connection) => connection,
        Err(e) => {
            error!(remote = %remote, "webtransport upgrade failed: {}", e);
            return;
        }
    };

    let streams = tokio::select! {
        _ = state.shutdown.cancelled() => return,
        streams = tokio::time::timeout(state.config.handshake_timeout(), connection.accept_bi()) => streams,
    };
    let (send, recv) = match streams {
        Ok(Ok(streams)) => streams,
        Ok(Err(e)) => {
            error!(remote = %remote, "stream accept failed: {}", e);
            return;
        }
        Err(_) => {
            warn!(remote = %remote, "client opened no stream");
            connection.close(VarInt::from_u32(0), b"no stream opened");
            return;
        }
    };

    let outcome = serve_connection(
        &state,
        WtSink::new(send),
        StreamSource::new(recv),
        TransportKind::WebTransport,
        Some(remote),
    )
    .await;

    // Closing the connection discards anything the client has not received
    // yet, so give it the chance to hang up first.
    if tokio::time::timeout(LINGER, connection.closed()).await.is_err() {
        debug!(remote = %remote, "client did not hang up, closing");
    }
    match outcome {
        Ok(()) => connection.close(VarInt::from_u32(0), b"session closed"),
        Err(_) => connection.close(VarInt::from_u32(1), b"session creation failed"),
    }
}

/// Sink over the WebTransport send stream. Finishing waits until the client
/// has acknowledged everything written.
pub struct WtSink {
    inner: StreamSink<SendStream>,
}

impl WtSink {
    pub fn new(send: SendStream) -> Self {
        Self {
            inner: StreamSink::new(send),
        }
    }
}

#[async_trait]
impl FrameSink for WtSink {
    async fn send(&mut self, kind: MessageType, payload: &[u8]) -> Result<(), TransportError> {
        self.inner.send(kind, payload).await
    }

    async fn finish(&mut self) {
        match tokio::time::timeout(LINGER, self.inner.get_mut().finish()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("stream finish failed: {}", e),
            Err(_) => debug!("stream finish not acknowledged within {:?}", LINGER),
        }
    }

    async fn abort(&mut self, reason: &str) {
        self.inner.abort(reason).await;
    }
}

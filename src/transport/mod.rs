//! # Transports
//!
//! Each transport turns an accepted connection into a [`FrameSink`] and a
//! [`FrameSource`] carrying protocol messages, then hands both to
//! [`serve_connection`], which is written once for every transport:
//!
//! 1. wait (bounded) for the client's initial size, falling back to 80x24
//! 2. open the session and register it
//! 3. send the options message
//! 4. run the output and input pumps until either one ends
//! 5. close the session and deregister it exactly once
//!
//! The pumps share one cancellation token derived from the server's. Either
//! pump ending cancels it, and both check it wherever they could block, so
//! neither is left waiting after the other side is gone.

pub mod stream;
pub mod websocket;
pub mod webtransport;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;

use crate::protocol::framing::MessageBuf;
use crate::protocol::{self, MessageType, ProtocolError};
use crate::pty::WindowSize;
use crate::server::ServerState;
use crate::session::{Session, SessionOptions};

/// Connection-level replies (pong) queued from the input pump.
const CONTROL_QUEUE: usize = 8;
/// How long trailing output is still forwarded after the program has ended.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no input from client for {0:?}")]
    IdleTimeout(Duration),

    #[error("peer closed the connection")]
    Closed,

    #[error("connection cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    WebTransport,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::WebSocket => f.write_str("websocket"),
            TransportKind::WebTransport => f.write_str("webtransport"),
        }
    }
}

/// Outgoing half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, kind: MessageType, payload: &[u8]) -> Result<(), TransportError>;

    /// Ends the outgoing direction cleanly.
    async fn finish(&mut self);

    /// Ends the connection with an error status.
    async fn abort(&mut self, reason: &str);
}

/// Incoming half of a connection.
///
/// `recv` must be cancel safe: dropping its future loses no data.
#[async_trait]
pub trait FrameSource: Send {
    /// Next message, or `Ok(None)` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<MessageBuf>, TransportError>;
}

/// Session creation failed; the connection was ended with an error status.
#[derive(Debug)]
pub struct SessionRefused(pub anyhow::Error);

/// Drives one accepted connection from handshake to teardown.
pub(crate) async fn serve_connection<S, R>(
    state: &ServerState,
    sink: S,
    source: R,
    transport: TransportKind,
    remote: Option<SocketAddr>,
) -> Result<(), SessionRefused>
where
    S: FrameSink,
    R: FrameSource,
{
    let span = info_span!(
        parent: &state.span,
        "connection",
        transport = %transport,
        remote = ?remote
    );
    run_connection(state, sink, source, remote)
        .instrument(span)
        .await
}

async fn run_connection<S, R>(
    state: &ServerState,
    mut sink: S,
    mut source: R,
    remote: Option<SocketAddr>,
) -> Result<(), SessionRefused>
where
    S: FrameSink,
    R: FrameSource,
{
    let connection = state.shutdown.child_token();
    let size = match negotiate_size(&mut source, state.config.handshake_timeout(), &connection).await
    {
        Ok(size) => size,
        Err(e) => {
            debug!("connection ended before a session started: {}", e);
            sink.finish().await;
            return Ok(());
        }
    };

    let options = SessionOptions {
        size,
        backend: state.backend,
        parent: connection.clone(),
        remote,
    };
    let session = match Session::open(&state.mode, options) {
        Ok(session) => session,
        Err(e) => {
            error!("session creation failed: {:#}", e);
            sink.abort(&format!("{e:#}")).await;
            return Err(SessionRefused(e));
        }
    };
    state.registry.insert(session.clone());
    info!(session = %session.id(), size = %size, "session attached");

    let options = protocol::options_payload(state.config.read_only);
    if let Err(e) = sink.send(MessageType::Options, &options).await {
        debug!("failed to send options: {}", e);
    }

    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let input = InputPump {
        session: &session,
        control: control_tx,
        cancel: &connection,
        read_only: state.config.read_only,
        idle_timeout: state.config.idle_timeout(),
    };
    tokio::join!(
        output_pump(&session, &mut sink, control_rx, &connection),
        input.run(&mut source),
    );

    sink.finish().await;
    if let Some(session) = state.registry.remove(session.id()) {
        session.close().await;
    }
    info!(
        session = %session.id(),
        duration_secs = session.elapsed().as_secs(),
        "connection ended"
    );
    Ok(())
}

/// Reads the first message and takes the window size from it if it is a
/// resize. Anything else, or nothing within `wait`, gives the default size.
async fn negotiate_size<R: FrameSource>(
    source: &mut R,
    wait: Duration,
    cancel: &CancellationToken,
) -> Result<WindowSize, TransportError> {
    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        first = tokio::time::timeout(wait, source.recv()) => first,
    };
    let message = match first {
        Err(_) => {
            debug!("no initial size within {:?}, using {}", wait, WindowSize::DEFAULT);
            return Ok(WindowSize::DEFAULT);
        }
        Ok(Ok(Some(message))) => message,
        Ok(Ok(None)) => return Err(TransportError::Closed),
        Ok(Err(e)) => return Err(e),
    };

    match protocol::split_message(&message) {
        Some((kind, payload)) if kind == MessageType::Resize.as_byte() => {
            match protocol::parse_resize(payload) {
                Ok(size) => {
                    debug!("initial size from client: {}", size);
                    Ok(size)
                }
                Err(e) => {
                    warn!("ignoring initial resize: {}", e);
                    Ok(WindowSize::DEFAULT)
                }
            }
        }
        _ => {
            debug!("first message was not a resize, using {}", WindowSize::DEFAULT);
            Ok(WindowSize::DEFAULT)
        }
    }
}

async fn send_or_cancel<S: FrameSink>(
    sink: &mut S,
    cancel: &CancellationToken,
    kind: MessageType,
    payload: &[u8],
) -> Result<(), TransportError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        sent = sink.send(kind, payload) => sent,
    }
}

/// Streams terminal output, titles and pongs to the client.
async fn output_pump<S: FrameSink>(
    session: &Session,
    sink: &mut S,
    mut control: mpsc::Receiver<MessageType>,
    cancel: &CancellationToken,
) {
    let _cancel_on_exit = cancel.clone().drop_guard();
    let mut bytes_sent: u64 = 0;

    loop {
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(bytes_sent, "output stopped");
                return;
            }
            Some(kind) = control.recv() => send_or_cancel(sink, cancel, kind, &[]).await,
            Some(title) = session.next_title() => {
                send_or_cancel(sink, cancel, MessageType::Title, title.as_bytes()).await
            }
            chunk = session.read() => match chunk {
                Ok(Some(chunk)) => {
                    if bytes_sent == 0 {
                        debug!(bytes = chunk.len(), "first output");
                    }
                    bytes_sent += chunk.len() as u64;
                    send_or_cancel(sink, cancel, MessageType::Output, &chunk).await
                }
                Ok(None) | Err(_) => {
                    debug!(bytes_sent, "terminal closed, sending close");
                    let _ = send_or_cancel(sink, cancel, MessageType::Close, &[]).await;
                    return;
                }
            },
            _ = session.done() => {
                drain_output(session, sink, cancel).await;
                debug!("session ended, sending close");
                let _ = send_or_cancel(sink, cancel, MessageType::Close, &[]).await;
                return;
            }
        };
        if let Err(e) = sent {
            debug!(bytes_sent, "output write failed: {}", e);
            return;
        }
    }
}

/// Forwards output the program produced just before it ended.
async fn drain_output<S: FrameSink>(session: &Session, sink: &mut S, cancel: &CancellationToken) {
    let deadline = Instant::now() + DRAIN_GRACE;
    while let Ok(Ok(Some(chunk))) = tokio::time::timeout_at(deadline, session.read()).await {
        if send_or_cancel(sink, cancel, MessageType::Output, &chunk)
            .await
            .is_err()
        {
            return;
        }
    }
}

struct InputPump<'a> {
    session: &'a Session,
    control: mpsc::Sender<MessageType>,
    cancel: &'a CancellationToken,
    read_only: bool,
    idle_timeout: Option<Duration>,
}

impl InputPump<'_> {
    /// Reads client messages and applies them to the session.
    async fn run<R: FrameSource>(self, source: &mut R) {
        let cancel_on_exit = self.cancel.clone().drop_guard();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                // The output pump still has to flush and send close.
                _ = self.session.done() => {
                    cancel_on_exit.disarm();
                    return;
                }
                next = self.next_message(source) => next,
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("client closed the connection");
                    return;
                }
                Err(TransportError::Protocol(e)) => {
                    warn!("protocol violation, dropping connection: {}", e);
                    return;
                }
                Err(TransportError::IdleTimeout(limit)) => {
                    info!("client idle for {:?}, dropping connection", limit);
                    return;
                }
                Err(e) => {
                    debug!("input stopped: {}", e);
                    return;
                }
            };

            if !self.dispatch(&message).await {
                return;
            }
        }
    }

    async fn next_message<R: FrameSource>(
        &self,
        source: &mut R,
    ) -> Result<Option<MessageBuf>, TransportError> {
        match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, source.recv())
                .await
                .map_err(|_| TransportError::IdleTimeout(limit))?,
            None => source.recv().await,
        }
    }

    /// Applies one message. Returns false when the pump should stop.
    async fn dispatch(&self, message: &[u8]) -> bool {
        let Some((kind, payload)) = protocol::split_message(message) else {
            return true;
        };

        match MessageType::from_byte(kind) {
            Some(MessageType::Input) => {
                if self.read_only || payload.is_empty() {
                    return true;
                }
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => false,
                    written = self.session.write(payload) => match written {
                        Ok(()) => true,
                        Err(e) => {
                            debug!("terminal input closed: {}", e);
                            false
                        }
                    },
                }
            }
            Some(MessageType::Resize) => {
                match protocol::parse_resize(payload) {
                    Ok(size) => match self.session.resize(size) {
                        Ok(()) => debug!("resized to {}", size),
                        Err(e) => warn!("resize failed: {}", e),
                    },
                    Err(e) => warn!("ignoring resize: {}", e),
                }
                true
            }
            Some(MessageType::Ping) => {
                let _ = self.control.try_send(MessageType::Pong);
                true
            }
            _ => true,
        }
    }
}

/// Checks a browser `Origin` against the configured patterns.
///
/// Requests without an origin (non-browser clients) and same-host origins are
/// always allowed; an empty pattern list allows everything. Patterns are `*`,
/// `*.example.com` (subdomains only) or a host with an optional port.
/// Opaque origins such as `null` only pass `*`.
pub fn origin_allowed(patterns: &[String], origin: Option<&str>, host: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if patterns.is_empty() {
        return true;
    }
    let Ok(origin) = Url::parse(origin) else {
        return patterns.iter().any(|pattern| pattern.trim() == "*");
    };
    if host.is_some_and(|host| same_host(&origin, host)) {
        return true;
    }
    patterns
        .iter()
        .any(|pattern| pattern_matches(pattern.trim(), &origin))
}

/// Parses `host[:port]`, or a full URL, in the origin's scheme so that
/// default ports compare equal.
fn parse_authority(scheme: &str, authority: &str) -> Option<Url> {
    if authority.contains("://") {
        Url::parse(authority).ok()
    } else {
        Url::parse(&format!("{scheme}://{authority}")).ok()
    }
}

fn same_host(origin: &Url, host: &str) -> bool {
    let Some(host) = parse_authority(origin.scheme(), host) else {
        return false;
    };
    origin.host_str().is_some()
        && origin.host_str() == host.host_str()
        && origin.port_or_known_default() == host.port_or_known_default()
}

fn pattern_matches(pattern: &str, origin: &Url) -> bool {
    if pattern == "*" {
        return true;
    }
    let Some(name) = origin.host_str() else {
        return false;
    };
    let (subdomains_only, pattern) = match pattern.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    let Some(expected) = parse_authority(origin.scheme(), pattern) else {
        return false;
    };
    let Some(expected_name) = expected.host_str() else {
        return false;
    };

    let name_matches = if subdomains_only {
        name.strip_suffix(expected_name)
            .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.'))
    } else {
        name == expected_name
    };
    // A pattern without an explicit port accepts any port.
    name_matches
        && (expected.port().is_none()
            || expected.port_or_known_default() == origin.port_or_known_default())
}

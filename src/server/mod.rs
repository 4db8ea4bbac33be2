//! # Server
//!
//! Owns both listeners and their coordinated shutdown.
//!
//! ## Endpoints
//!
//! - `GET /ws` - WebSocket transport
//! - `GET /health` - liveness check, answers `OK`
//! - `GET /cert-hash` - hash of the WebTransport certificate and the
//!   WebTransport URL, for `serverCertificateHashes`
//! - `https://<host>:<port + 1>/webtransport` - WebTransport transport
//!
//! Further routes (an index page, static assets) can be merged in with
//! [`Server::with_routes`].
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use webtty::config::Config;
//! use webtty::server::Server;
//! use webtty::session::CommandSpec;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::with_command(Config::default(), CommandSpec::new("bash"));
//! let shutdown = server.shutdown_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.cancel();
//! });
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::Context;
use axum::Router;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, info, info_span};

use crate::admission::Admission;
use crate::config::Config;
use crate::pty::BackendKind;
use crate::session::{CommandSpec, ProgramHandler, SessionMode, SessionRegistry};
use crate::tls::CertInfo;
use crate::transport::{websocket, webtransport};

/// State shared by every connection handler.
pub(crate) struct ServerState {
    pub config: Arc<Config>,
    pub mode: SessionMode,
    pub backend: BackendKind,
    pub registry: SessionRegistry,
    pub admission: Arc<Admission>,
    pub shutdown: CancellationToken,
    pub cert: Option<CertInfo>,
    pub webtransport_url: String,
    pub span: Span,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CertHashResponse {
    algorithm: &'static str,
    hash_bytes: Vec<u8>,
    wt_url: String,
}

pub struct Server {
    config: Arc<Config>,
    mode: SessionMode,
    backend: BackendKind,
    cert: Option<CertInfo>,
    routes: Router,
    registry: SessionRegistry,
    shutdown: CancellationToken,
    span: Span,
}

impl Server {
    /// Serves an embedded program built per connection by `handler`.
    pub fn with_program(config: Config, handler: ProgramHandler) -> Self {
        Self::new(config, SessionMode::Program(handler))
    }

    /// Serves an external command, spawned once per connection.
    pub fn with_command(config: Config, command: CommandSpec) -> Self {
        Self::new(config, SessionMode::Command(command))
    }

    fn new(config: Config, mode: SessionMode) -> Self {
        let span = info_span!("webtty", host = %config.host, port = config.port);
        Self {
            config: Arc::new(config),
            mode,
            backend: BackendKind::platform_default(),
            cert: None,
            routes: Router::new(),
            registry: SessionRegistry::new(),
            shutdown: CancellationToken::new(),
            span,
        }
    }

    /// Overrides the backend used for embedded programs.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Uses `cert` for WebTransport instead of loading or generating one.
    pub fn with_certificate(mut self, cert: CertInfo) -> Self {
        self.cert = Some(cert);
        self
    }

    /// Merges extra routes (index page, static assets) into the HTTP router.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    /// Parent span of every log line the server emits.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cancelling this token shuts the server down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Binds `host:port` and serves until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener. WebTransport, when enabled,
    /// listens on the UDP port one above the listener's.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let span = self.span.clone();
        self.serve_inner(listener).instrument(span).await
    }

    async fn serve_inner(self, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr().context("listener has no local address")?;
        let config = self.config.clone();

        let cert = if !config.webtransport {
            None
        } else if let Some(cert) = self.cert {
            Some(cert)
        } else if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
            Some(CertInfo::from_pem_files(cert, key).await?)
        } else {
            let cert = CertInfo::self_signed(config.public_host())?;
            info!(sha256 = %cert.hash_hex(), "generated self-signed certificate");
            Some(cert)
        };

        let (endpoint, webtransport_url) = match &cert {
            Some(cert) => {
                let wt_addr = webtransport_addr(local)?;
                let url = format!(
                    "https://{}:{}{}",
                    config.public_host(),
                    wt_addr.port(),
                    webtransport::WEBTRANSPORT_PATH
                );
                (Some(webtransport::bind(wt_addr, cert)?), url)
            }
            None => (None, String::new()),
        };

        let state = Arc::new(ServerState {
            config: config.clone(),
            mode: self.mode,
            backend: self.backend,
            registry: self.registry.clone(),
            admission: Admission::new(config.max_connections),
            shutdown: self.shutdown.clone(),
            cert,
            webtransport_url,
            span: Span::current(),
        });

        let app = Router::new()
            .route("/ws", get(websocket::handle_upgrade))
            .route("/health", get(health))
            .route("/cert-hash", get(cert_hash))
            .with_state(state.clone())
            .merge(self.routes);

        info!(addr = %local, "HTTP server listening");
        if state.cert.is_some() {
            info!(url = %state.webtransport_url, "WebTransport server listening");
        }

        let shutdown = self.shutdown.clone();
        let http = async {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .context("HTTP server failed")
        };
        let wt = async {
            match endpoint {
                Some(endpoint) => webtransport::serve(state.clone(), endpoint).await,
                None => Ok(()),
            }
        };

        let result = tokio::try_join!(http, wt).map(|_| ());
        self.shutdown.cancel();

        let remaining = state.registry.len();
        if remaining > 0 {
            info!(sessions = remaining, "closing remaining sessions");
        }
        state.registry.close_all().await;
        info!("server stopped");
        result
    }
}

/// The UDP address WebTransport binds: same IP, next port up.
fn webtransport_addr(http: SocketAddr) -> anyhow::Result<SocketAddr> {
    let port = http.port().checked_add(1).with_context(|| {
        format!(
            "HTTP port {} leaves no port above it for WebTransport",
            http.port()
        )
    })?;
    Ok(SocketAddr::new(http.ip(), port))
}

async fn health() -> &'static str {
    "OK"
}

async fn cert_hash(State(state): State<Arc<ServerState>>) -> Response {
    let Some(cert) = &state.cert else {
        return (StatusCode::NOT_FOUND, "WebTransport is disabled").into_response();
    };
    let body = CertHashResponse {
        algorithm: "sha-256",
        hash_bytes: cert.hash().to_vec(),
        wt_url: state.webtransport_url.clone(),
    };
    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        Json(body),
    )
        .into_response()
}

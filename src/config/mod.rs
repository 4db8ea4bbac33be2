//! # Server Configuration
//!
//! [`Config`] is both a plain struct that library users fill in directly and a
//! `clap` argument group that the binary flattens into its parser. Every flag
//! can also be supplied through a `WEBTTY_*` environment variable.
//!
//! The configuration is read once when the server starts and is immutable
//! afterwards.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Default port for the HTTP/WebSocket listener.
pub const DEFAULT_PORT: u16 = 7681;

/// Default time the client gets to announce its terminal size.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Web terminal server configuration
///
/// # Examples
///
/// ```rust
/// use webtty::config::Config;
///
/// let config = Config {
///     port: 9000,
///     read_only: true,
///     max_connections: 4,
///     ..Config::default()
/// };
/// assert_eq!(config.webtransport_port(), Some(9001));
/// ```
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Host to bind to
    #[arg(long, env = "WEBTTY_HOST", default_value = "localhost")]
    pub host: String,

    /// Port for HTTP and WebSocket; WebTransport listens on port + 1
    #[arg(long, env = "WEBTTY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Discard all input coming from clients
    #[arg(long, env = "WEBTTY_READ_ONLY", default_value_t = false)]
    pub read_only: bool,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long, env = "WEBTTY_MAX_CONNECTIONS", default_value_t = 0)]
    pub max_connections: usize,

    /// End connections that send nothing for this many seconds (0 = never)
    #[arg(long, env = "WEBTTY_IDLE_TIMEOUT", default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Allowed browser origins, e.g. `example.com` or `*.example.com`
    ///
    /// Empty means every origin is accepted.
    #[arg(long = "allow-origin", env = "WEBTTY_ALLOW_ORIGINS", value_delimiter = ',')]
    pub allow_origins: Vec<String>,

    /// Enable verbose logging
    #[arg(long, env = "WEBTTY_DEBUG", default_value_t = false)]
    pub debug: bool,

    /// How long to wait for the client's initial size, in milliseconds
    #[arg(long, env = "WEBTTY_HANDSHAKE_TIMEOUT_MS", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT_MS)]
    pub handshake_timeout_ms: u64,

    /// Serve WebTransport on port + 1
    #[arg(
        long,
        env = "WEBTTY_WEBTRANSPORT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub webtransport: bool,

    /// PEM certificate chain for the WebTransport listener
    #[arg(long, env = "WEBTTY_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for the WebTransport listener
    #[arg(long, env = "WEBTTY_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            read_only: false,
            max_connections: 0,
            idle_timeout_secs: 0,
            allow_origins: Vec::new(),
            debug: false,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            webtransport: true,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    /// Port of the WebTransport listener, one above [`Config::port`].
    /// `None` when the HTTP port is the highest one.
    pub fn webtransport_port(&self) -> Option<u16> {
        self.port.checked_add(1)
    }

    /// Inactivity limit for client input, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Host name that browsers should use to reach this server.
    ///
    /// Wildcard bind addresses are replaced with the loopback address.
    pub fn public_host(&self) -> &str {
        match self.host.as_str() {
            "" | "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
            host => host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn defaults_match_cli_defaults() {
        let parsed = Cli::parse_from(["webtty"]).config;
        let default = Config::default();
        assert_eq!(parsed.host, default.host);
        assert_eq!(parsed.port, default.port);
        assert_eq!(parsed.max_connections, 0);
        assert_eq!(parsed.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT_MS);
        assert!(parsed.webtransport);
        assert!(parsed.allow_origins.is_empty());
    }

    #[test]
    fn parses_origins_and_flags() {
        let parsed = Cli::parse_from([
            "webtty",
            "--port",
            "9000",
            "--read-only",
            "--allow-origin",
            "example.com,*.example.org",
            "--webtransport",
            "false",
            "--idle-timeout-secs",
            "30",
        ])
        .config;
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.webtransport_port(), Some(9001));
        assert!(parsed.read_only);
        assert!(!parsed.webtransport);
        assert_eq!(parsed.allow_origins, vec!["example.com", "*.example.org"]);
        assert_eq!(parsed.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn highest_port_leaves_no_webtransport_port() {
        let config = Config {
            port: u16::MAX,
            ..Config::default()
        };
        assert_eq!(config.webtransport_port(), None);
    }

    #[test]
    fn zero_idle_timeout_disables_it() {
        assert_eq!(Config::default().idle_timeout(), None);
    }

    #[test]
    fn wildcard_host_maps_to_loopback() {
        let config = Config {
            host: "0.0.0.0".to_string(),
            ..Config::default()
        };
        assert_eq!(config.public_host(), "127.0.0.1");
        assert_eq!(Config::default().public_host(), "localhost");
    }
}

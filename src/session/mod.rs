//! # Sessions
//!
//! A [`Session`] binds one client connection to one running program behind a
//! pseudo-terminal [`Bridge`]. It comes in two flavours sharing the same
//! operations (`read`, `write`, `resize`, `done`, `close`):
//!
//! - **embedded program**: a [`Program`] runs in-process on its own thread
//!   against a [`Terminal`]; resizes reach it as window-change events.
//! - **spawned command**: an external process runs with the terminal end as
//!   its controlling terminal; resizes only touch the pseudo-terminal and the
//!   process learns about them through `SIGWINCH`.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──► Running ──► Closing ──► Closed
//! ```
//!
//! Client disconnect, program or process exit, and explicit close all lead
//! to `Closing`. [`Session::close`] may be called from several places at
//! once; only the first call does the work.

pub mod command;
pub mod program;
pub mod registry;

pub use command::CommandSpec;
pub use program::{Program, ProgramHandler, program_handler};
pub use registry::SessionRegistry;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, info, info_span, warn};
use uuid::Uuid;

use crate::pool::PooledBuf;
use crate::pty::{BackendKind, Bridge, PtyError, Terminal, WindowChanges, WindowSize};
use command::ChildProcess;

const TITLE_QUEUE: usize = 16;
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
const PROGRAM_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// What the server runs for each connection.
#[derive(Clone)]
pub enum SessionMode {
    Program(ProgramHandler),
    Command(CommandSpec),
}

impl std::fmt::Debug for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Program(_) => f.write_str("Program"),
            SessionMode::Command(spec) => f.debug_tuple("Command").field(spec).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Still inside [`Session::open`]; never observed on a returned session.
    Created,
    Running,
    Closing,
    Closed,
}

/// Facts about a session, handed to program factories.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub size: WindowSize,
    pub started_at: DateTime<Utc>,
    pub remote: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Initial window size.
    pub size: WindowSize,
    /// Backend for embedded programs. Commands always use a native terminal.
    pub backend: BackendKind,
    /// The session's lifetime is a child of this token.
    pub parent: CancellationToken,
    pub remote: Option<SocketAddr>,
}

impl SessionOptions {
    pub fn new(size: WindowSize) -> Self {
        Self {
            size,
            backend: BackendKind::platform_default(),
            parent: CancellationToken::new(),
            remote: None,
        }
    }
}

enum Backing {
    Program { finished: watch::Receiver<bool> },
    Command(ChildProcess),
}

pub struct Session {
    info: SessionInfo,
    started: Instant,
    bridge: Bridge,
    size: Arc<Mutex<WindowSize>>,
    window_changes: Arc<WindowChanges>,
    lifetime: CancellationToken,
    state: Mutex<SessionState>,
    titles: tokio::sync::Mutex<mpsc::Receiver<String>>,
    backing: Backing,
    span: Span,
}

impl Session {
    /// Opens the bridge and starts the program or command.
    ///
    /// Errors leave nothing running.
    pub fn open(mode: &SessionMode, options: SessionOptions) -> anyhow::Result<Arc<Self>> {
        let info = SessionInfo {
            id: Uuid::new_v4().to_string(),
            size: options.size,
            started_at: Utc::now(),
            remote: options.remote,
        };
        let span = info_span!("session", id = %info.id);
        let lifetime = options.parent.child_token();
        let size = Arc::new(Mutex::new(options.size));
        let window_changes = Arc::new(WindowChanges::new());
        let (titles_tx, titles_rx) = mpsc::channel(TITLE_QUEUE);

        let (bridge, backing) = match mode {
            SessionMode::Program(handler) => {
                let program = handler(&info).context("program handler failed")?;
                let bridge = Bridge::open(options.backend, options.size)
                    .context("failed to open terminal")?;
                let io = bridge.attach(lifetime.clone())?;
                let terminal = Terminal::new(
                    io,
                    size.clone(),
                    window_changes.clone(),
                    titles_tx,
                    lifetime.clone(),
                );
                let (finished_tx, finished) = watch::channel(false);
                program::spawn(program, terminal, lifetime.clone(), finished_tx, span.clone())
                    .context("failed to start program thread")?;
                (bridge, Backing::Program { finished })
            }
            SessionMode::Command(spec) => {
                drop(titles_tx);
                let bridge = Bridge::open(BackendKind::Native, options.size)
                    .context("failed to open terminal")?;
                let command = spec.to_builder().context("failed to prepare command")?;
                let child = bridge.spawn(command)?;
                let process = ChildProcess::watch(child, lifetime.clone(), span.clone())
                    .context("failed to start process watcher")?;
                (bridge, Backing::Command(process))
            }
        };
        span.in_scope(|| {
            info!(
                size = %info.size,
                remote = ?info.remote,
                mode = ?mode,
                "session started"
            )
        });

        Ok(Arc::new(Self {
            info,
            started: Instant::now(),
            bridge,
            size,
            window_changes,
            lifetime,
            state: Mutex::new(SessionState::Running),
            titles: tokio::sync::Mutex::new(titles_rx),
            backing,
            span,
        }))
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn size(&self) -> WindowSize {
        *self.size.lock()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_command(&self) -> bool {
        matches!(self.backing, Backing::Command(_))
    }

    /// Cancelled when the program or process ends or the session is closed.
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub fn is_done(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    pub async fn done(&self) {
        self.lifetime.cancelled().await
    }

    /// Next chunk of output; `Ok(None)` once the terminal has hung up.
    pub async fn read(&self) -> Result<Option<PooledBuf>, PtyError> {
        self.bridge.read_chunk().await
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.bridge.write(data).await
    }

    /// Applies a new window size.
    ///
    /// The stored size is updated first and stays locked until the terminal
    /// has been resized and, for embedded programs, the window-change event
    /// queued, so readers of [`Session::size`] never run ahead of the
    /// terminal.
    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        let mut current = self.size.lock();
        *current = size;
        self.bridge.resize(size)?;
        if let Backing::Program { .. } = self.backing {
            self.window_changes.push(size);
        }
        Ok(())
    }

    /// Next title set by an embedded program. Never resolves for commands.
    pub async fn next_title(&self) -> Option<String> {
        let mut titles = self.titles.lock().await;
        match titles.recv().await {
            Some(title) => Some(title),
            None => std::future::pending().await,
        }
    }

    /// Tears the session down: cancels its lifetime, kills a spawned
    /// process, closes the bridge and waits for the program or process to
    /// finish.
    ///
    /// Returns true for the call that actually closed the session.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            *state = SessionState::Closing;
        }

        async {
            self.lifetime.cancel();
            if let Backing::Command(process) = &self.backing {
                process.kill();
            }
            self.bridge.close();

            let finished = match &self.backing {
                Backing::Command(process) => process.wait_reaped(REAP_TIMEOUT).await,
                Backing::Program { finished } => {
                    let mut finished = finished.clone();
                    tokio::time::timeout(PROGRAM_EXIT_TIMEOUT, finished.wait_for(|done| *done))
                        .await
                        .is_ok()
                }
            };
            if !finished {
                warn!("session backend did not finish in time");
            }

            *self.state.lock() = SessionState::Closed;
            info!(
                duration_secs = self.elapsed().as_secs(),
                "session closed"
            );
        }
        .instrument(self.span.clone())
        .await;
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.info.id)
            .field("size", &self.size())
            .field("state", &self.state())
            .field("command", &self.is_command())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn pipe_options() -> SessionOptions {
        SessionOptions {
            backend: BackendKind::Pipe,
            ..SessionOptions::new(WindowSize::DEFAULT)
        }
    }

    fn echo() -> SessionMode {
        SessionMode::Program(program_handler(|_| {
            Ok(|mut terminal: Terminal| -> anyhow::Result<()> {
                let mut buf = [0u8; 64];
                loop {
                    let n = terminal.read(&mut buf)?;
                    if n == 0 {
                        return Ok(());
                    }
                    terminal.write_all(&buf[..n])?;
                }
            })
        }))
    }

    fn idle() -> SessionMode {
        SessionMode::Program(program_handler(|_| {
            Ok(|terminal: Terminal| -> anyhow::Result<()> {
                while !terminal.is_closed() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            })
        }))
    }

    async fn read_until(session: &Session, expected: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        while !seen.windows(expected.len()).any(|w| w == expected) {
            let chunk = tokio::time::timeout(Duration::from_secs(5), session.read())
                .await
                .expect("timed out waiting for output")
                .unwrap()
                .expect("output ended early");
            seen.extend_from_slice(&chunk);
        }
        seen
    }

    #[tokio::test]
    async fn embedded_program_echoes_input() {
        let session = Session::open(&echo(), pipe_options()).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        session.write(b"hello").await.unwrap();
        read_until(&session, b"hello").await;

        assert!(session.close().await);
        assert!(!session.close().await);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_done());
    }

    #[tokio::test]
    async fn concurrent_close_runs_once() {
        let session = Session::open(&idle(), pipe_options()).unwrap();
        let (a, b) = tokio::join!(session.close(), session.close());
        assert!(a ^ b);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn last_resize_wins() {
        let session = Session::open(&idle(), pipe_options()).unwrap();
        for cols in [100, 120, 90, 132] {
            session.resize(WindowSize::new(cols, 40)).unwrap();
        }
        assert_eq!(session.size(), WindowSize::new(132, 40));
        assert_eq!(
            session.window_changes.try_recv(),
            Some(WindowSize::new(132, 40))
        );
        assert_eq!(session.window_changes.try_recv(), None);
        session.close().await;
    }

    #[tokio::test]
    async fn program_exit_ends_session_after_its_output() {
        let mode = SessionMode::Program(program_handler(|info| {
            let size = info.size;
            Ok(move |mut terminal: Terminal| -> anyhow::Result<()> {
                terminal.set_title("bye-title");
                write!(terminal, "bye {size}")?;
                Ok(())
            })
        }));
        let session = Session::open(&mode, pipe_options()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.done())
            .await
            .unwrap();
        read_until(&session, b"bye 80x24").await;
        assert_eq!(session.next_title().await.as_deref(), Some("bye-title"));
        assert!(session.close().await);
    }

    #[tokio::test]
    async fn handler_error_fails_open() {
        let mode = SessionMode::Program(program_handler(|_| -> anyhow::Result<fn(Terminal) -> anyhow::Result<()>> {
            anyhow::bail!("no program today")
        }));
        let err = Session::open(&mode, pipe_options()).unwrap_err();
        assert!(format!("{err:#}").contains("no program today"));
    }

    #[tokio::test]
    async fn parent_cancellation_ends_session() {
        let parent = CancellationToken::new();
        let options = SessionOptions {
            parent: parent.clone(),
            ..pipe_options()
        };
        let session = Session::open(&idle(), options).unwrap();
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), session.done())
            .await
            .unwrap();
        assert!(session.close().await);
    }

    #[tokio::test]
    async fn registry_removes_exactly_once() {
        let registry = SessionRegistry::new();
        let session = Session::open(&idle(), pipe_options()).unwrap();
        let id = session.id().to_string();
        registry.insert(session);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn close_all_drains_registry() {
        let registry = SessionRegistry::new();
        let sessions: Vec<_> = (0..3)
            .map(|_| Session::open(&idle(), pipe_options()).unwrap())
            .collect();
        for session in &sessions {
            registry.insert(session.clone());
        }
        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(sessions.iter().all(|s| s.state() == SessionState::Closed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_command_output_then_exit() {
        let mode = SessionMode::Command(CommandSpec::new("sh").args(["-c", "printf done"]));
        let session = Session::open(&mode, SessionOptions::new(WindowSize::new(100, 40))).unwrap();
        assert!(session.is_command());
        read_until(&session, b"done").await;
        tokio::time::timeout(Duration::from_secs(5), session.done())
            .await
            .unwrap();
        assert!(session.close().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closing_kills_a_running_command() {
        let mode = SessionMode::Command(CommandSpec::new("sleep").arg("30"));
        let session = Session::open(&mode, SessionOptions::new(WindowSize::DEFAULT)).unwrap();
        session.resize(WindowSize::new(120, 30)).unwrap();
        assert_eq!(session.size(), WindowSize::new(120, 30));
        assert!(!session.window_changes.is_pending());

        let started = Instant::now();
        assert!(session.close().await);
        assert!(started.elapsed() < REAP_TIMEOUT);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn embedded_program_reads_native_terminal() {
        let options = SessionOptions {
            backend: BackendKind::Native,
            ..SessionOptions::new(WindowSize::DEFAULT)
        };
        let session = Session::open(&echo(), options).unwrap();
        session.write(b"ping\r").await.unwrap();
        read_until(&session, b"ping").await;
        assert!(session.close().await);
    }
}

//! # Pseudo-Terminal Bridge
//!
//! A [`Bridge`] owns one controller/terminal endpoint pair. The server side
//! reads program output and writes client input through the controller end;
//! the program is attached to the terminal end, either as an in-process
//! [`Terminal`] handle or as the controlling terminal of a spawned command.
//!
//! Two interchangeable backends sit behind the bridge:
//!
//! - **native**: an OS pseudo-terminal from `portable-pty`. Programs can switch
//!   the terminal to raw mode and commands receive `SIGWINCH` on resize.
//! - **pipe**: two in-memory byte pipes. No terminal semantics; resizes reach
//!   embedded programs only as window-change events.
//!
//! Blocking reads and writes on the controller end run on dedicated threads
//! and are handed to async code through bounded channels, so a slow client
//! pushes back on the program instead of growing memory.

pub mod native;
pub mod pipe;
pub mod terminal;

pub use terminal::{Terminal, WindowChanges};

use parking_lot::Mutex;
use portable_pty::{Child, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pool::{self, PooledBuf};
use native::NativeBackend;
use pipe::PipeBackend;

/// Output chunks buffered between the reader thread and the output pump.
const OUTPUT_QUEUE: usize = 32;
/// Input writes buffered between the input pump and the writer thread.
const INPUT_QUEUE: usize = 256;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    /// Size used when the client does not announce one.
    pub const DEFAULT: WindowSize = WindowSize { cols: 80, rows: 24 };

    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<WindowSize> for PtySize {
    fn from(size: WindowSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pseudo-terminal: {0}")]
    Open(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    Spawn(#[source] anyhow::Error),

    #[error("failed to resize pseudo-terminal: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pseudo-terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("pseudo-terminal is closed")]
    Closed,

    #[error("not supported by the {backend:?} backend: {operation}")]
    Unsupported {
        backend: BackendKind,
        operation: &'static str,
    },
}

/// Which backend a [`Bridge`] is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    Pipe,
}

impl BackendKind {
    /// Backend for embedded programs on this platform.
    ///
    /// Native where the terminal end can be opened as a device file, pipes
    /// elsewhere. Spawned commands always use [`BackendKind::Native`].
    pub fn platform_default() -> Self {
        if cfg!(unix) {
            BackendKind::Native
        } else {
            BackendKind::Pipe
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Program-side endpoints handed to an embedded program.
pub(crate) struct TerminalIo {
    pub input: Box<dyn Read + Send>,
    pub output: Box<dyn Write + Send>,
    #[cfg(unix)]
    pub raw_mode: Option<std::fs::File>,
}

/// Capabilities shared by the backends.
pub(crate) trait PtyBackend: Send {
    fn kind(&self) -> BackendKind;
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PtyError>;
    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, PtyError>;
    /// Hands out the terminal end for an in-process program. Reads on it
    /// return end-of-file once `closed` is cancelled.
    fn attach(&mut self, closed: CancellationToken) -> Result<TerminalIo, PtyError>;
    fn spawn(&mut self, command: CommandBuilder) -> Result<Box<dyn Child + Send + Sync>, PtyError>;
    fn resize(&mut self, size: WindowSize) -> Result<(), PtyError>;
    fn close(&mut self);
}

/// One pseudo-terminal and the threads pumping its controller end.
pub struct Bridge {
    backend: Mutex<Box<dyn PtyBackend>>,
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output: tokio::sync::Mutex<mpsc::Receiver<PooledBuf>>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl Bridge {
    /// Opens a bridge of the given kind and starts its I/O threads.
    pub fn open(kind: BackendKind, size: WindowSize) -> Result<Self, PtyError> {
        let backend: Box<dyn PtyBackend> = match kind {
            BackendKind::Native => Box::new(NativeBackend::open(size)?),
            BackendKind::Pipe => Box::new(PipeBackend::new()),
        };
        Self::with_backend(backend)
    }

    fn with_backend(mut backend: Box<dyn PtyBackend>) -> Result<Self, PtyError> {
        let reader = backend.take_reader()?;
        let writer = backend.take_writer()?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        spawn_reader(reader, output_tx)?;
        spawn_writer(writer, input_rx)?;

        Ok(Self {
            backend: Mutex::new(backend),
            input: Mutex::new(Some(input_tx)),
            output: tokio::sync::Mutex::new(output_rx),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.lock().kind()
    }

    pub(crate) fn attach(&self, closed: CancellationToken) -> Result<TerminalIo, PtyError> {
        self.backend.lock().attach(closed)
    }

    pub(crate) fn spawn(
        &self,
        command: CommandBuilder,
    ) -> Result<Box<dyn Child + Send + Sync>, PtyError> {
        self.backend.lock().spawn(command)
    }

    /// Next chunk of program output.
    ///
    /// `Ok(None)` once the program side has hung up or the bridge is closed.
    pub async fn read_chunk(&self) -> Result<Option<PooledBuf>, PtyError> {
        let mut output = self.output.lock().await;
        tokio::select! {
            biased;
            chunk = output.recv() => Ok(chunk),
            _ = self.closed.cancelled() => Ok(None),
        }
    }

    /// Queues bytes for the program's input, waiting while the queue is full.
    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let input = self.input.lock().clone().ok_or(PtyError::Closed)?;
        input
            .send(data.to_vec())
            .await
            .map_err(|_| PtyError::Closed)
    }

    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        if self.is_closed() {
            return Err(PtyError::Closed);
        }
        self.backend.lock().resize(size)
    }

    /// Closes the controller end. Safe to call more than once.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.input.lock().take();
        self.backend.lock().close();
        self.closed.cancel();
        if let Ok(mut output) = self.output.try_lock() {
            output.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output: mpsc::Sender<PooledBuf>,
) -> Result<(), PtyError> {
    std::thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            loop {
                let mut buf = pool::read_buffer();
                match reader.read(buf.spare_mut()) {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.set_len(n);
                        if output.blocking_send(buf).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO is how Linux reports a hung-up terminal end.
                    Err(e) => {
                        debug!("pty reader stopped: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::Receiver<Vec<u8>>,
) -> Result<(), PtyError> {
    std::thread::Builder::new()
        .name("pty-writer".into())
        .spawn(move || {
            while let Some(data) = input.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    debug!("pty writer stopped: {}", e);
                    break;
                }
            }
        })?;
    Ok(())
}

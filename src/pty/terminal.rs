//! The terminal end as seen by an embedded program.

use parking_lot::{Condvar, Mutex};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{TerminalIo, WindowSize};

/// Single-slot window-change queue.
///
/// A new size replaces one that has not been consumed yet, so a burst of
/// resizes followed by one receive yields only the last size and the sender
/// never blocks.
#[derive(Debug, Default)]
pub struct WindowChanges {
    slot: Mutex<Option<WindowSize>>,
    ready: Condvar,
}

impl WindowChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, size: WindowSize) {
        *self.slot.lock() = Some(size);
        self.ready.notify_one();
    }

    pub fn try_recv(&self) -> Option<WindowSize> {
        self.slot.lock().take()
    }

    /// Waits up to `timeout` for a pending size.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WindowSize> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Handle given to an embedded program for the lifetime of its session.
///
/// Reads return end-of-file once the session is closed, so a program looping
/// on input exits on its own when the client goes away.
pub struct Terminal {
    input: Box<dyn Read + Send>,
    output: Box<dyn Write + Send>,
    #[cfg(unix)]
    raw_mode: Option<std::fs::File>,
    size: Arc<Mutex<WindowSize>>,
    window_changes: Arc<WindowChanges>,
    titles: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl Terminal {
    pub(crate) fn new(
        io: TerminalIo,
        size: Arc<Mutex<WindowSize>>,
        window_changes: Arc<WindowChanges>,
        titles: mpsc::Sender<String>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            input: io.input,
            output: io.output,
            #[cfg(unix)]
            raw_mode: io.raw_mode,
            size,
            window_changes,
            titles,
            closed,
        }
    }

    /// Current window size as last announced by the client.
    pub fn size(&self) -> WindowSize {
        *self.size.lock()
    }

    pub fn window_changes(&self) -> &WindowChanges {
        &self.window_changes
    }

    /// Asks the client to show `title` as its window title.
    ///
    /// Dropped if the title queue is full.
    pub fn set_title(&self, title: impl Into<String>) {
        let _ = self.titles.try_send(title.into());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the session ends.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Switches the terminal to raw mode. A no-op without a native terminal.
    pub fn enable_raw_mode(&self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(device) = &self.raw_mode {
            return super::native::unix::make_raw(device);
        }
        Ok(())
    }

    /// Moves the input side out, e.g. to read it on a separate thread.
    ///
    /// Later reads on this handle return end-of-file.
    pub fn take_input(&mut self) -> Box<dyn Read + Send> {
        std::mem::replace(&mut self.input, Box::new(io::empty()))
    }
}

impl Read for Terminal {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Terminal {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

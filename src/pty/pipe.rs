//! Pipe-pair backend: two in-memory byte pipes standing in for a terminal.

use portable_pty::{Child, CommandBuilder};
use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{BackendKind, PtyBackend, PtyError, TerminalIo, WindowSize};

/// Chunks a pipe holds before writers block.
const PIPE_CAPACITY: usize = 64;
/// How often a blocked reader checks for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Creates a unidirectional pipe.
///
/// Reads return end-of-file when every writer is gone or `closed` is
/// cancelled; writes fail with `BrokenPipe` once the reader is gone.
pub fn pipe(closed: CancellationToken) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(PIPE_CAPACITY);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: Vec::new(),
            pos: 0,
            closed,
        },
    )
}

pub struct PipeWriter {
    tx: SyncSender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    closed: CancellationToken,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.pending.len() {
            if self.closed.is_cancelled() {
                return Ok(0);
            }
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Controller and terminal ends built from two pipes.
pub(crate) struct PipeBackend {
    closed: CancellationToken,
    controller_reader: Option<PipeReader>,
    controller_writer: Option<PipeWriter>,
    terminal_reader: Option<PipeReader>,
    terminal_writer: Option<PipeWriter>,
}

impl PipeBackend {
    pub fn new() -> Self {
        let closed = CancellationToken::new();
        let (input_writer, input_reader) = pipe(closed.clone());
        let (output_writer, output_reader) = pipe(closed.clone());
        Self {
            closed,
            controller_reader: Some(output_reader),
            controller_writer: Some(input_writer),
            terminal_reader: Some(input_reader),
            terminal_writer: Some(output_writer),
        }
    }
}

impl PtyBackend for PipeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pipe
    }

    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PtyError> {
        let reader = self.controller_reader.take().ok_or(PtyError::Closed)?;
        Ok(Box::new(reader))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, PtyError> {
        let writer = self.controller_writer.take().ok_or(PtyError::Closed)?;
        Ok(Box::new(writer))
    }

    fn attach(&mut self, closed: CancellationToken) -> Result<TerminalIo, PtyError> {
        let mut input = self.terminal_reader.take().ok_or(PtyError::Closed)?;
        let output = self.terminal_writer.take().ok_or(PtyError::Closed)?;
        input.closed = closed;
        Ok(TerminalIo {
            input: Box::new(CancelOnEither {
                inner: input,
                bridge: self.closed.clone(),
            }),
            output: Box::new(output),
            #[cfg(unix)]
            raw_mode: None,
        })
    }

    fn spawn(&mut self, _command: CommandBuilder) -> Result<Box<dyn Child + Send + Sync>, PtyError> {
        Err(PtyError::Unsupported {
            backend: BackendKind::Pipe,
            operation: "spawning commands",
        })
    }

    fn resize(&mut self, _size: WindowSize) -> Result<(), PtyError> {
        Ok(())
    }

    fn close(&mut self) {
        self.closed.cancel();
        self.terminal_reader.take();
        self.terminal_writer.take();
    }
}

/// Terminal-end reader that stops on either the session's or the bridge's
/// close signal.
struct CancelOnEither {
    inner: PipeReader,
    bridge: CancellationToken,
}

impl Read for CancelOnEither {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.bridge.is_cancelled() {
            return Ok(0);
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reader_sees_writes_in_order_across_small_reads() {
        let (mut writer, mut reader) = pipe(CancellationToken::new());
        writer.write_all(b"abc").unwrap();
        writer.write_all(b"def").unwrap();
        drop(writer);

        let mut out = Vec::new();
        let mut buf = [0u8; 2];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn cancellation_unblocks_a_waiting_reader() {
        let closed = CancellationToken::new();
        let (_writer, mut reader) = pipe(closed.clone());
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        closed.cancel();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn writes_fail_after_reader_is_gone() {
        let (mut writer, reader) = pipe(CancellationToken::new());
        drop(reader);
        let err = writer.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn backend_close_ends_terminal_reads() {
        let mut backend = PipeBackend::new();
        let mut io = backend.attach(CancellationToken::new()).unwrap();
        backend.close();
        let mut buf = [0u8; 4];
        assert_eq!(io.input.read(&mut buf).unwrap(), 0);
        assert!(backend.resize(WindowSize::new(1, 1)).is_ok());
    }
}

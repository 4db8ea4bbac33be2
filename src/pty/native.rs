//! Native backend built on the OS pseudo-terminal from `portable-pty`.

use portable_pty::{Child, CommandBuilder, MasterPty, SlavePty, native_pty_system};
use std::io::{Read, Write};
use tokio_util::sync::CancellationToken;

use super::{BackendKind, PtyBackend, PtyError, TerminalIo, WindowSize};

pub(crate) struct NativeBackend {
    master: Option<Box<dyn MasterPty + Send>>,
    slave: Option<Box<dyn SlavePty + Send>>,
}

impl NativeBackend {
    pub fn open(size: WindowSize) -> Result<Self, PtyError> {
        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(PtyError::Open)?;
        Ok(Self {
            master: Some(pair.master),
            slave: Some(pair.slave),
        })
    }

    fn master(&self) -> Result<&(dyn MasterPty + Send), PtyError> {
        self.master.as_deref().ok_or(PtyError::Closed)
    }
}

impl PtyBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master()?.try_clone_reader().map_err(PtyError::Open)
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master()?.take_writer().map_err(PtyError::Open)
    }

    #[cfg(unix)]
    fn attach(&mut self, closed: CancellationToken) -> Result<TerminalIo, PtyError> {
        let path = self.master()?.tty_name().ok_or(PtyError::Unsupported {
            backend: BackendKind::Native,
            operation: "opening a terminal without a device path",
        })?;
        let device = unix::open_terminal(&path)?;
        let input = unix::PollReader::new(device.try_clone()?, closed);
        let raw_mode = device.try_clone()?;
        // Our own descriptor keeps the terminal end open from here on.
        self.slave.take();
        Ok(TerminalIo {
            input: Box::new(input),
            output: Box::new(device),
            raw_mode: Some(raw_mode),
        })
    }

    #[cfg(not(unix))]
    fn attach(&mut self, _closed: CancellationToken) -> Result<TerminalIo, PtyError> {
        Err(PtyError::Unsupported {
            backend: BackendKind::Native,
            operation: "attaching an in-process program",
        })
    }

    fn spawn(&mut self, command: CommandBuilder) -> Result<Box<dyn Child + Send + Sync>, PtyError> {
        let slave = self.slave.take().ok_or(PtyError::Closed)?;
        // Dropping our copy of the terminal end lets the reader see
        // end-of-file once the child exits.
        slave.spawn_command(command).map_err(PtyError::Spawn)
    }

    fn resize(&mut self, size: WindowSize) -> Result<(), PtyError> {
        self.master()?.resize(size.into()).map_err(PtyError::Resize)
    }

    fn close(&mut self) {
        self.slave.take();
        self.master.take();
    }
}

#[cfg(unix)]
pub(crate) mod unix {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read};
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    /// How long a blocked read waits before checking for cancellation.
    const POLL_INTERVAL_MS: libc::c_int = 50;

    /// Opens the terminal device without making it our controlling terminal.
    pub fn open_terminal(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
    }

    /// Puts the terminal into raw mode: no echo, no line buffering, no
    /// signal keys.
    pub fn make_raw(device: &File) -> io::Result<()> {
        let fd = device.as_raw_fd();
        // SAFETY: `fd` is a valid open descriptor for the lifetime of
        // `device` and `termios` is fully initialised by tcgetattr.
        unsafe {
            let mut termios: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut termios) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::cfmakeraw(&mut termios);
            if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Reader that returns end-of-file once `closed` is cancelled instead of
    /// blocking in `read(2)` forever.
    pub struct PollReader {
        file: File,
        closed: CancellationToken,
    }

    impl PollReader {
        pub fn new(file: File, closed: CancellationToken) -> Self {
            Self { file, closed }
        }
    }

    impl Read for PollReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                if self.closed.is_cancelled() {
                    return Ok(0);
                }
                let mut pollfd = libc::pollfd {
                    fd: self.file.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                };
                // SAFETY: one valid pollfd entry for the duration of the call.
                let ready = unsafe { libc::poll(&mut pollfd, 1, POLL_INTERVAL_MS) };
                if ready < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                if ready == 0 {
                    continue;
                }
                return self.file.read(buf);
            }
        }
    }
}

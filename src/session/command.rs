//! Spawned commands: an external process with the terminal end of the
//! bridge as its controlling terminal.

use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller, CommandBuilder};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

/// What to run for each connection in command mode.
///
/// The child gets `TERM=xterm-256color` and `COLORTERM=truecolor` on top of
/// the server's environment and runs in the server's working directory unless
/// [`CommandSpec::cwd`] says otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub(crate) fn to_builder(&self) -> std::io::Result<CommandBuilder> {
        let mut builder = CommandBuilder::new(&self.program);
        builder.args(&self.args);
        builder.env("TERM", "xterm-256color");
        builder.env("COLORTERM", "truecolor");
        for (key, value) in &self.env {
            builder.env(key, value);
        }
        let cwd = match &self.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        builder.cwd(cwd);
        Ok(builder)
    }
}

/// A running child and the thread waiting for it to exit.
pub(crate) struct ChildProcess {
    pid: Option<u32>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    reaped: watch::Receiver<bool>,
}

impl ChildProcess {
    /// Starts the exit watcher. The session lifetime is cancelled once the
    /// child has been reaped, before [`ChildProcess::has_exited`] turns true.
    pub fn watch(
        mut child: Box<dyn Child + Send + Sync>,
        lifetime: CancellationToken,
        span: Span,
    ) -> std::io::Result<Self> {
        let pid = child.process_id();
        let killer = child.clone_killer();
        let (reaped_tx, reaped) = watch::channel(false);

        std::thread::Builder::new()
            .name("webtty-child".into())
            .spawn(move || {
                let _entered = span.enter();
                match child.wait() {
                    Ok(status) => info!(
                        pid = pid.unwrap_or_default(),
                        success = status.success(),
                        code = status.exit_code(),
                        "process exited"
                    ),
                    Err(e) => warn!("waiting for process failed: {}", e),
                }
                lifetime.cancel();
                reaped_tx.send_replace(true);
            })?;

        Ok(Self {
            pid,
            killer: Mutex::new(killer),
            reaped,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        *self.reaped.borrow()
    }

    /// Sends SIGKILL to the child's process group (or the child alone where
    /// groups are not available).
    pub fn kill(&self) {
        if self.has_exited() {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) {
            // The child leads its own session, so its pid names the group.
            // SAFETY: killpg has no memory-safety preconditions.
            unsafe {
                libc::killpg(pid, libc::SIGKILL);
            }
        }
        if let Err(e) = self.killer.lock().kill() {
            debug!("kill after exit: {}", e);
        }
    }

    /// Waits for the watcher to reap the child. Returns false on timeout.
    pub async fn wait_reaped(&self, timeout: Duration) -> bool {
        let mut reaped = self.reaped.clone();
        matches!(
            tokio::time::timeout(timeout, reaped.wait_for(|done| *done)).await,
            Ok(_)
        )
    }
}

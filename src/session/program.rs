//! Embedded programs: in-process terminal applications run on their own
//! thread against the terminal end of the bridge.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, warn};

use super::SessionInfo;
use crate::pty::Terminal;

/// An interactive program served to one client.
///
/// `run` is called on a dedicated thread and should return once the terminal
/// reports end-of-file or [`Terminal::is_closed`] turns true. Returning ends
/// the session.
pub trait Program: Send + 'static {
    fn run(self: Box<Self>, terminal: Terminal) -> anyhow::Result<()>;
}

impl<F> Program for F
where
    F: FnOnce(Terminal) -> anyhow::Result<()> + Send + 'static,
{
    fn run(self: Box<Self>, terminal: Terminal) -> anyhow::Result<()> {
        (*self)(terminal)
    }
}

/// Factory called once per connection to build that connection's program.
pub type ProgramHandler = Arc<dyn Fn(&SessionInfo) -> anyhow::Result<Box<dyn Program>> + Send + Sync>;

/// Wraps a closure returning any [`Program`] into a [`ProgramHandler`].
///
/// ```rust
/// use std::io::Write;
/// use webtty::pty::Terminal;
/// use webtty::session::{program_handler, ProgramHandler};
///
/// let handler: ProgramHandler = program_handler(|info| {
///     let greeting = format!("session {} at {}\r\n", info.id, info.size);
///     Ok(move |mut terminal: Terminal| -> anyhow::Result<()> {
///         terminal.write_all(greeting.as_bytes())?;
///         Ok(())
///     })
/// });
/// ```
pub fn program_handler<F, P>(factory: F) -> ProgramHandler
where
    F: Fn(&SessionInfo) -> anyhow::Result<P> + Send + Sync + 'static,
    P: Program,
{
    Arc::new(move |info| Ok(Box::new(factory(info)?) as Box<dyn Program>))
}

/// Runs `program` on its own thread.
///
/// The session lifetime is cancelled when the program returns (or panics),
/// and `finished` flips to true afterwards.
pub(crate) fn spawn(
    program: Box<dyn Program>,
    terminal: Terminal,
    lifetime: CancellationToken,
    finished: watch::Sender<bool>,
    span: Span,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("webtty-program".into())
        .spawn(move || {
            let _entered = span.enter();
            let lifetime = lifetime.drop_guard();
            match program.run(terminal) {
                Ok(()) => debug!("program finished"),
                Err(e) => warn!("program failed: {:#}", e),
            }
            drop(lifetime);
            finished.send_replace(true);
        })?;
    Ok(())
}

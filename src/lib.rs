//! # webtty - Terminal Programs in the Browser
//!
//! webtty serves a terminal session to every browser that connects. A session
//! either runs an embedded Rust [`Program`] against a virtual terminal, or
//! spawns an external command on a real pseudo-terminal. Browsers reach it
//! over WebSocket or, where supported, WebTransport.
//!
//! ## Quick Start
//!
//! ```bash
//! # Serve the built-in counter demo on http://localhost:7681
//! webtty
//!
//! # Serve a shell, read-only, to at most 5 viewers
//! webtty --read-only --max-connections 5 -- bash -l
//! ```
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use std::io::Write;
//! use webtty::{Config, Server, Terminal, program_handler};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let handler = program_handler(|info| {
//!     let id = info.id.clone();
//!     Ok(move |mut terminal: Terminal| -> anyhow::Result<()> {
//!         writeln!(terminal, "hello from session {id}\r")?;
//!         Ok(())
//!     })
//! });
//! Server::with_program(Config::default(), handler).run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[Server](server)**: HTTP and WebTransport listeners, shutdown
//! - **[Transport](transport)**: per-connection handshake and the two pumps
//! - **[Session](session)**: one program or command with its PTY bridge
//! - **[PTY](pty)**: pseudo-terminal backends and the program-side terminal
//! - **[Protocol](protocol)**: the one-byte-tagged message format
//!
//! ## Wire Protocol
//!
//! Every message is a type byte followed by its payload. WebSocket carries one
//! message per binary frame; WebTransport prefixes each message with its
//! length as a big-endian `u32` on a single bidirectional stream.
//!
//! | byte | direction        | payload                      |
//! |------|------------------|------------------------------|
//! | `0`  | client to server | terminal input               |
//! | `1`  | server to client | terminal output              |
//! | `2`  | client to server | `{"cols":..,"rows":..}`      |
//! | `3`  | client to server | ping                         |
//! | `4`  | server to client | pong                         |
//! | `5`  | server to client | window title                 |
//! | `6`  | server to client | session options              |
//! | `7`  | server to client | session closed               |

pub mod admission;
pub mod config;
pub mod demo;
pub mod pool;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;

pub use config::Config;
pub use pty::{Terminal, WindowSize};
pub use server::Server;
pub use session::{CommandSpec, Program, ProgramHandler, program_handler};

//! # Counter Demo
//!
//! The embedded program the binary serves when no command is given. It keeps
//! a counter the visitor can change from the keyboard and redraws on every
//! key press and window change.
//!
//! | key            | action    |
//! |----------------|-----------|
//! | `k`, `+`, up   | increment |
//! | `j`, `-`, down | decrement |
//! | `r`            | reset     |
//! | `q`, Ctrl-C    | quit      |

use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use std::io::{Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use crate::pty::{Terminal, WindowSize};
use crate::session::{Program, ProgramHandler, SessionInfo, program_handler};

/// How often the program checks for window changes and session close
/// between key presses.
const TICK: Duration = Duration::from_millis(50);

/// Handler serving a fresh [`Counter`] to every connection.
pub fn handler() -> ProgramHandler {
    program_handler(|info| Ok(Counter::new(info)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Up,
    Down,
    Reset,
    Quit,
}

/// Decodes the keys the counter understands, skipping everything else.
fn parse_keys(bytes: &[u8]) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\x1b' if bytes.get(i + 1) == Some(&b'[') => {
                match bytes.get(i + 2) {
                    Some(b'A') => keys.push(Key::Up),
                    Some(b'B') => keys.push(Key::Down),
                    _ => {}
                }
                i += 3;
                continue;
            }
            b'k' | b'+' => keys.push(Key::Up),
            b'j' | b'-' => keys.push(Key::Down),
            b'r' => keys.push(Key::Reset),
            b'q' | 0x03 => keys.push(Key::Quit),
            _ => {}
        }
        i += 1;
    }
    keys
}

pub struct Counter {
    session: String,
    count: i64,
}

impl Counter {
    pub fn new(info: &SessionInfo) -> Self {
        Self {
            session: info.id.chars().take(8).collect(),
            count: 0,
        }
    }

    /// Applies keys; returns false on quit.
    fn apply(&mut self, keys: &[Key]) -> bool {
        for key in keys {
            match key {
                Key::Up => self.count += 1,
                Key::Down => self.count -= 1,
                Key::Reset => self.count = 0,
                Key::Quit => return false,
            }
        }
        true
    }

    fn render(&self, out: &mut impl Write, size: WindowSize) -> std::io::Result<()> {
        let lines = [
            format!("webtty counter  [{}]", self.session),
            format!("count: {}", self.count),
            "k/up: +1   j/down: -1   r: reset   q: quit".to_string(),
            format!("window: {size}"),
        ];
        let top = (size.rows / 2).saturating_sub(lines.len() as u16 / 2);

        queue!(out, Hide, Clear(ClearType::All))?;
        for (row, line) in lines.iter().enumerate() {
            let col = (size.cols / 2).saturating_sub(line.len() as u16 / 2);
            queue!(out, MoveTo(col, top + row as u16), Print(line))?;
        }
        out.flush()
    }

    fn farewell(out: &mut impl Write) -> std::io::Result<()> {
        queue!(out, Clear(ClearType::All), MoveTo(0, 0), Show, Print("bye\r\n"))?;
        out.flush()
    }
}

impl Program for Counter {
    fn run(mut self: Box<Self>, mut terminal: Terminal) -> anyhow::Result<()> {
        terminal.enable_raw_mode()?;
        terminal.set_title(format!("webtty counter {}", self.session));

        let (keys_tx, keys_rx) = mpsc::channel();
        let mut input = terminal.take_input();
        std::thread::Builder::new()
            .name("counter-input".into())
            .spawn(move || {
                let mut buf = [0u8; 64];
                loop {
                    match input.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if keys_tx.send(parse_keys(&buf[..n])).is_err() {
                                break;
                            }
                        }
                    }
                }
            })?;

        let size = terminal.size();
        self.render(&mut terminal, size)?;
        while !terminal.is_closed() {
            let redraw = match keys_rx.recv_timeout(TICK) {
                Ok(keys) => {
                    if !self.apply(&keys) {
                        break;
                    }
                    true
                }
                Err(RecvTimeoutError::Timeout) => false,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let resized = terminal.window_changes().try_recv().is_some();
            if redraw || resized {
                let size = terminal.size();
                self.render(&mut terminal, size)?;
            }
        }

        if !terminal.is_closed() {
            Self::farewell(&mut terminal)?;
        }
        Ok(())
    }
}

//! # Wire Protocol
//!
//! Every message is one type byte followed by a payload:
//!
//! | type | byte  | direction        | payload                    |
//! |------|-------|------------------|----------------------------|
//! | input   | `'0'` | client → server | raw input bytes          |
//! | output  | `'1'` | server → client | raw output bytes         |
//! | resize  | `'2'` | client → server | `{"cols":N,"rows":N}`    |
//! | ping    | `'3'` | either          | empty                    |
//! | pong    | `'4'` | either          | empty                    |
//! | title   | `'5'` | server → client | window title text        |
//! | options | `'6'` | server → client | `{"readOnly":bool}`      |
//! | close   | `'7'` | server → client | empty                    |
//!
//! On WebSocket each binary message carries exactly one protocol message. On
//! the WebTransport byte stream each message is prefixed with its length as a
//! 4-byte big-endian integer, see [`framing`].

pub mod framing;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pty::WindowSize;

/// Largest accepted message on the length-prefixed stream (type byte included).
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Bytes of the length prefix on the stream transport.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Header bytes in front of a payload on the stream transport: length prefix
/// plus type byte.
pub const FRAME_OVERHEAD: usize = LENGTH_PREFIX_LEN + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Input = b'0',
    Output = b'1',
    Resize = b'2',
    Ping = b'3',
    Pong = b'4',
    Title = b'5',
    Options = b'6',
    Close = b'7',
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'0' => Self::Input,
            b'1' => Self::Output,
            b'2' => Self::Resize,
            b'3' => Self::Ping,
            b'4' => Self::Pong,
            b'5' => Self::Title,
            b'6' => Self::Options,
            b'7' => Self::Close,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Payload of a resize message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeMessage {
    pub cols: u16,
    pub rows: u16,
}

/// Payload of the options message sent when a session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsMessage {
    pub read_only: bool,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("window size {cols}x{rows} is not usable")]
    EmptyWindow { cols: u16, rows: u16 },

    #[error("stream ended in the middle of a message")]
    Truncated,
}

/// Splits a message into its type byte and payload.
///
/// Returns `None` for an empty message. Unknown type bytes are returned as-is
/// so callers can ignore them.
pub fn split_message(message: &[u8]) -> Option<(u8, &[u8])> {
    message.split_first().map(|(kind, payload)| (*kind, payload))
}

/// Builds a message from a type and payload.
pub fn encode_message(kind: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(payload.len() + 1);
    message.push(kind.as_byte());
    message.extend_from_slice(payload);
    message
}

/// Parses a resize payload into a window size.
///
/// Zero columns or rows are rejected.
pub fn parse_resize(payload: &[u8]) -> Result<WindowSize, ProtocolError> {
    let resize: ResizeMessage =
        serde_json::from_slice(payload).map_err(|source| ProtocolError::Malformed {
            kind: "resize",
            source,
        })?;
    if resize.cols == 0 || resize.rows == 0 {
        return Err(ProtocolError::EmptyWindow {
            cols: resize.cols,
            rows: resize.rows,
        });
    }
    Ok(WindowSize::new(resize.cols, resize.rows))
}

pub fn parse_options(payload: &[u8]) -> Result<OptionsMessage, ProtocolError> {
    serde_json::from_slice(payload).map_err(|source| ProtocolError::Malformed {
        kind: "options",
        source,
    })
}

pub fn resize_payload(size: WindowSize) -> Vec<u8> {
    serde_json::to_vec(&ResizeMessage {
        cols: size.cols,
        rows: size.rows,
    })
    .unwrap_or_default()
}

pub fn options_payload(read_only: bool) -> Vec<u8> {
    serde_json::to_vec(&OptionsMessage { read_only }).unwrap_or_default()
}

//! Length-prefixed framing for byte-stream transports.
//!
//! ```text
//! +----------------+------+-------------------+
//! | length: u32 BE | type | payload ...       |
//! +----------------+------+-------------------+
//!                  |<------ length -------->|
//! ```

use axum::body::Bytes;
use std::ops::Deref;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{LENGTH_PREFIX_LEN, MAX_MESSAGE_LEN, MessageType, ProtocolError};
use crate::pool::{self, PooledBuf, SMALL_BUF_SIZE, WRITE_BUF_SIZE};

/// One inbound protocol message (type byte + payload).
#[derive(Debug)]
pub enum MessageBuf {
    /// Small message decoded into a pooled buffer.
    Pooled(PooledBuf),
    /// Message too large for the small pool.
    Heap(Vec<u8>),
    /// Message handed over by a transport that already owns the bytes.
    Shared(Bytes),
}

impl Deref for MessageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            MessageBuf::Pooled(buf) => buf,
            MessageBuf::Heap(buf) => buf,
            MessageBuf::Shared(buf) => buf,
        }
    }
}

/// Incremental decoder for length-prefixed messages.
///
/// Bytes are pushed in as they arrive and whole messages are pulled out, so a
/// read that is abandoned half way never loses data.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    start: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        if self.start > 0 {
            self.pending.drain(..self.start);
            self.start = 0;
        }
        self.pending.extend_from_slice(data);
    }

    /// True when no partial message is buffered.
    pub fn is_empty(&self) -> bool {
        self.start == self.pending.len()
    }

    /// Pulls the next complete message out of the buffer.
    ///
    /// Fails as soon as a length prefix above [`MAX_MESSAGE_LEN`] is seen,
    /// without waiting for the body.
    pub fn next_message(&mut self) -> Result<Option<MessageBuf>, ProtocolError> {
        let available = &self.pending[self.start..];
        if available.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([available[0], available[1], available[2], available[3]])
            as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(ProtocolError::TooLarge {
                len,
                max: MAX_MESSAGE_LEN,
            });
        }
        if available.len() < LENGTH_PREFIX_LEN + len {
            return Ok(None);
        }

        let body = &available[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + len];
        let message = if len <= SMALL_BUF_SIZE {
            let mut buf = pool::small_buffer();
            buf.fill_from(body);
            MessageBuf::Pooled(buf)
        } else {
            MessageBuf::Heap(body.to_vec())
        };

        self.start += LENGTH_PREFIX_LEN + len;
        if self.is_empty() {
            self.pending.clear();
            self.start = 0;
        }
        Ok(Some(message))
    }
}

/// Writes one length-prefixed message and flushes.
///
/// Frames that fit are assembled in a pooled write buffer so the whole frame
/// goes out in a single write.
pub async fn write_message<W>(
    writer: &mut W,
    kind: MessageType,
    payload: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = payload.len() + 1;
    if len > MAX_MESSAGE_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            ProtocolError::TooLarge {
                len,
                max: MAX_MESSAGE_LEN,
            },
        ));
    }

    let total = LENGTH_PREFIX_LEN + len;
    let pooled;
    let heap;
    let frame: &[u8] = if total <= WRITE_BUF_SIZE {
        let mut buf = pool::write_buffer();
        encode_frame(&mut buf.spare_mut()[..total], kind, payload);
        buf.set_len(total);
        pooled = buf;
        &pooled
    } else {
        let mut buf = vec![0u8; total];
        encode_frame(&mut buf, kind, payload);
        heap = buf;
        &heap
    };

    writer.write_all(frame).await?;
    writer.flush().await
}

fn encode_frame(out: &mut [u8], kind: MessageType, payload: &[u8]) {
    let len = (payload.len() + 1) as u32;
    out[..LENGTH_PREFIX_LEN].copy_from_slice(&len.to_be_bytes());
    out[LENGTH_PREFIX_LEN] = kind.as_byte();
    out[LENGTH_PREFIX_LEN + 1..].copy_from_slice(payload);
}

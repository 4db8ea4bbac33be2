//! Length-prefixed messages over any byte stream (the WebTransport
//! bidirectional stream in production, in-memory duplex pipes in tests).

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{FrameSink, FrameSource, TransportError};
use crate::pool::{self, PooledBuf};
use crate::protocol::framing::{self, FrameDecoder, MessageBuf};
use crate::protocol::{MessageType, ProtocolError};

pub struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}

#[async_trait]
impl<W> FrameSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, kind: MessageType, payload: &[u8]) -> Result<(), TransportError> {
        framing::write_message(&mut self.writer, kind, payload).await?;
        Ok(())
    }

    async fn finish(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("stream shutdown failed: {}", e);
        }
    }

    async fn abort(&mut self, reason: &str) {
        debug!("aborting stream: {}", reason);
        let _ = self.writer.shutdown().await;
    }
}

pub struct StreamSource<R> {
    reader: R,
    decoder: FrameDecoder,
    scratch: PooledBuf,
}

impl<R> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            scratch: pool::read_buffer(),
        }
    }
}

#[async_trait]
impl<R> FrameSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<MessageBuf>, TransportError> {
        loop {
            if let Some(message) = self.decoder.next_message()? {
                return Ok(Some(message));
            }
            let n = self.reader.read(self.scratch.spare_mut()).await?;
            if n == 0 {
                if self.decoder.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated.into());
            }
            self.decoder.extend(&self.scratch.spare_mut()[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_MESSAGE_LEN;

    #[tokio::test]
    async fn sink_and_source_agree() {
        let (client, server) = tokio::io::duplex(1024);
        let mut sink = StreamSink::new(client);
        let mut source = StreamSource::new(server);

        sink.send(MessageType::Resize, br#"{"cols":1,"rows":2}"#)
            .await
            .unwrap();
        sink.send(MessageType::Ping, b"").await.unwrap();
        sink.finish().await;

        let first = source.recv().await.unwrap().unwrap();
        assert_eq!(&*first, br#"2{"cols":1,"rows":2}"#);
        let second = source.recv().await.unwrap().unwrap();
        assert_eq!(&*second, b"3");
        assert!(source.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"0abc").await.unwrap();
        drop(client);

        let mut source = StreamSource::new(server);
        assert!(matches!(
            source.recv().await,
            Err(TransportError::Protocol(ProtocolError::Truncated))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_from_header() {
        let (mut client, server) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_LEN as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let mut source = StreamSource::new(server);
        assert!(matches!(
            source.recv().await,
            Err(TransportError::Protocol(ProtocolError::TooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn recv_is_cancel_safe() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut source = StreamSource::new(server);

        client.write_all(&[0, 0, 0, 3, b'0']).await.unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(20), source.recv()).await;
        assert!(pending.is_err());

        client.write_all(b"hi").await.unwrap();
        let message = source.recv().await.unwrap().unwrap();
        assert_eq!(&*message, b"0hi");
    }
}

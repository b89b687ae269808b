use std::fmt::{Debug, Formatter};

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::protocol::frame::Frame;

/// The byte-stream side of a session. A [Transport] is owned by exactly one session at a time;
///  ownership moves between sessions only through a
///  [TransportHandoff](crate::session::handoff::TransportHandoff).
#[async_trait]
pub trait Transport: Debug + Send + 'static {
    /// Returns the next frame, or `None` if the peer closed the connection in an orderly fashion.
    ///
    /// This must be cancel safe: the dispatcher races it against timer ticks and control events,
    ///  and a dropped call must not lose data that was already read.
    async fn receive_frame(&mut self) -> anyhow::Result<Option<Frame>>;

    async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()>;

    /// best effort: errors are logged and otherwise ignored
    async fn close(&mut self);
}

/// [Transport] implementation for any tokio byte stream (`TcpStream`, `UnixStream`, ...), using
///  the [Frame] codec.
pub struct StreamTransport<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_payload_len: usize,
    description: String,
}

impl<S> Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamTransport{{{}}}", self.description)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> StreamTransport<S> {
    pub fn new(stream: S, max_payload_len: usize, description: impl Into<String>) -> StreamTransport<S> {
        StreamTransport {
            stream,
            read_buf: BytesMut::with_capacity(Frame::HEADER_LEN + 4096),
            write_buf: BytesMut::new(),
            max_payload_len,
            description: description.into(),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for StreamTransport<S> {
    async fn receive_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::try_deser(&mut self.read_buf, self.max_payload_len)? {
                trace!("received {:?}", frame);
                return Ok(Some(frame));
            }

            // NB: `read_buf` is cancel safe, and partial frames stay in `self.read_buf`
            let num_read = self.stream.read_buf(&mut self.read_buf).await?;
            if num_read == 0 {
                if self.read_buf.is_empty() {
                    debug!("{}: peer closed the connection", self.description);
                    return Ok(None);
                }
                bail!("{}: connection closed in the middle of a frame ({} bytes pending)", self.description, self.read_buf.len());
            }
        }
    }

    async fn send_frame(&mut self, frame: &Frame) -> anyhow::Result<()> {
        if frame.payload.len() > self.max_payload_len {
            bail!("{}: refusing to send a payload of {} bytes, maximum is {}", self.description, frame.payload.len(), self.max_payload_len);
        }

        trace!("sending {:?}", frame);
        self.write_buf.clear();
        frame.ser(&mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("{}: error closing transport: {}", self.description, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::duplex;
    use crate::protocol::frame::DsiCommand;

    #[tokio::test]
    async fn test_send_receive() {
        let (a, b) = duplex(64);
        let mut left = StreamTransport::new(a, 1024, "left");
        let mut right = StreamTransport::new(b, 1024, "right");

        // bigger than the duplex buffer, so the frame arrives in several reads
        let frame = Frame::request(DsiCommand::Command, 17, Bytes::from(vec![7u8; 200]));
        let sent = frame.clone();
        let sender = tokio::spawn(async move {
            left.send_frame(&sent).await.unwrap();
            left.send_frame(&Frame::tickle(18)).await.unwrap();
            left.close().await;
        });

        assert_eq!(right.receive_frame().await.unwrap(), Some(frame));
        assert_eq!(right.receive_frame().await.unwrap(), Some(Frame::tickle(18)));
        assert_eq!(right.receive_frame().await.unwrap(), None);
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_mid_frame() {
        let (mut a, b) = duplex(64);
        let mut right = StreamTransport::new(b, 1024, "right");

        a.write_all(&[0, 2, 0, 1, 0, 0]).await.unwrap();
        drop(a);

        assert!(right.receive_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_send_oversized() {
        let (a, _b) = duplex(64);
        let mut left = StreamTransport::new(a, 10, "left");

        let frame = Frame::request(DsiCommand::Write, 1, Bytes::from(vec![0u8; 11]));
        assert!(left.send_frame(&frame).await.is_err());
    }
}

//! Raw bodies relayed after a header frame.
//!
//! A Request or Response that declares `StreamLength = N` is followed on the
//! stream by exactly N raw bytes with no further framing. The sender writes
//! them while it still owns the write path; the receiving connection's loop
//! reads them in chunks and hands them to a [`Body`] through a bounded
//! channel, so a slow consumer applies back-pressure to the stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;

use crate::frame::read_full;
use crate::{FrameError, RpcError};

/// Chunks buffered between the receive loop and a [`Body`] consumer.
const BODY_CHANNEL_CAPACITY: usize = 8;

/// An inbound body.
///
/// Yields chunks as the connection reads them. If the connection dies before
/// the declared length arrives, the stream ends with
/// [`RpcError::ConnectionClosed`]. Dropping a `Body` early is fine: the
/// connection reads and discards whatever is left.
pub struct Body {
    len: u64,
    received: u64,
    rx: Option<mpsc::Receiver<Bytes>>,
    read_buf: Bytes,
    failed: bool,
}

impl Body {
    pub(crate) fn channel(len: u64) -> (mpsc::Sender<Bytes>, Body) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let body = Body {
            len,
            received: 0,
            rx: Some(rx),
            read_buf: Bytes::new(),
            failed: false,
        };
        (tx, body)
    }

    /// A body with no bytes.
    pub fn empty() -> Self {
        Body {
            len: 0,
            received: 0,
            rx: None,
            read_buf: Bytes::new(),
            failed: false,
        }
    }

    /// The declared length.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes delivered so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Collect the whole body into memory.
    pub async fn to_bytes(mut self) -> Result<Bytes, RpcError> {
        use futures::StreamExt;

        let mut out = BytesMut::with_capacity(self.len.min(16 * 1024 * 1024) as usize);
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body")
            .field("len", &self.len)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl Stream for Body {
    type Item = Result<Bytes, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.failed || this.received >= this.len {
            return Poll::Ready(None);
        }
        let rx = match this.rx.as_mut() {
            Some(rx) => rx,
            None => {
                this.failed = true;
                return Poll::Ready(Some(Err(RpcError::ConnectionClosed)));
            }
        };
        match rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                this.received += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                tracing::debug!(
                    len = this.len,
                    received = this.received,
                    "body truncated by connection close"
                );
                this.failed = true;
                this.rx = None;
                Poll::Ready(Some(Err(RpcError::ConnectionClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRead for Body {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                let chunk = self.read_buf.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            match self.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.read_buf = chunk,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::UnexpectedEof, e)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// An outbound body: a reader plus the exact number of bytes it will supply.
pub struct BodySource {
    len: u64,
    reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl BodySource {
    /// `reader` must yield at least `len` bytes; anything past that is ignored.
    pub fn new(reader: impl AsyncRead + Send + 'static, len: u64) -> Self {
        Self {
            len,
            reader: Box::pin(reader),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        Self::new(io::Cursor::new(bytes), len)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy exactly `len` bytes to `writer`.
    ///
    /// Any error leaves the stream out of sync, so callers must close the
    /// connection afterwards.
    pub(crate) async fn write_to<W>(mut self, writer: &mut W, chunk_size: usize) -> Result<(), RpcError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut remaining = self.len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = match self.reader.read(&mut buf[..want]).await {
                Ok(0) => {
                    return Err(RpcError::Protocol(format!(
                        "body source ended after {} of {} bytes",
                        self.len - remaining,
                        self.len
                    )));
                }
                Ok(n) => n,
                Err(e) => {
                    return Err(RpcError::Protocol(format!("body source failed: {e}")));
                }
            };
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|_| RpcError::ConnectionClosed)?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodySource")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Read `len` raw bytes off the stream and forward them to `tx`.
///
/// Once the consumer goes away the remaining bytes are still read, and
/// dropped, so the next frame header lines up.
pub(crate) async fn relay<R>(
    reader: &mut R,
    len: u64,
    chunk_size: usize,
    mut tx: Option<mpsc::Sender<Bytes>>,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let chunk_size = chunk_size.max(1) as u64;
    let mut remaining = len;
    let mut discarded = 0u64;
    while remaining > 0 {
        let n = remaining.min(chunk_size) as usize;
        let mut chunk = vec![0u8; n];
        read_full(reader, &mut chunk).await?;
        remaining -= n as u64;

        match &tx {
            Some(sender) => {
                if sender.send(Bytes::from(chunk)).await.is_err() {
                    tx = None;
                }
            }
            None => discarded += n as u64,
        }
    }
    if discarded > 0 {
        tracing::debug!(len, discarded, "discarded unread body bytes");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn relay_delivers_in_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (tx, mut body) = Body::channel(data.len() as u64);

        let pump = tokio::spawn({
            let data = data.clone();
            async move {
                let mut reader: &[u8] = &data;
                relay(&mut reader, 10_000, 4096, Some(tx)).await
            }
        });

        let mut sizes = Vec::new();
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.unwrap();
            sizes.push(chunk.len());
            collected.extend_from_slice(&chunk);
        }
        pump.await.unwrap().unwrap();

        assert_eq!(sizes, [4096, 4096, 1808]);
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn dropped_consumer_still_drains_stream() {
        let mut input: &[u8] = &[1, 2, 3, 4, 5, 6, b'x'];
        let (tx, body) = Body::channel(6);
        drop(body);
        relay(&mut input, 6, 2, Some(tx)).await.unwrap();
        assert_eq!(input, b"x");
    }

    #[tokio::test]
    async fn truncated_body_reports_closed() {
        let (tx, body) = Body::channel(10);
        tx.send(Bytes::from_static(b"abc")).await.unwrap();
        drop(tx);
        let err = body.to_bytes().await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn body_reads_as_async_read() {
        let (tx, mut body) = Body::channel(5);
        tokio::spawn(async move {
            tx.send(Bytes::from_static(b"he")).await.unwrap();
            tx.send(Bytes::from_static(b"llo")).await.unwrap();
        });
        let mut out = String::new();
        body.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn source_writes_exact_length() {
        let source = BodySource::new(io::Cursor::new(b"hello world".to_vec()), 5);
        let mut out = Vec::new();
        source.write_to(&mut out, 2).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn short_source_is_an_error() {
        let source = BodySource::new(io::Cursor::new(b"abc".to_vec()), 5);
        let mut out = Vec::new();
        let err = source.write_to(&mut out, 16).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}

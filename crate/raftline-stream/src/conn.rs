use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Any byte stream a [Connection] can wrap.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An opaque, single-owner byte stream between two peers.
///
/// A connection is created by the HTTP layer or by
/// [crate::StreamListener::dial] and moves from owner to owner; it is
/// never shared.
///
/// Reads first return any bytes the previous owner buffered past what
/// it consumed, then bytes from the underlying stream.
///
/// Optional read and write deadlines make I/O fail with
/// [std::io::ErrorKind::TimedOut] once reached. The HTTP layer uses them
/// while reading a request head; they are cleared before the
/// connection is handed off.
pub struct Connection {
    inner: Box<dyn RawStream>,
    prefix: Vec<u8>,
    prefix_pos: usize,
    peer_addr: Option<SocketAddr>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl Connection {
    pub fn new<S>(stream: S) -> Self
    where
        S: RawStream + 'static,
    {
        Self {
            inner: Box::new(stream),
            prefix: Vec::new(),
            prefix_pos: 0,
            peer_addr: None,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Remember the address of the remote end.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Replay `prefix` to readers before reading from the stream.
    pub(crate) fn with_prefix(mut self, prefix: Vec<u8>) -> Self {
        self.prefix = prefix;
        self.prefix_pos = 0;
        self
    }

    /// Address of the remote end, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn set_read_deadline(&mut self, deadline: Instant) {
        self.read_deadline = Some(Box::pin(tokio::time::sleep_until(deadline)));
    }

    pub fn set_write_deadline(&mut self, deadline: Instant) {
        self.write_deadline = Some(Box::pin(tokio::time::sleep_until(deadline)));
    }

    /// Set both the read and the write deadline.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Remove any read or write deadline.
    pub fn clear_deadlines(&mut self) {
        self.read_deadline = None;
        self.write_deadline = None;
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline.as_ref().map(|s| s.deadline())
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline.as_ref().map(|s| s.deadline())
    }

    /// Shut the connection down, ignoring errors.
    pub(crate) async fn discard(mut self) {
        self.clear_deadlines();
        let _ = self.shutdown().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("buffered", &(self.prefix.len() - self.prefix_pos))
            .field("read_deadline", &self.read_deadline())
            .field("write_deadline", &self.write_deadline())
            .finish()
    }
}

fn deadline_exceeded() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded")
}

fn poll_deadline(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if poll_deadline(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }

        if this.prefix_pos < this.prefix.len() {
            let remaining = &this.prefix[this.prefix_pos..];
            let len = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..len]);
            this.prefix_pos += len;
            if this.prefix_pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.prefix_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if poll_deadline(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }

        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if poll_deadline(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(deadline_exceeded()));
        }

        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn replays_prefix_before_stream() -> anyhow::Result<()> {
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a).with_prefix(b"hello ".to_vec());
        b.write_all(b"world").await?;
        b.shutdown().await?;

        let mut out = String::new();
        conn.read_to_string(&mut out).await?;
        assert_eq!(out, "hello world");

        Ok(())
    }

    #[tokio::test]
    async fn prefix_larger_than_read_buffer() -> anyhow::Result<()> {
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a).with_prefix(b"abcdef".to_vec());

        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).await?, 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(conn.read(&mut buf).await?, 2);
        assert_eq!(&buf[..2], b"ef");

        Ok(())
    }

    #[tokio::test]
    async fn read_deadline_times_out() -> anyhow::Result<()> {
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a);
        conn.set_read_deadline(Instant::now() + Duration::from_millis(20));

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        Ok(())
    }

    #[tokio::test]
    async fn cleared_deadlines_do_not_fire() -> anyhow::Result<()> {
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a);
        conn.set_deadline(Instant::now() + Duration::from_millis(10));
        assert!(conn.read_deadline().is_some());
        assert!(conn.write_deadline().is_some());

        conn.clear_deadlines();
        assert!(conn.read_deadline().is_none());
        assert!(conn.write_deadline().is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;
        conn.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");

        Ok(())
    }
}

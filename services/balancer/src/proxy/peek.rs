//! Peeking connection adapter.
//!
//! Wraps an inbound stream so a frame parser can read from it while every
//! byte it consumes is captured for replay to the backends. Writes issued by
//! the parser are accepted and dropped: the parser must never emit bytes to
//! the real client.
//!
//! The captured prefix is exactly the bytes the parser consumed, in order.
//! Bytes still in the socket stay there for the fan-out coordinator.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Default bound on the captured prefix (64 KiB).
pub const DEFAULT_MAX_PEEK_BYTES: usize = 64 * 1024;

/// Inbound stream adapter that captures reads and discards writes.
#[derive(Debug)]
pub struct PeekingConn<S> {
    inner: S,
    captured: BytesMut,
    max_bytes: usize,
    limit_exceeded: bool,
    closed: bool,
}

impl<S> PeekingConn<S> {
    /// Wrap a stream with the default capture bound.
    pub fn new(inner: S) -> Self {
        Self::with_limit(inner, DEFAULT_MAX_PEEK_BYTES)
    }

    /// Wrap a stream, failing reads that would capture more than `max_bytes`.
    pub fn with_limit(inner: S, max_bytes: usize) -> Self {
        Self {
            inner,
            captured: BytesMut::new(),
            max_bytes,
            limit_exceeded: false,
            closed: false,
        }
    }

    /// Bytes consumed so far.
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    pub fn captured_len(&self) -> usize {
        self.captured.len()
    }

    /// Whether a read was refused because of the capture bound.
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop peeking: hand back the live stream and the captured prefix.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.captured.freeze())
    }
}

impl<S: AsyncWrite + Unpin> PeekingConn<S> {
    /// Close the underlying connection.
    ///
    /// Idempotent: only the first call reaches the socket. Later reads fail.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.inner.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl PeekingConn<TcpStream> {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekingConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "peeking connection closed",
            )));
        }
        if this.limit_exceeded {
            return Poll::Ready(Err(peek_limit_error(this.max_bytes)));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];

        if this.captured.len() + fresh.len() > this.max_bytes {
            this.limit_exceeded = true;
            return Poll::Ready(Err(peek_limit_error(this.max_bytes)));
        }
        this.captured.extend_from_slice(fresh);
        Poll::Ready(Ok(()))
    }
}

impl<S: Unpin> AsyncWrite for PeekingConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    // The parser may try to close the stream once it is done with it; the
    // client connection outlives the parser.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn peek_limit_error(max_bytes: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("peek limit of {max_bytes} bytes exceeded"),
    )
}

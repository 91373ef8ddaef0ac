//! Force-close switch for a tunnel connection.
//!
//! Dropping a multiplexer's handles does not always drop its socket: hyper's
//! h2 client keeps the connection on an executor task of its own, and every
//! stream holds a sender clone. [`Severable`] makes closing independent of
//! who owns the I/O: once its token fires, every read and write fails.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A duplex stream that errors out for good once `token` is cancelled.
pub struct Severable<T> {
    inner: T,
    severed: Pin<Box<WaitForCancellationFutureOwned>>,
    token: CancellationToken,
}

impl<T> Severable<T> {
    pub fn new(inner: T, token: CancellationToken) -> Self {
        Self {
            inner,
            severed: Box::pin(token.clone().cancelled_owned()),
            token,
        }
    }

    /// Ready with an error once severed; registers the waker otherwise.
    fn poll_severed(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        match self.severed.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(severed()),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn severed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel force-closed")
}

impl<T: AsyncRead + Unpin> AsyncRead for Severable<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Poll::Ready(e) = self.poll_severed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Severable<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Poll::Ready(e) = self.poll_severed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Err(severed()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.token.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

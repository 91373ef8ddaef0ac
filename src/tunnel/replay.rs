//! Replay wrapper for hijacked connections.
//!
//! When a connection is taken over from an HTTP parser, the parser may already
//! have read bytes past the request head. [`ReplayConn`] hands those bytes back
//! to the next reader, in order, before any new bytes from the socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A duplex stream that yields a captured prefix before reading from `inner`.
///
/// Writes, flushes and shutdowns go straight to `inner`.
#[derive(Debug)]
pub struct ReplayConn<T> {
    replay: Bytes,
    inner: T,
}

impl<T> ReplayConn<T> {
    pub fn new(inner: T, replay: Bytes) -> Self {
        Self { replay, inner }
    }

    /// Number of captured bytes not yet handed to a reader.
    pub fn remaining(&self) -> usize {
        self.replay.len()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for ReplayConn<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.replay.has_remaining() {
            let n = self.replay.len().min(buf.remaining());
            buf.put_slice(&self.replay[..n]);
            self.replay.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for ReplayConn<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn replays_prefix_before_live_bytes() {
        let (local, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"live").await.unwrap();
        let mut conn = ReplayConn::new(local, Bytes::from_static(b"buffered-"));

        let mut out = vec![0u8; 13];
        conn.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"buffered-live");
        assert_eq!(conn.remaining(), 0);
    }

    #[tokio::test]
    async fn prefix_survives_small_reads() {
        let (local, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"XYZ").await.unwrap();
        let mut conn = ReplayConn::new(local, Bytes::from_static(b"abcdefg"));

        // Reads of 3 bytes never mix replay and live data in one call.
        let mut seen = Vec::new();
        let mut chunk = [0u8; 3];
        for expected in [&b"abc"[..], b"def", b"g", b"XYZ"] {
            let n = conn.read(&mut chunk).await.unwrap();
            assert_eq!(&chunk[..n], expected);
            seen.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(seen, b"abcdefgXYZ");
    }

    #[tokio::test]
    async fn every_split_yields_same_sequence() {
        let prefix = b"0123456789";
        for step in 1..=prefix.len() + 1 {
            let (local, mut remote) = tokio::io::duplex(64);
            remote.write_all(b"!").await.unwrap();
            let mut conn = ReplayConn::new(local, Bytes::from_static(prefix));
            let mut seen = Vec::new();
            let mut chunk = vec![0u8; step];
            while seen.len() < prefix.len() + 1 {
                let n = conn.read(&mut chunk).await.unwrap();
                seen.extend_from_slice(&chunk[..n]);
            }
            assert_eq!(seen, b"0123456789!", "step {step}");
        }
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = ReplayConn::new(local, Bytes::from_static(b"unread"));
        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();

        let mut out = [0u8; 4];
        remote.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");
        assert_eq!(conn.remaining(), 6);
    }

    #[tokio::test]
    async fn shutdown_reaches_inner_stream() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = ReplayConn::new(local, Bytes::new());
        conn.shutdown().await.unwrap();

        let mut out = Vec::new();
        let n = remote.read_to_end(&mut out).await.unwrap();
        assert_eq!(n, 0);
    }
}

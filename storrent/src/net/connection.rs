use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Identifies a connection across the manager and the engine.
pub type ConnectionId = u64;

/// Per-connection traffic totals and last-tick speeds, published to the
/// engine once per second.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    /// Bytes per second over the last tick.
    pub download_speed: u64,
    pub upload_speed: u64,
}

/// Counters a connection's io task shares with the manager's timer: byte
/// counts since the last stats tick and the last send/receive instants
/// (milliseconds since the manager's epoch).
#[derive(Debug)]
pub struct ConnectionShared {
    epoch: Instant,
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    last_received_at: AtomicU64,
    last_sent_at: AtomicU64,
}

impl ConnectionShared {
    pub fn new(epoch: Instant) -> Self {
        let now = epoch.elapsed().as_millis() as u64;
        Self {
            epoch,
            bytes_downloaded: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            last_received_at: AtomicU64::new(now),
            last_sent_at: AtomicU64::new(now),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn note_received(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.last_received_at
            .store(self.now_millis(), Ordering::Relaxed);
    }

    pub fn note_sent(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.last_sent_at.store(self.now_millis(), Ordering::Relaxed);
    }

    /// Returns and zeroes the bytes received since the previous call.
    pub fn take_downloaded(&self) -> u64 {
        self.bytes_downloaded.swap(0, Ordering::Relaxed)
    }

    /// Returns and zeroes the bytes sent since the previous call.
    pub fn take_uploaded(&self) -> u64 {
        self.bytes_uploaded.swap(0, Ordering::Relaxed)
    }

    pub fn millis_since_received(&self) -> u64 {
        self.now_millis()
            .saturating_sub(self.last_received_at.load(Ordering::Relaxed))
    }

    pub fn millis_since_sent(&self) -> u64 {
        self.now_millis()
            .saturating_sub(self.last_sent_at.load(Ordering::Relaxed))
    }
}

/// Stream wrapper feeding the shared traffic counters on every successful
/// read and write, keep-alives included.
#[derive(Debug)]
pub struct CountingStream<S> {
    inner: S,
    shared: Arc<ConnectionShared>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, shared: Arc<ConnectionShared>) -> Self {
        Self { inner, shared }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let received = buf.filled().len() - before;
        if received > 0 {
            this.shared.note_received(received as u64);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let sent = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if sent > 0 {
            this.shared.note_sent(sent as u64);
        }
        Poll::Ready(Ok(sent))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counters_track_reads_and_writes() {
        let (client, mut server) = tokio::io::duplex(64);
        let shared = Arc::new(ConnectionShared::new(Instant::now()));
        let mut counting = CountingStream::new(client, shared.clone());

        counting.write_all(b"hello").await.unwrap();
        counting.flush().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(shared.take_uploaded(), 5);
        assert_eq!(shared.take_uploaded(), 0);

        server.write_all(b"worlds!").await.unwrap();
        let mut buf = [0u8; 7];
        counting.read_exact(&mut buf).await.unwrap();
        assert_eq!(shared.take_downloaded(), 7);
        assert!(shared.millis_since_received() < 1000);
    }
}

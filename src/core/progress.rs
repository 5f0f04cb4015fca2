//! Transfer progress reporting.
//!
//! Transfer engines report every chunk to a [`ProgressSink`]. The sink decides
//! how often to emit anything; [`ThrottledProgress`] counts every byte but
//! logs at most once per interval, so throttling never undercounts.

use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use crate::logging::LogThrottle;

pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);
pub const UPLOAD_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Receives the size of every chunk moved by a transfer.
pub trait ProgressSink: Send + Sync {
    fn on_chunk(&self, bytes: u64);
}

/// Which way the bytes are flowing, for log wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// Accumulating sink that logs the running total at a bounded rate.
pub struct ThrottledProgress {
    account: String,
    direction: Direction,
    /// Known size of the transfer, if any (uploads of a local file).
    total_bytes: Option<u64>,
    seen: AtomicU64,
    throttle: LogThrottle,
}

impl ThrottledProgress {
    pub fn new(
        account: impl Into<String>,
        direction: Direction,
        total_bytes: Option<u64>,
        interval: Duration,
    ) -> Self {
        Self {
            account: account.into(),
            direction,
            total_bytes,
            seen: AtomicU64::new(0),
            throttle: LogThrottle::starting_now(interval),
        }
    }

    pub fn for_download(account: impl Into<String>) -> Self {
        Self::new(account, Direction::Download, None, DOWNLOAD_PROGRESS_INTERVAL)
    }

    pub fn for_upload(account: impl Into<String>, total_bytes: u64) -> Self {
        Self::new(
            account,
            Direction::Upload,
            Some(total_bytes),
            UPLOAD_PROGRESS_INTERVAL,
        )
    }

    pub fn bytes_seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    pub fn percentage(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some(self.bytes_seen() as f64 / total as f64 * 100.0),
            None => None,
        }
    }
}

impl ProgressSink for ThrottledProgress {
    fn on_chunk(&self, bytes: u64) {
        let seen = self.seen.fetch_add(bytes, Ordering::Relaxed) + bytes;

        if !self.throttle.should_log() {
            return;
        }

        let mb = seen as f64 / (1024.0 * 1024.0);
        match self.direction {
            Direction::Upload => debug!(
                account = %self.account,
                progress = format!("{:.2}%", self.percentage().unwrap_or(0.0)),
                "Restoring"
            ),
            Direction::Download => debug!(
                account = %self.account,
                mb = format!("{:.2}", mb),
                "Backup progress"
            ),
        }
    }
}

/// Sink that only counts. Handy when the caller wants the total and nothing
/// else.
#[derive(Default)]
pub struct CountingProgress {
    bytes: AtomicU64,
    chunks: AtomicU64,
}

impl CountingProgress {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }
}

impl ProgressSink for CountingProgress {
    fn on_chunk(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reader adapter that reports each successful read to a sink.
pub struct ProgressReader<R, S> {
    inner: R,
    sink: S,
}

impl<R, S> ProgressReader<R, S> {
    pub fn new(inner: R, sink: S) -> Self {
        Self { inner, sink }
    }
}

impl<R, S> AsyncRead for ProgressReader<R, S>
where
    R: AsyncRead + Unpin,
    S: Deref + Unpin,
    S::Target: ProgressSink,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                this.sink.on_chunk(read as u64);
            }
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_throttled_sink_counts_every_chunk() {
        let sink = ThrottledProgress::new(
            "a@x.org",
            Direction::Upload,
            Some(300),
            Duration::from_secs(3600),
        );
        for _ in 0..3 {
            sink.on_chunk(100);
        }
        assert_eq!(sink.bytes_seen(), 300);
        assert_eq!(sink.percentage(), Some(100.0));
    }

    #[test]
    fn test_download_sink_has_no_percentage() {
        let sink = ThrottledProgress::for_download("a@x.org");
        sink.on_chunk(42);
        assert_eq!(sink.bytes_seen(), 42);
        assert!(sink.percentage().is_none());
    }

    #[tokio::test]
    async fn test_reader_reports_reads_to_sink() {
        let data = vec![7u8; 20_000];
        let sink = Arc::new(CountingProgress::default());
        let mut reader = ProgressReader::new(&data[..], sink.clone());

        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        assert_eq!(out.len(), 20_000);
        assert_eq!(sink.bytes(), 20_000);
        assert_eq!(sink.chunks(), 5);
    }
}

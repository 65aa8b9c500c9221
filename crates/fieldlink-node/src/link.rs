//! Transport plumbing shared by all nodes.
//!
//! Each open transport has exactly one writer task that owns the write half.
//! Everyone else (watchdogs, the opposite side of a relay, the shutdown
//! trigger) reaches it through a `LinkSlot`, which is empty while the
//! transport is down. Sends never wait: a full or missing link drops the
//! bytes, giving at-most-once delivery.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outbound chunks buffered per open transport.
pub const LINK_QUEUE_DEPTH: usize = 64;

/// Size of a single transport read.
pub const READ_CHUNK: usize = 1024;

/// Handle to whichever writer currently owns a transport.
#[derive(Debug, Clone)]
pub struct LinkSlot {
    name: &'static str,
    inner: Arc<RwLock<Option<mpsc::Sender<Bytes>>>>,
}

impl LinkSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Install a fresh writer queue; returns the receiving end for the writer task.
    pub async fn attach(&self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(LINK_QUEUE_DEPTH);
        *self.inner.write().await = Some(tx);
        rx
    }

    pub async fn detach(&self) {
        *self.inner.write().await = None;
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Queue bytes for the writer. Returns false if the link is down or
    /// backed up; the bytes are dropped in that case.
    pub async fn send(&self, data: Bytes) -> bool {
        let guard = self.inner.read().await;
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(data) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(link = self.name, "send dropped: {e}");
                false
            }
        }
    }
}

/// Drain a writer queue into a transport until the queue closes or a write fails.
pub async fn run_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = rx.recv().await {
        writer.write_all(&data).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Timestamp of the last observed traffic, shared between a reader and its watchdogs.
#[derive(Debug, Clone)]
pub struct ActivityClock(Arc<Mutex<Instant>>);

impl ActivityClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub async fn touch(&self) {
        *self.0.lock().await = Instant::now();
    }

    pub async fn elapsed(&self) -> Duration {
        self.0.lock().await.elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for `period` unless cancelled first. Returns false on cancellation.
pub async fn sleep_or_cancel(period: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Interval for watchdog loops: skips missed ticks, first tick already consumed.
pub async fn watchdog_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    ticker
}

//! Shared outbound queue drained by the consumer loops.
//!
//! The queue is a bounded MPMC channel: the upstream aggregator enqueues,
//! every consumer takes from the same queue, and a consumer whose send fails
//! puts the item back. Requeue reordering is accepted; no FIFO guarantee
//! survives a failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::wire::SpanRecord;

/// A telemetry record that can be queued for streaming.
///
/// The exporter treats records as opaque; the display name is only used in
/// log records.
pub trait StreamItem: Send + 'static {
    /// Human-readable name for logging.
    fn display_name(&self) -> &str;
}

impl StreamItem for SpanRecord {
    fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Errors raised on the enqueue side of the queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity (non-blocking enqueue only).
    #[error("outbound queue is full")]
    Full,
    /// All queue handles were dropped.
    #[error("outbound queue is closed")]
    Closed,
}

/// Counters for queue activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Records accepted from the aggregator.
    pub enqueued: u64,
    /// Records taken by consumers.
    pub taken: u64,
    /// Records returned after a failed send.
    pub requeued: u64,
    /// Records dropped because the queue was full on requeue.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    taken: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded multi-producer multi-consumer queue of outbound records.
///
/// Clones share the same underlying channel and counters, so one handle can
/// live with the aggregator while each consumer holds its own.
pub struct SpanQueue<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
    counters: Arc<QueueCounters>,
}

impl<T> Clone for SpanQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<T: StreamItem> SpanQueue<T> {
    /// Create a queue holding at most `capacity` records.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            counters: Arc::new(QueueCounters::default()),
        }
    }

    /// Enqueue a record, waiting for space. Used by the upstream aggregator.
    pub async fn enqueue(&self, item: T) -> Result<(), QueueError> {
        self.tx
            .send_async(item)
            .await
            .map_err(|_| QueueError::Closed)?;
        let _ = self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue a record without waiting.
    pub fn try_enqueue(&self, item: T) -> Result<(), QueueError> {
        match self.tx.try_send(item) {
            Ok(()) => {
                let _ = self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(flume::TrySendError::Full(_)) => Err(QueueError::Full),
            Err(flume::TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    /// Take the next record, blocking until one is available.
    ///
    /// Returns `None` as soon as `token` is cancelled.
    pub async fn take(&self, token: &CancellationToken) -> Option<T> {
        tokio::select! {
            biased;

            _ = token.cancelled() => None,
            item = self.rx.recv_async() => {
                let item = item.ok()?;
                let _ = self.counters.taken.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
        }
    }

    /// Return a failed record to the queue.
    ///
    /// Returns false when the queue was full and the record had to be
    /// dropped; the caller is expected to report the drop.
    pub fn requeue(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                let _ = self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(flume::TrySendError::Full(item))
            | Err(flume::TrySendError::Disconnected(item)) => {
                warn!(
                    item = item.display_name(),
                    "outbound queue cannot accept record back, dropping it"
                );
                let _ = self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Number of records currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when no records are queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            taken: self.counters.taken.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SpanRecord;
    use std::time::Duration;
    use tokio::time::timeout;

    fn record(name: &str) -> SpanRecord {
        SpanRecord::new(name, Vec::new())
    }

    #[tokio::test]
    async fn test_enqueue_and_take() {
        let queue = SpanQueue::bounded(10);
        let token = CancellationToken::new();

        queue.enqueue(record("a")).await.unwrap();
        queue.enqueue(record("b")).await.unwrap();
        assert_eq!(queue.len(), 2);

        let first = queue.take(&token).await.unwrap();
        assert_eq!(first.display_name, "a");
        let second = queue.take(&token).await.unwrap();
        assert_eq!(second.display_name, "b");
        assert!(queue.is_empty());

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.taken, 2);
    }

    #[tokio::test]
    async fn test_take_returns_promptly_on_cancellation() {
        let queue: SpanQueue<SpanRecord> = SpanQueue::bounded(10);
        let token = CancellationToken::new();
        token.cancel();

        let taken = timeout(Duration::from_secs(1), queue.take(&token))
            .await
            .expect("take should not block after cancellation");
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_pending_take() {
        let queue: SpanQueue<SpanRecord> = SpanQueue::bounded(10);
        let token = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.take(&token).await })
        };

        token.cancel();
        let taken = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("take should unblock")
            .unwrap();
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn test_requeue_puts_item_back_once() {
        let queue = SpanQueue::bounded(10);
        let token = CancellationToken::new();

        queue.enqueue(record("retry-me")).await.unwrap();
        let item = queue.take(&token).await.unwrap();
        assert!(queue.is_empty());

        assert!(queue.requeue(item));
        assert_eq!(queue.len(), 1);

        let again = queue.take(&token).await.unwrap();
        assert_eq!(again.display_name, "retry-me");
        assert!(queue.is_empty());
        assert_eq!(queue.stats().requeued, 1);
        assert_eq!(queue.stats().dropped, 0);
    }

    #[tokio::test]
    async fn test_requeue_overflow_drops_and_counts() {
        let queue = SpanQueue::bounded(1);
        queue.try_enqueue(record("occupant")).unwrap();

        assert!(!queue.requeue(record("doomed")));
        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_try_enqueue_full() {
        let queue = SpanQueue::bounded(1);
        queue.try_enqueue(record("a")).unwrap();
        assert_eq!(queue.try_enqueue(record("b")), Err(QueueError::Full));
    }
}

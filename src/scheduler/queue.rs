//! Bounded FIFO work queue shared by the producer and the worker pool.
//!
//! The queue carries [`QueueEntry`] values: work items and termination
//! sentinels. It provides two operations:
//!
//! - **put**: waits while the queue holds `capacity` entries, then inserts
//! - **get**: waits while the queue is empty, then removes the oldest entry
//!
//! A capacity of zero means unbounded: `put` never waits. Every entry is
//! admitted to the [`CompletionTracker`] after its slot is secured and before
//! any worker can observe it.
//!
//! Consumers share a single receiver behind a fair async mutex, so idle
//! workers are served first-come-first-served and ordering across puts is
//! preserved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::metrics::MetricsCollector;

use super::job::QueueEntry;
use super::tracker::{CompletionTracker, ConsistencyError};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The other side of the queue is gone.
    #[error("Work queue closed")]
    Closed,

    /// The completion tracker refused the admission.
    #[error("Admission rejected: {0}")]
    Admission(#[from] ConsistencyError),
}

enum QueueSender<P> {
    Bounded(mpsc::Sender<QueueEntry<P>>),
    Unbounded(mpsc::UnboundedSender<QueueEntry<P>>),
}

enum QueueReceiver<P> {
    Bounded(mpsc::Receiver<QueueEntry<P>>),
    Unbounded(mpsc::UnboundedReceiver<QueueEntry<P>>),
}

impl<P> QueueReceiver<P> {
    async fn recv(&mut self) -> Option<QueueEntry<P>> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Capacity-limited FIFO channel of work items and sentinels.
pub struct WorkQueue<P> {
    sender: QueueSender<P>,
    receiver: Mutex<QueueReceiver<P>>,
    tracker: Arc<CompletionTracker>,
    depth: AtomicUsize,
    capacity: usize,
    metrics: MetricsCollector,
}

impl<P: Send> WorkQueue<P> {
    /// Creates a queue holding at most `capacity` entries (0 = unbounded).
    pub fn new(capacity: usize, tracker: Arc<CompletionTracker>) -> Self {
        let (sender, receiver) = if capacity == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        } else {
            let (tx, rx) = mpsc::channel(capacity);
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        };

        Self {
            sender,
            receiver: Mutex::new(receiver),
            tracker,
            depth: AtomicUsize::new(0),
            capacity,
            metrics: MetricsCollector::new(),
        }
    }

    /// Inserts an entry, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Admission` if the tracker rejects the entry (the
    /// slot is released again) and `QueueError::Closed` if no consumer is left.
    pub async fn put(&self, entry: QueueEntry<P>) -> Result<(), QueueError> {
        let kind = entry.kind();
        match &self.sender {
            QueueSender::Bounded(tx) => {
                let permit = tx.reserve().await.map_err(|_| QueueError::Closed)?;
                self.tracker.mark_admitted(kind)?;
                self.record_push();
                permit.send(entry);
            }
            QueueSender::Unbounded(tx) => {
                self.tracker.mark_admitted(kind)?;
                self.record_push();
                if tx.send(entry).is_err() {
                    self.record_pop();
                    return Err(QueueError::Closed);
                }
            }
        }
        debug!(kind = %kind, queue_depth = self.len(), "Entry admitted");
        Ok(())
    }

    /// Removes the oldest entry, waiting while the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Closed` if the queue can never produce another entry.
    pub async fn get(&self) -> Result<QueueEntry<P>, QueueError> {
        let entry = {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        };
        let entry = entry.ok_or(QueueError::Closed)?;
        self.record_pop();
        Ok(entry)
    }

    /// Number of entries currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Returns true when no entry is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of waiting entries, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }

    /// Returns the tracker entries are admitted to.
    pub fn tracker(&self) -> &Arc<CompletionTracker> {
        &self.tracker
    }

    fn record_push(&self) {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.set_queue_depth(depth);
    }

    fn record_pop(&self) {
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.set_queue_depth(depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::WorkItem;
    use std::time::Duration;

    fn queue(capacity: usize, workers: usize) -> WorkQueue<u32> {
        WorkQueue::new(capacity, Arc::new(CompletionTracker::new(workers)))
    }

    fn item(id: u32) -> QueueEntry<u32> {
        QueueEntry::Item(WorkItem::new(format!("item-{}", id), id))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = queue(0, 1);
        for i in 0..5 {
            queue.put(item(i)).await.unwrap();
        }
        queue.put(QueueEntry::Sentinel).await.unwrap();
        assert_eq!(queue.len(), 6);

        for i in 0..5 {
            match queue.get().await.unwrap() {
                QueueEntry::Item(it) => assert_eq!(it.payload, i),
                QueueEntry::Sentinel => panic!("sentinel before items"),
            }
        }
        assert!(queue.get().await.unwrap().is_sentinel());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_put_blocks_when_full() {
        let queue = Arc::new(queue(2, 1));
        assert_eq!(queue.capacity(), Some(2));
        queue.put(item(1)).await.unwrap();
        queue.put(item(2)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.put(item(3))).await;
        assert!(blocked.is_err(), "third put should wait for a free slot");
        // The abandoned put was never admitted.
        assert_eq!(queue.tracker().snapshot().admitted, 2);

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put(item(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let first = queue.get().await.unwrap();
        assert!(matches!(first, QueueEntry::Item(ref it) if it.payload == 1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_never_blocks_producer() {
        let queue = queue(0, 1);
        assert_eq!(queue.capacity(), None);
        tokio::time::timeout(Duration::from_millis(100), async {
            for i in 0..1_000 {
                queue.put(item(i)).await.unwrap();
            }
        })
        .await
        .expect("unbounded puts should not wait");
        assert_eq!(queue.len(), 1_000);
    }

    #[tokio::test]
    async fn test_put_admits_to_tracker() {
        let queue = queue(4, 2);
        queue.put(item(1)).await.unwrap();
        queue.put(QueueEntry::Sentinel).await.unwrap();
        queue.put(QueueEntry::Sentinel).await.unwrap();

        let snap = queue.tracker().snapshot();
        assert_eq!(snap.admitted, 3);
        assert_eq!(snap.sentinels_admitted, 2);
        assert_eq!(snap.items_admitted(), 1);
    }

    #[tokio::test]
    async fn test_extra_sentinel_rejected_without_occupying_slot() {
        let queue = queue(4, 1);
        queue.put(QueueEntry::Sentinel).await.unwrap();

        let err = queue.put(QueueEntry::Sentinel).await.unwrap_err();
        assert!(matches!(err, QueueError::Admission(_)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_consumers_receive_distinct_entries() {
        let queue = Arc::new(queue(3, 1));
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..4 {
                    if let QueueEntry::Item(it) = queue.get().await.unwrap() {
                        seen.push(it.payload);
                    }
                }
                seen
            }));
        }

        for i in 0..12 {
            queue.put(item(i)).await.unwrap();
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..12).collect::<Vec<_>>());
        assert_eq!(queue.tracker().snapshot().admitted, 12);
        assert_eq!(queue.tracker().snapshot().sentinels_admitted, 0);
    }
}

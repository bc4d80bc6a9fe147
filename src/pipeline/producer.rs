//! Producer side of the pipeline.
//!
//! Pulls work items from a finite stream, admits them to the work queue in
//! order (waiting whenever the queue is full), then admits exactly one
//! sentinel per worker.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tracing::info;

use crate::scheduler::job::{QueueEntry, WorkItem};
use crate::scheduler::queue::{QueueError, WorkQueue};

use super::events::{EventSink, PipelineEvent};

/// Feeds a work queue from a stream of items.
pub struct Producer<P> {
    queue: Arc<WorkQueue<P>>,
    worker_count: usize,
    ingest_interval: Duration,
    events: EventSink,
}

impl<P: Send> Producer<P> {
    /// Creates a producer that ends with `worker_count` sentinels.
    pub fn new(queue: Arc<WorkQueue<P>>, worker_count: usize) -> Self {
        Self {
            queue,
            worker_count,
            ingest_interval: Duration::ZERO,
            events: EventSink::disabled(),
        }
    }

    /// Waits `interval` before each item admission.
    pub fn with_ingest_interval(mut self, interval: Duration) -> Self {
        self.ingest_interval = interval;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Admits every item of `items`, then the sentinels.
    ///
    /// Returns the number of items admitted, sentinels excluded.
    ///
    /// # Errors
    ///
    /// Returns `QueueError` if the queue rejects an admission.
    pub async fn run<S>(&self, items: S) -> Result<u64, QueueError>
    where
        S: Stream<Item = WorkItem<P>>,
    {
        let mut items = std::pin::pin!(items);
        let mut admitted = 0u64;

        while let Some(item) = items.next().await {
            if !self.ingest_interval.is_zero() {
                tokio::time::sleep(self.ingest_interval).await;
            }

            let item_id = item.id.clone();
            self.queue.put(QueueEntry::Item(item)).await?;
            admitted += 1;

            let queue_depth = self.queue.len();
            info!(item_id = %item_id, queue_depth = queue_depth, "Item admitted");
            self.events.emit(PipelineEvent::ItemAdmitted {
                item_id,
                queue_depth,
            });
        }

        for _ in 0..self.worker_count {
            self.queue.put(QueueEntry::Sentinel).await?;
        }
        info!(
            items_admitted = admitted,
            sentinels = self.worker_count,
            "Ingest finished, stop signals admitted"
        );
        self.events.emit(PipelineEvent::SentinelsAdmitted {
            count: self.worker_count,
        });

        Ok(admitted)
    }
}

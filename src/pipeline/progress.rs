//! Background progress monitor for pipeline runs.
//!
//! Periodically logs admission and acknowledgement counts, calls in flight and
//! queue depth so long runs can be followed without reading per-item lines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::scheduler::limiter::ConcurrencyLimiter;
use crate::scheduler::queue::WorkQueue;

/// Pipeline progress at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Items admitted so far, sentinels excluded.
    pub items_admitted: u64,
    /// Entries admitted but not yet acknowledged.
    pub outstanding: u64,
    /// Entries acknowledged, sentinels included.
    pub acknowledged: u64,
    /// Call attempts holding a limiter permit.
    pub calls_in_flight: usize,
    /// Entries waiting in the queue.
    pub queue_depth: usize,
    pub elapsed: Duration,
}

/// Read-only handles the monitor samples.
pub struct ProgressSource<P> {
    queue: Arc<WorkQueue<P>>,
    limiter: ConcurrencyLimiter,
}

impl<P: Send> ProgressSource<P> {
    pub fn new(queue: Arc<WorkQueue<P>>, limiter: ConcurrencyLimiter) -> Self {
        Self { queue, limiter }
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        let counts = self.queue.tracker().snapshot();
        ProgressSnapshot {
            items_admitted: counts.items_admitted(),
            outstanding: counts.outstanding(),
            acknowledged: counts.acknowledged,
            calls_in_flight: self.limiter.in_flight(),
            queue_depth: self.queue.len(),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that logs pipeline progress every `interval`.
///
/// Call [`ProgressMonitor::stop`] to cancel it.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    pub fn start<P>(source: ProgressSource<P>, interval: Duration) -> Self
    where
        P: Send + 'static,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = source.snapshot(start);
                tracing::info!(
                    items_admitted = snap.items_admitted,
                    acknowledged = snap.acknowledged,
                    outstanding = snap.outstanding,
                    calls_in_flight = snap.calls_in_flight,
                    queue_depth = snap.queue_depth,
                    elapsed_secs = format!("{:.1}", snap.elapsed.as_secs_f64()),
                    "Pipeline progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Stops the monitor without waiting for its next tick.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{EntryKind, QueueEntry, WorkItem};
    use crate::scheduler::tracker::CompletionTracker;

    fn source() -> ProgressSource<u8> {
        let tracker = Arc::new(CompletionTracker::new(1));
        let queue = Arc::new(WorkQueue::new(4, tracker));
        ProgressSource::new(queue, ConcurrencyLimiter::new(2))
    }

    #[tokio::test]
    async fn test_snapshot_reflects_queue_and_tracker() {
        let source = source();
        source
            .queue
            .put(QueueEntry::Item(WorkItem::new("a", 1)))
            .await
            .unwrap();
        source
            .queue
            .put(QueueEntry::Item(WorkItem::new("b", 2)))
            .await
            .unwrap();
        let _ = source.queue.get().await.unwrap();
        source
            .queue
            .tracker()
            .mark_acknowledged(EntryKind::Item)
            .unwrap();
        let _permit = source.limiter.acquire().await.unwrap();

        let snap = source.snapshot(Instant::now());
        assert_eq!(snap.items_admitted, 2);
        assert_eq!(snap.acknowledged, 1);
        assert_eq!(snap.outstanding, 1);
        assert_eq!(snap.queue_depth, 1);
        assert_eq!(snap.calls_in_flight, 1);
    }

    #[tokio::test]
    async fn test_monitor_stops_promptly() {
        let monitor = ProgressMonitor::start(source(), Duration::from_secs(3600));
        let stopped = tokio::time::timeout(Duration::from_millis(200), monitor.stop()).await;
        assert!(stopped.is_ok());
    }
}

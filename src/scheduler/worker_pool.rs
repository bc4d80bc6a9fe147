//! Fixed pool of workers draining the work queue.
//!
//! Each worker is an independent task that loops:
//!
//! 1. take the next entry from the [`WorkQueue`] (waiting while empty)
//! 2. on a sentinel: acknowledge it and stop
//! 3. on an item: run the stage sequence, record exactly one outcome in the
//!    [`StatsAggregator`] and acknowledge the item, even if a stage panicked
//!
//! Per-item failures stay inside the worker. Only a broken coordination
//! primitive (queue, limiter or tracker) ends a worker with an error.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::ItemError;
use crate::metrics::MetricsCollector;
use crate::pipeline::events::{EventSink, PipelineEvent};
use crate::pipeline::stages::{ItemHandler, StageRunner};

use super::job::{EntryKind, Outcome, QueueEntry, WorkItem};
use super::limiter::LimiterError;
use super::offload::panic_message;
use super::queue::{QueueError, WorkQueue};
use super::stats::{Stats, StatsAggregator};
use super::tracker::ConsistencyError;

/// Errors that end a worker abnormally.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker '{worker}' lost its queue: {source}")]
    Queue {
        worker: String,
        #[source]
        source: QueueError,
    },

    #[error("Worker '{worker}' hit a tracker inconsistency: {source}")]
    Consistency {
        worker: String,
        #[source]
        source: ConsistencyError,
    },

    #[error("Worker '{worker}' could not acquire a call permit: {source}")]
    Limiter {
        worker: String,
        #[source]
        source: LimiterError,
    },

    /// Any other item error classified as fatal.
    #[error("Worker '{worker}' stopped on a fatal item error: {source}")]
    Item {
        worker: String,
        #[source]
        source: ItemError,
    },

    #[error("Worker '{worker}' panicked: {message}")]
    Panicked { worker: String, message: String },

    /// The worker task was cancelled before it returned.
    #[error("Worker task aborted: {0}")]
    Aborted(String),
}

/// What a worker did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker: String,
    pub items_processed: u64,
    pub outcomes: Stats,
}

impl WorkerReport {
    fn new(worker: &str) -> Self {
        Self {
            worker: worker.to_string(),
            items_processed: 0,
            outcomes: Stats::default(),
        }
    }

    fn record(&mut self, outcome: Outcome) {
        self.items_processed += 1;
        match outcome {
            Outcome::Success => self.outcomes.success += 1,
            Outcome::Invalid => self.outcomes.invalid += 1,
            Outcome::Failed => self.outcomes.failed += 1,
        }
    }
}

/// A single consumer of the work queue.
pub struct Worker<H: ItemHandler> {
    name: String,
    queue: Arc<WorkQueue<H::Payload>>,
    runner: Arc<StageRunner<H>>,
    stats: Arc<StatsAggregator>,
    events: EventSink,
    metrics: MetricsCollector,
}

impl<H: ItemHandler> Worker<H> {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<WorkQueue<H::Payload>>,
        runner: Arc<StageRunner<H>>,
        stats: Arc<StatsAggregator>,
        events: EventSink,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            runner,
            stats,
            events,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs until a sentinel is consumed.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the queue, limiter or tracker fails.
    pub async fn run(self) -> Result<WorkerReport, PoolError> {
        info!(worker = %self.name, "Worker started");
        self.metrics.inc_active_workers();
        let result = self.run_loop().await;
        self.metrics.dec_active_workers();

        match &result {
            Ok(report) => {
                info!(
                    worker = %self.name,
                    items_processed = report.items_processed,
                    "Worker stopped"
                );
                self.events.emit(PipelineEvent::WorkerStopped {
                    worker: self.name.clone(),
                    items_processed: report.items_processed,
                });
            }
            Err(e) => error!(worker = %self.name, error = %e, "Worker failed"),
        }
        result
    }

    async fn run_loop(&self) -> Result<WorkerReport, PoolError> {
        let mut report = WorkerReport::new(&self.name);

        loop {
            let entry = self.queue.get().await.map_err(|source| PoolError::Queue {
                worker: self.name.clone(),
                source,
            })?;

            match entry {
                QueueEntry::Sentinel => {
                    info!(worker = %self.name, "Stop signal received");
                    self.events.emit(PipelineEvent::SentinelReceived {
                        worker: self.name.clone(),
                    });
                    self.acknowledge(EntryKind::Sentinel)?;
                    return Ok(report);
                }
                QueueEntry::Item(item) => {
                    let outcome = self.process(item).await?;
                    report.record(outcome);
                }
            }
        }
    }

    async fn process(&self, item: WorkItem<H::Payload>) -> Result<Outcome, PoolError> {
        let started = Instant::now();
        let item = Arc::new(item);
        let item_id = item.id.clone();

        info!(worker = %self.name, item_id = %item_id, "Processing item");
        self.events.emit(PipelineEvent::ItemStarted {
            worker: self.name.clone(),
            item_id: item_id.clone(),
        });

        let result = AssertUnwindSafe(self.runner.run(item))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(ItemError::Panicked {
                    item_id: item_id.clone(),
                    message: panic_message(payload),
                })
            });

        let (outcome, fatal) = match result {
            Ok(_) => {
                info!(worker = %self.name, item_id = %item_id, "Item completed");
                (Outcome::Success, None)
            }
            Err(e) if e.is_fatal() => {
                error!(worker = %self.name, item_id = %item_id, error = %e, "Fatal item error");
                (Outcome::Failed, Some(e))
            }
            Err(e) => {
                warn!(
                    worker = %self.name,
                    item_id = %item_id,
                    outcome = %e.outcome(),
                    error = %e,
                    "Item did not complete"
                );
                self.events.emit(PipelineEvent::ItemFinished {
                    worker: self.name.clone(),
                    item_id: item_id.clone(),
                    outcome: e.outcome(),
                    error: Some(e.to_string()),
                });
                (e.outcome(), None)
            }
        };

        if fatal.is_none() {
            self.stats.increment(outcome).await;
            self.metrics
                .record_item(outcome, started.elapsed().as_secs_f64());
            if outcome == Outcome::Success {
                self.events.emit(PipelineEvent::ItemFinished {
                    worker: self.name.clone(),
                    item_id: item_id.clone(),
                    outcome,
                    error: None,
                });
            }
        }

        // Runs for every dequeued item, whatever the stages did.
        let acknowledged = self.acknowledge(EntryKind::Item);

        if let Some(err) = fatal {
            let worker = self.name.clone();
            return Err(match err {
                ItemError::Limiter(source) => PoolError::Limiter { worker, source },
                source => PoolError::Item { worker, source },
            });
        }
        acknowledged?;
        Ok(outcome)
    }

    fn acknowledge(&self, kind: EntryKind) -> Result<(), PoolError> {
        self.queue
            .tracker()
            .mark_acknowledged(kind)
            .map_err(|source| PoolError::Consistency {
                worker: self.name.clone(),
                source,
            })?;
        debug!(worker = %self.name, kind = %kind, "Entry acknowledged");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The set of running workers.
pub struct WorkerPool {
    tasks: JoinSet<Result<WorkerReport, PoolError>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Spawns `worker_count` workers named `worker-1` .. `worker-N`.
    ///
    /// Workers immediately wait on the queue.
    pub fn start<H: ItemHandler>(
        worker_count: usize,
        queue: Arc<WorkQueue<H::Payload>>,
        runner: Arc<StageRunner<H>>,
        stats: Arc<StatsAggregator>,
        events: EventSink,
    ) -> Self {
        let mut tasks = JoinSet::new();

        for i in 0..worker_count {
            let name = format!("worker-{}", i + 1);
            let worker = Worker::new(
                name.clone(),
                Arc::clone(&queue),
                Arc::clone(&runner),
                Arc::clone(&stats),
                events.clone(),
            );

            tasks.spawn(async move {
                AssertUnwindSafe(worker.run())
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(PoolError::Panicked {
                            worker: name,
                            message: panic_message(payload),
                        })
                    })
            });
        }

        info!(num_workers = worker_count, "Worker pool started");

        Self {
            tasks,
            worker_count,
        }
    }

    /// Waits for the next worker to exit.
    ///
    /// Returns `None` once every worker has been collected.
    pub async fn join_next(&mut self) -> Option<Result<WorkerReport, PoolError>> {
        let joined = self.tasks.join_next().await?;
        Some(joined.unwrap_or_else(|e| Err(PoolError::Aborted(e.to_string()))))
    }

    /// Cancels every worker still running.
    pub fn abort_all(&mut self) {
        if !self.tasks.is_empty() {
            warn!(remaining = self.tasks.len(), "Aborting remaining workers");
        }
        self.tasks.abort_all();
    }

    /// Number of workers not yet collected.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}

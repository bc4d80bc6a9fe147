//! Pipeline orchestrator.
//!
//! [`Pipeline::run`] wires the components together for one run:
//!
//! 1. start the worker pool (workers wait on the empty queue)
//! 2. run the producer: items, then one sentinel per worker
//! 3. wait until the completion tracker has drained
//! 4. verify every sentinel was acknowledged, then collect every worker
//! 5. read the final stats
//!
//! Worker tasks are watched during steps 2 and 3. A worker that fails or
//! panics aborts the run instead of leaving the drain wait blocked forever.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::scheduler::job::WorkItem;
use crate::scheduler::limiter::{ConcurrencyLimiter, LimiterError};
use crate::scheduler::offload::BlockingOffload;
use crate::scheduler::queue::{QueueError, WorkQueue};
use crate::scheduler::retry::RetryExecutor;
use crate::scheduler::stats::{Stats, StatsAggregator};
use crate::scheduler::tracker::{CompletionTracker, ConsistencyError};
use crate::scheduler::worker_pool::{PoolError, WorkerPool, WorkerReport};

use super::config::{ConfigError, PipelineConfig};
use super::events::{EventSink, PipelineEvent};
use super::producer::Producer;
use super::progress::{ProgressMonitor, ProgressSource};
use super::stages::{ItemHandler, StageRunner};

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The work queue failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The concurrency limiter failed.
    #[error("Limiter error: {0}")]
    Limiter(#[from] LimiterError),

    /// The admitted/acknowledged invariant was broken.
    #[error("Internal consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Worker '{worker}' panicked: {message}")]
    WorkerPanicked { worker: String, message: String },

    /// A worker stopped on an item error that cannot be contained.
    #[error("Worker '{worker}' failed: {reason}")]
    WorkerFailed { worker: String, reason: String },

    #[error("Worker task aborted: {0}")]
    WorkerAborted(String),

    /// Fewer workers terminated normally than were started.
    #[error("Expected {expected} workers to terminate, observed {terminated}")]
    WorkerCountMismatch { expected: usize, terminated: usize },
}

impl From<PoolError> for PipelineError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Queue { source, .. } => PipelineError::Queue(source),
            PoolError::Consistency { source, .. } => PipelineError::Consistency(source),
            PoolError::Limiter { source, .. } => PipelineError::Limiter(source),
            PoolError::Item { worker, source } => PipelineError::WorkerFailed {
                worker,
                reason: source.to_string(),
            },
            PoolError::Panicked { worker, message } => {
                PipelineError::WorkerPanicked { worker, message }
            }
            PoolError::Aborted(message) => PipelineError::WorkerAborted(message),
        }
    }
}

/// Outcome of a completed run.
///
/// `stats` is the result of the run; the other fields are diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: Stats,
    pub items_admitted: u64,
    pub sentinels_acknowledged: u64,
    pub workers: Vec<WorkerReport>,
    pub peak_calls_in_flight: usize,
}

impl PipelineReport {
    /// Wall-clock duration of the run in seconds.
    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// A configured pipeline for one kind of work item.
pub struct Pipeline<H: ItemHandler> {
    config: PipelineConfig,
    handler: Arc<H>,
    events: EventSink,
}

impl<H: ItemHandler> Pipeline<H> {
    pub fn new(config: PipelineConfig, handler: Arc<H>) -> Self {
        Self {
            config,
            handler,
            events: EventSink::disabled(),
        }
    }

    /// Sends the observability trail of every run to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the pipeline over a fixed list of items.
    pub async fn run_items(
        &self,
        items: Vec<WorkItem<H::Payload>>,
    ) -> Result<PipelineReport, PipelineError> {
        self.run(futures::stream::iter(items)).await
    }

    /// Runs the pipeline until every item of `items` has been processed and
    /// every worker has terminated.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` if the configuration is invalid or a
    /// coordination primitive fails. Per-item failures are counted in the
    /// report, never returned here.
    pub async fn run<S>(&self, items: S) -> Result<PipelineReport, PipelineError>
    where
        S: Stream<Item = WorkItem<H::Payload>> + Send,
    {
        self.config.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let worker_count = self.config.worker_count;

        info!(
            run_id = %run_id,
            workers = worker_count,
            queue_capacity = self.config.queue_capacity,
            call_concurrency = self.config.call_concurrency,
            call_timeout_ms = self.config.call_timeout.as_millis() as u64,
            max_retries = self.config.max_retries,
            "Pipeline starting"
        );

        let tracker = Arc::new(CompletionTracker::new(worker_count));
        let queue = Arc::new(WorkQueue::new(
            self.config.queue_capacity,
            Arc::clone(&tracker),
        ));
        let limiter = ConcurrencyLimiter::new(self.config.call_concurrency);
        let retry = RetryExecutor::new(self.config.retry_policy(), limiter.clone())
            .with_events(self.events.clone());
        let runner = Arc::new(StageRunner::new(
            Arc::clone(&self.handler),
            retry,
            BlockingOffload::new(),
            self.events.clone(),
        ));
        let stats = Arc::new(StatsAggregator::new());

        let mut pool = WorkerPool::start(
            worker_count,
            Arc::clone(&queue),
            runner,
            Arc::clone(&stats),
            self.events.clone(),
        );

        let monitor = self.config.progress_interval.map(|interval| {
            ProgressMonitor::start(
                ProgressSource::new(Arc::clone(&queue), limiter.clone()),
                interval,
            )
        });

        let producer = Producer::new(Arc::clone(&queue), worker_count)
            .with_ingest_interval(self.config.ingest_interval)
            .with_events(self.events.clone());

        let mut workers = Vec::with_capacity(worker_count);
        let supervised = self
            .supervise(&mut pool, &mut workers, &producer, items, &tracker)
            .await;

        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        let items_admitted = match supervised {
            Ok(admitted) => admitted,
            Err(e) => {
                pool.abort_all();
                error!(run_id = %run_id, error = %e, "Pipeline aborted");
                return Err(e);
            }
        };

        let stats = stats.snapshot().await;
        let counts = tracker.snapshot();

        info!(
            run_id = %run_id,
            success = stats.success,
            invalid = stats.invalid,
            failed = stats.failed,
            items_admitted = items_admitted,
            peak_calls_in_flight = limiter.peak_in_flight(),
            "Pipeline finished"
        );
        self.events
            .emit(PipelineEvent::PipelineCompleted { stats });

        Ok(PipelineReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            stats,
            items_admitted,
            sentinels_acknowledged: counts.sentinels_acknowledged,
            workers,
            peak_calls_in_flight: limiter.peak_in_flight(),
        })
    }

    async fn supervise<S>(
        &self,
        pool: &mut WorkerPool,
        workers: &mut Vec<WorkerReport>,
        producer: &Producer<H::Payload>,
        items: S,
        tracker: &CompletionTracker,
    ) -> Result<u64, PipelineError>
    where
        S: Stream<Item = WorkItem<H::Payload>> + Send,
    {
        let produce = producer.run(items);
        tokio::pin!(produce);
        let items_admitted = loop {
            tokio::select! {
                admitted = &mut produce => break admitted?,
                Some(exit) = pool.join_next() => collect_exit(exit, workers)?,
            }
        };

        info!(items_admitted = items_admitted, "Waiting for queue to drain");
        let drained = tracker.await_drained();
        tokio::pin!(drained);
        loop {
            tokio::select! {
                result = &mut drained => {
                    result?;
                    break;
                }
                Some(exit) = pool.join_next() => collect_exit(exit, workers)?,
            }
        }
        info!("All admitted entries acknowledged");
        self.events.emit(PipelineEvent::QueueDrained);

        tracker.verify_sentinels()?;

        info!("Waiting for workers to terminate");
        while let Some(exit) = pool.join_next().await {
            collect_exit(exit, workers)?;
        }

        if workers.len() != pool.worker_count() {
            return Err(PipelineError::WorkerCountMismatch {
                expected: pool.worker_count(),
                terminated: workers.len(),
            });
        }

        Ok(items_admitted)
    }
}

fn collect_exit(
    exit: Result<WorkerReport, PoolError>,
    workers: &mut Vec<WorkerReport>,
) -> Result<(), PipelineError> {
    let report = exit?;
    debug!(worker = %report.worker, "Worker collected");
    workers.push(report);
    Ok(())
}

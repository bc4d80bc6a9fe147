//! Observability trail emitted while the pipeline runs.
//!
//! Callers that want a per-attempt, per-stage record of a run pass an
//! unbounded sender to the pipeline. Emission never waits and silently stops
//! once the receiver is dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::scheduler::job::Outcome;
use crate::scheduler::stats::Stats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ItemAdmitted { item_id: String, queue_depth: usize },
    SentinelsAdmitted { count: usize },
    ItemStarted { worker: String, item_id: String },
    CallAttempt { item_id: String, attempt: u32 },
    CallTimedOut { item_id: String, attempt: u32 },
    CallFailed { item_id: String, attempt: u32, reason: String },
    BackoffScheduled { item_id: String, attempt: u32, delay_ms: u64 },
    OffloadCompleted { item_id: String },
    ItemFinished {
        worker: String,
        item_id: String,
        outcome: Outcome,
        error: Option<String>,
    },
    SentinelReceived { worker: String },
    WorkerStopped { worker: String, items_processed: u64 },
    QueueDrained,
    PipelineCompleted { stats: Stats },
}

/// Optional destination for [`PipelineEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn new(tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}

impl From<mpsc::UnboundedSender<PipelineEvent>> for EventSink {
    fn from(tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self::new(tx)
    }
}

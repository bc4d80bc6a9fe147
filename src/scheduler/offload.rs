//! Offloading of synchronous, blocking pipeline steps.
//!
//! Persistence writes and thumbnail generation block the calling thread.
//! [`BlockingOffload::run`] moves such a step onto tokio's blocking thread
//! pool so the runtime driving queue, limiter and timer operations keeps
//! making progress for every other worker.

use std::any::Any;
use std::time::Instant;

use thiserror::Error;
use tokio::task::JoinError;
use tracing::debug;

use crate::metrics::MetricsCollector;

/// Errors from an offloaded step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OffloadError {
    /// The step ran to completion and reported an error.
    #[error("{0}")]
    Failed(String),

    /// The step panicked on the blocking thread.
    #[error("blocking step panicked: {0}")]
    Panicked(String),

    /// The runtime cancelled the step before it finished.
    #[error("blocking step cancelled")]
    Cancelled,
}

impl From<JoinError> for OffloadError {
    fn from(err: JoinError) -> Self {
        if err.is_panic() {
            OffloadError::Panicked(panic_message(err.into_panic()))
        } else {
            OffloadError::Cancelled
        }
    }
}

/// Runs blocking closures on a dedicated execution context.
#[derive(Debug, Clone, Default)]
pub struct BlockingOffload {
    metrics: MetricsCollector,
}

impl BlockingOffload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes `step` on the blocking pool and returns its result to the
    /// calling task.
    ///
    /// # Errors
    ///
    /// Returns `OffloadError::Failed` with the step's own error, or
    /// `OffloadError::Panicked` if it panicked.
    pub async fn run<F, T>(&self, step: F) -> Result<T, OffloadError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        let result = tokio::task::spawn_blocking(step).await?;
        let elapsed = start.elapsed();
        self.metrics.record_offload(elapsed.as_secs_f64());
        debug!(elapsed_ms = elapsed.as_millis() as u64, "Blocking step finished");

        result.map_err(|e| OffloadError::Failed(format!("{:#}", e)))
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Outcome counters shared by all workers.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::job::Outcome;

/// Per-outcome item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub success: u64,
    pub invalid: u64,
    pub failed: u64,
}

impl Stats {
    pub fn get(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Success => self.success,
            Outcome::Invalid => self.invalid,
            Outcome::Failed => self.failed,
        }
    }

    /// Number of items classified so far.
    pub fn total(&self) -> u64 {
        self.success + self.invalid + self.failed
    }

    fn slot(&mut self, outcome: Outcome) -> &mut u64 {
        match outcome {
            Outcome::Success => &mut self.success,
            Outcome::Invalid => &mut self.invalid,
            Outcome::Failed => &mut self.failed,
        }
    }
}

/// Exclusive-access wrapper around [`Stats`].
///
/// Increments from concurrent workers never lose an update.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    inner: Mutex<Stats>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one to the counter for `outcome`.
    pub async fn increment(&self, outcome: Outcome) {
        let mut stats = self.inner.lock().await;
        *stats.slot(outcome) += 1;
    }

    /// Returns a copy of the current counts.
    pub async fn snapshot(&self) -> Stats {
        *self.inner.lock().await
    }
}

//! Completion tracking for admitted queue entries.
//!
//! The tracker counts entries admitted to the work queue (items and sentinels
//! alike) against acknowledgements from workers. The orchestrator waits on
//! [`CompletionTracker::await_drained`] before it waits for the worker tasks
//! themselves: "all work acknowledged" and "all workers returned" are two
//! separate signals.
//!
//! Any acknowledgement that would break the admitted/acknowledged balance is
//! a [`ConsistencyError`]. The first such error poisons the tracker: every
//! later call, and every pending drain wait, reports it.

use thiserror::Error;
use tokio::sync::watch;
use tracing::error;

use super::job::EntryKind;

/// Violations of the admitted/acknowledged invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    /// An acknowledgement arrived with nothing outstanding.
    #[error("Outstanding count would go negative (admitted={admitted}, acknowledged={acknowledged})")]
    NegativeOutstanding { admitted: u64, acknowledged: u64 },

    /// More sentinels were acknowledged than were admitted.
    #[error("Sentinel acknowledged twice ({admitted} sentinels admitted)")]
    SentinelOverAcknowledged { admitted: u64 },

    /// The producer admitted more sentinels than there are workers.
    #[error("Unexpected sentinel: only {expected} sentinels may be admitted")]
    UnexpectedSentinel { expected: u64 },

    /// The queue drained but some workers never received their sentinel.
    #[error("Queue drained with {acknowledged} of {expected} sentinels acknowledged")]
    MissingSentinels { expected: u64, acknowledged: u64 },

    /// The tracker's state channel closed while a drain wait was pending.
    #[error("Completion tracker closed")]
    Closed,
}

/// Point-in-time view of the tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    /// Entries admitted to the queue, sentinels included.
    pub admitted: u64,
    /// Entries acknowledged by workers, sentinels included.
    pub acknowledged: u64,
    /// Sentinels admitted to the queue.
    pub sentinels_admitted: u64,
    /// Sentinels acknowledged by workers.
    pub sentinels_acknowledged: u64,
}

impl TrackerSnapshot {
    /// Admitted entries still awaiting acknowledgement.
    pub fn outstanding(&self) -> u64 {
        self.admitted - self.acknowledged
    }

    /// Admitted work items, sentinels excluded.
    pub fn items_admitted(&self) -> u64 {
        self.admitted - self.sentinels_admitted
    }
}

#[derive(Debug, Clone, Default)]
struct TrackerState {
    counts: TrackerSnapshot,
    fault: Option<ConsistencyError>,
}

/// Counts outstanding queue entries and gates pipeline shutdown.
#[derive(Debug)]
pub struct CompletionTracker {
    state: watch::Sender<TrackerState>,
    expected_sentinels: u64,
}

impl CompletionTracker {
    /// Creates a tracker for a pool of `worker_count` workers, each of which
    /// must receive exactly one sentinel.
    pub fn new(worker_count: usize) -> Self {
        let (state, _) = watch::channel(TrackerState::default());
        Self {
            state,
            expected_sentinels: worker_count as u64,
        }
    }

    /// Records an entry about to be put on the queue.
    ///
    /// Must be called before the entry becomes visible to workers so an
    /// acknowledgement can never overtake its admission.
    pub fn mark_admitted(&self, kind: EntryKind) -> Result<(), ConsistencyError> {
        let expected = self.expected_sentinels;
        self.update(|state| {
            if kind == EntryKind::Sentinel {
                if state.counts.sentinels_admitted >= expected {
                    return Err(ConsistencyError::UnexpectedSentinel { expected });
                }
                state.counts.sentinels_admitted += 1;
            }
            state.counts.admitted += 1;
            Ok(())
        })
    }

    /// Records that processing of a dequeued entry has concluded.
    pub fn mark_acknowledged(&self, kind: EntryKind) -> Result<(), ConsistencyError> {
        self.update(|state| {
            let counts = &mut state.counts;
            if counts.acknowledged >= counts.admitted {
                return Err(ConsistencyError::NegativeOutstanding {
                    admitted: counts.admitted,
                    acknowledged: counts.acknowledged + 1,
                });
            }
            if kind == EntryKind::Sentinel {
                if counts.sentinels_acknowledged >= counts.sentinels_admitted {
                    return Err(ConsistencyError::SentinelOverAcknowledged {
                        admitted: counts.sentinels_admitted,
                    });
                }
                counts.sentinels_acknowledged += 1;
            }
            counts.acknowledged += 1;
            Ok(())
        })
    }

    /// Waits until every admitted entry has been acknowledged.
    ///
    /// Returns immediately when nothing is outstanding. Fails as soon as the
    /// tracker is poisoned, even if entries are still outstanding.
    pub async fn await_drained(&self) -> Result<(), ConsistencyError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.fault.is_some() || s.counts.outstanding() == 0)
            .await
            .map_err(|_| ConsistencyError::Closed)?;

        match &state.fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    /// Checks that every worker acknowledged exactly one sentinel.
    ///
    /// Only meaningful after [`await_drained`](Self::await_drained) returned.
    pub fn verify_sentinels(&self) -> Result<(), ConsistencyError> {
        let counts = self.snapshot();
        if counts.sentinels_acknowledged != self.expected_sentinels {
            return Err(ConsistencyError::MissingSentinels {
                expected: self.expected_sentinels,
                acknowledged: counts.sentinels_acknowledged,
            });
        }
        Ok(())
    }

    /// Returns the current counters.
    pub fn snapshot(&self) -> TrackerSnapshot {
        self.state.borrow().counts
    }

    /// Returns the number of admitted entries not yet acknowledged.
    pub fn outstanding(&self) -> u64 {
        self.snapshot().outstanding()
    }

    /// Returns the first consistency error, if any.
    pub fn fault(&self) -> Option<ConsistencyError> {
        self.state.borrow().fault.clone()
    }

    /// Number of sentinels the producer must admit.
    pub fn expected_sentinels(&self) -> u64 {
        self.expected_sentinels
    }

    fn update<F>(&self, apply: F) -> Result<(), ConsistencyError>
    where
        F: FnOnce(&mut TrackerState) -> Result<(), ConsistencyError>,
    {
        let mut result = Ok(());
        self.state.send_modify(|state| {
            if let Some(fault) = &state.fault {
                result = Err(fault.clone());
                return;
            }
            if let Err(e) = apply(state) {
                error!(error = %e, "Completion tracker consistency violation");
                state.fault = Some(e.clone());
                result = Err(e);
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_admit_and_acknowledge() {
        let tracker = CompletionTracker::new(1);
        tracker.mark_admitted(EntryKind::Item).unwrap();
        tracker.mark_admitted(EntryKind::Item).unwrap();
        tracker.mark_admitted(EntryKind::Sentinel).unwrap();
        assert_eq!(tracker.outstanding(), 3);

        tracker.mark_acknowledged(EntryKind::Item).unwrap();
        tracker.mark_acknowledged(EntryKind::Item).unwrap();
        tracker.mark_acknowledged(EntryKind::Sentinel).unwrap();

        let snap = tracker.snapshot();
        assert_eq!(snap.outstanding(), 0);
        assert_eq!(snap.items_admitted(), 2);
        assert_eq!(snap.sentinels_acknowledged, 1);
        assert!(tracker.verify_sentinels().is_ok());
    }

    #[test]
    fn test_extra_acknowledgement_is_fatal_and_poisons() {
        let tracker = CompletionTracker::new(1);
        tracker.mark_admitted(EntryKind::Item).unwrap();
        tracker.mark_acknowledged(EntryKind::Item).unwrap();

        let err = tracker.mark_acknowledged(EntryKind::Item).unwrap_err();
        assert_eq!(
            err,
            ConsistencyError::NegativeOutstanding {
                admitted: 1,
                acknowledged: 2
            }
        );
        // Counts are never clamped or rewritten after the violation.
        assert_eq!(tracker.snapshot().acknowledged, 1);
        assert_eq!(tracker.fault(), Some(err.clone()));
        assert_eq!(tracker.mark_admitted(EntryKind::Item), Err(err));
    }

    #[test]
    fn test_sentinel_acknowledged_twice() {
        let tracker = CompletionTracker::new(2);
        tracker.mark_admitted(EntryKind::Item).unwrap();
        tracker.mark_admitted(EntryKind::Sentinel).unwrap();
        tracker.mark_acknowledged(EntryKind::Sentinel).unwrap();

        let err = tracker.mark_acknowledged(EntryKind::Sentinel).unwrap_err();
        assert_eq!(err, ConsistencyError::SentinelOverAcknowledged { admitted: 1 });
    }

    #[test]
    fn test_unexpected_sentinel_rejected_at_admission() {
        let tracker = CompletionTracker::new(1);
        tracker.mark_admitted(EntryKind::Sentinel).unwrap();
        let err = tracker.mark_admitted(EntryKind::Sentinel).unwrap_err();
        assert_eq!(err, ConsistencyError::UnexpectedSentinel { expected: 1 });
    }

    #[test]
    fn test_verify_sentinels_reports_missing() {
        let tracker = CompletionTracker::new(3);
        tracker.mark_admitted(EntryKind::Sentinel).unwrap();
        tracker.mark_acknowledged(EntryKind::Sentinel).unwrap();
        assert_eq!(
            tracker.verify_sentinels(),
            Err(ConsistencyError::MissingSentinels {
                expected: 3,
                acknowledged: 1
            })
        );
    }

    #[tokio::test]
    async fn test_await_drained_returns_immediately_when_idle() {
        let tracker = CompletionTracker::new(0);
        tokio::time::timeout(Duration::from_millis(100), tracker.await_drained())
            .await
            .expect("drain wait should not block")
            .unwrap();
    }

    #[tokio::test]
    async fn test_await_drained_waits_for_last_acknowledgement() {
        let tracker = Arc::new(CompletionTracker::new(0));
        for _ in 0..3 {
            tracker.mark_admitted(EntryKind::Item).unwrap();
        }

        let acker = Arc::clone(&tracker);
        let handle = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert!(acker.outstanding() > 0);
                acker.mark_acknowledged(EntryKind::Item).unwrap();
            }
        });

        tracker.await_drained().await.unwrap();
        assert_eq!(tracker.outstanding(), 0);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_await_drained_surfaces_fault() {
        let tracker = Arc::new(CompletionTracker::new(1));
        tracker.mark_admitted(EntryKind::Item).unwrap();

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.await_drained().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.mark_acknowledged(EntryKind::Sentinel).unwrap_err();

        let result = waiter.await.unwrap();
        assert_eq!(
            result,
            Err(ConsistencyError::SentinelOverAcknowledged { admitted: 0 })
        );
    }
}

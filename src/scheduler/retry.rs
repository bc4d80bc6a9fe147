//! Timeout and retry protection around external call attempts.
//!
//! Each attempt runs under a [`ConcurrencyLimiter`] permit and a per-attempt
//! deadline. Timeouts and transient call errors are retried after a fixed
//! backoff, during which no permit is held. A rejected call is not retried.
//! Attempts for one item are strictly sequential.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{AttemptFailure, CallError, ItemError};
use crate::metrics::MetricsCollector;
use crate::pipeline::events::{EventSink, PipelineEvent};

use super::limiter::ConcurrencyLimiter;

/// Default per-attempt deadline.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(4);

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default fixed delay between attempts.
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Timeout and retry settings for external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Retries after the first attempt (`max_retries + 1` attempts total).
    pub max_retries: u32,
    /// Delay between a failed attempt and the next one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_retries: u32, backoff: Duration) -> Self {
        Self {
            timeout,
            max_retries,
            backoff,
        }
    }

    /// Total number of attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Runs external calls under the limiter with timeout and retry.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    limiter: ConcurrencyLimiter,
    events: EventSink,
    metrics: MetricsCollector,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, limiter: ConcurrencyLimiter) -> Self {
        Self {
            policy,
            limiter,
            events: EventSink::disabled(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the sink receiving per-attempt events.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Calls `call` with attempt numbers starting at 1 until it succeeds,
    /// is rejected, or all attempts are used.
    ///
    /// # Errors
    ///
    /// - `ItemError::RetriesExhausted` after `max_retries + 1` failed attempts
    /// - `ItemError::CallRejected` on a non-transient call error
    /// - `ItemError::Limiter` if a permit cannot be acquired
    pub async fn execute<T, F, Fut>(&self, item_id: &str, mut call: F) -> Result<T, ItemError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            let permit = self.limiter.acquire().await?;
            info!(item_id = %item_id, attempt = attempt, "Calling external service");
            self.events.emit(PipelineEvent::CallAttempt {
                item_id: item_id.to_string(),
                attempt,
            });

            let started = Instant::now();
            let result = tokio::time::timeout(self.policy.timeout, call(attempt)).await;
            permit.release();
            let latency = started.elapsed().as_secs_f64();

            let failure = match result {
                Ok(Ok(value)) => {
                    self.metrics.record_call_attempt("ok", latency);
                    return Ok(value);
                }
                Ok(Err(CallError::Rejected(reason))) => {
                    warn!(item_id = %item_id, attempt = attempt, reason = %reason, "External call rejected");
                    self.metrics.record_call_attempt("rejected", latency);
                    self.events.emit(PipelineEvent::CallFailed {
                        item_id: item_id.to_string(),
                        attempt,
                        reason: reason.clone(),
                    });
                    return Err(ItemError::CallRejected {
                        item_id: item_id.to_string(),
                        reason,
                    });
                }
                Ok(Err(err)) => {
                    warn!(item_id = %item_id, attempt = attempt, reason = %err, "External call failed");
                    self.metrics.record_call_attempt("error", latency);
                    self.events.emit(PipelineEvent::CallFailed {
                        item_id: item_id.to_string(),
                        attempt,
                        reason: err.to_string(),
                    });
                    AttemptFailure::Call(err)
                }
                Err(_) => {
                    warn!(
                        item_id = %item_id,
                        attempt = attempt,
                        timeout_ms = self.policy.timeout.as_millis() as u64,
                        "External call timed out"
                    );
                    self.metrics.record_call_attempt("timeout", latency);
                    self.events.emit(PipelineEvent::CallTimedOut {
                        item_id: item_id.to_string(),
                        attempt,
                    });
                    AttemptFailure::TimedOut(self.policy.timeout)
                }
            };

            if attempt >= max_attempts {
                return Err(ItemError::RetriesExhausted {
                    item_id: item_id.to_string(),
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay_ms = self.policy.backoff.as_millis() as u64;
            info!(item_id = %item_id, attempt = attempt, delay_ms = delay_ms, "Backing off before retry");
            self.events.emit(PipelineEvent::BackoffScheduled {
                item_id: item_id.to_string(),
                attempt,
                delay_ms,
            });
            self.metrics.record_backoff();
            tokio::time::sleep(self.policy.backoff).await;
            attempt += 1;
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn executor(
        limit: usize,
        policy: RetryPolicy,
    ) -> (RetryExecutor, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor =
            RetryExecutor::new(policy, ConcurrencyLimiter::new(limit)).with_events(tx.into());
        (executor, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn count_backoffs(events: &[PipelineEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::BackoffScheduled { .. }))
            .count()
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(40),
            max_retries,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(4));
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff, Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 3);
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let (executor, mut rx) = executor(1, fast_policy(2));
        let value = executor
            .execute("ORD-1001", |_| async { Ok::<_, CallError>(95) })
            .await
            .unwrap();
        assert_eq!(value, 95);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(count_backoffs(&events), 0);
    }

    #[tokio::test]
    async fn test_always_failing_call_makes_r_plus_one_attempts() {
        let (executor, mut rx) = executor(1, fast_policy(2));
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&attempts);
        let started = Instant::now();
        let err = executor
            .execute("ORD-9999", move |attempt| {
                seen.lock().unwrap().push(attempt);
                async { Err::<(), _>(CallError::Transient("temporary upstream error".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
        match err {
            ItemError::RetriesExhausted {
                item_id,
                attempts,
                last,
            } => {
                assert_eq!(item_id, "ORD-9999");
                assert_eq!(attempts, 3);
                assert!(matches!(last, AttemptFailure::Call(CallError::Transient(_))));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Backoff between attempts, never after the last one.
        let events = drain(&mut rx);
        assert_eq!(count_backoffs(&events), 2);
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::CallFailed { attempt: 3, .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_timeouts_then_success() {
        let (executor, mut rx) = executor(1, fast_policy(2));
        let value = executor
            .execute("ORD-1005", |attempt| async move {
                if attempt < 3 {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                }
                Ok::<_, CallError>(attempt)
            })
            .await
            .unwrap();
        assert_eq!(value, 3);

        let events = drain(&mut rx);
        let attempts = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::CallAttempt { .. }))
            .count();
        let timeouts = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::CallTimedOut { .. }))
            .count();
        assert_eq!(attempts, 3);
        assert_eq!(timeouts, 2);
        assert_eq!(count_backoffs(&events), 2);
    }

    #[tokio::test]
    async fn test_rejected_call_is_not_retried() {
        let (executor, mut rx) = executor(1, fast_policy(5));
        let err = executor
            .execute("IMG-404", |_| async {
                Err::<(), _>(CallError::Rejected("unsupported format".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::CallRejected { .. }));
        assert_eq!(count_backoffs(&drain(&mut rx)), 0);
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let (executor, _rx) = executor(1, fast_policy(0));
        let err = executor
            .execute("ORD-1", |_| async {
                Err::<(), _>(CallError::Transient("busy".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::RetriesExhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_permit_not_held_during_backoff() {
        let policy = RetryPolicy::new(
            Duration::from_millis(50),
            1,
            Duration::from_millis(200),
        );
        let (executor, _rx) = executor(1, policy);
        let limiter = executor.limiter().clone();

        let failing = tokio::spawn(async move {
            executor
                .execute("ORD-1003", |_| async {
                    Err::<(), _>(CallError::Transient("temporary upstream error".into()))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(limiter.in_flight(), 0);
        let permit = tokio::time::timeout(Duration::from_millis(20), limiter.acquire())
            .await
            .expect("permit should be free during backoff")
            .unwrap();
        permit.release();

        assert!(failing.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_closed_limiter_is_fatal() {
        let (executor, _rx) = executor(1, fast_policy(2));
        executor.limiter().close();
        let err = executor
            .execute("ORD-1", |_| async { Ok::<_, CallError>(()) })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}

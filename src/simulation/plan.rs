//! Attempt-indexed canned responses for the simulated call services.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// What the simulated service does on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedResponse {
    /// Answer after the normal latency.
    Ok,
    /// Answer only after the caller's deadline has passed.
    Timeout,
    /// Fail with a transient error.
    Error,
}

/// Responses for successive attempts of one item.
///
/// Attempts past the end reuse the last entry. An empty plan always answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPlan(Vec<PlannedResponse>);

impl CallPlan {
    pub fn new(responses: Vec<PlannedResponse>) -> Self {
        Self(responses)
    }

    /// Response for `attempt`, counting from 1.
    pub fn response_for(&self, attempt: u32) -> PlannedResponse {
        let index = attempt.saturating_sub(1) as usize;
        self.0
            .get(index)
            .or_else(|| self.0.last())
            .copied()
            .unwrap_or(PlannedResponse::Ok)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<PlannedResponse>> for CallPlan {
    fn from(responses: Vec<PlannedResponse>) -> Self {
        Self::new(responses)
    }
}

/// Simulated latencies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimTimings {
    /// Latency of a successful call.
    pub ok_latency: Duration,
    /// Latency before a transient error is raised.
    pub error_latency: Duration,
    /// How far past the call timeout a `Timeout` response answers.
    pub timeout_overshoot: Duration,
    /// Duration of the blocking step.
    pub blocking: Duration,
    /// Duration of the final step.
    pub finalize: Duration,
}

impl SimTimings {
    /// No simulated latency at all.
    pub const ZERO: SimTimings = SimTimings {
        ok_latency: Duration::ZERO,
        error_latency: Duration::ZERO,
        timeout_overshoot: Duration::ZERO,
        blocking: Duration::ZERO,
        finalize: Duration::ZERO,
    };

    /// Multiplies every latency by `factor`, saturating at `Duration::MAX`.
    pub fn scaled(&self, factor: f64) -> Self {
        let factor = factor.max(0.0);
        let scale = |d: Duration| scale_duration(d, factor).unwrap_or(Duration::MAX);
        Self {
            ok_latency: scale(self.ok_latency),
            error_latency: scale(self.error_latency),
            timeout_overshoot: scale(self.timeout_overshoot),
            blocking: scale(self.blocking),
            finalize: scale(self.finalize),
        }
    }

    /// Like [`scaled`](Self::scaled), but `None` when `factor` is negative,
    /// not finite, or pushes a latency past `Duration::MAX`.
    pub fn checked_scaled(&self, factor: f64) -> Option<Self> {
        Some(Self {
            ok_latency: scale_duration(self.ok_latency, factor)?,
            error_latency: scale_duration(self.error_latency, factor)?,
            timeout_overshoot: scale_duration(self.timeout_overshoot, factor)?,
            blocking: scale_duration(self.blocking, factor)?,
            finalize: scale_duration(self.finalize, factor)?,
        })
    }
}

/// `duration * factor`, or `None` if the product is not a valid `Duration`.
pub fn scale_duration(duration: Duration, factor: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).ok()
}

/// Plan-driven stand-in for an external call service.
#[derive(Debug)]
pub struct SimulatedService {
    plans: HashMap<String, CallPlan>,
    timings: SimTimings,
    call_timeout: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

impl SimulatedService {
    /// `call_timeout` must match the pipeline's per-attempt deadline so that
    /// `Timeout` responses really exceed it.
    pub fn new(timings: SimTimings, call_timeout: Duration) -> Self {
        Self {
            plans: HashMap::new(),
            timings,
            call_timeout,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_plan(&mut self, item_id: impl Into<String>, plan: CallPlan) {
        self.plans.insert(item_id.into(), plan);
    }

    pub fn plan(&self, item_id: &str) -> Option<&CallPlan> {
        self.plans.get(item_id)
    }

    pub fn timings(&self) -> &SimTimings {
        &self.timings
    }

    /// Plays the planned response for `attempt` of `item_id`.
    ///
    /// `answer` builds the successful result; it is also used for the late
    /// answer of a `Timeout` response, which the caller has already abandoned.
    pub async fn respond<T, F>(
        &self,
        item_id: &str,
        attempt: u32,
        transient_error: &str,
        answer: F,
    ) -> Result<T, CallError>
    where
        F: FnOnce() -> T,
    {
        self.record_attempt(item_id);
        let response = self
            .plans
            .get(item_id)
            .map(|plan| plan.response_for(attempt))
            .unwrap_or(PlannedResponse::Ok);

        match response {
            PlannedResponse::Ok => {
                tokio::time::sleep(self.timings.ok_latency).await;
                Ok(answer())
            }
            PlannedResponse::Timeout => {
                let late = self.call_timeout.saturating_add(self.timings.timeout_overshoot);
                tokio::time::sleep(late).await;
                Ok(answer())
            }
            PlannedResponse::Error => {
                tokio::time::sleep(self.timings.error_latency).await;
                Err(CallError::Transient(transient_error.to_string()))
            }
        }
    }

    /// Number of calls made for `item_id` so far.
    pub fn attempts(&self, item_id: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        attempts.get(item_id).copied().unwrap_or(0)
    }

    fn record_attempt(&self, item_id: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        *attempts.entry(item_id.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use PlannedResponse::*;

    #[test]
    fn test_plan_reuses_last_entry() {
        let plan = CallPlan::new(vec![Timeout, Error, Ok]);
        assert_eq!(plan.response_for(1), Timeout);
        assert_eq!(plan.response_for(2), Error);
        assert_eq!(plan.response_for(3), Ok);
        assert_eq!(plan.response_for(7), Ok);

        let stuck = CallPlan::new(vec![Ok, Timeout]);
        assert_eq!(stuck.response_for(10), Timeout);
    }

    #[test]
    fn test_empty_plan_answers() {
        let plan = CallPlan::default();
        assert!(plan.is_empty());
        assert_eq!(plan.response_for(1), Ok);
    }

    #[test]
    fn test_scaled_timings() {
        let timings = SimTimings {
            ok_latency: Duration::from_secs(2),
            error_latency: Duration::from_secs(1),
            timeout_overshoot: Duration::from_secs(3),
            blocking: Duration::from_millis(1500),
            finalize: Duration::ZERO,
        };
        let fast = timings.scaled(0.5);
        assert_eq!(fast.ok_latency, Duration::from_secs(1));
        assert_eq!(fast.timeout_overshoot, Duration::from_millis(1500));
        assert_eq!(fast.blocking, Duration::from_millis(750));
        assert_eq!(timings.scaled(-1.0), SimTimings::ZERO);
    }

    #[test]
    fn test_huge_scale_does_not_overflow() {
        let timings = SimTimings {
            ok_latency: Duration::from_secs(2),
            ..SimTimings::ZERO
        };
        assert_eq!(timings.scaled(1e20).ok_latency, Duration::MAX);
        assert_eq!(timings.scaled(1e20).blocking, Duration::ZERO);
        assert!(timings.checked_scaled(1e20).is_none());
        assert!(timings.checked_scaled(f64::NAN).is_none());
        assert!(timings.checked_scaled(-1.0).is_none());
        assert_eq!(
            timings.checked_scaled(0.5).map(|t| t.ok_latency),
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn test_service_follows_plan() {
        let mut service = SimulatedService::new(SimTimings::ZERO, Duration::from_millis(10));
        service.set_plan("ORD-1003", CallPlan::new(vec![Error, Ok]));

        let first = service.respond("ORD-1003", 1, "temporary upstream error", || 95).await;
        assert_eq!(
            first,
            Err(CallError::Transient("temporary upstream error".to_string()))
        );
        let second = service.respond("ORD-1003", 2, "temporary upstream error", || 95).await;
        assert_eq!(second, Result::Ok(95));
        assert_eq!(service.attempts("ORD-1003"), 2);
        assert_eq!(service.attempts("unknown"), 0);
    }

    #[tokio::test]
    async fn test_attempts_survive_poisoned_lock() {
        let service = Arc::new(SimulatedService::new(SimTimings::ZERO, Duration::from_millis(10)));
        service.respond("ORD-1", 1, "unused", || ()).await.unwrap();

        let poisoner = Arc::clone(&service);
        let joined = std::thread::spawn(move || {
            let _guard = poisoner.attempts.lock().unwrap();
            panic!("poison the attempt counter");
        })
        .join();
        assert!(joined.is_err());
        assert!(service.attempts.is_poisoned());

        service.respond("ORD-1", 2, "unused", || ()).await.unwrap();
        assert_eq!(service.attempts("ORD-1"), 2);
    }

    #[tokio::test]
    async fn test_timeout_response_outlasts_deadline() {
        let mut service = SimulatedService::new(SimTimings::ZERO, Duration::from_millis(30));
        service.set_plan("slow", CallPlan::new(vec![Timeout]));

        let result = tokio::time::timeout(
            Duration::from_millis(30),
            service.respond("slow", 1, "unused", || ()),
        )
        .await;
        assert!(result.is_err());
    }
}

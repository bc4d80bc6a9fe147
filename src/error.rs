//! Error types for per-item pipeline processing.
//!
//! Defines the failure taxonomy a single work item can hit on its way
//! through the stage sequence:
//! - Validation of the item itself
//! - External call attempts (timeouts, transient and permanent errors)
//! - Retry exhaustion
//! - The offloaded blocking step and the final step
//!
//! Per-item errors are contained inside the worker loop: they become a
//! stats classification and never reach the orchestrator. The one exception
//! is [`ItemError::Limiter`], which reports a broken coordination primitive.
//! Fatal run-level errors live in [`crate::pipeline::PipelineError`].

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::job::Outcome;
use crate::scheduler::limiter::LimiterError;
use crate::scheduler::offload::OffloadError;

/// An item-local precondition was violated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Errors raised by the external call service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// A temporary upstream condition; the attempt may be retried.
    #[error("Transient error: {0}")]
    Transient(String),

    /// The service refused the item; retrying will not help.
    #[error("Call rejected: {0}")]
    Rejected(String),
}

impl CallError {
    /// Returns true if another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Transient(_))
    }
}

/// Why a single call attempt did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// The attempt exceeded its deadline and was abandoned.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The external call returned an error.
    #[error("{0}")]
    Call(CallError),
}

/// Errors that end the stage sequence of a single work item.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("Invalid item: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Call failed after {attempts} attempts for '{item_id}': {last}")]
    RetriesExhausted {
        item_id: String,
        attempts: u32,
        last: AttemptFailure,
    },

    #[error("Call rejected for '{item_id}': {reason}")]
    CallRejected { item_id: String, reason: String },

    #[error("Blocking step failed for '{item_id}': {source}")]
    Offload {
        item_id: String,
        #[source]
        source: OffloadError,
    },

    #[error("Final step failed for '{item_id}': {reason}")]
    FinalStep { item_id: String, reason: String },

    #[error("Stage panicked for '{item_id}': {message}")]
    Panicked { item_id: String, message: String },

    /// The concurrency limiter itself failed; fatal to the run.
    #[error("Limiter error: {0}")]
    Limiter(#[from] LimiterError),
}

impl ItemError {
    /// Returns the stats classification for this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            ItemError::Invalid(_) => Outcome::Invalid,
            _ => Outcome::Failed,
        }
    }

    /// Returns true if the error must abort the whole run instead of being
    /// recorded against the item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ItemError::Limiter(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        let invalid = ItemError::Invalid(ValidationError::new("file too large: 31MB"));
        assert_eq!(invalid.outcome(), Outcome::Invalid);
        assert!(!invalid.is_fatal());

        let exhausted = ItemError::RetriesExhausted {
            item_id: "ORD-1005".to_string(),
            attempts: 3,
            last: AttemptFailure::TimedOut(Duration::from_secs(4)),
        };
        assert_eq!(exhausted.outcome(), Outcome::Failed);

        let offload = ItemError::Offload {
            item_id: "IMG-001".to_string(),
            source: OffloadError::Failed("disk full".to_string()),
        };
        assert_eq!(offload.outcome(), Outcome::Failed);

        let limiter = ItemError::Limiter(LimiterError::Closed);
        assert_eq!(limiter.outcome(), Outcome::Failed);
        assert!(limiter.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ItemError::RetriesExhausted {
            item_id: "ORD-1002".to_string(),
            attempts: 3,
            last: AttemptFailure::Call(CallError::Transient("upstream busy".to_string())),
        };
        let text = err.to_string();
        assert!(text.contains("ORD-1002"));
        assert!(text.contains("3 attempts"));
        assert!(text.contains("upstream busy"));

        let err = ItemError::Invalid(ValidationError::new("amount must be positive"));
        assert!(err.to_string().contains("amount must be positive"));
    }

    #[test]
    fn test_call_error_transience() {
        assert!(CallError::Transient("x".into()).is_transient());
        assert!(!CallError::Rejected("x".into()).is_transient());
    }
}

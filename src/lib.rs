//! orderflow: bounded async work pipeline.
//!
//! Work items flow from a producer through a backpressured queue into a
//! fixed pool of workers. Each worker validates an item, sends it to an
//! external call capped by a shared concurrency limit with per-attempt
//! timeout and retry, runs a blocking step off the async runtime and
//! finalizes the result. A completion tracker gates shutdown on every
//! admitted entry being acknowledged exactly once.

// Core modules
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod simulation;

// Re-export commonly used types
pub use error::{AttemptFailure, CallError, ItemError, ValidationError};
pub use pipeline::{
    ConfigError, ItemHandler, Pipeline, PipelineConfig, PipelineError, PipelineEvent,
    PipelineReport,
};
pub use scheduler::{Outcome, Stats, WorkItem};

//! Pipeline orchestration on top of the scheduler primitives.
//!
//! # Architecture
//!
//! - **Config**: worker count, queue capacity, call limits and pacing
//! - **Stages**: the [`ItemHandler`] seam and the per-item stage runner
//! - **Producer**: admits items, then one sentinel per worker
//! - **Events**: optional per-attempt, per-stage observability trail
//! - **Progress**: periodic progress log lines
//! - **Orchestrator**: runs everything and produces a [`PipelineReport`]
//!
//! # Run Flow
//!
//! 1. **Start**: workers are spawned and wait on the empty queue
//! 2. **Ingest**: the producer admits items, waiting while the queue is full
//! 3. **Process**: each item is validated, called (limited, with timeout and
//!    retry), passed through the blocking step and finalized
//! 4. **Stop**: one sentinel per worker follows the last item
//! 5. **Drain**: the orchestrator waits until every admitted entry has been
//!    acknowledged, then separately until every worker has returned
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use orderflow::pipeline::{Pipeline, PipelineConfig};
//! use orderflow::simulation::orders::{sample_orders, ORDER_TIMINGS};
//!
//! let config = PipelineConfig::new()
//!     .with_worker_count(3)
//!     .with_queue_capacity(4)
//!     .with_call_concurrency(2)
//!     .with_call_timeout(Duration::from_secs(4));
//!
//! let (handler, items) = sample_orders(ORDER_TIMINGS, config.call_timeout);
//! let report = Pipeline::new(config, Arc::new(handler)).run_items(items).await?;
//! println!("{:?}", report.stats);
//! ```

pub mod config;
pub mod events;
pub mod orchestrator;
pub mod producer;
pub mod progress;
pub mod stages;

pub use config::{ConfigError, PipelineConfig};
pub use events::{EventSink, PipelineEvent};
pub use orchestrator::{Pipeline, PipelineError, PipelineReport};
pub use producer::Producer;
pub use progress::{ProgressMonitor, ProgressSnapshot, ProgressSource};
pub use stages::{ItemHandler, StageRunner};

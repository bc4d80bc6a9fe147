//! In-process coordination primitives for the work pipeline.
//!
//! - **WorkQueue**: bounded FIFO of work items and termination sentinels
//! - **ConcurrencyLimiter**: caps external call attempts in flight
//! - **RetryExecutor**: per-attempt timeout with fixed-backoff retry
//! - **BlockingOffload**: runs blocking steps off the async runtime
//! - **WorkerPool**: fixed set of workers draining the queue
//! - **CompletionTracker**: admitted vs. acknowledged entries, gates shutdown
//! - **StatsAggregator**: per-outcome counters
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      └──────┬───────┘
//!                             │ put (waits while full)
//!                      ┌──────▼───────┐       ┌───────────────────┐
//!                      │  WorkQueue   │──────▶│ CompletionTracker │
//!                      └──────┬───────┘ admit └─────────▲─────────┘
//!                             │ get                     │ acknowledge
//!         ┌───────────────────┼───────────────────┐     │
//!         ▼                   ▼                   ▼     │
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐│
//!    │ Worker 1│         │ Worker 2│         │ Worker N├┘
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──────────┬────────┴───────────────────┘
//!                    ▼
//!     ConcurrencyLimiter ─▶ RetryExecutor ─▶ BlockingOffload ─▶ StatsAggregator
//! ```
//!
//! # Guarantees
//!
//! - **FIFO**: entries leave the queue in admission order
//! - **Exactly one acknowledgement** per admitted entry, even when a stage panics
//! - **Bounded calls**: never more than the limiter's permits in flight; no
//!   permit is held during a retry backoff
//! - **Fail loudly**: an acknowledgement without a matching admission poisons
//!   the tracker and aborts the run

pub mod job;
pub mod limiter;
pub mod offload;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod tracker;
pub mod worker_pool;

pub use job::{EntryKind, Outcome, QueueEntry, WorkItem};
pub use limiter::{ConcurrencyLimiter, LimiterError, LimiterPermit};
pub use offload::{BlockingOffload, OffloadError};
pub use queue::{QueueError, WorkQueue};
pub use retry::{RetryExecutor, RetryPolicy};
pub use stats::{Stats, StatsAggregator};
pub use tracker::{CompletionTracker, ConsistencyError, TrackerSnapshot};
pub use worker_pool::{PoolError, Worker, WorkerPool, WorkerReport};

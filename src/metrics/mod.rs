//! Metrics module for Prometheus-based monitoring.
//!
//! Covers the work queue, call attempts and their retries, blocking offload
//! and per-item outcomes.
//!
//! # Example
//!
//! ```ignore
//! use orderflow::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_call_attempt("ok", 0.8);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics, PipelineMetrics};

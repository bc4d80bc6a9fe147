//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::metrics;
use crate::scheduler::job::Outcome;

/// Records pipeline metrics.
///
/// Every method silently does nothing until `init_metrics()` has been called,
/// so components can hold a collector unconditionally.
///
/// # Example
///
/// ```ignore
/// use orderflow::metrics::{init_metrics, MetricsCollector};
/// use orderflow::scheduler::Outcome;
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_item(Outcome::Success, 2.4);
/// collector.record_call_attempt("timeout", 4.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished work item and how long it took.
    pub fn record_item(&self, outcome: Outcome, duration_secs: f64) {
        if let Some(m) = metrics() {
            m.items_total.with_label_values(&[outcome.as_str()]).inc();
            m.item_duration.observe(duration_secs);
        }

        tracing::trace!(
            outcome = %outcome,
            duration_secs = duration_secs,
            "Recorded item metric"
        );
    }

    /// Record one external call attempt.
    ///
    /// # Arguments
    ///
    /// * `result` - One of "ok", "timeout", "error" or "rejected"
    /// * `latency_secs` - Time the attempt held its limiter permit
    pub fn record_call_attempt(&self, result: &str, latency_secs: f64) {
        if let Some(m) = metrics() {
            m.call_attempts_total.with_label_values(&[result]).inc();
            m.call_latency.observe(latency_secs);
        }
    }

    pub fn record_backoff(&self) {
        if let Some(m) = metrics() {
            m.retry_backoffs_total.inc();
        }
    }

    pub fn record_offload(&self, duration_secs: f64) {
        if let Some(m) = metrics() {
            m.offload_duration.observe(duration_secs);
        }
    }

    pub fn set_calls_in_flight(&self, count: usize) {
        if let Some(m) = metrics() {
            m.calls_in_flight.set(count as f64);
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(m) = metrics() {
            m.queue_depth.set(depth as f64);
        }
    }

    pub fn inc_active_workers(&self) {
        if let Some(m) = metrics() {
            m.active_workers.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(m) = metrics() {
            m.active_workers.dec();
        }
    }
}

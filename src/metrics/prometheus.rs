//! Prometheus metrics registration and export.
//!
//! All metrics live in a dedicated registry created by [`init_metrics`].
//! Until then every recording call is a no-op.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// The orderflow registry and every metric registered in it.
///
/// Published as one unit so a recorder never sees metrics from one
/// [`init_metrics`] call and the registry from another.
pub struct PipelineMetrics {
    pub registry: Registry,
    /// Items finished, labeled by outcome (success/invalid/failed).
    pub items_total: CounterVec,
    /// Wall time from dequeue to stats update, in seconds.
    pub item_duration: Histogram,
    /// External call attempts, labeled by result (ok/timeout/error/rejected).
    pub call_attempts_total: CounterVec,
    /// Latency of a single call attempt, in seconds.
    pub call_latency: Histogram,
    /// Call attempts currently holding a limiter permit.
    pub calls_in_flight: Gauge,
    /// Backoff sleeps taken between attempts.
    pub retry_backoffs_total: Counter,
    /// Entries (items and sentinels) waiting in the work queue.
    pub queue_depth: Gauge,
    /// Workers that have started and not yet stopped.
    pub active_workers: Gauge,
    /// Duration of offloaded blocking steps, in seconds.
    pub offload_duration: Histogram,
}

static METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

/// The initialized metrics, or `None` before [`init_metrics`].
pub fn metrics() -> Option<&'static PipelineMetrics> {
    METRICS.get()
}

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once keeps the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid or a
/// name is registered twice.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let items_total = CounterVec::new(
        Opts::new("orderflow_items_total", "Work items finished by outcome"),
        &["outcome"],
    )?;

    let item_duration = Histogram::with_opts(
        HistogramOpts::new(
            "orderflow_item_duration_seconds",
            "Time from dequeue to completion of a work item",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )?;

    let call_attempts_total = CounterVec::new(
        Opts::new("orderflow_call_attempts_total", "External call attempts by result"),
        &["result"],
    )?;

    let call_latency = Histogram::with_opts(
        HistogramOpts::new(
            "orderflow_call_latency_seconds",
            "Latency of a single external call attempt",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 4.0, 8.0]),
    )?;

    let calls_in_flight = Gauge::new(
        "orderflow_calls_in_flight",
        "External call attempts currently holding a limiter permit",
    )?;

    let retry_backoffs_total = Counter::new(
        "orderflow_retry_backoffs_total",
        "Backoff sleeps taken between call attempts",
    )?;

    let queue_depth = Gauge::new("orderflow_queue_depth", "Entries waiting in the work queue")?;

    let active_workers = Gauge::new("orderflow_active_workers", "Number of running workers")?;

    let offload_duration = Histogram::with_opts(
        HistogramOpts::new(
            "orderflow_offload_duration_seconds",
            "Duration of blocking steps run off the async runtime",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.0, 5.0]),
    )?;

    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(item_duration.clone()))?;
    registry.register(Box::new(call_attempts_total.clone()))?;
    registry.register(Box::new(call_latency.clone()))?;
    registry.register(Box::new(calls_in_flight.clone()))?;
    registry.register(Box::new(retry_backoffs_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(offload_duration.clone()))?;

    // A concurrent call may have won the race; its set is kept whole.
    let _ = METRICS.set(PipelineMetrics {
        registry,
        items_total,
        item_duration,
        call_attempts_total,
        call_latency,
        calls_in_flight,
        retry_backoffs_total,
        queue_depth,
        active_workers,
        offload_duration,
    });

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if [`init_metrics`] has not run
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = METRICS.get().map(|m| &m.registry) else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

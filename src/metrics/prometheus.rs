//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by llm_runner and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all llm_runner metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total LLM API attempts, labeled by model and status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// LLM API request latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Retries scheduled after a failed attempt, labeled by model and reason.
pub static LLM_RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// API key rotations after quota errors, labeled by endpoint.
pub static KEY_ROTATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Work items by final outcome (completed, skipped, dropped, abandoned, requeued).
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Records appended to the output store.
pub static RECORDS_FLUSHED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Number of items waiting in the backlog.
pub static BACKLOG_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling it again is harmless: the first set of
/// metrics stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let llm_requests_total = CounterVec::new(
        Opts::new("llm_runner_llm_requests_total", "Total LLM API attempts"),
        &["model", "status"],
    )?;

    let llm_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "llm_runner_llm_latency_seconds",
            "LLM API request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["model"],
    )?;

    let llm_retries_total = CounterVec::new(
        Opts::new("llm_runner_llm_retries_total", "Retries after failed attempts"),
        &["model", "reason"],
    )?;

    let key_rotations_total = CounterVec::new(
        Opts::new(
            "llm_runner_key_rotations_total",
            "API key rotations after quota errors",
        ),
        &["endpoint"],
    )?;

    let items_total = CounterVec::new(
        Opts::new("llm_runner_items_total", "Work items by outcome"),
        &["outcome"],
    )?;

    let records_flushed_total = Counter::new(
        "llm_runner_records_flushed_total",
        "Records appended to the output store",
    )?;

    let backlog_depth = Gauge::new("llm_runner_backlog_depth", "Items waiting in the backlog")?;

    let active_workers = Gauge::new("llm_runner_active_workers", "Number of active workers")?;

    registry.register(Box::new(llm_requests_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(llm_retries_total.clone()))?;
    registry.register(Box::new(key_rotations_total.clone()))?;
    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(records_flushed_total.clone()))?;
    registry.register(Box::new(backlog_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = LLM_RETRIES_TOTAL.set(llm_retries_total);
    let _ = KEY_ROTATIONS_TOTAL.set(key_rotations_total);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = RECORDS_FLUSHED_TOTAL.set(records_flushed_total);
    let _ = BACKLOG_DEPTH.set(backlog_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
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

//! High-level recording interface over the raw Prometheus metrics.
//!
//! `MetricsCollector` keeps labeling consistent across the client, the worker
//! pool and the aggregator. Every method is a no-op until `init_metrics()`
//! has run, so library users and tests never need to set up a registry.

use super::prometheus::{
    ACTIVE_WORKERS, BACKLOG_DEPTH, ITEMS_TOTAL, KEY_ROTATIONS_TOTAL, LLM_LATENCY,
    LLM_REQUESTS_TOTAL, LLM_RETRIES_TOTAL, RECORDS_FLUSHED_TOTAL,
};

/// Final outcome of one work item, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Response received and handed to the aggregator.
    Completed,
    /// Permanently skipped after a terminal rejection.
    Skipped,
    /// Postprocessing failed; nothing persisted.
    Dropped,
    /// Attempt budget used up.
    Abandoned,
    /// Pushed back onto the backlog after a failure.
    Requeued,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Completed => "completed",
            ItemOutcome::Skipped => "skipped",
            ItemOutcome::Dropped => "dropped",
            ItemOutcome::Abandoned => "abandoned",
            ItemOutcome::Requeued => "requeued",
        }
    }
}

/// Metrics collector for recording llm_runner operational metrics.
///
/// # Example
///
/// ```ignore
/// use llm_runner::metrics::{init_metrics, ItemOutcome, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_llm_request("gpt-4o-mini", "success", 1.2);
/// collector.record_item(ItemOutcome::Completed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one attempt against the endpoint.
    ///
    /// `status` is `"success"` or the label of the classified error.
    pub fn record_llm_request(&self, model: &str, status: &str, latency_secs: f64) {
        if let Some(requests) = LLM_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[model, status]).inc();
        }

        if let Some(latency) = LLM_LATENCY.get() {
            latency.with_label_values(&[model]).observe(latency_secs);
        }

        tracing::trace!(
            model = model,
            status = status,
            latency_secs = latency_secs,
            "Recorded LLM request metric"
        );
    }

    /// Record a retry scheduled after a failed attempt.
    pub fn record_retry(&self, model: &str, reason: &str) {
        if let Some(retries) = LLM_RETRIES_TOTAL.get() {
            retries.with_label_values(&[model, reason]).inc();
        }
    }

    /// Record an API key rotation.
    pub fn record_key_rotation(&self, endpoint: &str) {
        if let Some(rotations) = KEY_ROTATIONS_TOTAL.get() {
            rotations.with_label_values(&[endpoint]).inc();
        }
    }

    /// Record the outcome of one item.
    pub fn record_item(&self, outcome: ItemOutcome) {
        if let Some(items) = ITEMS_TOTAL.get() {
            items.with_label_values(&[outcome.as_str()]).inc();
        }
    }

    /// Record records appended to the output store.
    pub fn record_flush(&self, records: usize) {
        if let Some(flushed) = RECORDS_FLUSHED_TOTAL.get() {
            flushed.inc_by(records as f64);
        }
    }

    /// Update the backlog depth gauge.
    pub fn update_backlog_depth(&self, depth: usize) {
        if let Some(gauge) = BACKLOG_DEPTH.get() {
            gauge.set(depth as f64);
        }
    }

    /// Increment the active worker count.
    pub fn inc_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    /// Decrement the active worker count.
    pub fn dec_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prometheus::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_item_outcome_labels() {
        assert_eq!(ItemOutcome::Completed.as_str(), "completed");
        assert_eq!(ItemOutcome::Abandoned.as_str(), "abandoned");
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_recording_without_init_is_noop() {
        // Must not panic regardless of test ordering.
        let collector = MetricsCollector::new();
        collector.record_llm_request("gpt-4o-mini", "timeout", 60.0);
        collector.record_item(ItemOutcome::Dropped);
    }

    #[test]
    fn test_record_llm_request() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_llm_request("gpt-4o-mini", "success", 1.5);
        collector.record_llm_request("gpt-4o-mini", "quota_exceeded", 0.2);
        collector.record_retry("gpt-4o-mini", "transport");
        collector.record_key_rotation("openai");

        let requests = LLM_REQUESTS_TOTAL.get().expect("initialized");
        assert!(
            requests
                .with_label_values(&["gpt-4o-mini", "success"])
                .get()
                >= 1.0
        );
    }

    #[test]
    fn test_worker_and_backlog_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_backlog_depth(42);
        collector.inc_workers();
        collector.dec_workers();
        collector.record_flush(20);
        collector.record_item(ItemOutcome::Requeued);
    }
}

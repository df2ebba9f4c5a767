//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks requests sent to the endpoint, retries and key rotations, item
//! outcomes, backlog depth and worker count.
//!
//! # Example
//!
//! ```ignore
//! use llm_runner::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.update_backlog_depth(1200);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{ItemOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

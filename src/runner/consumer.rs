//! Single-writer aggregator draining the result channel.
//!
//! The aggregator is the only task that writes to the output store. It
//! buffers postprocessed records, appends them once the buffer grows past
//! the flush threshold, and finishes with a full dedup-and-sort rewrite.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::metrics::{ItemOutcome, MetricsCollector};
use crate::scheduler::{PoolMessage, ResultEnvelope};
use crate::storage::{OutputStore, Record};

use super::collaborators::Postprocessor;

/// Default number of buffered records that triggers an append.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 20;

/// What the aggregator saw during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    /// Payload messages received.
    pub received: u64,
    /// Records handed to the store.
    pub persisted: u64,
    /// Responses the postprocessor rejected.
    pub dropped: u64,
    /// Envelopes carrying an error.
    pub skipped: u64,
    /// `Done` messages received.
    pub workers_done: usize,
    /// Records in the store after the final flush; `None` when nothing was
    /// written.
    pub store_total: Option<usize>,
}

pub struct Aggregator {
    store: Arc<dyn OutputStore>,
    postprocessor: Arc<dyn Postprocessor>,
    flush_threshold: usize,
    buffer: Vec<Record>,
    appended: bool,
    stats: AggregatorStats,
    metrics: MetricsCollector,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn OutputStore>,
        postprocessor: Arc<dyn Postprocessor>,
        flush_threshold: usize,
    ) -> Self {
        Self {
            store,
            postprocessor,
            flush_threshold,
            buffer: Vec::new(),
            appended: false,
            stats: AggregatorStats::default(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Drains `results` until one `Done` per worker arrived or every sender
    /// is gone, then performs the final flush.
    ///
    /// Only the final flush can fail the run; opportunistic appends that
    /// fail are retried at the next flush.
    pub async fn run(
        mut self,
        mut results: mpsc::UnboundedReceiver<PoolMessage>,
        num_workers: usize,
    ) -> Result<AggregatorStats, StoreError> {
        info!(num_workers = num_workers, "Aggregator started");

        while self.stats.workers_done < num_workers {
            let Some(message) = results.recv().await else {
                warn!(
                    done = self.stats.workers_done,
                    expected = num_workers,
                    "Result channel closed before every worker reported done"
                );
                break;
            };

            match message {
                PoolMessage::Payload(envelope) => {
                    self.stats.received += 1;
                    self.accept(envelope);
                    if self.buffer.len() > self.flush_threshold {
                        self.flush().await;
                    }
                }
                PoolMessage::Done { worker_id } => {
                    self.stats.workers_done += 1;
                    debug!(
                        worker_id = worker_id,
                        done = self.stats.workers_done,
                        "Worker reported done"
                    );
                }
            }
        }

        self.finalize().await
    }

    fn accept(&mut self, envelope: ResultEnvelope) {
        if let Some(err) = &envelope.error {
            debug!(item_id = %envelope.item.id, error = %err, "Skipped item not persisted");
            self.stats.skipped += 1;
            return;
        }

        match self.postprocessor.postprocess(&envelope) {
            Ok(record) => self.buffer.push(record),
            Err(e) => {
                error!(
                    item_id = %envelope.item.id,
                    error = %e,
                    "Postprocess failed, item dropped"
                );
                self.stats.dropped += 1;
                self.metrics.record_item(ItemOutcome::Dropped);
            }
        }
    }

    /// Appends the buffer; on failure the records stay buffered.
    async fn flush(&mut self) {
        let count = self.buffer.len();
        match self.store.append(&self.buffer).await {
            Ok(()) => {
                debug!(records = count, "Flushed records to output store");
                self.appended = true;
                self.stats.persisted += count as u64;
                self.metrics.record_flush(count);
                self.buffer.clear();
            }
            Err(e) => {
                warn!(records = count, error = %e, "Append failed, keeping records buffered");
            }
        }
    }

    async fn finalize(mut self) -> Result<AggregatorStats, StoreError> {
        if !self.appended && self.buffer.is_empty() {
            info!("Nothing to persist, output store left untouched");
            return Ok(self.stats);
        }

        let pending = std::mem::take(&mut self.buffer);
        let count = pending.len();
        let total = self.store.finalize(pending).await?;

        self.stats.persisted += count as u64;
        self.metrics.record_flush(count);
        self.stats.store_total = Some(total);

        info!(
            path = %self.store.path().display(),
            records = total,
            "Output store finalized"
        );
        Ok(self.stats)
    }
}

//! Worker pool that drains the backlog through the LLM client.
//!
//! Each worker runs as an independent tokio task. It pulls items from the
//! shared [`Backlog`], renders them with the injected [`RequestBuilder`],
//! calls the [`LlmProvider`] and pushes a [`PoolMessage::Payload`] onto the
//! result channel for every item that reached a terminal state.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Shared abort signal raised on the first run-scoped error
//! - Failed items are pushed back onto the backlog, within the attempt budget
//! - Exactly one [`PoolMessage::Done`] per worker, whatever the exit path
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{LlmError, RunError};
use crate::llm::{ChatResponse, ErrorKind, LlmProvider};
use crate::metrics::{ItemOutcome, MetricsCollector};
use crate::progress::ProgressTracker;
use crate::runner::RequestBuilder;

use super::backlog::{Backlog, Requeue};
use super::job::{EnvelopeError, PoolMessage, ResultEnvelope, WorkItem};

/// Errors that can occur when driving the worker pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// The configuration cannot produce a working pool.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a worker waits on an empty backlog while other items are
    /// still in flight.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers still running.
    pub active_workers: usize,
    /// Items answered by the endpoint.
    pub items_completed: u64,
    /// Items refused by the endpoint for good.
    pub items_skipped: u64,
    /// Failed attempts pushed back onto the backlog.
    pub items_requeued: u64,
    /// Items that used up their attempt budget.
    pub items_abandoned: u64,
}

impl PoolStats {
    /// Items that reached a terminal state.
    pub fn total_finished(&self) -> u64 {
        self.items_completed + self.items_skipped + self.items_abandoned
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_finished();
        if total == 0 {
            return 0.0;
        }
        (self.items_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
struct SharedPoolStats {
    items_completed: AtomicU64,
    items_skipped: AtomicU64,
    items_requeued: AtomicU64,
    items_abandoned: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            items_completed: self.items_completed.load(Ordering::SeqCst),
            items_skipped: self.items_skipped.load(Ordering::SeqCst),
            items_requeued: self.items_requeued.load(Ordering::SeqCst),
            items_abandoned: self.items_abandoned.load(Ordering::SeqCst),
        }
    }
}

/// Pool of workers sharing one backlog, one client and one result channel.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    backlog: Arc<Backlog>,
    provider: Arc<dyn LlmProvider>,
    builder: Arc<dyn RequestBuilder>,
    progress: Arc<ProgressTracker>,
    abort: Arc<AtomicBool>,
    stats: Arc<SharedPoolStats>,
    worker_handles: Vec<JoinHandle<Result<(), RunError>>>,
    started: bool,
}

impl WorkerPool {
    /// Creates a pool; no task runs until [`WorkerPool::start`].
    pub fn new(
        config: WorkerPoolConfig,
        backlog: Arc<Backlog>,
        provider: Arc<dyn LlmProvider>,
        builder: Arc<dyn RequestBuilder>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            config,
            backlog,
            provider,
            builder,
            progress,
            abort: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SharedPoolStats::default()),
            worker_handles: Vec::new(),
            started: false,
        }
    }

    /// Spawns all workers. Each one gets its own clone of `results`; the
    /// channel closes once every worker has exited.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool was started before
    /// and `PoolError::InvalidConfig` for a pool without workers.
    pub fn start(&mut self, results: mpsc::UnboundedSender<PoolMessage>) -> Result<(), PoolError> {
        if self.started {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }

        for id in 0..self.config.num_workers {
            let worker = Worker {
                id,
                backlog: Arc::clone(&self.backlog),
                provider: Arc::clone(&self.provider),
                builder: Arc::clone(&self.builder),
                results: results.clone(),
                abort: Arc::clone(&self.abort),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
                progress: Arc::clone(&self.progress),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.started = true;
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Raises the abort signal and empties the backlog.
    ///
    /// Workers finish their current item and exit.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let dropped = self.backlog.close();
        warn!(dropped = dropped, "Worker pool aborted");
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Waits for every worker to exit.
    ///
    /// All workers are joined even when one of them failed; the first
    /// run-scoped error (or panic) is returned.
    pub async fn join(&mut self) -> Result<PoolStats, RunError> {
        if !self.started {
            return Err(RunError::Pool(PoolError::NotRunning));
        }

        let mut first_error = None;
        for handle in self.worker_handles.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Worker task panicked");
                    // A dead worker can leave an item leased; make the others stop.
                    self.abort.store(true, Ordering::SeqCst);
                    self.backlog.close();
                    first_error.get_or_insert(RunError::TaskPanicked(e.to_string()));
                }
            }
        }

        let stats = self.stats();
        info!(
            completed = stats.items_completed,
            skipped = stats.items_skipped,
            abandoned = stats.items_abandoned,
            requeued = stats.items_requeued,
            "Worker pool stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker draining the backlog.
struct Worker {
    id: usize,
    backlog: Arc<Backlog>,
    provider: Arc<dyn LlmProvider>,
    builder: Arc<dyn RequestBuilder>,
    results: mpsc::UnboundedSender<PoolMessage>,
    abort: Arc<AtomicBool>,
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
    progress: Arc<ProgressTracker>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop. Emits `Done` on every exit path.
    async fn run(self) -> Result<(), RunError> {
        info!(worker_id = self.id, "Worker started");
        self.stats.increment_active();
        self.metrics.inc_workers();

        let outcome = self.drain().await;

        self.stats.decrement_active();
        self.metrics.dec_workers();
        if self
            .results
            .send(PoolMessage::Done { worker_id: self.id })
            .is_err()
        {
            warn!(worker_id = self.id, "Result channel closed before Done was sent");
        }

        info!(worker_id = self.id, "Worker stopped");
        outcome
    }

    async fn drain(&self) -> Result<(), RunError> {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                info!(worker_id = self.id, "Worker received abort signal");
                return Ok(());
            }

            let Some(item) = self.backlog.pop_timeout(self.poll_interval).await else {
                debug!(worker_id = self.id, "No items left");
                return Ok(());
            };
            self.metrics.update_backlog_depth(self.backlog.len());

            if let Err(e) = self.process(item).await {
                self.raise_abort();
                return Err(e);
            }
        }
    }

    fn raise_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let dropped = self.backlog.close();
        warn!(
            worker_id = self.id,
            dropped = dropped,
            "Abort signal raised, backlog closed"
        );
    }

    /// Handles one leased item. Only run-scoped failures are returned.
    async fn process(&self, item: WorkItem) -> Result<(), RunError> {
        debug!(worker_id = self.id, item_id = %item.id, "Processing item");

        let prompt = match self.builder.build(&item) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(
                    worker_id = self.id,
                    item_id = %item.id,
                    error = %e,
                    "Failed to build request"
                );
                return self.requeue(item, e.to_string());
            }
        };

        match self.provider.chat(&prompt).await {
            Ok(ChatResponse::Completed { text }) => {
                self.backlog.finish();
                self.stats.record(&self.stats.items_completed);
                self.progress.record(self.id);
                self.metrics.record_item(ItemOutcome::Completed);
                self.send(ResultEnvelope::completed(item, prompt.text, text, self.id))
            }
            Ok(ChatResponse::Rejected { kind }) => {
                self.backlog.finish();
                warn!(
                    worker_id = self.id,
                    item_id = %item.id,
                    error = %kind,
                    "Item permanently skipped"
                );
                self.stats.record(&self.stats.items_skipped);
                self.progress.record(self.id);
                self.metrics.record_item(ItemOutcome::Skipped);
                let error = EnvelopeError::ContentPolicy {
                    message: rejection_message(kind),
                };
                self.send(ResultEnvelope::skipped(item, prompt.text, error, self.id))
            }
            Err(e) if e.is_run_fatal() => {
                self.backlog.finish();
                error!(
                    worker_id = self.id,
                    item_id = %item.id,
                    error = %e,
                    "Run-scoped failure"
                );
                Err(RunError::Aborted(e))
            }
            Err(e) => {
                warn!(
                    worker_id = self.id,
                    item_id = %item.id,
                    error = %e,
                    "Request failed"
                );
                self.requeue(item, e.to_string())
            }
        }
    }

    fn requeue(&self, item: WorkItem, last_error: String) -> Result<(), RunError> {
        let item_id = item.id.clone();
        match self.backlog.requeue(item) {
            Requeue::Queued { attempts } => {
                debug!(
                    worker_id = self.id,
                    item_id = %item_id,
                    attempts = attempts,
                    "Item pushed back onto the backlog"
                );
                self.stats.record(&self.stats.items_requeued);
                self.metrics.record_item(ItemOutcome::Requeued);
                Ok(())
            }
            Requeue::Exhausted { item, attempts } => {
                warn!(
                    worker_id = self.id,
                    item_id = %item_id,
                    attempts = attempts,
                    error = %last_error,
                    "Item abandoned after using its attempt budget"
                );
                self.stats.record(&self.stats.items_abandoned);
                self.progress.record(self.id);
                self.metrics.record_item(ItemOutcome::Abandoned);
                let error = EnvelopeError::AttemptsExhausted {
                    attempts,
                    last_error,
                };
                self.send(ResultEnvelope::skipped(item, String::new(), error, self.id))
            }
            Requeue::Closed => {
                debug!(worker_id = self.id, item_id = %item_id, "Backlog closed, item dropped");
                Ok(())
            }
        }
    }

    fn send(&self, envelope: ResultEnvelope) -> Result<(), RunError> {
        self.results
            .send(PoolMessage::Payload(envelope))
            .map_err(|_| RunError::ConsumerClosed(self.id))
    }
}

fn rejection_message(kind: ErrorKind) -> String {
    match kind {
        ErrorKind::ContentPolicy(message) => message,
        other => other.to_string(),
    }
}

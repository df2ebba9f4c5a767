//! Batch runner wiring the loader, the worker pool and the aggregator.
//!
//! One [`BatchRunner::run`] call:
//!
//! 1. diffs the dataset against the output store ([`ResumableLoader`])
//! 2. fills the backlog and starts the worker pool
//! 3. drains results into the output store through one [`Aggregator`]
//! 4. joins every task and returns a [`RunSummary`]
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use llm_runner::runner::{BatchRunner, RunnerConfig};
//!
//! let config = RunnerConfig::from_yaml_file(Path::new("runner.yaml"))?;
//! let runner = BatchRunner::new(config)?;
//! let summary = runner.run().await?;
//! println!("{} records in store", summary.store_total.unwrap_or_default());
//! ```

pub mod collaborators;
pub mod config;
pub mod consumer;
pub mod resume;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::RunError;
use crate::llm::{ApiClient, LlmProvider};
use crate::metrics::MetricsCollector;
use crate::progress::{ProgressReporter, ProgressSnapshot, ProgressTracker};
use crate::scheduler::{Backlog, PoolStats, WorkerPool};
use crate::storage::{open_store, OutputStore};

pub use collaborators::{
    DatasetSource, DirectPostprocessor, JsonlDataset, Postprocessor, RequestBuilder,
    TemplateRequestBuilder, DEFAULT_PROMPT_TEMPLATE, RESPONSE_FIELD,
};
pub use config::{ConfigError, RunnerConfig};
pub use consumer::{Aggregator, AggregatorStats, DEFAULT_FLUSH_THRESHOLD};
pub use resume::{ResumableLoader, ResumePlan, ResumeStatus};

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Items in the full dataset.
    pub total: usize,
    /// Items already in the store before the run.
    pub already_persisted: usize,
    /// Items handed to the worker pool.
    pub dispatched: usize,
    pub workers: usize,
    pub completed: u64,
    pub skipped: u64,
    pub abandoned: u64,
    pub requeued: u64,
    /// Responses rejected by the postprocessor.
    pub dropped: u64,
    /// Records written by this run.
    pub persisted: u64,
    /// Records in the store after the final flush; `None` when the store was
    /// not touched.
    pub store_total: Option<usize>,
    pub duration_secs: f64,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, plan: &ResumePlan) -> Self {
        Self {
            run_id,
            started_at,
            total: plan.total,
            already_persisted: plan.already_persisted,
            dispatched: plan.remaining(),
            workers: 0,
            completed: 0,
            skipped: 0,
            abandoned: 0,
            requeued: 0,
            dropped: 0,
            persisted: 0,
            store_total: None,
            duration_secs: 0.0,
        }
    }

    fn record_pool(&mut self, stats: &PoolStats) {
        self.workers = stats.num_workers;
        self.completed = stats.items_completed;
        self.skipped = stats.items_skipped;
        self.abandoned = stats.items_abandoned;
        self.requeued = stats.items_requeued;
    }

    fn record_aggregator(&mut self, stats: &AggregatorStats) {
        self.dropped = stats.dropped;
        self.persisted = stats.persisted;
        self.store_total = stats.store_total;
    }
}

/// Runs one batch against one endpoint.
pub struct BatchRunner {
    config: RunnerConfig,
    provider: Arc<dyn LlmProvider>,
    dataset: Arc<dyn DatasetSource>,
    builder: Arc<dyn RequestBuilder>,
    postprocessor: Arc<dyn Postprocessor>,
    store: Arc<dyn OutputStore>,
}

impl BatchRunner {
    /// Creates a runner with the HTTP client and the default collaborators.
    pub fn new(config: RunnerConfig) -> Result<Self, RunError> {
        let client = ApiClient::new(config.client.clone()).map_err(RunError::Aborted)?;
        Ok(Self::with_provider(config, Arc::new(client)))
    }

    /// Creates a runner around any provider, with the default collaborators.
    pub fn with_provider(config: RunnerConfig, provider: Arc<dyn LlmProvider>) -> Self {
        let mut builder = TemplateRequestBuilder::new(config.prompt_template.clone());
        if let Some(field) = &config.image_field {
            builder = builder.with_image_field(field.clone());
        }
        let dataset = JsonlDataset::new(config.dataset_path.clone());
        let store = open_store(config.output_path.clone(), config.output_format());

        Self {
            provider,
            dataset: Arc::new(dataset),
            builder: Arc::new(builder),
            postprocessor: Arc::new(DirectPostprocessor),
            store,
            config,
        }
    }

    pub fn with_dataset(mut self, dataset: Arc<dyn DatasetSource>) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn with_request_builder(mut self, builder: Arc<dyn RequestBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.postprocessor = postprocessor;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn OutputStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn OutputStore> {
        &self.store
    }

    fn loader(&self) -> ResumableLoader {
        ResumableLoader::new(Arc::clone(&self.dataset), Arc::clone(&self.store))
    }

    /// Reports what a run would do, without touching the store or the
    /// endpoint.
    pub async fn status(&self) -> Result<ResumeStatus, RunError> {
        Ok(self.loader().plan(false).await?.status())
    }

    /// Processes every item not yet in the output store.
    ///
    /// All tasks are joined before this returns, including after an abort;
    /// records that completed before an abort are still persisted.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();

        info!(
            run_id = %run_id,
            model = %self.config.client.model,
            endpoint = %self.config.client.endpoint_name,
            output = %self.store.path().display(),
            "Starting run"
        );

        let plan = self.loader().plan(self.config.regenerate).await?;
        let mut summary = RunSummary::new(run_id, started_at, &plan);

        if plan.backlog.is_empty() {
            info!(
                total = plan.total,
                persisted = plan.already_persisted,
                "Nothing left to do"
            );
            summary.duration_secs = started.elapsed().as_secs_f64();
            return Ok(summary);
        }

        let num_workers = self.config.num_workers.clamp(1, plan.remaining());
        let backlog = Arc::new(Backlog::new(plan.backlog, self.config.attempt_budget()));
        MetricsCollector::new().update_backlog_depth(backlog.len());

        let tracker = Arc::new(ProgressTracker::new(
            summary.dispatched as u64,
            num_workers,
        ));
        let reporter = ProgressReporter::spawn(
            Arc::clone(&tracker),
            self.config.progress,
            self.config.progress_refresh,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = Aggregator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.postprocessor),
            self.config.flush_threshold,
        );
        let consumer = tokio::spawn(aggregator.run(rx, num_workers));

        let mut pool_config = self.config.pool_config();
        pool_config.num_workers = num_workers;
        let mut pool = WorkerPool::new(
            pool_config,
            backlog,
            Arc::clone(&self.provider),
            Arc::clone(&self.builder),
            tracker,
        );
        let pool_result = match pool.start(tx) {
            Ok(()) => pool.join().await,
            Err(e) => Err(RunError::from(e)),
        };

        let consumer_result = match consumer.await {
            Ok(result) => result.map_err(RunError::from),
            Err(e) => Err(RunError::TaskPanicked(e.to_string())),
        };
        let progress = reporter.finish().await;

        summary.record_pool(&pool.stats());
        if let Ok(stats) = &consumer_result {
            summary.record_aggregator(stats);
        }
        summary.duration_secs = started.elapsed().as_secs_f64();

        match (pool_result, consumer_result) {
            (Err(pool_err), consumer_result) => {
                if let Err(store_err) = consumer_result {
                    error!(error = %store_err, "Final flush failed after abort");
                }
                log_outcome(&summary, &progress, false);
                Err(pool_err)
            }
            (Ok(_), Err(store_err)) => Err(store_err),
            (Ok(_), Ok(_)) => {
                log_outcome(&summary, &progress, true);
                Ok(summary)
            }
        }
    }
}

fn log_outcome(summary: &RunSummary, progress: &ProgressSnapshot, finished: bool) {
    info!(
        run_id = %summary.run_id,
        finished = finished,
        done = progress.done,
        dispatched = summary.dispatched,
        completed = summary.completed,
        skipped = summary.skipped,
        abandoned = summary.abandoned,
        dropped = summary.dropped,
        persisted = summary.persisted,
        duration_secs = summary.duration_secs,
        "Run ended"
    );
}

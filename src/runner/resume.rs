//! Computes what is left to do for a run.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::RunError;
use crate::scheduler::{RecordId, WorkItem};
use crate::storage::OutputStore;

use super::collaborators::DatasetSource;

/// Result of diffing the dataset against the output store.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    /// Items that still need a response, in dataset order.
    pub backlog: Vec<WorkItem>,
    /// Number of items in the full dataset.
    pub total: usize,
    /// Number of dataset items already in the output store.
    pub already_persisted: usize,
}

impl ResumePlan {
    pub fn remaining(&self) -> usize {
        self.backlog.len()
    }

    pub fn status(&self) -> ResumeStatus {
        ResumeStatus {
            total: self.total,
            persisted: self.already_persisted,
            remaining: self.backlog.len(),
        }
    }
}

/// Counts reported by `llm-runner status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResumeStatus {
    pub total: usize,
    pub persisted: usize,
    pub remaining: usize,
}

/// Builds [`ResumePlan`]s from a dataset and an output store.
pub struct ResumableLoader {
    dataset: Arc<dyn DatasetSource>,
    store: Arc<dyn OutputStore>,
}

impl ResumableLoader {
    pub fn new(dataset: Arc<dyn DatasetSource>, store: Arc<dyn OutputStore>) -> Self {
        Self { dataset, store }
    }

    /// Loads the dataset and drops every item whose id is already persisted.
    ///
    /// With `regenerate` the store is removed first and the whole dataset is
    /// returned.
    pub async fn plan(&self, regenerate: bool) -> Result<ResumePlan, RunError> {
        let dataset = self.dataset.load().await?;
        let total = dataset.len();
        warn_duplicate_ids(&dataset);

        if regenerate {
            if self.store.remove().await? {
                info!(
                    path = %self.store.path().display(),
                    "Removed existing output for regeneration"
                );
            }
            return Ok(full_plan(dataset));
        }

        if self.store.is_empty().await? {
            return Ok(full_plan(dataset));
        }

        let persisted = self.store.persisted_ids().await?;
        let backlog: Vec<WorkItem> = dataset
            .into_iter()
            .filter(|item| !persisted.contains(&item.id))
            .collect();
        let already_persisted = total - backlog.len();

        info!(
            total = total,
            persisted = already_persisted,
            remaining = backlog.len(),
            "Resuming from existing output"
        );

        Ok(ResumePlan {
            backlog,
            total,
            already_persisted,
        })
    }
}

fn full_plan(dataset: Vec<WorkItem>) -> ResumePlan {
    ResumePlan {
        total: dataset.len(),
        backlog: dataset,
        already_persisted: 0,
    }
}

fn warn_duplicate_ids(dataset: &[WorkItem]) {
    let mut seen: HashSet<&RecordId> = HashSet::with_capacity(dataset.len());
    let duplicates = dataset.iter().filter(|item| !seen.insert(&item.id)).count();
    if duplicates > 0 {
        warn!(
            duplicates = duplicates,
            "Dataset contains duplicate ids; only the first result per id is kept"
        );
    }
}

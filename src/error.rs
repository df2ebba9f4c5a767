//! Error types for llm-runner operations.
//!
//! Defines error types for the major subsystems:
//! - LLM API interactions (with run/item scoping)
//! - Output store persistence
//! - Dataset loading
//! - Whole-run orchestration

use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::PoolError;

/// How far an error reaches.
///
/// Item-scoped errors abort the current attempt on one work item; the item
/// may be requeued. Run-scoped errors abort the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Item,
    Run,
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("No API key configured for endpoint '{0}'")]
    MissingApiKey(String),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Failed to build request body: {0}")]
    InvalidRequest(String),

    #[error("Retry counts > {max_retries}, abort. Last error: {last_error}")]
    RetriesExhausted { max_retries: u32, last_error: String },

    #[error("All API keys for endpoint '{endpoint}' exceeded their quota ({keys} configured)")]
    KeysExhausted { endpoint: String, keys: usize },
}

impl LlmError {
    /// Returns whether this error only affects one item or the whole run.
    pub fn scope(&self) -> ErrorScope {
        match self {
            LlmError::KeysExhausted { .. }
            | LlmError::MissingApiKey(_)
            | LlmError::ClientBuild(_) => ErrorScope::Run,
            _ => ErrorScope::Item,
        }
    }

    /// Shorthand for `scope() == ErrorScope::Run`.
    pub fn is_run_fatal(&self) -> bool {
        self.scope() == ErrorScope::Run
    }
}

/// Errors that can occur while reading or writing the output store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record at {path}:{line}: {source}")]
    CorruptRecord {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Corrupt JSON array in '{path}': {source}")]
    CorruptArray {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that can occur while loading the input dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read dataset '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid record at {path}:{line}: {message}")]
    InvalidRecord {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Dataset error: {0}")]
    Other(String),
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Dataset loading failed: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Output store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Run aborted: {0}")]
    Aborted(#[source] LlmError),

    #[error("Result channel closed while worker {0} was still producing")]
    ConsumerClosed(usize),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_scopes() {
        let err = LlmError::KeysExhausted {
            endpoint: "openai".to_string(),
            keys: 2,
        };
        assert_eq!(err.scope(), ErrorScope::Run);
        assert!(err.is_run_fatal());

        let err = LlmError::RetriesExhausted {
            max_retries: 10,
            last_error: "timeout".to_string(),
        };
        assert_eq!(err.scope(), ErrorScope::Item);
        assert!(!err.is_run_fatal());

        assert!(LlmError::MissingApiKey("openai".to_string()).is_run_fatal());
        assert!(!LlmError::InvalidRequest("bad json".to_string()).is_run_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = LlmError::RetriesExhausted {
            max_retries: 10,
            last_error: "connection refused".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("10"));
        assert!(text.contains("connection refused"));

        let err = RunError::Aborted(LlmError::KeysExhausted {
            endpoint: "gptgod".to_string(),
            keys: 1,
        });
        assert!(err.to_string().contains("aborted"));

        let err = StoreError::io(
            "/tmp/out.jsonl",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("/tmp/out.jsonl"));
    }
}

//! llm-runner: resumable batch requests to LLM chat-completion endpoints.
//!
//! This library dispatches a dataset of work items to an OpenAI-compatible
//! endpoint through a pool of concurrent workers, and persists the answers
//! to an output file keyed by item id so interrupted runs can resume.

// Core modules
pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod progress;
pub mod runner;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{DatasetError, ErrorScope, LlmError, RunError, StoreError};

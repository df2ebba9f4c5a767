//! Concurrent execution of work items.
//!
//! This module provides the in-process machinery that spreads a backlog
//! over several workers:
//!
//! - **Backlog**: shared FIFO of pending items with push-back on failure
//! - **WorkerPool**: pool of tokio tasks that call the LLM client
//! - **Job**: work items, result envelopes and channel messages
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Backlog    │
//!                      │ (pending ids)│
//!                      └──────┬───────┘
//!                             │ pop / requeue
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 0│         │ Worker 1│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         │     Payload / Done│                   │
//!         └───────────────────┼───────────────────┘
//!                             ▼
//!                      ┌──────────────┐
//!                      │  Aggregator  │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use llm_runner::scheduler::{Backlog, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let backlog = Arc::new(Backlog::new(items, Some(3)));
//! let mut pool = WorkerPool::new(
//!     WorkerPoolConfig::new(4),
//!     backlog,
//!     provider,
//!     builder,
//!     progress,
//! );
//!
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! pool.start(tx)?;
//! let stats = pool.join().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Push-back**: a failed item goes to the back of the backlog and is
//!   picked up by whichever worker is free next
//! - **Attempt budget**: items that keep failing are abandoned, not cycled
//! - **Abort signal**: a run-scoped error stops every worker after its
//!   current item

pub mod backlog;
pub mod job;
pub mod worker_pool;

// Re-export main types for convenience
pub use backlog::{Backlog, Requeue};
pub use job::{EnvelopeError, PoolMessage, RecordId, ResultEnvelope, WorkItem};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};

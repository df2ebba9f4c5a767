//! Command-line interface for llm-runner.
//!
//! Provides the `run` and `status` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};

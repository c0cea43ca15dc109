//! Command-line interface for agent-eval.
//!
//! Provides commands for running the worker supervisor, inspecting its
//! status, and administering the job queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};

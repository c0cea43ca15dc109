//! agent-eval: Supervised worker pool for agent evaluation jobs.
//!
//! This library provides a file-backed job queue shared by independent
//! worker processes, the supervisor that keeps those processes alive, and
//! the executor boundary that runs evaluation, evolution, validation, and
//! metrics jobs.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod worker;

// Re-export commonly used types
pub use config::OrchestratorConfig;
pub use error::{ConfigError, ExecutorError, SupervisorError};
pub use scheduler::{Job, JobQueue, JobResult, JobStatus, JobType, QueueError, StoreError};

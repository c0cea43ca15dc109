//! Error types for agent-eval operations.
//!
//! Defines error types for the subsystems around the job queue:
//! - Configuration loading and validation
//! - Job execution through external collaborators
//! - Worker process supervision and status files
//!
//! Queue and persistence errors live beside their modules in
//! [`crate::scheduler`].

use std::time::Duration;

use thiserror::Error;

use crate::scheduler::QueueError;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError { path: String, message: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while executing a job.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid parameters for {job_type} job: {message}")]
    InvalidParameters { job_type: String, message: String },

    #[error("No executor configured for job type '{0}'")]
    NotConfigured(String),

    #[error("Failed to launch '{program}': {message}")]
    LaunchFailed { program: String, message: String },

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Returns whether running the same job again could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ExecutorError::InvalidParameters { .. } | ExecutorError::NotConfigured(_)
        )
    }
}

/// Errors that can occur while supervising worker processes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker '{worker_id}': {message}")]
    SpawnFailed { worker_id: String, message: String },

    #[error("Failed to signal process {pid}: {message}")]
    SignalFailed { pid: u32, message: String },

    #[error("A supervisor is already running with PID {0}")]
    AlreadyRunning(u32),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

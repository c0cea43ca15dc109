//! Orchestrator configuration.
//!
//! Configuration is read from a YAML file (created with defaults when
//! missing), then selectively overridden from the environment:
//!
//! ```yaml
//! parallelism:
//!   max_concurrent_jobs: 5
//!   task_evaluation_workers: 3
//!   evolution_workers: 2
//!   validation_workers: 2
//!   metrics_workers: 0
//! timeouts:
//!   task_execution_timeout: 300
//!   job_queue_poll_interval: 5
//! state_dir: ./state
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::scheduler::{JobType, StoreOptions, WorkerType};

/// File name of the supervisor status snapshot inside `state_dir`.
pub const STATUS_FILE_NAME: &str = "orchestrator_status.json";

/// File name of the supervisor pid file inside `state_dir`.
pub const PID_FILE_NAME: &str = "orchestrator.pid";

/// Worker pool sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelismConfig {
    /// Upper bound on jobs in flight; informational for reporting.
    pub max_concurrent_jobs: usize,
    /// Workers claiming `evaluate_task` jobs.
    pub task_evaluation_workers: usize,
    /// Workers claiming `evolve_epoch` jobs.
    pub evolution_workers: usize,
    /// Workers claiming `compile_check` jobs.
    pub validation_workers: usize,
    /// Workers claiming `generate_metrics` jobs.
    pub metrics_workers: usize,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            task_evaluation_workers: 3,
            evolution_workers: 2,
            validation_workers: 2,
            metrics_workers: 0,
        }
    }
}

impl ParallelismConfig {
    /// Number of workers configured for `worker_type`.
    pub fn workers_for(&self, worker_type: WorkerType) -> usize {
        match worker_type {
            WorkerType::TaskEvaluation => self.task_evaluation_workers,
            WorkerType::Evolution => self.evolution_workers,
            WorkerType::Validation => self.validation_workers,
            WorkerType::Metrics => self.metrics_workers,
        }
    }

    /// Total number of workers across all types.
    pub fn total_workers(&self) -> usize {
        WorkerType::ALL.iter().map(|t| self.workers_for(*t)).sum()
    }
}

/// Timeouts and intervals, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub task_execution_timeout: u64,
    pub evolution_timeout: u64,
    pub validation_timeout: u64,
    pub metrics_timeout: u64,
    /// Worker sleep between polls of an empty queue.
    pub job_queue_poll_interval: u64,
    /// Grace period before a worker is force-killed.
    pub worker_stop_timeout: u64,
    /// Supervisor monitor loop interval.
    pub supervisor_poll_interval: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            task_execution_timeout: 300,
            evolution_timeout: 1800,
            validation_timeout: 120,
            metrics_timeout: 300,
            job_queue_poll_interval: 5,
            worker_stop_timeout: 10,
            supervisor_poll_interval: 5,
        }
    }
}

impl TimeoutConfig {
    /// Execution timeout enforced by executors for `job_type`.
    pub fn for_job_type(&self, job_type: JobType) -> Duration {
        let secs = match job_type {
            JobType::EvaluateTask => self.task_execution_timeout,
            JobType::EvolveEpoch => self.evolution_timeout,
            JobType::CompileCheck => self.validation_timeout,
            JobType::GenerateMetrics => self.metrics_timeout,
        };
        Duration::from_secs(secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_queue_poll_interval)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_poll_interval)
    }

    pub fn worker_stop(&self) -> Duration {
        Duration::from_secs(self.worker_stop_timeout)
    }
}

/// Retention windows for finished jobs, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Window used by the supervisor's periodic cleanup.
    pub completed_job_retention_secs: u64,
    /// Window used by the `clear-queue` command.
    pub clear_queue_retention_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_job_retention_secs: 3600,
            clear_queue_retention_secs: 60,
        }
    }
}

/// Job queue persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue file name inside `state_dir`.
    pub file_name: String,
    /// Retry budget for jobs enqueued without an explicit value.
    pub default_max_retries: u32,
    pub lock_timeout_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            file_name: "job_queue.json".to_string(),
            default_max_retries: crate::scheduler::job::DEFAULT_MAX_RETRIES,
            lock_timeout_ms: 10_000,
            retry_backoff_ms: 100,
        }
    }
}

/// External command run for one job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to launch.
    pub program: String,
    /// Arguments; `{name}` placeholders are replaced with job parameters.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; placeholders allowed.
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub parallelism: ParallelismConfig,
    pub timeouts: TimeoutConfig,
    pub retention: RetentionConfig,
    pub queue: QueueConfig,
    /// Directory holding the queue file, status files, and worker logs.
    pub state_dir: PathBuf,
    /// Command per job type used by the command executor.
    pub executors: BTreeMap<JobType, CommandSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut executors = BTreeMap::new();
        executors.insert(
            JobType::EvaluateTask,
            CommandSpec {
                program: "docker".to_string(),
                args: [
                    "compose",
                    "-p",
                    "agent-eval-{epoch}-{task}",
                    "up",
                    "--build",
                    "--abort-on-container-exit",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                working_dir: Some("epochs/{epoch}/agent-src".to_string()),
            },
        );

        Self {
            parallelism: ParallelismConfig::default(),
            timeouts: TimeoutConfig::default(),
            retention: RetentionConfig::default(),
            queue: QueueConfig::default(),
            state_dir: PathBuf::from("./state"),
            executors,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from `path`, writing defaults there if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!(path = %path.display(), "Wrote default configuration");
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Applies environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `AGENT_EVAL_STATE_DIR`: State directory
    /// - `AGENT_EVAL_POLL_INTERVAL_SECS`: Worker poll interval
    /// - `AGENT_EVAL_TASK_WORKERS`: Task evaluation pool size
    /// - `AGENT_EVAL_VALIDATION_WORKERS`: Validation pool size
    pub fn apply_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("AGENT_EVAL_STATE_DIR") {
            self.state_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("AGENT_EVAL_POLL_INTERVAL_SECS") {
            self.timeouts.job_queue_poll_interval =
                parse_env_value(&val, "AGENT_EVAL_POLL_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("AGENT_EVAL_TASK_WORKERS") {
            self.parallelism.task_evaluation_workers =
                parse_env_value(&val, "AGENT_EVAL_TASK_WORKERS")?;
        }

        if let Ok(val) = std::env::var("AGENT_EVAL_VALIDATION_WORKERS") {
            self.parallelism.validation_workers =
                parse_env_value(&val, "AGENT_EVAL_VALIDATION_WORKERS")?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeouts.job_queue_poll_interval == 0 {
            return Err(ConfigError::ValidationFailed(
                "job_queue_poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.timeouts.supervisor_poll_interval == 0 {
            return Err(ConfigError::ValidationFailed(
                "supervisor_poll_interval must be greater than 0".to_string(),
            ));
        }

        for job_type in JobType::ALL {
            if self.timeouts.for_job_type(job_type).is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "execution timeout for {} must be greater than 0",
                    job_type
                )));
            }
        }

        if self.parallelism.total_workers() == 0 {
            return Err(ConfigError::ValidationFailed(
                "at least one worker must be configured".to_string(),
            ));
        }

        if self.queue.file_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue.file_name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of the job queue file.
    pub fn queue_path(&self) -> PathBuf {
        self.state_dir.join(&self.queue.file_name)
    }

    /// Path of the supervisor status snapshot.
    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join(STATUS_FILE_NAME)
    }

    /// Path of the supervisor pid file.
    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join(PID_FILE_NAME)
    }

    /// Directory for worker log files.
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Store options derived from the queue section.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::default()
            .with_retry_backoff(Duration::from_millis(self.queue.retry_backoff_ms))
            .with_lock_timeout(Duration::from_millis(self.queue.lock_timeout_ms))
    }
}

/// Parses an environment variable value.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

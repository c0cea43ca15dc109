//! Job definitions for the scheduler.
//!
//! This module defines the core job types used by the queue:
//!
//! - `Job`: A unit of work claimed and executed by worker processes
//! - `JobType`: Routing key used by workers to filter what they claim
//! - `JobStatus`: Position of a job in its lifecycle
//! - `JobResult`: Outcome attached on completion or failure
//!
//! Jobs only change state through the transition helpers defined here, which
//! keeps the lifecycle a walk over `Pending → Running → {Completed, Pending, Failed}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of automatic retries for a job.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Kind of work a job represents.
///
/// The queue never interprets payloads; the type is used purely for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Run an agent against a single benchmark task.
    EvaluateTask,
    /// Produce the next generation of an agent.
    EvolveEpoch,
    /// Compile and test an agent's generated output.
    CompileCheck,
    /// Aggregate scores for an epoch.
    GenerateMetrics,
}

impl JobType {
    /// All known job types.
    pub const ALL: [JobType; 4] = [
        JobType::EvaluateTask,
        JobType::EvolveEpoch,
        JobType::CompileCheck,
        JobType::GenerateMetrics,
    ];

    /// Returns the wire name of this job type.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EvaluateTask => "evaluate_task",
            JobType::EvolveEpoch => "evolve_epoch",
            JobType::CompileCheck => "compile_check",
            JobType::GenerateMetrics => "generate_metrics",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown job type '{}'", s))
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with no retries left (or retries disallowed).
    Failed,
    /// Withdrawn before completion.
    Cancelled,
}

impl JobStatus {
    /// All known statuses.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns the wire name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Returns whether no further transitions are expected from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// Result of a job execution.
///
/// Produced by executors; `artifacts` is opaque to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Whether the execution succeeded.
    pub success: bool,
    /// Human-readable output summary.
    #[serde(default)]
    pub output: String,
    /// Error description, empty on success.
    #[serde(default)]
    pub error: String,
    /// Wall-clock execution time in seconds.
    #[serde(default)]
    pub execution_time: f64,
    /// Executor-defined structured output (file lists, scores, logs).
    #[serde(default = "empty_document")]
    pub artifacts: serde_json::Value,
}

fn empty_document() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl JobResult {
    /// Creates a successful result.
    pub fn success(output: impl Into<String>, execution_time: f64) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
            execution_time,
            artifacts: empty_document(),
        }
    }

    /// Creates a failed result.
    pub fn failure(error: impl Into<String>, execution_time: f64) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
            execution_time,
            artifacts: empty_document(),
        }
    }

    /// Attaches artifacts to the result.
    pub fn with_artifacts(mut self, artifacts: serde_json::Value) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Sets the output summary.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

/// Outcome of [`Job::mark_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job went back to `Pending` and consumed one retry.
    Requeued {
        /// Retry count after the increment.
        retry_count: u32,
    },
    /// The job is terminally `Failed`.
    Failed,
}

/// A job representing a unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// Routing key.
    pub job_type: JobType,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Executor-defined payload.
    #[serde(default = "empty_document")]
    pub parameters: serde_json::Value,
    /// When this job was created. Never mutated.
    pub created_at: DateTime<Utc>,
    /// When the job was last claimed.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome of the last execution.
    #[serde(default)]
    pub result: Option<JobResult>,
    /// Number of automatic retries consumed.
    #[serde(default)]
    pub retry_count: u32,
    /// Maximum number of automatic retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Worker currently (or most recently) holding the job.
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Job {
    /// Creates a new pending job.
    pub fn new(job_type: JobType, parameters: serde_json::Value, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            parameters,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            retry_count: 0,
            max_retries,
            worker_id: None,
        }
    }

    /// Returns whether the retry budget has room left.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns whether `retry_failed_jobs` may resurrect this job.
    ///
    /// Only terminally failed jobs qualify, and only while budget remains.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.has_retries_left()
    }

    /// Returns whether this job matches an optional type filter.
    pub fn matches(&self, filter: Option<&[JobType]>) -> bool {
        filter.map_or(true, |types| types.contains(&self.job_type))
    }

    /// Claims the job for `worker_id`.
    pub fn mark_running(&mut self, worker_id: &str) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.worker_id = Some(worker_id.to_string());
    }

    /// Marks a running job as completed with `result`.
    ///
    /// Returns `false` and leaves the job untouched unless it is `Running`.
    pub fn mark_completed(&mut self, result: JobResult) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        true
    }

    /// Records a failure of a running job, requeueing while retries remain
    /// and `allow_retry` is set.
    ///
    /// Returns `None` and leaves the job untouched unless it is `Running`.
    pub fn mark_failed(&mut self, error: &str, allow_retry: bool) -> Option<FailOutcome> {
        if self.status != JobStatus::Running {
            return None;
        }
        let outcome = if allow_retry && self.has_retries_left() {
            self.retry_count += 1;
            self.reset_to_pending();
            FailOutcome::Requeued {
                retry_count: self.retry_count,
            }
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(Utc::now());
            FailOutcome::Failed
        };

        match self.result.as_mut() {
            Some(result) => {
                result.success = false;
                result.error = error.to_string();
            }
            None => self.result = Some(JobResult::failure(error, 0.0)),
        }

        Some(outcome)
    }

    /// Returns the job to `Pending`, clearing claim information.
    pub fn reset_to_pending(&mut self) {
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.worker_id = None;
    }

    /// Returns a short form of the id for log lines.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

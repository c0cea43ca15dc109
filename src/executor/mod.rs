//! Job execution boundary.
//!
//! The queue treats job parameters as opaque documents. Executors are where
//! payloads get a shape: each job type has a parameter struct that is
//! validated before anything runs.

mod command;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;
use crate::scheduler::{Job, JobResult, JobType};

pub use command::CommandExecutor;

/// Trait for job executors.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Runs `job` to completion.
    ///
    /// An `Ok` result with `success == false` is an ordinary execution
    /// failure; `Err` means the job could not be run at all.
    async fn execute(&self, job: &Job) -> Result<JobResult, ExecutorError>;
}

/// Parameters of an `evaluate_task` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateTaskParams {
    pub epoch: String,
    pub task: String,
}

/// Parameters of an `evolve_epoch` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvolveEpochParams {
    pub source_epoch: String,
    pub target_epoch: String,
}

/// Parameters of a `compile_check` job; points at a finished evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileCheckParams {
    pub epoch: String,
    pub task: String,
}

/// Parameters of a `generate_metrics` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateMetricsParams {
    pub epoch: String,
}

/// Validated parameters of a job, by type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobParams {
    EvaluateTask(EvaluateTaskParams),
    EvolveEpoch(EvolveEpochParams),
    CompileCheck(CompileCheckParams),
    GenerateMetrics(GenerateMetricsParams),
}

impl JobParams {
    /// Decodes and validates the parameters of `job` against its type.
    pub fn from_job(job: &Job) -> Result<Self, ExecutorError> {
        let params = match job.job_type {
            JobType::EvaluateTask => JobParams::EvaluateTask(decode(job)?),
            JobType::EvolveEpoch => JobParams::EvolveEpoch(decode(job)?),
            JobType::CompileCheck => JobParams::CompileCheck(decode(job)?),
            JobType::GenerateMetrics => JobParams::GenerateMetrics(decode(job)?),
        };

        if let Some((name, _)) = params.fields().into_iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ExecutorError::InvalidParameters {
                job_type: job.job_type.to_string(),
                message: format!("'{}' must not be empty", name),
            });
        }
        Ok(params)
    }

    /// Named parameter values, used for placeholders and environment.
    pub fn fields(&self) -> BTreeMap<&'static str, String> {
        let mut fields = BTreeMap::new();
        match self {
            JobParams::EvaluateTask(p) => {
                fields.insert("epoch", p.epoch.clone());
                fields.insert("task", p.task.clone());
            }
            JobParams::EvolveEpoch(p) => {
                fields.insert("source_epoch", p.source_epoch.clone());
                fields.insert("target_epoch", p.target_epoch.clone());
            }
            JobParams::CompileCheck(p) => {
                fields.insert("epoch", p.epoch.clone());
                fields.insert("task", p.task.clone());
            }
            JobParams::GenerateMetrics(p) => {
                fields.insert("epoch", p.epoch.clone());
            }
        }
        fields
    }

    /// Environment exported to external programs, e.g. `EVAL_EPOCH`.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.fields()
            .into_iter()
            .map(|(name, value)| (format!("EVAL_{}", name.to_ascii_uppercase()), value))
            .collect()
    }
}

fn decode<T: DeserializeOwned>(job: &Job) -> Result<T, ExecutorError> {
    serde_json::from_value(job.parameters.clone()).map_err(|e| ExecutorError::InvalidParameters {
        job_type: job.job_type.to_string(),
        message: e.to_string(),
    })
}

//! Executor that runs an external program per job type.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{CommandSpec, OrchestratorConfig, TimeoutConfig};
use crate::error::ExecutorError;
use crate::scheduler::{Job, JobResult, JobType};

use super::{JobExecutor, JobParams};

/// Captured output kept per stream; older bytes are dropped.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Runs the configured command for each job type.
///
/// Parameters are exported as `EVAL_*` environment variables and substituted
/// into `{name}` placeholders in the arguments and working directory. The
/// process is killed when the per-type timeout expires.
pub struct CommandExecutor {
    commands: BTreeMap<JobType, CommandSpec>,
    timeouts: TimeoutConfig,
}

impl CommandExecutor {
    pub fn new(commands: BTreeMap<JobType, CommandSpec>, timeouts: TimeoutConfig) -> Self {
        Self { commands, timeouts }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.executors.clone(), config.timeouts.clone())
    }

    fn build_command(&self, job: &Job, params: &JobParams) -> Result<(Command, String), ExecutorError> {
        let spec = self
            .commands
            .get(&job.job_type)
            .ok_or_else(|| ExecutorError::NotConfigured(job.job_type.to_string()))?;
        let fields = params.fields();

        let mut cmd = Command::new(&spec.program);
        let args: Vec<String> = spec.args.iter().map(|a| substitute(a, &fields)).collect();
        cmd.args(&args);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(substitute(dir, &fields));
        }
        cmd.envs(params.env_vars())
            .env("EVAL_JOB_ID", job.id.to_string())
            .env("EVAL_JOB_TYPE", job.job_type.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let command_line = std::iter::once(spec.program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Ok((cmd, command_line))
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(&self, job: &Job) -> Result<JobResult, ExecutorError> {
        let params = JobParams::from_job(job)?;
        let (mut cmd, command_line) = self.build_command(job, &params)?;
        let timeout = self.timeouts.for_job_type(job.job_type);
        let start = Instant::now();

        info!(job_id = %job.id, job_type = %job.job_type, command = %command_line, "Running job command");

        let child = cmd.spawn().map_err(|e| ExecutorError::LaunchFailed {
            program: command_line.clone(),
            message: e.to_string(),
        })?;

        // Dropping the future on timeout kills the child (kill_on_drop).
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ExecutorError::Timeout(timeout)),
        };

        let elapsed = start.elapsed().as_secs_f64();
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = tail(&String::from_utf8_lossy(&output.stdout));
        let stderr = tail(&String::from_utf8_lossy(&output.stderr));
        debug!(job_id = %job.id, exit_code, elapsed, "Job command finished");

        let artifacts = json!({
            "command": command_line,
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        });

        let result = if output.status.success() {
            JobResult::success(format!("{} succeeded", job.job_type), elapsed)
        } else {
            JobResult::failure(format!("command exited with code {}", exit_code), elapsed)
        };
        Ok(result.with_artifacts(artifacts))
    }
}

/// Replaces `{name}` placeholders with parameter values.
fn substitute(template: &str, fields: &BTreeMap<&'static str, String>) -> String {
    fields.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

/// Keeps the last `MAX_CAPTURED_OUTPUT` bytes, cut on a char boundary.
fn tail(text: &str) -> String {
    if text.len() <= MAX_CAPTURED_OUTPUT {
        return text.to_string();
    }
    let mut start = text.len() - MAX_CAPTURED_OUTPUT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

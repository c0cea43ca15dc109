//! Worker processes managed by the supervisor.
//!
//! Each worker is an independent OS process that polls the shared job queue
//! file. The supervisor only ever talks to a worker through its process
//! handle: it spawns it with an identity in the environment, polls it for
//! liveness, and signals it to stop.
//!
//! # Features
//!
//! - Routing from worker type to the job types it claims
//! - Per-worker log files under the state directory
//! - Graceful stop with SIGTERM, escalating to SIGKILL after a timeout
//! - Restart accounting per worker identity

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::SupervisorError;

use super::job::JobType;

/// Environment variable carrying the worker identity.
pub const WORKER_ID_ENV: &str = "WORKER_ID";

/// Environment variable carrying the worker type.
pub const WORKER_TYPE_ENV: &str = "WORKER_TYPE";

/// Kind of worker, deciding which job types it claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    TaskEvaluation,
    Evolution,
    Validation,
    Metrics,
}

impl WorkerType {
    /// All worker types, in spawn order.
    pub const ALL: [WorkerType; 4] = [
        WorkerType::TaskEvaluation,
        WorkerType::Evolution,
        WorkerType::Validation,
        WorkerType::Metrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::TaskEvaluation => "task_evaluation",
            WorkerType::Evolution => "evolution",
            WorkerType::Validation => "validation",
            WorkerType::Metrics => "metrics",
        }
    }

    /// Job types this worker type claims from the queue.
    pub fn job_types(&self) -> &'static [JobType] {
        match self {
            WorkerType::TaskEvaluation => &[JobType::EvaluateTask],
            WorkerType::Evolution => &[JobType::EvolveEpoch],
            WorkerType::Validation => &[JobType::CompileCheck],
            WorkerType::Metrics => &[JobType::GenerateMetrics],
        }
    }

    /// Prefix used to build worker ids, e.g. `task-worker-1`.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            WorkerType::TaskEvaluation => "task-worker",
            WorkerType::Evolution => "evolution-worker",
            WorkerType::Validation => "validation-worker",
            WorkerType::Metrics => "metrics-worker",
        }
    }

    /// Builds the id of the `index`-th worker of this type (1-based).
    pub fn worker_id(&self, index: usize) -> String {
        format!("{}-{}", self.id_prefix(), index)
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown worker type '{}'", s))
    }
}

/// Lifecycle of a managed worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    NotStarted,
    Running,
    /// Exited without being asked to; observed by polling.
    Dead,
    /// Stopped through [`WorkerProcess::stop`].
    Stopped,
}

/// Program and arguments used to launch a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-invokes the running binary with the hidden `worker` subcommand.
    ///
    /// `log_level` is forwarded so workers log at the supervisor's level.
    pub fn current_exe(config_path: Option<&Path>, log_level: Option<&str>) -> std::io::Result<Self> {
        let program = std::env::current_exe()?;
        let mut args = Vec::new();
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        if let Some(level) = log_level {
            args.push("--log-level".to_string());
            args.push(level.to_string());
        }
        args.push("worker".to_string());
        Ok(Self { program, args })
    }
}

/// Snapshot of one worker, persisted in the supervisor status file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub worker_type: WorkerType,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub is_alive: bool,
    pub state: WorkerState,
    #[serde(default)]
    pub restarts: u32,
}

/// Handle around one spawned worker process.
pub struct WorkerProcess {
    worker_id: String,
    worker_type: WorkerType,
    command: WorkerCommand,
    log_dir: Option<PathBuf>,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    state: WorkerState,
    restarts: u32,
}

impl WorkerProcess {
    /// Creates a handle; nothing is spawned until [`start`](Self::start).
    pub fn new(worker_id: impl Into<String>, worker_type: WorkerType, command: WorkerCommand) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_type,
            command,
            log_dir: None,
            child: None,
            pid: None,
            started_at: None,
            state: WorkerState::NotStarted,
            restarts: 0,
        }
    }

    /// Redirects stdout and stderr to `<log_dir>/<worker_id>.log`.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Spawns the process and returns its pid.
    pub fn start(&mut self) -> Result<u32, SupervisorError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .env(WORKER_ID_ENV, &self.worker_id)
            .env(WORKER_TYPE_ENV, self.worker_type.as_str())
            .stdin(Stdio::null());

        match &self.log_dir {
            Some(dir) => {
                let (stdout, stderr) = self.open_log(dir)?;
                cmd.stdout(stdout).stderr(stderr);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        // Own process group: a terminal Ctrl-C reaches the supervisor only,
        // which then stops workers itself.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            worker_id: self.worker_id.clone(),
            message: format!("{}: {}", self.command.program.display(), e),
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            worker_id: self.worker_id.clone(),
            message: "process exited before its pid was read".to_string(),
        })?;

        self.child = Some(child);
        self.pid = Some(pid);
        self.started_at = Some(Utc::now());
        self.state = WorkerState::Running;

        info!(
            worker_id = %self.worker_id,
            worker_type = %self.worker_type,
            pid,
            "Started worker"
        );
        Ok(pid)
    }

    fn open_log(&self, dir: &Path) -> Result<(Stdio, Stdio), SupervisorError> {
        std::fs::create_dir_all(dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", self.worker_id)))?;
        let err_file = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(err_file)))
    }

    /// Polls the process without blocking; marks it dead once it has exited.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(worker_id = %self.worker_id, %status, "Worker exited");
                self.child = None;
                self.state = WorkerState::Dead;
                false
            }
            Err(e) => {
                warn!(worker_id = %self.worker_id, error = %e, "Failed to poll worker");
                false
            }
        }
    }

    /// Asks the process to terminate, force-killing it after `timeout`.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        let Some(mut child) = self.child.take() else {
            if self.state == WorkerState::Running {
                self.state = WorkerState::Stopped;
            }
            return Ok(());
        };

        let pid = child.id();
        if let Some(pid) = pid {
            if let Err(e) = terminate(pid) {
                warn!(worker_id = %self.worker_id, pid, error = %e, "Graceful stop failed");
            }
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker_id = %self.worker_id, %status, "Worker stopped");
            }
            Ok(Err(e)) => {
                warn!(worker_id = %self.worker_id, error = %e, "Failed waiting for worker");
            }
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id,
                    timeout_secs = timeout.as_secs(),
                    "Worker did not stop in time, killing"
                );
                // The group also holds whatever command the worker was running.
                if let Some(pid) = pid {
                    if let Err(e) = kill_group(pid) {
                        debug!(worker_id = %self.worker_id, pid, error = %e, "Failed to kill worker group");
                    }
                }
                child.kill().await?;
            }
        }

        self.state = WorkerState::Stopped;
        info!(worker_id = %self.worker_id, "Stopped worker");
        Ok(())
    }

    /// Spawns a replacement under the same identity.
    pub fn restart(&mut self) -> Result<u32, SupervisorError> {
        self.child = None;
        self.restarts += 1;
        self.start()
    }

    /// Returns the status-file view of this worker.
    pub fn summary(&mut self) -> WorkerSummary {
        let is_alive = self.is_alive();
        WorkerSummary {
            worker_id: self.worker_id.clone(),
            worker_type: self.worker_type,
            pid: self.pid,
            started_at: self.started_at,
            is_alive,
            state: self.state,
            restarts: self.restarts,
        }
    }
}

/// Sends SIGTERM to `pid`.
#[cfg(unix)]
pub(crate) fn terminate(pid: u32) -> Result<(), SupervisorError> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(unix))]
pub(crate) fn terminate(_pid: u32) -> Result<(), SupervisorError> {
    Ok(())
}

/// Sends `signal` to `pid`.
#[cfg(unix)]
pub(crate) fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), SupervisorError> {
    let target = raw_pid(pid).ok_or_else(|| SupervisorError::SignalFailed {
        pid,
        message: "invalid pid".to_string(),
    })?;

    nix::sys::signal::kill(target, signal).map_err(|e| SupervisorError::SignalFailed {
        pid,
        message: e.to_string(),
    })
}

/// Sends SIGKILL to the process group led by `pid`.
///
/// Workers are spawned as group leaders, so this also reaches the commands
/// they launched.
#[cfg(unix)]
pub(crate) fn kill_group(pid: u32) -> Result<(), SupervisorError> {
    let target = raw_pid(pid).ok_or_else(|| SupervisorError::SignalFailed {
        pid,
        message: "invalid pid".to_string(),
    })?;

    nix::sys::signal::killpg(target, nix::sys::signal::Signal::SIGKILL).map_err(|e| {
        SupervisorError::SignalFailed {
            pid,
            message: e.to_string(),
        }
    })
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: u32) -> Result<(), SupervisorError> {
    Ok(())
}

#[cfg(unix)]
fn raw_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// Returns whether a process with `pid` exists, using the null signal.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;

    let Some(target) = raw_pid(pid) else {
        return false;
    };
    // EPERM: exists but owned by another user.
    matches!(nix::sys::signal::kill(target, None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

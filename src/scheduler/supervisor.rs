//! Supervisor owning the worker process pool.
//!
//! The supervisor is the only long-lived process besides the workers. It
//! recovers jobs orphaned by a previous crash, spawns the pool, restarts
//! workers that die, prunes old finished jobs, and keeps a status snapshot
//! on disk so later CLI invocations can inspect or stop it.
//!
//! # Status files
//!
//! ```text
//! <state_dir>/orchestrator.pid           supervisor pid, plain text
//! <state_dir>/orchestrator_status.json   SupervisorStatus document
//! ```
//!
//! Both are written atomically and removed on a clean shutdown. A pid file
//! pointing at a process that no longer exists is treated as stale and
//! purged by the next reader.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::config::{OrchestratorConfig, ParallelismConfig};
use crate::error::SupervisorError;

use super::queue::{JobQueue, QueueStats};
use super::store::write_atomic;
use super::worker_pool::{
    kill_group, process_alive, terminate, WorkerCommand, WorkerProcess, WorkerSummary, WorkerType,
};

/// How often `stop_running_supervisor` checks whether the target exited.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Snapshot persisted to the status file on every monitor tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub pid: u32,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub workers: BTreeMap<String, WorkerSummary>,
    pub parallelism: ParallelismConfig,
    #[serde(default)]
    pub queue: QueueStats,
}

impl SupervisorStatus {
    /// Number of workers reported alive.
    pub fn alive_workers(&self) -> usize {
        self.workers.values().filter(|w| w.is_alive).count()
    }
}

/// Well-known locations of the supervisor pid and status files.
#[derive(Debug, Clone)]
pub struct StatusFiles {
    pub status_path: PathBuf,
    pub pid_path: PathBuf,
}

impl StatusFiles {
    pub fn new(status_path: impl Into<PathBuf>, pid_path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: status_path.into(),
            pid_path: pid_path.into(),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.status_path(), config.pid_path())
    }

    /// Writes the status snapshot and the pid file.
    pub async fn write(&self, status: &SupervisorStatus) -> Result<(), SupervisorError> {
        if let Some(parent) = self.status_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&self.status_path, &serde_json::to_vec_pretty(status)?).await?;
        write_atomic(&self.pid_path, status.pid.to_string().as_bytes()).await?;
        Ok(())
    }

    /// Reads the recorded pid, if any.
    pub async fn read_pid(&self) -> Option<u32> {
        let content = fs::read_to_string(&self.pid_path).await.ok()?;
        content.trim().parse().ok()
    }

    /// Reads the status snapshot without checking liveness.
    pub async fn read_status(&self) -> Option<SupervisorStatus> {
        let content = fs::read(&self.status_path).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(path = %self.status_path.display(), error = %e, "Unreadable status file");
                None
            }
        }
    }

    /// Returns the pid of a live supervisor, purging stale files otherwise.
    pub async fn running_pid(&self) -> Option<u32> {
        let pid = match self.read_pid().await {
            Some(pid) => pid,
            None => {
                self.cleanup().await;
                return None;
            }
        };

        if process_alive(pid) {
            Some(pid)
        } else {
            debug!(pid, "Removing stale supervisor status files");
            self.cleanup().await;
            None
        }
    }

    /// Returns the status snapshot of a live supervisor.
    pub async fn load_live(&self) -> Option<SupervisorStatus> {
        self.running_pid().await?;
        self.read_status().await
    }

    /// Removes both files; missing files are not an error.
    pub async fn cleanup(&self) {
        for path in [&self.status_path, &self.pid_path] {
            if let Err(e) = fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove status file");
                }
            }
        }
    }
}

/// Result of [`stop_running_supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited after SIGTERM within the grace period.
    Terminated { pid: u32 },
    /// Had to be force-killed, along with `orphans` workers it left behind.
    Killed { pid: u32, orphans: usize },
}

/// Stops a supervisor running in another process.
///
/// Sends SIGTERM, waits up to `grace` for the process to exit, then
/// escalates to SIGKILL. A killed supervisor cannot stop its own pool, so the
/// process groups of the workers recorded in its status file are killed too.
/// Status files are removed in every case.
pub async fn stop_running_supervisor(
    files: &StatusFiles,
    grace: Duration,
) -> Result<StopOutcome, SupervisorError> {
    let Some(pid) = files.running_pid().await else {
        return Ok(StopOutcome::NotRunning);
    };
    let worker_pids: Vec<u32> = files
        .read_status()
        .await
        .map(|status| status.workers.values().filter_map(|w| w.pid).collect())
        .unwrap_or_default();

    info!(pid, "Sending SIGTERM to supervisor");
    terminate(pid)?;

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            files.cleanup().await;
            return Ok(StopOutcome::Terminated { pid });
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }

    let outcome = if process_alive(pid) {
        warn!(pid, "Supervisor still alive, sending SIGKILL");
        force_kill(pid)?;
        let orphans = kill_orphaned_workers(&worker_pids);
        StopOutcome::Killed { pid, orphans }
    } else {
        StopOutcome::Terminated { pid }
    };
    files.cleanup().await;
    Ok(outcome)
}

/// Kills the process group of every worker pid that is still alive.
fn kill_orphaned_workers(worker_pids: &[u32]) -> usize {
    worker_pids
        .iter()
        .filter(|pid| process_alive(**pid))
        .filter(|pid| match kill_group(**pid) {
            Ok(()) => {
                warn!(pid = **pid, "Killed worker left behind by supervisor");
                true
            }
            Err(e) => {
                warn!(pid = **pid, error = %e, "Failed to kill orphaned worker");
                false
            }
        })
        .count()
}

#[cfg(unix)]
fn force_kill(pid: u32) -> Result<(), SupervisorError> {
    super::worker_pool::send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
fn force_kill(_pid: u32) -> Result<(), SupervisorError> {
    Ok(())
}

/// Listener for SIGINT and SIGTERM.
///
/// Handlers are registered by [`install`](Self::install), so a signal that
/// arrives before the first [`recv`](Self::recv) is queued instead of
/// killing the process.
pub struct ShutdownListener {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownListener {
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Resolves on the next SIGINT or SIGTERM.
    pub async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => {},
                _ = self.terminate.recv() => {},
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to wait for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }

        info!("Shutdown signal received");
    }
}

/// Owner of the worker pool.
pub struct Supervisor {
    config: OrchestratorConfig,
    queue: Arc<JobQueue>,
    files: StatusFiles,
    command: WorkerCommand,
    workers: BTreeMap<String, WorkerProcess>,
    started_at: DateTime<Utc>,
}

impl Supervisor {
    /// Creates a supervisor over the queue described by `config`.
    pub fn new(config: OrchestratorConfig, queue: Arc<JobQueue>, command: WorkerCommand) -> Self {
        let files = StatusFiles::from_config(&config);
        Self {
            config,
            queue,
            files,
            command,
            workers: BTreeMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Overrides the status file locations.
    pub fn with_status_files(mut self, files: StatusFiles) -> Self {
        self.files = files;
        self
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerProcess> {
        self.workers.values()
    }

    /// Recovers orphaned jobs, spawns the pool, and writes the first snapshot.
    ///
    /// If the snapshot cannot be written the workers already spawned are
    /// stopped again.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        if let Some(pid) = self.files.running_pid().await {
            if pid != std::process::id() {
                return Err(SupervisorError::AlreadyRunning(pid));
            }
        }

        let recovered = self.queue.reset_running_jobs().await?;
        if recovered > 0 {
            info!(recovered, "Recovered jobs orphaned by a previous run");
        }

        self.started_at = Utc::now();
        let log_dir = self.config.log_dir();
        for worker_type in WorkerType::ALL {
            for index in 1..=self.config.parallelism.workers_for(worker_type) {
                let worker_id = worker_type.worker_id(index);
                let mut worker =
                    WorkerProcess::new(worker_id.clone(), worker_type, self.command.clone())
                        .with_log_dir(&log_dir);
                match worker.start() {
                    Ok(_) => {
                        self.workers.insert(worker_id, worker);
                    }
                    Err(e) => error!(worker_id = %worker_id, error = %e, "Failed to start worker"),
                }
            }
        }

        info!(
            workers = self.workers.len(),
            configured = self.config.parallelism.total_workers(),
            "Supervisor started"
        );
        if let Err(e) = self.write_status(true).await {
            error!(error = %e, "Failed to write status, stopping workers");
            self.stop().await;
            return Err(e);
        }
        Ok(())
    }

    /// Runs one monitor tick: restart dead workers, prune old jobs, refresh status.
    pub async fn monitor_once(&mut self) -> Result<(), SupervisorError> {
        let mut dropped = Vec::new();
        for (worker_id, worker) in self.workers.iter_mut() {
            if worker.is_alive() {
                continue;
            }
            warn!(worker_id = %worker_id, "Worker died, restarting");
            if let Err(e) = worker.restart() {
                error!(worker_id = %worker_id, error = %e, "Failed to restart worker, dropping it");
                dropped.push(worker_id.clone());
            }
        }
        for worker_id in dropped {
            self.workers.remove(&worker_id);
        }

        let retention = Duration::from_secs(self.config.retention.completed_job_retention_secs);
        match self.queue.clear_completed_jobs(retention).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Pruned finished jobs"),
            Err(e) => warn!(error = %e, "Failed to prune finished jobs"),
        }

        self.write_status(true).await
    }

    /// Runs until SIGINT/SIGTERM, then stops the pool.
    ///
    /// Signal handlers are installed before any worker is spawned; a signal
    /// received while starting stops whatever was already spawned.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let mut shutdown = ShutdownListener::install()?;

        let started = tokio::select! {
            result = self.start() => Some(result),
            _ = shutdown.recv() => None,
        };
        match started {
            Some(result) => result?,
            None => {
                warn!("Shutdown requested during startup");
                self.stop().await;
                return Ok(());
            }
        }

        let mut ticker = tokio::time::interval(self.config.timeouts.supervisor_interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.monitor_once().await {
                        error!(error = %e, "Monitor tick failed");
                    }
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Stops every worker in parallel and removes the status files.
    ///
    /// Files recording another supervisor's pid are left alone.
    pub async fn stop(&mut self) {
        let timeout = self.config.timeouts.worker_stop();
        info!(workers = self.workers.len(), "Stopping worker pool");

        let results = join_all(self.workers.values_mut().map(|w| w.stop(timeout))).await;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Failed to stop worker cleanly");
            }
        }

        match self.files.read_pid().await {
            Some(pid) if pid != std::process::id() => {
                debug!(pid, "Status files belong to another supervisor, keeping them");
            }
            _ => self.files.cleanup().await,
        }
        info!("Supervisor stopped");
    }

    /// Builds the current status snapshot.
    pub async fn status(&mut self, running: bool) -> SupervisorStatus {
        self.queue.reload().await;
        let workers = self
            .workers
            .iter_mut()
            .map(|(id, worker)| (id.clone(), worker.summary()))
            .collect();

        SupervisorStatus {
            pid: std::process::id(),
            running,
            started_at: self.started_at,
            updated_at: Utc::now(),
            workers,
            parallelism: self.config.parallelism.clone(),
            queue: self.queue.get_queue_stats().await,
        }
    }

    async fn write_status(&mut self, running: bool) -> Result<(), SupervisorError> {
        let status = self.status(running).await;
        self.files.write(&status).await
    }
}

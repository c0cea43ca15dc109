//! File-backed job queue shared by cooperating processes.
//!
//! The queue wraps a [`JobStore`] and exposes the operational API used by
//! producers, workers, and the supervisor:
//!
//! - `enqueue` / `dequeue` to create and claim jobs
//! - `complete_job` / `fail_job` to record outcomes
//! - `reset_running_jobs`, `retry_failed_jobs`, `clear_completed_jobs`,
//!   `clear_all_jobs` for administration
//!
//! # Concurrency
//!
//! Inside a process, an async mutex serializes callers. Across processes,
//! every mutation runs a reload-modify-save cycle while holding the store's
//! advisory file lock, so two workers cannot both claim the same job from the
//! same snapshot. Delivery is still at-least-once: a worker that dies after a
//! claim leaves a `Running` job behind until `reset_running_jobs` recovers it.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{FailOutcome, Job, JobResult, JobStatus, JobType};
use super::store::{JobStore, LoadReport, StoreError, StoreOptions};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store failed.
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub pending: usize,
    /// Jobs claimed by a worker.
    pub running: usize,
    /// Jobs that finished successfully.
    pub completed: usize,
    /// Jobs that failed terminally.
    pub failed: usize,
    /// Jobs withdrawn before completion.
    pub cancelled: usize,
}

impl QueueStats {
    /// Returns the count for a single status.
    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    /// Returns the total number of jobs.
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Job queue persisted to a single JSON file.
#[derive(Debug)]
pub struct JobQueue {
    store: Mutex<JobStore>,
}

impl JobQueue {
    /// Opens the queue stored at `path`.
    pub async fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, QueueError> {
        let store = JobStore::open(path.as_ref(), options).await?;
        Ok(Self::from_store(store))
    }

    /// Wraps an existing store.
    pub fn from_store(store: JobStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    /// Re-reads the queue file so reads observe other processes' writes.
    pub async fn reload(&self) -> LoadReport {
        self.store.lock().await.reload().await
    }

    /// Runs `op` inside a locked reload-modify-save cycle.
    ///
    /// The store is saved when `op` reports that it changed something, or
    /// when the reload had to heal an unreadable file.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut JobStore) -> (T, bool),
    ) -> Result<T, QueueError> {
        let mut store = self.store.lock().await;
        let _file_lock = store.lock().await?;
        let report = store.reload().await;

        let (value, changed) = op(&mut *store);
        if changed || report.healed {
            store.save().await?;
        }
        Ok(value)
    }

    /// Adds a new pending job and returns its id.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        parameters: serde_json::Value,
        max_retries: u32,
    ) -> Result<Uuid, QueueError> {
        let job = Job::new(job_type, parameters, max_retries);
        let id = job.id;

        self.mutate(|store| {
            store.jobs_mut().insert(id, job);
            ((), true)
        })
        .await?;

        info!(job_id = %id, job_type = %job_type, "Enqueued job");
        Ok(id)
    }

    /// Claims the oldest pending job matching `type_filter` for `worker_id`.
    ///
    /// Returns `None` when nothing matches.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        type_filter: Option<&[JobType]>,
    ) -> Result<Option<Job>, QueueError> {
        let claimed = self
            .mutate(|store| {
                let next = store
                    .jobs()
                    .values()
                    .filter(|job| job.status == JobStatus::Pending && job.matches(type_filter))
                    .min_by_key(|job| (job.created_at, job.id))
                    .map(|job| job.id);

                match next.and_then(|id| store.jobs_mut().get_mut(&id)) {
                    Some(job) => {
                        job.mark_running(worker_id);
                        (Some(job.clone()), true)
                    }
                    None => (None, false),
                }
            })
            .await?;

        if let Some(job) = &claimed {
            debug!(job_id = %job.id, worker_id, job_type = %job.job_type, "Claimed job");
        }
        Ok(claimed)
    }

    /// Marks a running job as completed.
    ///
    /// Returns `false` if the id is unknown or the job is not `Running`.
    pub async fn complete_job(&self, id: Uuid, result: JobResult) -> Result<bool, QueueError> {
        let applied = self
            .mutate(|store| match store.jobs_mut().get_mut(&id) {
                Some(job) => {
                    let applied = job.mark_completed(result);
                    if !applied {
                        warn!(job_id = %id, status = %job.status, "Ignoring completion of job that is not running");
                    }
                    (applied, applied)
                }
                None => (false, false),
            })
            .await?;

        if applied {
            debug!(job_id = %id, "Job completed");
        }
        Ok(applied)
    }

    /// Records a failure of a running job.
    ///
    /// With `allow_retry` and budget remaining the job returns to `Pending`;
    /// otherwise it becomes terminally `Failed`. Returns `None` if the id is
    /// unknown or the job is not `Running`.
    pub async fn fail_job(
        &self,
        id: Uuid,
        error: &str,
        allow_retry: bool,
    ) -> Result<Option<FailOutcome>, QueueError> {
        let outcome = self
            .mutate(|store| match store.jobs_mut().get_mut(&id) {
                Some(job) => {
                    let outcome = job.mark_failed(error, allow_retry);
                    if outcome.is_none() {
                        warn!(job_id = %id, status = %job.status, "Ignoring failure of job that is not running");
                    }
                    (outcome, outcome.is_some())
                }
                None => (None, false),
            })
            .await?;

        match outcome {
            Some(FailOutcome::Requeued { retry_count }) => {
                info!(job_id = %id, retry_count, "Job failed, requeued for retry");
            }
            Some(FailOutcome::Failed) => info!(job_id = %id, error, "Job failed"),
            None => {}
        }
        Ok(outcome)
    }

    /// Returns a copy of a job by id.
    pub async fn get_job(&self, id: Uuid) -> Option<Job> {
        self.store.lock().await.jobs().get(&id).cloned()
    }

    /// Returns all jobs with `status`.
    pub async fn get_jobs_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.collect(|job| job.status == status).await
    }

    /// Returns all jobs of `job_type`.
    pub async fn get_jobs_by_type(&self, job_type: JobType) -> Vec<Job> {
        self.collect(|job| job.job_type == job_type).await
    }

    /// Returns all jobs, oldest first.
    pub async fn get_all_jobs(&self) -> Vec<Job> {
        self.collect(|_| true).await
    }

    async fn collect(&self, predicate: impl Fn(&Job) -> bool) -> Vec<Job> {
        let store = self.store.lock().await;
        let mut jobs: Vec<Job> = store
            .jobs()
            .values()
            .filter(|job| predicate(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        jobs
    }

    /// Returns counts per status.
    pub async fn get_queue_stats(&self) -> QueueStats {
        let store = self.store.lock().await;
        store
            .jobs()
            .values()
            .fold(QueueStats::default(), |mut stats, job| {
                stats.record(job.status);
                stats
            })
    }

    /// Moves every `Running` job back to `Pending`.
    ///
    /// Used at supervisor start to recover jobs orphaned by a crash.
    pub async fn reset_running_jobs(&self) -> Result<usize, QueueError> {
        self.mutate(|store| {
            let mut count = 0;
            for job in store.jobs_mut().values_mut() {
                if job.status == JobStatus::Running {
                    job.reset_to_pending();
                    count += 1;
                }
            }
            (count, count > 0)
        })
        .await
    }

    /// Requeues terminally failed jobs that still have retry budget.
    ///
    /// Each resurrection consumes one retry so manual retries stay bounded.
    pub async fn retry_failed_jobs(&self) -> Result<usize, QueueError> {
        self.mutate(|store| {
            let mut count = 0;
            for job in store.jobs_mut().values_mut() {
                if job.can_retry() {
                    job.retry_count += 1;
                    job.completed_at = None;
                    job.reset_to_pending();
                    count += 1;
                }
            }
            (count, count > 0)
        })
        .await
    }

    /// Deletes completed and failed jobs that finished more than `older_than` ago.
    pub async fn clear_completed_jobs(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.mutate(|store| {
            let before = store.jobs().len();
            store.jobs_mut().retain(|_, job| {
                let finished = matches!(job.status, JobStatus::Completed | JobStatus::Failed);
                !(finished && job.completed_at.is_some_and(|at| at < cutoff))
            });
            let removed = before - store.jobs().len();
            (removed, removed > 0)
        })
        .await
    }

    /// Deletes every job unconditionally.
    pub async fn clear_all_jobs(&self) -> Result<usize, QueueError> {
        self.mutate(|store| {
            let count = store.jobs().len();
            store.jobs_mut().clear();
            (count, count > 0)
        })
        .await
    }
}

//! Worker poll loop.
//!
//! A worker process claims jobs of the types its [`WorkerType`] handles,
//! runs them through a [`JobExecutor`], and reports the outcome back to the
//! queue. Errors in the loop are logged and followed by a short backoff;
//! after too many consecutive errors the loop gives up so the supervisor can
//! restart the process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::ExecutorError;
use crate::executor::JobExecutor;
use crate::scheduler::{FailOutcome, Job, JobQueue, JobResult, QueueError, WorkerType};

/// Consecutive errors tolerated before the worker exits.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Upper bound of the error backoff, in seconds.
const MAX_ERROR_BACKOFF_SECS: u64 = 5;

/// Errors that end the worker loop.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Giving up after {count} consecutive errors, last: {last}")]
    TooManyErrors { count: u32, last: String },
}

/// Configuration of a single worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub worker_type: WorkerType,
    /// Sleep between polls when no job is available.
    pub poll_interval: Duration,
    pub max_consecutive_errors: u32,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, worker_type: WorkerType) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_type,
            poll_interval: Duration::from_secs(5),
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

/// What happened to a single claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Requeued,
    Failed,
    /// The job vanished from the queue while running.
    Lost,
}

/// A worker that processes jobs from the queue.
pub struct Worker {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    executor: Arc<dyn JobExecutor>,
    shutdown_rx: watch::Receiver<bool>,
    stats: WorkerStats,
}

impl Worker {
    /// Creates a worker; sending `true` on the paired sender stops it
    /// after the current job.
    pub fn new(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        executor: Arc<dyn JobExecutor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            queue,
            executor,
            shutdown_rx,
            stats: WorkerStats::default(),
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Main worker loop.
    ///
    /// Returns when shutdown is requested, or with an error once more than
    /// `max_consecutive_errors` errors happened in a row.
    pub async fn run(mut self) -> Result<WorkerStats, WorkerError> {
        info!(
            worker_id = %self.config.worker_id,
            worker_type = %self.config.worker_type,
            "Worker started"
        );
        let mut consecutive_errors: u32 = 0;

        while !self.shutdown_requested() {
            match self.poll_once().await {
                Ok(Some(_)) => consecutive_errors = 0,
                Ok(None) => {
                    consecutive_errors = 0;
                    debug!(worker_id = %self.config.worker_id, "No jobs available");
                    let interval = self.config.poll_interval;
                    self.pause(interval).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        consecutive_errors,
                        "Worker loop error"
                    );
                    if consecutive_errors > self.config.max_consecutive_errors {
                        return Err(WorkerError::TooManyErrors {
                            count: consecutive_errors,
                            last: e.to_string(),
                        });
                    }
                    self.pause(error_backoff(consecutive_errors)).await;
                }
            }
        }

        info!(
            worker_id = %self.config.worker_id,
            completed = self.stats.jobs_completed,
            failed = self.stats.jobs_failed,
            "Worker stopped"
        );
        Ok(self.stats)
    }

    /// Claims and processes at most one job.
    pub async fn poll_once(&mut self) -> Result<Option<JobOutcome>, QueueError> {
        let filter = self.config.worker_type.job_types();
        match self.queue.dequeue(&self.config.worker_id, Some(filter)).await? {
            Some(job) => self.process_job(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Processes a single claimed job.
    async fn process_job(&mut self, job: Job) -> Result<JobOutcome, QueueError> {
        let start_time = Instant::now();

        if !self.config.worker_type.job_types().contains(&job.job_type) {
            warn!(
                worker_id = %self.config.worker_id,
                job_id = %job.id,
                job_type = %job.job_type,
                "Claimed a job of a type this worker does not handle"
            );
            let message = format!(
                "{} worker cannot handle {} jobs",
                self.config.worker_type, job.job_type
            );
            return self.record_failure(&job, &message, false).await;
        }

        info!(
            worker_id = %self.config.worker_id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.retry_count + 1,
            "Processing job"
        );

        match self.executor.execute(&job).await {
            Ok(result) if result.success => self.record_success(&job, result, start_time).await,
            Ok(result) => self.record_failure(&job, &result.error, true).await,
            Err(e) => self.record_execution_error(&job, e).await,
        }
    }

    async fn record_success(
        &mut self,
        job: &Job,
        result: JobResult,
        start_time: Instant,
    ) -> Result<JobOutcome, QueueError> {
        if !self.queue.complete_job(job.id, result).await? {
            warn!(job_id = %job.id, "Completed job is no longer claimed");
            return Ok(JobOutcome::Lost);
        }
        self.stats.jobs_completed += 1;
        info!(
            worker_id = %self.config.worker_id,
            job_id = %job.id,
            duration_ms = start_time.elapsed().as_millis() as u64,
            "Job completed"
        );
        Ok(JobOutcome::Completed)
    }

    async fn record_execution_error(
        &mut self,
        job: &Job,
        err: ExecutorError,
    ) -> Result<JobOutcome, QueueError> {
        let allow_retry = err.is_retryable();
        self.record_failure(job, &err.to_string(), allow_retry).await
    }

    async fn record_failure(
        &mut self,
        job: &Job,
        error: &str,
        allow_retry: bool,
    ) -> Result<JobOutcome, QueueError> {
        let outcome = match self.queue.fail_job(job.id, error, allow_retry).await? {
            Some(FailOutcome::Requeued { retry_count }) => {
                warn!(
                    worker_id = %self.config.worker_id,
                    job_id = %job.id,
                    retry_count,
                    max_retries = job.max_retries,
                    error,
                    "Job failed, requeued"
                );
                JobOutcome::Requeued
            }
            Some(FailOutcome::Failed) => {
                error!(
                    worker_id = %self.config.worker_id,
                    job_id = %job.id,
                    error,
                    "Job failed permanently"
                );
                JobOutcome::Failed
            }
            None => {
                warn!(job_id = %job.id, "Failed job is no longer claimed");
                return Ok(JobOutcome::Lost);
            }
        };
        self.stats.jobs_failed += 1;
        Ok(outcome)
    }

    /// Sleeps for `duration`, waking early on shutdown.
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown_rx.changed() => {}
        }
    }
}

/// Backoff after the `n`-th consecutive error: `min(n, 5)` seconds.
pub fn error_backoff(consecutive_errors: u32) -> Duration {
    Duration::from_secs(u64::from(consecutive_errors).min(MAX_ERROR_BACKOFF_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{JobStatus, JobStore, JobType, StoreOptions};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Executor returning scripted outcomes in order.
    struct ScriptedExecutor {
        outcomes: Mutex<Vec<Result<JobResult, ExecutorError>>>,
    }

    impl ScriptedExecutor {
        fn new(mut outcomes: Vec<Result<JobResult, ExecutorError>>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
            })
        }
    }

    #[async_trait]
    impl JobExecutor for ScriptedExecutor {
        async fn execute(&self, _job: &Job) -> Result<JobResult, ExecutorError> {
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(JobResult::success("default", 0.0)))
        }
    }

    async fn open_queue(temp: &TempDir) -> Arc<JobQueue> {
        let options = StoreOptions::default()
            .with_retry_backoff(Duration::from_millis(1))
            .silent(true);
        Arc::new(
            JobQueue::open(temp.path().join("job_queue.json"), options)
                .await
                .unwrap(),
        )
    }

    fn worker(queue: Arc<JobQueue>, executor: Arc<dyn JobExecutor>) -> (Worker, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let config = WorkerConfig::new("task-worker-1", WorkerType::TaskEvaluation)
            .with_poll_interval(Duration::from_millis(10));
        (Worker::new(config, queue, executor, rx), tx)
    }

    #[test]
    fn test_error_backoff_is_capped() {
        assert_eq!(error_backoff(1), Duration::from_secs(1));
        assert_eq!(error_backoff(3), Duration::from_secs(3));
        assert_eq!(error_backoff(11), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_poll_once_completes_job() {
        let temp = TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        let id = queue
            .enqueue(JobType::EvaluateTask, json!({"epoch": "e", "task": "t"}), 3)
            .await
            .unwrap();
        let (mut worker, _tx) = worker(
            Arc::clone(&queue),
            ScriptedExecutor::new(vec![Ok(JobResult::success("done", 0.5))]),
        );

        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Completed));

        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.worker_id.as_deref(), Some("task-worker-1"));
        assert_eq!(job.result.unwrap().output, "done");
    }

    #[tokio::test]
    async fn test_poll_once_ignores_other_job_types() {
        let temp = TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        queue
            .enqueue(JobType::CompileCheck, json!({"epoch": "e", "task": "t"}), 3)
            .await
            .unwrap();
        let (mut worker, _tx) = worker(Arc::clone(&queue), ScriptedExecutor::new(vec![]));

        assert_eq!(worker.poll_once().await.unwrap(), None);
        assert_eq!(queue.get_queue_stats().await.pending, 1);
    }

    #[tokio::test]
    async fn test_failed_result_is_retried() {
        let temp = TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        let id = queue
            .enqueue(JobType::EvaluateTask, json!({"epoch": "e", "task": "t"}), 1)
            .await
            .unwrap();
        let (mut worker, _tx) = worker(
            Arc::clone(&queue),
            ScriptedExecutor::new(vec![
                Ok(JobResult::failure("tests failed", 1.0)),
                Ok(JobResult::failure("tests failed again", 1.0)),
            ]),
        );

        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Requeued));
        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Failed));

        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.result.unwrap().error, "tests failed again");
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_not_retried() {
        let temp = TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        let id = queue
            .enqueue(JobType::EvaluateTask, json!({}), 3)
            .await
            .unwrap();
        let (mut worker, _tx) = worker(
            Arc::clone(&queue),
            ScriptedExecutor::new(vec![Err(ExecutorError::InvalidParameters {
                job_type: "evaluate_task".to_string(),
                message: "missing field `epoch`".to_string(),
            })]),
        );

        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Failed));
        assert_eq!(queue.get_job(id).await.unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_retried() {
        let temp = TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        queue
            .enqueue(JobType::EvaluateTask, json!({"epoch": "e", "task": "t"}), 3)
            .await
            .unwrap();
        let (mut worker, _tx) = worker(
            Arc::clone(&queue),
            ScriptedExecutor::new(vec![Err(ExecutorError::Timeout(Duration::from_secs(300)))]),
        );

        assert_eq!(worker.poll_once().await.unwrap(), Some(JobOutcome::Requeued));
        assert_eq!(queue.get_queue_stats().await.pending, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_gives_up_after_consecutive_errors() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("job_queue.json");
        let options = StoreOptions::default()
            .with_retry_backoff(Duration::from_millis(1))
            .with_lock_timeout(Duration::from_millis(50))
            .silent(true);
        let queue = Arc::new(JobQueue::open(&path, options.clone()).await.unwrap());

        // Another process holding the queue lock makes every poll fail.
        let holder = JobStore::open(&path, options).await.unwrap();
        let _guard = holder.lock().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let config = WorkerConfig::new("task-worker-1", WorkerType::TaskEvaluation)
            .with_poll_interval(Duration::from_millis(10))
            .with_max_consecutive_errors(1);
        let worker = Worker::new(config, queue, ScriptedExecutor::new(vec![]), rx);

        let result = tokio::time::timeout(Duration::from_secs(10), worker.run())
            .await
            .expect("worker should give up on its own");
        drop(tx);

        match result {
            Err(WorkerError::TooManyErrors { count, last }) => {
                assert_eq!(count, 2);
                assert!(last.contains("lock"));
            }
            Ok(_) => panic!("Expected the worker to give up"),
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let queue = open_queue(&temp).await;
        for _ in 0..2 {
            queue
                .enqueue(JobType::EvaluateTask, json!({"epoch": "e", "task": "t"}), 3)
                .await
                .unwrap();
        }
        let (worker, tx) = worker(Arc::clone(&queue), ScriptedExecutor::new(vec![]));

        let handle = tokio::spawn(worker.run());
        for _ in 0..200 {
            if queue.get_queue_stats().await.completed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.reload().await;
        }
        tx.send(true).unwrap();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.jobs_completed, 2);
        assert_eq!(stats.jobs_failed, 0);
    }
}

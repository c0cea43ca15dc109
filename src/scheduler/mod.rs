//! File-backed job queue and worker process supervision.
//!
//! This module provides the infrastructure for running evaluation work out
//! of process:
//!
//! - **JobStore**: JSON persistence with atomic writes and corruption tolerance
//! - **JobQueue**: Claim/complete/fail API over the store
//! - **WorkerProcess**: Handle around one spawned worker OS process
//! - **Supervisor**: Keeps the worker pool alive and publishes its status
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │    (CLI)     │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐        ┌──────────────┐
//!                      │job_queue.json│◄───────┤  Supervisor  │
//!                      │   (+ .lock)  │ reset/ │ (status.json)│
//!                      └──────┬───────┘ prune  └──────┬───────┘
//!                             │ dequeue               │ spawn/monitor
//!         ┌───────────────────┼───────────────────┐   │
//!         │                   │                   │   │
//!         ▼                   ▼                   ▼   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! Processes share nothing but the queue file. Every mutating queue call
//! takes an advisory lock on `<queue>.lock`, reloads the file, applies the
//! change, and saves atomically.
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_eval::scheduler::{JobQueue, JobType, StoreOptions};
//! use serde_json::json;
//!
//! let queue = JobQueue::open("state/job_queue.json", StoreOptions::default()).await?;
//! let id = queue
//!     .enqueue(JobType::EvaluateTask, json!({"epoch": "epoch-001", "task": "task-007"}), 3)
//!     .await?;
//!
//! if let Some(job) = queue.dequeue("task-worker-1", Some(&[JobType::EvaluateTask])).await? {
//!     queue.complete_job(job.id, JobResult::success("ok", 1.2)).await?;
//! }
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic writes**: temp file + fsync + rename, never a half-written queue
//! - **Crash recovery**: `Running` jobs are reset to `Pending` when the supervisor starts
//! - **Bounded retries**: failed jobs are requeued until `max_retries` is spent
//! - **Self-healing load**: an unparseable queue file is replaced by an empty one
//!
//! A claimed job whose worker dies stays `Running` until the next supervisor
//! start; delivery is at-least-once at best, never exactly-once.

pub mod job;
pub mod queue;
pub mod store;
pub mod supervisor;
pub mod worker_pool;

// Re-export main types for convenience
pub use job::{FailOutcome, Job, JobResult, JobStatus, JobType};
pub use queue::{JobQueue, QueueError, QueueStats};
pub use store::{JobStore, LoadReport, StoreError, StoreOptions};
pub use supervisor::{
    stop_running_supervisor, ShutdownListener, StatusFiles, StopOutcome, Supervisor,
    SupervisorStatus,
};
pub use worker_pool::{
    process_alive, WorkerCommand, WorkerProcess, WorkerState, WorkerSummary, WorkerType,
};

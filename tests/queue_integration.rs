//! Integration tests for the file-backed job queue.
//!
//! Every test works on a queue file in a temporary directory and, where it
//! matters, re-opens the file with a fresh queue instance the way a separate
//! process would.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agent_eval::scheduler::{
    FailOutcome, JobQueue, JobResult, JobStatus, JobType, QueueStats, StoreOptions,
};
use serde_json::json;
use tempfile::TempDir;

fn options() -> StoreOptions {
    StoreOptions::default()
        .with_retry_backoff(Duration::from_millis(1))
        .silent(true)
}

fn queue_path(temp: &TempDir) -> PathBuf {
    temp.path().join("job_queue.json")
}

async fn open(path: &Path) -> JobQueue {
    JobQueue::open(path, options()).await.expect("queue should open")
}

fn task_params(task: &str) -> serde_json::Value {
    json!({"epoch": "epoch-001", "task": task})
}

#[tokio::test]
async fn test_scenario_five_jobs() {
    let temp = TempDir::new().unwrap();
    let queue = open(&queue_path(&temp)).await;

    for i in 0..5 {
        queue
            .enqueue(JobType::EvaluateTask, task_params(&format!("task-{:03}", i)), 0)
            .await
            .unwrap();
    }

    let first = queue.dequeue("task-worker-1", None).await.unwrap().unwrap();
    let second = queue.dequeue("task-worker-2", None).await.unwrap().unwrap();
    assert_ne!(first.id, second.id);

    let stats = queue.get_queue_stats().await;
    assert_eq!((stats.pending, stats.running), (3, 2));

    assert!(queue
        .complete_job(first.id, JobResult::success("ok", 1.0))
        .await
        .unwrap());
    assert_eq!(
        queue.fail_job(second.id, "boom", true).await.unwrap(),
        Some(FailOutcome::Failed)
    );

    let stats = queue.get_queue_stats().await;
    assert_eq!(
        stats,
        QueueStats {
            pending: 3,
            running: 0,
            completed: 1,
            failed: 1,
            cancelled: 0,
        }
    );
}

#[tokio::test]
async fn test_round_trip_through_fresh_instance() {
    let temp = TempDir::new().unwrap();
    let path = queue_path(&temp);
    let queue = open(&path).await;

    let done = queue
        .enqueue(JobType::EvaluateTask, task_params("task-001"), 3)
        .await
        .unwrap();
    queue
        .enqueue(JobType::CompileCheck, task_params("task-001"), 1)
        .await
        .unwrap();
    queue
        .enqueue(JobType::GenerateMetrics, json!({"epoch": "epoch-001"}), 2)
        .await
        .unwrap();

    let claimed = queue.dequeue("task-worker-1", Some(&[JobType::EvaluateTask])).await.unwrap();
    assert_eq!(claimed.map(|j| j.id), Some(done));
    queue
        .complete_job(
            done,
            JobResult::success("passed", 12.5).with_artifacts(json!({"score": 0.75})),
        )
        .await
        .unwrap();
    queue.dequeue("validation-worker-1", Some(&[JobType::CompileCheck])).await.unwrap();

    let reopened = open(&path).await;

    assert_eq!(reopened.get_queue_stats().await, queue.get_queue_stats().await);
    assert_eq!(reopened.get_all_jobs().await, queue.get_all_jobs().await);

    let job = reopened.get_job(done).await.unwrap();
    let result = job.result.unwrap();
    assert_eq!(result.artifacts["score"], 0.75);
    assert_eq!(result.execution_time, 12.5);
}

#[tokio::test]
async fn test_corrupted_record_is_skipped() {
    let temp = TempDir::new().unwrap();
    let path = queue_path(&temp);
    let queue = open(&path).await;
    for i in 0..3 {
        queue
            .enqueue(JobType::EvaluateTask, task_params(&format!("task-{}", i)), 3)
            .await
            .unwrap();
    }
    drop(queue);

    let mut document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    document["jobs"]["not-a-job"] = json!({"id": "not-a-job", "status": "exploded"});
    std::fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

    let reopened = open(&path).await;
    assert_eq!(reopened.get_queue_stats().await.pending, 3);
    assert_eq!(reopened.get_all_jobs().await.len(), 3);
}

#[tokio::test]
async fn test_unknown_status_value_is_rejected_per_record() {
    let temp = TempDir::new().unwrap();
    let path = queue_path(&temp);
    let queue = open(&path).await;
    let kept = queue
        .enqueue(JobType::EvaluateTask, task_params("task-1"), 3)
        .await
        .unwrap();
    let broken = queue
        .enqueue(JobType::EvaluateTask, task_params("task-2"), 3)
        .await
        .unwrap();
    drop(queue);

    let mut document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    document["jobs"][broken.to_string()]["status"] = json!("paused");
    std::fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

    let reopened = open(&path).await;
    assert!(reopened.get_job(kept).await.is_some());
    assert!(reopened.get_job(broken).await.is_none());
}

#[tokio::test]
async fn test_garbage_file_heals_to_empty_queue() {
    let temp = TempDir::new().unwrap();
    let path = queue_path(&temp);
    std::fs::write(&path, "{\"jobs\": {").unwrap();

    let queue = open(&path).await;
    assert_eq!(queue.get_queue_stats().await.total(), 0);

    queue
        .enqueue(JobType::EvolveEpoch, json!({"source_epoch": "a", "target_epoch": "b"}), 3)
        .await
        .unwrap();
    assert_eq!(open(&path).await.get_queue_stats().await.pending, 1);
}

#[tokio::test]
async fn test_retry_exhaustion() {
    let temp = TempDir::new().unwrap();
    let queue = open(&queue_path(&temp)).await;
    let id = queue
        .enqueue(JobType::EvaluateTask, task_params("task-001"), 2)
        .await
        .unwrap();

    for expected_retry in 1..=2 {
        queue.dequeue("task-worker-1", None).await.unwrap().unwrap();
        queue.fail_job(id, "flaky", true).await.unwrap();

        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, expected_retry);
        assert!(job.worker_id.is_none());
    }

    queue.dequeue("task-worker-1", None).await.unwrap().unwrap();
    queue.fail_job(id, "still flaky", true).await.unwrap();

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.result.unwrap().error, "still flaky");

    // Budget spent, nothing left to resurrect.
    assert_eq!(queue.retry_failed_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn test_retry_failed_only_touches_failed_jobs() {
    let temp = TempDir::new().unwrap();
    let queue = open(&queue_path(&temp)).await;
    let failed = queue
        .enqueue(JobType::CompileCheck, task_params("task-1"), 3)
        .await
        .unwrap();
    queue.dequeue("w", None).await.unwrap();
    queue.fail_job(failed, "wrong worker", false).await.unwrap();

    let completed = queue
        .enqueue(JobType::CompileCheck, task_params("task-2"), 3)
        .await
        .unwrap();
    queue.dequeue("w", None).await.unwrap();
    queue
        .complete_job(completed, JobResult::success("ok", 0.1))
        .await
        .unwrap();

    assert_eq!(queue.retry_failed_jobs().await.unwrap(), 1);

    let job = queue.get_job(failed).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.completed_at.is_none());
    assert_eq!(
        queue.get_job(completed).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_type_filtered_dequeue() {
    let temp = TempDir::new().unwrap();
    let queue = open(&queue_path(&temp)).await;
    let id = queue
        .enqueue(JobType::CompileCheck, task_params("task-001"), 3)
        .await
        .unwrap();

    assert!(queue
        .dequeue("task-worker-1", Some(&[JobType::EvaluateTask]))
        .await
        .unwrap()
        .is_none());

    let job = queue
        .dequeue(
            "validation-worker-1",
            Some(&[JobType::EvaluateTask, JobType::CompileCheck]),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.worker_id.as_deref(), Some("validation-worker-1"));
}

#[tokio::test]
async fn test_crash_recovery_resets_running_jobs() {
    let temp = TempDir::new().unwrap();
    let path = queue_path(&temp);
    let crashed_worker = open(&path).await;
    for i in 0..3 {
        crashed_worker
            .enqueue(JobType::EvaluateTask, task_params(&format!("task-{}", i)), 3)
            .await
            .unwrap();
    }
    crashed_worker.dequeue("task-worker-1", None).await.unwrap();
    crashed_worker.dequeue("task-worker-2", None).await.unwrap();
    drop(crashed_worker);

    let supervisor = open(&path).await;
    assert_eq!(supervisor.get_queue_stats().await.running, 2);
    assert_eq!(supervisor.reset_running_jobs().await.unwrap(), 2);

    let jobs = supervisor.get_all_jobs().await;
    assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
    assert!(jobs.iter().all(|j| j.worker_id.is_none() && j.started_at.is_none()));
}

#[tokio::test]
async fn test_claims_are_visible_across_instances() {
    let temp = TempDir::new().unwrap();
    let path = queue_path(&temp);
    let producer = open(&path).await;
    let worker_a = open(&path).await;
    let worker_b = open(&path).await;

    producer
        .enqueue(JobType::EvaluateTask, task_params("only"), 3)
        .await
        .unwrap();

    let a = worker_a.dequeue("task-worker-1", None).await.unwrap();
    let b = worker_b.dequeue("task-worker-2", None).await.unwrap();

    assert!(a.is_some());
    assert!(b.is_none());
}

#[tokio::test]
async fn test_concurrent_instances_do_not_lose_jobs() {
    let temp = TempDir::new().unwrap();
    let path = queue_path(&temp);

    let mut handles = Vec::new();
    for producer in 0..4 {
        let path = path.clone();
        handles.push(tokio::spawn(async move {
            let queue = open(&path).await;
            for i in 0..5 {
                queue
                    .enqueue(
                        JobType::EvaluateTask,
                        task_params(&format!("p{}-{}", producer, i)),
                        3,
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(open(&path).await.get_queue_stats().await.pending, 20);
}

#[tokio::test]
async fn test_mutations_do_not_overwrite_other_instances() {
    let temp = TempDir::new().unwrap();
    let path = queue_path(&temp);
    let first = open(&path).await;
    let second = open(&path).await;

    let a = first
        .enqueue(JobType::EvaluateTask, task_params("a"), 3)
        .await
        .unwrap();
    // `second` holds a stale snapshot; its write must merge, not clobber.
    let b = second
        .enqueue(JobType::EvaluateTask, task_params("b"), 3)
        .await
        .unwrap();

    let fresh = open(&path).await;
    assert!(fresh.get_job(a).await.is_some());
    assert!(fresh.get_job(b).await.is_some());
}

#[tokio::test]
async fn test_clear_completed_respects_retention() {
    let temp = TempDir::new().unwrap();
    let queue = open(&queue_path(&temp)).await;
    let id = queue
        .enqueue(JobType::GenerateMetrics, json!({"epoch": "epoch-001"}), 3)
        .await
        .unwrap();
    queue.dequeue("metrics-worker-1", None).await.unwrap();
    queue
        .complete_job(id, JobResult::success("ok", 0.1))
        .await
        .unwrap();
    queue
        .enqueue(JobType::GenerateMetrics, json!({"epoch": "epoch-002"}), 3)
        .await
        .unwrap();

    assert_eq!(
        queue.clear_completed_jobs(Duration::from_secs(3600)).await.unwrap(),
        0
    );
    assert_eq!(queue.clear_completed_jobs(Duration::ZERO).await.unwrap(), 1);

    let stats = queue.get_queue_stats().await;
    assert_eq!((stats.completed, stats.pending), (0, 1));
    assert_eq!(queue.clear_all_jobs().await.unwrap(), 1);
    assert_eq!(queue.get_queue_stats().await.total(), 0);
}

#[tokio::test]
async fn test_unknown_ids_are_not_errors() {
    let temp = TempDir::new().unwrap();
    let queue = open(&queue_path(&temp)).await;
    let id = uuid::Uuid::new_v4();

    assert!(queue.get_job(id).await.is_none());
    assert!(!queue
        .complete_job(id, JobResult::success("ok", 0.0))
        .await
        .unwrap());
    assert_eq!(queue.fail_job(id, "boom", true).await.unwrap(), None);
}

#[tokio::test]
async fn test_transition_walk() {
    let temp = TempDir::new().unwrap();
    let queue = open(&queue_path(&temp)).await;
    let id = queue
        .enqueue(JobType::EvolveEpoch, json!({"source_epoch": "1", "target_epoch": "2"}), 1)
        .await
        .unwrap();

    let mut seen = vec![queue.get_job(id).await.unwrap().status];
    queue.dequeue("evolution-worker-1", None).await.unwrap();
    seen.push(queue.get_job(id).await.unwrap().status);
    queue.fail_job(id, "oom", true).await.unwrap();
    seen.push(queue.get_job(id).await.unwrap().status);
    queue.dequeue("evolution-worker-1", None).await.unwrap();
    seen.push(queue.get_job(id).await.unwrap().status);
    queue
        .complete_job(id, JobResult::success("evolved", 30.0))
        .await
        .unwrap();
    seen.push(queue.get_job(id).await.unwrap().status);

    assert_eq!(
        seen,
        vec![
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
        ]
    );
}

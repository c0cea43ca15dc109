//! CLI command definitions for agent-eval.
//!
//! This module provides the command-line interface for running the worker
//! supervisor and administering the job queue.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{OrchestratorConfig, ParallelismConfig};
use crate::executor::{CommandExecutor, JobExecutor};
use crate::scheduler::{
    stop_running_supervisor, Job, JobQueue, JobStatus, JobType, QueueStats, ShutdownListener,
    StatusFiles, StopOutcome, Supervisor, SupervisorStatus, WorkerCommand, WorkerSummary,
    WorkerType,
};
use crate::worker::{Worker, WorkerConfig};

/// Default configuration file.
const DEFAULT_CONFIG_PATH: &str = "agent_eval.yaml";

/// Time `stop` allows on top of the workers' own stop timeout before it
/// escalates to SIGKILL.
const STOP_GRACE_MARGIN_SECS: u64 = 5;

/// Agent evaluation orchestrator.
#[derive(Parser)]
#[command(name = "agent-eval")]
#[command(about = "Run and administer the agent evaluation worker pool")]
#[command(version)]
#[command(
    long_about = "agent-eval runs a supervised pool of worker processes that evaluate, evolve, and validate agents.\n\nJobs live in a JSON queue file shared by every process.\n\nExample usage:\n  agent-eval enqueue --job-type evaluate_task --params '{\"epoch\":\"epoch-001\",\"task\":\"task-001\"}'\n  agent-eval start"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Configuration file; created with defaults if missing.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "AGENT_EVAL_CONFIG", global = true)]
    pub config: PathBuf,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the supervisor and its worker pool in the foreground.
    Start,

    /// Show supervisor and queue status.
    Status(StatusArgs),

    /// Stop a running supervisor.
    Stop(StopArgs),

    /// Requeue failed jobs that still have retries left.
    #[command(name = "retry-failed")]
    RetryFailed,

    /// Delete finished jobs older than the short retention window.
    #[command(name = "clear-queue")]
    ClearQueue,

    /// Reset jobs stuck in `running` back to `pending`.
    #[command(name = "reset-queue")]
    ResetQueue,

    /// Delete ALL jobs from the queue.
    #[command(name = "clear-all-jobs")]
    ClearAllJobs(ClearAllJobsArgs),

    /// Add a job to the queue.
    Enqueue(EnqueueArgs),

    /// List jobs in the queue.
    Jobs(JobsArgs),

    /// Run a single worker loop (spawned by the supervisor).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for `agent-eval status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output JSON instead of a human-readable summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `agent-eval stop`.
#[derive(Parser, Debug)]
pub struct StopArgs {
    /// Seconds to wait after SIGTERM before sending SIGKILL
    /// (defaults to the worker stop timeout plus a margin).
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,
}

/// Arguments for `agent-eval clear-all-jobs`.
#[derive(Parser, Debug)]
pub struct ClearAllJobsArgs {
    /// Skip the interactive confirmation.
    #[arg(long)]
    pub yes: bool,
}

/// Arguments for `agent-eval enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Job type (evaluate_task, evolve_epoch, compile_check, generate_metrics).
    #[arg(short = 't', long)]
    pub job_type: JobType,

    /// Job parameters as a JSON object.
    #[arg(short = 'p', long, default_value = "{}")]
    pub params: String,

    /// Maximum automatic retries (defaults to the configured value).
    #[arg(short = 'r', long)]
    pub max_retries: Option<u32>,
}

/// Arguments for `agent-eval jobs`.
#[derive(Parser, Debug)]
pub struct JobsArgs {
    /// Only list jobs with this status.
    #[arg(short = 's', long)]
    pub status: Option<JobStatus>,

    /// Only list jobs of this type.
    #[arg(short = 't', long)]
    pub job_type: Option<JobType>,

    /// Output JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `agent-eval worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker identity.
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: String,

    /// Worker type, deciding which jobs are claimed.
    #[arg(long, env = "WORKER_TYPE")]
    pub worker_type: WorkerType,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the agent-eval CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Start => run_start_command(config, &cli.config, &cli.log_level).await,
        Commands::Status(args) => run_status_command(&config, args).await,
        Commands::Stop(args) => run_stop_command(&config, args).await,
        Commands::RetryFailed => {
            let queue = open_queue(&config).await?;
            let retried = queue.retry_failed_jobs().await?;
            println!("Retried {} failed jobs", retried);
            Ok(())
        }
        Commands::ClearQueue => {
            let queue = open_queue(&config).await?;
            let retention = Duration::from_secs(config.retention.clear_queue_retention_secs);
            let removed = queue.clear_completed_jobs(retention).await?;
            println!("Cleared {} finished jobs", removed);
            Ok(())
        }
        Commands::ResetQueue => {
            let queue = open_queue(&config).await?;
            let reset = queue.reset_running_jobs().await?;
            println!("Reset {} stuck running jobs to pending", reset);
            Ok(())
        }
        Commands::ClearAllJobs(args) => run_clear_all_command(&config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(&config, args).await,
        Commands::Jobs(args) => run_jobs_command(&config, args).await,
        Commands::Worker(args) => run_worker_command(config, args).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    let config = OrchestratorConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        .apply_env_overrides()?;
    Ok(config)
}

async fn open_queue(config: &OrchestratorConfig) -> anyhow::Result<JobQueue> {
    let path = config.queue_path();
    JobQueue::open(&path, config.store_options())
        .await
        .with_context(|| format!("Failed to open job queue at {}", path.display()))
}

// ============================================================================
// Supervisor Commands
// ============================================================================

async fn run_start_command(
    config: OrchestratorConfig,
    config_path: &Path,
    log_level: &str,
) -> anyhow::Result<()> {
    let queue = Arc::new(open_queue(&config).await?);
    let command = WorkerCommand::current_exe(Some(config_path), Some(log_level))
        .context("Failed to resolve the agent-eval executable")?;

    info!(
        workers = config.parallelism.total_workers(),
        state_dir = %config.state_dir.display(),
        "Starting supervisor"
    );
    Supervisor::new(config, queue, command).run().await?;
    Ok(())
}

async fn run_stop_command(config: &OrchestratorConfig, args: StopArgs) -> anyhow::Result<()> {
    let files = StatusFiles::from_config(config);
    let grace = Duration::from_secs(stop_grace_secs(config, &args));
    match stop_running_supervisor(&files, grace).await? {
        StopOutcome::NotRunning => println!("No running supervisor found"),
        StopOutcome::Terminated { pid } => println!("Supervisor stopped (PID: {})", pid),
        StopOutcome::Killed { pid, orphans } => {
            println!("Supervisor did not stop in time and was killed (PID: {})", pid);
            if orphans > 0 {
                println!("Killed {} workers it left behind", orphans);
            }
        }
    }
    Ok(())
}

/// Grace period for `stop`: long enough for the supervisor to stop its
/// workers with their own timeout.
fn stop_grace_secs(config: &OrchestratorConfig, args: &StopArgs) -> u64 {
    args.timeout
        .unwrap_or(config.timeouts.worker_stop_timeout + STOP_GRACE_MARGIN_SECS)
}

/// Merged view printed by `status`.
#[derive(Debug, Serialize)]
struct StatusReport {
    running: bool,
    pid: Option<u32>,
    workers: WorkersReport,
    queue: QueueStats,
    parallelism: ParallelismConfig,
}

#[derive(Debug, Serialize)]
struct WorkersReport {
    total: usize,
    alive: usize,
    details: Vec<WorkerSummary>,
}

impl StatusReport {
    fn new(status: Option<SupervisorStatus>, queue: QueueStats, config: &OrchestratorConfig) -> Self {
        match status {
            Some(status) => Self {
                running: status.running,
                pid: Some(status.pid),
                workers: WorkersReport {
                    total: status.workers.len(),
                    alive: status.alive_workers(),
                    details: status.workers.into_values().collect(),
                },
                queue,
                parallelism: status.parallelism,
            },
            None => Self {
                running: false,
                pid: None,
                workers: WorkersReport {
                    total: 0,
                    alive: 0,
                    details: Vec::new(),
                },
                queue,
                parallelism: config.parallelism.clone(),
            },
        }
    }

    fn render(&self) -> String {
        let rule = "=".repeat(60);
        let mut out = String::new();
        out.push_str(&format!("{}\nSUPERVISOR STATUS\n{}\n", rule, rule));
        out.push_str(&format!("Running: {}\n", self.running));
        out.push_str(&format!(
            "Workers: {}/{} alive\n",
            self.workers.alive, self.workers.total
        ));

        out.push_str("\nQueue Status:\n");
        for status in JobStatus::ALL {
            out.push_str(&format!("  {:<10} {}\n", status, self.queue.count(status)));
        }

        if !self.workers.details.is_empty() {
            out.push_str("\nWorkers:\n");
            for worker in &self.workers.details {
                let pid = worker
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                out.push_str(&format!(
                    "  [{}] {} ({}) PID:{} restarts:{}\n",
                    if worker.is_alive { "up" } else { "down" },
                    worker.worker_id,
                    worker.worker_type,
                    pid,
                    worker.restarts
                ));
            }
        }

        if let Some(pid) = self.pid {
            out.push_str(&format!("\nSupervisor PID: {}\n", pid));
        }
        out.push_str(&rule);
        out
    }
}

async fn run_status_command(config: &OrchestratorConfig, args: StatusArgs) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let files = StatusFiles::from_config(config);
    let status = files.load_live().await;
    let report = StatusReport::new(status, queue.get_queue_stats().await, config);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render());
    }
    Ok(())
}

// ============================================================================
// Queue Commands
// ============================================================================

/// Returns whether an answer to the confirmation prompt means "yes".
fn confirmed(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

async fn run_clear_all_command(
    config: &OrchestratorConfig,
    args: ClearAllJobsArgs,
) -> anyhow::Result<()> {
    if !args.yes {
        print!("This will DELETE ALL JOBS from the queue. Are you sure? (yes/no): ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !confirmed(&answer) {
            println!("Operation cancelled");
            return Ok(());
        }
    }

    let queue = open_queue(config).await?;
    let cleared = queue.clear_all_jobs().await?;
    warn!(cleared, "Cleared all jobs from the queue");
    println!("Cleared {} jobs from the queue", cleared);
    Ok(())
}

/// Parses `--params`, which must be a JSON object.
fn parse_params(raw: &str) -> anyhow::Result<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("--params is not valid JSON")?;
    if !value.is_object() {
        bail!("--params must be a JSON object, got: {}", raw);
    }
    Ok(value)
}

async fn run_enqueue_command(config: &OrchestratorConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let params = parse_params(&args.params)?;
    let max_retries = args.max_retries.unwrap_or(config.queue.default_max_retries);

    let queue = open_queue(config).await?;
    let id = queue.enqueue(args.job_type, params, max_retries).await?;
    println!("{}", id);
    Ok(())
}

fn job_row(job: &Job) -> String {
    format!(
        "{:<10} {:<17} {:<10} {}/{:<4} {:<20} {}",
        job.short_id(),
        job.job_type,
        job.status,
        job.retry_count,
        job.max_retries,
        job.worker_id.as_deref().unwrap_or("-"),
        job.created_at.format("%Y-%m-%d %H:%M:%S")
    )
}

async fn run_jobs_command(config: &OrchestratorConfig, args: JobsArgs) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let jobs: Vec<Job> = match args.status {
        Some(status) => queue.get_jobs_by_status(status).await,
        None => queue.get_all_jobs().await,
    }
    .into_iter()
    .filter(|job| args.job_type.map_or(true, |t| job.job_type == t))
    .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }
    println!(
        "{:<10} {:<17} {:<10} {:<6} {:<20} {}",
        "ID", "TYPE", "STATUS", "RETRY", "WORKER", "CREATED"
    );
    for job in &jobs {
        println!("{}", job_row(job));
        if let Some(error) = job.result.as_ref().map(|r| r.error.as_str()).filter(|e| !e.is_empty()) {
            println!("           error: {}", error);
        }
    }
    Ok(())
}

// ============================================================================
// Worker Command
// ============================================================================

async fn run_worker_command(config: OrchestratorConfig, args: WorkerArgs) -> anyhow::Result<()> {
    let queue = Arc::new(open_queue(&config).await?);
    let executor: Arc<dyn JobExecutor> = Arc::new(CommandExecutor::from_config(&config));

    let mut listener = ShutdownListener::install().context("Failed to install signal handlers")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        listener.recv().await;
        // Ignore send error - the worker may have already stopped
        let _ = shutdown_tx.send(true);
    });

    let worker_config = WorkerConfig::new(args.worker_id, args.worker_type)
        .with_poll_interval(config.timeouts.poll_interval());
    let stats = Worker::new(worker_config, queue, executor, shutdown_rx)
        .run()
        .await?;

    info!(
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        "Worker exiting"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::collections::BTreeMap;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::try_parse_from(["agent-eval", "status", "--config", "/tmp/eval.yaml", "-l", "debug"])
            .expect("should parse");

        assert_eq!(cli.config, PathBuf::from("/tmp/eval.yaml"));
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Status(args) => assert!(!args.json),
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_admin_subcommand_names() {
        for name in ["start", "retry-failed", "clear-queue", "reset-queue", "clear-all-jobs"] {
            assert!(
                Cli::try_parse_from(["agent-eval", name]).is_ok(),
                "{} should parse",
                name
            );
        }
    }

    #[test]
    fn test_stop_grace_outlasts_worker_stop_timeout() {
        let mut config = OrchestratorConfig::default();
        config.timeouts.worker_stop_timeout = 10;

        let cli = Cli::try_parse_from(["agent-eval", "stop"]).expect("should parse");
        match cli.command {
            Commands::Stop(args) => {
                assert_eq!(args.timeout, None);
                assert!(stop_grace_secs(&config, &args) > config.timeouts.worker_stop_timeout);
            }
            _ => panic!("Expected Stop command"),
        }

        let cli = Cli::try_parse_from(["agent-eval", "stop", "--timeout", "3"]).expect("should parse");
        match cli.command {
            Commands::Stop(args) => assert_eq!(stop_grace_secs(&config, &args), 3),
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_enqueue_command() {
        let cli = Cli::try_parse_from([
            "agent-eval",
            "enqueue",
            "--job-type",
            "compile_check",
            "--params",
            r#"{"epoch":"epoch-001","task":"task-002"}"#,
            "--max-retries",
            "1",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.job_type, JobType::CompileCheck);
                assert_eq!(args.max_retries, Some(1));
                assert_eq!(parse_params(&args.params).unwrap()["task"], "task-002");
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_enqueue_rejects_unknown_job_type() {
        assert!(Cli::try_parse_from(["agent-eval", "enqueue", "--job-type", "deploy"]).is_err());
    }

    #[test]
    fn test_jobs_status_filter() {
        let cli = Cli::try_parse_from(["agent-eval", "jobs", "--status", "failed"]).expect("should parse");
        match cli.command {
            Commands::Jobs(args) => assert_eq!(args.status, Some(JobStatus::Failed)),
            _ => panic!("Expected Jobs command"),
        }
    }

    #[test]
    fn test_worker_args() {
        let cli = Cli::try_parse_from([
            "agent-eval",
            "worker",
            "--worker-id",
            "validation-worker-2",
            "--worker-type",
            "validation",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.worker_id, "validation-worker-2");
                assert_eq!(args.worker_type, WorkerType::Validation);
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_parse_params_requires_object() {
        assert!(parse_params("{}").is_ok());
        assert!(parse_params("[1, 2]").is_err());
        assert!(parse_params("{not json").is_err());
    }

    #[test]
    fn test_confirmation() {
        assert!(confirmed("yes\n"));
        assert!(confirmed("YES"));
        assert!(!confirmed("y"));
        assert!(!confirmed(""));
    }

    #[test]
    fn test_status_report_without_supervisor() {
        let config = OrchestratorConfig::default();
        let queue = QueueStats {
            pending: 3,
            failed: 1,
            ..QueueStats::default()
        };

        let report = StatusReport::new(None, queue, &config);
        let text = report.render();

        assert!(!report.running);
        assert!(text.contains("Running: false"));
        assert!(text.contains("Workers: 0/0 alive"));
        assert!(text.contains("pending    3"));
        assert!(!text.contains("Supervisor PID"));
    }

    #[test]
    fn test_status_report_with_supervisor() {
        let mut workers = BTreeMap::new();
        workers.insert(
            "task-worker-1".to_string(),
            WorkerSummary {
                worker_id: "task-worker-1".to_string(),
                worker_type: WorkerType::TaskEvaluation,
                pid: Some(4242),
                started_at: None,
                is_alive: true,
                state: crate::scheduler::WorkerState::Running,
                restarts: 1,
            },
        );
        let status = SupervisorStatus {
            pid: 4000,
            running: true,
            started_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            workers,
            parallelism: ParallelismConfig::default(),
            queue: QueueStats::default(),
        };

        let report = StatusReport::new(Some(status), QueueStats::default(), &OrchestratorConfig::default());
        let text = report.render();

        assert!(text.contains("Workers: 1/1 alive"));
        assert!(text.contains("[up] task-worker-1 (task_evaluation) PID:4242 restarts:1"));
        assert!(text.contains("Supervisor PID: 4000"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["workers"]["alive"], 1);
        assert_eq!(json["pid"], 4000);
    }
}

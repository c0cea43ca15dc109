//! File-backed job store.
//!
//! The store translates between the in-memory job map and a single JSON
//! document on disk:
//!
//! ```text
//! { "jobs": { "<uuid>": { ...job record... }, ... }, "saved_at": "<rfc3339>" }
//! ```
//!
//! # Durability
//!
//! Writes go to a uniquely named temporary file in the same directory as the
//! target, are flushed with `fsync`, then renamed over the target. Readers in
//! other processes therefore see either the previous document or the new one,
//! never a partial write.
//!
//! # Corruption tolerance
//!
//! Each job record is decoded on its own. A malformed record is skipped and
//! logged without affecting its siblings. A document that cannot be parsed at
//! all is retried with backoff and finally replaced by an empty document so a
//! corrupted file cannot wedge every process sharing it.
//!
//! # Cross-process locking
//!
//! [`JobStore::lock`] takes an advisory `flock` on a sidecar `<file>.lock`.
//! The sidecar is never renamed, so the lock survives the atomic replace of
//! the queue file itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::job::Job;

/// Number of attempts for a single save.
const SAVE_ATTEMPTS: u32 = 3;

/// Number of attempts for a single load.
const LOAD_ATTEMPTS: u32 = 5;

/// How often a contended lock is retried.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to read or write to the filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize the job map.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every save attempt failed; the previous file is untouched.
    #[error("Failed to save {path} after {attempts} attempts: {message}")]
    SaveFailed {
        path: String,
        attempts: u32,
        message: String,
    },

    /// Another process held the queue lock for too long.
    #[error("Timed out after {0:?} waiting for the queue lock")]
    LockTimeout(Duration),
}

/// Tuning knobs for persistence.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Base delay for linear backoff between attempts.
    pub retry_backoff: Duration,
    /// Maximum time to wait for the cross-process lock.
    pub lock_timeout: Duration,
    /// Demotes per-record and retry diagnostics from `warn` to `debug`.
    pub silent: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(100),
            lock_timeout: Duration::from_secs(10),
            silent: false,
        }
    }
}

impl StoreOptions {
    /// Sets the retry backoff base.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Enables or disables silent mode.
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

/// Summary of a single load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Records decoded successfully.
    pub loaded: usize,
    /// Records skipped as malformed.
    pub skipped: usize,
    /// Whether the document was unreadable and replaced by an empty one.
    pub healed: bool,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    jobs: &'a BTreeMap<Uuid, Job>,
    saved_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    jobs: serde_json::Map<String, serde_json::Value>,
}

/// Guard for the cross-process queue lock. Released on drop.
pub struct StoreLock {
    #[cfg(unix)]
    _guard: nix::fcntl::Flock<std::fs::File>,
}

/// In-memory job map backed by an atomically replaced JSON file.
#[derive(Debug)]
pub struct JobStore {
    path: PathBuf,
    lock_path: PathBuf,
    jobs: BTreeMap<Uuid, Job>,
    options: StoreOptions,
}

impl JobStore {
    /// Opens the store at `path`, creating its directory and loading any existing jobs.
    pub async fn open(path: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut store = Self {
            lock_path: sidecar_path(&path, "lock"),
            path,
            jobs: BTreeMap::new(),
            options,
        };
        if store.load().await.healed {
            store.persist_heal().await;
        }
        Ok(store)
    }

    /// Writes the empty map left by a healed load, under the queue lock.
    ///
    /// The file is re-read once the lock is held so a document repaired by
    /// another process in the meantime is kept.
    async fn persist_heal(&mut self) {
        let _lock = match self.lock().await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "Queue is locked, leaving the healed file to the next writer");
                return;
            }
        };
        if !self.load().await.healed {
            return;
        }
        if let Err(e) = self.save().await {
            error!(error = %e, "Failed to persist healed job queue");
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read access to the in-memory job map.
    pub fn jobs(&self) -> &BTreeMap<Uuid, Job> {
        &self.jobs
    }

    /// Mutable access to the in-memory job map. Callers persist with [`JobStore::save`].
    pub fn jobs_mut(&mut self) -> &mut BTreeMap<Uuid, Job> {
        &mut self.jobs
    }

    /// Re-reads the backing file into memory.
    ///
    /// This is the only way to observe writes made by other processes.
    pub async fn reload(&mut self) -> LoadReport {
        self.load().await
    }

    /// Loads the backing file, replacing the in-memory map.
    ///
    /// Never fails: unreadable documents heal to an empty map. The healed
    /// state is not written back; callers holding the lock persist it when
    /// [`LoadReport::healed`] is set.
    pub async fn load(&mut self) -> LoadReport {
        let mut last_error = String::new();

        for attempt in 1..=LOAD_ATTEMPTS {
            let content = match fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.jobs.clear();
                    return LoadReport::default();
                }
                Err(e) => {
                    last_error = e.to_string();
                    self.note_retry("read", attempt, &last_error);
                    self.backoff(attempt).await;
                    continue;
                }
            };

            if content.trim().is_empty() {
                // A writer on a filesystem without atomic rename may leave this briefly.
                if attempt < LOAD_ATTEMPTS {
                    self.backoff(attempt).await;
                    continue;
                }
                self.jobs.clear();
                return LoadReport::default();
            }

            match serde_json::from_str::<RawSnapshot>(&content) {
                Ok(raw) => return self.decode(raw),
                Err(e) => {
                    last_error = e.to_string();
                    self.note_retry("parse", attempt, &last_error);
                    self.backoff(attempt).await;
                }
            }
        }

        error!(
            path = %self.path.display(),
            error = %last_error,
            "Job queue file unreadable, resetting to an empty queue"
        );
        self.jobs.clear();

        LoadReport {
            healed: true,
            ..LoadReport::default()
        }
    }

    fn decode(&mut self, raw: RawSnapshot) -> LoadReport {
        let mut jobs = BTreeMap::new();
        let mut skipped = 0;

        for (key, value) in raw.jobs {
            match serde_json::from_value::<Job>(value) {
                Ok(job) => {
                    if Uuid::parse_str(&key).ok() != Some(job.id) {
                        debug!(key = %key, job_id = %job.id, "Job key does not match record id");
                    }
                    jobs.insert(job.id, job);
                }
                Err(e) => {
                    skipped += 1;
                    if self.options.silent {
                        debug!(key = %key, error = %e, "Skipping malformed job record");
                    } else {
                        warn!(key = %key, error = %e, "Skipping malformed job record");
                    }
                }
            }
        }

        let loaded = jobs.len();
        self.jobs = jobs;
        LoadReport {
            loaded,
            skipped,
            healed: false,
        }
    }

    /// Persists the full job map atomically.
    ///
    /// On failure the previous file is left untouched.
    pub async fn save(&self) -> Result<(), StoreError> {
        let snapshot = SnapshotRef {
            jobs: &self.jobs,
            saved_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let mut last_error = String::new();
        for attempt in 1..=SAVE_ATTEMPTS {
            match write_atomic(&self.path, &bytes).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    self.note_retry("save", attempt, &last_error);
                    if attempt < SAVE_ATTEMPTS {
                        self.backoff(attempt).await;
                    }
                }
            }
        }

        error!(
            path = %self.path.display(),
            error = %last_error,
            "Giving up on saving job queue"
        );
        Err(StoreError::SaveFailed {
            path: self.path.display().to_string(),
            attempts: SAVE_ATTEMPTS,
            message: last_error,
        })
    }

    /// Acquires the cross-process queue lock, polling until the configured timeout.
    pub async fn lock(&self) -> Result<StoreLock, StoreError> {
        acquire_lock(&self.lock_path, self.options.lock_timeout).await
    }

    async fn backoff(&self, attempt: u32) {
        tokio::time::sleep(self.options.retry_backoff * attempt).await;
    }

    fn note_retry(&self, op: &str, attempt: u32, error: &str) {
        if self.options.silent {
            debug!(op, attempt, error, path = %self.path.display(), "Job queue I/O retry");
        } else {
            warn!(op, attempt, error, path = %self.path.display(), "Job queue I/O retry");
        }
    }
}

/// Returns `<path>.<suffix>` next to `path`.
fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Writes `bytes` to `path` through a temporary file in the same directory.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        Uuid::new_v4().simple()
    ));

    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

#[cfg(unix)]
async fn acquire_lock(lock_path: &Path, timeout: Duration) -> Result<StoreLock, StoreError> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)?;
    let deadline = Instant::now() + timeout;

    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => return Ok(StoreLock { _guard: guard }),
            Err((returned, Errno::EWOULDBLOCK)) => {
                if Instant::now() >= deadline {
                    return Err(StoreError::LockTimeout(timeout));
                }
                file = returned;
                tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            }
            Err((_, errno)) => return Err(StoreError::Io(std::io::Error::from(errno))),
        }
    }
}

#[cfg(not(unix))]
async fn acquire_lock(_lock_path: &Path, _timeout: Duration) -> Result<StoreLock, StoreError> {
    Ok(StoreLock {})
}

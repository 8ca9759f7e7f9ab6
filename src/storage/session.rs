//! Crash-safe persistence of the pending queue and rate-limit state
//!
//! Every save goes through the same sequence:
//!
//! 1. Serialize to `<file>.tmp`
//! 2. Read the temp file back and parse it
//! 3. Copy the current file into numbered backups (`.bak1` newest)
//! 4. Rename the temp file over the primary
//!
//! A write that cannot be parsed back is discarded and the primary is left
//! untouched. On restore the primary is tried first, then each backup in turn.
//!
//! # Example
//!
//! ```no_run
//! use claimfleet::storage::SessionStore;
//! use std::collections::HashMap;
//!
//! # fn example() -> anyhow::Result<()> {
//! let store = SessionStore::new("./data/session_state.json", 3);
//! store.persist(&[], HashMap::new())?;
//!
//! if let Some(session) = store.restore()? {
//!     println!("{} jobs restored", session.jobs.len());
//! }
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::{AccountProfile, Job};
use crate::utils::{from_unix_secs, to_unix_secs};

/// Current session document version
pub const SESSION_VERSION: u32 = 1;

/// Restored jobs further overdue than this run now instead
const STALE_AFTER_SECS: i64 = 3600;

// ============================================================================
// Document Types
// ============================================================================

/// On-disk form of a queued job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    /// Unix seconds
    pub next_run: f64,
    pub account: AccountProfile,
    pub target_type: String,
    pub operation: String,
    #[serde(default)]
    pub retry_count: u32,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            priority: job.priority,
            next_run: to_unix_secs(job.next_run),
            account: job.account.clone(),
            target_type: job.target_type.clone(),
            operation: job.operation.clone(),
            retry_count: job.retry_count,
        }
    }
}

impl JobRecord {
    /// Rebuild the job, pulling long-overdue or unreadable run times to `now`
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        let stale_before = now - Duration::seconds(STALE_AFTER_SECS);
        let next_run = match from_unix_secs(self.next_run) {
            Some(at) if at >= stale_before => at,
            _ => now,
        };

        Job {
            id: self.id,
            priority: self.priority,
            next_run,
            name: self.name,
            account: self.account,
            target_type: self.target_type,
            operation: self.operation,
            retry_count: self.retry_count,
        }
    }
}

/// Versioned session file body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Save time, unix seconds
    pub timestamp: f64,

    #[serde(default)]
    pub domain_last_access: HashMap<String, f64>,

    #[serde(default)]
    pub queue: Vec<JobRecord>,
}

fn default_version() -> u32 {
    SESSION_VERSION
}

/// Result of a successful restore
#[derive(Debug, Clone)]
pub struct RestoredSession {
    pub jobs: Vec<Job>,
    pub domain_last_access: HashMap<String, f64>,
    pub saved_at: Option<DateTime<Utc>>,

    /// File the session was read from (primary or a backup)
    pub source: PathBuf,
}

// ============================================================================
// Session Store
// ============================================================================

/// Atomic, backup-protected session file
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    backup_count: usize,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>, backup_count: usize) -> Self {
        Self {
            path: path.into(),
            backup_count,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of backup `n` (1 is the newest)
    pub fn backup_path(&self, n: usize) -> PathBuf {
        with_suffix(&self.path, &format!(".bak{n}"))
    }

    fn temp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    /// Save the queue and the rate limiter's last-access map
    pub fn persist(&self, jobs: &[Job], domain_last_access: HashMap<String, f64>) -> Result<PathBuf> {
        let document = SessionDocument {
            version: SESSION_VERSION,
            timestamp: to_unix_secs(Utc::now()),
            domain_last_access,
            queue: jobs.iter().map(JobRecord::from).collect(),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create session directory: {}", parent.display()))?;
        }

        let temp_path = self.temp_path();
        write_document(&temp_path, &document)?;

        if let Err(e) = verify_document(&temp_path, document.queue.len()) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.context("Session write failed verification, previous file kept"));
        }

        self.rotate_backups()?;

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename session file: {}", self.path.display()))?;

        tracing::debug!(
            path = %self.path.display(),
            jobs = document.queue.len(),
            "Session saved"
        );
        Ok(self.path.clone())
    }

    /// Load the newest readable session now
    pub fn restore(&self) -> Result<Option<RestoredSession>> {
        self.restore_at(Utc::now())
    }

    /// Load the newest readable session, falling back through the backups.
    ///
    /// Returns `Ok(None)` when no candidate file exists or none can be parsed.
    pub fn restore_at(&self, now: DateTime<Utc>) -> Result<Option<RestoredSession>> {
        let candidates =
            std::iter::once(self.path.clone()).chain((1..=self.backup_count).map(|n| self.backup_path(n)));

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }

            match read_document(&candidate) {
                Ok(document) => {
                    if candidate != self.path {
                        tracing::warn!(
                            path = %candidate.display(),
                            "Primary session file unreadable, restored from backup"
                        );
                    }

                    let jobs: Vec<Job> = document
                        .queue
                        .into_iter()
                        .map(|record| record.into_job(now))
                        .collect();

                    tracing::info!(
                        path = %candidate.display(),
                        jobs = jobs.len(),
                        "Session restored"
                    );

                    return Ok(Some(RestoredSession {
                        jobs,
                        domain_last_access: document.domain_last_access,
                        saved_at: from_unix_secs(document.timestamp),
                        source: candidate,
                    }));
                }
                Err(e) => {
                    tracing::warn!(path = %candidate.display(), error = %e, "Skipping unreadable session file");
                }
            }
        }

        Ok(None)
    }

    fn rotate_backups(&self) -> Result<()> {
        if self.backup_count == 0 || !self.path.exists() {
            return Ok(());
        }

        for n in (1..self.backup_count).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                let to = self.backup_path(n + 1);
                fs::rename(&from, &to)
                    .with_context(|| format!("Failed to rotate backup: {}", from.display()))?;
            }
        }

        // Copy rather than move so the primary stays valid until the final rename
        let newest = self.backup_path(1);
        fs::copy(&self.path, &newest)
            .with_context(|| format!("Failed to back up session file to {}", newest.display()))?;
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_document(path: &Path, document: &SessionDocument) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create session file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, document).context("Failed to serialize session")?;
    writer.flush().context("Failed to flush session file")?;
    writer
        .get_ref()
        .sync_all()
        .with_context(|| format!("Failed to sync session file: {}", path.display()))?;
    Ok(())
}

fn read_document(path: &Path) -> Result<SessionDocument> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read session file: {}", path.display()))?;
    let document: SessionDocument = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse session file: {}", path.display()))?;

    if document.version > SESSION_VERSION {
        bail!(
            "Unsupported session version {} (expected <= {})",
            document.version,
            SESSION_VERSION
        );
    }
    Ok(document)
}

fn verify_document(path: &Path, expected_jobs: usize) -> Result<()> {
    let document = read_document(path)?;
    if document.queue.len() != expected_jobs {
        bail!(
            "Session read back {} jobs, wrote {}",
            document.queue.len(),
            expected_jobs
        );
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

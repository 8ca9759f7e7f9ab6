//! Local on-disk state
//!
//! - [`session`] - Atomic, backup-protected queue and rate-limit snapshot
//! - [`heartbeat`] - Plain-text liveness file for an external monitor

pub mod heartbeat;
pub mod session;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use heartbeat::{Heartbeat, HeartbeatWriter};
pub use session::{JobRecord, RestoredSession, SessionDocument, SessionStore, SESSION_VERSION};

/// File locations for persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Session snapshot file
    pub session_path: PathBuf,

    /// Number of numbered backups kept next to the session file
    pub backup_count: usize,

    /// Heartbeat file read by the liveness monitor
    pub heartbeat_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_path: PathBuf::from("data/session_state.json"),
            backup_count: 3,
            heartbeat_path: PathBuf::from("data/heartbeat.txt"),
        }
    }
}

impl StorageConfig {
    pub fn session_store(&self) -> SessionStore {
        SessionStore::new(self.session_path.clone(), self.backup_count)
    }

    pub fn heartbeat_writer(&self) -> HeartbeatWriter {
        HeartbeatWriter::new(self.heartbeat_path.clone())
    }
}

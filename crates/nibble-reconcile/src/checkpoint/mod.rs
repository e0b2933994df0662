//! Scan position persistence and deadline control.
//!
//! A [`Checkpoint`] records where the next run should resume. It is written
//! after every completed window, never mid-window. Stores implement
//! [`CheckpointStore`]:
//!
//! - [`FileCheckpointStore`]: JSON file, HMAC-signed, atomic writes
//! - [`MemoryCheckpointStore`]: process-local map, used by tests and embedders
//! - [`NoOpCheckpointStore`]: no resume capability
//!
//! A checkpoint has a single owning run at a time; callers serialize runs per
//! job.

mod deadline;
mod memory;

pub use deadline::Deadline;
pub use memory::{MemoryCheckpointStore, NoOpCheckpointStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::{Direction, Key};
use crate::error::{ReconcileError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Persisted scan position for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// First key of the next unscanned window. `None` once a full pass
    /// completed, so the next run starts from the beginning.
    pub position: Option<Key>,

    /// Direction the position is valid for.
    pub direction: Direction,

    /// When the checkpoint was written.
    pub timestamp: DateTime<Utc>,

    /// Windows completed in the run that wrote it.
    #[serde(default)]
    pub windows_completed: u64,
}

impl Checkpoint {
    /// Create a checkpoint stamped with the current time.
    pub fn new(position: Option<Key>, direction: Direction, windows_completed: u64) -> Self {
        Self {
            position,
            direction,
            timestamp: Utc::now(),
            windows_completed,
        }
    }

    /// Position to resume from, if this checkpoint applies to `direction`.
    pub fn resume_position(&self, direction: Direction) -> Option<&Key> {
        if self.direction == direction {
            self.position.as_ref()
        } else {
            None
        }
    }

    pub fn is_complete(&self) -> bool {
        self.position.is_none()
    }
}

/// External store for checkpoints, keyed by job id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the checkpoint for a job, if any.
    async fn get(&self, job_id: &str) -> Result<Option<Checkpoint>>;

    /// Merge a checkpoint into persisted state. Last write wins.
    async fn merge(&self, job_id: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

/// On-disk layout of a checkpoint file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointFile {
    jobs: BTreeMap<String, Checkpoint>,

    /// HMAC-SHA256 over the serialized file (excluding this field).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
}

impl CheckpointFile {
    fn compute_hmac(&self, key: &str) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| ReconcileError::Checkpoint(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// JSON-file checkpoint store.
///
/// Several jobs can share one file. When a signing key is set (normally
/// [`Config::hash`](crate::Config::hash)), the file is HMAC-signed and a file
/// signed with a different key is rejected with
/// [`ReconcileError::ConfigChanged`].
pub struct FileCheckpointStore {
    path: PathBuf,
    signing_key: Option<String>,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            signing_key: None,
            lock: Mutex::new(()),
        }
    }

    /// Sign and verify the file with `key`.
    pub fn with_signing_key(mut self, key: impl Into<String>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<CheckpointFile> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointFile::default());
            }
            Err(e) => return Err(e.into()),
        };

        let file: CheckpointFile = serde_json::from_str(&content)?;

        if let Some(key) = &self.signing_key {
            match &file.hmac {
                Some(stored) if *stored != file.compute_hmac(key)? => {
                    return Err(ReconcileError::ConfigChanged);
                }
                Some(_) => {}
                None => warn!(
                    "Checkpoint file {} has no HMAC signature, integrity cannot be verified",
                    self.path.display()
                ),
            }
        }

        Ok(file)
    }

    async fn save(&self, file: &mut CheckpointFile) -> Result<()> {
        file.hmac = match &self.signing_key {
            Some(key) => Some(file.compute_hmac(key)?),
            None => None,
        };

        let content = serde_json::to_string_pretty(file)?;

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        Ok(file.jobs.get(job_id).cloned())
    }

    async fn merge(&self, job_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        file.jobs.insert(job_id.to_string(), checkpoint.clone());
        self.save(&mut file).await?;
        debug!(
            "Checkpoint for {} saved to {} (position: {:?})",
            job_id,
            self.path.display(),
            checkpoint.position
        );
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

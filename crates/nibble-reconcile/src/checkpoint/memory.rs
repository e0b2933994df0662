//! Process-local and no-op checkpoint stores.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::warn;

use super::{Checkpoint, CheckpointStore};
use crate::error::Result;

/// Checkpoint store kept in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    jobs: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }

    async fn merge(&self, job_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.jobs
            .lock()
            .await
            .insert(job_id.to_string(), checkpoint.clone());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Checkpoint store that doesn't persist anything.
///
/// Runs always scan the whole key space. Logs a warning on first use.
pub struct NoOpCheckpointStore {
    warned: AtomicBool,
}

impl NoOpCheckpointStore {
    pub fn new() -> Self {
        Self {
            warned: AtomicBool::new(false),
        }
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                "Using no-op checkpoint store: scan position will not be persisted. \
                 Interrupted runs restart from the beginning."
            );
        }
    }
}

impl Default for NoOpCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for NoOpCheckpointStore {
    async fn get(&self, _job_id: &str) -> Result<Option<Checkpoint>> {
        self.warn_once();
        Ok(None)
    }

    async fn merge(&self, _job_id: &str, _checkpoint: &Checkpoint) -> Result<()> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "noop"
    }
}

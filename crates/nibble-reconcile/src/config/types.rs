//! Configuration type definitions.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::Direction;
use crate::retry::RetryPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Human-readable job name used in logs and reports.
    pub job_name: String,

    /// Stable job identifier; keys the checkpoint.
    pub job_id: String,

    /// Authoritative dataset.
    pub master: DatasetConfig,

    /// Replica dataset; extra rows are deleted from here.
    pub slave: DatasetConfig,

    /// Reconciliation behavior.
    #[serde(default)]
    pub options: RunOptions,

    /// Retry behavior for per-window queries.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Where scan progress is persisted between runs. No checkpointing if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_file: Option<PathBuf>,
}

/// A flat JSON dataset (`{"id": row, ...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Path to the JSON file.
    pub path: PathBuf,

    /// Largest window `individual` may answer before reporting the payload
    /// as too large. Unlimited if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_individual_rows: Option<usize>,
}

/// Immutable options for one reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Delete rows classified `extra` from the slave.
    #[serde(default)]
    pub should_delete: bool,

    /// Spot-check window boundary ids before the batch tier.
    #[serde(default)]
    pub sample: bool,

    /// Scan from the high end of the key space.
    #[serde(default)]
    pub reverse: bool,

    /// Initial and maximum window size (rows per nibble probe).
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Smallest window size reachable by subdivision. A window already at
    /// this size is not split again after an escalation failure.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// Wall-clock deadline after which no new window is started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_at: Option<DateTime<Utc>>,

    /// Deadline relative to run start; alternative to `stop_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,

    /// Maximum ids per `delete` call.
    #[serde(default = "default_deletion_batch_size")]
    pub deletion_batch_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            should_delete: false,
            sample: false,
            reverse: false,
            limit: default_limit(),
            max_limit: default_max_limit(),
            stop_at: None,
            max_duration_secs: None,
            deletion_batch_size: default_deletion_batch_size(),
        }
    }
}

impl RunOptions {
    pub fn direction(&self) -> Direction {
        Direction::from_reverse(self.reverse)
    }

    /// Absolute deadline for a run that started at `started_at`.
    ///
    /// A relative deadline that does not fit in a timestamp resolves to
    /// `None`; validation rejects such values up front.
    pub fn resolve_stop_at(&self, started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.stop_at, self.max_duration_secs) {
            (Some(at), _) => Some(at),
            (None, Some(secs)) => i64::try_from(secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .and_then(|delta| started_at.checked_add_signed(delta)),
            (None, None) => None,
        }
    }

    /// Validate option invariants.
    pub fn validate(&self) -> crate::error::Result<()> {
        super::validation::validate_options(self)
    }
}

fn default_limit() -> usize {
    1_000
}

fn default_max_limit() -> usize {
    100
}

fn default_deletion_batch_size() -> usize {
    500
}

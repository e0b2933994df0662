//! Outcome types for a reconciliation run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{Direction, Key};

/// Verdict for a single id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Present on both sides with equal digests.
    Correct,
    /// Present on both sides with different digests, or unresolved because
    /// a comparison failed.
    Incorrect,
    /// Present on the master only.
    Missing,
    /// Present on the slave only.
    Extra,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Correct => write!(f, "correct"),
            Classification::Incorrect => write!(f, "incorrect"),
            Classification::Missing => write!(f, "missing"),
            Classification::Extra => write!(f, "extra"),
        }
    }
}

/// Running counters for one run.
///
/// Counted by classification only; ids are dropped once their window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Totals {
    pub correct: u64,
    pub incorrect: u64,
    pub missing: u64,
    /// Slave-only rows found (deletion candidates).
    pub extra: u64,
    /// Extra rows actually removed from the slave.
    pub deleted: u64,
    /// Rows that exist only on a side whose per-row fetch failed and could
    /// therefore not be classified.
    pub unresolved: u64,
}

impl Totals {
    /// Add one closed window's counts.
    pub fn absorb(&mut self, tally: &WindowTally) {
        self.correct += tally.correct;
        self.incorrect += tally.incorrect;
        self.missing += tally.missing;
        self.extra += tally.extra.len() as u64;
        self.unresolved += tally.unresolved;
    }

    /// Every row was classified and found correct.
    pub fn is_clean(&self) -> bool {
        self.incorrect == 0 && self.missing == 0 && self.extra == 0 && self.unresolved == 0
    }
}

impl fmt::Display for Totals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "correct: {}, incorrect: {}, missing: {}, extra: {}, deleted: {}",
            self.correct, self.incorrect, self.missing, self.extra, self.deleted
        )
    }
}

/// Counts for one window while it is being classified.
///
/// Extra ids are kept until the window closes so they can be deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowTally {
    pub correct: u64,
    pub incorrect: u64,
    pub missing: u64,
    pub unresolved: u64,
    pub extra: Vec<Key>,
}

impl WindowTally {
    pub fn record(&mut self, id: &Key, classification: Classification) {
        match classification {
            Classification::Correct => self.correct += 1,
            Classification::Incorrect => self.incorrect += 1,
            Classification::Missing => self.missing += 1,
            Classification::Extra => self.extra.push(id.clone()),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The whole key space was scanned.
    Completed,
    /// `stop_at` passed; totals cover completed windows only.
    DeadlineReached,
    /// The cancellation token fired.
    Cancelled,
}

impl RunStatus {
    pub fn is_partial(&self) -> bool {
        !matches!(self, RunStatus::Completed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::DeadlineReached => write!(f, "deadline reached"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Scanning,
    DrainingDeletes,
    Finalizing,
    Done,
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Init => "init",
            RunPhase::Scanning => "scanning",
            RunPhase::DrainingDeletes => "draining_deletes",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Done => "done",
            RunPhase::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Final result of [`checksum`](super::checksum).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumReport {
    pub run_id: String,
    pub job_name: String,
    pub job_id: String,
    pub status: RunStatus,
    pub direction: Direction,
    pub totals: Totals,
    /// Top-level windows fully classified in this run.
    pub windows: u64,
    /// Checkpoint position the scan resumed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<Key>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ChecksumReport {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Progress update sent after every completed window.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub phase: RunPhase,
    pub windows_completed: u64,
    /// Where the next window starts; `None` once the scan is exhausted.
    pub position: Option<Key>,
    pub totals: Totals,
}

/// Extra ids of one window, handed to an external sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionBatch {
    pub job_id: String,
    pub window: u64,
    pub ids: Vec<Key>,
}

/// Result of verifying one explicit id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedId {
    pub id: Key,
    /// `None` when the id exists on neither side.
    pub classification: Option<Classification>,
}

//! Wall-clock stop condition, checked at window boundaries only.

use chrono::{DateTime, Utc};

/// Optional absolute deadline for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    stop_at: Option<DateTime<Utc>>,
}

impl Deadline {
    pub fn new(stop_at: Option<DateTime<Utc>>) -> Self {
        Self { stop_at }
    }

    /// A deadline that never expires.
    pub fn none() -> Self {
        Self { stop_at: None }
    }

    pub fn stop_at(&self) -> Option<DateTime<Utc>> {
        self.stop_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.stop_at.is_some_and(|at| now >= at)
    }
}

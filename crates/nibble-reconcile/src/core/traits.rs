//! The capability contract every reconcilable data source implements.
//!
//! A [`Connector`] answers eight questions about one dataset. Anything that
//! can iterate its own key space in a consistent order (SQL tables, document
//! stores, flat files) can be reconciled by implementing it.
//!
//! # Session lifecycle
//!
//! A connector is constructed with its own configuration. [`Connector::initialize`]
//! opens the session before a run and [`Connector::destroy`] releases it
//! afterwards. The engine calls `destroy` even when the run fails.

use async_trait::async_trait;

use crate::error::Result;

use super::key::Key;
use super::types::{BatchDigest, KeyRange, NibbleProbe, RangeSummary, RowDigest};

/// Operations the reconciliation engine needs from a data source.
///
/// All methods may fail. Transient failures should be reported as
/// [`ReconcileError::Query`](crate::ReconcileError::Query), oversized
/// per-row answers as
/// [`ReconcileError::PayloadTooLarge`](crate::ReconcileError::PayloadTooLarge),
/// and lost sessions as
/// [`ReconcileError::Connection`](crate::ReconcileError::Connection).
#[async_trait]
pub trait Connector: Send + Sync {
    /// Name used in logs and error messages (e.g. "master").
    fn name(&self) -> &str;

    /// Prepare connection/session state.
    async fn initialize(&self) -> Result<()>;

    /// Release session state. Called once per run, regardless of outcome.
    async fn destroy(&self) -> Result<()>;

    /// Min/max key and row count over an optionally bounded sub-range.
    async fn range(&self, start: Option<&Key>, end: Option<&Key>) -> Result<RangeSummary>;

    /// Locate the `limit`-th and `(limit + 1)`-th keys of `range`, counting
    /// from its low end, or from its high end when `reverse` is set.
    async fn nibble(&self, range: &KeyRange, limit: usize, reverse: bool) -> Result<NibbleProbe>;

    /// Aggregate fingerprint over every row in `range`, in one round trip.
    async fn batch(&self, range: &KeyRange) -> Result<BatchDigest>;

    /// One fingerprint per row in `range`, in key order.
    async fn individual(&self, range: &KeyRange) -> Result<Vec<RowDigest>>;

    /// Fingerprints for an explicit, small id list. Ids that do not exist
    /// are omitted from the answer.
    async fn sample(&self, ids: &[Key]) -> Result<Vec<RowDigest>>;

    /// Remove rows by id, returning how many were removed.
    async fn delete(&self, ids: &[Key]) -> Result<u64>;
}

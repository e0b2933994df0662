//! Per-call override decorator for connectors.
//!
//! [`FaultInjector`] wraps any connector and can make the Nth call to a
//! given operation fail with an error of the caller's choosing. Calls that
//! are not overridden pass straight through to the wrapped connector. Every
//! call is counted, so tests can assert how often an operation ran.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::{BatchDigest, Connector, Key, KeyRange, NibbleProbe, RangeSummary, RowDigest};
use crate::error::{ReconcileError, Result};

/// The eight operations of the capability contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Initialize,
    Destroy,
    Range,
    Nibble,
    Batch,
    Individual,
    Sample,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Initialize,
        Operation::Destroy,
        Operation::Range,
        Operation::Nibble,
        Operation::Batch,
        Operation::Individual,
        Operation::Sample,
        Operation::Delete,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Initialize => "initialize",
            Operation::Destroy => "destroy",
            Operation::Range => "range",
            Operation::Nibble => "nibble",
            Operation::Batch => "batch",
            Operation::Individual => "individual",
            Operation::Sample => "sample",
            Operation::Delete => "delete",
        };
        write!(f, "{}", name)
    }
}

/// Decides, from the 1-based call number, whether a call fails.
pub type Override = Box<dyn Fn(usize) -> Option<ReconcileError> + Send + Sync>;

/// Connector decorator with injectable per-call overrides.
pub struct FaultInjector {
    inner: Arc<dyn Connector>,
    overrides: HashMap<Operation, Vec<Override>>,
    calls: HashMap<Operation, AtomicUsize>,
}

impl FaultInjector {
    pub fn new(inner: Arc<dyn Connector>) -> Self {
        Self {
            inner,
            overrides: HashMap::new(),
            calls: Operation::ALL
                .iter()
                .map(|op| (*op, AtomicUsize::new(0)))
                .collect(),
        }
    }

    /// Register an override for `op`. Overrides run in registration order;
    /// the first one returning an error wins.
    pub fn with_override<F>(mut self, op: Operation, f: F) -> Self
    where
        F: Fn(usize) -> Option<ReconcileError> + Send + Sync + 'static,
    {
        self.overrides.entry(op).or_default().push(Box::new(f));
        self
    }

    /// Fail the `n`-th call (1-based) to `op`.
    pub fn fail_nth<F>(self, op: Operation, n: usize, make_error: F) -> Self
    where
        F: Fn() -> ReconcileError + Send + Sync + 'static,
    {
        self.with_override(op, move |call| (call == n).then(&make_error))
    }

    /// Fail every call to `op`.
    pub fn fail_always<F>(self, op: Operation, make_error: F) -> Self
    where
        F: Fn() -> ReconcileError + Send + Sync + 'static,
    {
        self.with_override(op, move |_| Some(make_error()))
    }

    /// Number of calls made to `op` so far, including failed ones.
    pub fn calls(&self, op: Operation) -> usize {
        self.calls
            .get(&op)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn intercept(&self, op: Operation) -> Result<()> {
        let call = self
            .calls
            .get(&op)
            .map(|c| c.fetch_add(1, Ordering::SeqCst) + 1)
            .unwrap_or(1);

        if let Some(overrides) = self.overrides.get(&op) {
            for f in overrides {
                if let Some(err) = f(call) {
                    debug!("{}: injected failure on {} call {}: {}", self.inner.name(), op, call, err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for FaultInjector {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn initialize(&self) -> Result<()> {
        self.intercept(Operation::Initialize)?;
        self.inner.initialize().await
    }

    async fn destroy(&self) -> Result<()> {
        self.intercept(Operation::Destroy)?;
        self.inner.destroy().await
    }

    async fn range(&self, start: Option<&Key>, end: Option<&Key>) -> Result<RangeSummary> {
        self.intercept(Operation::Range)?;
        self.inner.range(start, end).await
    }

    async fn nibble(&self, range: &KeyRange, limit: usize, reverse: bool) -> Result<NibbleProbe> {
        self.intercept(Operation::Nibble)?;
        self.inner.nibble(range, limit, reverse).await
    }

    async fn batch(&self, range: &KeyRange) -> Result<BatchDigest> {
        self.intercept(Operation::Batch)?;
        self.inner.batch(range).await
    }

    async fn individual(&self, range: &KeyRange) -> Result<Vec<RowDigest>> {
        self.intercept(Operation::Individual)?;
        self.inner.individual(range).await
    }

    async fn sample(&self, ids: &[Key]) -> Result<Vec<RowDigest>> {
        self.intercept(Operation::Sample)?;
        self.inner.sample(ids).await
    }

    async fn delete(&self, ids: &[Key]) -> Result<u64> {
        self.intercept(Operation::Delete)?;
        self.inner.delete(ids).await
    }
}

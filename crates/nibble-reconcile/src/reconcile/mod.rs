//! Windowed reconciliation of a master dataset against a slave.
//!
//! The engine walks the key space one window at a time and compares each
//! window in tiers, stopping at the first tier that gives an answer:
//!
//! 1. **Batch**: aggregate digests from both sides. Equal digests mark the
//!    whole window correct without any per-row work.
//! 2. **Individual**: per-row digests from both sides, classified id by id.
//! 3. **Subdivision**: if a per-row fetch fails and the window is larger
//!    than `max_limit`, the window is re-nibbled at half the size and each
//!    part goes through the tiers again.
//! 4. **Point lookup**: if only one side failed, its ids are looked up on
//!    the other side with `sample`.
//!
//! When every tier fails the window is counted as a single `incorrect`.
//!
//! Master and slave queries for a window run concurrently. Deletes for a
//! window run only after the window is fully classified, and the checkpoint
//! moves only at window boundaries.

mod compare;
mod types;

pub use compare::verify_ids;
pub use types::{
    ChecksumReport, Classification, DeletionBatch, ProgressUpdate, RunPhase, RunStatus, Totals,
    VerifiedId, WindowTally,
};

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore, Deadline, NoOpCheckpointStore};
use crate::config::RunOptions;
use crate::core::{BatchDigest, Connector, Direction, Key, KeyRange, RangeSummary, RowDigest, Window};
use crate::error::{ReconcileError, Result};
use crate::nibbler::{Nibbler, WindowReceiver};
use crate::retry::{retry, RetryPolicy};
use compare::{classify_lookup, diff, lookups_agree, Side};

/// Reconcile `slave` against `master` with default engine settings.
///
/// Connector sessions are opened and closed by the call. No checkpoint is
/// persisted; use [`ReconcileEngine`] for resumable runs.
pub async fn checksum(
    job_name: &str,
    job_id: &str,
    master: Arc<dyn Connector>,
    slave: Arc<dyn Connector>,
    options: RunOptions,
) -> Result<ChecksumReport> {
    ReconcileEngine::new(master, slave, options)
        .run(job_name, job_id)
        .await
}

/// Mutable state owned by a single run.
struct RunState {
    phase: RunPhase,
    totals: Totals,
    windows: u64,
    resumed_from: Option<Key>,
}

impl RunState {
    fn new() -> Self {
        Self {
            phase: RunPhase::Init,
            totals: Totals::default(),
            windows: 0,
            resumed_from: None,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        if self.phase != phase {
            debug!("Run phase: {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }
}

/// Drives one reconciliation run between two connectors.
pub struct ReconcileEngine {
    master: Arc<dyn Connector>,
    slave: Arc<dyn Connector>,
    options: RunOptions,
    retry: RetryPolicy,
    checkpoint_store: Arc<dyn CheckpointStore>,
    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
    deletion_tx: Option<mpsc::Sender<DeletionBatch>>,
    cancel: CancellationToken,
}

impl ReconcileEngine {
    /// Create a new engine.
    pub fn new(master: Arc<dyn Connector>, slave: Arc<dyn Connector>, options: RunOptions) -> Self {
        Self {
            master,
            slave,
            options,
            retry: RetryPolicy::query(),
            checkpoint_store: Arc::new(NoOpCheckpointStore::new()),
            progress_tx: None,
            deletion_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the retry policy for connector queries.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Persist scan position in `store` so interrupted runs can resume.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = store;
        self
    }

    /// Set progress channel for updates.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Send every window's extra ids to `tx`, whether or not they are deleted.
    ///
    /// A full channel suspends the scan until the consumer catches up.
    pub fn with_deletion_sink(mut self, tx: mpsc::Sender<DeletionBatch>) -> Self {
        self.deletion_tx = Some(tx);
        self
    }

    /// Stop at the next window boundary once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run a reconciliation.
    ///
    /// Both connector sessions are initialized first and destroyed at the
    /// end whatever the outcome. A fatal error is returned as
    /// [`ReconcileError::Aborted`] carrying the totals of the windows that
    /// completed before it.
    pub async fn run(&self, job_name: &str, job_id: &str) -> Result<ChecksumReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("checksum", job = %job_name, run_id = %run_id);
        self.run_inner(run_id, job_name, job_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: String, job_name: &str, job_id: &str) -> Result<ChecksumReport> {
        self.options.validate()?;
        self.retry.validate()?;

        let started_at = Utc::now();
        let timer = Instant::now();
        let direction = self.options.direction();
        let deadline = Deadline::new(self.options.resolve_stop_at(started_at));

        info!(
            "Starting reconciliation of {} against {}: {} scan, limit {}, max_limit {}, delete: {}, checkpoint store: {}",
            self.slave.name(),
            self.master.name(),
            direction,
            self.options.limit,
            self.options.max_limit,
            self.options.should_delete,
            self.checkpoint_store.backend_type()
        );
        if let Some(stop_at) = deadline.stop_at() {
            info!("Deadline: {}", stop_at.to_rfc3339());
        }

        let mut state = RunState::new();

        let (master_init, slave_init) = tokio::join!(self.master.initialize(), self.slave.initialize());
        let outcome = match master_init.and(slave_init) {
            Ok(()) => self.scan(job_id, direction, deadline, &mut state).await,
            Err(e) => Err(e),
        };

        state.enter(RunPhase::Finalizing);
        let (master_destroy, slave_destroy) = tokio::join!(self.master.destroy(), self.slave.destroy());
        let released = master_destroy.and(slave_destroy);
        if let Err(e) = &released {
            warn!("Failed to release connector session: {}", e);
        }

        let status = match outcome.and_then(|status| released.map(|()| status)) {
            Ok(status) => status,
            Err(e) => {
                state.enter(RunPhase::Aborted);
                warn!(
                    "Reconciliation aborted after {} windows ({}): {}",
                    state.windows, state.totals, e
                );
                return Err(ReconcileError::aborted(state.totals, e));
            }
        };

        state.enter(RunPhase::Done);
        let report = ChecksumReport {
            run_id,
            job_name: job_name.to_string(),
            job_id: job_id.to_string(),
            status,
            direction,
            totals: state.totals,
            windows: state.windows,
            resumed_from: state.resumed_from,
            started_at,
            finished_at: Utc::now(),
            duration_ms: timer.elapsed().as_millis() as u64,
        };

        info!(
            "Reconciliation {} after {} windows in {}ms ({})",
            report.status, report.windows, report.duration_ms, report.totals
        );
        Ok(report)
    }

    async fn scan(
        &self,
        job_id: &str,
        direction: Direction,
        deadline: Deadline,
        state: &mut RunState,
    ) -> Result<RunStatus> {
        state.enter(RunPhase::Scanning);

        let master = self.master.as_ref();
        let slave = self.slave.as_ref();
        let (master_range, slave_range) = tokio::join!(
            retry("range", &self.retry, move || master.range(None, None)),
            retry("range", &self.retry, move || slave.range(None, None)),
        );
        let master_range = master_range?;
        let slave_range = slave_range?;

        info!(
            "{}: {} rows, {}: {} rows",
            master.name(),
            master_range.total,
            slave.name(),
            slave_range.total
        );

        // Scan the union of both key spaces so slave-only keys beyond the
        // master's bounds are still visited.
        let Some(span) = master_range.union_span(&slave_range) else {
            info!("Both datasets are empty, nothing to reconcile");
            self.save_checkpoint(job_id, None, direction, state).await?;
            return Ok(RunStatus::Completed);
        };

        let mut nibbler = Nibbler::new(self.master.clone(), span, self.options.limit, direction)
            .with_retry(self.retry.clone());

        if let Some(checkpoint) = self.checkpoint_store.get(job_id).await? {
            match checkpoint.resume_position(direction) {
                Some(position) => {
                    info!(
                        "Resuming {} scan from {} (checkpoint from {})",
                        direction,
                        position,
                        checkpoint.timestamp.to_rfc3339()
                    );
                    state.resumed_from = Some(position.clone());
                    nibbler = nibbler.resume_at(position.clone());
                }
                None if !checkpoint.is_complete() => info!(
                    "Checkpoint belongs to a {} scan, starting a full {} pass",
                    checkpoint.direction, direction
                ),
                None => {}
            }
        }

        let (mut windows, nibbling) = nibbler.spawn(1);
        let outcome = self.drive(job_id, deadline, &mut windows, state).await;
        drop(windows);
        // No nibble call may reach the master once the sessions are destroyed.
        nibbling.abort();
        if let Err(e) = nibbling.await {
            if e.is_panic() {
                warn!("Nibbler task panicked: {}", e);
            }
        }
        let status = outcome?;

        if status == RunStatus::Completed {
            self.check_drift(&master_range).await;
        }
        Ok(status)
    }

    /// Take windows from the nibbler until it is exhausted, the run is
    /// cancelled or the deadline passes.
    async fn drive(
        &self,
        job_id: &str,
        deadline: Deadline,
        windows: &mut WindowReceiver,
        state: &mut RunState,
    ) -> Result<RunStatus> {
        loop {
            if self.cancel.is_cancelled() {
                info!("Cancellation requested, stopping after {} windows", state.windows);
                return Ok(RunStatus::Cancelled);
            }
            if deadline.is_expired() {
                info!("Deadline reached, stopping after {} windows", state.windows);
                return Ok(RunStatus::DeadlineReached);
            }

            let window = match windows.recv().await {
                Some(window) => window?,
                None => return Ok(RunStatus::Completed),
            };
            self.run_window(job_id, &window, state).await?;
        }
    }

    /// Classify one window, drain its deletes, then move the checkpoint.
    async fn run_window(&self, job_id: &str, window: &Window, state: &mut RunState) -> Result<()> {
        let tally = self.classify_window(window).await?;

        debug!(
            "Window {} {}: {} correct, {} incorrect, {} missing, {} extra",
            window.index,
            window.range,
            tally.correct,
            tally.incorrect,
            tally.missing,
            tally.extra.len()
        );

        if !tally.extra.is_empty() {
            state.enter(RunPhase::DrainingDeletes);
            state.totals.deleted += self.drain_deletes(job_id, window.index, &tally.extra).await?;
            state.enter(RunPhase::Scanning);
        }

        state.totals.absorb(&tally);
        state.windows += 1;

        self.save_checkpoint(job_id, window.next.clone(), window.direction, state)
            .await?;

        self.send_progress(ProgressUpdate {
            phase: state.phase,
            windows_completed: state.windows,
            position: window.next.clone(),
            totals: state.totals,
        })
        .await;

        Ok(())
    }

    /// Run a window and any sub-windows it is split into, in scan order.
    async fn classify_window(&self, window: &Window) -> Result<WindowTally> {
        let mut tally = WindowTally::default();
        let mut pending = VecDeque::from([window.clone()]);

        while let Some(current) = pending.pop_front() {
            if let Some(parts) = self.compare(&current, &mut tally).await? {
                for part in parts.into_iter().rev() {
                    pending.push_front(part);
                }
            }
        }

        Ok(tally)
    }

    /// Compare one window. Returns sub-windows when the window was split
    /// instead of classified.
    async fn compare(&self, window: &Window, tally: &mut WindowTally) -> Result<Option<Vec<Window>>> {
        let range = &window.range;
        let mut master_count = None;
        let mut slave_count = None;

        if self.options.sample && !self.boundaries_agree(window).await {
            debug!(
                "Window {} {}: boundary rows differ, skipping batch digest",
                window.index, range
            );
        } else {
            let (master_digest, slave_digest) = tokio::join!(
                self.batch(self.master.as_ref(), range),
                self.batch(self.slave.as_ref(), range),
            );
            let master_digest = tolerate(Side::Master, "batch", master_digest)?;
            let slave_digest = tolerate(Side::Slave, "batch", slave_digest)?;

            if let (Some(m), Some(s)) = (&master_digest, &slave_digest) {
                if m.matches(s) {
                    tally.correct += m.count;
                    return Ok(None);
                }
                debug!(
                    "Window {} {}: batch mismatch ({} vs {} rows), escalating",
                    window.index, range, m.count, s.count
                );
            }
            master_count = master_digest.map(|d| d.count);
            slave_count = slave_digest.map(|d| d.count);
        }

        let (master_rows, slave_rows) = tokio::join!(
            self.individual(self.master.as_ref(), range),
            self.individual(self.slave.as_ref(), range),
        );
        let master_rows = tolerate(Side::Master, "individual", master_rows)?;
        let slave_rows = tolerate(Side::Slave, "individual", slave_rows)?;

        // (rows of the side that answered, that side, row count of the other side)
        let known = match (master_rows, slave_rows) {
            (Some(m), Some(s)) => {
                diff(&m, &s, tally);
                return Ok(None);
            }
            (Some(m), None) => Some((m, Side::Master, slave_count)),
            (None, Some(s)) => Some((s, Side::Slave, master_count)),
            (None, None) => None,
        };

        if window.limit > self.options.max_limit {
            let failed = known
                .as_ref()
                .map_or(Side::Master, |(_, side, _)| side.other());
            match self.subdivide(window, failed).await {
                Ok(parts) => return Ok(Some(parts)),
                Err(e) if !e.is_fatal() => {
                    warn!("Window {} {}: cannot split window: {}", window.index, range, e)
                }
                Err(e) => return Err(e),
            }
        }

        if let Some((rows, side, other_count)) = known {
            if self.point_lookup(window, &rows, side, other_count, tally).await? {
                return Ok(None);
            }
        }

        warn!(
            "Window {} {}: per-row comparison failed at limit {}, counting window as incorrect",
            window.index, range, window.limit
        );
        tally.incorrect += 1;
        Ok(None)
    }

    /// Re-nibble a window over `side` with half its limit.
    async fn subdivide(&self, window: &Window, side: Side) -> Result<Vec<Window>> {
        let limit = (window.limit / 2).max(self.options.max_limit);
        info!(
            "Window {} {}: splitting by {} rows (limit {} -> {})",
            window.index, window.range, side, window.limit, limit
        );

        Nibbler::new(self.connector(side).clone(), window.range.clone(), limit, window.direction)
            .with_retry(self.retry.clone())
            .collect_windows()
            .await
    }

    /// Classify `known` rows by looking their ids up on the other side.
    ///
    /// Rows that exist only on the failed side cannot be enumerated; they are
    /// counted as unresolved and never deleted. Returns `false` when the
    /// lookup itself failed.
    async fn point_lookup(
        &self,
        window: &Window,
        known: &[RowDigest],
        known_side: Side,
        other_count: Option<u64>,
        tally: &mut WindowTally,
    ) -> Result<bool> {
        let failed_side = known_side.other();

        let found = if known.is_empty() {
            Vec::new()
        } else {
            let ids: Vec<Key> = known.iter().map(|r| r.id.clone()).collect();
            let ids = ids.as_slice();
            let conn = self.connector(failed_side).as_ref();
            let result = retry("sample", &self.retry, move || conn.sample(ids)).await;
            match tolerate(failed_side, "sample", result)? {
                Some(found) => found,
                None => return Ok(false),
            }
        };

        let matched = classify_lookup(known, known_side, &found, tally);

        match other_count.map(|count| count.saturating_sub(matched)) {
            Some(0) => {}
            Some(unresolved) => {
                tally.unresolved += unresolved;
                warn!(
                    "Window {} {}: {} rows present only on {} could not be classified",
                    window.index, window.range, unresolved, failed_side
                );
            }
            None => warn!(
                "Window {} {}: row count on {} unknown, rows present only there are not classified",
                window.index, window.range, failed_side
            ),
        }

        info!(
            "Window {} {}: resolved {} ids by point lookup on {}",
            window.index,
            window.range,
            known.len(),
            failed_side
        );
        Ok(true)
    }

    /// Spot-check the window's endpoint rows on both sides.
    ///
    /// Errors count as agreement; the batch tier will surface them.
    async fn boundaries_agree(&self, window: &Window) -> bool {
        let keys = window.range.endpoint_keys();
        if keys.is_empty() {
            return true;
        }

        let ids = keys.as_slice();
        let (master_rows, slave_rows) = tokio::join!(self.master.sample(ids), self.slave.sample(ids));
        match (master_rows, slave_rows) {
            (Ok(m), Ok(s)) => lookups_agree(&m, &s),
            (Err(e), _) | (_, Err(e)) => {
                debug!("Boundary sample for window {} failed, ignoring: {}", window.index, e);
                true
            }
        }
    }

    /// Hand extras to the sink, then delete them from the slave if enabled.
    async fn drain_deletes(&self, job_id: &str, window_index: u64, extra: &[Key]) -> Result<u64> {
        if let Some(tx) = &self.deletion_tx {
            let batch = DeletionBatch {
                job_id: job_id.to_string(),
                window: window_index,
                ids: extra.to_vec(),
            };
            if tx.send(batch).await.is_err() {
                debug!("Deletion sink closed, dropping batch for window {}", window_index);
            }
        }

        if !self.options.should_delete {
            debug!(
                "Window {}: {} extra rows left in place (should_delete is off)",
                window_index,
                extra.len()
            );
            return Ok(0);
        }

        let slave = self.slave.as_ref();
        let mut deleted = 0;
        for chunk in extra.chunks(self.options.deletion_batch_size.max(1)) {
            match retry("delete", &self.retry, move || slave.delete(chunk)).await {
                Ok(n) => deleted += n,
                Err(e) if !e.is_fatal() => warn!(
                    "Failed to delete {} extra rows from {}: {}",
                    chunk.len(),
                    slave.name(),
                    e
                ),
                Err(e) => return Err(e),
            }
        }

        info!(
            "Window {}: deleted {} extra rows from {}",
            window_index,
            deleted,
            slave.name()
        );
        Ok(deleted)
    }

    async fn save_checkpoint(
        &self,
        job_id: &str,
        position: Option<Key>,
        direction: Direction,
        state: &RunState,
    ) -> Result<()> {
        let checkpoint = Checkpoint::new(position, direction, state.windows);
        self.checkpoint_store.merge(job_id, &checkpoint).await?;
        match &checkpoint.position {
            Some(position) => debug!("Checkpoint saved at {}", position),
            None => debug!("Scan complete, checkpoint reset"),
        }
        Ok(())
    }

    /// Warn when the master's row count changed while the scan ran.
    async fn check_drift(&self, initial: &RangeSummary) {
        let master = self.master.as_ref();
        match retry("range", &self.retry, move || master.range(None, None)).await {
            Ok(current) if current.total != initial.total => warn!(
                "{} row count drifted during the run: {} -> {}",
                master.name(),
                initial.total,
                current.total
            ),
            Ok(_) => {}
            Err(e) => debug!("Drift check skipped: {}", e),
        }
    }

    async fn batch(&self, conn: &dyn Connector, range: &KeyRange) -> Result<BatchDigest> {
        retry("batch", &self.retry, move || conn.batch(range)).await
    }

    async fn individual(&self, conn: &dyn Connector, range: &KeyRange) -> Result<Vec<RowDigest>> {
        retry("individual", &self.retry, move || conn.individual(range)).await
    }

    fn connector(&self, side: Side) -> &Arc<dyn Connector> {
        match side {
            Side::Master => &self.master,
            Side::Slave => &self.slave,
        }
    }

    /// Send progress update if channel is configured.
    async fn send_progress(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(update).await;
        }
    }
}

/// Turn a per-window failure into `None`; fatal errors pass through.
fn tolerate<T>(side: Side, operation: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!("{} {} failed: {}", side, operation, e);
            Ok(None)
        }
    }
}

//! Adaptive range partitioning ("nibbling").
//!
//! Instead of paginating with `OFFSET`, the nibbler repeatedly asks a
//! connector where the `limit`-th row from the current position is and cuts
//! a window there. Each probe is typically a single indexed
//! `ORDER BY .. LIMIT` query on the connector side.
//!
//! Windows are produced lazily and partition the span exactly: a window ends
//! just before the first key of the next one, so keys present only on the
//! other dataset still fall into exactly one window.

use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{Connector, Direction, Key, KeyRange, Window};
use crate::error::{ReconcileError, Result};
use crate::retry::{retry, RetryPolicy};

/// Receiver side of a spawned nibbler.
pub type WindowReceiver = mpsc::Receiver<Result<Window>>;

/// Lazily cuts a key span into windows of at most `limit` rows of the probed
/// connector.
pub struct Nibbler {
    connector: Arc<dyn Connector>,
    remaining: Option<KeyRange>,
    limit: usize,
    direction: Direction,
    retry: RetryPolicy,
    produced: u64,
}

impl Nibbler {
    /// Create a nibbler over `span`, probing `connector`.
    pub fn new(connector: Arc<dyn Connector>, span: KeyRange, limit: usize, direction: Direction) -> Self {
        let remaining = if span.is_empty() { None } else { Some(span) };
        Self {
            connector,
            remaining,
            limit: limit.max(1),
            direction,
            retry: RetryPolicy::query(),
            produced: 0,
        }
    }

    /// Set the retry policy for probe queries.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Skip the part of the span already scanned by a previous run.
    ///
    /// `position` is the first key of the first unscanned window. A position
    /// outside the span is ignored and the whole span is scanned.
    pub fn resume_at(mut self, position: Key) -> Self {
        if let Some(span) = self.remaining.take() {
            if span.contains(&position) {
                let resumed = match self.direction {
                    Direction::Forward => KeyRange::new(Bound::Included(position), span.end),
                    Direction::Reverse => KeyRange::new(span.start, Bound::Included(position)),
                };
                self.remaining = Some(resumed);
            } else {
                debug!("Resume position {} lies outside {}, scanning whole span", position, span);
                self.remaining = Some(span);
            }
        }
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Unscanned part of the span.
    pub fn remaining(&self) -> Option<&KeyRange> {
        self.remaining.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_none()
    }

    /// Produce the next window, or `None` once the span is exhausted.
    ///
    /// On error the nibbler keeps its position, so the call can be repeated.
    pub async fn next_window(&mut self) -> Result<Option<Window>> {
        let Some(remaining) = self.remaining.take() else {
            return Ok(None);
        };

        let reverse = self.direction.is_reverse();
        let limit = self.limit;
        let connector = self.connector.as_ref();
        let span = &remaining;

        let result = retry("nibble", &self.retry, move || connector.nibble(span, limit, reverse)).await;
        let probe = match result {
            Ok(probe) => probe,
            Err(e) => {
                self.remaining = Some(remaining);
                return Err(e);
            }
        };

        let (range, rest, next) = match (probe.current, probe.next) {
            (Some(current), Some(next)) => {
                if let Err(e) = self.check_probe(&remaining, &current, &next) {
                    self.remaining = Some(remaining);
                    return Err(e);
                }
                let KeyRange { start, end } = remaining;
                if reverse {
                    (
                        KeyRange::new(Bound::Excluded(next.clone()), end),
                        Some(KeyRange::new(start, Bound::Included(next.clone()))),
                        Some(next),
                    )
                } else {
                    (
                        KeyRange::new(start, Bound::Excluded(next.clone())),
                        Some(KeyRange::new(Bound::Included(next.clone()), end)),
                        Some(next),
                    )
                }
            }
            // Fewer than `limit` rows left: the final window runs to the bound.
            _ => (remaining, None, None),
        };

        self.remaining = rest;

        let window = Window {
            index: self.produced,
            range,
            limit,
            direction: self.direction,
            next,
        };
        self.produced += 1;

        debug!(
            "{} window {} {} (limit {})",
            self.connector.name(),
            window.index,
            window.range,
            window.limit
        );

        Ok(Some(window))
    }

    /// `next` must lie inside the span, strictly past `current` in scan order.
    fn check_probe(&self, span: &KeyRange, current: &Key, next: &Key) -> Result<()> {
        let ordered = if self.direction.is_reverse() {
            next < current
        } else {
            next > current
        };

        if !ordered || !span.contains(next) || !span.contains(current) {
            return Err(ReconcileError::contract(
                self.connector.name(),
                format!(
                    "nibble over {} returned current={} next={} for a {} scan",
                    span, current, next, self.direction
                ),
            ));
        }
        Ok(())
    }

    /// Drain every remaining window into a vector.
    pub async fn collect_windows(mut self) -> Result<Vec<Window>> {
        let mut windows = Vec::new();
        while let Some(window) = self.next_window().await? {
            windows.push(window);
        }
        Ok(windows)
    }

    /// Run the nibbler on a background task, feeding windows into a bounded
    /// channel.
    ///
    /// A channel slot is reserved before each probe, so with `buffer == 1`
    /// the task computes exactly one window ahead of the consumer and then
    /// waits until that window has been taken. Dropping the receiver stops
    /// the task before its next probe; abort the returned handle to stop a
    /// probe already in flight.
    pub fn spawn(mut self, buffer: usize) -> (WindowReceiver, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));

        let handle = tokio::spawn(async move {
            loop {
                let permit = match tx.reserve().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!("Window receiver dropped, stopping nibbler");
                        break;
                    }
                };

                match self.next_window().await {
                    Ok(Some(window)) => permit.send(Ok(window)),
                    Ok(None) => break,
                    Err(e) => {
                        permit.send(Err(e));
                        break;
                    }
                }
            }
        });

        (rx, handle)
    }
}

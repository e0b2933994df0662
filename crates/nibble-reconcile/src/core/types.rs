//! Value types exchanged between the engine and connectors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;

use super::key::Key;

/// Scan direction over the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    /// Starts from the high end of the key space.
    Reverse,
}

impl Direction {
    pub fn from_reverse(reverse: bool) -> Self {
        if reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self, Direction::Reverse)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

/// A contiguous span of the key space.
///
/// Bounds are inclusive unless a window boundary was placed on the first
/// key of the following window, in which case that side is excluded. This
/// keeps consecutive windows free of gaps even for keys that exist only on
/// the slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Key>,
    pub end: Bound<Key>,
}

impl KeyRange {
    /// `[start, end]`
    pub fn inclusive(start: Key, end: Key) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Included(end),
        }
    }

    pub fn new(start: Bound<Key>, end: Bound<Key>) -> Self {
        Self { start, end }
    }

    /// Borrowed bounds, suitable for `BTreeMap::range`.
    pub fn as_bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        (self.start.as_ref(), self.end.as_ref())
    }

    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.start {
            Bound::Included(s) => key >= s,
            Bound::Excluded(s) => key > s,
            Bound::Unbounded => true,
        };
        let below = match &self.end {
            Bound::Included(e) => key <= e,
            Bound::Excluded(e) => key < e,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// True when no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }

    /// Keys that appear as included endpoints of the range.
    pub fn endpoint_keys(&self) -> Vec<Key> {
        let mut keys = Vec::with_capacity(2);
        if let Bound::Included(s) = &self.start {
            keys.push(s.clone());
        }
        if let Bound::Included(e) = &self.end {
            if keys.first() != Some(e) {
                keys.push(e.clone());
            }
        }
        keys
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            Bound::Included(k) => write!(f, "[{}", k)?,
            Bound::Excluded(k) => write!(f, "({}", k)?,
            Bound::Unbounded => write!(f, "(-inf")?,
        }
        match &self.end {
            Bound::Included(k) => write!(f, ", {}]", k),
            Bound::Excluded(k) => write!(f, ", {})", k),
            Bound::Unbounded => write!(f, ", +inf)"),
        }
    }
}

/// One unit of work produced by the nibbler and consumed once by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Sequence number within its nibbler, starting at 0.
    pub index: u64,
    pub range: KeyRange,
    /// Maximum number of master rows the window was sized for.
    pub limit: usize,
    pub direction: Direction,
    /// First key of the following window; `None` for the last window.
    pub next: Option<Key>,
}

impl Window {
    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// Key space of a connector at scan start.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RangeSummary {
    pub min: Option<Key>,
    pub max: Option<Key>,
    pub total: u64,
}

impl RangeSummary {
    pub fn new(min: Key, max: Key, total: u64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            total,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none() || self.max.is_none()
    }

    /// Inclusive span covering both summaries, or `None` when both are empty.
    pub fn union_span(&self, other: &RangeSummary) -> Option<KeyRange> {
        let min = match (&self.min, &other.min) {
            (Some(a), Some(b)) => a.min(b).clone(),
            (Some(a), None) | (None, Some(a)) => a.clone(),
            (None, None) => return None,
        };
        let max = match (&self.max, &other.max) {
            (Some(a), Some(b)) => a.max(b).clone(),
            (Some(a), None) | (None, Some(a)) => a.clone(),
            (None, None) => return None,
        };
        Some(KeyRange::inclusive(min, max))
    }
}

/// Answer to "where is row `limit` from here".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NibbleProbe {
    /// Key of the `limit`-th row, or of the last row when fewer remain.
    /// `None` when the probed range holds no rows at all.
    pub current: Option<Key>,
    /// Key of the `(limit + 1)`-th row; `None` when traversal is exhausted.
    pub next: Option<Key>,
}

/// Content fingerprint for one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowDigest {
    pub id: Key,
    pub hash: String,
}

impl RowDigest {
    pub fn new(id: impl Into<Key>, hash: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
        }
    }
}

/// Aggregate fingerprint for every row in a window.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchDigest {
    pub count: u64,
    pub sums: Vec<u64>,
}

impl BatchDigest {
    /// Digests agree when both row counts and all checksum lanes match.
    pub fn matches(&self, other: &BatchDigest) -> bool {
        self.count == other.count && self.sums == other.sums
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_open_range_contains() {
        let range = KeyRange::new(Bound::Included(Key::Int(1)), Bound::Excluded(Key::Int(10)));
        assert!(range.contains(&Key::Int(1)));
        assert!(range.contains(&Key::Int(9)));
        assert!(!range.contains(&Key::Int(10)));
        assert!(!range.is_empty());
        assert_eq!(range.to_string(), "[1, 10)");
    }

    #[test]
    fn test_range_emptiness() {
        assert!(KeyRange::inclusive(Key::Int(5), Key::Int(4)).is_empty());
        assert!(!KeyRange::inclusive(Key::Int(5), Key::Int(5)).is_empty());
        assert!(KeyRange::new(Bound::Excluded(Key::Int(5)), Bound::Included(Key::Int(5))).is_empty());
    }

    #[test]
    fn test_endpoint_keys_skip_excluded_bounds() {
        let range = KeyRange::new(Bound::Excluded(Key::Int(1)), Bound::Included(Key::Int(9)));
        assert_eq!(range.endpoint_keys(), vec![Key::Int(9)]);
        let single = KeyRange::inclusive(Key::Int(3), Key::Int(3));
        assert_eq!(single.endpoint_keys(), vec![Key::Int(3)]);
    }

    #[test]
    fn test_union_span() {
        let master = RangeSummary::new(Key::Int(5), Key::Int(50), 10);
        let slave = RangeSummary::new(Key::Int(1), Key::Int(20), 4);
        assert_eq!(
            master.union_span(&slave),
            Some(KeyRange::inclusive(Key::Int(1), Key::Int(50)))
        );
        assert_eq!(
            RangeSummary::empty().union_span(&slave),
            Some(KeyRange::inclusive(Key::Int(1), Key::Int(20)))
        );
        assert_eq!(RangeSummary::empty().union_span(&RangeSummary::empty()), None);
    }

    #[test]
    fn test_batch_digest_matches_needs_count_and_sums() {
        let a = BatchDigest { count: 2, sums: vec![10, 20] };
        let b = BatchDigest { count: 2, sums: vec![10, 20] };
        let c = BatchDigest { count: 3, sums: vec![10, 20] };
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }
}

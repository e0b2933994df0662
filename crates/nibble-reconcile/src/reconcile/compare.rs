//! Row-level comparison of per-row digests.

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::types::{Classification, VerifiedId, WindowTally};
use crate::core::{Connector, Key, RowDigest};
use crate::error::Result;
use crate::retry::{retry, RetryPolicy};

/// Which dataset a set of digests came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Master,
    Slave,
}

impl Side {
    pub(crate) fn other(self) -> Side {
        match self {
            Side::Master => Side::Slave,
            Side::Slave => Side::Master,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Master => write!(f, "master"),
            Side::Slave => write!(f, "slave"),
        }
    }
}

/// Index digests by id.
pub(crate) fn digest_map(rows: &[RowDigest]) -> HashMap<&Key, &str> {
    rows.iter().map(|r| (&r.id, r.hash.as_str())).collect()
}

fn classify(master: Option<&str>, slave: Option<&str>) -> Option<Classification> {
    match (master, slave) {
        (Some(m), Some(s)) if m == s => Some(Classification::Correct),
        (Some(_), Some(_)) => Some(Classification::Incorrect),
        (Some(_), None) => Some(Classification::Missing),
        (None, Some(_)) => Some(Classification::Extra),
        (None, None) => None,
    }
}

/// Classify every id of a window from both sides' full per-row digests.
///
/// Extra ids are recorded in slave order.
pub(crate) fn diff(master: &[RowDigest], slave: &[RowDigest], tally: &mut WindowTally) {
    let slave_map = digest_map(slave);
    let mut seen: HashSet<&Key> = HashSet::with_capacity(master.len());

    for row in master {
        seen.insert(&row.id);
        let slave_hash = slave_map.get(&row.id).copied();
        if let Some(class) = classify(Some(&row.hash), slave_hash) {
            tally.record(&row.id, class);
        }
    }

    for row in slave {
        if !seen.contains(&row.id) {
            tally.record(&row.id, Classification::Extra);
        }
    }
}

/// Classify ids enumerated on `known_side` against point lookups of the same
/// ids on the other side. Returns how many of the ids were found there.
pub(crate) fn classify_lookup(
    known: &[RowDigest],
    known_side: Side,
    found: &[RowDigest],
    tally: &mut WindowTally,
) -> u64 {
    let found_map = digest_map(found);
    let mut matched = 0;

    for row in known {
        let other = found_map.get(&row.id).copied();
        if other.is_some() {
            matched += 1;
        }
        let class = match known_side {
            Side::Master => classify(Some(&row.hash), other),
            Side::Slave => classify(other, Some(&row.hash)),
        };
        if let Some(class) = class {
            tally.record(&row.id, class);
        }
    }

    matched
}

/// Whether two point lookups of the same ids returned identical digests.
pub(crate) fn lookups_agree(master: &[RowDigest], slave: &[RowDigest]) -> bool {
    digest_map(master) == digest_map(slave)
}

/// Classify an explicit id list by point-looking it up on both sides.
///
/// Used on demand, outside the windowed scan. Both connectors must already
/// be initialized. Results are returned in the order of `ids`; duplicates are
/// collapsed.
pub async fn verify_ids(
    master: &dyn Connector,
    slave: &dyn Connector,
    ids: &[Key],
    policy: &RetryPolicy,
) -> Result<Vec<VerifiedId>> {
    let mut unique: Vec<Key> = Vec::with_capacity(ids.len());
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if seen.insert(id) {
            unique.push(id.clone());
        }
    }
    if unique.is_empty() {
        return Ok(Vec::new());
    }

    let lookup = unique.as_slice();
    let (master_rows, slave_rows) = tokio::join!(
        retry("sample", policy, move || master.sample(lookup)),
        retry("sample", policy, move || slave.sample(lookup)),
    );
    let master_rows = master_rows?;
    let slave_rows = slave_rows?;

    let master_map = digest_map(&master_rows);
    let slave_map = digest_map(&slave_rows);

    Ok(unique
        .iter()
        .map(|id| VerifiedId {
            id: id.clone(),
            classification: classify(master_map.get(id).copied(), slave_map.get(id).copied()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::MemoryConnector;
    use serde_json::json;

    fn d(id: i64, hash: &str) -> RowDigest {
        RowDigest::new(id, hash)
    }

    #[test]
    fn test_diff_classifies_all_four_ways() {
        let master = vec![d(1, "a"), d(2, "b"), d(3, "c")];
        let slave = vec![d(1, "a"), d(2, "x"), d(4, "d"), d(5, "e")];

        let mut tally = WindowTally::default();
        diff(&master, &slave, &mut tally);

        assert_eq!(tally.correct, 1);
        assert_eq!(tally.incorrect, 1);
        assert_eq!(tally.missing, 1);
        assert_eq!(tally.extra, vec![Key::Int(4), Key::Int(5)]);
    }

    #[test]
    fn test_lookup_from_master_side() {
        // slave individual failed; master ids looked up on the slave
        let known = vec![d(2, "hello"), d(10_000_000, "{}")];
        let found = vec![d(2, "{}"), d(10_000_000, "{}")];

        let mut tally = WindowTally::default();
        let matched = classify_lookup(&known, Side::Master, &found, &mut tally);

        assert_eq!(matched, 2);
        assert_eq!(tally.correct, 1);
        assert_eq!(tally.incorrect, 1);
        assert!(tally.extra.is_empty());
    }

    #[test]
    fn test_lookup_from_slave_side_finds_extras() {
        let known = vec![d(1, "a"), d(7, "z")];
        let found = vec![d(1, "a")];

        let mut tally = WindowTally::default();
        let matched = classify_lookup(&known, Side::Slave, &found, &mut tally);

        assert_eq!(matched, 1);
        assert_eq!(tally.correct, 1);
        assert_eq!(tally.extra, vec![Key::Int(7)]);
        assert_eq!(tally.missing, 0);
    }

    #[test]
    fn test_lookups_agree_ignores_order() {
        assert!(lookups_agree(&[d(1, "a"), d(2, "b")], &[d(2, "b"), d(1, "a")]));
        assert!(!lookups_agree(&[d(1, "a")], &[d(1, "b")]));
        assert!(!lookups_agree(&[d(1, "a")], &[]));
        assert_eq!(Side::Master.other(), Side::Slave);
    }

    #[tokio::test]
    async fn test_verify_ids() {
        let master = MemoryConnector::new("master").with_rows([
            (1i64, json!("hello")),
            (2, json!("hello")),
            (3, json!("only master")),
        ]);
        let slave = MemoryConnector::new("slave").with_rows([
            (1i64, json!("hello")),
            (2, json!("changed")),
            (4, json!("only slave")),
        ]);
        master.initialize().await.unwrap();
        slave.initialize().await.unwrap();

        let ids: Vec<Key> = [1, 2, 3, 4, 5, 1].into_iter().map(Key::Int).collect();
        let results = verify_ids(&master, &slave, &ids, &RetryPolicy::test()).await.unwrap();

        let classes: Vec<_> = results.iter().map(|r| r.classification).collect();
        assert_eq!(
            classes,
            vec![
                Some(Classification::Correct),
                Some(Classification::Incorrect),
                Some(Classification::Missing),
                Some(Classification::Extra),
                None,
            ]
        );
    }
}

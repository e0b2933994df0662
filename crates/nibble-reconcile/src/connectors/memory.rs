//! In-memory connector backed by an ordered map.
//!
//! Serves as the reference implementation of the capability contract and as
//! the flat-file connector used by the CLI: a JSON object of `id -> row` is
//! loaded on `initialize` and optionally written back on `destroy`.

use async_trait::async_trait;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::core::{BatchDigest, Connector, Key, KeyRange, NibbleProbe, RangeSummary, RowDigest};
use crate::error::{ReconcileError, Result};

/// Connector holding its rows in a `BTreeMap`.
pub struct MemoryConnector {
    name: String,
    rows: RwLock<BTreeMap<Key, Value>>,
    source_path: Option<PathBuf>,
    write_back: bool,
    max_individual_rows: Option<usize>,
    initialized: AtomicBool,
    dirty: AtomicBool,
}

impl MemoryConnector {
    /// Create an empty connector.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            source_path: None,
            write_back: false,
            max_individual_rows: None,
            initialized: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    /// Create a connector over a JSON file mapping ids to rows.
    ///
    /// The file is read on [`Connector::initialize`].
    pub fn from_json_file(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let mut conn = Self::new(name);
        conn.source_path = Some(path.as_ref().to_path_buf());
        conn
    }

    /// Seed the connector with rows.
    pub fn with_rows<I, K>(self, rows: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Key>,
    {
        {
            let mut map = self.write_rows();
            for (k, v) in rows {
                map.insert(k.into(), v);
            }
        }
        self
    }

    /// Write the dataset back to its source file on `destroy` if rows were deleted.
    pub fn with_write_back(mut self, write_back: bool) -> Self {
        self.write_back = write_back;
        self
    }

    /// Fail `individual` with a payload error when a range holds more rows.
    pub fn with_max_individual_rows(mut self, max_rows: usize) -> Self {
        self.max_individual_rows = Some(max_rows);
        self
    }

    /// Insert or replace a row.
    pub fn insert(&self, key: Key, value: Value) {
        self.write_rows().insert(key, value);
    }

    /// Current row count.
    pub fn len(&self) -> usize {
        self.read_rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_rows().is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.read_rows().contains_key(key)
    }

    /// Snapshot of all keys in order.
    pub fn keys(&self) -> Vec<Key> {
        self.read_rows().keys().cloned().collect()
    }

    fn read_rows(&self) -> RwLockReadGuard<'_, BTreeMap<Key, Value>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_rows(&self) -> RwLockWriteGuard<'_, BTreeMap<Key, Value>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_session(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReconcileError::connection(&self.name, "session not initialized"))
        }
    }

    async fn load_file(&self, path: &Path) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ReconcileError::connection(&self.name, format!("cannot read {}: {}", path.display(), e))
        })?;
        let DatasetEntries(entries) = serde_json::from_str(&content)
            .map_err(|e| ReconcileError::Config(format!("{}: {}", path.display(), e)))?;

        let mut rows = BTreeMap::new();
        for (id, value) in entries {
            if rows.insert(Key::parse(&id), value).is_some() {
                return Err(ReconcileError::Config(format!(
                    "{}: duplicate id {:?}",
                    path.display(),
                    id
                )));
            }
        }

        info!("{}: loaded {} rows from {}", self.name, rows.len(), path.display());
        *self.write_rows() = rows;
        Ok(())
    }

    async fn save_file(&self, path: &Path) -> Result<()> {
        let object: serde_json::Map<String, Value> = self
            .read_rows()
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let content = serde_json::to_string_pretty(&Value::Object(object))?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, path).await?;
        info!("{}: wrote dataset back to {}", self.name, path.display());
        Ok(())
    }
}

/// Top-level entries of a dataset file in document order, repeated ids
/// included. `serde_json::Map` would keep only the last of them.
struct DatasetEntries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for DatasetEntries {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = DatasetEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object mapping ids to rows")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<DatasetEntries, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(entry) = access.next_entry::<String, Value>()? {
                    entries.push(entry);
                }
                Ok(DatasetEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Hex SHA-256 of the row's JSON text.
pub fn row_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Two checksum lanes for a row, keyed by id so swapped rows do not cancel out.
fn row_lanes(key: &Key, hash: &str) -> [u64; 2] {
    let mut hasher = Sha256::new();
    hasher.update(key.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(hash.as_bytes());
    let digest = hasher.finalize();

    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&digest[..8]);
    hi.copy_from_slice(&digest[8..16]);
    [u64::from_le_bytes(lo), u64::from_le_bytes(hi)]
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        if let Some(path) = &self.source_path {
            self.load_file(path).await?;
        }
        self.initialized.store(true, Ordering::SeqCst);
        debug!("{}: session initialized", self.name);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let was_open = self.initialized.swap(false, Ordering::SeqCst);
        if was_open && self.write_back && self.dirty.swap(false, Ordering::SeqCst) {
            if let Some(path) = &self.source_path {
                self.save_file(path).await?;
            }
        }
        debug!("{}: session destroyed", self.name);
        Ok(())
    }

    async fn range(&self, start: Option<&Key>, end: Option<&Key>) -> Result<RangeSummary> {
        self.ensure_session()?;

        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Ok(RangeSummary::empty());
            }
        }

        let lower = start.map_or(std::ops::Bound::Unbounded, std::ops::Bound::Included);
        let upper = end.map_or(std::ops::Bound::Unbounded, std::ops::Bound::Included);

        let rows = self.read_rows();
        let mut iter = rows.range::<Key, _>((lower, upper)).map(|(k, _)| k);
        let Some(min) = iter.next() else {
            return Ok(RangeSummary::empty());
        };
        let mut max = min;
        let mut total = 1u64;
        for k in iter {
            max = k;
            total += 1;
        }

        Ok(RangeSummary::new(min.clone(), max.clone(), total))
    }

    async fn nibble(&self, range: &KeyRange, limit: usize, reverse: bool) -> Result<NibbleProbe> {
        self.ensure_session()?;
        if range.is_empty() {
            return Ok(NibbleProbe::default());
        }

        let rows = self.read_rows();
        let keys = rows.range::<Key, _>(range.as_bounds()).map(|(k, _)| k);
        let ordered: Box<dyn Iterator<Item = &Key>> = if reverse {
            Box::new(keys.rev())
        } else {
            Box::new(keys)
        };

        let mut probe = NibbleProbe::default();
        for (i, key) in ordered.enumerate() {
            if i < limit.max(1) {
                probe.current = Some(key.clone());
            } else {
                probe.next = Some(key.clone());
                break;
            }
        }
        Ok(probe)
    }

    async fn batch(&self, range: &KeyRange) -> Result<BatchDigest> {
        self.ensure_session()?;
        if range.is_empty() {
            return Ok(BatchDigest {
                count: 0,
                sums: vec![0, 0],
            });
        }

        let rows = self.read_rows();
        let mut digest = BatchDigest {
            count: 0,
            sums: vec![0, 0],
        };
        for (k, v) in rows.range::<Key, _>(range.as_bounds()) {
            let lanes = row_lanes(k, &row_hash(v));
            digest.count += 1;
            digest.sums[0] = digest.sums[0].wrapping_add(lanes[0]);
            digest.sums[1] = digest.sums[1].wrapping_add(lanes[1]);
        }
        Ok(digest)
    }

    async fn individual(&self, range: &KeyRange) -> Result<Vec<RowDigest>> {
        self.ensure_session()?;
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.read_rows();
        let digests: Vec<RowDigest> = rows
            .range::<Key, _>(range.as_bounds())
            .map(|(k, v)| RowDigest::new(k.clone(), row_hash(v)))
            .collect();

        if let Some(max_rows) = self.max_individual_rows {
            if digests.len() > max_rows {
                return Err(ReconcileError::payload_too_large(&self.name, digests.len() as u64));
            }
        }
        Ok(digests)
    }

    async fn sample(&self, ids: &[Key]) -> Result<Vec<RowDigest>> {
        self.ensure_session()?;
        let rows = self.read_rows();
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(id).map(|v| RowDigest::new(id.clone(), row_hash(v))))
            .collect())
    }

    async fn delete(&self, ids: &[Key]) -> Result<u64> {
        self.ensure_session()?;
        let mut rows = self.write_rows();
        let removed = ids.iter().filter(|id| rows.remove(*id).is_some()).count() as u64;
        if removed > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::ops::Bound;
    use tempfile::NamedTempFile;

    async fn open(rows: Vec<(i64, Value)>) -> MemoryConnector {
        let conn = MemoryConnector::new("test").with_rows(rows);
        conn.initialize().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_operations_require_session() {
        let conn = MemoryConnector::new("test");
        let err = conn.range(None, None).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_range_summary() {
        let conn = open(vec![(3, json!(1)), (7, json!(2)), (9, json!(3))]).await;
        let all = conn.range(None, None).await.unwrap();
        assert_eq!(all, RangeSummary::new(Key::Int(3), Key::Int(9), 3));

        let sub = conn.range(Some(&Key::Int(4)), Some(&Key::Int(9))).await.unwrap();
        assert_eq!(sub, RangeSummary::new(Key::Int(7), Key::Int(9), 2));

        let inverted = conn.range(Some(&Key::Int(9)), Some(&Key::Int(3))).await.unwrap();
        assert!(inverted.is_empty());
    }

    #[tokio::test]
    async fn test_nibble_forward_and_reverse() {
        let conn = open((1..=5).map(|i| (i, json!(i))).collect()).await;
        let all = KeyRange::inclusive(Key::Int(1), Key::Int(5));

        let fwd = conn.nibble(&all, 2, false).await.unwrap();
        assert_eq!(fwd.current, Some(Key::Int(2)));
        assert_eq!(fwd.next, Some(Key::Int(3)));

        let rev = conn.nibble(&all, 2, true).await.unwrap();
        assert_eq!(rev.current, Some(Key::Int(4)));
        assert_eq!(rev.next, Some(Key::Int(3)));

        let short = conn.nibble(&all, 10, false).await.unwrap();
        assert_eq!(short.current, Some(Key::Int(5)));
        assert_eq!(short.next, None);
    }

    #[tokio::test]
    async fn test_batch_detects_swapped_rows() {
        let a = open(vec![(1, json!("x")), (2, json!("y"))]).await;
        let b = open(vec![(1, json!("y")), (2, json!("x"))]).await;
        let c = open(vec![(1, json!("x")), (2, json!("y"))]).await;
        let all = KeyRange::inclusive(Key::Int(1), Key::Int(2));

        let da = a.batch(&all).await.unwrap();
        assert_eq!(da.count, 2);
        assert!(!da.matches(&b.batch(&all).await.unwrap()));
        assert!(da.matches(&c.batch(&all).await.unwrap()));
    }

    #[tokio::test]
    async fn test_individual_payload_limit() {
        let conn = MemoryConnector::new("slave")
            .with_rows((1i64..=10).map(|i| (i, json!({}))))
            .with_max_individual_rows(4);
        conn.initialize().await.unwrap();

        let wide = KeyRange::inclusive(Key::Int(1), Key::Int(10));
        assert!(conn.individual(&wide).await.unwrap_err().is_payload_too_large());

        let narrow = KeyRange::new(Bound::Excluded(Key::Int(6)), Bound::Included(Key::Int(10)));
        assert_eq!(conn.individual(&narrow).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_sample_and_delete() {
        let conn = open(vec![(1, json!("a")), (2, json!("b"))]).await;
        let found = conn.sample(&[Key::Int(2), Key::Int(99)]).await.unwrap();
        assert_eq!(found, vec![RowDigest::new(2, row_hash(&json!("b")))]);

        assert_eq!(conn.delete(&[Key::Int(1), Key::Int(99)]).await.unwrap(), 1);
        assert!(!conn.contains(&Key::Int(1)));
        assert_eq!(conn.len(), 1);
    }

    #[tokio::test]
    async fn test_file_round_trip_with_write_back() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{"1": "hello", "2": {"a": 1}, "k": null}"#).unwrap();

        let conn = MemoryConnector::from_json_file("slave", file.path()).with_write_back(true);
        conn.initialize().await.unwrap();
        assert_eq!(conn.keys(), vec![Key::Int(1), Key::Int(2), Key::from("k")]);

        conn.delete(&[Key::Int(2)]).await.unwrap();
        conn.destroy().await.unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(written, json!({"1": "hello", "k": null}));
    }

    #[tokio::test]
    async fn test_non_canonical_integer_ids_stay_distinct() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{"7": "a", "007": "b", "+7": "c", "9": "x"}"#).unwrap();

        let conn = MemoryConnector::from_json_file("slave", file.path()).with_write_back(true);
        conn.initialize().await.unwrap();
        assert_eq!(conn.len(), 4);
        assert!(conn.contains(&Key::Int(7)));
        assert!(conn.contains(&Key::from("007")));
        assert!(conn.contains(&Key::from("+7")));

        conn.delete(&[Key::Int(9)]).await.unwrap();
        conn.destroy().await.unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(written, json!({"7": "a", "007": "b", "+7": "c"}));
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected_on_load() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{"7": "a", "8": "b", "7": "c"}"#).unwrap();

        let conn = MemoryConnector::from_json_file("slave", file.path());
        let err = conn.initialize().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Config(_)), "{}", err);
        assert!(err.to_string().contains("duplicate id"));
        assert!(conn.is_empty());
    }

    #[tokio::test]
    async fn test_non_object_dataset_rejected() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[1, 2, 3]").unwrap();

        let err = MemoryConnector::from_json_file("master", file.path())
            .initialize()
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Config(_)), "{}", err);
    }
}

//! # Shard Manager
//!
//! Owns the engine handle and the mapping from key ranges to physical
//! shards (one engine column family each). The mapping is persisted as
//! ordered boundary records under `ShardMapping/` in the metadata shard, so
//! a fresh process reconstructs the exact assignment on open and drops any
//! orphaned column family a crash left behind.

use crate::consts::{ALL_KEYS_MAX, METADATA_SHARD_ID, PRIVATE_PREFIX, SHARD_MAPPING_PREFIX};
use crate::engine::{IterOptions, KvEngine, WriteBatch};
use crate::err::Error;
use crate::err::Error::*;
use crate::mlog::Mutation;
use crate::types::{Key, KeyRange};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One engine column family, shared by every data shard assigned to it
#[derive(Debug)]
pub struct PhysicalShard {
    pub id: String,
    /// Set once the column family exists; shards are usable only after init
    pub initialized: AtomicBool,
    /// Set when cleanup decided the family must go; no further reads
    pub delete_pending: AtomicBool,
}

impl PhysicalShard {
    fn new(id: String) -> Self {
        Self {
            id,
            initialized: AtomicBool::new(false),
            delete_pending: AtomicBool::new(false),
        }
    }

    pub fn usable(&self) -> bool {
        self.initialized.load(Ordering::Acquire) && !self.delete_pending.load(Ordering::Acquire)
    }
}

/// A contiguous range attached to one physical shard
#[derive(Clone, Debug)]
pub struct DataShard {
    pub range: KeyRange,
    pub physical_id: String,
}

struct Mapping {
    /// Keyed by range begin; ranges never overlap
    ranges: BTreeMap<Key, DataShard>,
    physical: HashMap<String, Arc<PhysicalShard>>,
}

pub struct ShardManager {
    engine: Arc<dyn KvEngine>,
    state: RwLock<Mapping>,
}

impl ShardManager {
    /// Opens over an engine: reads the persisted mapping out of the
    /// metadata shard (creating it on first open) and drops orphan column
    /// families that no mapping record references.
    pub async fn open(engine: Arc<dyn KvEngine>) -> Result<Self, Error> {
        let families = engine.list_column_families().await?;
        let mut ranges = BTreeMap::new();
        let mut physical: HashMap<String, Arc<PhysicalShard>> = HashMap::new();

        if families.iter().any(|f| f == METADATA_SHARD_ID) {
            let prefix_len = SHARD_MAPPING_PREFIX.len();
            let mapping_range = crate::types::prefix_range(SHARD_MAPPING_PREFIX);
            let mut iter = engine
                .iter(METADATA_SHARD_ID, IterOptions::bounded(&mapping_range))
                .await?;
            let mut boundaries: Vec<(Key, String)> = Vec::new();
            let mut entry = iter.seek(SHARD_MAPPING_PREFIX).await?;
            while let Some(e) = entry {
                let begin = e.key[prefix_len..].to_vec();
                let id = String::from_utf8_lossy(&e.value).to_string();
                boundaries.push((begin, id));
                entry = iter.next_entry().await?;
            }
            for window in boundaries.windows(2) {
                let (begin, id) = &window[0];
                let (end, _) = &window[1];
                if !id.is_empty() {
                    Self::attach(&mut ranges, &mut physical, KeyRange::new(begin, end), id.clone());
                }
            }
            if let Some((begin, id)) = boundaries.last() {
                if !id.is_empty() {
                    return Err(Internal(format!(
                        "shard mapping ends in assigned boundary {} -> {}",
                        crate::util::printable(begin),
                        id
                    )));
                }
            }
        } else {
            engine.create_column_family(METADATA_SHARD_ID).await?;
            let mut batch = WriteBatch::new();
            let mut seed = SHARD_MAPPING_PREFIX.to_vec();
            seed.extend_from_slice(b"");
            batch.put(METADATA_SHARD_ID, &seed, b"");
            engine
                .write(batch, crate::engine::WriteOptions { sync: true })
                .await?;
        }

        for ps in physical.values() {
            if families.iter().any(|f| f == &ps.id) {
                ps.initialized.store(true, Ordering::Release);
            } else {
                return Err(Internal(format!("mapping references missing column family {}", ps.id)));
            }
        }
        for family in &families {
            if family != METADATA_SHARD_ID && !physical.contains_key(family) {
                log::warn!("dropping orphan column family {}", family);
                engine.drop_column_family(family).await?;
            }
        }

        Ok(Self {
            engine,
            state: RwLock::new(Mapping { ranges, physical }),
        })
    }

    fn attach(
        ranges: &mut BTreeMap<Key, DataShard>,
        physical: &mut HashMap<String, Arc<PhysicalShard>>,
        range: KeyRange,
        id: String,
    ) {
        physical
            .entry(id.clone())
            .or_insert_with(|| Arc::new(PhysicalShard::new(id.clone())));
        ranges.insert(
            range.begin.clone(),
            DataShard {
                range,
                physical_id: id,
            },
        );
    }

    pub fn engine(&self) -> Arc<dyn KvEngine> {
        self.engine.clone()
    }

    /// Attaches `range` to physical shard `id`, allocating (and
    /// initialising) the shard on first use.
    pub async fn add_range(&self, range: KeyRange, id: &str) -> Result<(), Error> {
        let needs_init = {
            let mut state = self.state.write().await;
            debug_assert!(
                !state
                    .ranges
                    .values()
                    .any(|ds| ds.range.intersects(&range)),
                "add_range over an occupied range {}",
                range
            );
            let ps = state
                .physical
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(PhysicalShard::new(id.to_string())))
                .clone();
            state.ranges.insert(
                range.begin.clone(),
                DataShard {
                    range: range.clone(),
                    physical_id: id.to_string(),
                },
            );
            !ps.initialized.load(Ordering::Acquire)
        };
        if needs_init {
            match self.engine.create_column_family(id).await {
                Ok(()) | Err(ColumnFamilyExists(_)) => {}
                Err(err) => return Err(err),
            }
            let state = self.state.read().await;
            if let Some(ps) = state.physical.get(id) {
                ps.initialized.store(true, Ordering::Release);
            }
        }
        log::debug!("attached range {} to physical shard {}", range, id);
        Ok(())
    }

    /// Detaches `range` from the mapping, shrinking straddling shards to
    /// their residue. Returns the physical shards left empty.
    pub async fn remove_range(&self, range: &KeyRange) -> Vec<String> {
        let mut state = self.state.write().await;
        let intersecting: Vec<Key> = state
            .ranges
            .values()
            .filter(|ds| ds.range.intersects(range))
            .map(|ds| ds.range.begin.clone())
            .collect();
        for begin in intersecting {
            let ds = state.ranges.remove(&begin).unwrap();
            if ds.range.begin < range.begin {
                let left = KeyRange::new(&ds.range.begin, &range.begin);
                Self::attach_existing(&mut state.ranges, left, ds.physical_id.clone());
            }
            if ds.range.end > range.end {
                let right = KeyRange::new(&range.end, &ds.range.end);
                Self::attach_existing(&mut state.ranges, right, ds.physical_id.clone());
            }
        }
        let mut candidates = Vec::new();
        for (id, _ps) in state.physical.iter() {
            if !state.ranges.values().any(|ds| &ds.physical_id == id) {
                candidates.push(id.clone());
            }
        }
        candidates
    }

    fn attach_existing(ranges: &mut BTreeMap<Key, DataShard>, range: KeyRange, id: String) {
        ranges.insert(
            range.begin.clone(),
            DataShard {
                range,
                physical_id: id,
            },
        );
    }

    /// Drops the column families of shards that are still empty. Safe to
    /// call twice with the same ids.
    pub async fn cleanup_shards(&self, ids: &[String]) -> Result<(), Error> {
        for id in ids {
            let ps = {
                let state = self.state.read().await;
                if state.ranges.values().any(|ds| &ds.physical_id == id) {
                    continue;
                }
                state.physical.get(id).cloned()
            };
            let Some(ps) = ps else { continue };
            ps.delete_pending.store(true, Ordering::Release);
            self.engine.drop_column_family(id).await?;
            self.state.write().await.physical.remove(id);
            log::debug!("cleaned up empty physical shard {}", id);
        }
        Ok(())
    }

    /// Rewrites the canonical mapping records covering `range` into
    /// `batch`. With `is_add` the records mirror the in-memory map; without
    /// it a single empty record lands at `range.begin`. The record at
    /// `range.end` is always rewritten so readers can detect the boundary.
    pub async fn persist_range_mapping(&self, batch: &mut WriteBatch, range: &KeyRange, is_add: bool) {
        let state = self.state.read().await;
        let mapped = |key: &[u8]| {
            let mut k = SHARD_MAPPING_PREFIX.to_vec();
            k.extend_from_slice(key);
            k
        };
        batch.delete_range(METADATA_SHARD_ID, mapped(&range.begin), mapped(&range.end));
        if is_add {
            let mut cursor = range.begin.clone();
            let shards: Vec<DataShard> = state
                .ranges
                .values()
                .filter(|ds| ds.range.intersects(range))
                .cloned()
                .collect();
            for ds in shards {
                if ds.range.begin > cursor {
                    batch.put(METADATA_SHARD_ID, mapped(&cursor), b"");
                }
                let begin = if ds.range.begin > range.begin {
                    ds.range.begin.clone()
                } else {
                    range.begin.clone()
                };
                batch.put(METADATA_SHARD_ID, mapped(&begin), ds.physical_id.as_bytes());
                cursor = ds.range.end.clone();
            }
            if cursor < range.end {
                batch.put(METADATA_SHARD_ID, mapped(&cursor), b"");
            }
        } else {
            batch.put(METADATA_SHARD_ID, mapped(&range.begin), b"");
        }
        let after = state
            .ranges
            .values()
            .find(|ds| ds.range.contains(&range.end))
            .map(|ds| ds.physical_id.clone())
            .unwrap_or_default();
        batch.put(METADATA_SHARD_ID, mapped(&range.end), after.as_bytes());
    }

    /// Which physical shard serves `key`. Private keys always route to the
    /// metadata shard.
    pub async fn locate(&self, key: &[u8]) -> Option<String> {
        if key >= PRIVATE_PREFIX {
            return Some(METADATA_SHARD_ID.to_string());
        }
        let state = self.state.read().await;
        let ds = state
            .ranges
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, ds)| ds)?;
        if !ds.range.contains(key) {
            return None;
        }
        let ps = state.physical.get(&ds.physical_id)?;
        if ps.usable() {
            Some(ds.physical_id.clone())
        } else {
            None
        }
    }

    /// Every `(sub-range, column family)` pair intersecting `range`, in key
    /// order. Private tail keys route to the metadata shard.
    pub async fn intersecting(&self, range: &KeyRange) -> Vec<(KeyRange, String)> {
        let mut out = Vec::new();
        let state = self.state.read().await;
        // start one entry below range.begin to catch a straddling shard
        let window_start = state
            .ranges
            .range(..=range.begin.clone())
            .next_back()
            .map(|(k, _)| k.clone())
            .unwrap_or_default();
        for (_, ds) in state.ranges.range(window_start..range.end.clone()) {
            if ds.range.intersects(range) {
                if let Some(ps) = state.physical.get(&ds.physical_id) {
                    if ps.usable() {
                        out.push((ds.range.intersect(range), ds.physical_id.clone()));
                    }
                }
            }
        }
        let private_tail = KeyRange::new(PRIVATE_PREFIX, ALL_KEYS_MAX);
        if range.intersects(&private_tail) {
            out.push((range.intersect(&private_tail), METADATA_SHARD_ID.to_string()));
        }
        out
    }

    /// Routes one canonical mutation into `batch`, splitting clears across
    /// every physical shard they touch.
    pub async fn add_mutation_to_batch(&self, batch: &mut WriteBatch, m: &Mutation) -> Result<(), Error> {
        match m {
            Mutation::SetValue { key, value } => {
                let cf = self.locate(key).await.ok_or(ShardNotFound)?;
                batch.put(&cf, key, value);
            }
            Mutation::ClearRange { begin, end } => {
                let range = KeyRange::new(begin, end);
                for (sub, cf) in self.intersecting(&range).await {
                    batch.delete_range(&cf, &sub.begin, &sub.end);
                }
            }
            Mutation::Atomic { .. } => {
                return Err(Internal("atomic mutation reached the durability path unresolved".into()))
            }
        }
        Ok(())
    }

    /// Snapshot of the data-shard map, for diagnostics and tests
    pub async fn shards(&self) -> Vec<DataShard> {
        self.state.read().await.ranges.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lsm::{LsmEngine, LsmOptions};
    use tempfile::tempdir;

    async fn manager(dir: &std::path::Path) -> ShardManager {
        let engine = LsmEngine::open(dir, LsmOptions::default()).await.unwrap();
        ShardManager::open(engine).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_locate_remove() {
        let root = tempdir().unwrap();
        let sm = manager(&root.path().join("db")).await;
        sm.add_range(KeyRange::new(b"a", b"c"), "p1").await.unwrap();
        sm.add_range(KeyRange::new(b"c", b"f"), "p2").await.unwrap();

        assert_eq!(sm.locate(b"b").await, Some("p1".to_string()));
        assert_eq!(sm.locate(b"c").await, Some("p2".to_string()));
        assert_eq!(sm.locate(b"z").await, None);
        assert_eq!(sm.locate(b"\xff\xffVersion").await, Some(METADATA_SHARD_ID.to_string()));

        let candidates = sm.remove_range(&KeyRange::new(b"a", b"c")).await;
        assert_eq!(candidates, vec!["p1".to_string()]);
        assert_eq!(sm.locate(b"b").await, None);
        sm.cleanup_shards(&candidates).await.unwrap();
        sm.cleanup_shards(&candidates).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_range_shrinks_straddlers() {
        let root = tempdir().unwrap();
        let sm = manager(&root.path().join("db")).await;
        sm.add_range(KeyRange::new(b"a", b"z"), "p1").await.unwrap();
        let candidates = sm.remove_range(&KeyRange::new(b"d", b"m")).await;
        assert!(candidates.is_empty());
        assert_eq!(sm.locate(b"b").await, Some("p1".to_string()));
        assert_eq!(sm.locate(b"d").await, None);
        assert_eq!(sm.locate(b"m").await, Some("p1".to_string()));
        let shards = sm.shards().await;
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].range, KeyRange::new(b"a", b"d"));
        assert_eq!(shards[1].range, KeyRange::new(b"m", b"z"));
    }

    #[tokio::test]
    async fn test_mapping_survives_reopen() {
        let root = tempdir().unwrap();
        let path = root.path().join("db");
        {
            let engine = LsmEngine::open(&path, LsmOptions::default()).await.unwrap();
            let sm = ShardManager::open(engine.clone()).await.unwrap();
            sm.add_range(KeyRange::new(b"a", b"c"), "p1").await.unwrap();
            sm.add_range(KeyRange::new(b"c", b"f"), "p2").await.unwrap();
            let mut batch = WriteBatch::new();
            sm.persist_range_mapping(&mut batch, &KeyRange::new(b"a", b"f"), true).await;
            engine
                .write(batch, crate::engine::WriteOptions { sync: true })
                .await
                .unwrap();
            engine.close().await.unwrap();
        }
        let sm = manager(&path).await;
        assert_eq!(sm.locate(b"b").await, Some("p1".to_string()));
        assert_eq!(sm.locate(b"d").await, Some("p2".to_string()));
        assert_eq!(sm.locate(b"g").await, None);
    }

    #[tokio::test]
    async fn test_orphan_family_dropped_on_open() {
        let root = tempdir().unwrap();
        let path = root.path().join("db");
        {
            let engine = LsmEngine::open(&path, LsmOptions::default()).await.unwrap();
            let _sm = ShardManager::open(engine.clone()).await.unwrap();
            engine.create_column_family("orphan").await.unwrap();
            engine.close().await.unwrap();
        }
        let engine = LsmEngine::open(&path, LsmOptions::default()).await.unwrap();
        let _sm = ShardManager::open(engine.clone()).await.unwrap();
        let families = engine.list_column_families().await.unwrap();
        assert_eq!(families, vec![METADATA_SHARD_ID.to_string()]);
    }
}

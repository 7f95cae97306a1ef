//! # LSM engine
//!
//! The bundled [`KvEngine`] implementation. Each column family is a
//! subdirectory holding one write-ahead log per memtable plus the immutable
//! sorted-run files; the engine serialises writers, hands frozen memtables
//! to the background flusher and periodically merges runs.

use crate::engine::flush;
use crate::engine::iterator::EngineIter;
use crate::engine::memtable::{MemTable, MemTableHandle, MemValue};
use crate::engine::table::{TableReader, KIND_DELETE};
use crate::engine::wal::{Wal, WalOp};
use crate::engine::{BatchOp, IterOptions, KvEngine, KvIterator, WriteBatch, WriteOptions};
use crate::err::Error;
use crate::err::Error::*;
use crate::types::{KeyRange, SequenceNumber, Value};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{watch, Mutex, RwLock};

use crate::consts::{
    DEFAULT_COMPACTION_INTERVAL, DEFAULT_FALSE_POSITIVE_RATE, DEFAULT_MEMTABLE_BYTES, METADATA_SHARD_ID,
    RUN_FILE_PREFIX, RUN_FILE_SUFFIX, WAL_FILE_PREFIX,
};

#[derive(Clone, Debug)]
pub struct LsmOptions {
    pub memtable_bytes: usize,
    pub false_positive_rate: f64,
    /// Data blocks cached per table reader
    pub cache_blocks: usize,
    pub compaction_interval: std::time::Duration,
    /// Runs per column family before the background pass merges them
    pub compaction_trigger: usize,
}

impl Default for LsmOptions {
    fn default() -> Self {
        Self {
            memtable_bytes: DEFAULT_MEMTABLE_BYTES,
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            cache_blocks: 64,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            compaction_trigger: 6,
        }
    }
}

pub struct CfState {
    pub active: MemTableHandle,
    pub active_wal: Wal,
    /// Sealed memtables by id, oldest first, each still backed by its WAL
    pub frozen: IndexMap<u64, MemTableHandle>,
    /// Sorted newest first by max sequence
    pub tables: Vec<Arc<TableReader>>,
    pub next_mem_id: u64,
    pub next_run_id: u64,
    pub compact_hints: Vec<KeyRange>,
}

pub struct ColumnFamily {
    pub name: String,
    pub dir: PathBuf,
    pub state: RwLock<CfState>,
    /// Serialises flush and compaction for this family
    pub maintenance: Mutex<()>,
    pub dropped: AtomicBool,
}

impl ColumnFamily {
    pub fn wal_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{}-{:016x}.log", WAL_FILE_PREFIX, id))
    }

    pub fn run_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{}-{:016x}.{}", RUN_FILE_PREFIX, id, RUN_FILE_SUFFIX))
    }

    async fn create(dir: PathBuf, name: String) -> Result<Self, Error> {
        fs::create_dir_all(&dir).await.map_err(|error| DirCreationError {
            path: dir.clone(),
            error,
        })?;
        let wal = Wal::create(Self::wal_path(&dir, 1)).await?;
        Ok(Self {
            name,
            dir,
            state: RwLock::new(CfState {
                active: Arc::new(MemTable::new(1)),
                active_wal: wal,
                frozen: IndexMap::new(),
                tables: Vec::new(),
                next_mem_id: 2,
                next_run_id: 1,
                compact_hints: Vec::new(),
            }),
            maintenance: Mutex::new(()),
            dropped: AtomicBool::new(false),
        })
    }

    /// Reopens a family directory: sorted runs load eagerly, WAL tails replay
    /// into a fresh active memtable. Returns the largest sequence seen.
    async fn recover(dir: PathBuf, name: String, opts: &LsmOptions) -> Result<(Self, SequenceNumber), Error> {
        let mut wal_ids: Vec<u64> = Vec::new();
        let mut run_ids: Vec<u64> = Vec::new();
        let mut dirents = fs::read_dir(&dir).await.map_err(|error| FileOpenError {
            path: dir.clone(),
            error,
        })?;
        while let Some(entry) = dirents.next_entry().await.map_err(|error| FileReadError {
            path: dir.clone(),
            error,
        })? {
            let fname = entry.file_name().to_string_lossy().to_string();
            if let Some(hex) = fname
                .strip_prefix(&format!("{}-", WAL_FILE_PREFIX))
                .and_then(|s| s.strip_suffix(".log"))
            {
                if let Ok(id) = u64::from_str_radix(hex, 16) {
                    wal_ids.push(id);
                }
            } else if let Some(hex) = fname
                .strip_prefix(&format!("{}-", RUN_FILE_PREFIX))
                .and_then(|s| s.strip_suffix(&format!(".{}", RUN_FILE_SUFFIX)))
            {
                if let Ok(id) = u64::from_str_radix(hex, 16) {
                    run_ids.push(id);
                }
            }
        }
        wal_ids.sort_unstable();
        run_ids.sort_unstable();

        let mut max_seq: SequenceNumber = 0;
        let mut tables = Vec::with_capacity(run_ids.len());
        for id in &run_ids {
            let reader = TableReader::open(Self::run_path(&dir, *id), *id, opts.cache_blocks).await?;
            max_seq = max_seq.max(reader.max_seq);
            tables.push(Arc::new(reader));
        }
        tables.sort_by(|a, b| b.max_seq.cmp(&a.max_seq));

        // every surviving WAL replays into one fresh memtable; it refreezes
        // on its own once writes resume
        let next_mem_id = wal_ids.iter().max().copied().unwrap_or(0) + 1;
        let active = Arc::new(MemTable::new(next_mem_id));
        for id in &wal_ids {
            let path = Self::wal_path(&dir, *id);
            for op in Wal::replay(&path).await? {
                match op {
                    WalOp::Put { seq, key, value } => {
                        max_seq = max_seq.max(seq);
                        active.put(key, value, seq);
                    }
                    WalOp::Delete { seq, key } => {
                        max_seq = max_seq.max(seq);
                        active.delete(key, seq);
                    }
                    WalOp::DeleteRange { seq, begin, end } => {
                        max_seq = max_seq.max(seq);
                        active.delete_range(begin, end, seq);
                    }
                }
            }
        }
        // rewrite the merged tail under the new id, then retire old WALs
        let mut wal = Wal::create(Self::wal_path(&dir, next_mem_id)).await?;
        let mut merged_ops = Vec::new();
        for entry in active.entries.iter() {
            match &entry.value().value {
                MemValue::Put(v) => merged_ops.push(WalOp::Put {
                    seq: entry.value().seq,
                    key: entry.key().clone(),
                    value: v.clone(),
                }),
                MemValue::Delete => merged_ops.push(WalOp::Delete {
                    seq: entry.value().seq,
                    key: entry.key().clone(),
                }),
            }
        }
        for t in active.tombstones() {
            merged_ops.push(WalOp::DeleteRange {
                seq: t.seq,
                begin: t.begin,
                end: t.end,
            });
        }
        if !merged_ops.is_empty() {
            wal.append(&merged_ops, true).await?;
        }
        for id in &wal_ids {
            let path = Self::wal_path(&dir, *id);
            fs::remove_file(&path).await.map_err(|error| FileRemoveError {
                path: path.clone(),
                error,
            })?;
        }

        Ok((
            Self {
                name,
                dir,
                state: RwLock::new(CfState {
                    active,
                    active_wal: wal,
                    frozen: IndexMap::new(),
                    tables,
                    next_mem_id: next_mem_id + 1,
                    next_run_id: run_ids.iter().max().copied().unwrap_or(0) + 1,
                    compact_hints: Vec::new(),
                }),
                maintenance: Mutex::new(()),
                dropped: AtomicBool::new(false),
            },
            max_seq,
        ))
    }
}

pub struct LsmEngine {
    pub dir: PathBuf,
    opts: LsmOptions,
    cfs: RwLock<HashMap<String, Arc<ColumnFamily>>>,
    seq: AtomicU64,
    /// Serialises batch commits so sequence order equals commit order
    write_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LsmEngine {
    /// Opens (or creates) the engine directory and recovers every column
    /// family found inside it.
    pub async fn open<P: AsRef<Path>>(dir: P, opts: LsmOptions) -> Result<Arc<Self>, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|error| DirCreationError {
            path: dir.clone(),
            error,
        })?;
        let mut cfs = HashMap::new();
        let mut max_seq: SequenceNumber = 0;
        let mut dirents = fs::read_dir(&dir).await.map_err(|error| FileOpenError {
            path: dir.clone(),
            error,
        })?;
        while let Some(entry) = dirents.next_entry().await.map_err(|error| FileReadError {
            path: dir.clone(),
            error,
        })? {
            let ftype = entry.file_type().await.map_err(GetFileMetaDataError)?;
            if !ftype.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let (cf, seq) = ColumnFamily::recover(entry.path(), name.clone(), &opts).await?;
            max_seq = max_seq.max(seq);
            cfs.insert(name, Arc::new(cf));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        log::info!(
            "lsm engine opened at {:?} with {} column families, seq {}",
            dir,
            cfs.len(),
            max_seq
        );
        Ok(Arc::new(Self {
            dir,
            opts,
            cfs: RwLock::new(cfs),
            seq: AtomicU64::new(max_seq + 1),
            write_lock: Mutex::new(()),
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// Spawns the periodic compaction pass. Mirrors the flush/compaction
    /// listener structure of the storage engine this one grew out of.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(engine.opts.compaction_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
                let families: Vec<Arc<ColumnFamily>> = engine.cfs.read().await.values().cloned().collect();
                for cf in families {
                    if cf.dropped.load(Ordering::Acquire) {
                        continue;
                    }
                    let (table_count, has_hints) = {
                        let state = cf.state.read().await;
                        (state.tables.len(), !state.compact_hints.is_empty())
                    };
                    if table_count >= engine.opts.compaction_trigger || (has_hints && table_count >= 2) {
                        if let Err(err) = crate::engine::compaction::compact_column_family(&cf, &engine.opts).await {
                            log::error!("compaction of cf {} failed: {}", cf.name, err);
                        }
                    }
                }
            }
        });
    }

    async fn cf(&self, name: &str) -> Result<Arc<ColumnFamily>, Error> {
        self.cfs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownColumnFamily(name.to_string()))
    }

    fn next_seq(&self) -> SequenceNumber {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) async fn cf_for_test(&self, name: &str) -> Arc<ColumnFamily> {
        self.cf(name).await.unwrap()
    }
}

#[async_trait]
impl KvEngine for LsmEngine {
    async fn create_column_family(&self, name: &str) -> Result<(), Error> {
        let mut cfs = self.cfs.write().await;
        if cfs.contains_key(name) {
            return Err(ColumnFamilyExists(name.to_string()));
        }
        let cf = ColumnFamily::create(self.dir.join(name), name.to_string()).await?;
        cfs.insert(name.to_string(), Arc::new(cf));
        log::debug!("created column family {}", name);
        Ok(())
    }

    async fn drop_column_family(&self, name: &str) -> Result<(), Error> {
        let removed = self.cfs.write().await.remove(name);
        let Some(cf) = removed else { return Ok(()) };
        cf.dropped.store(true, Ordering::Release);
        // hold maintenance so an in-flight flush finishes before files go away
        let _guard = cf.maintenance.lock().await;
        fs::remove_dir_all(&cf.dir).await.map_err(|error| FileRemoveError {
            path: cf.dir.clone(),
            error,
        })?;
        log::debug!("dropped column family {}", name);
        Ok(())
    }

    async fn list_column_families(&self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = self.cfs.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Value>, Error> {
        let cf = self.cf(cf).await?;
        let (active, frozen, tables) = {
            let state = cf.state.read().await;
            (
                state.active.clone(),
                state.frozen.values().cloned().collect::<Vec<_>>(),
                state.tables.clone(),
            )
        };

        // walk sources newest to oldest; sequence order equals source order,
        // so the first decisive record wins
        let mut max_tomb: SequenceNumber = 0;
        let mut sources: Vec<MemTableHandle> = Vec::with_capacity(frozen.len() + 1);
        sources.push(active);
        sources.extend(frozen.into_iter().rev());
        for mem in &sources {
            max_tomb = max_tomb.max(mem.max_tombstone_seq(key));
            if let Some(rec) = mem.get(key) {
                if rec.seq < max_tomb {
                    return Ok(None);
                }
                return Ok(match rec.value {
                    MemValue::Put(v) => Some(v),
                    MemValue::Delete => None,
                });
            }
        }
        for table in &tables {
            max_tomb = max_tomb.max(table.max_tombstone_seq(key));
            if let Some(entry) = table.get(key).await? {
                if entry.seq < max_tomb {
                    return Ok(None);
                }
                return Ok(if entry.kind == KIND_DELETE { None } else { Some(entry.value) });
            }
        }
        Ok(None)
    }

    async fn write(&self, batch: WriteBatch, opts: WriteOptions) -> Result<(), Error> {
        if batch.is_empty() {
            return Ok(());
        }
        let _commit = self.write_lock.lock().await;

        // group per family preserving op order; the metadata family commits
        // last so a torn multi-family batch under-reports durable progress
        // rather than over-reporting it
        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<WalOp>> = HashMap::new();
        for op in &batch.ops {
            let (cf_name, wal_op) = match op {
                BatchOp::Put { cf, key, value } => (
                    cf,
                    WalOp::Put {
                        seq: self.next_seq(),
                        key: key.clone(),
                        value: value.clone(),
                    },
                ),
                BatchOp::Delete { cf, key } => (
                    cf,
                    WalOp::Delete {
                        seq: self.next_seq(),
                        key: key.clone(),
                    },
                ),
                BatchOp::DeleteRange { cf, begin, end } => (
                    cf,
                    WalOp::DeleteRange {
                        seq: self.next_seq(),
                        begin: begin.clone(),
                        end: end.clone(),
                    },
                ),
            };
            if !grouped.contains_key(cf_name) {
                order.push(cf_name.clone());
            }
            grouped.entry(cf_name.clone()).or_default().push(wal_op);
        }
        order.sort_by_key(|name| name.as_str() == METADATA_SHARD_ID);

        for cf_name in order {
            let cf = self.cf(&cf_name).await?;
            if cf.dropped.load(Ordering::Acquire) {
                return Err(ColumnFamilyDeletePending(cf_name));
            }
            let ops = grouped.remove(&cf_name).unwrap_or_default();
            let mut froze: Option<Arc<ColumnFamily>> = None;
            {
                let mut state = cf.state.write().await;
                state.active_wal.append(&ops, opts.sync).await?;
                for op in ops {
                    match op {
                        WalOp::Put { seq, key, value } => state.active.put(key, value, seq),
                        WalOp::Delete { seq, key } => state.active.delete(key, seq),
                        WalOp::DeleteRange { seq, begin, end } => state.active.delete_range(begin, end, seq),
                    }
                }
                if state.active.is_full(self.opts.memtable_bytes) {
                    let id = state.next_mem_id;
                    state.next_mem_id += 1;
                    let new_wal = Wal::create(ColumnFamily::wal_path(&cf.dir, id)).await?;
                    let sealed = std::mem::replace(&mut state.active, Arc::new(MemTable::new(id)));
                    let old_wal = std::mem::replace(&mut state.active_wal, new_wal);
                    drop(old_wal);
                    state.frozen.insert(sealed.id, sealed);
                    froze = Some(cf.clone());
                }
            }
            if let Some(cf) = froze {
                let opts = self.opts.clone();
                tokio::spawn(async move {
                    if let Err(err) = flush::flush_column_family(&cf, &opts).await {
                        log::error!("flush of cf {} failed: {}", cf.name, err);
                    }
                });
            }
        }
        Ok(())
    }

    async fn iter(&self, cf: &str, opts: IterOptions) -> Result<Box<dyn KvIterator>, Error> {
        let cf = self.cf(cf).await?;
        let state = cf.state.read().await;
        let mut mems: Vec<MemTableHandle> = vec![state.active.clone()];
        mems.extend(state.frozen.values().cloned());
        let tables = state.tables.clone();
        drop(state);
        Ok(Box::new(EngineIter::new(mems, tables, opts)))
    }

    async fn suggest_compact_range(&self, cf: &str, range: KeyRange) -> Result<(), Error> {
        let cf = self.cf(cf).await?;
        cf.state.write().await.compact_hints.push(range);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let _ = self.shutdown_tx.send(true);
        let families: Vec<Arc<ColumnFamily>> = self.cfs.read().await.values().cloned().collect();
        for cf in families {
            let mut state = cf.state.write().await;
            state.active_wal.sync().await?;
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Error> {
        let _ = self.shutdown_tx.send(true);
        self.cfs.write().await.clear();
        fs::remove_dir_all(&self.dir).await.map_err(|error| FileRemoveError {
            path: self.dir.clone(),
            error,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_write_read() {
        let root = tempdir().unwrap();
        let engine = LsmEngine::open(root.path().join("db"), LsmOptions::default()).await.unwrap();
        engine.create_column_family("cf1").await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put("cf1", b"a", b"1");
        batch.put("cf1", b"b", b"2");
        engine.write(batch, WriteOptions { sync: true }).await.unwrap();

        assert_eq!(engine.get("cf1", b"a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get("cf1", b"c").await.unwrap(), None);

        let mut batch = WriteBatch::new();
        batch.delete("cf1", b"a");
        batch.delete_range("cf1", b"b", b"c");
        engine.write(batch, WriteOptions::default()).await.unwrap();
        assert_eq!(engine.get("cf1", b"a").await.unwrap(), None);
        assert_eq!(engine.get("cf1", b"b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recovery_from_wal() {
        let root = tempdir().unwrap();
        let path = root.path().join("db");
        {
            let engine = LsmEngine::open(&path, LsmOptions::default()).await.unwrap();
            engine.create_column_family("cf1").await.unwrap();
            let mut batch = WriteBatch::new();
            batch.put("cf1", b"k", b"v");
            batch.delete_range("cf1", b"x", b"z");
            engine.write(batch, WriteOptions { sync: true }).await.unwrap();
            engine.close().await.unwrap();
        }
        let engine = LsmEngine::open(&path, LsmOptions::default()).await.unwrap();
        assert_eq!(
            engine.list_column_families().await.unwrap(),
            vec!["cf1".to_string()]
        );
        assert_eq!(engine.get("cf1", b"k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_memtable_freeze_and_flush() {
        let root = tempdir().unwrap();
        let opts = LsmOptions {
            memtable_bytes: 512,
            ..Default::default()
        };
        let engine = LsmEngine::open(root.path().join("db"), opts).await.unwrap();
        engine.create_column_family("cf1").await.unwrap();
        for i in 0..64u32 {
            let mut batch = WriteBatch::new();
            batch.put("cf1", format!("key{:04}", i).as_bytes(), &[9u8; 64]);
            engine.write(batch, WriteOptions::default()).await.unwrap();
        }
        // let the flusher drain
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let cf = engine.cf("cf1").await.unwrap();
            let state = cf.state.read().await;
            if state.frozen.is_empty() && !state.tables.is_empty() {
                break;
            }
        }
        for i in 0..64u32 {
            let got = engine.get("cf1", format!("key{:04}", i).as_bytes()).await.unwrap();
            assert!(got.is_some(), "missing key{:04}", i);
        }
    }

    #[tokio::test]
    async fn test_drop_column_family_idempotent() {
        let root = tempdir().unwrap();
        let engine = LsmEngine::open(root.path().join("db"), LsmOptions::default()).await.unwrap();
        engine.create_column_family("gone").await.unwrap();
        engine.drop_column_family("gone").await.unwrap();
        engine.drop_column_family("gone").await.unwrap();
        assert!(engine.list_column_families().await.unwrap().is_empty());
        assert!(matches!(
            engine.get("gone", b"x").await,
            Err(Error::UnknownColumnFamily(_))
        ));
    }
}

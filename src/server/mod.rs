//! # Storage Server
//!
//! The shared state of one storage server: the versioned map and mutation
//! log behind the durable-version lock, the monotonic version cells, the
//! server-side shard map, watches, change feeds, the byte sample and the
//! admission semaphores. Background loops (update pipeline, durability
//! loop, fetchers) are spawned from [`StorageServer::start`] and report
//! fatal conditions through the handle's error channel.

pub mod recovery;
pub mod shards;

use crate::cfg::Config;
use crate::consts::{
    METADATA_SHARD_ID, PERSIST_CLUSTER_ID_KEY, PERSIST_FORMAT_KEY, PERSIST_FORMAT_READABLE, PERSIST_FORMAT_VALUE,
    PERSIST_ID_KEY, PERSIST_SHARD_ASSIGNED_PREFIX, PERSIST_SHARD_AVAILABLE_PREFIX, PERSIST_VERSION_KEY,
    SERVER_KEYS_UNASSIGNED,
};
use crate::engine::lsm::{LsmEngine, LsmOptions};
use crate::engine::{KvEngine, WriteBatch, WriteOptions};
use crate::err::Error;
use crate::err::Error::*;
use crate::feed::ChangeFeeds;
use crate::logsys::LogCursor;
use crate::mlog::{MutationLog, VerUpdate};
use crate::peer::PeerReads;
use crate::sample::ByteSample;
use crate::shard::ShardManager;
use crate::types::{KeyRange, Version, INVALID_VERSION};
use crate::vmap::VersionedMap;
use crate::watch::Watches;
use shards::ShardMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock, Semaphore};
use uuid::Uuid;

/// A monotonic version published through a watch channel so tasks can
/// await "at least v"
pub struct VersionCell {
    tx: watch::Sender<Version>,
}

impl VersionCell {
    pub fn new(v: Version) -> Self {
        let (tx, _) = watch::channel(v);
        Self { tx }
    }

    pub fn get(&self) -> Version {
        *self.tx.borrow()
    }

    pub fn set(&self, v: Version) {
        self.tx.send_if_modified(|cur| {
            if v > *cur {
                *cur = v;
                true
            } else {
                false
            }
        });
    }

    pub async fn when_at_least(&self, v: Version) {
        let mut rx = self.tx.subscribe();
        while *rx.borrow() < v {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Throughput and queue counters, updated lock-free from every subsystem
#[derive(Debug, Default)]
pub struct Counters {
    pub bytes_input: AtomicU64,
    pub bytes_durable: AtomicU64,
    pub mutations: AtomicU64,
    pub set_mutations: AtomicU64,
    pub clear_range_mutations: AtomicU64,
    pub atomic_mutations: AtomicU64,
    pub log_batches: AtomicU64,
    pub queries: AtomicU64,
    pub rows_queried: AtomicU64,
    pub bytes_queried: AtomicU64,
    pub watch_queries: AtomicU64,
    pub feed_streams: AtomicU64,
    pub bytes_fetched: AtomicU64,
    pub fetches_started: AtomicU64,
    pub fetches_completed: AtomicU64,
}

impl Counters {
    /// `bytes_input - bytes_durable`, the MVCC memory the brake watches
    pub fn queue_bytes(&self) -> u64 {
        self.bytes_input
            .load(Ordering::Relaxed)
            .saturating_sub(self.bytes_durable.load(Ordering::Relaxed))
    }
}

/// The MVCC state guarded by the durable-version lock: writers are the
/// update pipeline (apply) and the durability loop (forget), mutually
/// exclusive; readers clone cheap views.
pub struct MvccData {
    pub vmap: VersionedMap,
    pub mlog: MutationLog,
}

/// Byte budget shared by in-flight fetches; exceeding it parks fetchers
/// until the durability loop flushes
pub struct FetchBudget {
    used: AtomicUsize,
    limit: usize,
    freed: Notify,
}

impl FetchBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit,
            freed: Notify::new(),
        }
    }

    pub async fn acquire(&self, bytes: usize) {
        loop {
            let used = self.used.load(Ordering::Acquire);
            if used == 0 || used + bytes <= self.limit {
                if self
                    .used
                    .compare_exchange(used, used + bytes, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            self.freed.notified().await;
        }
    }

    /// Non-parking variant used by fetch splitting; an empty budget always
    /// admits one request so progress is guaranteed
    pub fn try_acquire(&self, bytes: usize) -> bool {
        loop {
            let used = self.used.load(Ordering::Acquire);
            if used != 0 && used + bytes > self.limit {
                return false;
            }
            if self
                .used
                .compare_exchange(used, used + bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
        self.freed.notify_waiters();
    }
}

/// Injection slot a fetcher hands to the update pipeline: the queued
/// updates are applied by the pipeline itself at the transfer version it
/// picks, which is reported back through `done`.
pub struct FetchInjection {
    pub range: KeyRange,
    pub updates: Vec<VerUpdate>,
    pub done: oneshot::Sender<Version>,
}

pub struct StorageServer {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub tss_pair: std::sync::Mutex<Option<Uuid>>,
    pub tss_quarantined: AtomicBool,
    pub primary_locality: AtomicI64,
    pub log_protocol: AtomicU64,
    pub cfg: Config,
    pub shard_manager: Arc<ShardManager>,

    /// The durable-version lock and everything it guards
    pub data: Arc<RwLock<MvccData>>,

    /// Largest version fully visible to reads
    pub version: VersionCell,
    /// All mutations at or below this survive restart
    pub durable_version: VersionCell,
    /// Smallest queryable version; the engine holds exactly this version
    pub oldest_version: VersionCell,
    /// Target below which memory may be forgotten
    pub desired_oldest_version: VersionCell,
    known_committed: AtomicU64,
    /// Version of the last fully processed log batch
    pub last_log_version: AtomicU64,

    pub shards: std::sync::RwLock<ShardMap>,
    pub watches: Watches,
    pub feeds: ChangeFeeds,
    pub byte_sample: ByteSample,
    pub counters: Counters,

    pub read_sem: Arc<Semaphore>,
    pub fetch_read_sem: Arc<Semaphore>,
    pub fetch_parallelism: Arc<Semaphore>,
    pub fetch_budget: FetchBudget,

    /// Fetchers parked here until the update pipeline splices them in
    pub fetch_injections: Mutex<Vec<FetchInjection>>,

    /// Shard-mapping changes the durability loop still has to persist once
    /// the tagged version commits (`true` = add, `false` = remove and
    /// clean up)
    pub pending_mapping: std::sync::Mutex<Vec<(KeyRange, bool, Version)>>,

    /// Kicks the durability loop out of its idle sleep
    pub durability_wake: Notify,
    /// Reboot marker: once durable reaches this, surface PleaseReboot
    pub reboot_after_durable: AtomicU64,

    pub peer: std::sync::RwLock<Option<Arc<dyn PeerReads>>>,
    pub log_cursor: std::sync::RwLock<Option<Arc<dyn LogCursor>>>,

    error_tx: mpsc::UnboundedSender<Error>,
    error_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    shutdown_tx: watch::Sender<bool>,

    /// Assigned-but-unavailable ranges found during recovery; re-fetched
    /// once `start` provides a peer
    pub pending_refetch: std::sync::Mutex<Vec<KeyRange>>,

    /// Versions at which ranges lost their data; a re-fetch of an
    /// overlapping range must wait for that version to be durable first
    pub newest_unavailable: std::sync::Mutex<Vec<(KeyRange, Version)>>,
}

/// Returned by [`StorageServer::start`]; the host listens for fatal errors
/// (`PleaseReboot`, `WorkerRemoved`, engine corruption) and tears down.
pub struct ServerHandle {
    pub errors: mpsc::UnboundedReceiver<Error>,
}

/// Progress of a range through the shard lifecycle, coarsest state wins
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardReadiness {
    NotAssigned,
    Adding,
    Readable,
}

/// Point-in-time queue snapshot for the hosting process's ratekeeper
#[derive(Clone, Debug)]
pub struct QueuingMetrics {
    pub local_time: chrono::DateTime<chrono::Utc>,
    pub version: Version,
    pub durable_version: Version,
    pub bytes_input: u64,
    pub bytes_durable: u64,
    pub queue_bytes: u64,
    pub watch_count: u64,
    pub watch_bytes: u64,
}

impl StorageServer {
    /// Opens the store at `dir`, creating a fresh one when empty. A fresh
    /// store pins a random cluster id.
    pub async fn open<P: AsRef<Path>>(dir: P, cfg: Config) -> Result<Arc<Self>, Error> {
        Self::open_in_cluster(dir, None, cfg).await
    }

    /// Opens the store, refusing to start when the durable cluster id does
    /// not match `cluster_id`.
    pub async fn open_in_cluster<P: AsRef<Path>>(
        dir: P,
        cluster_id: Option<Uuid>,
        cfg: Config,
    ) -> Result<Arc<Self>, Error> {
        let engine: Arc<dyn KvEngine> = {
            let engine = LsmEngine::open(
                dir.as_ref(),
                LsmOptions {
                    memtable_bytes: cfg.memtable_bytes,
                    false_positive_rate: cfg.false_positive_rate,
                    cache_blocks: (cfg.block_cache_bytes / crate::consts::BLOCK_SIZE).max(8),
                    compaction_interval: cfg.compaction_interval,
                    ..Default::default()
                },
            )
            .await?;
            engine.start_background_tasks();
            engine
        };
        let shard_manager = Arc::new(ShardManager::open(engine.clone()).await?);

        let format = engine.get(METADATA_SHARD_ID, PERSIST_FORMAT_KEY).await?;
        let fresh = format.is_none();
        if let Some(found) = &format {
            if !PERSIST_FORMAT_READABLE.contains(&found.as_slice()) {
                return Err(UnsupportedFormat {
                    found: String::from_utf8_lossy(found).to_string(),
                });
            }
        }

        let (id, durable_cluster, restored_version) = if fresh {
            let id = Uuid::new_v4();
            let cluster = cluster_id.unwrap_or_else(Uuid::new_v4);
            let mut batch = WriteBatch::new();
            batch.put(METADATA_SHARD_ID, PERSIST_FORMAT_KEY, PERSIST_FORMAT_VALUE);
            batch.put(METADATA_SHARD_ID, PERSIST_ID_KEY, id.as_bytes());
            batch.put(METADATA_SHARD_ID, PERSIST_CLUSTER_ID_KEY, cluster.as_bytes());
            batch.put(METADATA_SHARD_ID, PERSIST_VERSION_KEY, 0u64.to_be_bytes());
            let mut assigned_seed = PERSIST_SHARD_ASSIGNED_PREFIX.to_vec();
            assigned_seed.extend_from_slice(b"");
            batch.put(METADATA_SHARD_ID, assigned_seed, SERVER_KEYS_UNASSIGNED);
            let mut available_seed = PERSIST_SHARD_AVAILABLE_PREFIX.to_vec();
            available_seed.extend_from_slice(b"");
            batch.put(METADATA_SHARD_ID, available_seed, SERVER_KEYS_UNASSIGNED);
            engine.write(batch, WriteOptions { sync: true }).await?;
            log::info!("initialised fresh storage server {} in cluster {}", id, cluster);
            (id, cluster, 0)
        } else {
            let id_bytes = engine
                .get(METADATA_SHARD_ID, PERSIST_ID_KEY)
                .await?
                .ok_or_else(|| Internal("store has a format record but no server id".into()))?;
            let id = Uuid::from_slice(&id_bytes).map_err(|_| Internal("malformed server id record".into()))?;
            let cluster_bytes = engine
                .get(METADATA_SHARD_ID, PERSIST_CLUSTER_ID_KEY)
                .await?
                .ok_or_else(|| Internal("store has a format record but no cluster id".into()))?;
            let durable_cluster =
                Uuid::from_slice(&cluster_bytes).map_err(|_| Internal("malformed cluster id record".into()))?;
            if let Some(joined) = cluster_id {
                if joined != durable_cluster {
                    return Err(ClusterIdMismatch {
                        durable: durable_cluster.to_string(),
                        joined: joined.to_string(),
                    });
                }
            }
            let version = engine
                .get(METADATA_SHARD_ID, PERSIST_VERSION_KEY)
                .await?
                .and_then(|v| crate::util::decode_version_be(&v))
                .unwrap_or(INVALID_VERSION);
            log::info!(
                "recovering storage server {} at durable version {}",
                id,
                version
            );
            (id, durable_cluster, version)
        };

        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let server = Arc::new(StorageServer {
            id,
            cluster_id: durable_cluster,
            tss_pair: std::sync::Mutex::new(None),
            tss_quarantined: AtomicBool::new(false),
            primary_locality: AtomicI64::new(-1),
            log_protocol: AtomicU64::new(1),
            shard_manager,
            data: Arc::new(RwLock::new(MvccData {
                vmap: VersionedMap::new(restored_version),
                mlog: MutationLog::new(),
            })),
            version: VersionCell::new(restored_version),
            durable_version: VersionCell::new(restored_version),
            oldest_version: VersionCell::new(restored_version),
            desired_oldest_version: VersionCell::new(restored_version),
            known_committed: AtomicU64::new(restored_version),
            last_log_version: AtomicU64::new(restored_version),
            shards: std::sync::RwLock::new(ShardMap::new()),
            watches: Watches::new(cfg.watch_bytes_budget),
            feeds: ChangeFeeds::new(),
            byte_sample: ByteSample::new(cfg.byte_sampling_factor, cfg.byte_sampling_overhead),
            counters: Counters::default(),
            read_sem: Arc::new(Semaphore::new(cfg.read_queue_hard)),
            fetch_read_sem: Arc::new(Semaphore::new(cfg.fetch_queue_hard)),
            fetch_parallelism: Arc::new(Semaphore::new(cfg.fetch_parallelism)),
            fetch_budget: FetchBudget::new(cfg.fetch_bytes_budget),
            fetch_injections: Mutex::new(Vec::new()),
            pending_mapping: std::sync::Mutex::new(Vec::new()),
            durability_wake: Notify::new(),
            reboot_after_durable: AtomicU64::new(0),
            peer: std::sync::RwLock::new(None),
            log_cursor: std::sync::RwLock::new(None),
            error_tx,
            error_rx: std::sync::Mutex::new(Some(error_rx)),
            shutdown_tx,
            pending_refetch: std::sync::Mutex::new(Vec::new()),
            newest_unavailable: std::sync::Mutex::new(Vec::new()),
            cfg,
        });

        if !fresh {
            recovery::restore_durable_state(&server).await?;
        }
        Ok(server)
    }

    /// Wires the collaborators and spawns the update pipeline, durability
    /// loop, byte-sample rebuild and any recovery re-fetches.
    pub fn start(self: &Arc<Self>, cursor: Arc<dyn LogCursor>, peer: Arc<dyn PeerReads>) -> ServerHandle {
        *self.peer.write().unwrap() = Some(peer.clone());
        *self.log_cursor.write().unwrap() = Some(cursor.clone());

        let server = self.clone();
        let update_cursor = cursor.clone();
        tokio::spawn(async move {
            if let Err(err) = crate::update::run_update_loop(&server, update_cursor).await {
                server.fatal(err);
            }
        });

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = crate::durable::run_durability_loop(&server, cursor).await {
                server.fatal(err);
            }
        });

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = recovery::restore_byte_sample(&server).await {
                log::error!("byte sample rebuild failed: {}", err);
            }
        });

        let refetch = std::mem::take(&mut *self.pending_refetch.lock().unwrap());
        for range in refetch {
            crate::fetch::launch_fetch(self, range);
        }

        ServerHandle {
            errors: self.error_rx.lock().unwrap().take().expect("start called twice"),
        }
    }

    /// Queue-side numbers the hosting process polls for ratekeeping
    pub fn queuing_metrics(&self) -> QueuingMetrics {
        QueuingMetrics {
            local_time: chrono::Utc::now(),
            version: self.version.get(),
            durable_version: self.durable_version.get(),
            bytes_input: self.counters.bytes_input.load(Ordering::Relaxed),
            bytes_durable: self.counters.bytes_durable.load(Ordering::Relaxed),
            queue_bytes: self.counters.queue_bytes(),
            watch_count: self.watches.len() as u64,
            watch_bytes: self.watches.watch_bytes() as u64,
        }
    }

    pub fn current_version(&self) -> Version {
        self.version.get()
    }

    pub fn known_committed_version(&self) -> Version {
        self.known_committed.load(Ordering::Acquire)
    }

    pub fn set_known_committed(&self, v: Version) {
        self.known_committed.fetch_max(v, Ordering::AcqRel);
    }

    /// Recomputes the target below which memory may be forgotten
    pub fn update_desired_oldest(&self) {
        let window = self.cfg.read_window_versions;
        let by_version = self.version.get().saturating_sub(window);
        let by_committed = self.known_committed_version().saturating_sub(window);
        let mut desired = by_version.min(by_committed);
        // compaction of the feed space must not outrun the slowest consumer
        if let Some(min_stream) = self.feeds.min_stream_version() {
            desired = desired.min(min_stream);
        }
        if desired > self.desired_oldest_version.get() {
            self.desired_oldest_version.set(desired);
            self.durability_wake.notify_waiters();
        }
    }

    /// Blocks a read until `v` is visible: waits out future versions up to
    /// the configured timeout, rejects anything below the MVCC window.
    pub async fn wait_for_version(&self, v: Version) -> Result<Version, Error> {
        if v <= self.version.get() {
            let oldest = self.oldest_version.get();
            if v < oldest {
                return Err(TransactionTooOld {
                    requested: v,
                    oldest,
                });
            }
            return Ok(v);
        }
        let waited = tokio::time::timeout(self.cfg.future_version_timeout, self.version.when_at_least(v)).await;
        if waited.is_err() {
            return Err(FutureVersion {
                requested: v,
                current: self.version.get(),
            });
        }
        let oldest = self.oldest_version.get();
        if v < oldest {
            return Err(TransactionTooOld {
                requested: v,
                oldest,
            });
        }
        Ok(v)
    }

    /// How far along this server is with `range`: movers poll this during
    /// hand-off to learn when a transfer finished.
    pub fn shard_readiness(&self, range: &KeyRange) -> ShardReadiness {
        let shards = self.shards.read().unwrap();
        let mut any_adding = false;
        let mut any_unassigned = false;
        for shard in shards.intersecting(range) {
            match &shard.state {
                shards::ShardState::ReadWrite => {}
                shards::ShardState::Adding(_) => any_adding = true,
                shards::ShardState::NotAssigned => any_unassigned = true,
            }
        }
        if any_unassigned {
            ShardReadiness::NotAssigned
        } else if any_adding {
            ShardReadiness::Adding
        } else {
            ShardReadiness::Readable
        }
    }

    /// Captured at request entry; a later mismatch means the shard moved
    pub fn shard_change_counter(&self) -> u64 {
        self.shards.read().unwrap().change_counter()
    }

    pub fn check_shard_change(&self, captured: u64) -> Result<(), Error> {
        if self.shard_change_counter() != captured {
            return Err(WrongShardServer);
        }
        Ok(())
    }

    /// Admission for a client read; fails fast past the hard mark
    pub fn try_acquire_read(&self) -> Result<tokio::sync::OwnedSemaphorePermit, Error> {
        self.read_sem
            .clone()
            .try_acquire_owned()
            .map_err(|_| ServerOverloaded)
    }

    pub fn shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Orderly shutdown: stop the loops, then close the engine so a
    /// reopen recovers from a clean state.
    pub async fn stop(&self) -> Result<(), Error> {
        let _ = self.shutdown_tx.send(true);
        self.watches.clear();
        tokio::time::sleep(self.cfg.durability_interval * 3).await;
        self.shard_manager.engine().close().await
    }

    /// Reports a fatal error and begins teardown: watches are dropped and
    /// every loop observes the shutdown flag.
    pub fn fatal(&self, err: Error) {
        log::error!("storage server {} tearing down: {}", self.id, err);
        self.watches.clear();
        let _ = self.error_tx.send(err);
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_fresh_and_reopen() {
        let root = tempdir().unwrap();
        let path = root.path().join("store");
        let (id, cluster) = {
            let server = StorageServer::open(&path, Config::default()).await.unwrap();
            (server.id, server.cluster_id)
        };
        let server = StorageServer::open(&path, Config::default()).await.unwrap();
        assert_eq!(server.id, id);
        assert_eq!(server.cluster_id, cluster);
    }

    #[tokio::test]
    async fn test_cluster_id_mismatch_refused() {
        let root = tempdir().unwrap();
        let path = root.path().join("store");
        let _ = StorageServer::open(&path, Config::default()).await.unwrap();
        let res = StorageServer::open_in_cluster(&path, Some(Uuid::new_v4()), Config::default()).await;
        assert!(matches!(res, Err(Error::ClusterIdMismatch { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_version_window() {
        let root = tempdir().unwrap();
        let server = StorageServer::open(root.path().join("store"), Config::default())
            .await
            .unwrap();
        server.version.set(100);
        server.oldest_version.set(50);
        assert_eq!(server.wait_for_version(70).await.unwrap(), 70);
        assert!(matches!(
            server.wait_for_version(10).await,
            Err(Error::TransactionTooOld { .. })
        ));
        let mut cfg = Config::default();
        cfg.future_version_timeout = std::time::Duration::from_millis(10);
        drop(server);
        let server = StorageServer::open(root.path().join("store2"), cfg).await.unwrap();
        server.version.set(100);
        assert!(matches!(
            server.wait_for_version(200).await,
            Err(Error::FutureVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_version_cell_wakeups() {
        let cell = Arc::new(VersionCell::new(5));
        let c = cell.clone();
        let task = tokio::spawn(async move { c.when_at_least(10).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cell.set(10);
        tokio::time::timeout(std::time::Duration::from_millis(200), task)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_budget_parks_and_releases() {
        let budget = Arc::new(FetchBudget::new(100));
        budget.acquire(80).await;
        let b = budget.clone();
        let blocked = tokio::spawn(async move { b.acquire(50).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        budget.release(80);
        tokio::time::timeout(std::time::Duration::from_millis(200), blocked)
            .await
            .expect("budget waiter should wake")
            .unwrap();
    }
}

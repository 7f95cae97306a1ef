//! Shared driver for the end-to-end tests: one storage server wired to an
//! in-memory log and a peer, with helpers that push version batches and
//! drive the pipeline until the state they created is visible or durable.

use crate::cfg::Config;
use crate::consts::PRIV_SERVER_KEYS_PREFIX;
use crate::err::Error;
use crate::feed::{encode_feed_value, FeedStatus};
use crate::logsys::MemoryLog;
use crate::mlog::Mutation;
use crate::peer::{EmptyPeer, PeerReads};
use crate::server::{ServerHandle, StorageServer};
use crate::types::{Key, KeyRange, Version};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small MVCC window and fast durability cycles so tests converge quickly
pub fn test_config() -> Config {
    Config {
        read_window_versions: 20,
        durability_interval: Duration::from_millis(5),
        future_version_timeout: Duration::from_millis(300),
        fetch_warn_after: Duration::from_millis(500),
        ..Default::default()
    }
}

pub struct TestServer {
    pub server: Arc<StorageServer>,
    pub log: Arc<MemoryLog>,
    pub handle: ServerHandle,
    version: Arc<AtomicU64>,
}

impl TestServer {
    pub async fn open<P: AsRef<Path>>(path: P) -> Self {
        Self::open_with(path, test_config(), MemoryLog::new(), EmptyPeer::new(), Arc::new(AtomicU64::new(0))).await
    }

    pub async fn open_with<P: AsRef<Path>>(
        path: P,
        cfg: Config,
        log: Arc<MemoryLog>,
        peer: Arc<dyn PeerReads>,
        version: Arc<AtomicU64>,
    ) -> Self {
        init();
        let server = StorageServer::open(path, cfg).await.unwrap();
        let handle = server.start(log.cursor(), peer);
        let restored = server.current_version();
        version.fetch_max(restored, Ordering::SeqCst);
        Self {
            server,
            log,
            handle,
            version,
        }
    }

    /// The shared version counter, so two servers can share one sequencer
    pub fn version_counter(&self) -> Arc<AtomicU64> {
        self.version.clone()
    }

    pub fn next_version(&self) -> Version {
        self.version.fetch_add(10, Ordering::SeqCst) + 10
    }

    /// Pushes one batch and waits until the pipeline applied it
    pub async fn commit(&self, mutations: Vec<Mutation>) -> Version {
        let v = self.next_version();
        self.log.push(v, mutations);
        self.server.version.when_at_least(v).await;
        v
    }

    pub async fn set<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, value: V) -> Version {
        self.commit(vec![Mutation::set(key, value)]).await
    }

    pub async fn clear_range<B: AsRef<[u8]>, E: AsRef<[u8]>>(&self, begin: B, end: E) -> Version {
        self.commit(vec![Mutation::clear_range(begin, end)]).await
    }

    pub fn server_keys_boundary(key: &[u8], assigned: bool) -> Mutation {
        let mut k = PRIV_SERVER_KEYS_PREFIX.to_vec();
        k.extend_from_slice(key);
        Mutation::set(k, if assigned { b"1" as &[u8] } else { b"0" })
    }

    /// Assigns `range` to this server and drives the fetch to read-write
    pub async fn assign(&self, range: &KeyRange) -> Version {
        let v = self
            .commit(vec![
                Self::server_keys_boundary(&range.begin, true),
                Self::server_keys_boundary(&range.end, false),
            ])
            .await;
        self.wait_readable(range).await;
        v
    }

    pub async fn unassign(&self, range: &KeyRange) -> Version {
        self.commit(vec![
            Self::server_keys_boundary(&range.begin, false),
            Self::server_keys_boundary(&range.end, false),
        ])
        .await
    }

    /// Drives empty versions until every shard covering `range` serves
    /// reads; panics when the hand-off takes unreasonably long
    pub async fn wait_readable(&self, range: &KeyRange) {
        for _ in 0..500 {
            let readable = {
                let shards = self.server.shards.read().unwrap();
                shards.intersecting(range).iter().all(|s| s.state.is_readable())
            };
            if readable {
                return;
            }
            let v = self.next_version();
            self.log.push_empty(v);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("range {} never became readable", range);
    }

    /// Pushes empty versions until everything at or below `v` is durable
    pub async fn wait_durable(&self, v: Version) {
        for _ in 0..500 {
            if self.server.durable_version.get() >= v {
                return;
            }
            let next = self.next_version();
            self.log.push_empty(next);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "version {} never became durable (durable={}, version={})",
            v,
            self.server.durable_version.get(),
            self.server.current_version()
        );
    }

    pub fn feed_marker(id: &[u8], range: &KeyRange, pop_version: Version, status: FeedStatus) -> Mutation {
        let mut key = crate::consts::PRIV_FEED_PREFIX.to_vec();
        key.extend_from_slice(id);
        Mutation::set(key, encode_feed_value(range, pop_version, status))
    }

    pub async fn register_feed(&self, id: &[u8], range: &KeyRange) -> Version {
        self.commit(vec![Self::feed_marker(id, range, 0, FeedStatus::Create)]).await
    }

    pub async fn pop_feed(&self, id: &[u8], range: &KeyRange, pop_version: Version) -> Version {
        self.commit(vec![Self::feed_marker(id, range, pop_version, FeedStatus::Create)])
            .await
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        crate::read::get_value(&self.server, key, self.server.current_version()).await
    }

    pub async fn read_range(&self, begin: &[u8], end: &[u8]) -> Result<Vec<(Key, Vec<u8>)>, Error> {
        let reply = crate::read::get_range(
            &self.server,
            begin,
            end,
            100,
            usize::MAX,
            self.server.current_version(),
        )
        .await?;
        Ok(reply.rows)
    }

    /// Checks the versioned-map invariants: clears never overlap or adjoin
    /// another entry, and nothing in the latest view predates the durable
    /// version.
    pub async fn check_vm_invariants(&self) {
        let durable = self.server.durable_version.get();
        let data = self.server.data.read().await;
        let view = data.vmap.latest();
        let mut prev_clear_end: Option<Key> = None;
        for (key, entry) in view.iter_from(b"") {
            assert!(
                entry.insert_version > durable,
                "entry at {} has insert version {} <= durable {}",
                crate::util::printable(key),
                entry.insert_version,
                durable
            );
            if let Some(end) = &prev_clear_end {
                assert!(
                    end.as_slice() <= key.as_slice(),
                    "clear through {} overlaps entry at {}",
                    crate::util::printable(end),
                    crate::util::printable(key)
                );
            }
            prev_clear_end = match &entry.val {
                crate::vmap::ValueOrClear::ClearTo(end) => Some(end.clone()),
                _ => None,
            };
        }
    }

    /// Checks that the shard map covers the whole keyspace exactly once
    pub fn check_shard_cover(&self) {
        let shards = self.server.shards.read().unwrap().all();
        assert_eq!(shards.first().unwrap().range.begin, b"".to_vec());
        for pair in shards.windows(2) {
            assert_eq!(
                pair[0].range.end, pair[1].range.begin,
                "gap or overlap between shards"
            );
        }
        assert_eq!(shards.last().unwrap().range.end, KeyRange::all().end);
    }
}

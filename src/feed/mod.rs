//! # Change-Feed Engine
//!
//! Named, range-scoped ordered streams of mutations. Each feed keeps an
//! in-memory deque of `MutationsAndVersion` fed by the update pipeline and a
//! durable mirror under a per-feed key prefix in the metadata shard written
//! by the durability loop. Consumers stream lazily: durable entries first,
//! then memory, with zero-mutation tombstones marking empty-version progress
//! so a reader always observes the feed moving forward.

use crate::consts::{PERSIST_FEED_DURABLE_PREFIX, PERSIST_FEED_PREFIX};
use crate::engine::IterOptions;
use crate::err::Error;
use crate::err::Error::*;
use crate::mlog::Mutation;
use crate::server::StorageServer;
use crate::types::{FeedId, Key, KeyRange, Value, Version, INVALID_VERSION};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::sync::{Mutex, RwLock as StdRwLock};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedStatus {
    Create,
    Stop,
    Destroy,
}

/// One version's worth of mutations delivered to feed consumers. A record
/// with no mutations is a tombstone proving the feed was empty through
/// `version`.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationsAndVersion {
    pub version: Version,
    pub known_committed: Version,
    pub mutations: Vec<Mutation>,
}

impl MutationsAndVersion {
    pub fn bytes(&self) -> usize {
        16 + self.mutations.iter().map(|m| m.param_bytes()).sum::<usize>()
    }
}

#[derive(Debug)]
pub struct FeedInfo {
    pub id: FeedId,
    pub range: KeyRange,
    pub mutations: VecDeque<MutationsAndVersion>,
    /// No mutations at or below this version exist anywhere
    pub empty_version: Version,
    /// Versions between storage and durable are being written right now
    pub storage_version: Version,
    pub durable_version: Version,
    /// A stopped feed takes no new writes but remains queryable
    pub stopped: bool,
    /// Destroy has begun; fetches must not resurrect it
    pub removing: bool,
    signal_tx: async_broadcast::Sender<u8>,
    signal_rx: async_broadcast::InactiveReceiver<u8>,
}

impl FeedInfo {
    pub fn new(id: FeedId, range: KeyRange, empty_version: Version) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(1);
        tx.set_overflow(true);
        Self {
            id,
            range,
            mutations: VecDeque::new(),
            empty_version,
            storage_version: INVALID_VERSION,
            durable_version: INVALID_VERSION,
            stopped: false,
            removing: false,
            signal_tx: tx,
            signal_rx: rx.deactivate(),
        }
    }

    /// Appends `m` at `version`, opening a new deque slot when the version
    /// advances
    pub fn push_mutation(&mut self, version: Version, known_committed: Version, m: Mutation) {
        if self.mutations.back().map(|b| b.version) != Some(version) {
            self.mutations.push_back(MutationsAndVersion {
                version,
                known_committed,
                mutations: Vec::new(),
            });
        }
        self.mutations.back_mut().unwrap().mutations.push(m);
    }

    pub fn wake_consumers(&self) {
        let _ = self.signal_tx.try_broadcast(1);
    }

    pub fn wakeup(&self) -> async_broadcast::Receiver<u8> {
        self.signal_rx.activate_cloned()
    }

    /// In-memory truncation below `v`
    pub fn pop_memory(&mut self, v: Version) {
        if v > 0 && v - 1 > self.empty_version {
            self.empty_version = v - 1;
        }
        while self.mutations.front().map_or(false, |m| m.version < v) {
            self.mutations.pop_front();
        }
    }
}

pub type FeedHandle = Arc<RwLock<FeedInfo>>;

/// Registry of this server's feeds plus the per-range index used by the
/// update pipeline's fanout
pub struct ChangeFeeds {
    by_id: StdRwLock<HashMap<FeedId, FeedHandle>>,
    index: StdRwLock<Vec<(KeyRange, FeedId)>>,
    /// Feeds written since the last durability cycle
    current: Mutex<HashSet<FeedId>>,
    /// Slowest registered consumer per stream client
    min_stream: StdRwLock<HashMap<Uuid, Version>>,
}

impl ChangeFeeds {
    pub fn new() -> Self {
        Self {
            by_id: StdRwLock::new(HashMap::new()),
            index: StdRwLock::new(Vec::new()),
            current: Mutex::new(HashSet::new()),
            min_stream: StdRwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: FeedId, range: KeyRange, empty_version: Version) -> FeedHandle {
        let feed = Arc::new(RwLock::new(FeedInfo::new(id.clone(), range.clone(), empty_version)));
        self.by_id.write().unwrap().insert(id.clone(), feed.clone());
        self.index.write().unwrap().push((range, id));
        feed
    }

    pub fn get(&self, id: &[u8]) -> Option<FeedHandle> {
        self.by_id.read().unwrap().get(id).cloned()
    }

    pub fn detach(&self, id: &[u8]) {
        self.by_id.write().unwrap().remove(id);
        self.index.write().unwrap().retain(|(_, fid)| fid != id);
        self.current.lock().unwrap().remove(id);
    }

    pub fn feeds_containing(&self, key: &[u8]) -> Vec<FeedHandle> {
        let index = self.index.read().unwrap();
        let by_id = self.by_id.read().unwrap();
        index
            .iter()
            .filter(|(range, _)| range.contains(key))
            .filter_map(|(_, id)| by_id.get(id).cloned())
            .collect()
    }

    pub fn feeds_intersecting(&self, range: &KeyRange) -> Vec<FeedHandle> {
        let index = self.index.read().unwrap();
        let by_id = self.by_id.read().unwrap();
        index
            .iter()
            .filter(|(r, _)| r.intersects(range))
            .filter_map(|(_, id)| by_id.get(id).cloned())
            .collect()
    }

    pub fn all(&self) -> Vec<FeedHandle> {
        self.by_id.read().unwrap().values().cloned().collect()
    }

    /// Marks a feed as written this cycle so the durability loop mirrors it
    pub fn mark_current(&self, id: &[u8]) {
        self.current.lock().unwrap().insert(id.to_vec());
    }

    pub fn drain_current(&self) -> Vec<FeedId> {
        self.current.lock().unwrap().drain().collect()
    }

    /// Registers the consumer's progress; version advancement must not
    /// outrun the slowest one
    pub fn note_stream_version(&self, client: Uuid, version: Version) {
        self.min_stream.write().unwrap().insert(client, version);
    }

    pub fn forget_stream(&self, client: &Uuid) {
        self.min_stream.write().unwrap().remove(client);
    }

    pub fn min_stream_version(&self) -> Option<Version> {
        self.min_stream.read().unwrap().values().min().copied()
    }
}

impl Default for ChangeFeeds {
    fn default() -> Self {
        Self::new()
    }
}

// ---- codecs ----

/// Value of the private feed marker and of the persisted `RF/` record
pub fn encode_feed_value(range: &KeyRange, pop_version: Version, status: FeedStatus) -> Value {
    let mut out = Vec::new();
    out.write_u32::<BigEndian>(range.begin.len() as u32).unwrap();
    out.extend_from_slice(&range.begin);
    out.write_u32::<BigEndian>(range.end.len() as u32).unwrap();
    out.extend_from_slice(&range.end);
    out.write_u64::<BigEndian>(pop_version).unwrap();
    out.write_u8(match status {
        FeedStatus::Create => 0,
        FeedStatus::Stop => 1,
        FeedStatus::Destroy => 2,
    })
    .unwrap();
    out
}

pub fn decode_feed_value(mut bytes: &[u8]) -> Result<(KeyRange, Version, FeedStatus), Error> {
    let mut read_blob = |bytes: &mut &[u8]| -> Result<Vec<u8>, Error> {
        let len = bytes.read_u32::<BigEndian>().map_err(UnexpectedEOF)? as usize;
        let mut blob = vec![0u8; len];
        bytes.read_exact(&mut blob).map_err(UnexpectedEOF)?;
        Ok(blob)
    };
    let begin = read_blob(&mut bytes)?;
    let end = read_blob(&mut bytes)?;
    let pop_version = bytes.read_u64::<BigEndian>().map_err(UnexpectedEOF)?;
    let status = match bytes.read_u8().map_err(UnexpectedEOF)? {
        0 => FeedStatus::Create,
        1 => FeedStatus::Stop,
        2 => FeedStatus::Destroy,
        other => return Err(Internal(format!("unknown change feed status {}", other))),
    };
    Ok((KeyRange { begin, end }, pop_version, status))
}

/// `RF/` registration key for a feed
pub fn feed_registration_key(id: &[u8]) -> Key {
    let mut k = PERSIST_FEED_PREFIX.to_vec();
    k.extend_from_slice(id);
    k
}

/// Durable entry key: prefix, feed id, NUL, big-endian version
pub fn feed_durable_key(id: &[u8], version: Version) -> Key {
    let mut k = PERSIST_FEED_DURABLE_PREFIX.to_vec();
    k.extend_from_slice(id);
    k.push(0);
    k.extend_from_slice(&version.to_be_bytes());
    k
}

pub fn decode_feed_durable_key(key: &[u8], id: &[u8]) -> Option<Version> {
    let prefix_len = PERSIST_FEED_DURABLE_PREFIX.len() + id.len() + 1;
    if key.len() != prefix_len + 8 || !key.starts_with(PERSIST_FEED_DURABLE_PREFIX) {
        return None;
    }
    crate::util::decode_version_be(&key[prefix_len..])
}

/// Durable entry value: known committed version, then the framed mutations
pub fn encode_feed_entry(entry: &MutationsAndVersion) -> Value {
    let mut out = Vec::new();
    out.write_u64::<BigEndian>(entry.known_committed).unwrap();
    out.write_u32::<BigEndian>(entry.mutations.len() as u32).unwrap();
    for m in &entry.mutations {
        match m {
            Mutation::SetValue { key, value } => {
                out.write_u8(0).unwrap();
                out.write_u32::<BigEndian>(key.len() as u32).unwrap();
                out.extend_from_slice(key);
                out.write_u32::<BigEndian>(value.len() as u32).unwrap();
                out.extend_from_slice(value);
            }
            Mutation::ClearRange { begin, end } => {
                out.write_u8(1).unwrap();
                out.write_u32::<BigEndian>(begin.len() as u32).unwrap();
                out.extend_from_slice(begin);
                out.write_u32::<BigEndian>(end.len() as u32).unwrap();
                out.extend_from_slice(end);
            }
            Mutation::Atomic { .. } => unreachable!("atomics are resolved before feed fanout"),
        }
    }
    out
}

pub fn decode_feed_entry(version: Version, mut bytes: &[u8]) -> Result<MutationsAndVersion, Error> {
    let known_committed = bytes.read_u64::<BigEndian>().map_err(UnexpectedEOF)?;
    let count = bytes.read_u32::<BigEndian>().map_err(UnexpectedEOF)?;
    let mut mutations = Vec::with_capacity(count as usize);
    let mut read_blob = |bytes: &mut &[u8]| -> Result<Vec<u8>, Error> {
        let len = bytes.read_u32::<BigEndian>().map_err(UnexpectedEOF)? as usize;
        let mut blob = vec![0u8; len];
        bytes.read_exact(&mut blob).map_err(UnexpectedEOF)?;
        Ok(blob)
    };
    for _ in 0..count {
        let kind = bytes.read_u8().map_err(UnexpectedEOF)?;
        let a = read_blob(&mut bytes)?;
        let b = read_blob(&mut bytes)?;
        mutations.push(match kind {
            0 => Mutation::SetValue { key: a, value: b },
            1 => Mutation::ClearRange { begin: a, end: b },
            other => return Err(Internal(format!("unknown feed mutation kind {}", other))),
        });
    }
    Ok(MutationsAndVersion {
        version,
        known_committed,
        mutations,
    })
}

/// Clips a feed record to `filter_range`, dropping mutations outside it
pub fn filter_entry(entry: &MutationsAndVersion, filter: &KeyRange) -> MutationsAndVersion {
    let mutations = entry
        .mutations
        .iter()
        .filter_map(|m| match m {
            Mutation::SetValue { key, .. } if filter.contains(key) => Some(m.clone()),
            Mutation::ClearRange { begin, end } => {
                let r = KeyRange::new(begin, end);
                if r.intersects(filter) {
                    let clipped = r.intersect(filter);
                    Some(Mutation::ClearRange {
                        begin: clipped.begin,
                        end: clipped.end,
                    })
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect();
    MutationsAndVersion {
        version: entry.version,
        known_committed: entry.known_committed,
        mutations,
    }
}

/// One reply's worth of a feed stream
#[derive(Clone, Debug, Default)]
pub struct FeedStreamReply {
    pub entries: Vec<MutationsAndVersion>,
    /// Versions below `begin` of the next call are complete
    pub at_end: bool,
}

/// Merge read over a feed: durable entries below the feed's durable
/// version, then memory, with a final empty-version tombstone carrying the
/// known committed version when the stream has caught up.
pub async fn get_feed_mutations(
    server: &Arc<StorageServer>,
    id: &[u8],
    begin: Version,
    end: Version,
    filter_range: Option<&KeyRange>,
    byte_limit: usize,
) -> Result<FeedStreamReply, Error> {
    let feed = server.feeds.get(id).ok_or(UnknownChangeFeed)?;
    let current_version = server.current_version();
    let mut reply = FeedStreamReply::default();
    let mut bytes = 0usize;
    let mut last_version = begin.saturating_sub(1);

    let (empty_version, durable_version, memory_front, range) = {
        let f = feed.read().await;
        (
            f.empty_version,
            f.durable_version,
            f.mutations.front().map(|m| m.version),
            f.range.clone(),
        )
    };
    if begin <= empty_version {
        last_version = empty_version;
    }
    let filter = filter_range.map(|f| f.intersect(&range));

    // durable prefix: [begin, min(end, durableVersion + 1)), unless memory
    // already reaches back far enough
    let durable_end = if durable_version == INVALID_VERSION {
        begin
    } else {
        end.min(durable_version + 1)
    };
    let read_durable = durable_end > begin && memory_front.map_or(true, |front| front > begin);
    if read_durable {
        let engine = server.shard_manager.engine();
        let lo = feed_durable_key(id, begin);
        let hi = feed_durable_key(id, durable_end);
        let mut iter = engine
            .iter(
                crate::consts::METADATA_SHARD_ID,
                IterOptions {
                    lower_bound: Some(lo.clone()),
                    upper_bound: Some(hi),
                },
            )
            .await?;
        let mut next = iter.seek(&lo).await?;
        while let Some(kv) = next {
            let Some(version) = decode_feed_durable_key(&kv.key, id) else {
                return Err(Internal("malformed durable change feed key".into()));
            };
            let entry = decode_feed_entry(version, &kv.value)?;
            let entry = match &filter {
                Some(f) => filter_entry(&entry, f),
                None => entry,
            };
            if version > last_version && !entry.mutations.is_empty() {
                bytes += entry.bytes();
                last_version = version;
                reply.entries.push(entry);
                if bytes >= byte_limit {
                    return Ok(reply);
                }
            }
            next = iter.next_entry().await?;
        }
    }

    // memory tail: strictly above whatever the durable scan delivered, and
    // never past what readers may observe yet
    {
        let f = feed.read().await;
        for entry in f.mutations.iter() {
            if entry.version <= last_version || entry.version < begin {
                continue;
            }
            if entry.version >= end || entry.version > current_version {
                break;
            }
            let entry = match &filter {
                Some(fr) => filter_entry(entry, fr),
                None => entry.clone(),
            };
            if !entry.mutations.is_empty() {
                bytes += entry.bytes();
                last_version = entry.version;
                reply.entries.push(entry);
                if bytes >= byte_limit {
                    return Ok(reply);
                }
            }
        }
    }

    // the stream has drained everything at or below the current version;
    // prove forward progress with an empty tombstone
    let frontier = current_version.min(end.saturating_sub(1));
    if frontier > last_version {
        reply.entries.push(MutationsAndVersion {
            version: frontier,
            known_committed: server.known_committed_version(),
            mutations: Vec::new(),
        });
    }
    reply.at_end = end <= current_version + 1;
    Ok(reply)
}

/// Which feeds overlap `range` with data reaching back to `min_version`;
/// peers call this before fetching a moving shard's feed history.
pub async fn overlapping_change_feeds(
    server: &Arc<StorageServer>,
    range: &KeyRange,
    min_version: Version,
) -> Vec<OverlappingFeedInfo> {
    let mut out = Vec::new();
    for feed in server.feeds.feeds_intersecting(range) {
        let f = feed.read().await;
        if f.removing {
            continue;
        }
        // a feed popped past min_version has nothing useful to copy, but
        // the caller still needs to know it exists
        out.push(OverlappingFeedInfo {
            id: f.id.clone(),
            range: f.range.clone(),
            empty_version: f.empty_version,
            stopped: f.stopped,
            reaches_back: f.empty_version < min_version,
        });
    }
    out
}

#[derive(Clone, Debug)]
pub struct OverlappingFeedInfo {
    pub id: FeedId,
    pub range: KeyRange,
    pub empty_version: Version,
    pub stopped: bool,
    pub reaches_back: bool,
}

/// Pull-based consumer over one feed. Each reply advances the client's
/// registered stream version so version advancement and feed compaction
/// cannot outrun the slowest consumer; dropping the streamer deregisters
/// it.
pub struct FeedStreamer {
    server: Arc<StorageServer>,
    client: Uuid,
    id: FeedId,
    begin: Version,
    end: Version,
    filter_range: Option<KeyRange>,
}

impl FeedStreamer {
    pub fn new(
        server: Arc<StorageServer>,
        id: FeedId,
        begin: Version,
        end: Version,
        filter_range: Option<KeyRange>,
    ) -> Self {
        let client = Uuid::new_v4();
        server.feeds.note_stream_version(client, begin);
        server
            .counters
            .feed_streams
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self {
            server,
            client,
            id,
            begin,
            end,
            filter_range,
        }
    }

    /// The next bounded reply, waiting for new mutations when the stream
    /// has caught up with the current version. `EndOfStream` once the end
    /// version is fully delivered.
    pub async fn next_reply(&mut self) -> Result<FeedStreamReply, Error> {
        if self.begin >= self.end {
            return Err(EndOfStream);
        }
        loop {
            let reply = get_feed_mutations(
                &self.server,
                &self.id,
                self.begin,
                self.end,
                self.filter_range.as_ref(),
                self.server.cfg.feed_stream_bytes,
            )
            .await?;
            if let Some(last) = reply.entries.last() {
                self.begin = last.version + 1;
                self.server.feeds.note_stream_version(self.client, self.begin);
                return Ok(reply);
            }
            // nothing new yet; park until the feed signals or the version
            // frontier reaches the next tombstone we could emit
            let feed = self.server.feeds.get(&self.id).ok_or(UnknownChangeFeed)?;
            let mut wakeup = feed.read().await.wakeup();
            tokio::select! {
                _ = wakeup.recv() => {}
                _ = self.server.version.when_at_least(self.begin) => {}
            }
        }
    }
}

impl Drop for FeedStreamer {
    fn drop(&mut self) {
        self.server.feeds.forget_stream(&self.client);
    }
}

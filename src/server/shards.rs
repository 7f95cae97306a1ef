//! Server-side shard lifecycle map.
//!
//! Every key in the keyspace belongs to exactly one shard at all times.
//! Shards move through NotAssigned -> Adding{Fetching, Waiting} -> ReadWrite
//! and coalesce eagerly when adjacent neighbors reach the same terminal
//! state. `change_counter` bumps on every map mutation; reads capture it at
//! entry and re-check after suspension points to detect concurrent movement.

use crate::mlog::VerUpdate;
use crate::types::{Key, KeyRange, Version};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddingPhase {
    /// Streaming the range from a peer
    Fetching,
    /// Fetch complete, draining queued updates and the MVCC window
    Waiting,
}

/// Book-keeping for a shard being transferred to this server
#[derive(Debug)]
pub struct AddingShard {
    pub range: KeyRange,
    pub fetch_id: uuid::Uuid,
    pub phase: watch::Sender<AddingPhase>,
    /// Updates that arrived while fetching; replayed at the transfer version
    pub queued: Mutex<Vec<VerUpdate>>,
    pub fetch_version: AtomicU64,
    pub transferred_version: AtomicU64,
    cancel_tx: watch::Sender<bool>,
}

impl AddingShard {
    pub fn new(range: KeyRange) -> Arc<Self> {
        let (phase, _) = watch::channel(AddingPhase::Fetching);
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            range,
            fetch_id: uuid::Uuid::new_v4(),
            phase,
            queued: Mutex::new(Vec::new()),
            fetch_version: AtomicU64::new(0),
            transferred_version: AtomicU64::new(0),
            cancel_tx,
        })
    }

    pub fn phase_now(&self) -> AddingPhase {
        *self.phase.borrow()
    }

    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.subscribe().borrow()
    }

    /// Queues one clipped update while the fetch is still running
    pub fn push_queued(&self, update: VerUpdate) {
        self.queued.lock().unwrap().push(update);
    }

    pub fn take_queued(&self) -> Vec<VerUpdate> {
        std::mem::take(&mut self.queued.lock().unwrap())
    }
}

#[derive(Clone, Debug)]
pub enum ShardState {
    NotAssigned,
    Adding(Arc<AddingShard>),
    ReadWrite,
}

impl ShardState {
    pub fn is_readable(&self) -> bool {
        matches!(self, ShardState::ReadWrite)
    }

    pub fn not_assigned(&self) -> bool {
        matches!(self, ShardState::NotAssigned)
    }

    /// Mutations flow into the versioned map for read-write shards and for
    /// adding shards already past their fetch
    pub fn in_versioned_data(&self) -> bool {
        match self {
            ShardState::ReadWrite => true,
            ShardState::Adding(adding) => adding.phase_now() == AddingPhase::Waiting,
            ShardState::NotAssigned => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerShard {
    pub range: KeyRange,
    pub state: ShardState,
}

/// The whole-keyspace shard map. Only the update pipeline mutates it.
pub struct ShardMap {
    shards: BTreeMap<Key, ServerShard>,
    change_counter: AtomicU64,
}

impl ShardMap {
    pub fn new() -> Self {
        let mut shards = BTreeMap::new();
        let all = KeyRange::all();
        shards.insert(
            all.begin.clone(),
            ServerShard {
                range: all,
                state: ShardState::NotAssigned,
            },
        );
        Self {
            shards,
            change_counter: AtomicU64::new(1),
        }
    }

    pub fn change_counter(&self) -> u64 {
        self.change_counter.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.change_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn shard_containing(&self, key: &[u8]) -> Option<&ServerShard> {
        self.shards
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.range.contains(key))
    }

    pub fn intersecting(&self, range: &KeyRange) -> Vec<ServerShard> {
        // one entry below range.begin catches the straddling predecessor
        let window_start = self
            .shards
            .range(..=range.begin.clone())
            .next_back()
            .map(|(k, _)| k.clone())
            .unwrap_or_default();
        self.shards
            .range(window_start..)
            .map(|(_, s)| s)
            .take_while(|s| s.range.begin < range.end)
            .filter(|s| s.range.intersects(range))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<ServerShard> {
        self.shards.values().cloned().collect()
    }

    /// Replaces everything covering `range` with one shard in `state`,
    /// splitting boundary neighbors as needed. Cancelled adding shards are
    /// returned so the caller can clean up their fetches.
    pub fn replace_range(&mut self, range: &KeyRange, state: ShardState) -> Vec<Arc<AddingShard>> {
        let mut cancelled = Vec::new();
        if range.is_empty() {
            return cancelled;
        }
        let overlapping: Vec<Key> = self
            .shards
            .values()
            .filter(|s| s.range.intersects(range))
            .map(|s| s.range.begin.clone())
            .collect();
        for begin in overlapping {
            let old = self.shards.remove(&begin).unwrap();
            if let ShardState::Adding(adding) = &old.state {
                cancelled.push(adding.clone());
            }
            if old.range.begin < range.begin {
                self.shards.insert(
                    old.range.begin.clone(),
                    ServerShard {
                        range: KeyRange::new(&old.range.begin, &range.begin),
                        state: old.state.clone(),
                    },
                );
            }
            if old.range.end > range.end {
                self.shards.insert(
                    range.end.clone(),
                    ServerShard {
                        range: KeyRange::new(&range.end, &old.range.end),
                        state: old.state.clone(),
                    },
                );
            }
        }
        self.shards.insert(
            range.begin.clone(),
            ServerShard {
                range: range.clone(),
                state,
            },
        );
        self.bump();
        cancelled
    }

    /// Merges runs of adjacent shards in the same terminal state around
    /// `range`, repeating until no adjacent pair qualifies
    pub fn coalesce(&mut self, range: &KeyRange) {
        let mut merged_any = false;
        loop {
            let mut to_merge: Option<(Key, Key)> = None;
            let mut prev: Option<(&Key, &ServerShard)> = None;
            for (key, shard) in self.shards.iter() {
                if let Some((prev_key, prev_shard)) = prev {
                    let touches = prev_shard.range.end >= range.begin && shard.range.begin <= range.end;
                    let same_terminal = (prev_shard.state.is_readable() && shard.state.is_readable())
                        || (prev_shard.state.not_assigned() && shard.state.not_assigned());
                    if touches && same_terminal && prev_shard.range.end == shard.range.begin {
                        to_merge = Some((prev_key.clone(), key.clone()));
                        break;
                    }
                }
                prev = Some((key, shard));
            }
            let Some((a, b)) = to_merge else { break };
            let right = self.shards.remove(&b).unwrap();
            let left = self.shards.get_mut(&a).unwrap();
            left.range = KeyRange::new(&left.range.begin, &right.range.end);
            merged_any = true;
        }
        if merged_any {
            self.bump();
        }
    }

    /// Sets the transfer version and flips an adding shard's entry to
    /// read-write once its fetch fully lands
    pub fn finish_adding(&mut self, adding: &Arc<AddingShard>, transferred: Version) -> bool {
        adding.transferred_version.store(transferred, Ordering::Release);
        let mut flipped = false;
        if let Some(shard) = self.shards.get_mut(&adding.range.begin) {
            if shard.range == adding.range {
                if let ShardState::Adding(cur) = &shard.state {
                    if Arc::ptr_eq(cur, adding) {
                        shard.state = ShardState::ReadWrite;
                        flipped = true;
                    }
                }
            }
        }
        if flipped {
            self.bump();
            self.coalesce(&adding.range.clone());
        }
        flipped
    }
}

impl Default for ShardMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cover_invariant() {
        let mut map = ShardMap::new();
        map.replace_range(&KeyRange::new(b"c", b"g"), ShardState::ReadWrite);
        map.replace_range(&KeyRange::new(b"g", b"m"), ShardState::ReadWrite);
        let shards = map.all();
        // contiguous cover, no gaps, no overlaps
        assert_eq!(shards.first().unwrap().range.begin, b"".to_vec());
        for w in shards.windows(2) {
            assert_eq!(w[0].range.end, w[1].range.begin);
        }
        assert_eq!(
            shards.last().unwrap().range.end,
            crate::types::KeyRange::all().end
        );
    }

    #[test]
    fn test_replace_splits_neighbors() {
        let mut map = ShardMap::new();
        map.replace_range(&KeyRange::new(b"c", b"g"), ShardState::ReadWrite);
        assert!(map.shard_containing(b"a").unwrap().state.not_assigned());
        assert!(map.shard_containing(b"d").unwrap().state.is_readable());
        assert!(map.shard_containing(b"x").unwrap().state.not_assigned());
    }

    #[test]
    fn test_change_counter_bumps() {
        let mut map = ShardMap::new();
        let c0 = map.change_counter();
        map.replace_range(&KeyRange::new(b"a", b"b"), ShardState::ReadWrite);
        assert!(map.change_counter() > c0);
    }

    #[test]
    fn test_coalesce_merges_terminal_neighbors() {
        let mut map = ShardMap::new();
        map.replace_range(&KeyRange::new(b"c", b"g"), ShardState::ReadWrite);
        map.replace_range(&KeyRange::new(b"g", b"m"), ShardState::ReadWrite);
        map.coalesce(&KeyRange::new(b"c", b"m"));
        let readable: Vec<ServerShard> = map
            .all()
            .into_iter()
            .filter(|s| s.state.is_readable())
            .collect();
        assert_eq!(readable.len(), 1);
        assert_eq!(readable[0].range, KeyRange::new(b"c", b"m"));
        // the flanking not-assigned shards also merged around the island
        let shards = map.all();
        assert_eq!(shards.len(), 3);
    }

    #[test]
    fn test_replace_cancels_adding() {
        let mut map = ShardMap::new();
        let adding = AddingShard::new(KeyRange::new(b"c", b"g"));
        map.replace_range(&KeyRange::new(b"c", b"g"), ShardState::Adding(adding.clone()));
        let cancelled = map.replace_range(&KeyRange::new(b"a", b"z"), ShardState::NotAssigned);
        assert_eq!(cancelled.len(), 1);
        assert!(Arc::ptr_eq(&cancelled[0], &adding));
    }

    #[test]
    fn test_finish_adding_flips_to_read_write() {
        let mut map = ShardMap::new();
        let adding = AddingShard::new(KeyRange::new(b"c", b"g"));
        map.replace_range(&KeyRange::new(b"c", b"g"), ShardState::Adding(adding.clone()));
        assert!(map.finish_adding(&adding, 42));
        assert!(map.shard_containing(b"d").unwrap().state.is_readable());
        assert_eq!(adding.transferred_version.load(Ordering::Acquire), 42);
        // a second flip is a no-op
        assert!(!map.finish_adding(&adding, 43));
    }
}

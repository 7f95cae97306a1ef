//! # Memtable
//!
//! Buffers writes for one column family in RAM before they are flushed to a
//! sorted-run file once the size exceeds the configured memtable bytes.
//! Entries are stored in a lock-free SkipMap so readers never block the
//! writer. Range deletes are kept in a side list of tombstones; a tombstone
//! masks every record with a lower sequence number inside its range.

use crate::types::{Key, SequenceNumber, Value};
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Point record payload
#[derive(Clone, Debug, PartialEq)]
pub enum MemValue {
    Put(Value),
    Delete,
}

/// Value stored in the SkipMap
#[derive(Clone, Debug, PartialEq)]
pub struct MemRecord {
    pub seq: SequenceNumber,
    pub value: MemValue,
}

/// A range delete covering `[begin, end)` for every sequence below `seq`
#[derive(Clone, Debug, PartialEq)]
pub struct RangeTombstone {
    pub begin: Key,
    pub end: Key,
    pub seq: SequenceNumber,
}

impl RangeTombstone {
    pub fn covers(&self, key: &[u8], seq: SequenceNumber) -> bool {
        self.seq > seq && self.begin.as_slice() <= key && key < self.end.as_slice()
    }
}

/// In-memory write buffer for one column family
#[derive(Debug)]
pub struct MemTable {
    /// Matches the id of the write-ahead log backing this table
    pub id: u64,

    /// Lock-free skipmap from crossbeam
    pub entries: SkipMap<Key, MemRecord>,

    /// Range deletes, in arrival order
    tombstones: RwLock<Vec<RangeTombstone>>,

    /// Approximate bytes held, keys plus values plus per-record overhead
    size: AtomicUsize,
}

const RECORD_OVERHEAD: usize = std::mem::size_of::<MemRecord>() + 16;

impl MemTable {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            entries: SkipMap::new(),
            tombstones: RwLock::new(Vec::new()),
            size: AtomicUsize::new(0),
        }
    }

    pub fn put(&self, key: Key, value: Value, seq: SequenceNumber) {
        self.size
            .fetch_add(key.len() + value.len() + RECORD_OVERHEAD, Ordering::Relaxed);
        self.entries.insert(
            key,
            MemRecord {
                seq,
                value: MemValue::Put(value),
            },
        );
    }

    pub fn delete(&self, key: Key, seq: SequenceNumber) {
        self.size.fetch_add(key.len() + RECORD_OVERHEAD, Ordering::Relaxed);
        self.entries.insert(
            key,
            MemRecord {
                seq,
                value: MemValue::Delete,
            },
        );
    }

    pub fn delete_range(&self, begin: Key, end: Key, seq: SequenceNumber) {
        if begin >= end {
            return;
        }
        self.size
            .fetch_add(begin.len() + end.len() + RECORD_OVERHEAD, Ordering::Relaxed);
        self.tombstones.write().unwrap().push(RangeTombstone { begin, end, seq });
    }

    /// Newest point record for `key`, if any
    pub fn get(&self, key: &[u8]) -> Option<MemRecord> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Highest tombstone sequence covering `key`, zero when uncovered
    pub fn max_tombstone_seq(&self, key: &[u8]) -> SequenceNumber {
        self.tombstones
            .read()
            .unwrap()
            .iter()
            .filter(|t| t.begin.as_slice() <= key && key < t.end.as_slice())
            .map(|t| t.seq)
            .max()
            .unwrap_or(0)
    }

    pub fn tombstones(&self) -> Vec<RangeTombstone> {
        self.tombstones.read().unwrap().clone()
    }

    /// Smallest entry with key strictly above `anchor` (or at/above for an
    /// inclusive bound)
    pub fn first_above(&self, anchor: Bound<&[u8]>) -> Option<(Key, MemRecord)> {
        let entry = match anchor {
            Bound::Included(k) => self.entries.lower_bound(Bound::Included(k)),
            Bound::Excluded(k) => self.entries.lower_bound(Bound::Excluded(k)),
            Bound::Unbounded => self.entries.front(),
        };
        entry.map(|e| (e.key().clone(), e.value().clone()))
    }

    /// Largest entry with key strictly below `anchor` (or at/below for an
    /// inclusive bound)
    pub fn last_below(&self, anchor: Bound<&[u8]>) -> Option<(Key, MemRecord)> {
        let entry = match anchor {
            Bound::Included(k) => self.entries.upper_bound(Bound::Included(k)),
            Bound::Excluded(k) => self.entries.upper_bound(Bound::Excluded(k)),
            Bound::Unbounded => self.entries.back(),
        };
        entry.map(|e| (e.key().clone(), e.value().clone()))
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.tombstones.read().unwrap().is_empty()
    }

    /// Returns `true` once the table should freeze and flush
    pub fn is_full(&self, capacity: usize) -> bool {
        self.size() >= capacity
    }

    /// Largest sequence number recorded, zero when empty
    pub fn max_seq(&self) -> SequenceNumber {
        let point = self.entries.iter().map(|e| e.value().seq).max().unwrap_or(0);
        let range = self.tombstones.read().unwrap().iter().map(|t| t.seq).max().unwrap_or(0);
        point.max(range)
    }
}

pub type MemTableHandle = Arc<MemTable>;

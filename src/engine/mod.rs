//! # Persistent KV Engine
//!
//! The storage core consumes an abstract ordered key-value engine through the
//! [`KvEngine`] capability trait: column families, atomic write batches with
//! optional sync, point gets, bounded bidirectional iterators and range
//! compaction hints. `NotFound` is expressed as `Ok(None)`; every other
//! engine status surfaces as the matching variant of [`crate::err::Error`]
//! (`IoError`, `FileCorrupt`, `TimedOut`, or `Internal` for unknown states).
//!
//! [`lsm::LsmEngine`] is the bundled implementation: one directory per
//! column family, each holding a write-ahead log per memtable and a set of
//! immutable sorted-run files with bloom filters and a sparse block index.

pub mod compaction;
pub mod filter;
pub mod flush;
pub mod iterator;
pub mod lsm;
pub mod memtable;
pub mod table;
pub mod wal;

use crate::err::Error;
use crate::types::{Key, KeyRange, Value};
use async_trait::async_trait;

/// One record inside a [`WriteBatch`], tagged by column family.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchOp {
    Put { cf: String, key: Key, value: Value },
    Delete { cf: String, key: Key },
    DeleteRange { cf: String, begin: Key, end: Key },
}

/// An atomic group of writes. All records in a batch become visible (and,
/// with `sync`, durable) together or not at all.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, cf: &str, key: K, value: V) {
        self.ops.push(BatchOp::Put {
            cf: cf.to_string(),
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        });
    }

    pub fn delete<K: AsRef<[u8]>>(&mut self, cf: &str, key: K) {
        self.ops.push(BatchOp::Delete {
            cf: cf.to_string(),
            key: key.as_ref().to_vec(),
        });
    }

    pub fn delete_range<B: AsRef<[u8]>, E: AsRef<[u8]>>(&mut self, cf: &str, begin: B, end: E) {
        self.ops.push(BatchOp::DeleteRange {
            cf: cf.to_string(),
            begin: begin.as_ref().to_vec(),
            end: end.as_ref().to_vec(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Approximate payload bytes carried by the batch
    pub fn payload_bytes(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value, .. } => key.len() + value.len(),
                BatchOp::Delete { key, .. } => key.len(),
                BatchOp::DeleteRange { begin, end, .. } => begin.len() + end.len(),
            })
            .sum()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// When set, the batch is fsynced before the write acknowledges
    pub sync: bool,
}

#[derive(Clone, Debug, Default)]
pub struct IterOptions {
    /// Keys strictly below this bound are never yielded
    pub lower_bound: Option<Key>,
    /// Keys at or above this bound are never yielded
    pub upper_bound: Option<Key>,
}

impl IterOptions {
    pub fn bounded(range: &KeyRange) -> Self {
        Self {
            lower_bound: Some(range.begin.clone()),
            upper_bound: Some(range.end.clone()),
        }
    }
}

/// A key-value pair yielded by an engine iterator.
#[derive(Clone, Debug, PartialEq)]
pub struct KvEntry {
    pub key: Key,
    pub value: Value,
}

/// Bidirectional cursor over one column family. Deleted keys and ranges are
/// never yielded. Iteration is weakly consistent with concurrent writes;
/// callers revalidate their version window after the read, so a mid-scan
/// flush is observable only as entries that were durable anyway.
#[async_trait]
pub trait KvIterator: Send {
    /// Position at the first entry with key >= `key` and return it
    async fn seek(&mut self, key: &[u8]) -> Result<Option<KvEntry>, Error>;

    /// Position at the last entry with key <= `key` and return it
    async fn seek_for_prev(&mut self, key: &[u8]) -> Result<Option<KvEntry>, Error>;

    /// Advance and return the next entry in ascending order
    async fn next_entry(&mut self) -> Result<Option<KvEntry>, Error>;

    /// Step back and return the next entry in descending order
    async fn prev_entry(&mut self) -> Result<Option<KvEntry>, Error>;
}

/// The ordered KV engine capability the storage core is written against.
#[async_trait]
pub trait KvEngine: Send + Sync {
    async fn create_column_family(&self, name: &str) -> Result<(), Error>;

    /// Removes the column family and its files. Idempotent: dropping a
    /// missing family succeeds.
    async fn drop_column_family(&self, name: &str) -> Result<(), Error>;

    async fn list_column_families(&self) -> Result<Vec<String>, Error>;

    async fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Value>, Error>;

    async fn write(&self, batch: WriteBatch, opts: WriteOptions) -> Result<(), Error>;

    async fn iter(&self, cf: &str, opts: IterOptions) -> Result<Box<dyn KvIterator>, Error>;

    /// Hint that `range` inside `cf` is worth compacting soon
    async fn suggest_compact_range(&self, cf: &str, range: KeyRange) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;

    /// Close and delete everything under the engine directory
    async fn destroy(&self) -> Result<(), Error>;
}

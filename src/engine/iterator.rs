//! Merge iterator across one column family's memtables and sorted runs.
//!
//! Sources are consulted per step and the record with the highest sequence
//! number wins at each key; point deletes and range tombstones suppress
//! everything older. Cursors are stateless between steps (the iterator
//! re-anchors on the last yielded key), so a concurrent flush only changes
//! which source answers, never the answer.

use crate::engine::memtable::{MemTableHandle, MemValue, RangeTombstone};
use crate::engine::table::{TableReader, KIND_DELETE, KIND_PUT};
use crate::engine::{IterOptions, KvEntry, KvIterator};
use crate::err::Error;
use crate::types::{Key, SequenceNumber, Value};
use async_trait::async_trait;
use std::ops::Bound;
use std::sync::Arc;

struct Candidate {
    key: Key,
    seq: SequenceNumber,
    kind: u8,
    value: Value,
}

pub struct EngineIter {
    mems: Vec<MemTableHandle>,
    tables: Vec<Arc<TableReader>>,
    tombstones: Vec<RangeTombstone>,
    lower: Option<Key>,
    upper: Option<Key>,
    anchor: Option<Key>,
}

impl EngineIter {
    pub fn new(mems: Vec<MemTableHandle>, tables: Vec<Arc<TableReader>>, opts: IterOptions) -> Self {
        let mut tombstones: Vec<RangeTombstone> = Vec::new();
        for mem in &mems {
            tombstones.extend(mem.tombstones());
        }
        for table in &tables {
            tombstones.extend_from_slice(table.tombstones());
        }
        Self {
            mems,
            tables,
            tombstones,
            lower: opts.lower_bound,
            upper: opts.upper_bound,
            anchor: None,
        }
    }

    fn covered(&self, key: &[u8], seq: SequenceNumber) -> bool {
        self.tombstones.iter().any(|t| t.covers(key, seq))
    }

    fn below_upper(&self, key: &[u8]) -> bool {
        self.upper.as_deref().map_or(true, |u| key < u)
    }

    fn at_or_above_lower(&self, key: &[u8]) -> bool {
        self.lower.as_deref().map_or(true, |l| key >= l)
    }

    /// Smallest key above `anchor` across every source, then the max-seq
    /// record at that key
    async fn smallest_above(&self, anchor: Bound<&[u8]>) -> Result<Option<Candidate>, Error> {
        let mut min_key: Option<Key> = None;
        for mem in &self.mems {
            if let Some((k, _)) = mem.first_above(anchor) {
                if min_key.as_ref().map_or(true, |m| &k < m) {
                    min_key = Some(k);
                }
            }
        }
        for table in &self.tables {
            if let Some(e) = table.first_above(anchor).await? {
                if min_key.as_ref().map_or(true, |m| &e.key < m) {
                    min_key = Some(e.key);
                }
            }
        }
        let Some(key) = min_key else { return Ok(None) };
        self.winning_record(key).await
    }

    /// Largest key below `anchor` across every source
    async fn largest_below(&self, anchor: Bound<&[u8]>) -> Result<Option<Candidate>, Error> {
        let mut max_key: Option<Key> = None;
        for mem in &self.mems {
            if let Some((k, _)) = mem.last_below(anchor) {
                if max_key.as_ref().map_or(true, |m| &k > m) {
                    max_key = Some(k);
                }
            }
        }
        for table in &self.tables {
            if let Some(e) = table.last_below(anchor).await? {
                if max_key.as_ref().map_or(true, |m| &e.key > m) {
                    max_key = Some(e.key);
                }
            }
        }
        let Some(key) = max_key else { return Ok(None) };
        self.winning_record(key).await
    }

    /// The max-seq record at exactly `key`
    async fn winning_record(&self, key: Key) -> Result<Option<Candidate>, Error> {
        let mut best: Option<Candidate> = None;
        for mem in &self.mems {
            if let Some(rec) = mem.get(&key) {
                if best.as_ref().map_or(true, |b| rec.seq > b.seq) {
                    let (kind, value) = match rec.value {
                        MemValue::Put(v) => (KIND_PUT, v),
                        MemValue::Delete => (KIND_DELETE, Vec::new()),
                    };
                    best = Some(Candidate {
                        key: key.clone(),
                        seq: rec.seq,
                        kind,
                        value,
                    });
                }
            }
        }
        for table in &self.tables {
            if let Some(e) = table.get(&key).await? {
                if best.as_ref().map_or(true, |b| e.seq > b.seq) {
                    best = Some(Candidate {
                        key: key.clone(),
                        seq: e.seq,
                        kind: e.kind,
                        value: e.value,
                    });
                }
            }
        }
        Ok(best)
    }

    async fn live_above(&mut self, mut bound: Bound<Key>) -> Result<Option<KvEntry>, Error> {
        loop {
            let candidate = {
                let b = match &bound {
                    Bound::Included(k) => Bound::Included(k.as_slice()),
                    Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
                    Bound::Unbounded => Bound::Unbounded,
                };
                self.smallest_above(b).await?
            };
            let Some(c) = candidate else {
                self.anchor = None;
                return Ok(None);
            };
            if !self.below_upper(&c.key) {
                self.anchor = None;
                return Ok(None);
            }
            self.anchor = Some(c.key.clone());
            if c.kind == KIND_PUT && !self.covered(&c.key, c.seq) {
                return Ok(Some(KvEntry {
                    key: c.key,
                    value: c.value,
                }));
            }
            bound = Bound::Excluded(c.key);
        }
    }

    async fn live_below(&mut self, mut bound: Bound<Key>) -> Result<Option<KvEntry>, Error> {
        loop {
            let candidate = {
                let b = match &bound {
                    Bound::Included(k) => Bound::Included(k.as_slice()),
                    Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
                    Bound::Unbounded => Bound::Unbounded,
                };
                self.largest_below(b).await?
            };
            let Some(c) = candidate else {
                self.anchor = None;
                return Ok(None);
            };
            if !self.at_or_above_lower(&c.key) {
                self.anchor = None;
                return Ok(None);
            }
            self.anchor = Some(c.key.clone());
            if c.kind == KIND_PUT && !self.covered(&c.key, c.seq) {
                return Ok(Some(KvEntry {
                    key: c.key,
                    value: c.value,
                }));
            }
            bound = Bound::Excluded(c.key);
        }
    }
}

#[async_trait]
impl KvIterator for EngineIter {
    async fn seek(&mut self, key: &[u8]) -> Result<Option<KvEntry>, Error> {
        let start = match self.lower.as_deref() {
            Some(l) if l > key => l.to_vec(),
            _ => key.to_vec(),
        };
        self.live_above(Bound::Included(start)).await
    }

    async fn seek_for_prev(&mut self, key: &[u8]) -> Result<Option<KvEntry>, Error> {
        match self.upper.as_deref() {
            Some(u) if u <= key => self.live_below(Bound::Excluded(u.to_vec())).await,
            _ => self.live_below(Bound::Included(key.to_vec())).await,
        }
    }

    async fn next_entry(&mut self) -> Result<Option<KvEntry>, Error> {
        match self.anchor.clone() {
            Some(anchor) => self.live_above(Bound::Excluded(anchor)).await,
            None => match self.lower.clone() {
                Some(l) => self.live_above(Bound::Included(l)).await,
                None => self.live_above(Bound::Unbounded).await,
            },
        }
    }

    async fn prev_entry(&mut self) -> Result<Option<KvEntry>, Error> {
        match self.anchor.clone() {
            Some(anchor) => self.live_below(Bound::Excluded(anchor)).await,
            None => match self.upper.clone() {
                Some(u) => self.live_below(Bound::Excluded(u)).await,
                None => self.live_below(Bound::Unbounded).await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memtable::MemTable;

    fn mem_with(entries: &[(&[u8], &[u8], u64)]) -> MemTableHandle {
        let mem = MemTable::new(1);
        for (k, v, seq) in entries {
            mem.put(k.to_vec(), v.to_vec(), *seq);
        }
        Arc::new(mem)
    }

    #[tokio::test]
    async fn test_merge_two_memtables() {
        let old = mem_with(&[(b"a", b"old", 1), (b"c", b"c1", 2)]);
        let new = mem_with(&[(b"a", b"new", 5), (b"b", b"b1", 6)]);
        let mut iter = EngineIter::new(vec![old, new], vec![], IterOptions::default());
        let e = iter.seek(b"").await.unwrap().unwrap();
        assert_eq!((e.key.as_slice(), e.value.as_slice()), (&b"a"[..], &b"new"[..]));
        let e = iter.next_entry().await.unwrap().unwrap();
        assert_eq!(e.key, b"b".to_vec());
        let e = iter.next_entry().await.unwrap().unwrap();
        assert_eq!(e.key, b"c".to_vec());
        assert!(iter.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletes_and_tombstones_hidden() {
        let base = mem_with(&[(b"a", b"1", 1), (b"b", b"2", 2), (b"c", b"3", 3)]);
        let top = MemTable::new(2);
        top.delete(b"b".to_vec(), 10);
        top.delete_range(b"c".to_vec(), b"d".to_vec(), 11);
        let mut iter = EngineIter::new(vec![base, Arc::new(top)], vec![], IterOptions::default());
        let e = iter.seek(b"").await.unwrap().unwrap();
        assert_eq!(e.key, b"a".to_vec());
        assert!(iter.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reverse_iteration_with_bounds() {
        let mem = mem_with(&[(b"a", b"1", 1), (b"b", b"2", 2), (b"c", b"3", 3), (b"d", b"4", 4)]);
        let mut iter = EngineIter::new(
            vec![mem],
            vec![],
            IterOptions {
                lower_bound: Some(b"b".to_vec()),
                upper_bound: Some(b"d".to_vec()),
            },
        );
        let e = iter.seek_for_prev(b"zzz").await.unwrap().unwrap();
        assert_eq!(e.key, b"c".to_vec());
        let e = iter.prev_entry().await.unwrap().unwrap();
        assert_eq!(e.key, b"b".to_vec());
        assert!(iter.prev_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newer_put_survives_older_tombstone() {
        let mem = MemTable::new(1);
        mem.delete_range(b"a".to_vec(), b"z".to_vec(), 5);
        mem.put(b"m".to_vec(), b"kept".to_vec(), 6);
        mem.put(b"b".to_vec(), b"gone".to_vec(), 4);
        let mut iter = EngineIter::new(vec![Arc::new(mem)], vec![], IterOptions::default());
        let e = iter.seek(b"").await.unwrap().unwrap();
        assert_eq!(e.key, b"m".to_vec());
        assert!(iter.next_entry().await.unwrap().is_none());
    }
}

//! # Sorted-run table
//!
//! Immutable on-disk run produced by a memtable flush or a compaction.
//! Entries are laid out in key order across fixed-size data blocks; a sparse
//! index keeps the first key and offset of every block, a bloom filter
//! short-circuits point reads, and a tombstone section carries the range
//! deletes the run inherited from its memtable.
//!
//! ## File layout
//!
//! ```text
//! +--------------------+
//! |    Data blocks     |   entries: klen | key | seq | kind | vlen | value
//! +--------------------+
//! | Tombstone section  |   count, then blen | begin | elen | end | seq
//! +--------------------+
//! |   Index section    |   count, then klen | first_key | offset | len
//! +--------------------+
//! |   Bloom section    |   hash count, byte count, bitmap
//! +--------------------+
//! |      Footer        |   section offsets, entry count, max seq, magic
//! +--------------------+
//! ```

use crate::consts::{BLOCK_SIZE, TABLE_MAGIC};
use crate::engine::filter::BloomFilter;
use crate::engine::memtable::RangeTombstone;
use crate::err::Error;
use crate::err::Error::*;
use crate::types::{Key, SequenceNumber, Value};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{Read, SeekFrom};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub const KIND_PUT: u8 = 0;
pub const KIND_DELETE: u8 = 1;

const FOOTER_LEN: usize = 44;

/// One decoded point record
#[derive(Clone, Debug, PartialEq)]
pub struct TableEntry {
    pub key: Key,
    pub seq: SequenceNumber,
    pub kind: u8,
    pub value: Value,
}

#[derive(Clone, Debug)]
struct IndexEntry {
    first_key: Key,
    offset: u64,
    len: u32,
}

/// Streaming writer; `add` must be called in strictly ascending key order
pub struct TableBuilder {
    buf: Vec<u8>,
    block_start: usize,
    index: Vec<IndexEntry>,
    block_first_key: Option<Key>,
    tombstones: Vec<RangeTombstone>,
    bloom: BloomFilter,
    entry_count: u64,
    max_seq: SequenceNumber,
    last_key: Option<Key>,
}

impl TableBuilder {
    pub fn new(false_positive_rate: f64, expected_entries: usize) -> Self {
        Self {
            buf: Vec::new(),
            block_start: 0,
            index: Vec::new(),
            block_first_key: None,
            tombstones: Vec::new(),
            bloom: BloomFilter::new(false_positive_rate, expected_entries),
            entry_count: 0,
            max_seq: 0,
            last_key: None,
        }
    }

    pub fn add(&mut self, key: &[u8], seq: SequenceNumber, kind: u8, value: &[u8]) {
        debug_assert!(self.last_key.as_deref().map_or(true, |last| last < key));
        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
        }
        WriteBytesExt::write_u32::<BigEndian>(&mut self.buf, key.len() as u32).unwrap();
        self.buf.extend_from_slice(key);
        WriteBytesExt::write_u64::<BigEndian>(&mut self.buf, seq).unwrap();
        WriteBytesExt::write_u8(&mut self.buf, kind).unwrap();
        if kind == KIND_PUT {
            WriteBytesExt::write_u32::<BigEndian>(&mut self.buf, value.len() as u32).unwrap();
            self.buf.extend_from_slice(value);
        }
        self.bloom.set(key);
        self.entry_count += 1;
        self.max_seq = self.max_seq.max(seq);
        self.last_key = Some(key.to_vec());
        if self.buf.len() - self.block_start >= BLOCK_SIZE {
            self.cut_block();
        }
    }

    pub fn add_tombstone(&mut self, tomb: RangeTombstone) {
        self.max_seq = self.max_seq.max(tomb.seq);
        self.tombstones.push(tomb);
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0 && self.tombstones.is_empty()
    }

    fn cut_block(&mut self) {
        if let Some(first_key) = self.block_first_key.take() {
            self.index.push(IndexEntry {
                first_key,
                offset: self.block_start as u64,
                len: (self.buf.len() - self.block_start) as u32,
            });
            self.block_start = self.buf.len();
        }
    }

    /// Writes and syncs the finished run to `path`
    pub async fn finish<P: AsRef<Path>>(mut self, path: P) -> Result<(), Error> {
        self.cut_block();
        let mut out = self.buf;

        let tomb_off = out.len() as u64;
        WriteBytesExt::write_u32::<BigEndian>(&mut out, self.tombstones.len() as u32).unwrap();
        for t in &self.tombstones {
            WriteBytesExt::write_u32::<BigEndian>(&mut out, t.begin.len() as u32).unwrap();
            out.extend_from_slice(&t.begin);
            WriteBytesExt::write_u32::<BigEndian>(&mut out, t.end.len() as u32).unwrap();
            out.extend_from_slice(&t.end);
            WriteBytesExt::write_u64::<BigEndian>(&mut out, t.seq).unwrap();
        }

        let index_off = out.len() as u64;
        WriteBytesExt::write_u32::<BigEndian>(&mut out, self.index.len() as u32).unwrap();
        for e in &self.index {
            WriteBytesExt::write_u32::<BigEndian>(&mut out, e.first_key.len() as u32).unwrap();
            out.extend_from_slice(&e.first_key);
            WriteBytesExt::write_u64::<BigEndian>(&mut out, e.offset).unwrap();
            WriteBytesExt::write_u32::<BigEndian>(&mut out, e.len).unwrap();
        }

        let bloom_off = out.len() as u64;
        let bloom_bytes = self.bloom.to_bytes();
        WriteBytesExt::write_u32::<BigEndian>(&mut out, self.bloom.no_of_hash_func as u32).unwrap();
        WriteBytesExt::write_u32::<BigEndian>(&mut out, bloom_bytes.len() as u32).unwrap();
        out.extend_from_slice(&bloom_bytes);

        WriteBytesExt::write_u64::<BigEndian>(&mut out, tomb_off).unwrap();
        WriteBytesExt::write_u64::<BigEndian>(&mut out, index_off).unwrap();
        WriteBytesExt::write_u64::<BigEndian>(&mut out, bloom_off).unwrap();
        WriteBytesExt::write_u64::<BigEndian>(&mut out, self.entry_count).unwrap();
        WriteBytesExt::write_u64::<BigEndian>(&mut out, self.max_seq).unwrap();
        WriteBytesExt::write_u32::<BigEndian>(&mut out, TABLE_MAGIC).unwrap();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path.as_ref())
            .await
            .map_err(|error| FileOpenError {
                path: path.as_ref().to_path_buf(),
                error,
            })?;
        file.write_all(&out).await.map_err(|error| FileWriteError {
            path: path.as_ref().to_path_buf(),
            error,
        })?;
        file.sync_all().await.map_err(|error| FileSyncError { error })?;
        Ok(())
    }
}

/// Reader over one finished run. The index, bloom filter and tombstones are
/// resident; data blocks are read on demand through a small cache.
#[derive(Debug)]
pub struct TableReader {
    pub path: PathBuf,
    pub run_id: u64,
    pub entry_count: u64,
    pub max_seq: SequenceNumber,
    index: Vec<IndexEntry>,
    tombstones: Vec<RangeTombstone>,
    bloom: BloomFilter,
    file: Mutex<File>,
    cache: StdMutex<BlockCache>,
}

#[derive(Debug)]
struct BlockCache {
    blocks: HashMap<usize, Arc<Vec<TableEntry>>>,
    order: Vec<usize>,
    capacity: usize,
}

impl BlockCache {
    fn get(&self, block: usize) -> Option<Arc<Vec<TableEntry>>> {
        self.blocks.get(&block).cloned()
    }

    fn insert(&mut self, block: usize, entries: Arc<Vec<TableEntry>>) {
        if self.blocks.contains_key(&block) {
            return;
        }
        while self.order.len() >= self.capacity.max(1) {
            let evict = self.order.remove(0);
            self.blocks.remove(&evict);
        }
        self.blocks.insert(block, entries);
        self.order.push(block);
    }
}

impl TableReader {
    pub async fn open<P: AsRef<Path>>(path: P, run_id: u64, cache_blocks: usize) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).await.map_err(|error| FileOpenError {
            path: path.clone(),
            error,
        })?;
        let file_len = file
            .metadata()
            .await
            .map_err(GetFileMetaDataError)?
            .len();
        if (file_len as usize) < FOOTER_LEN {
            return Err(FileCorrupt {
                path,
                reason: "run file shorter than footer".to_string(),
            });
        }
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))
            .await
            .map_err(FileSeekError)?;
        let mut footer = [0u8; FOOTER_LEN];
        file.read_exact(&mut footer).await.map_err(UnexpectedEOF)?;
        let mut f = &footer[..];
        let tomb_off = ReadBytesExt::read_u64::<BigEndian>(&mut f).map_err(UnexpectedEOF)?;
        let index_off = ReadBytesExt::read_u64::<BigEndian>(&mut f).map_err(UnexpectedEOF)?;
        let bloom_off = ReadBytesExt::read_u64::<BigEndian>(&mut f).map_err(UnexpectedEOF)?;
        let entry_count = ReadBytesExt::read_u64::<BigEndian>(&mut f).map_err(UnexpectedEOF)?;
        let max_seq = ReadBytesExt::read_u64::<BigEndian>(&mut f).map_err(UnexpectedEOF)?;
        let magic = ReadBytesExt::read_u32::<BigEndian>(&mut f).map_err(UnexpectedEOF)?;
        if magic != TABLE_MAGIC
            || tomb_off > index_off
            || index_off > bloom_off
            || bloom_off + FOOTER_LEN as u64 > file_len
        {
            return Err(FileCorrupt {
                path,
                reason: "bad run footer".to_string(),
            });
        }

        let meta_len = file_len as usize - FOOTER_LEN - tomb_off as usize;
        file.seek(SeekFrom::Start(tomb_off)).await.map_err(FileSeekError)?;
        let mut meta = vec![0u8; meta_len];
        file.read_exact(&mut meta).await.map_err(UnexpectedEOF)?;
        let corrupt = |reason: &str| FileCorrupt {
            path: path.clone(),
            reason: reason.to_string(),
        };

        let mut cursor = &meta[..];
        let read_blob = |cursor: &mut &[u8]| -> Result<Vec<u8>, Error> {
            let len = ReadBytesExt::read_u32::<BigEndian>(cursor).map_err(UnexpectedEOF)? as usize;
            let mut blob = vec![0u8; len];
            std::io::Read::read_exact(cursor, &mut blob).map_err(UnexpectedEOF)?;
            Ok(blob)
        };

        let tomb_count = ReadBytesExt::read_u32::<BigEndian>(&mut cursor).map_err(UnexpectedEOF)?;
        let mut tombstones = Vec::with_capacity(tomb_count as usize);
        for _ in 0..tomb_count {
            let begin = read_blob(&mut cursor)?;
            let end = read_blob(&mut cursor)?;
            let seq = ReadBytesExt::read_u64::<BigEndian>(&mut cursor).map_err(UnexpectedEOF)?;
            tombstones.push(RangeTombstone { begin, end, seq });
        }

        let index_count = ReadBytesExt::read_u32::<BigEndian>(&mut cursor).map_err(UnexpectedEOF)?;
        let mut index = Vec::with_capacity(index_count as usize);
        for _ in 0..index_count {
            let first_key = read_blob(&mut cursor)?;
            let offset = ReadBytesExt::read_u64::<BigEndian>(&mut cursor).map_err(UnexpectedEOF)?;
            let len = ReadBytesExt::read_u32::<BigEndian>(&mut cursor).map_err(UnexpectedEOF)?;
            if offset + len as u64 > tomb_off {
                return Err(corrupt("index entry points past data section"));
            }
            index.push(IndexEntry { first_key, offset, len });
        }

        let no_of_hash_func = ReadBytesExt::read_u32::<BigEndian>(&mut cursor).map_err(UnexpectedEOF)? as usize;
        let bloom_bytes = read_blob(&mut cursor)?;
        let bloom = BloomFilter::from_bytes(no_of_hash_func, &bloom_bytes);

        Ok(Self {
            path,
            run_id,
            entry_count,
            max_seq,
            index,
            tombstones,
            bloom,
            file: Mutex::new(file),
            cache: StdMutex::new(BlockCache {
                blocks: HashMap::new(),
                order: Vec::new(),
                capacity: cache_blocks,
            }),
        })
    }

    pub fn tombstones(&self) -> &[RangeTombstone] {
        &self.tombstones
    }

    pub fn max_tombstone_seq(&self, key: &[u8]) -> SequenceNumber {
        self.tombstones
            .iter()
            .filter(|t| t.begin.as_slice() <= key && key < t.end.as_slice())
            .map(|t| t.seq)
            .max()
            .unwrap_or(0)
    }

    /// Newest point record for `key`, bloom-guarded
    pub async fn get(&self, key: &[u8]) -> Result<Option<TableEntry>, Error> {
        if self.index.is_empty() || !self.bloom.contains(key) {
            return Ok(None);
        }
        let Some(block) = self.block_for(key) else {
            return Ok(None);
        };
        let entries = self.read_block(block).await?;
        Ok(entries.iter().find(|e| e.key.as_slice() == key).cloned())
    }

    /// Index of the last block whose first key is <= `key`
    fn block_for(&self, key: &[u8]) -> Option<usize> {
        let idx = self.index.partition_point(|e| e.first_key.as_slice() <= key);
        idx.checked_sub(1)
    }

    async fn read_block(&self, block: usize) -> Result<Arc<Vec<TableEntry>>, Error> {
        if let Some(hit) = self.cache.lock().unwrap().get(block) {
            return Ok(hit);
        }
        let ie = &self.index[block];
        let mut raw = vec![0u8; ie.len as usize];
        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(ie.offset)).await.map_err(FileSeekError)?;
            file.read_exact(&mut raw).await.map_err(UnexpectedEOF)?;
        }
        let mut entries = Vec::new();
        let mut cursor = &raw[..];
        while !cursor.is_empty() {
            let klen = ReadBytesExt::read_u32::<BigEndian>(&mut cursor).map_err(UnexpectedEOF)? as usize;
            let mut key = vec![0u8; klen];
            std::io::Read::read_exact(&mut cursor, &mut key).map_err(UnexpectedEOF)?;
            let seq = ReadBytesExt::read_u64::<BigEndian>(&mut cursor).map_err(UnexpectedEOF)?;
            let kind = ReadBytesExt::read_u8(&mut cursor).map_err(UnexpectedEOF)?;
            let value = if kind == KIND_PUT {
                let vlen = ReadBytesExt::read_u32::<BigEndian>(&mut cursor).map_err(UnexpectedEOF)? as usize;
                let mut value = vec![0u8; vlen];
                std::io::Read::read_exact(&mut cursor, &mut value).map_err(UnexpectedEOF)?;
                value
            } else {
                Vec::new()
            };
            entries.push(TableEntry { key, seq, kind, value });
        }
        let entries = Arc::new(entries);
        self.cache.lock().unwrap().insert(block, entries.clone());
        Ok(entries)
    }

    /// Smallest entry with key above `anchor`
    pub async fn first_above(&self, anchor: Bound<&[u8]>) -> Result<Option<TableEntry>, Error> {
        if self.index.is_empty() {
            return Ok(None);
        }
        let admit = |k: &[u8]| match anchor {
            Bound::Included(a) => k >= a,
            Bound::Excluded(a) => k > a,
            Bound::Unbounded => true,
        };
        let start_block = match anchor {
            Bound::Unbounded => 0,
            Bound::Included(a) | Bound::Excluded(a) => self.block_for(a).unwrap_or(0),
        };
        for block in start_block..self.index.len() {
            let entries = self.read_block(block).await?;
            if let Some(e) = entries.iter().find(|e| admit(&e.key)) {
                return Ok(Some(e.clone()));
            }
        }
        Ok(None)
    }

    /// Largest entry with key below `anchor`
    pub async fn last_below(&self, anchor: Bound<&[u8]>) -> Result<Option<TableEntry>, Error> {
        if self.index.is_empty() {
            return Ok(None);
        }
        let admit = |k: &[u8]| match anchor {
            Bound::Included(a) => k <= a,
            Bound::Excluded(a) => k < a,
            Bound::Unbounded => true,
        };
        let start_block = match anchor {
            Bound::Unbounded => self.index.len() - 1,
            Bound::Included(a) | Bound::Excluded(a) => self.block_for(a).unwrap_or(0),
        };
        for block in (0..=start_block).rev() {
            let entries = self.read_block(block).await?;
            if let Some(e) = entries.iter().rev().find(|e| admit(&e.key)) {
                return Ok(Some(e.clone()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn build_table(path: &Path) -> TableReader {
        let mut builder = TableBuilder::new(0.01, 16);
        builder.add(b"a", 1, KIND_PUT, b"1");
        builder.add(b"c", 2, KIND_PUT, b"3");
        builder.add(b"e", 3, KIND_DELETE, b"");
        builder.add(b"g", 4, KIND_PUT, b"7");
        builder.add_tombstone(RangeTombstone {
            begin: b"x".to_vec(),
            end: b"z".to_vec(),
            seq: 9,
        });
        builder.finish(path).await.unwrap();
        TableReader::open(path, 1, 8).await.unwrap()
    }

    #[tokio::test]
    async fn test_build_and_get() {
        let root = tempdir().unwrap();
        let path = root.path().join("run-1.sst");
        let reader = build_table(&path).await;
        assert_eq!(reader.entry_count, 4);
        assert_eq!(reader.max_seq, 9);
        let e = reader.get(b"c").await.unwrap().unwrap();
        assert_eq!(e.value, b"3".to_vec());
        let e = reader.get(b"e").await.unwrap().unwrap();
        assert_eq!(e.kind, KIND_DELETE);
        assert!(reader.get(b"b").await.unwrap().is_none());
        assert_eq!(reader.max_tombstone_seq(b"y"), 9);
        assert_eq!(reader.max_tombstone_seq(b"a"), 0);
    }

    #[tokio::test]
    async fn test_directional_scans() {
        let root = tempdir().unwrap();
        let path = root.path().join("run-2.sst");
        let reader = build_table(&path).await;

        let e = reader.first_above(Bound::Included(b"c".as_ref())).await.unwrap().unwrap();
        assert_eq!(e.key, b"c".to_vec());
        let e = reader.first_above(Bound::Excluded(b"c".as_ref())).await.unwrap().unwrap();
        assert_eq!(e.key, b"e".to_vec());
        let e = reader.last_below(Bound::Excluded(b"c".as_ref())).await.unwrap().unwrap();
        assert_eq!(e.key, b"a".to_vec());
        assert!(reader.last_below(Bound::Included(b"0".as_ref())).await.unwrap().is_none());
        let e = reader.first_above(Bound::Unbounded).await.unwrap().unwrap();
        assert_eq!(e.key, b"a".to_vec());
        let e = reader.last_below(Bound::Unbounded).await.unwrap().unwrap();
        assert_eq!(e.key, b"g".to_vec());
    }

    #[tokio::test]
    async fn test_many_blocks() {
        let root = tempdir().unwrap();
        let path = root.path().join("run-3.sst");
        let mut builder = TableBuilder::new(0.01, 4096);
        for i in 0..4096u32 {
            let key = format!("key{:06}", i);
            builder.add(key.as_bytes(), i as u64, KIND_PUT, &vec![7u8; 64]);
        }
        builder.finish(&path).await.unwrap();
        let reader = TableReader::open(&path, 2, 4).await.unwrap();
        assert!(reader.index.len() > 1);
        let e = reader.get(b"key001234").await.unwrap().unwrap();
        assert_eq!(e.seq, 1234);
        let e = reader
            .first_above(Bound::Excluded(b"key000099".as_ref()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e.key, b"key000100".to_vec());
    }
}

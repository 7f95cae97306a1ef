//! # Byte sample
//!
//! Probabilistic sample of stored bytes, used by shard-split decisions. Each
//! set flips a coin weighted by the entry's size; a sampled entry stores
//! `size / probability` so the expected sampled total matches the real
//! total. The sample is persisted under a reserved prefix by the durability
//! loop and rebuilt from there after a restart.

use crate::consts::BYTE_SAMPLE_ALWAYS_BYTES;
use crate::types::{Key, KeyRange};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

/// A sample change the durability loop still has to persist
#[derive(Clone, Debug, PartialEq)]
pub enum PendingSample {
    Set(Key, u64),
    Clear(Key, Key),
}

pub struct ByteSample {
    factor: usize,
    overhead: usize,
    entries: RwLock<BTreeMap<Key, u64>>,
    total: AtomicUsize,
    pending: Mutex<Vec<PendingSample>>,
}

impl ByteSample {
    pub fn new(factor: usize, overhead: usize) -> Self {
        Self {
            factor,
            overhead,
            entries: RwLock::new(BTreeMap::new()),
            total: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Probability that an entry of `size` bytes lands in the sample
    fn probability(&self, size: usize) -> f64 {
        if size >= BYTE_SAMPLE_ALWAYS_BYTES {
            return 1.0;
        }
        let p = size as f64 / ((size + self.overhead) as f64 * self.factor as f64);
        p.min(1.0)
    }

    /// Records a set of `key` with `value_len` payload bytes
    pub fn apply_set(&self, key: &[u8], value_len: usize) {
        let size = key.len() + value_len;
        let p = self.probability(size);
        let sampled = if rand::thread_rng().gen::<f64>() < p {
            Some((size as f64 / p) as u64)
        } else {
            None
        };
        let mut entries = self.entries.write().unwrap();
        if let Some(old) = entries.remove(key) {
            self.total.fetch_sub(old as usize, Ordering::Relaxed);
        }
        match sampled {
            Some(bytes) => {
                entries.insert(key.to_vec(), bytes);
                self.total.fetch_add(bytes as usize, Ordering::Relaxed);
                self.pending.lock().unwrap().push(PendingSample::Set(key.to_vec(), bytes));
            }
            None => {
                let end = crate::types::key_after(key);
                self.pending.lock().unwrap().push(PendingSample::Clear(key.to_vec(), end));
            }
        }
    }

    /// Records a clear of `[begin, end)`
    pub fn apply_clear(&self, begin: &[u8], end: &[u8]) {
        let mut entries = self.entries.write().unwrap();
        let gone: Vec<Key> = entries
            .range(begin.to_vec()..end.to_vec())
            .map(|(k, _)| k.clone())
            .collect();
        for k in gone {
            if let Some(old) = entries.remove(&k) {
                self.total.fetch_sub(old as usize, Ordering::Relaxed);
            }
        }
        self.pending
            .lock()
            .unwrap()
            .push(PendingSample::Clear(begin.to_vec(), end.to_vec()));
    }

    /// Reinstates one entry during recovery, without marking it pending
    pub fn restore(&self, key: Key, bytes: u64) {
        self.total.fetch_add(bytes as usize, Ordering::Relaxed);
        self.entries.write().unwrap().insert(key, bytes);
    }

    /// Estimated real bytes stored inside `range`
    pub fn range_estimate(&self, range: &KeyRange) -> u64 {
        self.entries
            .read()
            .unwrap()
            .range(range.begin.clone()..range.end.clone())
            .map(|(_, bytes)| *bytes)
            .sum()
    }

    pub fn total_estimate(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Hands the accumulated changes to the durability loop
    pub fn drain_pending(&self) -> Vec<PendingSample> {
        std::mem::take(&mut self.pending.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expectation_tracks_real_bytes() {
        let sample = ByteSample::new(10, 10);
        let mut real = 0usize;
        for i in 0..20_000u32 {
            let key = format!("key-{:06}", i);
            sample.apply_set(key.as_bytes(), 90);
            real += key.len() + 90;
        }
        let est = sample.total_estimate() as f64;
        let real = real as f64;
        assert!(
            (est - real).abs() / real < 0.25,
            "estimate {} too far from real {}",
            est,
            real
        );
    }

    #[test]
    fn test_large_values_always_sampled() {
        let sample = ByteSample::new(250, 100);
        sample.apply_set(b"big", BYTE_SAMPLE_ALWAYS_BYTES);
        assert!(sample.total_estimate() >= BYTE_SAMPLE_ALWAYS_BYTES);
    }

    #[test]
    fn test_clear_removes_range() {
        let sample = ByteSample::new(1, 0);
        sample.apply_set(b"a", 5000);
        sample.apply_set(b"b", 5000);
        sample.apply_set(b"x", 5000);
        let before = sample.total_estimate();
        sample.apply_clear(b"a", b"c");
        assert!(sample.total_estimate() < before);
        assert_eq!(sample.range_estimate(&KeyRange::new(b"a", b"c")), 0);
        assert!(sample.range_estimate(&KeyRange::new(b"x", b"y")) > 0);
    }

    #[test]
    fn test_pending_drain() {
        let sample = ByteSample::new(1, 0);
        sample.apply_set(b"k", 5000);
        sample.apply_clear(b"a", b"b");
        let pending = sample.drain_pending();
        assert_eq!(pending.len(), 2);
        assert!(sample.drain_pending().is_empty());
    }
}

//! # Watches
//!
//! One-shot triggers bound to a key and an expected value. The update
//! pipeline offers every applied write to this map; a watch fires when the
//! written value differs from what its client expects. At most one record
//! exists per key: identical registrations coalesce onto the same wakeup
//! channel, and a registration with a new expected value fires the old one.

use crate::err::Error;
use crate::types::{Key, Value, Version};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tokio::sync::watch;

const WATCH_OVERHEAD_BYTES: usize = 64;

struct WatchEntry {
    expected: Option<Value>,
    version: Version,
    bytes: usize,
    tx: watch::Sender<Option<Version>>,
    rx: watch::Receiver<Option<Version>>,
}

pub struct Watches {
    map: RwLock<HashMap<Key, WatchEntry>>,
    bytes: AtomicUsize,
    budget: usize,
}

impl Watches {
    pub fn new(budget: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            bytes: AtomicUsize::new(0),
            budget,
        }
    }

    /// Registers interest in `key` diverging from `expected` at or after
    /// `version`. The receiver resolves to the triggering version.
    pub fn register(
        &self,
        key: &[u8],
        expected: Option<Value>,
        version: Version,
    ) -> Result<watch::Receiver<Option<Version>>, Error> {
        let mut map = self.map.write().unwrap();
        if let Some(entry) = map.get(key) {
            if entry.expected == expected {
                return Ok(entry.rx.clone());
            }
            // a different expectation means one of the two is already wrong;
            // fire the old record and replace it
            let old = map.remove(key).unwrap();
            self.bytes.fetch_sub(old.bytes, Ordering::Relaxed);
            let _ = old.tx.send(Some(version));
        }
        let bytes = key.len() + expected.as_ref().map_or(0, |v| v.len()) + WATCH_OVERHEAD_BYTES;
        if self.bytes.load(Ordering::Relaxed) + bytes > self.budget {
            return Err(Error::WatchCancelled);
        }
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        map.insert(
            key.to_vec(),
            WatchEntry {
                expected,
                version,
                bytes,
                tx,
                rx: rx.clone(),
            },
        );
        Ok(rx)
    }

    /// Offers an applied write; fires the record when the new value differs
    /// from what the watcher expected
    pub fn trigger(&self, key: &[u8], new_value: Option<&[u8]>, version: Version) {
        let fired = {
            let mut map = self.map.write().unwrap();
            let should_fire = map
                .get(key)
                .map_or(false, |entry| entry.expected.as_deref() != new_value && version >= entry.version);
            if should_fire {
                map.remove(key)
            } else {
                None
            }
        };
        if let Some(entry) = fired {
            self.bytes.fetch_sub(entry.bytes, Ordering::Relaxed);
            let _ = entry.tx.send(Some(version));
        }
    }

    /// Offers a cleared range; every covered watch expecting a value fires
    pub fn trigger_range(&self, begin: &[u8], end: &[u8], version: Version) {
        let fired: Vec<WatchEntry> = {
            let mut map = self.map.write().unwrap();
            let keys: Vec<Key> = map
                .keys()
                .filter(|k| begin <= k.as_slice() && k.as_slice() < end)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| {
                    let fire = map
                        .get(&k)
                        .map(|e| e.expected.is_some() && version >= e.version)
                        .unwrap_or(false);
                    if fire {
                        map.remove(&k)
                    } else {
                        None
                    }
                })
                .collect()
        };
        for entry in fired {
            self.bytes.fetch_sub(entry.bytes, Ordering::Relaxed);
            let _ = entry.tx.send(Some(version));
        }
    }

    /// Drops every record, replying to no one; used on teardown
    pub fn clear(&self) {
        self.map.write().unwrap().clear();
        self.bytes.store(0, Ordering::Relaxed);
    }

    pub fn watch_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fire_on_divergence() {
        let watches = Watches::new(1 << 20);
        let mut rx = watches.register(b"k", Some(b"old".to_vec()), 50).unwrap();
        watches.trigger(b"k", Some(b"old"), 55);
        assert_eq!(*rx.borrow(), None);
        watches.trigger(b"k", Some(b"new"), 60);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(60));
        assert_eq!(watches.len(), 0);
    }

    #[tokio::test]
    async fn test_coalesce_identical_registrations() {
        let watches = Watches::new(1 << 20);
        let rx1 = watches.register(b"k", Some(b"v".to_vec()), 10).unwrap();
        let rx2 = watches.register(b"k", Some(b"v".to_vec()), 12).unwrap();
        assert_eq!(watches.len(), 1);
        watches.trigger(b"k", None, 20);
        assert_eq!(*rx1.borrow(), Some(20));
        assert_eq!(*rx2.borrow(), Some(20));
    }

    #[tokio::test]
    async fn test_clear_range_fires() {
        let watches = Watches::new(1 << 20);
        let rx = watches.register(b"m", Some(b"v".to_vec()), 10).unwrap();
        watches.trigger_range(b"a", b"z", 30);
        assert_eq!(*rx.borrow(), Some(30));
    }

    #[test]
    fn test_budget_exhaustion() {
        let watches = Watches::new(200);
        let mut cancelled = false;
        for i in 0..10u32 {
            let key = format!("watch-key-{}", i);
            match watches.register(key.as_bytes(), Some(vec![0u8; 32]), 1) {
                Ok(_) => {}
                Err(Error::WatchCancelled) => {
                    cancelled = true;
                    break;
                }
                Err(other) => panic!("unexpected error {}", other),
            }
        }
        assert!(cancelled);
    }
}

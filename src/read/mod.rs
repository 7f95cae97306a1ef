//! # Read Path
//!
//! Version-pinned reads over the union of the versioned map and the
//! engine: the map shadows the engine wherever it has an entry or a
//! covering clear. Every read captures the shard change counter on entry
//! and re-checks it after the engine round-trip, so a concurrent shard
//! move surfaces as `WrongShardServer` instead of a torn result; reads
//! whose version fell below the storage version during the scan fail
//! `TransactionTooOld` the same way.

pub mod mapped;

use crate::engine::{IterOptions, KvIterator};
use crate::err::Error;
use crate::err::Error::*;
use crate::server::StorageServer;
use crate::types::{key_after, Key, KeyRange, Value, Version};
use crate::vmap::{lookup, ValueOrClear, View, VmRead};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RangeResult {
    pub rows: Vec<(Key, Value)>,
    /// Limits cut the scan short; `read_through` is the resume boundary
    pub more: bool,
    pub read_through: Option<Key>,
}

/// A key plus an offset, resolved against the ordered keyspace the way
/// clients iterate shard boundaries
#[derive(Clone, Debug)]
pub struct KeySelector {
    pub key: Key,
    pub or_equal: bool,
    pub offset: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyResult {
    pub key: Key,
    /// Zero when fully resolved; otherwise the remaining offset for the
    /// client to retry on the next shard
    pub offset: i64,
}

/// Snapshot of everything one read needs: the map view, the engine
/// segments and the change counter to re-check later.
struct ReadSnapshot {
    view: View,
    segments: Vec<(KeyRange, String)>,
    change_counter: u64,
}

async fn capture(server: &Arc<StorageServer>, range: &KeyRange, v: Version) -> Result<ReadSnapshot, Error> {
    let change_counter = server.shard_change_counter();
    {
        let shards = server.shards.read().unwrap();
        for shard in shards.intersecting(range) {
            if !shard.state.is_readable() {
                return Err(WrongShardServer);
            }
        }
    }
    let view = {
        let data = server.data.read().await;
        data.vmap.at(v).ok_or(TransactionTooOld {
            requested: v,
            oldest: server.oldest_version.get(),
        })?
    };
    let segments = server.shard_manager.intersecting(range).await;
    Ok(ReadSnapshot {
        view,
        segments,
        change_counter,
    })
}

fn revalidate(server: &Arc<StorageServer>, snap: &ReadSnapshot, v: Version) -> Result<(), Error> {
    server.check_shard_change(snap.change_counter)?;
    let oldest = server.oldest_version.get();
    if v < oldest {
        return Err(TransactionTooOld {
            requested: v,
            oldest,
        });
    }
    Ok(())
}

pub async fn get_value(server: &Arc<StorageServer>, key: &[u8], v: Version) -> Result<Option<Value>, Error> {
    let _permit = server.try_acquire_read()?;
    server.counters.queries.fetch_add(1, Ordering::Relaxed);
    let v = server.wait_for_version(v).await?;
    let range = KeyRange::new(key, key_after(key));
    let snap = capture(server, &range, v).await?;

    let result = match lookup(&snap.view, key) {
        VmRead::Value(value) => Some(value),
        VmRead::Cleared => None,
        VmRead::Missing => {
            let cf = server.shard_manager.locate(key).await.ok_or(WrongShardServer)?;
            server.shard_manager.engine().get(&cf, key).await?
        }
    };
    revalidate(server, &snap, v)?;
    if let Some(value) = &result {
        server
            .counters
            .bytes_queried
            .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
    }
    Ok(result)
}

/// Chains the engine iterators of the shard segments a range read spans
struct ChainedEngineIter<'a> {
    server: &'a Arc<StorageServer>,
    segments: Vec<(KeyRange, String)>,
    idx: usize,
    cur: Option<Box<dyn KvIterator>>,
    reverse: bool,
}

impl<'a> ChainedEngineIter<'a> {
    fn new(server: &'a Arc<StorageServer>, mut segments: Vec<(KeyRange, String)>, reverse: bool) -> Self {
        if reverse {
            segments.reverse();
        }
        Self {
            server,
            segments,
            idx: 0,
            cur: None,
            reverse,
        }
    }

    async fn next(&mut self) -> Result<Option<(Key, Value)>, Error> {
        loop {
            if self.cur.is_none() {
                let Some((range, cf)) = self.segments.get(self.idx) else {
                    return Ok(None);
                };
                let mut iter = self
                    .server
                    .shard_manager
                    .engine()
                    .iter(cf, IterOptions::bounded(range))
                    .await?;
                let first = if self.reverse {
                    iter.seek_for_prev(&range.end).await?
                } else {
                    iter.seek(&range.begin).await?
                };
                self.cur = Some(iter);
                if let Some(e) = first {
                    return Ok(Some((e.key, e.value)));
                }
                self.cur = None;
                self.idx += 1;
                continue;
            }
            let iter = self.cur.as_mut().unwrap();
            let entry = if self.reverse {
                iter.prev_entry().await?
            } else {
                iter.next_entry().await?
            };
            match entry {
                Some(e) => return Ok(Some((e.key, e.value))),
                None => {
                    self.cur = None;
                    self.idx += 1;
                }
            }
        }
    }
}

/// Merge-iterates the map view with the engine under one snapshot. A
/// negative `row_limit` scans descending with `-row_limit` rows.
pub async fn get_range(
    server: &Arc<StorageServer>,
    begin: &[u8],
    end: &[u8],
    row_limit: i64,
    byte_limit: usize,
    v: Version,
) -> Result<RangeResult, Error> {
    let _permit = server.try_acquire_read()?;
    server.counters.queries.fetch_add(1, Ordering::Relaxed);
    let v = server.wait_for_version(v).await?;
    let range = KeyRange::new(begin, end);
    if range.is_empty() {
        return Ok(RangeResult::default());
    }
    let snap = capture(server, &range, v).await?;
    let reverse = row_limit < 0;
    let rows_wanted = row_limit.unsigned_abs() as usize;

    let mut result = RangeResult::default();
    let mut bytes = 0usize;
    let mut engine = ChainedEngineIter::new(server, snap.segments.clone(), reverse);
    let mut engine_next = engine.next().await?;

    // the map side only yields live values; clears act through lookup()
    let mut vm_entries: Vec<(Key, Value)> = Vec::new();
    if reverse {
        for (k, e) in snap.view.iter_rev_from(end) {
            if k.as_slice() < begin {
                break;
            }
            if let ValueOrClear::Value(val) = &e.val {
                vm_entries.push((k.clone(), val.clone()));
            }
        }
    } else {
        for (k, e) in snap.view.iter_from(begin) {
            if k.as_slice() >= end {
                break;
            }
            if let ValueOrClear::Value(val) = &e.val {
                vm_entries.push((k.clone(), val.clone()));
            }
        }
    }
    let mut vm_idx = 0usize;

    let ahead = |a: &[u8], b: &[u8], reverse: bool| if reverse { a > b } else { a < b };
    while result.rows.len() < rows_wanted {
        // drop engine keys the view shadows
        loop {
            let shadowed = match &engine_next {
                Some((ek, _)) => lookup(&snap.view, ek) != VmRead::Missing,
                None => false,
            };
            if !shadowed {
                break;
            }
            engine_next = engine.next().await?;
        }
        let take_vm = match (vm_entries.get(vm_idx), &engine_next) {
            (Some((vk, _)), Some((ek, _))) => ahead(vk, ek, reverse) || vk == ek,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let (k, val) = if take_vm {
            let entry = vm_entries[vm_idx].clone();
            vm_idx += 1;
            entry
        } else {
            let entry = engine_next.take().unwrap();
            engine_next = engine.next().await?;
            entry
        };
        bytes += k.len() + val.len();
        let over_budget = bytes > byte_limit;
        if over_budget && reverse {
            // the truncating row still ships, but its bytes stay unbilled,
            // matching the historical accounting of the reverse path
            result.rows.push((k.clone(), val));
            result.more = true;
            result.read_through = Some(k);
            break;
        }
        server
            .counters
            .bytes_queried
            .fetch_add((k.len() + val.len()) as u64, Ordering::Relaxed);
        result.rows.push((k.clone(), val));
        if over_budget {
            result.more = true;
            result.read_through = Some(k);
            break;
        }
    }
    if result.rows.len() >= rows_wanted && (vm_entries.len() > vm_idx || engine_next.is_some()) {
        result.more = true;
        result.read_through = result.rows.last().map(|(k, _)| k.clone());
    }
    server
        .counters
        .rows_queried
        .fetch_add(result.rows.len() as u64, Ordering::Relaxed);
    revalidate(server, &snap, v)?;
    Ok(result)
}

/// Resolves a key selector inside the shard owning its anchor key. When
/// resolution would leave the shard, the nearest boundary comes back with
/// the unconsumed offset so the client can retry on the neighbor.
pub async fn get_key(server: &Arc<StorageServer>, sel: &KeySelector, v: Version) -> Result<KeyResult, Error> {
    let _permit = server.try_acquire_read()?;
    server.counters.queries.fetch_add(1, Ordering::Relaxed);
    let v = server.wait_for_version(v).await?;

    let shard_range = {
        let shards = server.shards.read().unwrap();
        let shard = shards.shard_containing(&sel.key).ok_or(WrongShardServer)?;
        if !shard.state.is_readable() {
            return Err(WrongShardServer);
        }
        shard.range.clone()
    };

    if sel.offset > 0 {
        let start: Key = if sel.or_equal {
            key_after(&sel.key)
        } else {
            sel.key.clone()
        };
        let start = start.max(shard_range.begin.clone());
        let wanted = sel.offset as usize;
        let scan = get_range(server, &start, &shard_range.end, wanted as i64, usize::MAX, v).await?;
        if scan.rows.len() >= wanted {
            Ok(KeyResult {
                key: scan.rows[wanted - 1].0.clone(),
                offset: 0,
            })
        } else {
            Ok(KeyResult {
                key: shard_range.end.clone(),
                offset: sel.offset - scan.rows.len() as i64,
            })
        }
    } else {
        let end: Key = if sel.or_equal {
            key_after(&sel.key)
        } else {
            sel.key.clone()
        };
        let end = end.min(shard_range.end.clone());
        let wanted = (1 - sel.offset) as usize;
        let scan = get_range(
            server,
            &shard_range.begin,
            &end,
            -(wanted as i64),
            usize::MAX,
            v,
        )
        .await?;
        if scan.rows.len() >= wanted {
            Ok(KeyResult {
                key: scan.rows[wanted - 1].0.clone(),
                offset: 0,
            })
        } else {
            Ok(KeyResult {
                key: shard_range.begin.clone(),
                offset: sel.offset + scan.rows.len() as i64,
            })
        }
    }
}

/// Chunked range read: one `RangeResult` per bounded chunk, delivered
/// through a small channel so a slow consumer holds back the scan.
pub fn get_range_stream(
    server: Arc<StorageServer>,
    begin: Key,
    end: Key,
    v: Version,
) -> ReceiverStream<Result<RangeResult, Error>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut cursor = begin;
        loop {
            let chunk = get_range(
                &server,
                &cursor,
                &end,
                server.cfg.stream_chunk_rows as i64,
                server.cfg.stream_chunk_bytes,
                v,
            )
            .await;
            match chunk {
                Ok(result) => {
                    let more = result.more;
                    let next = result.read_through.as_ref().map(|k| key_after(k));
                    if tx.send(Ok(result)).await.is_err() {
                        return;
                    }
                    match (more, next) {
                        (true, Some(next)) => cursor = next,
                        _ => return,
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Registers a watch on `key` diverging from `expected` at or after `v`.
/// Resolves with the version of the divergence; an immediate mismatch
/// resolves at the current version without registering anything.
pub async fn watch_value(
    server: &Arc<StorageServer>,
    key: &[u8],
    expected: Option<Value>,
    v: Version,
) -> Result<Version, Error> {
    server.counters.watch_queries.fetch_add(1, Ordering::Relaxed);
    let v = server.wait_for_version(v).await?;
    let current = server.current_version();
    let stored = get_value(server, key, current).await?;
    if stored != expected {
        return Ok(current);
    }
    let mut rx = server.watches.register(key, expected, v)?;
    let fired = tokio::time::timeout(server.cfg.watch_timeout, async {
        loop {
            if let Some(version) = *rx.borrow() {
                return Some(version);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    })
    .await;
    match fired {
        Ok(Some(version)) => {
            // the triggering version must be readable before the reply
            server.version.when_at_least(version).await;
            Ok(version)
        }
        Ok(None) => Err(WatchCancelled),
        Err(_) => Err(TimedOut),
    }
}

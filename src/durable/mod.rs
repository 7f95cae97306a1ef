//! # Durability Loop
//!
//! Promotes versioned-map and mutation-log state into the engine. Each
//! cycle drains log entries up to a byte budget into one write batch
//! (together with feed mirrors, byte-sample changes, shard-mapping records
//! and the `Version` marker), commits it with sync exactly once, and only
//! then forgets the flushed entries from memory so readers never observe a
//! durable version ahead of the engine.

use crate::consts::{METADATA_SHARD_ID, PERSIST_BYTE_SAMPLE_PREFIX, PERSIST_BYTE_SAMPLE_SAMPLE_PREFIX,
    PERSIST_VERSION_KEY};
use crate::engine::{WriteBatch, WriteOptions};
use crate::err::Error;
use crate::err::Error::*;
use crate::feed::{encode_feed_entry, feed_durable_key};
use crate::logsys::LogCursor;
use crate::mlog::Mutation;
use crate::sample::PendingSample;
use crate::server::StorageServer;
use crate::types::{Key, Version, INVALID_VERSION};
use crate::vmap::ValueOrClear;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub async fn run_durability_loop(server: &Arc<StorageServer>, cursor: Arc<dyn LogCursor>) -> Result<(), Error> {
    let mut shutdown = server.shutdown_signal();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(server.cfg.durability_interval) => {}
            _ = server.durability_wake.notified() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            return Ok(());
        }
        run_cycle(server, &cursor).await?;
    }
}

/// One durability cycle. Partial progress is normal: when the byte budget
/// runs out the cycle commits what it has and leaves the rest for the next
/// one, which the overage allowance guarantees can always happen.
pub async fn run_cycle(server: &Arc<StorageServer>, cursor: &Arc<dyn LogCursor>) -> Result<(), Error> {
    let durable = server.durable_version.get();
    let desired = server.desired_oldest_version.get().min(server.version.get());

    let mut batch = WriteBatch::new();
    let mut new_durable = durable;
    let mut drained_mvcc_bytes: u64 = 0;

    // walk pending versions under the read half of the lock; the update
    // pipeline only appends versions above `desired`, never these
    {
        let data = server.data.read().await;
        let mut payload = 0usize;
        let mut budget_hit = false;
        for update in data.mlog.range(durable, desired) {
            for m in &update.mutations {
                server.shard_manager.add_mutation_to_batch(&mut batch, m).await?;
                payload += m.param_bytes();
                drained_mvcc_bytes += m.mvcc_bytes() as u64;
            }
            new_durable = update.version;
            if payload >= server.cfg.durability_budget_bytes {
                budget_hit = true;
                log::debug!(
                    "durability budget reached at version {} (of desired {})",
                    new_durable,
                    desired
                );
                break;
            }
        }
        // with the log fully drained the whole desired window is durable,
        // mutations or not
        if !budget_hit && desired > new_durable {
            new_durable = desired;
        }
    }

    // mirror change feeds written since the last cycle, up to new_durable
    let mut mirrored: Vec<(crate::feed::FeedHandle, Version)> = Vec::new();
    for id in server.feeds.drain_current() {
        let Some(feed) = server.feeds.get(&id) else { continue };
        let mut f = feed.write().await;
        let from = if f.storage_version == INVALID_VERSION {
            0
        } else {
            f.storage_version
        };
        let mut written_to = INVALID_VERSION;
        let mut has_tail = false;
        for entry in f.mutations.iter() {
            if entry.version <= from {
                continue;
            }
            if entry.version > new_durable {
                has_tail = true;
                break;
            }
            if !entry.mutations.is_empty() {
                batch.put(
                    METADATA_SHARD_ID,
                    feed_durable_key(&f.id, entry.version),
                    encode_feed_entry(entry),
                );
                written_to = entry.version;
            }
        }
        if written_to != INVALID_VERSION {
            f.storage_version = written_to;
            mirrored.push((feed.clone(), written_to));
        }
        if has_tail {
            server.feeds.mark_current(&f.id);
        }
    }

    // byte-sample changes ride in the same commit
    for pending in server.byte_sample.drain_pending() {
        match pending {
            PendingSample::Set(key, bytes) => {
                batch.put(METADATA_SHARD_ID, sample_key(&key), bytes.to_be_bytes());
                if in_sample_of_sample(&key) {
                    batch.put(METADATA_SHARD_ID, sample_of_sample_key(&key), bytes.to_be_bytes());
                }
            }
            PendingSample::Clear(begin, end) => {
                batch.delete_range(METADATA_SHARD_ID, sample_key(&begin), sample_key(&end));
                batch.delete_range(
                    METADATA_SHARD_ID,
                    sample_of_sample_key(&begin),
                    sample_of_sample_key(&end),
                );
            }
        }
    }

    // shard-mapping changes whose triggering version is in this commit
    let due_mapping: Vec<(crate::types::KeyRange, bool, Version)> = {
        let mut pending = server.pending_mapping.lock().unwrap();
        let (due, later): (Vec<_>, Vec<_>) = pending.drain(..).partition(|(_, _, v)| *v <= new_durable);
        *pending = later;
        due
    };
    let mut cleanup_candidates: Vec<String> = Vec::new();
    for (range, is_add, _) in &due_mapping {
        if !*is_add {
            cleanup_candidates.extend(server.shard_manager.remove_range(range).await);
        }
        server.shard_manager.persist_range_mapping(&mut batch, range, *is_add).await;
    }

    let reboot_at = server.reboot_after_durable.load(Ordering::Acquire);
    if batch.is_empty() && new_durable == durable && !(reboot_at != 0 && reboot_at <= durable) {
        return Ok(());
    }

    batch.put(METADATA_SHARD_ID, PERSIST_VERSION_KEY, new_durable.to_be_bytes());

    // the engine exposes this batch the moment it lands in its memtable, so
    // the storage version must move first; reads below it re-check after
    // their engine read and fail TransactionTooOld instead of seeing the
    // future
    server.oldest_version.set(new_durable);
    server
        .shard_manager
        .engine()
        .write(batch, WriteOptions { sync: true })
        .await?;

    // the engine now holds everything <= new_durable; forgetting memory is
    // safe and the new durable version may become visible
    change_durable_version(server, durable, new_durable).await;
    server
        .counters
        .bytes_durable
        .fetch_add(drained_mvcc_bytes, Ordering::Relaxed);

    for (feed, written_to) in mirrored {
        let mut f = feed.write().await;
        if written_to > f.durable_version {
            f.durable_version = written_to;
        }
        // memory below the new oldest version is reachable durably
        while f
            .mutations
            .front()
            .map_or(false, |m| m.version <= new_durable && m.version <= f.durable_version)
        {
            f.mutations.pop_front();
        }
    }

    server.shard_manager.cleanup_shards(&cleanup_candidates).await?;
    cursor.pop(new_durable).await;

    if reboot_at != 0 && new_durable >= reboot_at {
        log::info!("reboot marker durable at {}, restarting", new_durable);
        return Err(PleaseReboot);
    }
    Ok(())
}

/// Promotes the durable version: entries the engine now shadows are erased
/// from the latest view, flushed log entries are dropped, and views older
/// than the new oldest version are forgotten.
async fn change_durable_version(server: &Arc<StorageServer>, prev_durable: Version, new_durable: Version) {
    if new_durable == prev_durable {
        return;
    }
    let mut data = server.data.write().await;
    let drained: Vec<(Version, Vec<Mutation>)> = data
        .mlog
        .range(prev_durable, new_durable)
        .map(|u| (u.version, u.mutations.clone()))
        .collect();
    for (version, mutations) in drained {
        for m in mutations {
            match m {
                Mutation::SetValue { key, .. } => {
                    let stale = data
                        .vmap
                        .latest()
                        .get(&key)
                        .map_or(false, |e| e.insert_version == version);
                    if stale {
                        data.vmap.erase_key(&key);
                    }
                    // a set can split a clear, leaving a right-half clear
                    // immediately after it with the same insert version
                    let split = data
                        .vmap
                        .latest()
                        .first_greater(&key)
                        .filter(|(_, e)| e.val.is_clear_to() && e.insert_version == version)
                        .map(|(k, _)| k.clone());
                    if let Some(split_key) = split {
                        data.vmap.erase_key(&split_key);
                    }
                }
                Mutation::ClearRange { begin, .. } => {
                    let stale = data.vmap.latest().get(&begin).map_or(false, |e| {
                        e.val.is_clear_to() && e.insert_version == version
                    });
                    if stale {
                        data.vmap.erase_key(&begin);
                    }
                }
                Mutation::Atomic { .. } => {}
            }
        }
    }
    data.mlog.forget_through(new_durable);
    data.vmap.forget_versions_before(new_durable);
    drop(data);

    server.durable_version.set(new_durable);
    log::debug!("durable version advanced to {}", new_durable);
}

fn sample_key(key: &[u8]) -> Key {
    let mut k = PERSIST_BYTE_SAMPLE_PREFIX.to_vec();
    k.extend_from_slice(key);
    k
}

fn sample_of_sample_key(key: &[u8]) -> Key {
    let mut k = PERSIST_BYTE_SAMPLE_SAMPLE_PREFIX.to_vec();
    k.extend_from_slice(key);
    k
}

/// Deterministic second-level sampling so restart can chunk the rebuild
fn in_sample_of_sample(key: &[u8]) -> bool {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() & 0xf == 0
}

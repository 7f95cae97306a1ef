//! # Update Pipeline
//!
//! The single writer into the versioned map and mutation log. Each
//! iteration pulls one committed batch from the log cursor, resolves eager
//! reads, splices fetch injections, applies mutations in version order
//! (private keys first within their version), fans writes out to watches
//! and change feeds, and finally publishes the new version to readers.
//!
//! Mutations of one version are applied atomically with respect to readers:
//! the version cell only advances after the whole batch is in the map.

use crate::consts::{
    PERSIST_LOG_PROTOCOL_KEY, PERSIST_PRIMARY_LOCALITY_KEY, PERSIST_SHARD_ASSIGNED_PREFIX,
    PERSIST_SHARD_AVAILABLE_PREFIX, PERSIST_TSS_PAIR_ID_KEY, PERSIST_TSS_QUARANTINE_KEY, PRIVATE_PREFIX,
    PRIV_FEED_PREFIX, PRIV_LOG_PROTOCOL_KEY, PRIV_PRIMARY_LOCALITY_KEY, PRIV_REBOOT_KEY, PRIV_ROLLBACK_KEY,
    PRIV_SERVER_KEYS_PREFIX, PRIV_SERVER_TAG_PREFIX, PRIV_TSS_MAPPING_PREFIX, PRIV_TSS_QUARANTINE_PREFIX,
    SERVER_KEYS_ASSIGNED,
};
use crate::err::Error;
use crate::err::Error::*;
use crate::feed::{decode_feed_value, feed_durable_key, feed_registration_key, FeedStatus, MutationsAndVersion};
use crate::logsys::LogCursor;
use crate::mlog::{resolve_atomic, AtomicResult, Mutation, VerUpdate};
use crate::server::shards::{AddingShard, ShardState};
use crate::server::{FetchInjection, MvccData, StorageServer};
use crate::types::{key_after, Key, KeyRange, Value, Version};
use crate::vmap::{lookup, ValueOrClear, VmRead};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Values and next-keys read ahead of the apply step. The map reflects the
/// engine at the storage version; the versioned map is always consulted
/// first and wins when present.
#[derive(Default)]
struct EagerReads {
    /// key -> engine value, for atomic-op bases
    values: HashMap<Key, Option<Value>>,
    /// clear end -> next existing engine key at or after it
    key_ends: HashMap<Key, Option<Key>>,
}

impl EagerReads {
    fn note(&mut self, m: &Mutation) {
        match m {
            Mutation::Atomic { key, .. } => {
                self.values.entry(key.clone()).or_default();
            }
            Mutation::ClearRange { end, .. } if end.as_slice() < PRIVATE_PREFIX => {
                self.key_ends.entry(end.clone()).or_default();
            }
            _ => {}
        }
    }

    async fn fetch(&mut self, server: &Arc<StorageServer>) -> Result<(), Error> {
        let engine = server.shard_manager.engine();

        let keys: Vec<Key> = self.values.keys().cloned().collect();
        let value_reads = keys.iter().map(|key| {
            let engine = engine.clone();
            let sm = server.shard_manager.clone();
            async move {
                match sm.locate(key).await {
                    Some(cf) => engine.get(&cf, key).await,
                    None => Ok(None),
                }
            }
        });
        let results = join_all(value_reads).await;
        for (key, result) in keys.into_iter().zip(results) {
            self.values.insert(key, result?);
        }

        let ends: Vec<Key> = self.key_ends.keys().cloned().collect();
        let end_reads = ends.iter().map(|end| {
            let engine = engine.clone();
            let sm = server.shard_manager.clone();
            async move {
                match sm.locate(end).await {
                    Some(cf) => {
                        let mut iter = engine.iter(&cf, Default::default()).await?;
                        Ok(iter.seek(end).await?.map(|e| e.key))
                    }
                    None => Ok(None),
                }
            }
        });
        let results = join_all(end_reads).await;
        for (end, result) in ends.into_iter().zip(results) {
            self.key_ends.insert(end, result?);
        }
        Ok(())
    }
}

/// Pairs consecutive assignment boundary mutations into ranges, the way the
/// sequencer batches them
struct PrivateState {
    pending_boundary: Option<(Key, bool)>,
}

pub async fn run_update_loop(server: &Arc<StorageServer>, cursor: Arc<dyn LogCursor>) -> Result<(), Error> {
    let mut shutdown = server.shutdown_signal();
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        // emergency brake: stop consuming the log while the MVCC queue is
        // past its ceiling and the durability loop still has room to help;
        // the overage allowance above the ceiling is what keeps the loop
        // able to commit between activations
        while server.counters.queue_bytes() as usize > server.cfg.queue_hard_bytes
            && server.desired_oldest_version.get() > server.durable_version.get()
        {
            log::warn!(
                "update pipeline braking: queue {} bytes over ceiling",
                server.counters.queue_bytes()
            );
            server.durability_wake.notify_waiters();
            let next = server.durable_version.get() + 1;
            tokio::select! {
                _ = server.durable_version.when_at_least(next) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }

        let after = server.last_log_version.load(Ordering::Acquire);
        let batch = tokio::select! {
            batch = cursor.next_batch(after) => batch?,
            _ = shutdown.changed() => return Ok(()),
        };
        server.set_known_committed(cursor.known_committed_version());
        apply_batch(server, batch).await?;
    }
}

/// Applies one log batch under the durable-version lock.
pub async fn apply_batch(server: &Arc<StorageServer>, batch: VerUpdate) -> Result<(), Error> {
    let injections: Vec<FetchInjection> = server.fetch_injections.lock().await.drain(..).collect();

    // eager reads cover the batch plus everything the injections replay
    let mut eager = EagerReads::default();
    for m in &batch.mutations {
        eager.note(m);
    }
    for inj in &injections {
        for update in &inj.updates {
            for m in &update.mutations {
                eager.note(m);
            }
        }
    }

    // the lock must be held across the eager reads: a durability promotion
    // in between would erase map entries and leave the eager values stale
    let mut data = server.data.write().await;
    eager.fetch(server).await?;
    let version = batch.version;

    // splice fetch results below the incoming version
    let mut injection_acks: Vec<(oneshot::Sender<Version>, Version)> = Vec::new();
    for inj in injections {
        let transferred = (server.version.get() + 1).max(data.vmap.latest_version() + 1);
        debug_assert!(transferred <= version);
        data.vmap.create_new_version(transferred);
        for update in &inj.updates {
            for m in &update.mutations {
                if let Some(clipped) = clip_mutation(m, &inj.range) {
                    apply_user_mutation(server, &mut data, transferred, &clipped, &eager, true).await?;
                }
            }
        }
        injection_acks.push((inj.done, transferred));
    }

    data.vmap.create_new_version(version);
    // within one version, private mutations take effect before user
    // mutations, so an assignment change covers the user writes that were
    // co-batched with it
    let mut private = PrivateState {
        pending_boundary: None,
    };
    for m in batch.mutations.iter().filter(|m| is_private(m)) {
        server.counters.mutations.fetch_add(1, Ordering::Relaxed);
        apply_private_data(server, &mut data, version, m, &mut private).await?;
    }
    for m in batch.mutations.iter().filter(|m| !is_private(m)) {
        server.counters.mutations.fetch_add(1, Ordering::Relaxed);
        split_and_apply(server, &mut data, version, m, &eager).await?;
    }

    drop(data);

    server.version.set(version);
    server.last_log_version.store(version, Ordering::Release);
    server.counters.log_batches.fetch_add(1, Ordering::Relaxed);
    server.update_desired_oldest();
    server.durability_wake.notify_waiters();
    for (done, transferred) in injection_acks {
        let _ = done.send(transferred);
    }

    if server.reboot_after_durable.load(Ordering::Acquire) != 0 {
        // the durability loop surfaces PleaseReboot once it commits
        server.durability_wake.notify_waiters();
    }
    Ok(())
}

fn is_private(m: &Mutation) -> bool {
    match m {
        Mutation::SetValue { key, .. } | Mutation::Atomic { key, .. } => key.starts_with(PRIVATE_PREFIX),
        Mutation::ClearRange { begin, .. } => begin.starts_with(PRIVATE_PREFIX),
    }
}

/// Restricts `m` to `range`, dropping it when nothing remains
pub fn clip_mutation(m: &Mutation, range: &KeyRange) -> Option<Mutation> {
    match m {
        Mutation::SetValue { key, .. } | Mutation::Atomic { key, .. } => {
            if range.contains(key) {
                Some(m.clone())
            } else {
                None
            }
        }
        Mutation::ClearRange { begin, end } => {
            let clear = KeyRange::new(begin, end);
            if clear.intersects(range) {
                let clipped = clear.intersect(range);
                Some(Mutation::ClearRange {
                    begin: clipped.begin,
                    end: clipped.end,
                })
            } else {
                None
            }
        }
    }
}

/// Splits a user mutation across the shards it touches and applies each
/// piece according to the owning shard's state.
async fn split_and_apply(
    server: &Arc<StorageServer>,
    data: &mut MvccData,
    version: Version,
    m: &Mutation,
    eager: &EagerReads,
) -> Result<(), Error> {
    let targets: Vec<(KeyRange, ShardState)> = {
        let shards = server.shards.read().unwrap();
        let range = match m {
            Mutation::SetValue { key, .. } | Mutation::Atomic { key, .. } => KeyRange::new(key, key_after(key)),
            Mutation::ClearRange { begin, end } => KeyRange::new(begin, end),
        };
        shards
            .intersecting(&range)
            .into_iter()
            .map(|s| (s.range.clone(), s.state.clone()))
            .collect()
    };

    for (shard_range, state) in targets {
        let Some(clipped) = clip_mutation(m, &shard_range) else { continue };
        match state {
            ShardState::NotAssigned => {
                // sets for unowned keys are dropped, clears silently ignored
            }
            ShardState::Adding(adding)
                if adding.phase_now() == crate::server::shards::AddingPhase::Fetching =>
            {
                let mut update = VerUpdate::new(version);
                update.mutations.push(clipped);
                adding.push_queued(update);
            }
            _ => {
                apply_user_mutation(server, data, version, &clipped, eager, false).await?;
            }
        }
    }
    Ok(())
}

/// Resolves atomics, expands clears, and lands one canonical mutation into
/// the versioned map, mutation log, watches, feeds and the byte sample.
async fn apply_user_mutation(
    server: &Arc<StorageServer>,
    data: &mut MvccData,
    version: Version,
    m: &Mutation,
    eager: &EagerReads,
    from_fetch: bool,
) -> Result<(), Error> {
    let canonical = match m {
        Mutation::Atomic { op, key, param } => {
            server.counters.atomic_mutations.fetch_add(1, Ordering::Relaxed);
            // the live map wins over the eagerly-read engine value
            let existing: Option<Value> = match lookup(data.vmap.latest(), key) {
                VmRead::Value(v) => Some(v),
                VmRead::Cleared => None,
                VmRead::Missing => eager.values.get(key).cloned().flatten(),
            };
            match resolve_atomic(*op, existing.as_deref(), param) {
                AtomicResult::Set(value) => Mutation::SetValue {
                    key: key.clone(),
                    value,
                },
                AtomicResult::ClearKey => Mutation::ClearRange {
                    begin: key.clone(),
                    end: key_after(key),
                },
                AtomicResult::NoOp => return Ok(()),
            }
        }
        other => other.clone(),
    };

    match &canonical {
        Mutation::SetValue { key, value } => {
            server.counters.set_mutations.fetch_add(1, Ordering::Relaxed);
            data.vmap.apply_set(key, value.clone());
            data.mlog.push(version, canonical.clone());
            server
                .counters
                .bytes_input
                .fetch_add(canonical.mvcc_bytes() as u64, Ordering::Relaxed);
            server.watches.trigger(key, Some(value), version);
            server.byte_sample.apply_set(key, value.len());
            if !from_fetch {
                fanout_to_feeds(server, version, &canonical, key, None).await;
            }
        }
        Mutation::ClearRange { begin, end } => {
            server.counters.clear_range_mutations.fetch_add(1, Ordering::Relaxed);
            let (begin, end) = expand_clear(data, eager, begin, end);
            let expanded = Mutation::ClearRange {
                begin: begin.clone(),
                end: end.clone(),
            };
            data.vmap.apply_clear(&begin, &end);
            data.mlog.push(version, expanded.clone());
            server
                .counters
                .bytes_input
                .fetch_add(expanded.mvcc_bytes() as u64, Ordering::Relaxed);
            server.watches.trigger_range(&begin, &end, version);
            server.byte_sample.apply_clear(&begin, &end);
            if !from_fetch {
                fanout_to_feeds(server, version, &expanded, &begin, Some(&end)).await;
            }
        }
        Mutation::Atomic { .. } => unreachable!(),
    }
    Ok(())
}

/// Canonicalises a clear: engulf overlapping clears on both sides, then
/// extend the end through the next existing engine key so clears stay
/// maximal.
fn expand_clear(data: &MvccData, eager: &EagerReads, begin: &[u8], end: &[u8]) -> (Key, Key) {
    let view = data.vmap.latest();
    let mut new_begin = begin.to_vec();
    let mut new_end = end.to_vec();
    if let Some((k, entry)) = view.last_less(begin) {
        if let ValueOrClear::ClearTo(ce) = &entry.val {
            if ce.as_slice() >= begin {
                new_begin = k.clone();
            }
        }
    }
    let mut engulfed_right = false;
    if let Some((_, entry)) = view.last_less_or_equal(end) {
        if let ValueOrClear::ClearTo(ce) = &entry.val {
            if ce.as_slice() > end {
                new_end = ce.clone();
                engulfed_right = true;
            }
        }
    }
    if !engulfed_right {
        if let Some(Some(next_key)) = eager.key_ends.get(end) {
            if next_key.as_slice() > end && next_key.as_slice() < PRIVATE_PREFIX {
                // no data lives in [end, next_key); widening the clear there
                // merges it with whatever the next mutation does at next_key
                new_end = next_key.clone();
            }
        }
    }
    (new_begin, new_end)
}

async fn fanout_to_feeds(
    server: &Arc<StorageServer>,
    version: Version,
    m: &Mutation,
    key_or_begin: &[u8],
    end: Option<&[u8]>,
) {
    let feeds = match end {
        None => server.feeds.feeds_containing(key_or_begin),
        Some(end) => server
            .feeds
            .feeds_intersecting(&KeyRange::new(key_or_begin, end)),
    };
    for feed in feeds {
        let mut f = feed.write().await;
        if f.stopped || f.removing {
            continue;
        }
        let clipped = match m {
            Mutation::ClearRange { begin, end } => {
                let r = KeyRange::new(begin, end).intersect(&f.range);
                Mutation::ClearRange {
                    begin: r.begin,
                    end: r.end,
                }
            }
            other => other.clone(),
        };
        f.push_mutation(version, server.known_committed_version(), clipped);
        f.wake_consumers();
        server.feeds.mark_current(&f.id);
    }
}

/// Dispatches one private mutation: shard assignment, TSS pairing, feed
/// CRUD, rollback, log protocol, locality and reboot markers.
async fn apply_private_data(
    server: &Arc<StorageServer>,
    data: &mut MvccData,
    version: Version,
    m: &Mutation,
    state: &mut PrivateState,
) -> Result<(), Error> {
    match m {
        Mutation::SetValue { key, value } if key.starts_with(PRIV_SERVER_KEYS_PREFIX) => {
            let boundary = key[PRIV_SERVER_KEYS_PREFIX.len()..].to_vec();
            let now_assigned = value.as_slice() == SERVER_KEYS_ASSIGNED;
            if let Some((start, assigned)) = state.pending_boundary.take() {
                let range = KeyRange::new(&start, &boundary);
                if !range.is_empty() {
                    change_server_keys(server, data, &range, assigned, version).await?;
                }
            }
            state.pending_boundary = Some((boundary, now_assigned));
            Ok(())
        }
        Mutation::SetValue { key, .. } if key.starts_with(PRIV_SERVER_TAG_PREFIX) => {
            // a tag write for this server is a no-op refresh; any other
            // server id appearing under our tag means we were replaced
            let tagged = &key[PRIV_SERVER_TAG_PREFIX.len()..];
            if tagged != server.id.as_bytes().as_slice() {
                log::warn!("server tag reassigned, shutting down");
                return Err(WorkerRemoved);
            }
            Ok(())
        }
        Mutation::ClearRange { begin, end } if begin.starts_with(PRIV_SERVER_TAG_PREFIX) => {
            let mut our_tag = PRIV_SERVER_TAG_PREFIX.to_vec();
            our_tag.extend_from_slice(server.id.as_bytes());
            let covers_us = begin.as_slice() <= our_tag.as_slice() && our_tag.as_slice() < end.as_slice();
            let quarantined = server.tss_quarantined.load(Ordering::Acquire);
            let pair_covered = server.tss_pair.lock().unwrap().map_or(false, |pair| {
                let mut pair_tag = PRIV_SERVER_TAG_PREFIX.to_vec();
                pair_tag.extend_from_slice(pair.as_bytes());
                begin.as_slice() <= pair_tag.as_slice() && pair_tag.as_slice() < end.as_slice()
            });
            if (covers_us && !quarantined) || pair_covered {
                log::warn!("server tag cleared, shutting down");
                return Err(WorkerRemoved);
            }
            Ok(())
        }
        Mutation::SetValue { key, value } if key.as_slice() == PRIV_ROLLBACK_KEY => {
            let rollback_version = crate::util::decode_version_be(value)
                .ok_or_else(|| Internal("malformed rollback marker".into()))?;
            rollback(server, data, rollback_version, version).await
        }
        Mutation::SetValue { key, .. } if key.as_slice() == PRIV_REBOOT_KEY => {
            server.reboot_after_durable.store(version, Ordering::Release);
            log::info!("reboot requested once version {} is durable", version);
            server.durability_wake.notify_waiters();
            Ok(())
        }
        Mutation::SetValue { key, value } if key.as_slice() == PRIV_PRIMARY_LOCALITY_KEY => {
            if value.len() == 8 {
                server
                    .primary_locality
                    .store(i64::from_be_bytes(value.as_slice().try_into().unwrap()), Ordering::Release);
            }
            let v = data.vmap.latest_version();
            data.mlog
                .push(v, Mutation::set(PERSIST_PRIMARY_LOCALITY_KEY, value));
            Ok(())
        }
        Mutation::SetValue { key, value } if key.as_slice() == PRIV_LOG_PROTOCOL_KEY => {
            if let Some(proto) = crate::util::decode_version_be(value) {
                server.log_protocol.store(proto, Ordering::Release);
            }
            let v = data.vmap.latest_version();
            data.mlog.push(v, Mutation::set(PERSIST_LOG_PROTOCOL_KEY, value));
            Ok(())
        }
        Mutation::SetValue { key, value } if key.starts_with(PRIV_FEED_PREFIX) => {
            let feed_id = key[PRIV_FEED_PREFIX.len()..].to_vec();
            apply_feed_marker(server, data, version, feed_id, value).await
        }
        Mutation::SetValue { key, value } if key.starts_with(PRIV_TSS_MAPPING_PREFIX) => {
            if let Ok(pair) = uuid::Uuid::from_slice(value) {
                *server.tss_pair.lock().unwrap() = Some(pair);
                let v = data.vmap.latest_version();
                data.mlog.push(v, Mutation::set(PERSIST_TSS_PAIR_ID_KEY, value));
            }
            Ok(())
        }
        Mutation::ClearRange { begin, .. } if begin.starts_with(PRIV_TSS_MAPPING_PREFIX) => {
            *server.tss_pair.lock().unwrap() = None;
            let v = data.vmap.latest_version();
            data.mlog.push(
                v,
                Mutation::clear_range(PERSIST_TSS_PAIR_ID_KEY, key_after(PERSIST_TSS_PAIR_ID_KEY)),
            );
            Ok(())
        }
        Mutation::SetValue { key, .. } if key.starts_with(PRIV_TSS_QUARANTINE_PREFIX) => {
            server.tss_quarantined.store(true, Ordering::Release);
            let v = data.vmap.latest_version();
            data.mlog.push(v, Mutation::set(PERSIST_TSS_QUARANTINE_KEY, b"1"));
            Ok(())
        }
        Mutation::ClearRange { begin, .. } if begin.starts_with(PRIV_TSS_QUARANTINE_PREFIX) => {
            server.tss_quarantined.store(false, Ordering::Release);
            let v = data.vmap.latest_version();
            data.mlog.push(
                v,
                Mutation::clear_range(PERSIST_TSS_QUARANTINE_KEY, key_after(PERSIST_TSS_QUARANTINE_KEY)),
            );
            Ok(())
        }
        other => {
            log::debug!("ignoring unrecognised private mutation {:?}", other);
            Ok(())
        }
    }
}

/// A rollback marker always forces an orderly restart: recovery replays
/// the log forward from the engine's durable state, which is the only copy
/// guaranteed to predate the rolled-back versions. This holds even when
/// the target precedes the oldest in-memory version.
async fn rollback(
    server: &Arc<StorageServer>,
    _data: &mut MvccData,
    rollback_version: Version,
    current_version: Version,
) -> Result<(), Error> {
    if rollback_version >= current_version {
        return Ok(());
    }
    log::warn!(
        "rollback to {} at {}, requesting reboot",
        rollback_version,
        current_version
    );
    // consumers observe the discontinuity as a synthetic empty entry
    for feed in server.feeds.all() {
        let mut f = feed.write().await;
        let kcv = server.known_committed_version();
        f.mutations.push_back(MutationsAndVersion {
            version: current_version,
            known_committed: kcv,
            mutations: Vec::new(),
        });
        f.wake_consumers();
    }
    Err(PleaseReboot)
}

async fn apply_feed_marker(
    server: &Arc<StorageServer>,
    data: &mut MvccData,
    version: Version,
    feed_id: Key,
    value: &[u8],
) -> Result<(), Error> {
    let (range, pop_version, status) = decode_feed_value(value)?;
    let existing = server.feeds.get(&feed_id);
    let latest = data.vmap.latest_version();
    match (existing, status) {
        (None, FeedStatus::Create) => {
            log::debug!(
                "creating change feed {} over {}",
                crate::util::printable(&feed_id),
                range
            );
            server.feeds.register(feed_id.clone(), range, version.saturating_sub(1));
            data.mlog
                .push(latest, Mutation::set(feed_registration_key(&feed_id), value));
            Ok(())
        }
        (Some(feed), FeedStatus::Destroy) => {
            {
                let mut f = feed.write().await;
                f.removing = true;
                f.wake_consumers();
            }
            server.feeds.detach(&feed_id);
            let reg_key = feed_registration_key(&feed_id);
            data.mlog
                .push(latest, Mutation::clear_range(&reg_key, key_after(&reg_key)));
            data.mlog.push(
                latest,
                Mutation::clear_range(feed_durable_key(&feed_id, 0), feed_durable_key(&feed_id, version)),
            );
            Ok(())
        }
        (Some(feed), status) => {
            let mut f = feed.write().await;
            if pop_version != 0 && pop_version.saturating_sub(1) > f.empty_version {
                f.pop_memory(pop_version);
                if f.storage_version != crate::types::INVALID_VERSION {
                    data.mlog.push(
                        latest,
                        Mutation::clear_range(
                            feed_durable_key(&feed_id, 0),
                            feed_durable_key(&feed_id, pop_version),
                        ),
                    );
                    if pop_version > f.storage_version {
                        f.storage_version = crate::types::INVALID_VERSION;
                        f.durable_version = crate::types::INVALID_VERSION;
                    }
                }
            }
            f.stopped = status == FeedStatus::Stop;
            f.wake_consumers();
            data.mlog
                .push(latest, Mutation::set(feed_registration_key(&feed_id), value));
            Ok(())
        }
        (None, _) => {
            log::debug!(
                "ignoring marker for unknown change feed {}",
                crate::util::printable(&feed_id)
            );
            Ok(())
        }
    }
}

/// Writes a boundary-encoded flag range into the mutation log: clear the
/// prefix over `range`, set the left boundary, restore the right boundary
/// from what follows it.
fn persist_flag_range(data: &mut MvccData, prefix: &[u8], range: &KeyRange, value: bool, right_value: bool) {
    let v = data.vmap.latest_version();
    let mapped = |key: &[u8]| {
        let mut k = prefix.to_vec();
        k.extend_from_slice(key);
        k
    };
    data.mlog
        .push(v, Mutation::clear_range(mapped(&range.begin), mapped(&range.end)));
    data.mlog.push(
        v,
        Mutation::set(mapped(&range.begin), if value { b"1" as &[u8] } else { b"0" }),
    );
    data.mlog.push(
        v,
        Mutation::set(mapped(&range.end), if right_value { b"1" as &[u8] } else { b"0" }),
    );
}

pub(crate) fn set_assigned_status(server: &Arc<StorageServer>, data: &mut MvccData, range: &KeyRange, assigned: bool) {
    let right = {
        let shards = server.shards.read().unwrap();
        shards
            .shard_containing(&range.end)
            .map(|s| !s.state.not_assigned())
            .unwrap_or(false)
    };
    persist_flag_range(data, PERSIST_SHARD_ASSIGNED_PREFIX, range, assigned, right);
}

pub(crate) fn set_available_status(server: &Arc<StorageServer>, data: &mut MvccData, range: &KeyRange, available: bool) {
    let right = {
        let shards = server.shards.read().unwrap();
        shards
            .shard_containing(&range.end)
            .map(|s| s.state.is_readable())
            .unwrap_or(false)
    };
    persist_flag_range(data, PERSIST_SHARD_AVAILABLE_PREFIX, range, available, right);
}

/// Trims the latest view to exclude `range` and logs a clear so the engine
/// forgets the range once this version becomes durable.
pub(crate) fn remove_data_range(data: &mut MvccData, range: &KeyRange, counters: &crate::server::Counters) {
    let v = data.vmap.latest_version();
    let clear = Mutation::clear_range(&range.begin, &range.end);
    counters
        .bytes_input
        .fetch_add(clear.mvcc_bytes() as u64, Ordering::Relaxed);
    data.mlog.push(v, clear);

    // a clear straddling the right boundary is re-anchored at range.end and
    // needs its own log entry to be forgotten later
    let end_clear = data
        .vmap
        .latest()
        .last_less(&range.end)
        .and_then(|(_, e)| match &e.val {
            ValueOrClear::ClearTo(ce) if ce.as_slice() > range.end.as_slice() => Some(ce.clone()),
            _ => None,
        });
    if let Some(ce) = end_clear {
        data.mlog.push(v, Mutation::clear_range(&range.end, &ce));
        data.vmap
            .insert(range.end.clone(), ValueOrClear::ClearTo(ce));
    }
    // a clear straddling the left boundary keeps its begin and insert
    // version; the original log entry still forgets it
    let begin_clear = data
        .vmap
        .latest()
        .last_less(&range.begin)
        .and_then(|(k, e)| match &e.val {
            ValueOrClear::ClearTo(ce) if ce.as_slice() > range.begin.as_slice() => {
                Some((k.clone(), e.insert_version))
            }
            _ => None,
        });
    if let Some((k, iv)) = begin_clear {
        data.vmap
            .insert_at(k, ValueOrClear::ClearTo(range.begin.clone()), iv);
    }
    data.vmap.erase_range(&range.begin, &range.end);
}

/// The assignment change handler: reshapes the shard map, persists the
/// assignment and availability boundaries through the mutation log, starts
/// or cancels fetches, and garbage-collects change feeds that lost their
/// last assigned coverage.
pub(crate) async fn change_server_keys(
    server: &Arc<StorageServer>,
    data: &mut MvccData,
    range: &KeyRange,
    now_assigned: bool,
    version: Version,
) -> Result<(), Error> {
    log::info!(
        "shard assignment change: {} now_assigned={} at {}",
        range,
        now_assigned,
        version
    );
    if now_assigned {
        let adding = AddingShard::new(range.clone());
        adding.fetch_version.store(version, Ordering::Release);
        let cancelled = {
            let mut shards = server.shards.write().unwrap();
            shards.replace_range(range, ShardState::Adding(adding.clone()))
        };
        for old in cancelled {
            old.cancel();
        }
        set_assigned_status(server, data, range, true);
        set_available_status(server, data, range, false);
        let physical_id = uuid::Uuid::new_v4().simple().to_string();
        server.shard_manager.add_range(range.clone(), &physical_id).await?;
        server
            .pending_mapping
            .lock()
            .unwrap()
            .push((range.clone(), true, version));
        crate::fetch::launch_fetch_for(server, adding);
    } else {
        let cancelled = {
            let mut shards = server.shards.write().unwrap();
            let cancelled = shards.replace_range(range, ShardState::NotAssigned);
            shards.coalesce(range);
            cancelled
        };
        for old in cancelled {
            old.cancel();
        }
        set_assigned_status(server, data, range, false);
        set_available_status(server, data, range, false);
        remove_data_range(data, range, &server.counters);
        server.byte_sample.apply_clear(&range.begin, &range.end);
        server
            .newest_unavailable
            .lock()
            .unwrap()
            .push((range.clone(), version));
        server
            .pending_mapping
            .lock()
            .unwrap()
            .push((range.clone(), false, version));

        // feeds with no assigned coverage left are torn down locally
        for feed in server.feeds.feeds_intersecting(range) {
            let feed_range = feed.read().await.range.clone();
            let still_covered = {
                let shards = server.shards.read().unwrap();
                shards
                    .intersecting(&feed_range)
                    .iter()
                    .any(|s| !s.state.not_assigned())
            };
            if !still_covered {
                let id = feed.read().await.id.clone();
                log::debug!(
                    "dropping change feed {} with no assigned coverage",
                    crate::util::printable(&id)
                );
                {
                    let mut f = feed.write().await;
                    f.removing = true;
                    f.wake_consumers();
                }
                server.feeds.detach(&id);
                let v = data.vmap.latest_version();
                let reg_key = feed_registration_key(&id);
                data.mlog.push(v, Mutation::clear_range(&reg_key, key_after(&reg_key)));
                data.mlog.push(
                    v,
                    Mutation::clear_range(feed_durable_key(&id, 0), feed_durable_key(&id, version)),
                );
            }
        }
    }
    Ok(())
}

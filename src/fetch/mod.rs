//! # Fetcher
//!
//! Moves a newly assigned shard onto this server: streams the range from a
//! peer at a pinned fetch version in bounded blocks, mirrors overlapping
//! change feeds, then hands its queued updates to the update pipeline,
//! which replays them at the transfer version it picks. Only after that
//! version is durable does the shard flip to read-write.
//!
//! Cancellation before the waiting phase erases every partial write; after
//! it, the assignment-change handler owns the cleanup and the fetcher just
//! leaves.

use crate::engine::{WriteBatch, WriteOptions};
use crate::err::Error;
use crate::err::Error::*;
use crate::feed::{encode_feed_entry, encode_feed_value, feed_durable_key, feed_registration_key, FeedStatus};
use crate::mlog::Mutation;
use crate::server::shards::{AddingPhase, AddingShard, ShardState};
use crate::server::{FetchInjection, StorageServer};
use crate::types::{Key, KeyRange, Version, INVALID_VERSION};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

const FETCH_RETRY_LIMIT: u32 = 5;

/// Recovery path: the range is durably assigned but unavailable, fetch it
/// again from scratch.
pub fn launch_fetch(server: &Arc<StorageServer>, range: KeyRange) {
    let adding = AddingShard::new(range.clone());
    adding
        .fetch_version
        .store(server.current_version(), Ordering::Release);
    let cancelled = {
        let mut shards = server.shards.write().unwrap();
        shards.replace_range(&range, ShardState::Adding(adding.clone()))
    };
    for old in cancelled {
        old.cancel();
    }
    launch_fetch_for(server, adding);
}

/// Spawns the fetch task for an adding shard already present in the map
pub fn launch_fetch_for(server: &Arc<StorageServer>, adding: Arc<AddingShard>) {
    let server = server.clone();
    tokio::spawn(async move {
        server.counters.fetches_started.fetch_add(1, Ordering::Relaxed);
        match fetch_keys(&server, adding.clone()).await {
            Ok(()) => {}
            Err(err) => {
                log::error!("fetch of {} failed: {}", adding.range, err);
                abort_fetch(&server, &adding).await;
            }
        }
    });
}

async fn fetch_keys(server: &Arc<StorageServer>, adding: Arc<AddingShard>) -> Result<(), Error> {
    let range = adding.range.clone();
    let mut cancel = adding.cancelled();
    let assignment_version = adding.fetch_version.load(Ordering::Acquire);
    let peer = server
        .peer
        .read()
        .unwrap()
        .clone()
        .ok_or_else(|| PeerFetchFailed("no peer configured".into()))?;

    // any prior data for this range must be flushed (and its clear made
    // durable) before new bytes land under the same keys
    let last_unavailable = server
        .newest_unavailable
        .lock()
        .unwrap()
        .iter()
        .filter(|(r, _)| r.intersects(&range))
        .map(|(_, v)| *v)
        .max()
        .unwrap_or(0);
    tokio::select! {
        _ = server.durable_version.when_at_least(last_unavailable) => {}
        _ = cancel.changed() => return cancelled_cleanup(server, &adding).await,
    }

    let _slot = tokio::select! {
        permit = server.fetch_parallelism.clone().acquire_owned() => {
            permit.map_err(|_| PeerFetchFailed("fetch semaphore closed".into()))?
        }
        _ = cancel.changed() => return cancelled_cleanup(server, &adding).await,
    };

    let fetch_version = server.current_version().max(assignment_version);
    adding.fetch_version.store(fetch_version, Ordering::Release);
    {
        // updates at or below the fetch version are already covered by the
        // snapshot we are about to stream
        let mut queued = adding.queued.lock().unwrap();
        queued.retain(|u| u.version > fetch_version);
    }
    log::info!("fetching {} at version {}", range, fetch_version);

    let mut cursor: Key = range.begin.clone();
    let mut attempts: u32 = 0;
    let mut last_progress = Instant::now();
    let mut warned = false;
    loop {
        if last_progress.elapsed() > server.cfg.fetch_warn_after && !warned {
            log::warn!("fetch of {} has made no progress for a while", range);
            warned = true;
        }
        let remaining = KeyRange::new(&cursor, &range.end);
        if remaining.is_empty() {
            break;
        }
        let block = tokio::select! {
            block = peer.get_range_block(&remaining, fetch_version, server.cfg.fetch_block_bytes) => block,
            _ = cancel.changed() => return cancelled_cleanup(server, &adding).await,
        };
        let block = match block {
            Ok(block) => block,
            Err(err) if err.is_retryable() && attempts < FETCH_RETRY_LIMIT => {
                attempts += 1;
                log::warn!(
                    "fetch of {} retrying from {} after transient error: {}",
                    range,
                    crate::util::printable(&cursor),
                    err
                );
                tokio::time::sleep(std::time::Duration::from_millis(100 << attempts)).await;
                continue;
            }
            Err(err) => return Err(err),
        };
        attempts = 0;

        let block_bytes: usize = block.kvs.iter().map(|(k, v)| k.len() + v.len()).sum();
        if block_bytes > 0 {
            if !server.fetch_budget.try_acquire(block_bytes) {
                if cursor > range.begin {
                    // backpressure split: the completed prefix moves on to
                    // hand-off, the remainder refetches once memory frees up
                    return split_and_complete(server, &adding, assignment_version, fetch_version, cursor).await;
                }
                tokio::select! {
                    _ = server.fetch_budget.acquire(block_bytes) => {}
                    _ = cancel.changed() => return cancelled_cleanup(server, &adding).await,
                }
            }
            let mut batch = WriteBatch::new();
            for (k, v) in &block.kvs {
                let cf = server.shard_manager.locate(k).await.ok_or(ShardNotFound)?;
                batch.put(&cf, k, v);
                server.byte_sample.apply_set(k, v.len());
            }
            // sync per block keeps the waiting-phase durability wait trivial
            let write = server
                .shard_manager
                .engine()
                .write(batch, WriteOptions { sync: true })
                .await;
            server.fetch_budget.release(block_bytes);
            write?;
            server
                .counters
                .bytes_fetched
                .fetch_add(block_bytes as u64, Ordering::Relaxed);
            last_progress = Instant::now();
            warned = false;
        }
        match (block.more, block.kvs.last()) {
            (true, Some((last, _))) => cursor = crate::types::key_after(last),
            _ => break,
        }
    }

    complete_fetch(server, adding, fetch_version).await
}

/// Publishes the completed prefix as its own adding shard and enqueues a
/// fresh one for the remainder, which restarts from its new begin.
async fn split_and_complete(
    server: &Arc<StorageServer>,
    adding: &Arc<AddingShard>,
    assignment_version: Version,
    fetch_version: Version,
    at: Key,
) -> Result<(), Error> {
    log::info!(
        "splitting fetch of {} at {} under byte pressure",
        adding.range,
        crate::util::printable(&at)
    );
    let prefix = AddingShard::new(KeyRange::new(&adding.range.begin, &at));
    let remainder = AddingShard::new(KeyRange::new(&at, &adding.range.end));
    prefix.fetch_version.store(fetch_version, Ordering::Release);
    remainder.fetch_version.store(assignment_version, Ordering::Release);
    for update in adding.take_queued() {
        for (side, shard) in [(&prefix, &prefix.range), (&remainder, &remainder.range)] {
            let mutations: Vec<Mutation> = update
                .mutations
                .iter()
                .filter_map(|m| crate::update::clip_mutation(m, shard))
                .collect();
            if !mutations.is_empty() {
                let mut clipped = crate::mlog::VerUpdate::new(update.version);
                clipped.mutations = mutations;
                side.push_queued(clipped);
            }
        }
    }
    {
        let mut shards = server.shards.write().unwrap();
        // the original adding shard is superseded, not cancelled
        let _ = shards.replace_range(&prefix.range, ShardState::Adding(prefix.clone()));
        let _ = shards.replace_range(&remainder.range, ShardState::Adding(remainder.clone()));
    }
    launch_fetch_for(server, remainder);
    complete_fetch(server, prefix, fetch_version).await
}

/// The hand-off: change feeds, the injection handshake, the durability
/// wait, and the flip to read-write.
async fn complete_fetch(
    server: &Arc<StorageServer>,
    adding: Arc<AddingShard>,
    fetch_version: Version,
) -> Result<(), Error> {
    let range = adding.range.clone();
    let mut cancel = adding.cancelled();

    fetch_change_feeds(server, &adding, fetch_version).await?;

    // hand the queue to the update pipeline and learn the transfer version
    let _ = adding.phase.send(AddingPhase::Waiting);
    let queued = adding.take_queued();
    let (done_tx, done_rx) = oneshot::channel();
    server.fetch_injections.lock().await.push(FetchInjection {
        range: range.clone(),
        updates: queued,
        done: done_tx,
    });
    let transferred = tokio::select! {
        transferred = done_rx => transferred.map_err(|_| PeerFetchFailed("injection dropped".into()))?,
        _ = cancel.changed() => return Ok(()),
    };

    tokio::select! {
        _ = server.durable_version.when_at_least(transferred) => {}
        _ = cancel.changed() => return Ok(()),
    }

    let flipped = {
        let mut shards = server.shards.write().unwrap();
        shards.finish_adding(&adding, transferred)
    };
    if flipped {
        let mut data = server.data.write().await;
        crate::update::set_available_status(server, &mut data, &range, true);
        drop(data);
        server.durability_wake.notify_waiters();
        server.counters.fetches_completed.fetch_add(1, Ordering::Relaxed);
        log::info!("{} is read-write at transfer version {}", range, transferred);
    }
    Ok(())
}

/// Copies the history of every overlapping feed from the peer up to the
/// fetch version into durable storage, then tails the peer past it into
/// memory so the stream stays gap-free across the move.
async fn fetch_change_feeds(
    server: &Arc<StorageServer>,
    adding: &Arc<AddingShard>,
    fetch_version: Version,
) -> Result<(), Error> {
    let peer = server
        .peer
        .read()
        .unwrap()
        .clone()
        .ok_or_else(|| PeerFetchFailed("no peer configured".into()))?;
    let overlapping = peer.overlapping_change_feeds(&adding.range, fetch_version).await?;
    for remote in overlapping {
        let feed = match server.feeds.get(&remote.id) {
            Some(feed) => feed,
            None => {
                let feed = server
                    .feeds
                    .register(remote.id.clone(), remote.range.clone(), remote.empty_version);
                let marker = encode_feed_value(
                    &remote.range,
                    remote.empty_version + 1,
                    if remote.stopped { FeedStatus::Stop } else { FeedStatus::Create },
                );
                let mut data = server.data.write().await;
                let v = data.vmap.latest_version();
                data.mlog
                    .push(v, Mutation::set(feed_registration_key(&remote.id), marker));
                feed
            }
        };
        {
            let mut f = feed.write().await;
            f.stopped = remote.stopped;
        }

        // durable history below the fetch version
        let begin = {
            let f = feed.read().await;
            f.empty_version.max(remote.empty_version) + 1
        };
        let history = peer
            .change_feed_entries(&remote.id, begin, fetch_version + 1, &adding.range)
            .await;
        let history = match history {
            Ok(history) => history,
            Err(ChangeFeedNotRegistered) => {
                log::debug!(
                    "peer no longer carries feed {}, skipping",
                    crate::util::printable(&remote.id)
                );
                continue;
            }
            Err(err) => return Err(err),
        };
        let mut batch = WriteBatch::new();
        let mut max_durable = INVALID_VERSION;
        for entry in &history {
            if entry.mutations.is_empty() {
                continue;
            }
            batch.put(
                crate::consts::METADATA_SHARD_ID,
                feed_durable_key(&remote.id, entry.version),
                encode_feed_entry(entry),
            );
            max_durable = max_durable.max(entry.version);
        }
        if !batch.is_empty() {
            server
                .shard_manager
                .engine()
                .write(batch, WriteOptions { sync: true })
                .await?;
        }

        // memory tail past the fetch version, merged in version order
        let peer_head = peer.feed_version().await.unwrap_or(fetch_version);
        let tail = if peer_head > fetch_version {
            peer.change_feed_entries(&remote.id, fetch_version + 1, peer_head + 1, &adding.range)
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        {
            let mut f = feed.write().await;
            if max_durable != INVALID_VERSION && max_durable > f.durable_version {
                f.storage_version = max_durable;
                f.durable_version = max_durable;
            }
            for entry in tail {
                if entry.mutations.is_empty() {
                    continue;
                }
                let behind = f.mutations.back().map_or(false, |b| b.version >= entry.version);
                if !behind {
                    f.mutations.push_back(entry);
                }
            }
            f.wake_consumers();
        }
        server.feeds.mark_current(&remote.id);
        log::debug!(
            "fetched change feed {} through {}",
            crate::util::printable(&remote.id),
            fetch_version
        );
    }
    Ok(())
}

/// Pre-waiting cancellation: every partial write under the range is erased
/// and the byte sample forgets it. The shard map was already reshaped by
/// whoever cancelled us.
async fn cancelled_cleanup(server: &Arc<StorageServer>, adding: &Arc<AddingShard>) -> Result<(), Error> {
    log::info!("fetch of {} cancelled, erasing partial data", adding.range);
    erase_partial(server, &adding.range).await
}

/// Persistent fetch failure: the shard goes back to not-assigned and the
/// partial writes are deleted.
async fn abort_fetch(server: &Arc<StorageServer>, adding: &Arc<AddingShard>) {
    if adding.phase_now() == AddingPhase::Waiting {
        return;
    }
    {
        let mut shards = server.shards.write().unwrap();
        let cancelled = shards.replace_range(&adding.range, ShardState::NotAssigned);
        for old in cancelled {
            old.cancel();
        }
        shards.coalesce(&adding.range);
    }
    if let Err(err) = erase_partial(server, &adding.range).await {
        log::error!("failed to erase partial fetch of {}: {}", adding.range, err);
    }
}

async fn erase_partial(server: &Arc<StorageServer>, range: &KeyRange) -> Result<(), Error> {
    let mut batch = WriteBatch::new();
    for (sub, cf) in server.shard_manager.intersecting(range).await {
        if cf != crate::consts::METADATA_SHARD_ID {
            batch.delete_range(&cf, &sub.begin, &sub.end);
        }
    }
    if !batch.is_empty() {
        server
            .shard_manager
            .engine()
            .write(batch, WriteOptions { sync: true })
            .await?;
    }
    server.byte_sample.apply_clear(&range.begin, &range.end);
    Ok(())
}

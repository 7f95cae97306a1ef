//! Open-time restore of durable server state: shard assignment and
//! availability boundaries, change-feed registrations and their durable
//! tails, TSS labels, and the byte sample.

use crate::consts::{
    AVAILABLE_TRUE, METADATA_SHARD_ID, PERSIST_BYTE_SAMPLE_PREFIX, PERSIST_BYTE_SAMPLE_SAMPLE_PREFIX,
    PERSIST_FEED_PREFIX, PERSIST_LOG_PROTOCOL_KEY, PERSIST_PRIMARY_LOCALITY_KEY, PERSIST_SHARD_ASSIGNED_PREFIX,
    PERSIST_SHARD_AVAILABLE_PREFIX, PERSIST_TSS_PAIR_ID_KEY, PERSIST_TSS_QUARANTINE_KEY,
};
use crate::engine::IterOptions;
use crate::err::Error;
use crate::err::Error::*;
use crate::feed::{decode_feed_durable_key, decode_feed_value, feed_durable_key, FeedStatus};
use crate::server::shards::ShardState;
use crate::server::StorageServer;
use crate::types::{prefix_range, Key, KeyRange, Version, INVALID_VERSION};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

/// Ordered `(boundary key, flag)` records under `prefix`; intervals between
/// boundaries share the value of their left boundary.
async fn read_boundaries(server: &Arc<StorageServer>, prefix: &[u8]) -> Result<Vec<(Key, bool)>, Error> {
    let engine = server.shard_manager.engine();
    let range = prefix_range(prefix);
    let mut iter = engine.iter(METADATA_SHARD_ID, IterOptions::bounded(&range)).await?;
    let mut out = Vec::new();
    let mut entry = iter.seek(prefix).await?;
    while let Some(e) = entry {
        let boundary = e.key[prefix.len()..].to_vec();
        out.push((boundary, e.value == AVAILABLE_TRUE));
        entry = iter.next_entry().await?;
    }
    Ok(out)
}

fn flag_at(boundaries: &[(Key, bool)], key: &[u8]) -> bool {
    boundaries
        .iter()
        .rev()
        .find(|(b, _)| b.as_slice() <= key)
        .map(|(_, f)| *f)
        .unwrap_or(false)
}

pub async fn restore_durable_state(server: &Arc<StorageServer>) -> Result<(), Error> {
    let engine = server.shard_manager.engine();

    if let Some(pair) = engine.get(METADATA_SHARD_ID, PERSIST_TSS_PAIR_ID_KEY).await? {
        let pair = Uuid::from_slice(&pair).map_err(|_| Internal("malformed tss pair record".into()))?;
        *server.tss_pair.lock().unwrap() = Some(pair);
    }
    if engine
        .get(METADATA_SHARD_ID, PERSIST_TSS_QUARANTINE_KEY)
        .await?
        .is_some()
    {
        server.tss_quarantined.store(true, Ordering::Release);
    }
    if let Some(proto) = engine.get(METADATA_SHARD_ID, PERSIST_LOG_PROTOCOL_KEY).await? {
        if let Some(v) = crate::util::decode_version_be(&proto) {
            server.log_protocol.store(v, Ordering::Release);
        }
    }
    if let Some(loc) = engine
        .get(METADATA_SHARD_ID, PERSIST_PRIMARY_LOCALITY_KEY)
        .await?
    {
        if loc.len() == 8 {
            server
                .primary_locality
                .store(i64::from_be_bytes(loc.as_slice().try_into().unwrap()), Ordering::Release);
        }
    }

    restore_shard_states(server).await?;
    restore_feeds(server).await?;
    Ok(())
}

/// Rebuilds the server-side shard map from the assignment and availability
/// boundary records. Assigned and available ranges come back read-write;
/// assigned but unavailable ranges are queued for a fresh fetch.
async fn restore_shard_states(server: &Arc<StorageServer>) -> Result<(), Error> {
    let assigned = read_boundaries(server, PERSIST_SHARD_ASSIGNED_PREFIX).await?;
    let available = read_boundaries(server, PERSIST_SHARD_AVAILABLE_PREFIX).await?;

    let mut points: Vec<Key> = assigned.iter().map(|(k, _)| k.clone()).collect();
    points.extend(available.iter().map(|(k, _)| k.clone()));
    points.push(KeyRange::all().end);
    points.sort();
    points.dedup();

    let mut ready = 0usize;
    let mut refetch = 0usize;
    for pair in points.windows(2) {
        let range = KeyRange::new(&pair[0], &pair[1]);
        if range.is_empty() || !assigned.iter().any(|(b, _)| b.as_slice() <= range.begin.as_slice()) {
            continue;
        }
        if !flag_at(&assigned, &range.begin) {
            continue;
        }
        if flag_at(&available, &range.begin) {
            server
                .shards
                .write()
                .unwrap()
                .replace_range(&range, ShardState::ReadWrite);
            ready += 1;
        } else {
            server.pending_refetch.lock().unwrap().push(range);
            refetch += 1;
        }
    }
    {
        let mut shards = server.shards.write().unwrap();
        shards.coalesce(&KeyRange::all());
    }
    log::info!(
        "restored shard map: {} ranges read-write, {} queued for re-fetch",
        ready,
        refetch
    );
    Ok(())
}

async fn restore_feeds(server: &Arc<StorageServer>) -> Result<(), Error> {
    let engine = server.shard_manager.engine();
    let range = prefix_range(PERSIST_FEED_PREFIX);
    let mut iter = engine.iter(METADATA_SHARD_ID, IterOptions::bounded(&range)).await?;
    let mut entry = iter.seek(PERSIST_FEED_PREFIX).await?;
    let mut restored = 0usize;
    while let Some(e) = entry {
        let id = e.key[PERSIST_FEED_PREFIX.len()..].to_vec();
        let (feed_range, pop_version, status) = decode_feed_value(&e.value)?;
        let feed = server
            .feeds
            .register(id.clone(), feed_range, pop_version.saturating_sub(1));
        {
            let mut f = feed.write().await;
            f.stopped = status == FeedStatus::Stop;
            f.durable_version = durable_feed_tail(server, &id).await?;
            f.storage_version = f.durable_version;
        }
        restored += 1;
        entry = iter.next_entry().await?;
    }
    if restored > 0 {
        log::info!("restored {} change feeds", restored);
    }
    Ok(())
}

/// Largest durably mirrored version of a feed, if any entries exist
async fn durable_feed_tail(server: &Arc<StorageServer>, id: &[u8]) -> Result<Version, Error> {
    let engine = server.shard_manager.engine();
    let lo = feed_durable_key(id, 0);
    let hi = feed_durable_key(id, u64::MAX);
    let mut iter = engine
        .iter(
            METADATA_SHARD_ID,
            IterOptions {
                lower_bound: Some(lo),
                upper_bound: Some(hi.clone()),
            },
        )
        .await?;
    match iter.seek_for_prev(&hi).await? {
        Some(e) => Ok(decode_feed_durable_key(&e.key, id).unwrap_or(INVALID_VERSION)),
        None => Ok(INVALID_VERSION),
    }
}

/// Background rebuild of the byte sample from its persisted form. The
/// sample-of-sample entries exist to let this scan report progress in
/// bounded chunks; they are skipped as data.
pub async fn restore_byte_sample(server: &Arc<StorageServer>) -> Result<(), Error> {
    let engine = server.shard_manager.engine();
    let range = prefix_range(PERSIST_BYTE_SAMPLE_PREFIX);
    let mut iter = engine.iter(METADATA_SHARD_ID, IterOptions::bounded(&range)).await?;
    let mut entry = iter.seek(PERSIST_BYTE_SAMPLE_PREFIX).await?;
    let mut restored = 0usize;
    while let Some(e) = entry {
        if e.key.starts_with(PERSIST_BYTE_SAMPLE_SAMPLE_PREFIX) {
            entry = iter.next_entry().await?;
            continue;
        }
        let key = e.key[PERSIST_BYTE_SAMPLE_PREFIX.len()..].to_vec();
        if let Some(bytes) = crate::util::decode_version_be(&e.value) {
            server.byte_sample.restore(key, bytes);
        }
        restored += 1;
        if restored % 1024 == 0 {
            tokio::task::yield_now().await;
        }
        entry = iter.next_entry().await?;
    }
    if restored > 0 {
        log::debug!("byte sample rebuilt from {} persisted entries", restored);
    }
    Ok(())
}

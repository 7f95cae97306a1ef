//! # Peer storage servers
//!
//! The contract the fetcher requires from its peers: bounded range blocks
//! at a pinned version, change-feed history, and the overlapping-feeds
//! query used on shard moves. `LoopbackPeer` adapts a local server to the
//! trait so fetch paths can be exercised fully in-process.

use crate::err::Error;
use crate::feed::{FeedStreamReply, MutationsAndVersion};
use crate::read;
use crate::server::StorageServer;
use crate::types::{FeedId, Key, KeyRange, Value, Version};
use async_trait::async_trait;
use std::sync::Arc;

/// One bounded block of a range fetch
#[derive(Clone, Debug, Default)]
pub struct RangeBlock {
    pub kvs: Vec<(Key, Value)>,
    /// More data exists past the last returned key
    pub more: bool,
}

#[derive(Clone, Debug)]
pub struct OverlappingFeed {
    pub id: FeedId,
    pub range: KeyRange,
    pub empty_version: Version,
    pub stopped: bool,
}

#[async_trait]
pub trait PeerReads: Send + Sync {
    /// Keys in `range` at `version`, starting at `range.begin`, up to
    /// roughly `byte_limit` bytes
    async fn get_range_block(&self, range: &KeyRange, version: Version, byte_limit: usize)
        -> Result<RangeBlock, Error>;

    /// Feeds whose range intersects `range` and whose data reaches back to
    /// `min_version`
    async fn overlapping_change_feeds(
        &self,
        range: &KeyRange,
        min_version: Version,
    ) -> Result<Vec<OverlappingFeed>, Error>;

    /// Feed entries with version in `[begin, end)`, filtered to `range`
    async fn change_feed_entries(
        &self,
        id: &[u8],
        begin: Version,
        end: Version,
        range: &KeyRange,
    ) -> Result<Vec<MutationsAndVersion>, Error>;

    /// The peer's current version, used to bound feed catch-up
    async fn feed_version(&self) -> Result<Version, Error>;
}

/// The peer of a range that has never lived anywhere: every block is
/// empty and no feeds overlap. Used when bootstrapping a fresh keyspace
/// and by tests.
pub struct EmptyPeer;

impl EmptyPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl PeerReads for EmptyPeer {
    async fn get_range_block(
        &self,
        _range: &KeyRange,
        _version: Version,
        _byte_limit: usize,
    ) -> Result<RangeBlock, Error> {
        Ok(RangeBlock::default())
    }

    async fn overlapping_change_feeds(
        &self,
        _range: &KeyRange,
        _min_version: Version,
    ) -> Result<Vec<OverlappingFeed>, Error> {
        Ok(Vec::new())
    }

    async fn change_feed_entries(
        &self,
        _id: &[u8],
        _begin: Version,
        _end: Version,
        _range: &KeyRange,
    ) -> Result<Vec<MutationsAndVersion>, Error> {
        Err(Error::ChangeFeedNotRegistered)
    }

    async fn feed_version(&self) -> Result<Version, Error> {
        Ok(0)
    }
}

/// A peer backed by another in-process server
pub struct LoopbackPeer {
    server: Arc<StorageServer>,
}

impl LoopbackPeer {
    pub fn new(server: Arc<StorageServer>) -> Arc<Self> {
        Arc::new(Self { server })
    }
}

#[async_trait]
impl PeerReads for LoopbackPeer {
    async fn get_range_block(
        &self,
        range: &KeyRange,
        version: Version,
        byte_limit: usize,
    ) -> Result<RangeBlock, Error> {
        // fetch-serving reads admit through their own semaphore so bulk
        // shard movement cannot starve client reads
        let _permit = self
            .server
            .fetch_read_sem
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::ServerOverloaded)?;
        let reply = read::get_range(
            &self.server,
            &range.begin,
            &range.end,
            i64::MAX,
            byte_limit,
            version,
        )
        .await?;
        Ok(RangeBlock {
            kvs: reply.rows,
            more: reply.more,
        })
    }

    async fn overlapping_change_feeds(
        &self,
        range: &KeyRange,
        min_version: Version,
    ) -> Result<Vec<OverlappingFeed>, Error> {
        let found = crate::feed::overlapping_change_feeds(&self.server, range, min_version).await;
        Ok(found
            .into_iter()
            .map(|f| OverlappingFeed {
                id: f.id,
                range: f.range,
                empty_version: f.empty_version,
                stopped: f.stopped,
            })
            .collect())
    }

    async fn change_feed_entries(
        &self,
        id: &[u8],
        begin: Version,
        end: Version,
        range: &KeyRange,
    ) -> Result<Vec<MutationsAndVersion>, Error> {
        let reply: FeedStreamReply = crate::feed::get_feed_mutations(
            &self.server,
            id,
            begin,
            end,
            Some(range),
            usize::MAX,
        )
        .await?;
        Ok(reply.entries)
    }

    async fn feed_version(&self) -> Result<Version, Error> {
        Ok(self.server.current_version())
    }
}

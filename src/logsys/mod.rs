//! # Log cursor
//!
//! The contract the update pipeline requires from the replicated log, plus
//! an in-process implementation used by tests and simulation drivers. The
//! external log never reorders and only gaps across known epoch ends; a
//! cursor popped past the data a reader still needs surfaces
//! `WorkerRemoved`.

use crate::err::Error;
use crate::err::Error::*;
use crate::mlog::{Mutation, VerUpdate};
use crate::types::Version;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

#[async_trait]
pub trait LogCursor: Send + Sync {
    /// Waits for and returns the first batch with version strictly above
    /// `after`. Fails with `WorkerRemoved` when the log has been popped
    /// past `after` and the data is gone.
    async fn next_batch(&self, after: Version) -> Result<VerUpdate, Error>;

    /// Releases everything at or below `up_to`
    async fn pop(&self, up_to: Version);

    /// Largest version the sequencer is known to have committed
    fn known_committed_version(&self) -> Version;

    /// Identity of the node the cursor currently peeks from
    fn peek_location(&self) -> Uuid;
}

struct MemoryLogState {
    entries: BTreeMap<Version, Vec<Mutation>>,
    popped_to: Version,
    committed: Version,
}

/// In-process ordered log. Tests push version batches; the cursor side
/// implements the full [`LogCursor`] contract including pop semantics.
pub struct MemoryLog {
    state: Mutex<MemoryLogState>,
    tail: watch::Sender<Version>,
    location: Uuid,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        let (tail, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(MemoryLogState {
                entries: BTreeMap::new(),
                popped_to: 0,
                committed: 0,
            }),
            tail,
            location: Uuid::new_v4(),
        })
    }

    /// Appends a batch at `version` and marks it committed
    pub fn push(&self, version: Version, mutations: Vec<Mutation>) {
        {
            let mut state = self.state.lock().unwrap();
            assert!(version > state.committed, "log versions must be monotonic");
            state.entries.insert(version, mutations);
            state.committed = version;
        }
        let _ = self.tail.send(version);
    }

    /// An empty batch; advances the version frontier without mutations
    pub fn push_empty(&self, version: Version) {
        self.push(version, Vec::new());
    }

    pub fn cursor(self: &Arc<Self>) -> Arc<dyn LogCursor> {
        self.clone()
    }
}

#[async_trait]
impl LogCursor for MemoryLog {
    async fn next_batch(&self, after: Version) -> Result<VerUpdate, Error> {
        let mut rx = self.tail.subscribe();
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.popped_to > after {
                    return Err(WorkerRemoved);
                }
                if let Some((version, mutations)) = state
                    .entries
                    .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                    .next()
                {
                    return Ok(VerUpdate {
                        version: *version,
                        mutations: mutations.clone(),
                    });
                }
            }
            if rx.changed().await.is_err() {
                return Err(LogCursorFailed("memory log dropped".into()));
            }
        }
    }

    async fn pop(&self, up_to: Version) {
        let mut state = self.state.lock().unwrap();
        if up_to > state.popped_to {
            state.popped_to = up_to;
            state.entries = state.entries.split_off(&(up_to + 1));
        }
    }

    fn known_committed_version(&self) -> Version {
        self.state.lock().unwrap().committed
    }

    fn peek_location(&self) -> Uuid {
        self.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cursor_delivers_in_order() {
        let log = MemoryLog::new();
        log.push(10, vec![Mutation::set(b"a", b"1")]);
        log.push(20, vec![Mutation::set(b"b", b"2")]);
        let cursor = log.cursor();
        let b1 = cursor.next_batch(0).await.unwrap();
        assert_eq!(b1.version, 10);
        let b2 = cursor.next_batch(b1.version).await.unwrap();
        assert_eq!(b2.version, 20);
        assert_eq!(cursor.known_committed_version(), 20);
    }

    #[tokio::test]
    async fn test_cursor_blocks_until_push() {
        let log = MemoryLog::new();
        let cursor = log.cursor();
        let waiter = tokio::spawn(async move { cursor.next_batch(0).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        log.push(5, vec![]);
        let got = tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.version, 5);
    }

    #[tokio::test]
    async fn test_popped_past_means_removed() {
        let log = MemoryLog::new();
        log.push(10, vec![]);
        log.push(20, vec![]);
        log.cursor().pop(15).await;
        let res = log.cursor().next_batch(5).await;
        assert!(matches!(res, Err(Error::WorkerRemoved)));
        let ok = log.cursor().next_batch(15).await.unwrap();
        assert_eq!(ok.version, 20);
    }
}

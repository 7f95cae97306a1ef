//! Stratadb is the core of a sharded, versioned key-value storage server.
//!
//! ## Introduction
//!
//! A stratadb server owns a set of contiguous key ranges (shards) and serves
//! multi-version reads over them. Incoming mutations arrive through an ordered
//! replicated log; the update pipeline applies them to an in-memory versioned
//! map, the durability loop drains them into a persistent LSM-style engine,
//! and the read path answers `get_value` / `get_key` / `get_range` /
//! `get_mapped_range` requests at any version inside the MVCC window. Named
//! change feeds expose a lazy, range-scoped stream of mutations to external
//! consumers, and watches fire when a key's value ceases to hold.
//!
//! The crate deliberately stops at the storage core: the replication
//! protocol, the transaction commit path, and the shard rebalancer are
//! collaborators reached through the narrow traits in [`logsys`] and [`peer`].
//!
//! ### Features
//! - [x] Multi-version reads over a copy-on-write ordered map
//! - [x] Persistent column-family engine with WAL, flush and compaction
//! - [x] Shard lifecycle: assign, fetch from peers, become read-write
//! - [x] Change feeds with durable truncation (pop) and lazy streaming
//! - [x] Key watches with coalescing and a memory budget
//! - [x] Crash recovery from the engine's durable state
//!
//! ### It is not:
//! - A network server (transport is a hosting-process concern)
//! - A transaction resolver
//!
//! # Basic usage
//!
//! ```ignore
//! use stratadb::logsys::MemoryLog;
//! use stratadb::server::StorageServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let dir = tempfile::tempdir().unwrap();
//!     let log = MemoryLog::new();
//!     let server = StorageServer::open(dir.path(), Default::default()).await.unwrap();
//!     server.clone().start(log.cursor());
//!     // assign shards and feed the log, then read:
//!     // server.get_value(b"hello", version).await
//! }
//! ```

mod cfg;
mod consts;
pub mod durable;
pub mod engine;
mod err;
pub mod feed;
pub mod fetch;
pub mod logsys;
mod mlog;
pub mod peer;
pub mod read;
mod sample;
pub mod server;
pub mod shard;
mod tests;
mod types;
pub mod update;
mod util;
mod vmap;
mod watch;

pub use cfg::Config;
pub use err::Error;
pub use mlog::{AtomicOp, Mutation, VerUpdate};
pub use types::{Key, KeyRange, Value, Version};

use std::{io, path::PathBuf};
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested range is not owned readably at the captured shard change counter
    #[error("Request routed to the wrong shard server")]
    WrongShardServer,

    /// Requested version is below the oldest queryable version
    #[error("Transaction is too old to be read, version `{requested}` < oldest `{oldest}`")]
    TransactionTooOld { requested: u64, oldest: u64 },

    /// Requested version is above the current version after the future-version timeout
    #[error("Request for future version `{requested}`, current `{current}`")]
    FutureVersion { requested: u64, current: u64 },

    /// A deadline was exceeded on an engine operation
    #[error("Operation timed out")]
    TimedOut,

    /// Read or fetch semaphores are past their hard mark
    #[error("Server is overloaded, rejecting new work")]
    ServerOverloaded,

    /// Watch was dropped because the watch byte budget was exhausted
    #[error("Watch cancelled due to memory pressure")]
    WatchCancelled,

    /// No change feed is registered under the given id
    #[error("Unknown change feed")]
    UnknownChangeFeed,

    /// Change feed was not yet registered on the peer, fetch should retry
    #[error("Change feed not registered")]
    ChangeFeedNotRegistered,

    /// A change feed stream reached its end version
    #[error("End of stream")]
    EndOfStream,

    /// The mapper template referenced a tuple index outside the row
    #[error("Mapped range template index out of bounds: `{0}`")]
    MapperBadIndex(String),

    /// The `{...}` range descriptor appeared anywhere but the last template part
    #[error("Mapped range descriptor misplaced in template")]
    MapperBadRangeDescriptor,

    /// A secondary lookup during a mapped range exceeded its fan-out limit
    #[error("Secondary range lookup has more results than the fan-out limit")]
    QuickGetKeyValuesHasMore,

    /// Local secondary value lookup missed and remote fallback is not available
    #[error("Secondary value lookup miss")]
    QuickGetValueMiss,

    /// Local secondary range lookup missed and remote fallback is not available
    #[error("Secondary range lookup miss")]
    QuickGetKeyValuesMiss,

    /// Our tag was reassigned or this server was removed from the cluster
    #[error("Worker removed from cluster")]
    WorkerRemoved,

    /// A rollback or reboot marker requires an orderly process restart
    #[error("Server must reboot and recover from disk")]
    PleaseReboot,

    /// Shard map or versioned map invariant violation
    #[error("Internal invariant violated: {0}")]
    Internal(String),

    /// The engine reported corrupted on-disk state
    #[error("Corrupt file `{path}`: {reason}")]
    FileCorrupt { path: PathBuf, reason: String },

    /// An IO error surfaced from the engine
    #[error("IO error: {0}")]
    IoError(#[source] io::Error),

    /// The store directory does not carry a format record this build can open
    #[error("Unsupported store format `{found}`")]
    UnsupportedFormat { found: String },

    /// The durable cluster id does not match the cluster this process joined
    #[error("Cluster id mismatch: durable `{durable}`, joined `{joined}`")]
    ClusterIdMismatch { durable: String, joined: String },

    /// There was an error while creating a directory
    #[error("Failed to create directory `{path}`: {error}")]
    DirCreationError {
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    /// There was an error while opening a file
    #[error("Failed to open file `{path}`: {error}")]
    FileOpenError {
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    /// There was an error while attempting to read a file
    #[error("Failed to read file `{path}`: {error}")]
    FileReadError { path: PathBuf, error: io::Error },

    /// There was an error while attempting to write to a file
    #[error("Failed to write to file `{path}`: {error}")]
    FileWriteError { path: PathBuf, error: io::Error },

    /// There was an error while attempting to sync writes to a file
    #[error("Failed to sync writes to file: {error}")]
    FileSyncError { error: io::Error },

    /// There was an error while attempting to seek in a file
    #[error("File seek error")]
    FileSeekError(#[source] io::Error),

    /// There was an error while attempting to remove a file or directory
    #[error("Failed to remove `{path}`: {error}")]
    FileRemoveError { path: PathBuf, error: io::Error },

    #[error("Failed to get file metadata")]
    GetFileMetaDataError(#[source] io::Error),

    /// Unexpected end of file while reading
    #[error("File read ended unexpectedly")]
    UnexpectedEOF(#[source] io::Error),

    /// The named column family does not exist
    #[error("Unknown column family `{0}`")]
    UnknownColumnFamily(String),

    /// The named column family already exists
    #[error("Column family `{0}` already exists")]
    ColumnFamilyExists(String),

    /// A write batch referenced a column family pending deletion
    #[error("Column family `{0}` is pending deletion")]
    ColumnFamilyDeletePending(String),

    /// No shard in the mapping owns the key
    #[error("No physical shard owns the written key")]
    ShardNotFound,

    /// Error joining tokio tasks
    #[error("Error joining tokio task. error: `{error}`, context: `{context}`")]
    TokioTaskJoinError { error: JoinError, context: String },

    /// The peer ended a fetch stream before the range was complete
    #[error("Peer fetch failed: {0}")]
    PeerFetchFailed(String),

    /// The log cursor failed underneath us
    #[error("Log cursor error: {0}")]
    LogCursorFailed(String),
}

impl Error {
    /// True for errors that tear the whole server down rather than a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::WorkerRemoved | Error::PleaseReboot | Error::FileCorrupt { .. } | Error::IoError(_)
        )
    }

    /// True for errors a caller may retry at the request boundary.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WrongShardServer | Error::TimedOut | Error::ServerOverloaded | Error::ChangeFeedNotRegistered
        )
    }
}

/// Everything at or above this single byte is system keyspace
pub const SYSTEM_KEYS_BEGIN: &[u8] = b"\xff";

/// Private records (shard assignment, feed metadata, rollback markers) live
/// under this sub-prefix of the system keyspace
pub const PRIVATE_PREFIX: &[u8] = b"\xff\xff";

/// Exclusive end of the keyspace the shard map covers
pub const ALL_KEYS_END: &[u8] = b"\xff\xff";

/// Absolute ceiling used when a prefix range cannot be bumped
pub const ALL_KEYS_MAX: &[u8] = b"\xff\xff\xff\xff";

// ---- Durable metadata records, all written to the metadata shard ----

pub const PERSIST_FORMAT_KEY: &[u8] = b"\xff\xffFormat";

pub const PERSIST_FORMAT_VALUE: &[u8] = b"stratadb/StorageServer/1";

/// Formats this build is able to open
pub const PERSIST_FORMAT_READABLE: &[&[u8]] = &[b"stratadb/StorageServer/1"];

pub const PERSIST_ID_KEY: &[u8] = b"\xff\xffID";

pub const PERSIST_CLUSTER_ID_KEY: &[u8] = b"\xff\xffclusterId";

pub const PERSIST_TSS_PAIR_ID_KEY: &[u8] = b"\xff\xfftssPairID";

pub const PERSIST_TSS_QUARANTINE_KEY: &[u8] = b"\xff\xfftssQ";

/// `durableVersion` at the last committed batch
pub const PERSIST_VERSION_KEY: &[u8] = b"\xff\xffVersion";

pub const PERSIST_LOG_PROTOCOL_KEY: &[u8] = b"\xff\xffLogProtocol";

pub const PERSIST_PRIMARY_LOCALITY_KEY: &[u8] = b"\xff\xffPrimaryLocality";

/// Boundary records: `"0"` / `"1"`, intervals share the value of the left boundary
pub const PERSIST_SHARD_ASSIGNED_PREFIX: &[u8] = b"\xff\xffShardAssigned/";

pub const PERSIST_SHARD_AVAILABLE_PREFIX: &[u8] = b"\xff\xffShardAvailable/";

/// Byte-sample map
pub const PERSIST_BYTE_SAMPLE_PREFIX: &[u8] = b"\xff\xffBS/";

/// Sample of the byte sample, used to parallelise the restart rebuild
pub const PERSIST_BYTE_SAMPLE_SAMPLE_PREFIX: &[u8] = b"\xff\xffBS/\xff\xffBS/";

/// Change-feed registration records, one per feed id
pub const PERSIST_FEED_PREFIX: &[u8] = b"\xff\xffRF/";

/// Durable change-feed entries: prefix + feedId + `\x00` + big-endian version
pub const PERSIST_FEED_DURABLE_PREFIX: &[u8] = b"\xff\xffCF/";

/// Ordered `(beginKey -> physical shard id | "")` boundary records
pub const SHARD_MAPPING_PREFIX: &[u8] = b"\xff\xffShardMapping/";

// ---- Private mutations arriving through the log ----

pub const PRIV_SERVER_KEYS_PREFIX: &[u8] = b"\xff\xffServerKeys/";

pub const PRIV_SERVER_TAG_PREFIX: &[u8] = b"\xff\xffServerTag/";

pub const PRIV_FEED_PREFIX: &[u8] = b"\xff\xffFeed/";

pub const PRIV_ROLLBACK_KEY: &[u8] = b"\xff\xffRollback";

pub const PRIV_REBOOT_KEY: &[u8] = b"\xff\xffRebootWhenDurable";

pub const PRIV_PRIMARY_LOCALITY_KEY: &[u8] = b"\xff\xffPrimaryLocality";

pub const PRIV_LOG_PROTOCOL_KEY: &[u8] = b"\xff\xffLogProtocol";

pub const PRIV_TSS_MAPPING_PREFIX: &[u8] = b"\xff\xffTssMapping/";

pub const PRIV_TSS_QUARANTINE_PREFIX: &[u8] = b"\xff\xffTssQuarantine/";

/// Boundary value marking an assigned interval
pub const SERVER_KEYS_ASSIGNED: &[u8] = b"1";

/// Boundary value marking an unassigned interval
pub const SERVER_KEYS_UNASSIGNED: &[u8] = b"0";

pub const AVAILABLE_TRUE: &[u8] = b"1";

pub const AVAILABLE_FALSE: &[u8] = b"0";

// ---- Engine layout ----

pub const METADATA_SHARD_ID: &str = "meta";

pub const WAL_FILE_PREFIX: &str = "wal";

pub const RUN_FILE_PREFIX: &str = "run";

pub const RUN_FILE_SUFFIX: &str = "sst";

/// 4KB
pub const BLOCK_SIZE: usize = 4 * 1024;

pub const TABLE_MAGIC: u32 = 0x5354_4254; // "STBT"

pub const WAL_MAGIC: u32 = 0x5354_574C; // "STWL"

// ---- Versioning ----

/// How far the MVCC read window trails the current version
pub const MAX_READ_TRANSACTION_LIFE_VERSIONS: u64 = 5_000_000;

/// Version tokens handed out per wall-clock second by the sequencer
pub const VERSIONS_PER_SECOND: u64 = 1_000_000;

// ---- Default knob values (see `cfg::Config`) ----

pub const KB: usize = 1024;

/// 4MB
pub const DEFAULT_MEMTABLE_BYTES: usize = 4 * KB * KB;

/// 64MB
pub const DEFAULT_BLOCK_CACHE_BYTES: usize = 64 * KB * KB;

pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Byte budget the durability loop spends per cycle before committing
pub const DEFAULT_DURABILITY_BUDGET_BYTES: usize = 8 * KB * KB;

/// Hard ceiling on `bytes_input - bytes_durable` before the update
/// pipeline stops reading the log
pub const DEFAULT_QUEUE_HARD_BYTES: usize = 32 * KB * KB;

/// Allowance past the ceiling so the durability loop can always commit at
/// least one batch between brake activations
pub const DEFAULT_QUEUE_OVERAGE_BYTES: usize = 4 * KB * KB;

pub const DEFAULT_FETCH_PARALLELISM: usize = 4;

/// 16MB budget shared by all in-flight fetches
pub const DEFAULT_FETCH_BYTES_BUDGET: usize = 16 * KB * KB;

/// Bytes streamed from a peer per fetch block
pub const DEFAULT_FETCH_BLOCK_BYTES: usize = 512 * KB;

pub const DEFAULT_READ_QUEUE_SOFT: usize = 500;

pub const DEFAULT_READ_QUEUE_HARD: usize = 1000;

pub const DEFAULT_FETCH_QUEUE_SOFT: usize = 100;

pub const DEFAULT_FETCH_QUEUE_HARD: usize = 200;

/// 1s; how long a read waits for a future version before `FutureVersion`
pub const DEFAULT_FUTURE_VERSION_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

/// 10 min watch deadline
pub const DEFAULT_WATCH_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(10 * 60 * 1000);

/// 100MB of watch records before new watches are cancelled
pub const DEFAULT_WATCH_BYTES_BUDGET: usize = 100 * KB * KB;

/// Delay between durability-loop cycles
pub const DEFAULT_DURABILITY_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

/// Delay between compaction scans
pub const DEFAULT_COMPACTION_INTERVAL: std::time::Duration = std::time::Duration::from_millis(60 * 1000);

/// A fetch silent for this long logs a warning
pub const DEFAULT_FETCH_WARN_AFTER: std::time::Duration = std::time::Duration::from_millis(60 * 1000);

/// Rows returned per range-stream chunk
pub const DEFAULT_STREAM_CHUNK_ROWS: usize = 1000;

/// Byte ceiling per range-stream chunk
pub const DEFAULT_STREAM_CHUNK_BYTES: usize = 256 * KB;

/// Secondary lookups per mapped-range row before `QuickGetKeyValuesHasMore`
pub const DEFAULT_MAPPED_RANGE_FANOUT: usize = 100;

pub const DEFAULT_BYTE_SAMPLING_FACTOR: usize = 250;

pub const DEFAULT_BYTE_SAMPLING_OVERHEAD: usize = 100;

/// Values longer than this are always sampled
pub const BYTE_SAMPLE_ALWAYS_BYTES: usize = 4096;

/// Largest value an atomic `AppendIfFits` may produce
pub const VALUE_SIZE_LIMIT: usize = 100_000;

/// Feed stream replies carry at most this many bytes per message
pub const DEFAULT_FEED_STREAM_BYTES: usize = 512 * KB;

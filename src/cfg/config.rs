use crate::consts::{
    DEFAULT_BLOCK_CACHE_BYTES, DEFAULT_BYTE_SAMPLING_FACTOR, DEFAULT_BYTE_SAMPLING_OVERHEAD,
    DEFAULT_COMPACTION_INTERVAL, DEFAULT_DURABILITY_BUDGET_BYTES, DEFAULT_DURABILITY_INTERVAL,
    DEFAULT_FALSE_POSITIVE_RATE, DEFAULT_FEED_STREAM_BYTES, DEFAULT_FETCH_BLOCK_BYTES, DEFAULT_FETCH_BYTES_BUDGET,
    DEFAULT_FETCH_PARALLELISM, DEFAULT_FETCH_QUEUE_HARD, DEFAULT_FETCH_QUEUE_SOFT, DEFAULT_FETCH_WARN_AFTER,
    DEFAULT_FUTURE_VERSION_TIMEOUT, DEFAULT_MAPPED_RANGE_FANOUT, DEFAULT_MEMTABLE_BYTES, DEFAULT_QUEUE_HARD_BYTES,
    DEFAULT_QUEUE_OVERAGE_BYTES, DEFAULT_READ_QUEUE_HARD, DEFAULT_READ_QUEUE_SOFT, DEFAULT_STREAM_CHUNK_BYTES,
    DEFAULT_STREAM_CHUNK_ROWS, DEFAULT_WATCH_BYTES_BUDGET, DEFAULT_WATCH_TIMEOUT,
};
use std::time::Duration;

#[derive(Clone, Debug)]
/// Configuration options for the storage server core. The hosting process
/// fills this once at construction; there is no global knob registry.
pub struct Config {
    /// Size of each engine memtable before it freezes and flushes
    pub memtable_bytes: usize,

    /// Block cache budget shared by table readers
    pub block_cache_bytes: usize,

    /// False positive rate for per-run bloom filters. The lower the value,
    /// the more accurate, but it incurs extra cost on the CPU.
    pub false_positive_rate: f64,

    /// Bytes the durability loop writes per cycle before it commits,
    /// even if more versions are eligible
    pub durability_budget_bytes: usize,

    /// Delay between durability-loop cycles
    pub durability_interval: Duration,

    /// Hard ceiling on `bytes_input - bytes_durable` (the emergency brake)
    pub queue_hard_bytes: usize,

    /// Allowance past the ceiling guaranteeing forward progress
    pub queue_overage_bytes: usize,

    /// Concurrent shard fetches per process
    pub fetch_parallelism: usize,

    /// Byte budget shared by in-flight fetches; exceeding it parks fetchers
    pub fetch_bytes_budget: usize,

    /// Bytes streamed from a peer per fetch block
    pub fetch_block_bytes: usize,

    /// Log a warning when a fetch makes no progress for this long
    pub fetch_warn_after: Duration,

    /// Read admission: queue past soft mark sheds load, past hard mark fails
    /// with `ServerOverloaded`
    pub read_queue_soft: usize,
    pub read_queue_hard: usize,

    /// Fetch-read admission marks
    pub fetch_queue_soft: usize,
    pub fetch_queue_hard: usize,

    /// How far the MVCC read window trails the current version; memory is
    /// only forgotten (and durability only advances) below this distance
    pub read_window_versions: u64,

    /// How long a read waits for a not-yet-arrived version
    pub future_version_timeout: Duration,

    /// Watch deadline; elapsed watches reply with the current value check
    pub watch_timeout: Duration,

    /// Total bytes of watch records before new watches get `WatchCancelled`
    pub watch_bytes_budget: usize,

    /// Delay between engine compaction scans
    pub compaction_interval: Duration,

    /// Rows per `get_range_stream` chunk
    pub stream_chunk_rows: usize,

    /// Bytes per `get_range_stream` chunk
    pub stream_chunk_bytes: usize,

    /// Secondary lookups allowed per mapped-range row
    pub mapped_range_fanout: usize,

    /// Byte-sampling factor: roughly one of this many bytes is sampled
    pub byte_sampling_factor: usize,

    /// Per-entry overhead added before the sampling coin flip
    pub byte_sampling_overhead: usize,

    /// Bytes per change-feed stream reply
    pub feed_stream_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            memtable_bytes: DEFAULT_MEMTABLE_BYTES,
            block_cache_bytes: DEFAULT_BLOCK_CACHE_BYTES,
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            durability_budget_bytes: DEFAULT_DURABILITY_BUDGET_BYTES,
            durability_interval: DEFAULT_DURABILITY_INTERVAL,
            queue_hard_bytes: DEFAULT_QUEUE_HARD_BYTES,
            queue_overage_bytes: DEFAULT_QUEUE_OVERAGE_BYTES,
            fetch_parallelism: DEFAULT_FETCH_PARALLELISM,
            fetch_bytes_budget: DEFAULT_FETCH_BYTES_BUDGET,
            fetch_block_bytes: DEFAULT_FETCH_BLOCK_BYTES,
            fetch_warn_after: DEFAULT_FETCH_WARN_AFTER,
            read_queue_soft: DEFAULT_READ_QUEUE_SOFT,
            read_queue_hard: DEFAULT_READ_QUEUE_HARD,
            fetch_queue_soft: DEFAULT_FETCH_QUEUE_SOFT,
            fetch_queue_hard: DEFAULT_FETCH_QUEUE_HARD,
            read_window_versions: crate::consts::MAX_READ_TRANSACTION_LIFE_VERSIONS,
            future_version_timeout: DEFAULT_FUTURE_VERSION_TIMEOUT,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            watch_bytes_budget: DEFAULT_WATCH_BYTES_BUDGET,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            stream_chunk_rows: DEFAULT_STREAM_CHUNK_ROWS,
            stream_chunk_bytes: DEFAULT_STREAM_CHUNK_BYTES,
            mapped_range_fanout: DEFAULT_MAPPED_RANGE_FANOUT,
            byte_sampling_factor: DEFAULT_BYTE_SAMPLING_FACTOR,
            byte_sampling_overhead: DEFAULT_BYTE_SAMPLING_OVERHEAD,
            feed_stream_bytes: DEFAULT_FEED_STREAM_BYTES,
        }
    }
}

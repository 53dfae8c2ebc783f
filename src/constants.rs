pub const DEFAULT_FILE_PREFIX: &str = "mrf";
pub const OUTPUT_FILE_SUFFIX: &str = "zstd.parquet";

pub const DEFAULT_MAX_ROWS_PER_FILE: u64 = 100_000_000;
pub const DEFAULT_MAX_ROWS_PER_GROUP: usize = 1_000_000;
pub const DEFAULT_FLUSH_ROWS: usize = 50_000;
pub const DEFAULT_SINK_CHANNEL_BATCHES: usize = 4 * 1024;

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

pub const DEFAULT_IN_NETWORK_BATCH_LINES: usize = 100;
pub const DEFAULT_PROVIDER_BATCH_LINES: usize = 2_000;
pub const DEFAULT_MAX_LINE_BYTES: usize = 5_000_000;

pub const DEFAULT_SPLIT_LINES_PER_SHARD: usize = 100_000;

/// Sentinel for "no plan id override".
pub const PLAN_ID_UNSET: i64 = -1;

pub const ROOT_SHARD_MARKER: &str = "root.json";
pub const IN_NETWORK_SHARD_PREFIX: &str = "in_network_";
pub const PROVIDER_REFERENCES_SHARD_PREFIX: &str = "provider_references_";

pub const DEFAULT_DOWNLOAD_MAX_RETRIES: u32 = 5;
pub const DEFAULT_LOG_LEVEL: &str = "info";

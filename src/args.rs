use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{path::PathBuf, time::Duration};

use crate::{
    config::FileConfig,
    constants::{
        DEFAULT_DOWNLOAD_MAX_RETRIES, DEFAULT_FILE_PREFIX, DEFAULT_FLUSH_ROWS,
        DEFAULT_IN_NETWORK_BATCH_LINES, DEFAULT_LOG_LEVEL, DEFAULT_MAX_LINE_BYTES,
        DEFAULT_MAX_ROWS_PER_FILE, DEFAULT_MAX_ROWS_PER_GROUP, DEFAULT_PROVIDER_BATCH_LINES,
        DEFAULT_QUEUE_CAPACITY, DEFAULT_SINK_CHANNEL_BATCHES, DEFAULT_SPLIT_LINES_PER_SHARD,
        DEFAULT_WORKERS, PLAN_ID_UNSET,
    },
    parse::ParseOptions,
    pipeline::PipelineOptions,
    storage::{Location, Source},
};

#[derive(Debug, Parser)]
#[command(name = "mrfparse")]
#[command(about = "Filter price transparency MRF files into a Parquet fileset")]
pub struct Args {
    /// TOML settings file. Defaults to ./config.toml when that exists.
    #[arg(long, global = true, env = "MRF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set (e.g. info, debug, mrfparse=trace).
    #[arg(long, global = true, env = "MRF_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn log_level(&self, config: &FileConfig) -> String {
        self.log_level
            .clone()
            .or_else(|| config.log.level.clone())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse a directory of split shards (root.json, in_network_*, provider_references_*).
    Parse(ParseArgs),
    /// Split one MRF JSON document into root.json plus NDJSON shards.
    Split(SplitArgs),
    /// Download (if needed), split, parse and clean up in one go.
    Pipeline(PipelineArgs),
}

/// Settings shared by `parse` and `pipeline`.
#[derive(Debug, Clone, ClapArgs)]
pub struct OutputArgs {
    /// Output directory for the Parquet fileset: local path, s3:// or gs:// prefix.
    #[arg(short, long, env = "MRF_OUTPUT")]
    pub output: String,

    /// CSV of CPT/HCPCS codes to keep (local, s3:// or gs://). Header row is
    /// skipped, first column is the code. Falls back to services.file in the config.
    #[arg(short, long, env = "MRF_SERVICES")]
    pub services: Option<String>,

    /// Plan id from the carrier's index file. Overrides plan_id in root.json; -1 keeps it.
    #[arg(short, long, env = "MRF_PLAN_ID", default_value_t = PLAN_ID_UNSET, allow_negative_numbers = true)]
    pub plan_id: i64,

    /// Output file name prefix: <prefix>_0000.zstd.parquet, ... [default: mrf]
    #[arg(long, env = "MRF_FILE_PREFIX")]
    pub file_prefix: Option<String>,

    /// Start a new output file after this many rows. [default: 100000000]
    #[arg(long, env = "MRF_MAX_ROWS_PER_FILE")]
    pub max_rows_per_file: Option<u64>,

    /// Parquet row group size. [default: 1000000]
    #[arg(long, env = "MRF_MAX_ROWS_PER_GROUP")]
    pub max_rows_per_group: Option<usize>,

    /// Rows buffered before they are handed to the Parquet writer.
    #[arg(long, env = "MRF_FLUSH_ROWS", default_value_t = DEFAULT_FLUSH_ROWS)]
    pub flush_rows: usize,

    /// Concurrent extraction workers.
    #[arg(long, env = "MRF_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Extra batches admitted beyond the running ones before the reader waits.
    #[arg(long, env = "MRF_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Lines per extraction task for in_network shards.
    #[arg(long, env = "MRF_IN_NETWORK_BATCH_LINES", default_value_t = DEFAULT_IN_NETWORK_BATCH_LINES)]
    pub in_network_batch_lines: usize,

    /// Lines per extraction task for provider_references shards.
    #[arg(long, env = "MRF_PROVIDER_BATCH_LINES", default_value_t = DEFAULT_PROVIDER_BATCH_LINES)]
    pub provider_batch_lines: usize,

    /// Longest shard line accepted, in bytes.
    #[arg(long, env = "MRF_MAX_LINE_BYTES", default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,

    /// Record batches queued for the output writer.
    #[arg(long, env = "MRF_SINK_CHANNEL_BATCHES", default_value_t = DEFAULT_SINK_CHANNEL_BATCHES)]
    pub sink_channel_batches: usize,
}

impl OutputArgs {
    /// Flags win over the config file, which wins over the defaults.
    pub fn to_parse_options(&self, input: Location, config: &FileConfig) -> Result<ParseOptions> {
        let services = self
            .services
            .clone()
            .or_else(|| config.services.file.clone())
            .context("No services CSV: pass --services or set services.file in the config file")?;
        Ok(ParseOptions {
            input,
            output: Location::parse(&self.output)?,
            services: Source::parse(&services)?,
            plan_id: self.plan_id,
            file_prefix: self
                .file_prefix
                .clone()
                .or_else(|| config.writer.file_prefix.clone())
                .unwrap_or_else(|| DEFAULT_FILE_PREFIX.to_string()),
            max_rows_per_file: self
                .max_rows_per_file
                .or(config.writer.max_rows_per_file)
                .unwrap_or(DEFAULT_MAX_ROWS_PER_FILE),
            max_rows_per_group: self
                .max_rows_per_group
                .or(config.writer.max_rows_per_group)
                .unwrap_or(DEFAULT_MAX_ROWS_PER_GROUP),
            flush_rows: self.flush_rows,
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            in_network_batch_lines: self.in_network_batch_lines,
            provider_batch_lines: self.provider_batch_lines,
            max_line_bytes: self.max_line_bytes,
            sink_channel_batches: self.sink_channel_batches,
            staging_dir: config.tmp.path.clone().unwrap_or_else(std::env::temp_dir),
        })
    }
}

#[derive(Debug, ClapArgs)]
pub struct ParseArgs {
    /// Directory holding the split shards: local path, s3:// or gs:// prefix.
    #[arg(short, long, env = "MRF_INPUT")]
    pub input: String,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl ParseArgs {
    pub fn to_options(&self, config: &FileConfig) -> Result<ParseOptions> {
        self.output
            .to_parse_options(Location::parse(&self.input)?, config)
    }
}

#[derive(Debug, ClapArgs)]
pub struct SplitArgs {
    /// MRF JSON document (optionally .gz).
    #[arg(short, long, env = "MRF_INPUT")]
    pub input: PathBuf,

    /// Directory for root.json and the NDJSON shards.
    #[arg(short, long, env = "MRF_OUTPUT")]
    pub output: PathBuf,

    /// Lines per in_network / provider_references shard.
    #[arg(long, env = "MRF_SPLIT_LINES_PER_SHARD", default_value_t = DEFAULT_SPLIT_LINES_PER_SHARD)]
    pub lines_per_shard: usize,

    /// Replace shards already present in the output directory.
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
}

#[derive(Debug, ClapArgs)]
pub struct PipelineArgs {
    /// MRF JSON document: local path, http(s) URL, s3:// or gs:// object, optionally gzipped.
    #[arg(short, long, env = "MRF_INPUT")]
    pub input: String,

    /// Parent directory for the scratch directory. Falls back to tmp.path in
    /// the config, then the system temp dir.
    #[arg(long, env = "MRF_TMP_DIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Lines per shard in the scratch directory.
    #[arg(long, env = "MRF_SPLIT_LINES_PER_SHARD", default_value_t = DEFAULT_SPLIT_LINES_PER_SHARD)]
    pub lines_per_shard: usize,

    /// Retries for transient download failures (429/5xx, timeouts). [default: 5]
    #[arg(long, env = "MRF_DOWNLOAD_RETRIES")]
    pub download_retries: Option<u32>,

    /// Whole-request timeout for HTTP downloads, in minutes. Unset means no timeout.
    #[arg(long, env = "MRF_DOWNLOAD_TIMEOUT_MINUTES")]
    pub download_timeout_minutes: Option<u64>,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl PipelineArgs {
    pub fn to_options(&self, config: &FileConfig) -> Result<PipelineOptions> {
        let tmp_dir = self
            .tmp_dir
            .clone()
            .or_else(|| config.tmp.path.clone())
            .unwrap_or_else(std::env::temp_dir);
        Ok(PipelineOptions {
            input: self.input.clone(),
            parse: self
                .output
                .to_parse_options(Location::Local(tmp_dir.clone()), config)?,
            tmp_dir,
            lines_per_shard: self.lines_per_shard,
            download_retries: self
                .download_retries
                .or(config.pipeline.download_retries)
                .unwrap_or(DEFAULT_DOWNLOAD_MAX_RETRIES),
        })
    }

    pub fn download_timeout(&self, config: &FileConfig) -> Option<Duration> {
        self.download_timeout_minutes
            .or(config.pipeline.download_timeout_minutes)
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes * 60))
    }
}

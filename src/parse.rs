//! The `parse` command: root shard, then the in-network phase, then the
//! provider-reference phase, all feeding one output sink.

use anyhow::{Context, Result, ensure};
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    common::{ShardKind, ShardSet, format_count, now_unix_millis, shard_spinner},
    constants::{
        DEFAULT_FILE_PREFIX, DEFAULT_FLUSH_ROWS, DEFAULT_IN_NETWORK_BATCH_LINES,
        DEFAULT_MAX_LINE_BYTES, DEFAULT_MAX_ROWS_PER_FILE, DEFAULT_MAX_ROWS_PER_GROUP,
        DEFAULT_PROVIDER_BATCH_LINES, DEFAULT_QUEUE_CAPACITY, DEFAULT_SINK_CHANNEL_BATCHES,
        DEFAULT_WORKERS, PLAN_ID_UNSET,
    },
    fields::SchemaError,
    filters::{
        CounterSnapshot, Extraction, ProviderReferenceCollector, ProviderReferenceFilter,
        RunCounters, ServiceAllowList,
    },
    in_network::InNetworkExtractor,
    model::Record,
    parquet_writer::WriterOptions,
    pool::{TaskGroup, TaskPool},
    provider_reference::ProviderReferenceExtractor,
    reader::{Batch, BatchReader},
    root::read_root,
    sink::{OutputSink, RecordSender, SinkConfig, SinkSummary},
    storage::{Location, Source},
};

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub input: Location,
    pub output: Location,
    pub services: Source,
    pub plan_id: i64,
    pub file_prefix: String,
    pub max_rows_per_file: u64,
    pub max_rows_per_group: usize,
    pub flush_rows: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub in_network_batch_lines: usize,
    pub provider_batch_lines: usize,
    pub max_line_bytes: usize,
    pub sink_channel_batches: usize,
    /// Parent of the local directory output files are written to before
    /// they are uploaded to a remote `output`.
    pub staging_dir: PathBuf,
}

impl ParseOptions {
    pub fn new(input_dir: &Path, output_dir: &Path, services: &Path) -> Self {
        Self {
            input: Location::Local(input_dir.to_path_buf()),
            output: Location::Local(output_dir.to_path_buf()),
            services: Source::File(services.to_path_buf()),
            plan_id: PLAN_ID_UNSET,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            max_rows_per_file: DEFAULT_MAX_ROWS_PER_FILE,
            max_rows_per_group: DEFAULT_MAX_ROWS_PER_GROUP,
            flush_rows: DEFAULT_FLUSH_ROWS,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            in_network_batch_lines: DEFAULT_IN_NETWORK_BATCH_LINES,
            provider_batch_lines: DEFAULT_PROVIDER_BATCH_LINES,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            sink_channel_batches: DEFAULT_SINK_CHANNEL_BATCHES,
            staging_dir: std::env::temp_dir(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.workers > 0, "--workers must be at least 1");
        ensure!(self.max_rows_per_file > 0, "--max-rows-per-file must be at least 1");
        ensure!(self.max_rows_per_group > 0, "--max-rows-per-group must be at least 1");
        ensure!(self.flush_rows > 0, "--flush-rows must be at least 1");
        ensure!(
            self.in_network_batch_lines > 0 && self.provider_batch_lines > 0,
            "batch line counts must be at least 1"
        );
        ensure!(self.max_line_bytes > 0, "--max-line-bytes must be at least 1");
        ensure!(self.sink_channel_batches > 0, "--sink-channel-batches must be at least 1");
        ensure!(!self.file_prefix.is_empty(), "--file-prefix must not be empty");
        Ok(())
    }

    /// Local directory the sink writes to: the output itself, or a fresh
    /// staging directory when the output is remote.
    fn local_output_dir(&self) -> PathBuf {
        match &self.output {
            Location::Local(dir) => dir.clone(),
            Location::Remote { .. } => self
                .staging_dir
                .join(format!("mrfparse-out-{}", now_unix_millis())),
        }
    }

    fn sink_config(&self, output_dir: PathBuf) -> SinkConfig {
        SinkConfig {
            output_dir,
            file_prefix: self.file_prefix.clone(),
            max_rows_per_file: self.max_rows_per_file,
            writer: WriterOptions {
                max_row_group_size: self.max_rows_per_group,
                flush_rows: self.flush_rows,
            },
            channel_batches: self.sink_channel_batches,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParseSummary {
    pub root_uuid: String,
    pub in_network_shards: usize,
    pub provider_reference_shards: usize,
    pub provider_references: usize,
    pub counters: CounterSnapshot,
    pub output: SinkSummary,
    /// Final location of every output file, in write order.
    pub published: Vec<String>,
    pub elapsed: Duration,
}

impl ParseSummary {
    pub fn log(&self) {
        let c = &self.counters;
        info!(
            "Parsed {} in_network and {} provider_references shards ({} lines)",
            self.in_network_shards,
            self.provider_reference_shards,
            format_count(c.lines_read)
        );
        info!(
            "in_network: scanned {}, matched {}",
            format_count(c.in_network_scanned),
            format_count(c.in_network_matched)
        );
        info!(
            "Found {} providers in in_network rates. Scanned {} provider groups, matched {}",
            format_count(self.provider_references as u64),
            format_count(c.provider_groups_scanned),
            format_count(c.provider_groups_matched)
        );
        info!(
            "Wrote {} records to {} files in {:.1?}",
            format_count(self.output.rows),
            self.published.len(),
            self.elapsed
        );
        for file in &self.published {
            debug!("Output file {file}");
        }
    }
}

struct PhaseTotals {
    root_uuid: String,
    provider_references: usize,
}

pub async fn run_parse(options: &ParseOptions) -> Result<ParseSummary> {
    options.validate()?;
    let started = Instant::now();

    let services = Arc::new(ServiceAllowList::load(&options.services).await?);
    info!("Loaded {} services", format_count(services.len() as u64));

    let shards = options.input.discover_shards().await?;
    info!(
        "Found root shard, {} in_network and {} provider_references shards in {}",
        shards.in_network.len(),
        shards.provider_references.len(),
        options.input
    );

    let counters = Arc::new(RunCounters::default());
    let local_dir = options.local_output_dir();
    let sink = OutputSink::start(options.sink_config(local_dir.clone()))?;

    let totals = match run_phases(options, &shards, services, &counters, &sink).await {
        Ok(totals) => totals,
        Err(err) => {
            // A stopped sink makes every producer fail with a generic send
            // error; its own error is the one worth reporting.
            let aborted = sink.abort().await;
            discard_staging(options, &local_dir);
            aborted?;
            return Err(err);
        }
    };
    let output = match sink.finalize().await {
        Ok(output) => output,
        Err(err) => {
            discard_staging(options, &local_dir);
            return Err(err);
        }
    };

    let mut published = Vec::with_capacity(output.files.len());
    for file in &output.files {
        published.push(options.output.publish(file).await?);
    }
    if options.output.is_remote() {
        fs::remove_dir_all(&local_dir)
            .with_context(|| format!("Failed removing staging dir {}", local_dir.display()))?;
    }

    Ok(ParseSummary {
        root_uuid: totals.root_uuid,
        in_network_shards: shards.in_network.len(),
        provider_reference_shards: shards.provider_references.len(),
        provider_references: totals.provider_references,
        counters: counters.snapshot(),
        output,
        published,
        elapsed: started.elapsed(),
    })
}

fn discard_staging(options: &ParseOptions, local_dir: &Path) {
    if options.output.is_remote() && local_dir.exists() {
        if let Err(err) = fs::remove_dir_all(local_dir) {
            warn!("Failed removing staging dir {}: {err}", local_dir.display());
        }
    }
}

async fn run_phases(
    options: &ParseOptions,
    shards: &ShardSet<Source>,
    services: Arc<ServiceAllowList>,
    counters: &Arc<RunCounters>,
    sink: &OutputSink,
) -> Result<PhaseTotals> {
    let root = read_root(&shards.root, options.plan_id).await?;
    let root_id = root.uuid.clone();
    let root_uuid: Arc<str> = Arc::from(root_id.as_str());
    sink.sender().send(vec![root]).await?;
    counters.records_emitted.fetch_add(1, Ordering::Relaxed);
    info!("Parsed root shard {}", shards.root);

    let pool = TaskPool::new(options.workers, options.queue_capacity);

    // Phase 1: scan in-network rates, collecting provider references.
    let collector = Arc::new(ProviderReferenceCollector::new());
    let phase_one = Arc::new(InNetworkPhase {
        services,
        collector: Arc::clone(&collector),
        counters: Arc::clone(counters),
        sender: sink.sender(),
        root_uuid: Arc::clone(&root_uuid),
    });
    let mut group = pool.group("in_network");
    for shard in &shards.in_network {
        let phase = Arc::clone(&phase_one);
        stream_shard(
            shard,
            ShardKind::InNetwork,
            options.in_network_batch_lines,
            options.max_line_bytes,
            &mut group,
            counters,
            move |batch| {
                let phase = Arc::clone(&phase);
                move || phase.process(&batch)
            },
        )
        .await?;
    }
    debug!("Waiting for in_network tasks to finish");
    let batches = group.wait().await?;
    drop(phase_one);
    info!(
        "Phase 1 done: {} batches, found {} providers in in_network rates",
        format_count(batches),
        format_count(collector.len() as u64)
    );
    let filter = Arc::new(collector.freeze()?);

    // Phase 2: keep only provider groups some in-network rate referenced.
    let phase_two = Arc::new(ProviderReferencePhase {
        filter: Arc::clone(&filter),
        counters: Arc::clone(counters),
        sender: sink.sender(),
        root_uuid,
    });
    let mut group = pool.group("provider_references");
    for shard in &shards.provider_references {
        let phase = Arc::clone(&phase_two);
        stream_shard(
            shard,
            ShardKind::ProviderReferences,
            options.provider_batch_lines,
            options.max_line_bytes,
            &mut group,
            counters,
            move |batch| {
                let phase = Arc::clone(&phase);
                move || phase.process(&batch)
            },
        )
        .await?;
    }
    debug!("Waiting for provider_references tasks to finish");
    let batches = group.wait().await?;
    info!("Phase 2 done: {} batches", format_count(batches));
    pool.shutdown();

    Ok(PhaseTotals {
        root_uuid: root_id,
        provider_references: filter.len(),
    })
}

/// Reads one shard in batches and submits a job per batch. Blocks on the
/// pool when it is full.
async fn stream_shard<F, J>(
    shard: &Source,
    kind: ShardKind,
    lines_per_batch: usize,
    max_line_bytes: usize,
    group: &mut TaskGroup,
    counters: &RunCounters,
    make_job: F,
) -> Result<()>
where
    F: Fn(Batch) -> J,
    J: FnOnce() -> Result<()> + Send + 'static,
{
    info!("Parsing {} shard {shard}", kind.label());
    let input = shard.open().await?;
    let mut reader = BatchReader::new(input, lines_per_batch, max_line_bytes);
    let progress = shard_spinner(kind.label());
    let mut batches = 0u64;

    loop {
        let batch = tokio::task::block_in_place(|| reader.next_batch())
            .with_context(|| format!("Failed reading {shard}"))?;
        let Some(batch) = batch else {
            break;
        };
        counters
            .lines_read
            .fetch_add(batch.lines as u64, Ordering::Relaxed);
        group.submit(make_job(batch)).await?;
        batches += 1;
        progress.set_message(format!(
            "{} lines, {} batches",
            format_count(reader.lines_read()),
            format_count(batches)
        ));
    }

    progress.finish_and_clear();
    info!(
        "Completed reading {shard}: {} lines in {} batches",
        format_count(reader.lines_read()),
        format_count(batches)
    );
    Ok(())
}

/// Parses every JSON value in a batch and runs it through `extract`,
/// collecting the records of accepted objects.
fn extract_batch<E>(
    batch: &Batch,
    scanned: &AtomicU64,
    matched: &AtomicU64,
    mut extract: E,
) -> Result<Vec<Record>>
where
    E: FnMut(&Value) -> Result<Extraction, SchemaError>,
{
    let mut records = Vec::new();
    for value in serde_json::Deserializer::from_slice(&batch.data).into_iter::<Value>() {
        let value = value.context("Failed parsing JSON line")?;
        scanned.fetch_add(1, Ordering::Relaxed);
        match extract(&value)? {
            Extraction::Accepted(mut accepted) => {
                matched.fetch_add(1, Ordering::Relaxed);
                records.append(&mut accepted);
            }
            Extraction::Rejected(reason) => trace!("Skipping record: {reason}"),
        }
    }
    Ok(records)
}

struct InNetworkPhase {
    services: Arc<ServiceAllowList>,
    collector: Arc<ProviderReferenceCollector>,
    counters: Arc<RunCounters>,
    sender: RecordSender,
    root_uuid: Arc<str>,
}

impl InNetworkPhase {
    fn process(&self, batch: &Batch) -> Result<()> {
        let extractor = InNetworkExtractor::new(&self.services, &self.collector);
        let records = extract_batch(
            batch,
            &self.counters.in_network_scanned,
            &self.counters.in_network_matched,
            |value| extractor.extract(value, &self.root_uuid),
        )
        .context("Failed extracting in_network batch")?;
        self.counters
            .records_emitted
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        self.sender.blocking_send(records)
    }
}

struct ProviderReferencePhase {
    filter: Arc<ProviderReferenceFilter>,
    counters: Arc<RunCounters>,
    sender: RecordSender,
    root_uuid: Arc<str>,
}

impl ProviderReferencePhase {
    fn process(&self, batch: &Batch) -> Result<()> {
        let extractor = ProviderReferenceExtractor::new(&self.filter);
        let records = extract_batch(
            batch,
            &self.counters.provider_groups_scanned,
            &self.counters.provider_groups_matched,
            |value| extractor.extract(value, &self.root_uuid),
        )
        .context("Failed extracting provider_references batch")?;
        self.counters
            .records_emitted
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        self.sender.blocking_send(records)
    }
}

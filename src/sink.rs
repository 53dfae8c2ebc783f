use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    constants::OUTPUT_FILE_SUFFIX,
    model::Record,
    parquet_writer::{MrfParquetWriter, WriterOptions},
};

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub max_rows_per_file: u64,
    pub writer: WriterOptions,
    pub channel_batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub rows: u64,
    pub files: Vec<PathBuf>,
}

pub fn output_file_name(prefix: &str, index: usize) -> String {
    format!("{prefix}_{index:04}.{OUTPUT_FILE_SUFFIX}")
}

/// Writes records into `<prefix>_0000`, `<prefix>_0001`, ... starting a
/// new file each time the current one holds `max_rows_per_file` rows.
pub struct RotatingWriter {
    config: SinkConfig,
    current: Option<MrfParquetWriter>,
    next_index: usize,
    rows: u64,
    files: Vec<PathBuf>,
}

impl RotatingWriter {
    pub fn new(config: SinkConfig) -> Result<Self> {
        fs::create_dir_all(&config.output_dir)
            .with_context(|| format!("Failed creating {}", config.output_dir.display()))?;
        Ok(Self {
            config,
            current: None,
            next_index: 0,
            rows: 0,
            files: Vec::new(),
        })
    }

    pub fn write_batch(&mut self, batch: &[Record]) -> Result<()> {
        for record in batch {
            let writer = self.writer_with_room()?;
            writer.push_record(record)?;
            self.rows += 1;
        }
        Ok(())
    }

    fn writer_with_room(&mut self) -> Result<&mut MrfParquetWriter> {
        let full = self
            .current
            .as_ref()
            .is_some_and(|w| w.rows_written() >= self.config.max_rows_per_file);
        if full {
            self.close_current()?;
        }
        if self.current.is_none() {
            let path = self
                .config
                .output_dir
                .join(output_file_name(&self.config.file_prefix, self.next_index));
            debug!(file = %path.display(), rows_so_far = self.rows, "opening output file");
            self.current = Some(MrfParquetWriter::try_new(&path, self.config.writer)?);
            self.next_index += 1;
        }
        self.current
            .as_mut()
            .ok_or_else(|| anyhow!("output writer missing after rotation"))
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            let rows = writer.rows_written();
            let path = writer
                .finish()
                .context("Failed closing output parquet file")?;
            debug!(file = %path.display(), rows, "closed output file");
            self.files.push(path);
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<SinkSummary> {
        self.close_current()?;
        Ok(SinkSummary {
            rows: self.rows,
            files: self.files,
        })
    }

    /// Drops the file being written. Files already closed stay on disk.
    pub fn abort(mut self) {
        if let Some(writer) = self.current.take() {
            writer.abort();
        }
    }
}

/// Producer handle for the output sink.
#[derive(Debug, Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<Vec<Record>>,
}

impl RecordSender {
    pub async fn send(&self, batch: Vec<Record>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx
            .send(batch)
            .await
            .map_err(|_| anyhow!("output sink stopped before all records were written"))
    }

    /// For use from blocking extraction tasks.
    pub fn blocking_send(&self, batch: Vec<Record>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx
            .blocking_send(batch)
            .map_err(|_| anyhow!("output sink stopped before all records were written"))
    }
}

/// Single consumer draining a bounded queue of record batches into
/// rotating Parquet files.
pub struct OutputSink {
    sender: RecordSender,
    aborted: Arc<AtomicBool>,
    handle: JoinHandle<Result<SinkSummary>>,
}

impl OutputSink {
    pub fn start(config: SinkConfig) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Vec<Record>>(config.channel_batches.max(1));
        let mut writer = RotatingWriter::new(config)?;
        let aborted = Arc::new(AtomicBool::new(false));
        let abort_requested = Arc::clone(&aborted);

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(batch) = rx.blocking_recv() {
                if abort_requested.load(Ordering::Acquire) {
                    break;
                }
                if let Err(err) = writer.write_batch(&batch) {
                    writer.abort();
                    return Err(err.context("Failed writing output records"));
                }
            }
            if abort_requested.load(Ordering::Acquire) {
                debug!("output sink aborted, discarding the open file");
                writer.abort();
                return Ok(SinkSummary::default());
            }
            writer.finish()
        });

        Ok(Self {
            sender: RecordSender { tx },
            aborted,
            handle,
        })
    }

    pub fn sender(&self) -> RecordSender {
        self.sender.clone()
    }

    /// Closes the queue, lets the consumer drain every batch already sent,
    /// and closes the last file. Every other `RecordSender` must be dropped
    /// first or this never returns.
    pub async fn finalize(self) -> Result<SinkSummary> {
        drop(self.sender);
        let summary = self
            .handle
            .await
            .context("Output sink task panicked")??;
        info!(
            rows = summary.rows,
            files = summary.files.len(),
            "output sink finished"
        );
        Ok(summary)
    }

    /// Stops the consumer without draining the queue and deletes the file
    /// it was writing, so no partial file is left under a final name.
    /// Returns the sink's own error if it had already failed.
    ///
    /// Waits for the consumer, which wakes on the next queued batch or once
    /// every `RecordSender` is gone.
    pub async fn abort(self) -> Result<()> {
        self.aborted.store(true, Ordering::Release);
        drop(self.sender);
        let result = self.handle.await.context("Output sink task panicked")?;
        match result {
            Ok(_) => {
                warn!("output sink aborted; unfinished output discarded");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

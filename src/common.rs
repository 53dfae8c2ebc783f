use anyhow::{Context, Result, bail};
use flate2::read::MultiGzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use std::{
    fs::{self, File},
    io::{BufRead, BufReader, IsTerminal, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::time::sleep;

use crate::constants::{
    IN_NETWORK_SHARD_PREFIX, PROVIDER_REFERENCES_SHARD_PREFIX, ROOT_SHARD_MARKER,
};

const INPUT_BUFFER_BYTES: usize = 1 << 20;

pub fn delete_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed deleting {}", path.display()))?;
    }
    Ok(())
}

pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|x| x.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Opens a local input for buffered reading, transparently decompressing
/// `.gz` files.
pub fn open_input(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).with_context(|| format!("Failed opening {}", path.display()))?;
    if is_gzip_path(path) {
        Ok(Box::new(BufReader::with_capacity(
            INPUT_BUFFER_BYTES,
            MultiGzDecoder::new(file),
        )))
    } else {
        Ok(Box::new(BufReader::with_capacity(INPUT_BUFFER_BYTES, file)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Root,
    InNetwork,
    ProviderReferences,
}

impl ShardKind {
    pub fn label(self) -> &'static str {
        match self {
            ShardKind::Root => "root",
            ShardKind::InNetwork => "in_network",
            ShardKind::ProviderReferences => "provider_references",
        }
    }
}

pub fn classify_shard(file_name: &str) -> Option<ShardKind> {
    if file_name.contains(ROOT_SHARD_MARKER) {
        Some(ShardKind::Root)
    } else if file_name.starts_with(IN_NETWORK_SHARD_PREFIX) {
        Some(ShardKind::InNetwork)
    } else if file_name.starts_with(PROVIDER_REFERENCES_SHARD_PREFIX) {
        Some(ShardKind::ProviderReferences)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ShardSet<T = PathBuf> {
    pub root: T,
    pub in_network: Vec<T>,
    pub provider_references: Vec<T>,
}

impl<T> ShardSet<T> {
    pub fn map<U>(self, f: impl Fn(T) -> U) -> ShardSet<U> {
        ShardSet {
            root: f(self.root),
            in_network: self.in_network.into_iter().map(&f).collect(),
            provider_references: self.provider_references.into_iter().map(&f).collect(),
        }
    }
}

/// Sorts `(file name, shard)` pairs by name and sorts them into root,
/// in-network and provider-reference shards. Names without `.json` are
/// skipped. Exactly one root shard must be present.
pub fn group_shards<T>(location: &str, mut entries: Vec<(String, T)>) -> Result<ShardSet<T>> {
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut roots = Vec::new();
    let mut in_network = Vec::new();
    let mut provider_references = Vec::new();
    for (name, shard) in entries {
        if !name.contains(".json") {
            continue;
        }
        match classify_shard(&name) {
            Some(ShardKind::Root) => roots.push(shard),
            Some(ShardKind::InNetwork) => in_network.push(shard),
            Some(ShardKind::ProviderReferences) => provider_references.push(shard),
            None => tracing::debug!("Ignoring unrecognised shard {name} in {location}"),
        }
    }

    let root = match roots.len() {
        0 => bail!("No {ROOT_SHARD_MARKER} shard found in {location}"),
        1 => roots.remove(0),
        n => bail!("Expected exactly one {ROOT_SHARD_MARKER} shard in {location}, found {n}"),
    };
    Ok(ShardSet {
        root,
        in_network,
        provider_references,
    })
}

/// Lists the `*.json*` shards in a local directory, sorted by file name.
pub fn discover_shards(dir: &Path) -> Result<ShardSet> {
    let mut entries: Vec<(String, PathBuf)> = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed listing shards in {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("Failed reading entry in {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push((name, entry.path()));
    }
    group_shards(&dir.display().to_string(), entries)
}

pub fn is_remote_url(input: &str) -> bool {
    let lower = input.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

pub fn file_name_from_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let without_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    let file_name = without_query
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .context("Could not derive filename from URL")?;
    Ok(file_name.to_string())
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

fn retry_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    retry_after.unwrap_or_else(|| {
        Duration::from_secs(1)
            .checked_mul(1u32 << attempt.min(6))
            .unwrap_or(Duration::from_secs(64))
    })
}

/// Downloads `url` to `output_path`, retrying transient failures with
/// exponential backoff. A `Retry-After` header overrides the backoff.
pub async fn download_file(
    client: &Client,
    url: &str,
    output_path: &Path,
    max_retries: u32,
) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating {}", parent.display()))?;
    }

    let mut attempt = 0u32;
    let mut response = loop {
        let outcome = client.get(url).send().await;
        let retry_after = match outcome {
            Ok(response) if response.status().is_success() => break response,
            Ok(response) if is_retryable_status(response.status()) && attempt < max_retries => {
                tracing::warn!(
                    "Download of {url} returned {} (attempt {}/{})",
                    response.status(),
                    attempt + 1,
                    max_retries + 1
                );
                parse_retry_after(response.headers().get(RETRY_AFTER))
            }
            Ok(response) => bail!("Download failed for {url}: HTTP {}", response.status()),
            Err(err) if attempt < max_retries && (err.is_timeout() || err.is_connect()) => {
                tracing::warn!(
                    "Download request for {url} failed (attempt {}/{}): {err}",
                    attempt + 1,
                    max_retries + 1
                );
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Download request failed for {url}"));
            }
        };
        sleep(retry_delay(attempt, retry_after)).await;
        attempt += 1;
    };

    let mut file = File::create(output_path)
        .with_context(|| format!("Failed creating {}", output_path.display()))?;

    let mut downloaded: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed reading download stream")?
    {
        file.write_all(&chunk)
            .with_context(|| format!("Failed writing {}", output_path.display()))?;
        downloaded += chunk.len() as u64;
        if downloaded % (512 * 1024 * 1024) < chunk.len() as u64 {
            tracing::info!("Downloaded ~{} MiB", downloaded / (1024 * 1024));
        }
    }

    tracing::info!("Download complete: {}", output_path.display());
    Ok(())
}

pub fn now_unix_millis() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i128)
        .unwrap_or_default()
}

pub fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out.chars().rev().collect()
}

/// Spinner for streaming a shard; drawn only when stderr is a terminal.
pub fn shard_spinner(prefix: &str) -> ProgressBar {
    let progress = if std::io::stderr().is_terminal() {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::hidden()
    };
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.green} {prefix:.bold} [{elapsed_precise}] {msg}")
    {
        progress.set_style(style);
    }
    progress.set_prefix(prefix.to_string());
    progress.enable_steady_tick(Duration::from_millis(250));
    progress
}

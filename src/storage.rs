//! Local paths and object-storage URIs (`s3://bucket/prefix`,
//! `gs://bucket/prefix`) behind one interface, so shard discovery, shard
//! and root reads, and output publishing do not care where data lives.

use anyhow::{Context, Result, bail};
use flate2::read::MultiGzDecoder;
use futures::TryStreamExt;
use object_store::{
    ObjectStore, aws::AmazonS3Builder, buffered::BufWriter, gcp::GoogleCloudStorageBuilder,
    path::Path as ObjectPath,
};
use std::{
    fmt,
    fs::{self, File},
    io::{self, BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::AsyncWriteExt;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info};

use crate::common::{ShardSet, group_shards, is_gzip_path, open_input};

const OBJECT_READ_BUFFER_BYTES: usize = 1 << 20;

pub fn is_object_store_uri(input: &str) -> bool {
    let lower = input.trim().to_ascii_lowercase();
    lower.starts_with("s3://") || lower.starts_with("gs://")
}

/// Splits `s3://bucket/some/key` into `("s3", "bucket", "some/key")`.
pub fn split_bucket_uri(uri: &str) -> Result<(String, String, String)> {
    let trimmed = uri.trim();
    let (scheme, rest) = trimmed
        .split_once("://")
        .with_context(|| format!("{trimmed} is not a bucket URI"))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        bail!("{trimmed} has no bucket name");
    }
    Ok((
        scheme.to_ascii_lowercase(),
        bucket.to_string(),
        key.trim_matches('/').to_string(),
    ))
}

/// A store plus the URI prefix used when naming its objects in logs.
#[derive(Debug, Clone)]
pub struct Bucket {
    base: String,
    store: Arc<dyn ObjectStore>,
}

impl Bucket {
    pub fn new(base: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            store,
        }
    }

    /// Opens the bucket named by an `s3://` or `gs://` URI. Credentials and
    /// region come from the usual `AWS_*` / `GOOGLE_*` environment.
    pub fn open(uri: &str) -> Result<(Self, ObjectPath)> {
        let (scheme, bucket, key) = split_bucket_uri(uri)?;
        let store: Arc<dyn ObjectStore> = match scheme.as_str() {
            "s3" => Arc::new(
                AmazonS3Builder::from_env()
                    .with_bucket_name(&bucket)
                    .build()
                    .with_context(|| format!("Failed opening S3 bucket {bucket}"))?,
            ),
            "gs" => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(&bucket)
                    .build()
                    .with_context(|| format!("Failed opening GCS bucket {bucket}"))?,
            ),
            other => bail!("Unsupported storage scheme {other}:// in {uri}"),
        };
        let key = ObjectPath::parse(&key).with_context(|| format!("Invalid object key in {uri}"))?;
        Ok((Self::new(format!("{scheme}://{bucket}"), store), key))
    }

    fn uri(&self, path: &ObjectPath) -> String {
        if path.as_ref().is_empty() {
            self.base.clone()
        } else {
            format!("{}/{}", self.base, path)
        }
    }
}

/// Where a directory of shards is read from, or output files go to.
#[derive(Debug, Clone)]
pub enum Location {
    Local(PathBuf),
    Remote { bucket: Bucket, prefix: ObjectPath },
}

impl Location {
    pub fn parse(input: &str) -> Result<Self> {
        if is_object_store_uri(input) {
            let (bucket, prefix) = Bucket::open(input)?;
            Ok(Location::Remote { bucket, prefix })
        } else {
            Ok(Location::Local(PathBuf::from(input)))
        }
    }

    pub fn as_local(&self) -> Option<&Path> {
        match self {
            Location::Local(dir) => Some(dir),
            Location::Remote { .. } => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }

    /// Lists the `*.json*` shards directly under this location.
    pub async fn discover_shards(&self) -> Result<ShardSet<Source>> {
        match self {
            Location::Local(dir) => Ok(crate::common::discover_shards(dir)?.map(Source::File)),
            Location::Remote { bucket, prefix } => {
                let listed: Vec<_> = bucket
                    .store
                    .list(Some(prefix))
                    .try_collect()
                    .await
                    .with_context(|| format!("Failed listing shards in {self}"))?;
                let depth = prefix.parts().count() + 1;
                let entries = listed
                    .into_iter()
                    .filter(|meta| meta.location.parts().count() == depth)
                    .filter_map(|meta| {
                        let name = meta.location.filename()?.to_string();
                        Some((
                            name,
                            Source::Object {
                                bucket: bucket.clone(),
                                path: meta.location,
                            },
                        ))
                    })
                    .collect();
                group_shards(&self.to_string(), entries)
            }
        }
    }

    /// Copies a closed local file to `<location>/<file name>` and returns
    /// where it ended up. Local locations are written in place, so the file
    /// is already there.
    pub async fn publish(&self, file: &Path) -> Result<String> {
        let Location::Remote { bucket, prefix } = self else {
            return Ok(file.display().to_string());
        };
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Output file {} has no usable name", file.display()))?;
        let key = prefix.child(name);
        let uri = bucket.uri(&key);

        let mut reader = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("Failed opening {}", file.display()))?;
        let mut writer = BufWriter::new(Arc::clone(&bucket.store), key);
        tokio::io::copy(&mut reader, &mut writer)
            .await
            .with_context(|| format!("Failed uploading {} to {uri}", file.display()))?;
        writer
            .shutdown()
            .await
            .with_context(|| format!("Failed completing upload to {uri}"))?;
        info!("Uploaded {} to {uri}", file.display());
        Ok(uri)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(dir) => write!(f, "{}", dir.display()),
            Location::Remote { bucket, prefix } => f.write_str(&bucket.uri(prefix)),
        }
    }
}

/// One readable input: a local file or a single object.
#[derive(Debug, Clone)]
pub enum Source {
    File(PathBuf),
    Object { bucket: Bucket, path: ObjectPath },
}

impl Source {
    pub fn parse(input: &str) -> Result<Self> {
        if is_object_store_uri(input) {
            let (bucket, path) = Bucket::open(input)?;
            Ok(Source::Object { bucket, path })
        } else {
            Ok(Source::File(PathBuf::from(input)))
        }
    }

    pub fn is_gzip(&self) -> bool {
        match self {
            Source::File(path) => is_gzip_path(path),
            Source::Object { path, .. } => path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("gz")),
        }
    }

    /// Opens the source for streaming reads, decompressing `.gz` inputs.
    /// Object reads block the calling thread, so the reader must be driven
    /// from a blocking context inside the runtime.
    pub async fn open(&self) -> Result<Box<dyn BufRead + Send>> {
        let (bucket, path) = match self {
            Source::File(path) => return open_input(path),
            Source::Object { bucket, path } => (bucket, path),
        };
        let stream = bucket
            .store
            .get(path)
            .await
            .with_context(|| format!("Failed opening {self}"))?
            .into_stream()
            .map_err(io::Error::other);
        let bridge = SyncIoBridge::new(StreamReader::new(stream));
        if self.is_gzip() {
            Ok(Box::new(BufReader::with_capacity(
                OBJECT_READ_BUFFER_BYTES,
                MultiGzDecoder::new(bridge),
            )))
        } else {
            Ok(Box::new(BufReader::with_capacity(
                OBJECT_READ_BUFFER_BYTES,
                bridge,
            )))
        }
    }

    /// Reads the whole (decompressed) source into memory. Meant for small
    /// inputs such as the root shard and the services CSV.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        match self {
            Source::File(path) => {
                open_input(path)?
                    .read_to_end(&mut data)
                    .with_context(|| format!("Failed reading {}", path.display()))?;
            }
            Source::Object { bucket, path } => {
                let bytes = bucket
                    .store
                    .get(path)
                    .await
                    .with_context(|| format!("Failed opening {self}"))?
                    .bytes()
                    .await
                    .with_context(|| format!("Failed reading {self}"))?;
                if self.is_gzip() {
                    MultiGzDecoder::new(&bytes[..])
                        .read_to_end(&mut data)
                        .with_context(|| format!("Failed decompressing {self}"))?;
                } else {
                    data.extend_from_slice(&bytes);
                }
            }
        }
        Ok(data)
    }

    /// Copies the source, still compressed, to a local file.
    pub async fn download_to(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating {}", parent.display()))?;
        }
        match self {
            Source::File(path) => {
                fs::copy(path, dest).with_context(|| {
                    format!("Failed copying {} to {}", path.display(), dest.display())
                })?;
            }
            Source::Object { bucket, path } => {
                let mut stream = bucket
                    .store
                    .get(path)
                    .await
                    .with_context(|| format!("Failed opening {self}"))?
                    .into_stream();
                let mut file = File::create(dest)
                    .with_context(|| format!("Failed creating {}", dest.display()))?;
                let mut copied = 0u64;
                while let Some(chunk) = stream
                    .try_next()
                    .await
                    .with_context(|| format!("Failed reading {self}"))?
                {
                    file.write_all(&chunk)
                        .with_context(|| format!("Failed writing {}", dest.display()))?;
                    copied += chunk.len() as u64;
                }
                debug!(bytes = copied, "copied {self} to {}", dest.display());
            }
        }
        Ok(())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::File(path) => write!(f, "{}", path.display()),
            Source::Object { bucket, path } => f.write_str(&bucket.uri(path)),
        }
    }
}

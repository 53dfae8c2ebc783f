//! The `split` command: turns one MRF document into the line-delimited
//! shards that `parse` reads.
//!
//! The document is streamed: the big `in_network` and
//! `provider_references` arrays are written out one element at a time and
//! never held in memory as a whole.

use anyhow::{Context, Result, bail};
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use std::{
    fmt,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

use crate::{
    common::{classify_shard, delete_if_exists, format_count, open_input},
    constants::{IN_NETWORK_SHARD_PREFIX, PROVIDER_REFERENCES_SHARD_PREFIX, ROOT_SHARD_MARKER},
};

#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub lines_per_shard: usize,
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SplitSummary {
    pub root: PathBuf,
    pub in_network: Vec<PathBuf>,
    pub provider_references: Vec<PathBuf>,
    pub in_network_lines: u64,
    pub provider_reference_lines: u64,
}

/// Writes compact JSON lines to `<prefix>0000.json`, `<prefix>0001.json`,
/// ... with at most `lines_per_shard` lines each.
struct ShardWriter {
    dir: PathBuf,
    prefix: &'static str,
    lines_per_shard: usize,
    current: Option<BufWriter<File>>,
    lines_in_shard: usize,
    lines: u64,
    shards: Vec<PathBuf>,
}

impl ShardWriter {
    fn new(dir: &Path, prefix: &'static str, lines_per_shard: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix,
            lines_per_shard: lines_per_shard.max(1),
            current: None,
            lines_in_shard: 0,
            lines: 0,
            shards: Vec::new(),
        }
    }

    fn write(&mut self, value: &Value) -> Result<()> {
        if self.lines_in_shard >= self.lines_per_shard {
            self.close_current()?;
        }
        if self.current.is_none() {
            let path = self
                .dir
                .join(format!("{}{:04}.json", self.prefix, self.shards.len()));
            debug!("Opening shard {}", path.display());
            let file = File::create(&path)
                .with_context(|| format!("Failed creating {}", path.display()))?;
            self.current = Some(BufWriter::new(file));
            self.shards.push(path);
        }
        let Some(out) = self.current.as_mut() else {
            bail!("shard writer has no open file");
        };
        serde_json::to_writer(&mut *out, value).context("Failed writing shard line")?;
        out.write_all(b"\n").context("Failed writing shard line")?;
        self.lines_in_shard += 1;
        self.lines += 1;
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(mut out) = self.current.take() {
            out.flush().context("Failed flushing shard")?;
        }
        self.lines_in_shard = 0;
        Ok(())
    }

    fn finish(mut self) -> Result<(Vec<PathBuf>, u64)> {
        self.close_current()?;
        Ok((self.shards, self.lines))
    }
}

/// Streams the elements of one top-level array into a shard writer.
struct ArrayToShards<'a> {
    writer: &'a mut ShardWriter,
}

impl<'de> DeserializeSeed<'de> for ArrayToShards<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ArrayToShards<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of objects")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while let Some(element) = seq.next_element::<Value>()? {
            self.writer
                .write(&element)
                .map_err(|err| <A::Error as de::Error>::custom(format!("{err:#}")))?;
        }
        Ok(())
    }
}

/// Walks the top-level object, sending the two big arrays to their shard
/// writers and keeping every other member for `root.json`.
struct Document<'a> {
    in_network: &'a mut ShardWriter,
    provider_references: &'a mut ShardWriter,
}

impl<'de> DeserializeSeed<'de> for Document<'_> {
    type Value = Map<String, Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for Document<'_> {
    type Value = Map<String, Value>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an MRF JSON object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut root = Map::new();
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "in_network" => map.next_value_seed(ArrayToShards {
                    writer: &mut *self.in_network,
                })?,
                "provider_references" => map.next_value_seed(ArrayToShards {
                    writer: &mut *self.provider_references,
                })?,
                _ => {
                    let value: Value = map.next_value()?;
                    root.insert(key, value);
                }
            }
        }
        Ok(root)
    }
}

/// Makes sure `dir` is usable for fresh shards.
fn prepare_output_dir(dir: &Path, overwrite: bool) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed creating {}", dir.display()))?;

    let mut existing = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed listing {}", dir.display()))? {
        let entry = entry.with_context(|| format!("Failed reading entry in {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(".json") && classify_shard(&name).is_some() {
            existing.push(entry.path());
        }
    }
    if existing.is_empty() {
        return Ok(());
    }
    if !overwrite {
        bail!(
            "{} already contains {} shards; pass --overwrite to replace them",
            dir.display(),
            existing.len()
        );
    }
    for path in existing {
        delete_if_exists(&path)?;
    }
    Ok(())
}

pub fn split_file(options: &SplitOptions) -> Result<SplitSummary> {
    prepare_output_dir(&options.output_dir, options.overwrite)?;
    info!(
        "Splitting {} into {}",
        options.input.display(),
        options.output_dir.display()
    );

    let input = open_input(&options.input)?;
    let mut in_network = ShardWriter::new(
        &options.output_dir,
        IN_NETWORK_SHARD_PREFIX,
        options.lines_per_shard,
    );
    let mut provider_references = ShardWriter::new(
        &options.output_dir,
        PROVIDER_REFERENCES_SHARD_PREFIX,
        options.lines_per_shard,
    );

    let mut de = serde_json::Deserializer::from_reader(input);
    let root = Document {
        in_network: &mut in_network,
        provider_references: &mut provider_references,
    }
    .deserialize(&mut de)
    .with_context(|| format!("Failed splitting {}", options.input.display()))?;
    de.end()
        .with_context(|| format!("Trailing data after document in {}", options.input.display()))?;

    let root_path = options.output_dir.join(ROOT_SHARD_MARKER);
    let root_doc = serde_json::to_vec(&Value::Object(root)).context("Failed encoding root")?;
    fs::write(&root_path, root_doc)
        .with_context(|| format!("Failed writing {}", root_path.display()))?;

    let (in_network, in_network_lines) = in_network.finish()?;
    let (provider_references, provider_reference_lines) = provider_references.finish()?;
    info!(
        "Split {} in_network objects into {} shards and {} provider_references objects into {} shards",
        format_count(in_network_lines),
        in_network.len(),
        format_count(provider_reference_lines),
        provider_references.len()
    );

    Ok(SplitSummary {
        root: root_path,
        in_network,
        provider_references,
        in_network_lines,
        provider_reference_lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};
    use serde_json::json;

    fn document() -> Value {
        json!({
            "reporting_entity_name": "Acme Health",
            "reporting_entity_type": "health insurance issuer",
            "plan_id": 12345,
            "in_network": [
                { "billing_code": "1", "negotiated_rates": [{ "provider_references": [1] }] },
                { "billing_code": "2", "negotiated_rates": [] },
                { "billing_code": "3", "negotiated_rates": [] }
            ],
            "last_updated_on": "2023-01-01",
            "provider_references": [
                { "provider_group_id": 1, "provider_groups": [] }
            ],
            "version": "1.0.0"
        })
    }

    fn options(input: &Path, output: &Path, lines_per_shard: usize) -> SplitOptions {
        SplitOptions {
            input: input.to_path_buf(),
            output_dir: output.to_path_buf(),
            lines_per_shard,
            overwrite: false,
        }
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn splits_arrays_into_rotating_shards() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plan.json");
        fs::write(&input, serde_json::to_string_pretty(&document()).unwrap()).unwrap();
        let output = dir.path().join("shards");

        let summary = split_file(&options(&input, &output, 2)).unwrap();
        assert_eq!(summary.in_network_lines, 3);
        assert_eq!(summary.provider_reference_lines, 1);

        let names: Vec<String> = summary
            .in_network
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["in_network_0000.json", "in_network_0001.json"]);
        assert_eq!(read_lines(&summary.in_network[0]).len(), 2);
        assert_eq!(
            read_lines(&summary.in_network[1]),
            vec![json!({ "billing_code": "3", "negotiated_rates": [] })]
        );
        assert_eq!(
            summary.provider_references,
            vec![output.join("provider_references_0000.json")]
        );

        let root: Value = serde_json::from_slice(&fs::read(&summary.root).unwrap()).unwrap();
        assert_eq!(root["plan_id"], json!(12345));
        assert_eq!(root["version"], json!("1.0.0"));
        assert!(root.get("in_network").is_none());
        assert!(root.get("provider_references").is_none());
    }

    #[test]
    fn reads_gzip_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plan.json.gz");
        let mut encoder = GzEncoder::new(File::create(&input).unwrap(), Compression::default());
        serde_json::to_writer(&mut encoder, &document()).unwrap();
        encoder.finish().unwrap();

        let summary = split_file(&options(&input, &dir.path().join("out"), 100)).unwrap();
        assert_eq!(summary.in_network.len(), 1);
        assert_eq!(summary.in_network_lines, 3);
    }

    #[test]
    fn refuses_to_mix_with_existing_shards() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plan.json");
        fs::write(&input, document().to_string()).unwrap();
        let output = dir.path().join("shards");

        split_file(&options(&input, &output, 1)).unwrap();
        assert!(split_file(&options(&input, &output, 1)).is_err());

        let mut again = options(&input, &output, 10);
        again.overwrite = true;
        let summary = split_file(&again).unwrap();
        assert_eq!(summary.in_network.len(), 1);
        // Shards from the first run are gone.
        assert!(!output.join("in_network_0002.json").exists());
    }

    #[test]
    fn rejects_non_object_documents() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plan.json");
        fs::write(&input, "[1, 2, 3]").unwrap();
        assert!(split_file(&options(&input, &dir.path().join("out"), 10)).is_err());
    }
}

//! The `pipeline` command: download (when given a URL or bucket object),
//! split into a scratch directory, parse, then remove the scratch directory.

use anyhow::{Context, Result};
use reqwest::Client;
use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::info;

use crate::{
    common::{download_file, file_name_from_url, is_remote_url, now_unix_millis},
    parse::{ParseOptions, ParseSummary, run_parse},
    split::{SplitOptions, split_file},
    storage::{Location, Source, is_object_store_uri},
};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Local path, `http(s)://` URL or `s3://`/`gs://` object of one MRF
    /// document.
    pub input: String,
    pub tmp_dir: PathBuf,
    pub lines_per_shard: usize,
    pub download_retries: u32,
    /// Parse settings; `input` is replaced by the scratch shard dir.
    pub parse: ParseOptions,
}

async fn timed<T, F>(step: &str, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    info!("Step {step}: starting");
    let started = Instant::now();
    let result = work.await;
    match &result {
        Ok(_) => info!("Step {step}: completed in {:.1?}", started.elapsed()),
        Err(_) => info!("Step {step}: failed after {:.1?}", started.elapsed()),
    }
    result
}

pub async fn run_pipeline(options: &PipelineOptions, client: &Client) -> Result<ParseSummary> {
    options.parse.validate()?;
    let work_dir = options
        .tmp_dir
        .join(format!("mrfparse-{}", now_unix_millis()));
    fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed creating {}", work_dir.display()))?;

    let input = timed("download", fetch_input(client, options, &work_dir)).await?;

    let shard_dir = work_dir.join("shards");
    let split = SplitOptions {
        input,
        output_dir: shard_dir.clone(),
        lines_per_shard: options.lines_per_shard,
        overwrite: true,
    };
    timed("split", async {
        tokio::task::spawn_blocking(move || split_file(&split))
            .await
            .context("Split task panicked")?
    })
    .await?;

    let mut parse = options.parse.clone();
    parse.input = Location::Local(shard_dir);
    parse.staging_dir = work_dir.clone();
    let summary = timed("parse", run_parse(&parse)).await?;

    timed("clean", async {
        fs::remove_dir_all(&work_dir)
            .with_context(|| format!("Failed removing {}", work_dir.display()))
    })
    .await?;

    Ok(summary)
}

/// Local inputs are used in place; URLs and bucket objects are downloaded
/// into `work_dir`.
async fn fetch_input(client: &Client, options: &PipelineOptions, work_dir: &Path) -> Result<PathBuf> {
    if is_object_store_uri(&options.input) {
        let source = Source::parse(&options.input)?;
        let path = work_dir.join(file_name_from_url(&options.input)?);
        info!("Copying {source} to {}", path.display());
        source.download_to(&path).await?;
        return Ok(path);
    }
    if !is_remote_url(&options.input) {
        let path = PathBuf::from(&options.input);
        anyhow::ensure!(path.is_file(), "Input file {} does not exist", path.display());
        info!("Using input file {}", path.display());
        return Ok(path);
    }

    let path = work_dir.join(file_name_from_url(&options.input)?);
    info!("Downloading {} to {}", options.input, path.display());
    download_file(client, &options.input, &path, options.download_retries).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> serde_json::Value {
        json!({
            "reporting_entity_name": "Acme Health",
            "plan_id": "777",
            "in_network": [{
                "negotiation_arrangement": "ffs",
                "name": "Office visit",
                "billing_code_type": "CPT",
                "billing_code_type_version": "2022",
                "billing_code": "99213",
                "description": "Office or other outpatient visit",
                "negotiated_rates": [{
                    "provider_references": [7],
                    "negotiated_prices": [{
                        "negotiated_type": "negotiated",
                        "negotiated_rate": 80.0,
                        "expiration_date": "9999-12-31",
                        "billing_class": "institutional"
                    }]
                }]
            }],
            "provider_references": [
                { "provider_group_id": 7, "provider_groups": [{ "npi": [1], "tin": { "type": "ein", "value": "1" } }] },
                { "provider_group_id": 8, "provider_groups": [{ "npi": [2], "tin": { "type": "ein", "value": "2" } }] }
            ]
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_document_runs_end_to_end_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plan.json");
        fs::write(&input, document().to_string()).unwrap();
        let services = dir.path().join("services.csv");
        fs::write(&services, "code\n99213\n").unwrap();
        let tmp = dir.path().join("tmp");
        let output = dir.path().join("out");

        let options = PipelineOptions {
            input: input.to_string_lossy().into_owned(),
            tmp_dir: tmp.clone(),
            lines_per_shard: 1,
            download_retries: 0,
            parse: ParseOptions::new(Path::new("unused"), &output, &services),
        };
        let summary = run_pipeline(&options, &Client::new()).await.unwrap();

        assert_eq!(summary.in_network_shards, 1);
        assert_eq!(summary.provider_reference_shards, 2);
        assert_eq!(summary.counters.provider_groups_matched, 1);
        // root, in_network, rate, price, provider_group, provider, tin
        assert_eq!(summary.output.rows, 7);
        assert_eq!(fs::read_dir(&tmp).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_local_input_fails_before_splitting() {
        let dir = tempfile::tempdir().unwrap();
        let options = PipelineOptions {
            input: dir.path().join("absent.json").to_string_lossy().into_owned(),
            tmp_dir: dir.path().join("tmp"),
            lines_per_shard: 10,
            download_retries: 0,
            parse: ParseOptions::new(Path::new("unused"), dir.path(), Path::new("s.csv")),
        };
        assert!(run_pipeline(&options, &Client::new()).await.is_err());
    }
}

mod args;
mod common;
mod config;
mod constants;
mod fields;
mod filters;
mod in_network;
mod model;
mod parquet_writer;
mod parse;
mod pipeline;
mod pool;
mod provider_reference;
mod reader;
mod root;
mod sink;
mod split;
mod storage;

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Client;
use std::time::Instant;
use tracing::info;

use args::{Args, Command};
use config::FileConfig;
use parse::run_parse;
use pipeline::run_pipeline;
use split::{SplitOptions, split_file};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = FileConfig::load(args.config.as_deref())?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(args.log_level(&config)))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Parse(cmd) => {
            let options = cmd.to_options(&config)?;
            let summary = run_parse(&options).await.context("parse failed")?;
            summary.log();
        }
        Command::Split(cmd) => {
            let started = Instant::now();
            let options = SplitOptions {
                input: cmd.input,
                output_dir: cmd.output,
                lines_per_shard: cmd.lines_per_shard,
                overwrite: cmd.overwrite,
            };
            tokio::task::spawn_blocking(move || split_file(&options))
                .await
                .context("Split task panicked")?
                .context("split failed")?;
            info!("Completed in {:.1?}", started.elapsed());
        }
        Command::Pipeline(cmd) => {
            let options = cmd.to_options(&config)?;
            let mut client =
                Client::builder().user_agent(concat!("mrfparse/", env!("CARGO_PKG_VERSION")));
            if let Some(timeout) = cmd.download_timeout(&config) {
                info!("HTTP download timeout set to {timeout:?}");
                client = client.timeout(timeout);
            }
            let client = client.build().context("Failed creating HTTP client")?;
            let summary = run_pipeline(&options, &client)
                .await
                .context("pipeline failed")?;
            summary.log();
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;

use news_catcher::config::Config;
use news_catcher::feed::{run_batch, FeedFetcher};
use news_catcher::storage::{default_file_name, FileStore};

#[derive(Parser, Debug)]
#[command(
    name = "news-catcher",
    version,
    about = "Fetch RSS feeds concurrently and store them as one JSON file"
)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config file {}", args.config.display()))?;

    let fetcher =
        FeedFetcher::new(config.fetch.fetcher_config()).context("Failed to build HTTP client")?;
    let outcome = run_batch(&fetcher, &config.sources, &config.fetch.batch_options()).await;

    // Each failure is already logged by the batch.
    if !outcome.failures.is_empty() {
        eprintln!(
            "Warning: {} of {} feeds failed (set RUST_LOG=warn for details)",
            outcome.failures.len(),
            config.sources.len() - outcome.skipped.len()
        );
    }

    if outcome.collection.is_empty() && config.fail_on_empty {
        anyhow::bail!(
            "No feed could be fetched ({} failed, {} skipped)",
            outcome.failures.len(),
            outcome.skipped.len()
        );
    }

    let json = outcome
        .collection
        .to_json()
        .context("Failed to serialize feed collection")?;

    let filename = config
        .output_file
        .clone()
        .unwrap_or_else(|| default_file_name(Utc::now()));
    let store = FileStore::new(&config.output_dir);
    let path = store
        .store(&filename, &json)
        .context("Failed to store feed collection")?;

    tracing::info!(path = %path.display(), feeds = outcome.succeeded(), "Stored feed collection");
    println!(
        "Stored {} feeds ({} items) in {}",
        outcome.succeeded(),
        outcome.collection.items().len(),
        path.display()
    );
    Ok(())
}

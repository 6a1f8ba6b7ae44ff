use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use ghfetcher::{FetcherConfig, GitFetcher};
use prstore::{
    config::{EmbeddingConfig, LoaderConfig, StorageConfig},
    fetch::IngestWindow,
    sync::IngestOptions,
    PrStore,
};

const DEFAULT_DAYS: i64 = 30;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_flag(name: &str) -> bool {
    env_var(name)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let repository = env_var("GITHUB_REPOSITORY")
        .context("GITHUB_REPOSITORY must be set to <owner>/<name>")?;
    let base_path = env_var("PRSTORE_BASE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("prstore-data"));
    let days = match env_var("INGEST_DAYS") {
        Some(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("INGEST_DAYS must be a number of days, got '{raw}'"))?,
        None => DEFAULT_DAYS,
    };

    let mut fetcher_config = FetcherConfig {
        token: env_var("GITHUB_TOKEN"),
        ..FetcherConfig::default()
    };
    if let Some(base_url) = env_var("GITHUB_API_BASE_URL") {
        fetcher_config.api_base_url = base_url;
    }
    if fetcher_config.token.is_none() {
        log::warn!("GITHUB_TOKEN is not set; unauthenticated requests are heavily rate limited");
    }

    let embedding = EmbeddingConfig::from_env().context("invalid embedding configuration")?;
    let storage = PrStore::with_options(
        StorageConfig::new(&base_path),
        &embedding,
        &LoaderConfig::default(),
    )
    .await
    .with_context(|| format!("failed to open storage at {:?}", base_path))?;

    let fetcher = GitFetcher::with_default_client(
        &repository,
        fetcher_config,
        Some(storage.cache.clone()),
    )
    .context("failed to initialize GitFetcher client")?;

    let options = IngestOptions {
        open_limit: env_flag("INGEST_INCLUDE_OPEN").then_some(100),
        embedding_batch_size: embedding.batch_size,
        ..IngestOptions::default()
    };
    let window = IngestWindow::last_days(days, Utc::now());

    log::info!(
        "Backfilling {} from {} to {} into {:?}",
        repository,
        window.since,
        window.until,
        base_path
    );
    let report = storage
        .synchronizer
        .ingest(&fetcher, window, &options)
        .await
        .context("ingest failed")?;

    log::info!(
        "Task {} finished with {}: {} pull requests fetched, {} embedding batches failed",
        report.task_id,
        report.status.as_str(),
        report.fetched,
        report.failed_embedding_batches
    );
    println!("{}", serde_json::to_string_pretty(&report.load.to_json())?);
    Ok(())
}

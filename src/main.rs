// src/main.rs

use anyhow::{bail, Result};
use clap::Parser;
use resumable_fetch::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Fetch a URL, optionally pausing and resuming it once on the way.
#[derive(Debug, Parser)]
#[command(name = "resumable-fetch", version)]
struct Args {
    /// Resource to fetch.
    url: String,
    /// Pause this many milliseconds after dispatch.
    #[arg(long)]
    pause_after_ms: Option<u64>,
    /// How long to stay paused before resuming.
    #[arg(long, default_value_t = 1000)]
    pause_for_ms: u64,
    /// Give up waiting for the result after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
    #[arg(long)]
    follow_redirects: bool,
    /// Connection timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,
    /// Expected SHA-256 of the content, hex encoded.
    #[arg(long)]
    sha256: Option<String>,
    /// TOML file with manager settings.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ManagerConfig::load(path).await?,
        None => ManagerConfig::default(),
    };

    let http = HttpProtocol::default();
    let manager = DownloadManager::builder()
        .register("http", http.clone())
        .register("https", http)
        .config(config)
        .build()?;

    let mut spec = RequestSpec::builder(args.url.as_str())
        .with_connection_timeout(Duration::from_millis(args.connect_timeout_ms))
        .with_follow_redirects(args.follow_redirects);
    if let Some(digest) = &args.sha256 {
        spec = spec.with_expected_sha256(digest.as_str());
    }
    let handle = manager.dispatch(spec.build()?)?;

    if let Some(delay) = args.pause_after_ms {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        match handle.pause().await {
            Ok(()) => {
                tracing::info!(bytes = handle.bytes_received(), "Paused");
                tokio::time::sleep(Duration::from_millis(args.pause_for_ms)).await;
                handle.resume().await?;
            }
            Err(e) => tracing::warn!(error = %e, "Pause skipped"),
        }
    }

    let result = handle
        .await_result_timeout(Duration::from_secs(args.timeout_secs))
        .await;
    let snapshot = handle.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    manager.shutdown_now();
    manager.join().await;

    match (snapshot.status, result) {
        (DownloadStatus::Finished, Some(content)) => {
            tracing::info!(bytes = content.len(), "Done");
            Ok(())
        }
        (status, _) => bail!("transfer ended as {}", status),
    }
}

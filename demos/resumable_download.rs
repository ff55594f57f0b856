//! Resumable download walkthrough
//!
//! Downloads an object in ranged parts, pauses half way and resumes. Uses
//! an OBS endpoint when `OBS_ENDPOINT` is set (with `OBS_BUCKET`, `OBS_KEY`
//! and optionally `OBS_TOKEN`), otherwise an in-memory store.
//!
//! Run with: cargo run --example resumable_download

use obs_client::{Config, ObsClient};
use obs_transfer::{
    download_file, DownloadFileRequest, MemoryEndpoint, ProgressConfig, ResumableOptions, StorageEndpoint,
    TransferControl, TransferError,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MIB: u64 = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resumable_download=info,obs_transfer=info,obs_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let dir = tempfile::tempdir()?;
    let target = dir.path().join("download").join("object.bin");

    match std::env::var("OBS_ENDPOINT") {
        Ok(endpoint) => {
            let bucket = std::env::var("OBS_BUCKET")?;
            let key = std::env::var("OBS_KEY")?;
            let mut config = Config::new(endpoint);
            if let Ok(token) = std::env::var("OBS_TOKEN") {
                config = config.with_token(token);
            }
            let client = Arc::new(ObsClient::new(config)?);
            pause_and_resume(client, &bucket, &key, &target).await?;
        }
        Err(_) => {
            let endpoint = Arc::new(MemoryEndpoint::new());
            endpoint.put_object("media", "object.bin", vec![7u8; 12 * MIB as usize]);
            endpoint.set_latency(Duration::from_millis(50));
            pause_and_resume(endpoint, "media", "object.bin", &target).await?;
        }
    }

    tracing::info!(bytes = std::fs::metadata(&target)?.len(), "saved {}", target.display());
    Ok(())
}

async fn pause_and_resume<E>(endpoint: Arc<E>, bucket: &str, key: &str, target: &Path) -> anyhow::Result<()>
where
    E: StorageEndpoint + 'static,
{
    let control = TransferControl::new();
    let options = ResumableOptions::default()
        .with_part_size(MIB)
        .with_task_num(2)
        .with_checkpoint(None)
        .with_progress(ProgressConfig::by_seconds(Duration::from_millis(100)), |status| {
            tracing::info!(
                "{}% at {:.0} KiB/s",
                status.transfer_percentage(),
                status.instantaneous_speed() / 1024.0
            );
        });
    let request =
        DownloadFileRequest::new(bucket, key, target).with_options(options.clone().with_control(control.clone()));

    let pause = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        pause.pause();
    });

    match download_file(Arc::clone(&endpoint), request).await {
        Ok(result) => {
            tracing::info!(etag = %result.etag, "finished before the pause landed");
            return Ok(());
        }
        Err(TransferError::Paused { checkpoint_retained }) => {
            tracing::info!(checkpoint_retained, "paused");
        }
        Err(e) => return Err(e.into()),
    }

    // A fresh control handle; the paused one stays cancelled
    let request =
        DownloadFileRequest::new(bucket, key, target).with_options(options.with_control(TransferControl::new()));
    let result = download_file(endpoint, request).await?;
    tracing::info!(
        etag = %result.etag,
        resumed = result.outcome.parts_resumed,
        transferred = result.outcome.parts_transferred,
        "download resumed and finished"
    );
    Ok(())
}

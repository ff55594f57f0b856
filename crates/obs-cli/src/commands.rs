//! Subcommand execution

use obs_transfer::{
    abort_upload, download_file, upload_file, DownloadFileRequest, ObjectMetadata, ProgressObserver,
    ResumableOptions, StorageEndpoint, TransferError, TransferStatus, UploadFileRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Upload a local file
#[derive(Clone, Debug)]
pub struct UploadArgs {
    pub bucket: String,
    pub key: String,
    pub file: PathBuf,
    pub content_type: Option<String>,
}

/// Download an object to a local file
#[derive(Clone, Debug)]
pub struct DownloadArgs {
    pub bucket: String,
    pub key: String,
    pub file: PathBuf,
    pub version_id: Option<String>,
}

/// Run an upload and log its result
pub async fn run_upload<E>(endpoint: Arc<E>, args: UploadArgs, options: ResumableOptions) -> anyhow::Result<()>
where
    E: StorageEndpoint + ?Sized + 'static,
{
    let mut request = UploadFileRequest::new(args.bucket, args.key, args.file).with_options(options);
    if let Some(content_type) = args.content_type {
        request = request.with_metadata(ObjectMetadata::new().with_content_type(content_type));
    }
    let checkpoint = request.checkpoint_path();

    match upload_file(endpoint, request).await {
        Ok(result) => {
            info!(
                bucket = %result.bucket,
                key = %result.key,
                etag = %result.etag,
                parts = result.outcome.parts_total,
                resumed = result.outcome.parts_resumed,
                "upload complete in {:.1}s",
                result.outcome.elapsed.as_secs_f64()
            );
            Ok(())
        }
        Err(e) => Err(explain(e, checkpoint)),
    }
}

/// Run a download and log its result
pub async fn run_download<E>(endpoint: Arc<E>, args: DownloadArgs, options: ResumableOptions) -> anyhow::Result<()>
where
    E: StorageEndpoint + ?Sized + 'static,
{
    let mut request = DownloadFileRequest::new(args.bucket, args.key, args.file).with_options(options);
    if let Some(version_id) = args.version_id {
        request = request.with_version(version_id);
    }
    let checkpoint = request.checkpoint_path();

    match download_file(endpoint, request).await {
        Ok(result) => {
            info!(
                path = %result.path.display(),
                etag = %result.etag,
                parts = result.outcome.parts_total,
                resumed = result.outcome.parts_resumed,
                "download complete in {:.1}s",
                result.outcome.elapsed.as_secs_f64()
            );
            Ok(())
        }
        Err(e) => Err(explain(e, checkpoint)),
    }
}

/// Abort the upload recorded in `checkpoint`
pub async fn run_abort<E>(endpoint: &E, checkpoint: PathBuf) -> anyhow::Result<()>
where
    E: StorageEndpoint + ?Sized,
{
    match abort_upload(endpoint, &checkpoint).await? {
        Some(upload_id) => info!(%upload_id, "upload aborted"),
        None => warn!(checkpoint = %checkpoint.display(), "no upload recorded in checkpoint"),
    }
    Ok(())
}

/// Progress observer that logs each notification
pub fn log_progress() -> ProgressObserver {
    Arc::new(|status: TransferStatus| {
        info!(
            transferred = status.transferred_bytes,
            total = status.total_bytes,
            "{}% at {:.1} KiB/s",
            status.transfer_percentage(),
            status.instantaneous_speed() / 1024.0
        );
    })
}

fn explain(err: TransferError, checkpoint: Option<PathBuf>) -> anyhow::Error {
    let Some(path) = checkpoint else {
        return err.into();
    };
    match err {
        TransferError::Paused { checkpoint_retained: true } => {
            anyhow::anyhow!("transfer paused; run the same command again to resume from {}", path.display())
        }
        TransferError::StaleCheckpoint { .. } => anyhow::anyhow!(
            "{}; delete {} (or run `abort` for uploads) to start over",
            err,
            path.display()
        ),
        err => err.into(),
    }
}

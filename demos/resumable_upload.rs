//! Resumable upload walkthrough
//!
//! Uploads a generated file to an in-memory store, fails one part on the
//! first run and resumes from the checkpoint on the second. Finishes with a
//! stream upload from memory.
//!
//! Run with: cargo run --example resumable_upload

use bytes::Bytes;
use obs_transfer::{
    upload_file, upload_stream, BytesSource, CheckpointStore, FailurePolicy, MemoryEndpoint, ProgressConfig,
    ResumableOptions, RetryPolicy, UploadFileRequest, UploadStreamRequest,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MIB: u64 = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resumable_upload=info,obs_transfer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("dataset.csv");
    let data: Vec<u8> = (0..25 * MIB).map(|i| b"0123456789,\n"[(i % 12) as usize]).collect();
    std::fs::write(&path, &data)?;

    let endpoint = Arc::new(MemoryEndpoint::new());
    endpoint.fail_part(2, None);

    let options = ResumableOptions::default()
        .with_part_size(9 * MIB)
        .with_task_num(3)
        .with_checkpoint(None)
        .with_retry(RetryPolicy::none())
        .with_failure_policy(FailurePolicy::ContinueOnError)
        .with_progress(ProgressConfig::by_bytes(4 * MIB), |status| {
            tracing::info!(
                "progress {}% ({} / {} bytes)",
                status.transfer_percentage(),
                status.transferred_bytes,
                status.total_bytes
            );
        });
    let request = UploadFileRequest::new("datasets", "2024/dataset.csv", &path)
        .with_options(options)
        .on_event(|event| tracing::info!(?event, "upload event"));

    // First run: part 2 fails, parts 1 and 3 land in the checkpoint
    match upload_file(Arc::clone(&endpoint), request.clone()).await {
        Ok(_) => anyhow::bail!("first run was expected to fail"),
        Err(e) => tracing::warn!(error = %e, "first run failed"),
    }
    if let Some(checkpoint) = request.checkpoint_path() {
        if let Some(record) = CheckpointStore::new(&checkpoint).load().await? {
            tracing::info!(completed = ?record.completed_numbers(), "checkpoint {}", checkpoint.display());
        }
    }

    // Second run: only part 2 is sent
    endpoint.clear_faults();
    endpoint.reset_calls();
    let result = upload_file(Arc::clone(&endpoint), request).await?;
    tracing::info!(
        etag = %result.etag,
        sent = ?endpoint.calls().upload_parts,
        resumed = result.outcome.parts_resumed,
        "upload complete"
    );

    // Stream upload from memory
    let body = Bytes::from(vec![42u8; 3 * MIB as usize]);
    let request = UploadStreamRequest::new("datasets", "blob.bin", Arc::new(BytesSource::new(body)))
        .with_options(ResumableOptions::default().with_part_size(MIB).with_task_num(2));
    let result = upload_stream(endpoint, request).await?;
    tracing::info!(etag = %result.etag, parts = result.outcome.parts_total, "stream upload complete");

    Ok(())
}

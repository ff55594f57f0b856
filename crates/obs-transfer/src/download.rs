//! Resumable ranged download
//!
//! Parts are fetched with ranged reads and written at their offsets into a
//! pre-sized `<file>.tmp`. The temp file is renamed into place only after
//! every part is present and the byte count matches the object size.

use crate::checkpoint::{CheckpointJournal, CheckpointRecord, CheckpointStore, SourceFingerprint, SourceIdentity};
use crate::endpoint::StorageEndpoint;
use crate::error::PartFailure;
use crate::events::{notify, ResumableDownloadEvent, ResumableDownloadEventType};
use crate::lifecycle::{retry_part, Lifecycle, StopReason, TransferOutcome, TransferState};
use crate::plan::{effective_part_size, PartSpec, TransferPlan};
use crate::progress::ProgressAggregator;
use crate::request::{validate_target, DownloadFileRequest, FailurePolicy};
use crate::scheduler::{PartTaskResult, Scheduler};
use crate::types::CompletedPart;
use crate::{Result, TransferError};
use dashmap::DashMap;
use futures::TryStreamExt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

/// A finished download
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadFileResult {
    pub bucket: String,
    pub key: String,
    /// Final location of the downloaded file
    pub path: PathBuf,
    pub etag: String,
    pub version_id: Option<String>,
    pub outcome: TransferOutcome,
}

/// Download an object into a local file, resuming from its checkpoint when
/// one exists.
#[instrument(skip_all, fields(bucket = %request.bucket, key = %request.key))]
pub async fn download_file<E>(endpoint: Arc<E>, request: DownloadFileRequest) -> Result<DownloadFileResult>
where
    E: StorageEndpoint + ?Sized + 'static,
{
    validate_target(&request.bucket, &request.key)?;
    let mut lifecycle = Lifecycle::new(&request.bucket, &request.key);
    match drive_download(&endpoint, &request, &mut lifecycle).await {
        Ok(result) => Ok(result),
        Err(e) => lifecycle.fail(e),
    }
}

async fn drive_download<E>(
    endpoint: &Arc<E>,
    request: &DownloadFileRequest,
    lifecycle: &mut Lifecycle,
) -> Result<DownloadFileResult>
where
    E: StorageEndpoint + ?Sized + 'static,
{
    let started = Instant::now();
    let options = &request.options;
    let emit = |event_type, part_number, etag: Option<&str>| {
        notify(
            &request.event_handler,
            ResumableDownloadEvent {
                event_type,
                part_number,
                etag: etag.map(str::to_string),
            },
        )
    };

    lifecycle.transition(TransferState::Planning)?;
    let info = endpoint
        .head_object(&request.bucket, &request.key, request.version_id.as_deref())
        .await?;
    let plan = TransferPlan::new(info.size, effective_part_size(info.size, options.part_size()))?;
    let fingerprint = SourceFingerprint {
        bucket: request.bucket.clone(),
        key: request.key.clone(),
        source: SourceIdentity::RemoteObject {
            size: info.size,
            etag: info.etag.clone(),
            version_id: info.version_id.clone(),
            destination: request.download_file.clone(),
        },
    };
    let temp_path = request.temp_download_path();

    let store = request.checkpoint_path().map(CheckpointStore::new);
    let _lock = match &store {
        Some(store) if options.lock_checkpoint => Some(store.lock()?),
        _ => None,
    };
    let existing = match &store {
        Some(store) => store.load().await?.map(|record| (store.path().to_path_buf(), record)),
        None => None,
    };

    let journal = match existing {
        Some((path, record)) => {
            record.validate(&path, &fingerprint, &plan)?;
            if temp_file_len(&temp_path).await? != Some(info.size) {
                return Err(TransferError::StaleCheckpoint {
                    path,
                    reason: format!("temp file {} is missing or resized", temp_path.display()),
                });
            }
            lifecycle.transition(TransferState::Resuming)?;
            info!(completed = record.completed_parts.len(), "resuming download from checkpoint");
            CheckpointJournal::new(store, record)
        }
        None => {
            lifecycle.transition(TransferState::Initiating)?;
            create_temp_file(&temp_path, info.size).await?;
            let journal = CheckpointJournal::new(store, CheckpointRecord::new(fingerprint, &plan, None));
            journal.flush().await?;
            journal
        }
    };

    lifecycle.transition(TransferState::Transferring)?;
    let completed = journal.completed_numbers();
    let pending = plan.pending_parts(&completed);
    let resumed_bytes = journal.completed_bytes();
    info!(
        size = info.size,
        parts = plan.len(),
        pending = pending.len(),
        part_size = plan.part_size(),
        task_num = options.task_num(),
        "downloading parts"
    );

    let progress = ProgressAggregator::new(
        info.size as i64,
        options.progress.clone(),
        options.progress_observer.clone(),
    )
    .with_initial(resumed_bytes);
    progress.start();

    // Pause and abort interrupt parts in flight; a failed part or checkpoint
    // write only stops dispatch so running siblings can land
    let interrupt = options.control.token().clone();
    let dispatch = interrupt.child_token();
    let attempts: Arc<DashMap<u32, u32>> = Arc::new(DashMap::new());
    let part_fn = {
        let endpoint = Arc::clone(endpoint);
        let bucket: Arc<str> = request.bucket.as_str().into();
        let key: Arc<str> = request.key.as_str().into();
        let version_id: Option<Arc<str>> = request.version_id.as_deref().map(Arc::from);
        let temp_path: Arc<Path> = Arc::from(temp_path.as_path());
        let etag: Arc<str> = info.etag.as_str().into();
        let progress = progress.clone();
        let retry = options.retry.clone();
        let dispatch = dispatch.clone();
        let attempts = Arc::clone(&attempts);

        move |part: PartSpec| {
            let endpoint = Arc::clone(&endpoint);
            let bucket = Arc::clone(&bucket);
            let key = Arc::clone(&key);
            let version_id = version_id.clone();
            let temp_path = Arc::clone(&temp_path);
            let etag = Arc::clone(&etag);
            let progress = progress.clone();
            let retry = retry.clone();
            let dispatch = dispatch.clone();
            let attempts = Arc::clone(&attempts);

            async move {
                let reported = AtomicU64::new(0);
                let target = RangeTarget {
                    bucket: &bucket,
                    key: &key,
                    version_id: version_id.as_deref(),
                    temp_path: &temp_path,
                    progress: &progress,
                    reported: &reported,
                };
                let (endpoint, target, etag) = (&endpoint, &target, &etag);
                retry_part(&retry, &dispatch, part, move |attempt| async move {
                    debug!(part_number = part.part_number, attempt, "downloading part");
                    fetch_part(endpoint.as_ref(), target, part).await?;
                    Ok::<String, TransferError>(etag.to_string())
                })
                .await
                .map_err(|(error, tried)| {
                    attempts.insert(part.part_number, tried);
                    error
                })
            }
        }
    };

    let mut results = Scheduler::new(options.task_num()).run(pending, dispatch.clone(), interrupt, part_fn);
    let mut failures = Vec::new();
    let mut flush_error = None;
    let mut parts_transferred = 0usize;

    while let Some(PartTaskResult { part, outcome }) = results.recv().await {
        match outcome {
            Ok(receipt) => {
                parts_transferred += 1;
                let completed = CompletedPart {
                    part_number: part.part_number,
                    etag: receipt.etag.clone(),
                    length: part.length,
                };
                if let Err(e) = journal.record_part(completed).await {
                    warn!(part_number = part.part_number, error = %e, "failed to write checkpoint");
                    if flush_error.is_none() {
                        flush_error = Some(e);
                        dispatch.cancel();
                    }
                }
                emit(
                    ResumableDownloadEventType::DownloadPartSucceed,
                    part.part_number,
                    Some(&receipt.etag),
                );
            }
            Err(TransferError::Cancelled) => {
                debug!(part_number = part.part_number, "part cancelled");
            }
            Err(error) => {
                let tried = attempts.get(&part.part_number).map(|a| *a).unwrap_or(1);
                warn!(
                    part_number = part.part_number,
                    attempts = tried,
                    error = %error,
                    "part download failed"
                );
                emit(ResumableDownloadEventType::DownloadPartFailed, part.part_number, None);
                failures.push(PartFailure {
                    part_number: part.part_number,
                    attempts: tried,
                    error: Box::new(error),
                });
                if options.failure_policy == FailurePolicy::FailFast {
                    dispatch.cancel();
                }
            }
        }
    }

    let durable = journal.is_durable();
    match options.control.stop_reason() {
        Some(StopReason::Abort) => {
            progress.stop();
            lifecycle.transition(TransferState::Aborted)?;
            info!(temp_file = %temp_path.display(), "download aborted");
            return Err(TransferError::Aborted);
        }
        Some(StopReason::Pause) => {
            progress.stop();
            info!(checkpoint_retained = durable, "download paused");
            return Err(TransferError::Paused {
                checkpoint_retained: durable,
            });
        }
        None => {}
    }

    if let Some(e) = flush_error {
        progress.stop();
        return Err(e);
    }

    if !failures.is_empty() {
        progress.stop();
        return Err(TransferError::PartTransfer {
            failures,
            checkpoint_retained: durable,
        });
    }

    lifecycle.transition(TransferState::Completing)?;
    let written = journal.completed_bytes();
    let on_disk = temp_file_len(&temp_path).await?.unwrap_or(0);
    if written != info.size || on_disk != info.size {
        progress.stop();
        return Err(TransferError::LengthMismatch {
            expected: info.size,
            actual: if written != info.size { written } else { on_disk },
        });
    }

    if options.verify_source {
        let current = endpoint
            .head_object(&request.bucket, &request.key, request.version_id.as_deref())
            .await?;
        if current.etag != info.etag || current.size != info.size {
            progress.stop();
            warn!(expected = %info.etag, actual = %current.etag, "object changed, discarding download");
            journal.discard().await?;
            remove_if_exists(&temp_path).await?;
            return Err(TransferError::SourceChanged(format!(
                "{}/{} changed during download",
                request.bucket, request.key
            )));
        }
    }

    if let Err(e) = tokio::fs::rename(&temp_path, &request.download_file).await {
        progress.stop();
        warn!(error = %e, "failed to rename temp file");
        emit(ResumableDownloadEventType::RenameTempFileFailed, 0, None);
        return Err(e.into());
    }
    emit(ResumableDownloadEventType::RenameTempFileSucceed, 0, Some(&info.etag));

    if let Err(e) = journal.discard().await {
        warn!(error = %e, "failed to delete checkpoint after download");
    }
    progress.finish();
    lifecycle.transition(TransferState::Done)?;

    let outcome = TransferOutcome {
        total_bytes: info.size,
        transferred_bytes: progress.transferred_bytes().saturating_sub(resumed_bytes),
        resumed_bytes,
        parts_total: plan.len(),
        parts_transferred,
        parts_resumed: completed.len(),
        elapsed: started.elapsed(),
    };
    info!(
        path = %request.download_file.display(),
        bytes = outcome.transferred_bytes,
        resumed_bytes,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "download completed"
    );

    Ok(DownloadFileResult {
        bucket: request.bucket.clone(),
        key: request.key.clone(),
        path: request.download_file.clone(),
        etag: info.etag,
        version_id: info.version_id,
        outcome,
    })
}

/// Where one part's bytes go
struct RangeTarget<'a> {
    bucket: &'a str,
    key: &'a str,
    version_id: Option<&'a str>,
    temp_path: &'a Path,
    progress: &'a ProgressAggregator,
    /// Highest byte count of this part already counted towards progress
    reported: &'a AtomicU64,
}

async fn fetch_part<E>(endpoint: &E, target: &RangeTarget<'_>, part: PartSpec) -> Result<()>
where
    E: StorageEndpoint + ?Sized,
{
    if part.length == 0 {
        return Ok(());
    }

    let mut body = endpoint
        .get_object_range(target.bucket, target.key, target.version_id, part.range())
        .await?;
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(target.temp_path)
        .await?;
    file.seek(SeekFrom::Start(part.offset)).await?;

    let mut written = 0u64;
    while let Some(chunk) = body.try_next().await? {
        let next = written + chunk.len() as u64;
        if next > part.length {
            return Err(TransferError::LengthMismatch {
                expected: part.length,
                actual: next,
            });
        }
        file.write_all(&chunk).await?;
        written = next;

        let previous = target.reported.fetch_max(written, Ordering::SeqCst);
        if written > previous {
            target.progress.record(written - previous);
        }
    }

    if written != part.length {
        return Err(TransferError::LengthMismatch {
            expected: part.length,
            actual: written,
        });
    }
    file.sync_data().await?;
    Ok(())
}

async fn create_temp_file(path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(path).await?;
    file.set_len(size).await?;
    Ok(())
}

async fn temp_file_len(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

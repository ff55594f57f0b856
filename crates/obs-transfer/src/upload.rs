//! Resumable multipart upload
//!
//! An upload plans the source into parts, resumes or initiates a multipart
//! session, pushes the pending parts through the scheduler and combines them
//! in part-number order. Progress is checkpointed after every part so a
//! failed or paused upload can be re-run and only the missing parts are sent.

use crate::checkpoint::{CheckpointJournal, CheckpointRecord, CheckpointStore, SourceFingerprint};
use crate::endpoint::{EndpointResult, PartBody, StorageEndpoint};
use crate::error::PartFailure;
use crate::events::{notify, ResumableUploadEvent, ResumableUploadEventType, UploadEventHandler};
use crate::lifecycle::{retry_part, Lifecycle, StopReason, TransferOutcome, TransferState};
use crate::plan::{effective_part_size, PartSpec, TransferPlan};
use crate::progress::ProgressAggregator;
use crate::request::{validate_target, FailurePolicy, ResumableOptions, UploadFileRequest, UploadStreamRequest};
use crate::scheduler::{PartTaskResult, Scheduler};
use crate::source::{FileSource, PartSource};
use crate::types::{CompletedPart, ObjectMetadata};
use crate::{Result, TransferError};
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Size of the chunks a part body is streamed in
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// A finished upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadFileResult {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// Object URL reported by the service
    pub location: String,
    /// ETag of the combined object
    pub etag: String,
    pub version_id: Option<String>,
    pub outcome: TransferOutcome,
}

struct UploadJob {
    bucket: String,
    key: String,
    source: Arc<dyn PartSource>,
    metadata: ObjectMetadata,
    options: ResumableOptions,
    checkpoint: Option<PathBuf>,
    events: Option<UploadEventHandler>,
}

impl UploadJob {
    fn emit(&self, event: ResumableUploadEvent) {
        notify(&self.events, event);
    }
}

/// Upload a local file, resuming from its checkpoint when one exists.
///
/// The content type is guessed from the file extension unless the request
/// sets one.
#[instrument(skip_all, fields(bucket = %request.bucket, key = %request.key))]
pub async fn upload_file<E>(endpoint: Arc<E>, request: UploadFileRequest) -> Result<UploadFileResult>
where
    E: StorageEndpoint + ?Sized + 'static,
{
    validate_target(&request.bucket, &request.key)?;
    let checkpoint = request.checkpoint_path();
    let source = FileSource::open(&request.upload_file).await?;

    let mut metadata = request.metadata;
    if metadata.content_type.is_none() {
        metadata.content_type = mime_guess::from_path(&request.upload_file)
            .first_raw()
            .map(str::to_string);
    }

    run_upload(
        endpoint,
        UploadJob {
            bucket: request.bucket,
            key: request.key,
            source: Arc::new(source),
            metadata,
            options: request.options,
            checkpoint,
            events: request.event_handler,
        },
    )
    .await
}

/// Upload from a seekable source.
///
/// Checkpointing needs an explicit checkpoint file since a stream has no
/// path to derive one from.
#[instrument(skip_all, fields(bucket = %request.bucket, key = %request.key))]
pub async fn upload_stream<E>(endpoint: Arc<E>, request: UploadStreamRequest) -> Result<UploadFileResult>
where
    E: StorageEndpoint + ?Sized + 'static,
{
    validate_target(&request.bucket, &request.key)?;
    if request.options.enable_checkpoint && request.options.checkpoint_file.is_none() {
        return Err(TransferError::InvalidArgument(
            "stream uploads need an explicit checkpoint file".to_string(),
        ));
    }
    let checkpoint = request.checkpoint_path();

    run_upload(
        endpoint,
        UploadJob {
            bucket: request.bucket,
            key: request.key,
            source: request.source,
            metadata: request.metadata,
            options: request.options,
            checkpoint,
            events: request.event_handler,
        },
    )
    .await
}

async fn run_upload<E>(endpoint: Arc<E>, job: UploadJob) -> Result<UploadFileResult>
where
    E: StorageEndpoint + ?Sized + 'static,
{
    let mut lifecycle = Lifecycle::new(&job.bucket, &job.key);
    match drive_upload(&endpoint, &job, &mut lifecycle).await {
        Ok(result) => Ok(result),
        Err(e) => lifecycle.fail(e),
    }
}

async fn drive_upload<E>(endpoint: &Arc<E>, job: &UploadJob, lifecycle: &mut Lifecycle) -> Result<UploadFileResult>
where
    E: StorageEndpoint + ?Sized + 'static,
{
    let started = Instant::now();
    let options = &job.options;

    lifecycle.transition(TransferState::Planning)?;
    let total_size = job.source.size();
    let plan = TransferPlan::new(total_size, effective_part_size(total_size, options.part_size()))?;
    let fingerprint = SourceFingerprint {
        bucket: job.bucket.clone(),
        key: job.key.clone(),
        source: job.source.identity(),
    };

    let store = job.checkpoint.clone().map(CheckpointStore::new);
    let _lock = match &store {
        Some(store) if options.lock_checkpoint => Some(store.lock()?),
        _ => None,
    };
    let existing = match &store {
        Some(store) => store.load().await?.map(|record| (store.path().to_path_buf(), record)),
        None => None,
    };

    let (journal, upload_id) = match existing {
        Some((path, record)) => {
            record.validate(&path, &fingerprint, &plan)?;
            let Some(upload_id) = record.upload_id.clone() else {
                return Err(TransferError::StaleCheckpoint {
                    path,
                    reason: "checkpoint has no multipart upload session".to_string(),
                });
            };
            lifecycle.transition(TransferState::Resuming)?;
            info!(
                upload_id = %upload_id,
                completed = record.completed_parts.len(),
                "resuming upload from checkpoint"
            );
            (CheckpointJournal::new(store, record), upload_id)
        }
        None => {
            lifecycle.transition(TransferState::Initiating)?;
            let upload_id = initiate(endpoint.as_ref(), job).await?;
            let record = CheckpointRecord::new(fingerprint, &plan, Some(upload_id.clone()));
            let journal = CheckpointJournal::new(store, record);
            if let Err(e) = journal.flush().await {
                abort_session(endpoint.as_ref(), job, &upload_id).await;
                return Err(e);
            }
            (journal, upload_id)
        }
    };
    let upload_id: Arc<str> = upload_id.into();

    lifecycle.transition(TransferState::Transferring)?;
    let completed = journal.completed_numbers();
    let pending = plan.pending_parts(&completed);
    let resumed_bytes = journal.completed_bytes();
    info!(
        upload_id = %upload_id,
        parts = plan.len(),
        pending = pending.len(),
        part_size = plan.part_size(),
        task_num = options.task_num(),
        "uploading parts"
    );

    let progress = ProgressAggregator::new(
        total_size as i64,
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
        let source = Arc::clone(&job.source);
        let bucket: Arc<str> = job.bucket.as_str().into();
        let key: Arc<str> = job.key.as_str().into();
        let upload_id = Arc::clone(&upload_id);
        let progress = progress.clone();
        let retry = options.retry.clone();
        let dispatch = dispatch.clone();
        let attempts = Arc::clone(&attempts);

        move |part: PartSpec| {
            let endpoint = Arc::clone(&endpoint);
            let source = Arc::clone(&source);
            let bucket = Arc::clone(&bucket);
            let key = Arc::clone(&key);
            let upload_id = Arc::clone(&upload_id);
            let progress = progress.clone();
            let retry = retry.clone();
            let dispatch = dispatch.clone();
            let attempts = Arc::clone(&attempts);

            async move {
                let reported = Arc::new(AtomicU64::new(0));
                let (endpoint, source, progress, sent) = (&endpoint, &source, &progress, &reported);
                let (bucket, key, upload_id) = (&*bucket, &*key, &*upload_id);
                let receipt = retry_part(&retry, &dispatch, part, move |attempt| async move {
                    debug!(part_number = part.part_number, attempt, "uploading part");
                    let data = source.read_part(part.offset, part.length).await?;
                    let body = counted_body(data, progress.clone(), Arc::clone(sent));
                    let etag = endpoint
                        .upload_part(bucket, key, upload_id, part.part_number, body)
                        .await?;
                    Ok::<String, TransferError>(etag)
                })
                .await
                .map_err(|(error, tried)| {
                    attempts.insert(part.part_number, tried);
                    error
                })?;
                advance(progress, &reported, part.length);
                Ok(receipt)
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
                job.emit(ResumableUploadEvent::part(
                    ResumableUploadEventType::UploadPartSucceed,
                    &upload_id,
                    part.part_number,
                    Some(&receipt.etag),
                ));
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
                    "part upload failed"
                );
                job.emit(ResumableUploadEvent::part(
                    ResumableUploadEventType::UploadPartFailed,
                    &upload_id,
                    part.part_number,
                    None,
                ));
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
            abort_session(endpoint.as_ref(), job, &upload_id).await;
            journal.discard().await?;
            lifecycle.transition(TransferState::Aborted)?;
            info!(upload_id = %upload_id, "upload aborted");
            return Err(TransferError::Aborted);
        }
        Some(StopReason::Pause) => {
            progress.stop();
            if !durable {
                abort_session(endpoint.as_ref(), job, &upload_id).await;
            }
            info!(upload_id = %upload_id, checkpoint_retained = durable, "upload paused");
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
        if !durable {
            abort_session(endpoint.as_ref(), job, &upload_id).await;
        }
        return Err(TransferError::PartTransfer {
            failures,
            checkpoint_retained: durable,
        });
    }

    if options.verify_source {
        if let Err(e) = job.source.verify_unchanged().await {
            progress.stop();
            warn!(error = %e, "source changed, discarding upload");
            abort_session(endpoint.as_ref(), job, &upload_id).await;
            journal.discard().await?;
            return Err(e);
        }
    }

    lifecycle.transition(TransferState::Completing)?;
    let parts = journal.sorted_parts();
    let combined = match endpoint
        .complete_multipart_upload(&job.bucket, &job.key, &upload_id, &parts)
        .await
    {
        Ok(combined) => {
            job.emit(ResumableUploadEvent::upload(
                ResumableUploadEventType::CompleteMultipartUploadSucceed,
                Some(&upload_id),
            ));
            combined
        }
        Err(source) => {
            progress.stop();
            job.emit(ResumableUploadEvent::upload(
                ResumableUploadEventType::CompleteMultipartUploadFailed,
                Some(&upload_id),
            ));
            if !durable {
                abort_session(endpoint.as_ref(), job, &upload_id).await;
            }
            return Err(TransferError::Combine {
                source,
                checkpoint_retained: durable,
            });
        }
    };

    if let Err(e) = journal.discard().await {
        warn!(error = %e, "failed to delete checkpoint after upload");
    }
    progress.finish();
    lifecycle.transition(TransferState::Done)?;

    let outcome = TransferOutcome {
        total_bytes: total_size,
        transferred_bytes: progress.transferred_bytes().saturating_sub(resumed_bytes),
        resumed_bytes,
        parts_total: plan.len(),
        parts_transferred,
        parts_resumed: completed.len(),
        elapsed: started.elapsed(),
    };
    info!(
        upload_id = %upload_id,
        etag = %combined.etag,
        bytes = outcome.transferred_bytes,
        resumed_bytes,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "upload completed"
    );

    Ok(UploadFileResult {
        bucket: job.bucket.clone(),
        key: job.key.clone(),
        upload_id: upload_id.to_string(),
        location: combined.location,
        etag: combined.etag,
        version_id: combined.version_id,
        outcome,
    })
}

/// Stream `data` in chunks, recording each chunk as the endpoint pulls it.
/// `reported` is shared by every attempt at the part so a retry only counts
/// bytes beyond what earlier attempts already sent.
fn counted_body(data: Bytes, progress: ProgressAggregator, reported: Arc<AtomicU64>) -> PartBody {
    let length = data.len() as u64;
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|i| data.slice(i..(i + UPLOAD_CHUNK_SIZE).min(data.len())))
        .collect();

    let mut sent = 0u64;
    let stream = stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        advance(&progress, &reported, sent);
        EndpointResult::Ok(chunk)
    });
    PartBody::new(length, Box::pin(stream))
}

fn advance(progress: &ProgressAggregator, reported: &AtomicU64, upto: u64) {
    let previous = reported.fetch_max(upto, Ordering::SeqCst);
    if upto > previous {
        progress.record(upto - previous);
    }
}

async fn initiate<E>(endpoint: &E, job: &UploadJob) -> Result<String>
where
    E: StorageEndpoint + ?Sized,
{
    match endpoint
        .initiate_multipart_upload(&job.bucket, &job.key, &job.metadata)
        .await
    {
        Ok(upload_id) => {
            debug!(upload_id = %upload_id, "multipart upload initiated");
            job.emit(ResumableUploadEvent::upload(
                ResumableUploadEventType::InitiateMultipartUploadSucceed,
                Some(&upload_id),
            ));
            Ok(upload_id)
        }
        Err(e) => {
            job.emit(ResumableUploadEvent::upload(
                ResumableUploadEventType::InitiateMultipartUploadFailed,
                None,
            ));
            Err(e.into())
        }
    }
}

/// Best-effort abort of the server session; failures are reported as events
async fn abort_session<E>(endpoint: &E, job: &UploadJob, upload_id: &str)
where
    E: StorageEndpoint + ?Sized,
{
    match endpoint
        .abort_multipart_upload(&job.bucket, &job.key, upload_id)
        .await
    {
        Ok(()) => {
            debug!(upload_id, "multipart upload aborted");
            job.emit(ResumableUploadEvent::upload(
                ResumableUploadEventType::AbortMultipartUploadSucceed,
                Some(upload_id),
            ));
        }
        Err(e) => {
            warn!(upload_id, error = %e, "failed to abort multipart upload");
            job.emit(ResumableUploadEvent::upload(
                ResumableUploadEventType::AbortMultipartUploadFailed,
                Some(upload_id),
            ));
        }
    }
}

/// Abort the multipart session recorded in the checkpoint at `checkpoint`
/// and delete the checkpoint. Returns the aborted upload ID, if any.
pub async fn abort_upload<E>(endpoint: &E, checkpoint: impl Into<PathBuf>) -> Result<Option<String>>
where
    E: StorageEndpoint + ?Sized,
{
    let store = CheckpointStore::new(checkpoint);
    let Some(record) = store.load().await? else {
        return Ok(None);
    };
    let upload_id = record.upload_id.clone();
    if let Some(upload_id) = &upload_id {
        let fingerprint = &record.fingerprint;
        endpoint
            .abort_multipart_upload(&fingerprint.bucket, &fingerprint.key, upload_id)
            .await?;
        info!(
            bucket = %fingerprint.bucket,
            key = %fingerprint.key,
            upload_id = %upload_id,
            "multipart upload aborted"
        );
    }
    store.delete().await?;
    Ok(upload_id)
}

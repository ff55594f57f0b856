//! End-to-end resumable transfer scenarios against the in-memory endpoint
//!
//! Run with: cargo test --test resumable_transfer

use obs_transfer::{
    download_file, upload_file, CheckpointStore, DownloadFileRequest, FailurePolicy, MemoryEndpoint, ProgressConfig,
    ResumableOptions, RetryPolicy, TransferError, TransferStatus, UploadFileRequest,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

fn sample(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn statuses() -> (Arc<Mutex<Vec<TransferStatus>>>, impl Fn(TransferStatus) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |status| sink.lock().push(status))
}

// ═══════════════════════════════════════════════════════════════════════════════
// UPLOAD
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_upload_25mib_in_9mib_parts_resumes_failed_part() {
    let dir = TempDir::new().unwrap();
    let data = sample(25 * MIB);
    let path = write_file(dir.path(), "disk.img", &data);

    let endpoint = Arc::new(MemoryEndpoint::new());
    endpoint.fail_part(2, None);

    let request = UploadFileRequest::new("backups", "disk.img", &path).with_options(
        ResumableOptions::default()
            .with_part_size(9 * MIB)
            .with_task_num(3)
            .with_checkpoint(None)
            .with_retry(RetryPolicy::none())
            .with_failure_policy(FailurePolicy::ContinueOnError),
    );

    let err = upload_file(Arc::clone(&endpoint), request.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::PartTransfer {
            checkpoint_retained: true,
            ..
        }
    ));
    assert_eq!(err.failed_parts(), vec![2]);

    let checkpoint = request.checkpoint_path().unwrap();
    let record = CheckpointStore::new(&checkpoint).load().await.unwrap().unwrap();
    assert_eq!(record.completed_numbers().into_iter().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(endpoint.pending_uploads().len(), 1);

    endpoint.clear_faults();
    endpoint.reset_calls();
    let result = upload_file(Arc::clone(&endpoint), request).await.unwrap();

    let calls = endpoint.calls();
    assert_eq!(calls.initiated, 0);
    assert_eq!(calls.upload_parts, vec![2]);
    assert_eq!(calls.completes, vec![vec![1, 2, 3]]);
    assert_eq!(result.outcome.parts_total, 3);
    assert_eq!(result.outcome.parts_resumed, 2);
    assert_eq!(result.outcome.transferred_bytes, 9 * MIB);
    assert_eq!(endpoint.object("backups", "disk.img").unwrap(), data);
    assert!(!checkpoint.exists());
    assert!(endpoint.pending_uploads().is_empty());
}

#[tokio::test]
async fn test_upload_25mib_in_9mib_parts() {
    let dir = TempDir::new().unwrap();
    let data = sample(25 * MIB);
    let path = write_file(dir.path(), "disk.img", &data);

    let plan = obs_transfer::TransferPlan::new(25 * MIB, 9 * MIB).unwrap();
    let lengths: Vec<u64> = plan.parts().iter().map(|p| p.length).collect();
    assert_eq!(lengths, vec![9 * MIB, 9 * MIB, 7 * MIB]);

    let endpoint = Arc::new(MemoryEndpoint::new());
    let request = UploadFileRequest::new("backups", "disk.img", &path).with_options(
        ResumableOptions::default()
            .with_part_size(9 * MIB)
            .with_task_num(3)
            .with_checkpoint(None),
    );
    upload_file(Arc::clone(&endpoint), request.clone()).await.unwrap();

    assert_eq!(endpoint.calls().completes, vec![vec![1, 2, 3]]);
    assert_eq!(endpoint.object("backups", "disk.img").unwrap(), data);
    assert!(!request.checkpoint_path().unwrap().exists());
}

#[tokio::test]
async fn test_fail_fast_resume_sends_remaining_parts() {
    let dir = TempDir::new().unwrap();
    let data = sample(5 * MIB);
    let path = write_file(dir.path(), "five.bin", &data);

    let endpoint = Arc::new(MemoryEndpoint::new());
    endpoint.fail_part(3, None);
    let request = UploadFileRequest::new("b", "five.bin", &path).with_options(
        ResumableOptions::default()
            .with_part_size(MIB)
            .with_task_num(1)
            .with_checkpoint(None)
            .with_retry(RetryPolicy::none()),
    );

    let err = upload_file(Arc::clone(&endpoint), request.clone()).await.unwrap_err();
    assert_eq!(err.failed_parts(), vec![3]);
    let record = CheckpointStore::new(request.checkpoint_path().unwrap())
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.completed_numbers().into_iter().collect::<Vec<_>>(), vec![1, 2]);

    endpoint.clear_faults();
    endpoint.reset_calls();
    upload_file(Arc::clone(&endpoint), request).await.unwrap();

    let calls = endpoint.calls();
    assert_eq!(calls.upload_parts, vec![3, 4, 5]);
    assert_eq!(calls.completes, vec![vec![1, 2, 3, 4, 5]]);
    assert_eq!(endpoint.object("b", "five.bin").unwrap(), data);
}

#[tokio::test]
async fn test_fail_fast_upload_keeps_parts_already_in_flight() {
    let dir = TempDir::new().unwrap();
    let data = sample(25 * MIB);
    let path = write_file(dir.path(), "disk.img", &data);

    let endpoint = Arc::new(MemoryEndpoint::new());
    endpoint.fail_part(2, None);
    endpoint.delay_part(1, Duration::from_millis(100));
    endpoint.delay_part(3, Duration::from_millis(100));

    let request = UploadFileRequest::new("backups", "disk.img", &path).with_options(
        ResumableOptions::default()
            .with_part_size(9 * MIB)
            .with_task_num(3)
            .with_checkpoint(None)
            .with_retry(RetryPolicy::none()),
    );

    let err = upload_file(Arc::clone(&endpoint), request.clone()).await.unwrap_err();
    assert_eq!(err.failed_parts(), vec![2]);
    assert!(err.is_resumable());

    let record = CheckpointStore::new(request.checkpoint_path().unwrap())
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.completed_numbers().into_iter().collect::<Vec<_>>(), vec![1, 3]);

    endpoint.clear_faults();
    endpoint.reset_calls();
    let result = upload_file(Arc::clone(&endpoint), request).await.unwrap();

    let calls = endpoint.calls();
    assert_eq!(calls.upload_parts, vec![2]);
    assert_eq!(calls.completes, vec![vec![1, 2, 3]]);
    assert_eq!(result.outcome.parts_resumed, 2);
    assert_eq!(endpoint.object("backups", "disk.img").unwrap(), data);
}

#[tokio::test]
async fn test_upload_concurrency_is_bounded_by_task_num() {
    let dir = TempDir::new().unwrap();
    let data = sample(8 * MIB);
    let path = write_file(dir.path(), "parts.bin", &data);

    let endpoint = Arc::new(MemoryEndpoint::new());
    endpoint.set_latency(Duration::from_millis(20));

    let request = UploadFileRequest::new("b", "parts.bin", &path)
        .with_options(ResumableOptions::default().with_part_size(MIB).with_task_num(3));
    upload_file(Arc::clone(&endpoint), request).await.unwrap();

    assert_eq!(endpoint.max_in_flight(), 3);
    assert_eq!(endpoint.calls().upload_parts.len(), 8);
}

#[tokio::test]
async fn test_upload_progress_is_monotonic_and_reports_total_once() {
    let dir = TempDir::new().unwrap();
    let data = sample(6 * MIB + 123);
    let path = write_file(dir.path(), "p.bin", &data);
    let (seen, observer) = statuses();

    let request = UploadFileRequest::new("b", "p.bin", &path).with_options(
        ResumableOptions::default()
            .with_part_size(MIB)
            .with_task_num(4)
            .with_progress(ProgressConfig::by_bytes(512 * 1024), observer),
    );
    upload_file(Arc::new(MemoryEndpoint::new()), request).await.unwrap();

    let seen = seen.lock();
    assert!(!seen.is_empty());
    assert!(seen
        .windows(2)
        .all(|w| w[0].transferred_bytes <= w[1].transferred_bytes));
    let total = data.len() as u64;
    assert_eq!(seen.iter().filter(|s| s.transferred_bytes == total).count(), 1);
    assert_eq!(seen.last().unwrap().transfer_percentage(), 100);
    assert_eq!(seen.iter().map(|s| s.newly_transferred_bytes).sum::<u64>(), total);
}

#[tokio::test]
async fn test_modified_source_invalidates_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = write_file(dir.path(), "log.txt", &sample(3 * MIB));

    let endpoint = Arc::new(MemoryEndpoint::new());
    endpoint.fail_part(3, None);
    let request = UploadFileRequest::new("b", "log.txt", &path).with_options(
        ResumableOptions::default()
            .with_part_size(MIB)
            .with_checkpoint(None)
            .with_retry(RetryPolicy::none()),
    );
    assert!(upload_file(Arc::clone(&endpoint), request.clone()).await.is_err());

    write_file(dir.path(), "log.txt", &sample(3 * MIB + 1));
    endpoint.clear_faults();
    let err = upload_file(Arc::clone(&endpoint), request.clone()).await.unwrap_err();
    assert!(matches!(err, TransferError::StaleCheckpoint { .. }));

    // The stale checkpoint is left for the caller to clear
    let upload_id = obs_transfer::abort_upload(endpoint.as_ref(), request.checkpoint_path().unwrap())
        .await
        .unwrap();
    assert!(upload_id.is_some());
    assert!(endpoint.pending_uploads().is_empty());

    upload_file(Arc::clone(&endpoint), request).await.unwrap();
    assert_eq!(endpoint.object("b", "log.txt").unwrap().len() as u64, 3 * MIB + 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOWNLOAD
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_download_resumes_after_failed_range() {
    let dir = TempDir::new().unwrap();
    let data = sample(5 * MIB + 9);
    let endpoint = Arc::new(MemoryEndpoint::new());
    endpoint.put_object("media", "clip.mp4", data.clone());
    endpoint.fail_range(2 * MIB, None);

    let target = dir.path().join("clip.mp4");
    let request = DownloadFileRequest::new("media", "clip.mp4", &target).with_options(
        ResumableOptions::default()
            .with_part_size(MIB)
            .with_task_num(2)
            .with_checkpoint(None)
            .with_retry(RetryPolicy::none())
            .with_failure_policy(FailurePolicy::ContinueOnError),
    );

    let err = download_file(Arc::clone(&endpoint), request.clone()).await.unwrap_err();
    assert_eq!(err.failed_parts(), vec![3]);
    assert!(!target.exists());
    assert!(request.temp_download_path().exists());
    assert!(request.checkpoint_path().unwrap().exists());

    endpoint.clear_faults();
    endpoint.reset_calls();
    let result = download_file(Arc::clone(&endpoint), request.clone()).await.unwrap();

    assert_eq!(endpoint.calls().range_reads, vec![2 * MIB]);
    assert_eq!(result.outcome.parts_resumed, 5);
    assert_eq!(std::fs::read(&target).unwrap(), data);
    assert!(!request.temp_download_path().exists());
    assert!(!request.checkpoint_path().unwrap().exists());
}

#[tokio::test]
async fn test_fail_fast_download_keeps_ranges_already_in_flight() {
    let dir = TempDir::new().unwrap();
    let data = sample(25 * MIB);
    let endpoint = Arc::new(MemoryEndpoint::new());
    endpoint.put_object("backups", "disk.img", data.clone());
    endpoint.fail_range(9 * MIB, None);
    endpoint.delay_range(0, Duration::from_millis(100));
    endpoint.delay_range(18 * MIB, Duration::from_millis(100));

    let target = dir.path().join("disk.img");
    let request = DownloadFileRequest::new("backups", "disk.img", &target).with_options(
        ResumableOptions::default()
            .with_part_size(9 * MIB)
            .with_task_num(3)
            .with_checkpoint(None)
            .with_retry(RetryPolicy::none()),
    );

    let err = download_file(Arc::clone(&endpoint), request.clone()).await.unwrap_err();
    assert_eq!(err.failed_parts(), vec![2]);

    let record = CheckpointStore::new(request.checkpoint_path().unwrap())
        .load()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.completed_numbers().into_iter().collect::<Vec<_>>(), vec![1, 3]);

    endpoint.clear_faults();
    endpoint.reset_calls();
    let result = download_file(Arc::clone(&endpoint), request).await.unwrap();

    assert_eq!(endpoint.calls().range_reads, vec![9 * MIB]);
    assert_eq!(result.outcome.parts_resumed, 2);
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[tokio::test]
async fn test_download_progress_by_seconds() {
    let dir = TempDir::new().unwrap();
    let data = sample(2 * MIB);
    let endpoint = Arc::new(MemoryEndpoint::new());
    endpoint.put_object("b", "slow.bin", data.clone());
    endpoint.set_latency(Duration::from_millis(30));
    let (seen, observer) = statuses();

    let request = DownloadFileRequest::new("b", "slow.bin", dir.path().join("slow.bin")).with_options(
        ResumableOptions::default()
            .with_part_size(256 * 1024)
            .with_progress(ProgressConfig::by_seconds(Duration::from_millis(20)), observer),
    );
    download_file(endpoint, request).await.unwrap();

    let seen = seen.lock();
    assert!(seen.len() >= 2);
    assert!(seen
        .windows(2)
        .all(|w| w[0].transferred_bytes <= w[1].transferred_bytes));
    assert_eq!(seen.last().unwrap().transferred_bytes, data.len() as u64);
    assert_eq!(
        seen.iter()
            .filter(|s| s.transferred_bytes == data.len() as u64)
            .count(),
        1
    );
}

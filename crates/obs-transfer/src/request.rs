//! Transfer requests and their shared resumable options

use crate::checkpoint::with_suffix;
use crate::events::{
    DownloadEventHandler, ResumableDownloadEvent, ResumableUploadEvent, UploadEventHandler,
};
use crate::lifecycle::TransferControl;
use crate::plan::{clamp_part_size, DEFAULT_PART_SIZE};
use crate::progress::{ProgressConfig, ProgressObserver, TransferStatus};
use crate::source::PartSource;
use crate::types::ObjectMetadata;
use crate::{Result, TransferError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Suffix of the default upload checkpoint file
pub const UPLOAD_CHECKPOINT_SUFFIX: &str = ".upload_record";

/// Suffix of the default download checkpoint file
pub const DOWNLOAD_CHECKPOINT_SUFFIX: &str = ".download_record";

/// Suffix of the temporary download file
pub const TEMP_DOWNLOAD_SUFFIX: &str = ".tmp";

/// Per-part retry behavior
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per part, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Never retry inline
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Retry up to `max_attempts` total attempts with the default backoff
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// What to do with the remaining parts once one part has failed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop dispatching new parts; let in-flight parts finish
    #[default]
    FailFast,
    /// Transfer every remaining part, then report the failures
    ContinueOnError,
}

/// Settings shared by every resumable request
#[derive(Clone)]
pub struct ResumableOptions {
    part_size: u64,
    task_num: usize,
    pub enable_checkpoint: bool,
    pub checkpoint_file: Option<PathBuf>,
    /// Guard the checkpoint with an advisory lock file
    pub lock_checkpoint: bool,
    /// Re-check the source before combining
    pub verify_source: bool,
    pub progress: ProgressConfig,
    pub progress_observer: Option<ProgressObserver>,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    pub control: TransferControl,
}

impl Default for ResumableOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            task_num: 1,
            enable_checkpoint: false,
            checkpoint_file: None,
            lock_checkpoint: false,
            verify_source: true,
            progress: ProgressConfig::default(),
            progress_observer: None,
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            control: TransferControl::new(),
        }
    }
}

impl fmt::Debug for ResumableOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableOptions")
            .field("part_size", &self.part_size)
            .field("task_num", &self.task_num)
            .field("enable_checkpoint", &self.enable_checkpoint)
            .field("checkpoint_file", &self.checkpoint_file)
            .field("lock_checkpoint", &self.lock_checkpoint)
            .field("verify_source", &self.verify_source)
            .field("progress", &self.progress)
            .field("retry", &self.retry)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

impl ResumableOptions {
    /// Part size, clamped to the accepted range
    pub fn part_size(&self) -> u64 {
        clamp_part_size(self.part_size)
    }

    /// Concurrent part tasks, at least one
    pub fn task_num(&self) -> usize {
        self.task_num.max(1)
    }

    /// Set the part size
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Set the number of concurrent part tasks
    pub fn with_task_num(mut self, task_num: usize) -> Self {
        self.task_num = task_num;
        self
    }

    /// Enable checkpointing, optionally at an explicit path
    pub fn with_checkpoint(mut self, checkpoint_file: Option<PathBuf>) -> Self {
        self.enable_checkpoint = true;
        self.checkpoint_file = checkpoint_file;
        self
    }

    /// Guard the checkpoint with an advisory lock file
    pub fn with_checkpoint_lock(mut self) -> Self {
        self.lock_checkpoint = true;
        self
    }

    /// Set progress pacing and observer
    pub fn with_progress(
        mut self,
        config: ProgressConfig,
        observer: impl Fn(TransferStatus) + Send + Sync + 'static,
    ) -> Self {
        self.progress = config;
        self.progress_observer = Some(Arc::new(observer));
        self
    }

    /// Set the per-part retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the failure policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Use `control` to pause or abort the transfer
    pub fn with_control(mut self, control: TransferControl) -> Self {
        self.control = control;
        self
    }

    /// Skip the pre-combine source check
    pub fn without_source_verification(mut self) -> Self {
        self.verify_source = false;
        self
    }

    /// Checkpoint path if checkpointing is enabled, else `None`
    pub(crate) fn checkpoint_path(&self, default: impl FnOnce() -> Option<PathBuf>) -> Option<PathBuf> {
        if !self.enable_checkpoint {
            return None;
        }
        self.checkpoint_file.clone().or_else(default)
    }
}

/// Upload a local file
#[derive(Clone)]
pub struct UploadFileRequest {
    pub bucket: String,
    pub key: String,
    pub upload_file: PathBuf,
    pub metadata: ObjectMetadata,
    pub options: ResumableOptions,
    pub event_handler: Option<UploadEventHandler>,
}

impl fmt::Debug for UploadFileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFileRequest")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("upload_file", &self.upload_file)
            .field("metadata", &self.metadata)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl UploadFileRequest {
    /// Request with default options
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, upload_file: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_file: upload_file.into(),
            metadata: ObjectMetadata::default(),
            options: ResumableOptions::default(),
            event_handler: None,
        }
    }

    /// Replace the resumable options
    pub fn with_options(mut self, options: ResumableOptions) -> Self {
        self.options = options;
        self
    }

    /// Set object metadata
    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Register an event handler
    pub fn on_event(mut self, handler: impl Fn(ResumableUploadEvent) + Send + Sync + 'static) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    /// Checkpoint path in effect, defaulting to `<upload_file>.upload_record`
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.options
            .checkpoint_path(|| Some(with_suffix(&self.upload_file, UPLOAD_CHECKPOINT_SUFFIX)))
    }
}

/// Upload from a seekable stream
#[derive(Clone)]
pub struct UploadStreamRequest {
    pub bucket: String,
    pub key: String,
    pub source: Arc<dyn PartSource>,
    pub metadata: ObjectMetadata,
    pub options: ResumableOptions,
    pub event_handler: Option<UploadEventHandler>,
}

impl fmt::Debug for UploadStreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadStreamRequest")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("size", &self.source.size())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl UploadStreamRequest {
    /// Request with default options
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, source: Arc<dyn PartSource>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            source,
            metadata: ObjectMetadata::default(),
            options: ResumableOptions::default(),
            event_handler: None,
        }
    }

    /// Replace the resumable options
    pub fn with_options(mut self, options: ResumableOptions) -> Self {
        self.options = options;
        self
    }

    /// Set object metadata
    pub fn with_metadata(mut self, metadata: ObjectMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Register an event handler
    pub fn on_event(mut self, handler: impl Fn(ResumableUploadEvent) + Send + Sync + 'static) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    /// Streams have no natural checkpoint location; an explicit file is required
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.options.checkpoint_path(|| None)
    }
}

/// Download an object into a local file
#[derive(Clone)]
pub struct DownloadFileRequest {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub download_file: PathBuf,
    pub options: ResumableOptions,
    pub event_handler: Option<DownloadEventHandler>,
}

impl fmt::Debug for DownloadFileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadFileRequest")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("version_id", &self.version_id)
            .field("download_file", &self.download_file)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DownloadFileRequest {
    /// Request with default options
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, download_file: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: None,
            download_file: download_file.into(),
            options: ResumableOptions::default(),
            event_handler: None,
        }
    }

    /// Download a specific version
    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    /// Replace the resumable options
    pub fn with_options(mut self, options: ResumableOptions) -> Self {
        self.options = options;
        self
    }

    /// Register an event handler
    pub fn on_event(mut self, handler: impl Fn(ResumableDownloadEvent) + Send + Sync + 'static) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    /// Checkpoint path in effect, defaulting to `<download_file>.download_record`
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.options
            .checkpoint_path(|| Some(with_suffix(&self.download_file, DOWNLOAD_CHECKPOINT_SUFFIX)))
    }

    /// Temporary file the parts are written into
    pub fn temp_download_path(&self) -> PathBuf {
        temp_path_for(&self.download_file)
    }
}

/// `<path>.tmp`
pub fn temp_path_for(path: &Path) -> PathBuf {
    with_suffix(path, TEMP_DOWNLOAD_SUFFIX)
}

pub(crate) fn validate_target(bucket: &str, key: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(TransferError::InvalidArgument("bucket name is empty".to_string()));
    }
    if key.is_empty() {
        return Err(TransferError::InvalidArgument("object key is empty".to_string()));
    }
    Ok(())
}

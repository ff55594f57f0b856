//! Serializable transfer defaults

use crate::plan::DEFAULT_PART_SIZE;
use crate::progress::{ProgressConfig, ProgressType, DEFAULT_PROGRESS_BYTES};
use crate::request::{FailurePolicy, ResumableOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transfer settings as they appear in a settings file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Part size in bytes
    pub part_size: u64,
    /// Concurrent part tasks
    pub task_num: usize,
    pub enable_checkpoint: bool,
    pub lock_checkpoint: bool,
    pub verify_source: bool,
    pub progress_type: ProgressType,
    pub progress_interval_bytes: u64,
    pub progress_interval_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Keep transferring after a part fails
    pub continue_on_error: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            part_size: DEFAULT_PART_SIZE,
            task_num: 1,
            enable_checkpoint: false,
            lock_checkpoint: false,
            verify_source: true,
            progress_type: ProgressType::ByBytes,
            progress_interval_bytes: DEFAULT_PROGRESS_BYTES,
            progress_interval_ms: 1000,
            max_attempts: retry.max_attempts,
            initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            max_backoff_ms: retry.max_backoff.as_millis() as u64,
            continue_on_error: false,
        }
    }
}

impl TransferConfig {
    /// Request options carrying these settings
    pub fn to_options(&self) -> ResumableOptions {
        let mut options = ResumableOptions::default()
            .with_part_size(self.part_size)
            .with_task_num(self.task_num)
            .with_retry(RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                initial_backoff: Duration::from_millis(self.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
            })
            .with_failure_policy(if self.continue_on_error {
                FailurePolicy::ContinueOnError
            } else {
                FailurePolicy::FailFast
            });
        options.enable_checkpoint = self.enable_checkpoint;
        options.lock_checkpoint = self.lock_checkpoint;
        options.verify_source = self.verify_source;
        options.progress = self.progress_config();
        options
    }

    /// Progress pacing described by these settings
    pub fn progress_config(&self) -> ProgressConfig {
        match self.progress_type {
            ProgressType::ByBytes => ProgressConfig::by_bytes(self.progress_interval_bytes),
            ProgressType::BySeconds => ProgressConfig::by_seconds(Duration::from_millis(self.progress_interval_ms)),
        }
    }
}

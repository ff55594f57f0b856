//! Transfer state machine, caller control and per-part retries

use crate::plan::PartSpec;
use crate::request::RetryPolicy;
use crate::scheduler::PartReceipt;
use crate::{Result, TransferError};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// States a transfer moves through
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferState {
    NotStarted,
    Planning,
    Resuming,
    Initiating,
    Transferring,
    Completing,
    Done,
    Failed,
    Aborted,
}

impl TransferState {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }

    /// Whether `self -> next` is a legal edge
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (NotStarted, Planning)
                | (Planning, Resuming)
                | (Planning, Initiating)
                | (Resuming, Transferring)
                | (Initiating, Transferring)
                | (Transferring, Completing)
                | (Completing, Done)
                | (_, Failed)
                | (_, Aborted)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the state of one transfer and logs each transition
#[derive(Debug)]
pub struct Lifecycle {
    state: TransferState,
    bucket: String,
    key: String,
}

impl Lifecycle {
    /// A transfer of `bucket/key` that has not started
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            state: TransferState::NotStarted,
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Current state
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Move to `next`, rejecting illegal edges
    pub fn transition(&mut self, next: TransferState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TransferError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(bucket = %self.bucket, key = %self.key, from = %self.state, to = %next, "transfer state");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` and hand back `err`
    pub fn fail<T>(&mut self, err: TransferError) -> Result<T> {
        if !self.state.is_terminal() {
            self.state = TransferState::Failed;
            debug!(bucket = %self.bucket, key = %self.key, error = %err, "transfer failed");
        }
        Err(err)
    }
}

/// Why a transfer was stopped by its caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Keep the checkpoint and server session so the transfer can resume
    Pause,
    /// Discard the server session and checkpoint
    Abort,
}

/// Handle for pausing or aborting a running transfer from another task
#[derive(Clone, Debug, Default)]
pub struct TransferControl {
    token: CancellationToken,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl TransferControl {
    /// A control that has not been triggered
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop dispatching parts, keeping everything needed to resume
    pub fn pause(&self) {
        self.reason.lock().get_or_insert(StopReason::Pause);
        self.token.cancel();
    }

    /// Stop dispatching parts and discard the transfer
    pub fn abort(&self) {
        *self.reason.lock() = Some(StopReason::Abort);
        self.token.cancel();
    }

    /// Why the transfer was stopped, if it was
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.reason.lock()
    }

    /// Token cancelled by `pause` or `abort`
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Run one part with `policy`, retrying retryable errors with backoff.
/// `op` receives the attempt number, starting at 1.
pub(crate) async fn retry_part<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    part: PartSpec,
    mut op: F,
) -> std::result::Result<PartReceipt, (TransferError, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(etag) => return Ok(PartReceipt { etag, attempts: attempt }),
            Err(e) if attempt < max_attempts && e.is_retryable() => {
                let delay = policy.backoff(attempt);
                warn!(
                    part_number = part.part_number,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "part failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err((TransferError::Cancelled, attempt)),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

/// Summary of a finished transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferOutcome {
    pub total_bytes: u64,
    /// Bytes moved by this run
    pub transferred_bytes: u64,
    /// Bytes skipped because a checkpoint already covered them
    pub resumed_bytes: u64,
    pub parts_total: usize,
    pub parts_transferred: usize,
    pub parts_resumed: usize,
    pub elapsed: Duration,
}

//! Error types for the obs-transfer crate

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using `TransferError`
pub type Result<T> = std::result::Result<T, TransferError>;

/// Errors reported by a storage endpoint
#[derive(Error, Debug)]
pub enum EndpointError {
    /// The service answered with a non-2xx status
    #[error("service error ({status} {code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// Object or multipart upload not found
    #[error("not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Connection, timeout or body streaming failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Response could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EndpointError {
    /// Whether re-issuing the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Io(_) => true,
            Self::Service { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::NotFound { .. } | Self::InvalidResponse(_) => false,
        }
    }
}

/// A part that could not be transferred
#[derive(Debug)]
pub struct PartFailure {
    /// Part number (1-based)
    pub part_number: u32,
    /// Attempts made before giving up
    pub attempts: u32,
    /// Last error observed for the part
    pub error: Box<TransferError>,
}

/// Errors that can occur during a resumable transfer
#[derive(Error, Debug)]
pub enum TransferError {
    /// Bad part size, task count or request shape
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Checkpoint does not describe the current source
    #[error("stale checkpoint {}: {reason}", path.display())]
    StaleCheckpoint { path: PathBuf, reason: String },

    /// Checkpoint file exists but cannot be decoded
    #[error("corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    /// Another transfer holds the checkpoint lock
    #[error("checkpoint {} is locked by another transfer", .0.display())]
    CheckpointLocked(PathBuf),

    /// One or more parts failed after the scheduler drained
    #[error("{} part(s) failed: {}", failures.len(), describe_failures(failures))]
    PartTransfer {
        failures: Vec<PartFailure>,
        checkpoint_retained: bool,
    },

    /// All parts succeeded but the final combine call failed
    #[error("complete multipart upload failed: {source}")]
    Combine {
        #[source]
        source: EndpointError,
        checkpoint_retained: bool,
    },

    /// Byte count differs from the expected content length
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// Source was modified while it was being transferred
    #[error("source changed during transfer: {0}")]
    SourceChanged(String),

    /// Lifecycle state machine was driven along an illegal edge
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A single part observed cancellation
    #[error("part transfer cancelled")]
    Cancelled,

    /// Transfer paused by the caller; resumable when a checkpoint was kept
    #[error("transfer paused")]
    Paused { checkpoint_retained: bool },

    /// Transfer aborted by the caller
    #[error("transfer aborted")]
    Aborted,

    /// Storage endpoint error
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint serialization error
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransferError {
    /// Whether a per-part retry may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Endpoint(e) => e.is_retryable(),
            Self::Io(_) | Self::LengthMismatch { .. } => true,
            _ => false,
        }
    }

    /// Whether re-running the same transfer will pick up where this one stopped
    pub fn is_resumable(&self) -> bool {
        match self {
            Self::PartTransfer {
                checkpoint_retained,
                ..
            }
            | Self::Combine {
                checkpoint_retained,
                ..
            }
            | Self::Paused {
                checkpoint_retained,
            } => *checkpoint_retained,
            _ => false,
        }
    }

    /// Part numbers that failed, in ascending order
    pub fn failed_parts(&self) -> Vec<u32> {
        match self {
            Self::PartTransfer { failures, .. } => {
                let mut parts: Vec<u32> = failures.iter().map(|f| f.part_number).collect();
                parts.sort_unstable();
                parts
            }
            _ => Vec::new(),
        }
    }
}

fn describe_failures(failures: &[PartFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("part {} after {} attempt(s): {}", f.part_number, f.attempts, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

//! # OBS Transfer
//!
//! Resumable, chunked uploads and downloads for S3-compatible object storage.
//!
//! ## Features
//!
//! - **Deterministic part plans**: the same source and part size always yield
//!   the same parts, so a checkpoint can be matched against a fresh plan
//! - **Checkpoints**: completed parts are journaled to a JSON file after every
//!   part; a re-run sends only what is missing
//! - **Bounded concurrency**: at most `task_num` part tasks in flight
//! - **Progress**: byte- or time-paced notifications with a rolling speed window
//! - **Pause and abort**: stop a running transfer from another task
//!
//! ## Example
//!
//! ```rust,ignore
//! use obs_transfer::{upload_file, ResumableOptions, UploadFileRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let endpoint = Arc::new(obs_client::ObsClient::new(obs_client::Config::new("http://localhost:9000"))?);
//!
//!     let request = UploadFileRequest::new("my-bucket", "backups/disk.img", "/data/disk.img")
//!         .with_options(
//!             ResumableOptions::default()
//!                 .with_task_num(4)
//!                 .with_checkpoint(None),
//!         );
//!
//!     let result = upload_file(endpoint, request).await?;
//!     println!("uploaded {} ({})", result.key, result.etag);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod download;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod memory;
pub mod plan;
pub mod progress;
pub mod request;
pub mod scheduler;
pub mod source;
pub mod types;
pub mod upload;

pub use checkpoint::{CheckpointRecord, CheckpointStore, SourceFingerprint, SourceIdentity};
pub use config::TransferConfig;
pub use download::{download_file, DownloadFileResult};
pub use endpoint::{ByteStream, EndpointResult, PartBody, StorageEndpoint};
pub use error::{EndpointError, PartFailure, Result, TransferError};
pub use events::{
    DownloadEventHandler, ResumableDownloadEvent, ResumableDownloadEventType, ResumableUploadEvent,
    ResumableUploadEventType, UploadEventHandler,
};
pub use lifecycle::{StopReason, TransferControl, TransferOutcome, TransferState};
pub use memory::MemoryEndpoint;
pub use plan::{PartSpec, TransferPlan, DEFAULT_PART_SIZE, MAX_PART_SIZE, MIN_PART_SIZE};
pub use progress::{ProgressConfig, ProgressObserver, ProgressType, TransferStatus};
pub use request::{
    DownloadFileRequest, FailurePolicy, ResumableOptions, RetryPolicy, UploadFileRequest, UploadStreamRequest,
};
pub use source::{BytesSource, FileSource, PartSource, StreamSource};
pub use types::*;
pub use upload::{abort_upload, upload_file, upload_stream, UploadFileResult};

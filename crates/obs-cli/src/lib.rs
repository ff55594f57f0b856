//! # OBS Transfer CLI
//!
//! Library side of the `obs` binary: settings loading and the
//! upload, download and abort commands, generic over the storage endpoint.

pub mod commands;
pub mod config;

pub use commands::{log_progress, run_abort, run_download, run_upload, DownloadArgs, UploadArgs};
pub use config::CliSettings;

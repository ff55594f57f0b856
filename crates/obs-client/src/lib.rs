//! # OBS Client
//!
//! HTTP client for OBS and other S3-compatible object stores.
//!
//! The client covers the calls a resumable transfer needs (multipart
//! sessions, ranged reads and object heads) and implements
//! [`obs_transfer::StorageEndpoint`], so it can be handed straight to
//! [`obs_transfer::upload_file`] or [`obs_transfer::download_file`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use obs_client::{Config, ObsClient};
//! use obs_transfer::{download_file, DownloadFileRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::new("https://obs.example.com").with_token("my-token");
//!     let client = Arc::new(ObsClient::new(config)?);
//!
//!     let info = client.head_object("my-bucket", "report.pdf", None).await?;
//!     println!("{} bytes", info.size);
//!
//!     download_file(client, DownloadFileRequest::new("my-bucket", "report.pdf", "./report.pdf")).await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod endpoint;
mod error;
mod multipart;

pub use client::ObsClient;
pub use config::Config;
pub use error::{ClientError, Result};

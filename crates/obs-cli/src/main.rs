//! OBS transfer tool - resumable uploads and downloads

use clap::{Args as ClapArgs, Parser, Subcommand};
use obs_cli::{log_progress, run_abort, run_download, run_upload, CliSettings, DownloadArgs, UploadArgs};
use obs_client::ObsClient;
use obs_transfer::{ResumableOptions, TransferControl};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "obs")]
#[command(about = "Resumable multipart transfers for OBS and S3-compatible storage")]
#[command(version)]
struct Args {
    /// Service endpoint URL
    #[arg(long, env = "OBS_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Bearer token
    #[arg(long, env = "OBS_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Settings file (TOML, JSON or YAML)
    #[arg(short, long, env = "OBS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "OBS_DEBUG", global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file as a multipart object
    Upload {
        bucket: String,
        key: String,
        file: PathBuf,

        /// Content type; guessed from the file extension when omitted
        #[arg(long)]
        content_type: Option<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Download an object with ranged reads
    Download {
        bucket: String,
        key: String,
        file: PathBuf,

        /// Object version to read
        #[arg(long)]
        version_id: Option<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Abort the multipart upload recorded in a checkpoint file
    Abort {
        checkpoint: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
struct TransferArgs {
    /// Part size in bytes
    #[arg(long)]
    part_size: Option<u64>,

    /// Concurrent part tasks
    #[arg(short = 'j', long)]
    task_num: Option<usize>,

    /// Record progress in a checkpoint so an interrupted run can resume
    #[arg(long)]
    checkpoint: bool,

    /// Checkpoint file; defaults to a file next to the local file
    #[arg(long)]
    checkpoint_file: Option<PathBuf>,
}

impl TransferArgs {
    fn options(&self, settings: &CliSettings, control: TransferControl) -> ResumableOptions {
        let mut transfer = settings.transfer.clone();
        if let Some(part_size) = self.part_size {
            transfer.part_size = part_size;
        }
        if let Some(task_num) = self.task_num {
            transfer.task_num = task_num;
        }

        let mut options = transfer.to_options().with_control(control);
        options.progress_observer = Some(log_progress());
        if self.checkpoint || self.checkpoint_file.is_some() || transfer.enable_checkpoint {
            options = options.with_checkpoint(self.checkpoint_file.clone());
        }
        options
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Setup logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("obs={0},obs_cli={0},obs_transfer={0},obs_client={0}", log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = CliSettings::load(args.config.as_deref())?;
    if args.endpoint.is_some() {
        settings.endpoint = args.endpoint;
    }
    if args.token.is_some() {
        settings.token = args.token;
    }

    let client = Arc::new(ObsClient::new(settings.client_config()?)?);
    tracing::debug!(endpoint = %client.config().endpoint, "client ready");

    // First Ctrl-C pauses: in-flight parts finish and the checkpoint is kept
    let control = TransferControl::new();
    let pause = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, pausing transfer");
            pause.pause();
        }
    });

    match args.command {
        Command::Upload {
            bucket,
            key,
            file,
            content_type,
            transfer,
        } => {
            let options = transfer.options(&settings, control);
            run_upload(
                client,
                UploadArgs {
                    bucket,
                    key,
                    file,
                    content_type,
                },
                options,
            )
            .await
        }
        Command::Download {
            bucket,
            key,
            file,
            version_id,
            transfer,
        } => {
            let options = transfer.options(&settings, control);
            run_download(
                client,
                DownloadArgs {
                    bucket,
                    key,
                    file,
                    version_id,
                },
                options,
            )
            .await
        }
        Command::Abort { checkpoint } => run_abort(client.as_ref(), checkpoint).await,
    }
}

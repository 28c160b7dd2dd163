//! bucketdeck command line client

use anyhow::{bail, Context};
use bucketdeck_client::*;
use bucketdeck_core::*;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bucketdeck", version, about = "Browse and upload to bucketdeck buckets")]
struct Cli {
    /// Server base URL
    #[arg(long, env = "BUCKETDECK_URL", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Session token
    #[arg(long, env = "BUCKETDECK_TOKEN", hide_env_values = true)]
    token: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "BUCKETDECK_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the buckets you can see
    Buckets,

    /// List one folder level of a bucket
    #[command(alias = "ls")]
    List {
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Download an object
    #[command(alias = "get")]
    Download {
        bucket: String,
        key: String,
        /// Output file; defaults to the object's file name
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete an object
    #[command(alias = "rm")]
    Delete { bucket: String, key: String },

    /// Upload a file in parts
    #[command(alias = "put")]
    Upload {
        bucket: String,
        file: PathBuf,
        /// Object key; defaults to the file name under --prefix
        #[arg(long)]
        key: Option<String>,
        /// Folder to upload into
        #[arg(long, default_value = "")]
        prefix: String,
        /// Part size in bytes; defaults to the size the server advertises
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Parts in flight
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Retries of a transient part failure
        #[arg(long, default_value_t = 3)]
        retries: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let client = DeckClient::new(&cli.server, cli.token.clone()).context("invalid server URL")?;
    debug!(server = %client.endpoint(), "client ready");

    match cli.command {
        Command::Buckets => {
            let buckets = client.list_buckets().await?;
            println!("{}", serde_json::to_string_pretty(&buckets)?);
        }
        Command::List { bucket, prefix } => {
            let listing = client.browse(&BucketId::new(&bucket)?, &prefix).await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Command::Download { bucket, key, output } => {
            let key = Key::new(&key)?;
            let output = output.unwrap_or_else(|| PathBuf::from(key.file_name()));
            let written = client
                .download_to(&BucketId::new(&bucket)?, &key, &output)
                .await
                .with_context(|| format!("download of {} failed", key))?;
            info!(key = %key, path = %output.display(), written, "downloaded");
        }
        Command::Delete { bucket, key } => {
            client.delete(&BucketId::new(&bucket)?, &Key::new(&key)?).await?;
        }
        Command::Upload {
            bucket,
            file,
            key,
            prefix,
            chunk_size,
            concurrency,
            retries,
        } => {
            let config = UploadConfig {
                chunk_size: chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
                concurrency,
                max_retries: retries,
                ..UploadConfig::default()
            };
            config.validate()?;

            let key = match key {
                Some(key) => Key::new(&key)?,
                None => {
                    let Some(name) = file.file_name().and_then(|name| name.to_str()) else {
                        bail!("{} has no usable file name, pass --key", file.display());
                    };
                    Key::in_folder(&prefix, name)?
                }
            };

            let source = FileSource::open(&file)
                .await
                .with_context(|| format!("cannot read {}", file.display()))?;

            let cancel = CancellationHandle::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupted, aborting upload");
                    on_interrupt.cancel();
                }
            });

            let progress: ProgressFn = Arc::new(|progress: Progress| {
                info!(
                    parts_done = progress.parts_done,
                    part_count = progress.part_count,
                    bytes_done = progress.bytes_done,
                    total_bytes = progress.total_bytes,
                    "progress"
                );
            });
            let options = UploadOptions {
                cancel,
                progress: Some(progress),
            };

            let started = std::time::Instant::now();
            let mut uploader = Uploader::new(client, config);
            if chunk_size.is_none() {
                uploader = uploader.with_server_chunk_size();
            }
            let report = uploader
                .upload(&BucketId::new(&bucket)?, &key, &source, options)
                .await
                .with_context(|| format!("upload of {} failed", file.display()))?;
            info!(
                key = %report.key,
                size = report.size,
                parts = report.part_count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "uploaded"
            );
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

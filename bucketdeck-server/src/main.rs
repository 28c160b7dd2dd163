//! bucketdeck server binary

use anyhow::Context;
use bucketdeck_server::{shutdown_signal, DeckServer, ServerArgs, ServerConfig};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    init_tracing(args.log_json);

    let config = ServerConfig::from_args(&args).context("invalid configuration")?;
    info!(
        bind = %config.bind,
        buckets = config.registry.len(),
        chunk_size = config.upload.chunk_size,
        max_part_size = config.limits.max_part_size,
        "starting bucketdeck server"
    );

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    DeckServer::new(config)
        .serve(listener, shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

//! Server configuration
//!
//! Every flag can also be set through a `BUCKETDECK_*` environment variable.

use bucketdeck_core::*;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Largest part the proxied transport buffers (64 MiB)
pub const DEFAULT_MAX_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Largest object the thumbnail route decodes (32 MiB)
pub const DEFAULT_MAX_IMAGE_SIZE: u64 = 32 * 1024 * 1024;

/// Largest JSON request body (a complete call listing 10,000 parts fits)
pub const DEFAULT_MAX_JSON_BODY: usize = 4 * 1024 * 1024;

#[derive(Parser, Debug, Clone)]
#[command(name = "bucketdeck-server", version, about = "Multi-tenant S3 bucket browser backend")]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "BUCKETDECK_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Bucket registry file (JSON)
    #[arg(long, env = "BUCKETDECK_BUCKETS", default_value = "buckets.json")]
    pub buckets: PathBuf,

    /// Shared secret session tokens are signed with
    #[arg(long, env = "BUCKETDECK_SESSION_SECRET", hide_env_values = true)]
    pub session_secret: String,

    /// Part size clients are told to use
    #[arg(long, env = "BUCKETDECK_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Largest part accepted through the proxied transport
    #[arg(long, env = "BUCKETDECK_MAX_PART_SIZE", default_value_t = DEFAULT_MAX_PART_SIZE)]
    pub max_part_size: u64,

    /// Proxied part uploads buffered at once, server-wide
    #[arg(long, env = "BUCKETDECK_PROXY_CONCURRENCY", default_value_t = 8)]
    pub proxy_concurrency: usize,

    /// Lifetime of presigned part URLs, in seconds
    #[arg(long, env = "BUCKETDECK_PRESIGN_EXPIRY", default_value_t = DEFAULT_PRESIGN_EXPIRY.as_secs())]
    pub presign_expiry: u64,

    /// Abort upload sessions idle for longer than this many seconds
    #[arg(long, env = "BUCKETDECK_SESSION_MAX_AGE", default_value_t = 24 * 3600)]
    pub session_max_age: u64,

    /// Seconds between stale session sweeps (0 disables the sweep)
    #[arg(long, env = "BUCKETDECK_REAP_INTERVAL", default_value_t = 600)]
    pub reap_interval: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "BUCKETDECK_LOG_JSON")]
    pub log_json: bool,
}

/// Limits of the proxied transport and request bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLimits {
    pub max_part_size: u64,
    pub proxy_concurrency: usize,
    pub max_json_body: usize,
    pub max_image_size: u64,
}

impl Default for BodyLimits {
    fn default() -> Self {
        BodyLimits {
            max_part_size: DEFAULT_MAX_PART_SIZE,
            proxy_concurrency: 8,
            max_json_body: DEFAULT_MAX_JSON_BODY,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
        }
    }
}

/// Stale session sweep; `None` interval disables it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    pub interval: Option<Duration>,
    pub max_age: Duration,
}

/// Validated server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub registry: BucketRegistry,
    pub verifier: SessionVerifier,
    pub upload: UploadConfig,
    pub limits: BodyLimits,
    pub reaper: ReaperConfig,
}

impl ServerConfig {
    /// Load the bucket registry and check every setting
    pub fn from_args(args: &ServerArgs) -> Result<Self> {
        let registry = BucketRegistry::load(&args.buckets)?;
        Self::with_registry(args, registry)
    }

    pub fn with_registry(args: &ServerArgs, registry: BucketRegistry) -> Result<Self> {
        let verifier = SessionVerifier::new(args.session_secret.as_bytes())?;

        let upload = UploadConfig {
            chunk_size: args.chunk_size,
            presign_expiry: Duration::from_secs(args.presign_expiry),
            ..UploadConfig::default()
        };
        upload.validate()?;

        let limits = BodyLimits {
            max_part_size: args.max_part_size,
            proxy_concurrency: args.proxy_concurrency,
            ..BodyLimits::default()
        };
        if limits.max_part_size < upload.chunk_size {
            return Err(DeckError::Config(format!(
                "max part size {} is below the chunk size {}",
                limits.max_part_size, upload.chunk_size
            )));
        }
        if limits.proxy_concurrency == 0 {
            return Err(DeckError::Config("proxy concurrency must be at least 1".to_string()));
        }

        let reaper = ReaperConfig {
            interval: (args.reap_interval > 0).then(|| Duration::from_secs(args.reap_interval)),
            max_age: Duration::from_secs(args.session_max_age),
        };

        Ok(ServerConfig {
            bind: args.bind,
            registry,
            verifier,
            upload,
            limits,
            reaper,
        })
    }
}

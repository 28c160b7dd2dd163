//! Whole-object uploads: open, schedule parts, complete or abort

use bucketdeck_core::*;
use bytes::Bytes;
use tracing::{error, info};

use crate::backend::UploadBackend;
use crate::scheduler::{AbortGuard, CancellationHandle, ChunkScheduler, Progress, ProgressFn};
use crate::streaming::ChunkSource;
use crate::Result;

/// Per-upload knobs
#[derive(Clone, Default)]
pub struct UploadOptions {
    pub cancel: CancellationHandle,
    pub progress: Option<ProgressFn>,
}

impl std::fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadOptions")
            .field("cancel", &self.cancel)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// What a finished upload wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub bucket: BucketId,
    pub key: Key,
    pub size: u64,
    pub part_count: u32,
    /// `None` when the object went up in a single request
    pub upload_id: Option<UploadId>,
    pub mode: Option<TransportMode>,
}

/// Drives uploads against one backend with a fixed configuration
#[derive(Debug, Clone)]
pub struct Uploader<B> {
    backend: B,
    config: UploadConfig,
    server_chunk_size: bool,
}

impl<B: UploadBackend> Uploader<B> {
    pub fn new(backend: B, config: UploadConfig) -> Self {
        Uploader {
            backend,
            config,
            server_chunk_size: false,
        }
    }

    /// Split parts at the size the server advertises when opening an upload.
    ///
    /// `config.chunk_size` still applies to servers that advertise none.
    pub fn with_server_chunk_size(mut self) -> Self {
        self.server_chunk_size = true;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload `source` to `key`.
    ///
    /// Empty sources are written with a single request. Anything else goes
    /// through a multipart upload that is aborted if it does not complete.
    pub async fn upload<S: ChunkSource + ?Sized>(
        &self,
        bucket: &BucketId,
        key: &Key,
        source: &S,
        options: UploadOptions,
    ) -> Result<UploadReport> {
        if options.cancel.is_cancelled() {
            return Err(DeckError::Cancelled.into());
        }

        if source.is_empty() {
            self.backend.put_object(bucket, key, Bytes::new()).await?;
            if let Some(callback) = &options.progress {
                callback(Progress {
                    bytes_done: 0,
                    total_bytes: 0,
                    parts_done: 0,
                    part_count: 0,
                });
            }
            info!(bucket = %bucket, key = %key, "empty object written");
            return Ok(UploadReport {
                bucket: bucket.clone(),
                key: key.clone(),
                size: 0,
                part_count: 0,
                upload_id: None,
                mode: None,
            });
        }

        let opened = self.backend.open(bucket, key).await?;
        let target = &opened.target;
        let abort = AbortGuard::new();

        let chunk_size = match opened.chunk_size {
            Some(advertised) if self.server_chunk_size => advertised,
            _ => self.config.chunk_size,
        };
        let plan = match ChunkPlan::new(source.len(), chunk_size) {
            Ok(plan) => plan,
            Err(e) => {
                error!(upload = %target, chunk_size, error = %e, "cannot split source");
                abort.fire(&self.backend, target).await;
                return Err(e.into());
            }
        };
        info!(
            upload = %target,
            mode = %opened.mode,
            size = plan.total_size(),
            parts = plan.part_count(),
            "upload started"
        );

        let config = UploadConfig {
            chunk_size,
            ..self.config
        };
        let parts = ChunkScheduler::new(&self.backend, config)
            .with_cancellation(options.cancel.clone())
            .with_progress(options.progress.clone())
            .run(target, &plan, source, &abort)
            .await?;

        if let Err(e) = self.backend.complete(target, &parts, plan.part_count()).await {
            error!(upload = %target, error = %e, "complete failed");
            abort.fire(&self.backend, target).await;
            return Err(e);
        }

        info!(upload = %target, parts = parts.len(), "upload completed");
        Ok(UploadReport {
            bucket: bucket.clone(),
            key: key.clone(),
            size: plan.total_size(),
            part_count: plan.part_count(),
            upload_id: Some(target.upload_id.clone()),
            mode: Some(opened.mode),
        })
    }
}

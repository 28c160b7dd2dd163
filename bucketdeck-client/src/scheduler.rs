//! Bounded pool of part-upload workers

use bucketdeck_core::*;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backend::{transfer_part, UploadBackend};
use crate::streaming::ChunkSource;
use crate::{ClientError, Result};

/// Snapshot handed to the progress callback after each finished part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub parts_done: u32,
    pub part_count: u32,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Lets a caller stop an upload from another task.
///
/// Workers stop claiming chunks once cancelled; the upload is then aborted.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Issues the abort of one upload at most once
#[derive(Debug, Default)]
pub struct AbortGuard {
    fired: AtomicBool,
}

impl AbortGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Abort `target` unless an earlier call already did; true if this call fired.
    ///
    /// A failing abort is logged, not returned: the caller is already
    /// reporting the error that caused it.
    pub async fn fire<B: UploadBackend + ?Sized>(&self, backend: &B, target: &UploadTarget) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        match backend.abort(target).await {
            Ok(()) => info!(upload = %target, "upload aborted"),
            Err(e) => error!(upload = %target, error = %e, "abort failed"),
        }
        true
    }
}

/// Delay before retry `attempt` (1-based): `base`, `2 * base`, `4 * base`, ...
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// Bookkeeping of one scheduler run
struct Run<'a, S: ?Sized> {
    target: &'a UploadTarget,
    plan: &'a ChunkPlan,
    source: &'a S,
    cursor: AtomicUsize,
    failed: AtomicBool,
    failure: Notify,
    first_error: Mutex<Option<ClientError>>,
    parts: Mutex<Vec<CompletedPart>>,
    bytes_done: AtomicU64,
    parts_done: AtomicU32,
}

impl<'a, S: ?Sized> Run<'a, S> {
    fn new(target: &'a UploadTarget, plan: &'a ChunkPlan, source: &'a S) -> Self {
        Run {
            target,
            plan,
            source,
            cursor: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            failure: Notify::new(),
            first_error: Mutex::new(None),
            parts: Mutex::new(Vec::with_capacity(plan.part_count() as usize)),
            bytes_done: AtomicU64::new(0),
            parts_done: AtomicU32::new(0),
        }
    }

    /// Keep the first error; later ones are fallout from the pool stopping
    fn fail(&self, err: ClientError) {
        self.failed.store(true, Ordering::Release);
        {
            let mut first = self.first_error.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if first.is_none() {
                *first = Some(err);
            }
        }
        self.failure.notify_waiters();
    }

    fn finish_part(&self, part: CompletedPart, len: u64) -> Progress {
        self.parts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(part);
        Progress {
            bytes_done: self.bytes_done.fetch_add(len, Ordering::AcqRel) + len,
            total_bytes: self.plan.total_size(),
            parts_done: self.parts_done.fetch_add(1, Ordering::AcqRel) + 1,
            part_count: self.plan.part_count(),
        }
    }
}

/// Uploads the chunks of one plan with at most `concurrency` parts in flight.
///
/// Workers claim chunks through a shared cursor. Transient failures are
/// retried with a fresh transport; anything else stops the pool and aborts
/// the upload once.
pub struct ChunkScheduler<'a, B: ?Sized> {
    backend: &'a B,
    config: UploadConfig,
    cancel: CancellationHandle,
    progress: Option<ProgressFn>,
}

impl<'a, B: UploadBackend + ?Sized> ChunkScheduler<'a, B> {
    pub fn new(backend: &'a B, config: UploadConfig) -> Self {
        ChunkScheduler {
            backend,
            config,
            cancel: CancellationHandle::new(),
            progress: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressFn>) -> Self {
        self.progress = progress;
        self
    }

    /// Upload every chunk of `plan` and return the parts in ascending order.
    ///
    /// On failure or cancellation every worker is joined first, then `abort`
    /// fires.
    pub async fn run<S: ChunkSource + ?Sized>(
        &self,
        target: &UploadTarget,
        plan: &ChunkPlan,
        source: &S,
        abort: &AbortGuard,
    ) -> Result<Vec<CompletedPart>> {
        let run = Run::new(target, plan, source);
        let workers = self.config.concurrency.max(1).min(plan.part_count() as usize);
        debug!(
            upload = %target,
            parts = plan.part_count(),
            chunk_size = plan.chunk_size(),
            workers,
            "scheduling parts"
        );

        let shared = &run;
        futures::future::join_all((0..workers).map(|worker| self.worker(worker, shared))).await;

        let first_error = run
            .first_error
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let failure = match first_error {
            Some(err) => Some(err),
            None if self.cancel.is_cancelled() => Some(DeckError::Cancelled.into()),
            None => None,
        };
        if let Some(err) = failure {
            warn!(upload = %target, error = %err, "upload failed, aborting");
            abort.fire(self.backend, target).await;
            return Err(err);
        }

        let mut parts = run
            .parts
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        parts.sort_by_key(|part| part.part_number);
        if parts.len() != plan.part_count() as usize {
            let err = ClientError::Core(DeckError::Internal(format!(
                "{} of {} parts uploaded",
                parts.len(),
                plan.part_count()
            )));
            abort.fire(self.backend, target).await;
            return Err(err);
        }
        Ok(parts)
    }

    fn halted<S: ?Sized>(&self, run: &Run<'_, S>) -> bool {
        run.failed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Sleep for `delay`, waking early if the pool halts
    async fn backoff<S: ?Sized>(&self, run: &Run<'_, S>, delay: Duration) {
        let failure = run.failure.notified();
        tokio::pin!(failure);
        failure.as_mut().enable();
        if self.halted(run) {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
            _ = failure => {}
        }
    }

    async fn worker<S: ChunkSource + ?Sized>(&self, worker: usize, run: &Run<'_, S>) {
        while !self.halted(run) {
            let index = run.cursor.fetch_add(1, Ordering::AcqRel);
            let Some(chunk) = run.plan.chunk(index) else {
                break;
            };

            match self.upload_chunk(run, &chunk).await {
                Ok(part) => {
                    let progress = run.finish_part(part, chunk.len);
                    debug!(
                        upload = %run.target,
                        worker,
                        part = %chunk.part_number,
                        bytes_done = progress.bytes_done,
                        "part uploaded"
                    );
                    if let Some(callback) = &self.progress {
                        callback(progress);
                    }
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        error!(upload = %run.target, part = %chunk.part_number, error = %e, "part failed");
                    }
                    run.fail(e);
                    break;
                }
            }
        }
    }

    async fn upload_chunk<S: ChunkSource + ?Sized>(
        &self,
        run: &Run<'_, S>,
        chunk: &Chunk,
    ) -> Result<CompletedPart> {
        let body = run.source.read_chunk(chunk).await?;
        let mut attempt = 0u32;

        loop {
            if self.halted(run) {
                return Err(DeckError::Cancelled.into());
            }

            let result = async {
                let transport = self
                    .backend
                    .request_transport(run.target, chunk.part_number)
                    .await?;
                transfer_part(self.backend, run.target, chunk.part_number, &transport, body.clone())
                    .await
            }
            .await;

            match result {
                Ok(etag) => return Ok(CompletedPart::new(chunk.part_number, etag)),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = retry_delay(self.config.retry_backoff, attempt);
                    warn!(
                        upload = %run.target,
                        part = %chunk.part_number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying part"
                    );
                    self.backoff(run, delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

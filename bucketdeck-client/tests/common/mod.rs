//! Upload backends for tests: one over a real session manager with in-memory
//! stores, one fully scripted

#![allow(dead_code)]

use async_trait::async_trait;
use bucketdeck_client::*;
use bucketdeck_client::Result;
use bucketdeck_core::*;
use bucketdeck_engine::{Engine, MemoryStore, SessionManager, StoreError};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

pub const REGISTRY: &str = r#"{
    "buckets": [
        {"id": "media", "bucket": "acme-media", "group": "media",
         "accessKeyId": "k1", "secretAccessKey": "s1"},
        {"id": "vault", "bucket": "acme-vault", "group": "media",
         "accessKeyId": "k2", "secretAccessKey": "s2", "transport": "direct"}
    ]
}"#;

pub fn bucket(id: &str) -> BucketId {
    BucketId::new(id).unwrap()
}

pub fn key(name: &str) -> Key {
    Key::new(name).unwrap()
}

/// Deterministic, non-repeating-per-part content
pub fn payload(len: u64) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// Upload settings with fast retries and tiny chunks allowed
pub fn fast_config(chunk_size: u64, concurrency: usize) -> UploadConfig {
    UploadConfig {
        chunk_size,
        concurrency,
        max_retries: 3,
        retry_backoff: Duration::from_millis(1),
        ..UploadConfig::default()
    }
}

/// Backend calling a [`SessionManager`] in-process, with direct PUTs served
/// by the in-memory stores
#[derive(Clone)]
pub struct LocalBackend {
    pub manager: Arc<SessionManager>,
    pub stores: HashMap<BucketId, Arc<MemoryStore>>,
    pub principal: Principal,
    expire_next_direct: Arc<AtomicBool>,
}

impl LocalBackend {
    pub fn new() -> Self {
        let registry = BucketRegistry::from_json(REGISTRY).unwrap();
        let (engine, stores) = Engine::in_memory(registry);
        LocalBackend {
            manager: Arc::new(SessionManager::new(engine, UploadConfig::default())),
            stores,
            principal: Principal::new("alice", vec!["media".to_string()]),
            expire_next_direct: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self, id: &str) -> &MemoryStore {
        &self.stores[&bucket(id)]
    }

    /// Let the next presigned URL lapse before its PUT arrives
    pub fn expire_next_direct(&self) {
        self.expire_next_direct.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UploadBackend for LocalBackend {
    async fn open(&self, bucket: &BucketId, key: &Key) -> Result<OpenedUpload> {
        let target = self.manager.open_session(&self.principal, bucket, key).await?;
        let mode = self
            .manager
            .engine()
            .bucket(bucket, &self.principal)?
            .transport_mode();
        Ok(OpenedUpload {
            target,
            mode,
            chunk_size: Some(self.manager.config().chunk_size),
        })
    }

    async fn request_transport(
        &self,
        target: &UploadTarget,
        part_number: PartNumber,
    ) -> Result<PartTransport> {
        Ok(self
            .manager
            .request_part_transport(&self.principal, target, part_number)
            .await?)
    }

    async fn upload_proxied(
        &self,
        target: &UploadTarget,
        part_number: PartNumber,
        body: Bytes,
    ) -> Result<ETag> {
        Ok(self
            .manager
            .upload_part(&self.principal, target, part_number, body)
            .await?)
    }

    async fn put_direct(&self, url: &str, part_number: PartNumber, body: Bytes) -> Result<ETag> {
        if self.expire_next_direct.swap(false, Ordering::SeqCst) {
            let lapse = self.manager.config().presign_expiry + Duration::from_secs(1);
            for store in self.stores.values() {
                store.advance_clock(lapse);
            }
        }
        for store in self.stores.values() {
            match store.put_presigned(url, body.clone()) {
                Err(StoreError::Forbidden(message)) if message.starts_with("unknown presigned url") => {
                    continue
                }
                Err(e) => return Err(DeckError::from(e).into()),
                Ok(raw) => return Ok(ETag::parse(part_number.get(), &raw)?),
            }
        }
        Err(DeckError::Forbidden(format!("no store issued {}", url)).into())
    }

    async fn record_part(
        &self,
        target: &UploadTarget,
        part_number: PartNumber,
        etag: &ETag,
    ) -> Result<()> {
        self.manager
            .record_part_completion(&self.principal, target, part_number, etag.as_str())?;
        Ok(())
    }

    async fn complete(
        &self,
        target: &UploadTarget,
        parts: &[CompletedPart],
        part_count: u32,
    ) -> Result<()> {
        Ok(self
            .manager
            .complete_with_parts(&self.principal, target, parts, Some(part_count))
            .await?)
    }

    async fn abort(&self, target: &UploadTarget) -> Result<()> {
        Ok(self.manager.abort(&self.principal, target).await?)
    }

    async fn put_object(&self, bucket: &BucketId, key: &Key, body: Bytes) -> Result<()> {
        let bucket = self.manager.engine().bucket(bucket, &self.principal)?;
        Ok(bucket.put(key, body).await?)
    }
}

/// Backend with scripted failures and call accounting; no store behind it
#[derive(Default)]
pub struct ScriptedBackend {
    pub delay: Duration,
    /// Part size reported when opening
    pub advertised_chunk_size: Option<u64>,
    /// Hand out presigned URLs valid this long instead of proxying
    direct_window: Option<Duration>,
    stalls: Mutex<HashMap<u32, u32>>,
    failures: Mutex<HashMap<u32, (u32, ErrorCode)>>,
    fail_complete: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    transports: AtomicU32,
    attempts: Mutex<HashMap<u32, u32>>,
    pub completions: Mutex<Vec<(Vec<CompletedPart>, u32)>>,
    aborts: AtomicU32,
    puts: Mutex<Vec<(Key, usize)>>,
    opens: AtomicU32,
}

impl ScriptedBackend {
    pub fn with_delay(delay: Duration) -> Self {
        ScriptedBackend {
            delay,
            ..Default::default()
        }
    }

    /// Report `chunk_size` as the server's part size when opening
    pub fn advertising(chunk_size: u64) -> Self {
        ScriptedBackend {
            advertised_chunk_size: Some(chunk_size),
            ..Default::default()
        }
    }

    /// Issue direct transports whose URLs lapse after `window`
    pub fn direct(window: Duration) -> Self {
        ScriptedBackend {
            direct_window: Some(window),
            ..Default::default()
        }
    }

    /// Leave the next `times` direct PUTs of `part_number` hanging forever
    pub fn stall_part(&self, part_number: u32, times: u32) {
        self.stalls.lock().unwrap().insert(part_number, times);
    }

    fn take_stall(&self, part_number: u32) -> bool {
        let mut stalls = self.stalls.lock().unwrap();
        match stalls.get_mut(&part_number) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Fail the next `times` uploads of `part_number` with `code`
    pub fn fail_part(&self, part_number: u32, times: u32, code: ErrorCode) {
        self.failures.lock().unwrap().insert(part_number, (times, code));
    }

    pub fn fail_complete(&self) {
        self.fail_complete.store(true, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> u32 {
        self.transports.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, part_number: u32) -> u32 {
        self.attempts.lock().unwrap().get(&part_number).copied().unwrap_or(0)
    }

    pub fn aborts(&self) -> u32 {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> Vec<(Vec<CompletedPart>, u32)> {
        self.completions.lock().unwrap().clone()
    }

    pub fn puts(&self) -> Vec<(Key, usize)> {
        self.puts.lock().unwrap().clone()
    }

    pub fn target() -> UploadTarget {
        UploadTarget::new(bucket("media"), key("movie.mp4"), UploadId::new("scripted-1").unwrap())
    }

    fn injected_failure(&self, part_number: u32) -> Option<ClientError> {
        let mut failures = self.failures.lock().unwrap();
        let (remaining, code) = failures.get_mut(&part_number)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(ClientError::Api {
            status: 503,
            code: *code,
            message: format!("injected failure for part {}", part_number),
        })
    }
}

#[async_trait]
impl UploadBackend for ScriptedBackend {
    async fn open(&self, _bucket: &BucketId, _key: &Key) -> Result<OpenedUpload> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let mode = match self.direct_window {
            Some(_) => TransportMode::Direct,
            None => TransportMode::Proxied,
        };
        Ok(OpenedUpload {
            target: Self::target(),
            mode,
            chunk_size: self.advertised_chunk_size,
        })
    }

    async fn request_transport(
        &self,
        _target: &UploadTarget,
        part_number: PartNumber,
    ) -> Result<PartTransport> {
        let issued = self.transports.fetch_add(1, Ordering::SeqCst) + 1;
        match self.direct_window {
            Some(window) => Ok(PartTransport::Direct {
                url: format!("https://store.test/movie.mp4?partNumber={}&grant={}", part_number, issued),
                expires_at: Utc::now() + chrono::Duration::from_std(window).unwrap(),
            }),
            None => Ok(PartTransport::Proxied),
        }
    }

    async fn upload_proxied(
        &self,
        _target: &UploadTarget,
        part_number: PartNumber,
        body: Bytes,
    ) -> Result<ETag> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        *self.attempts.lock().unwrap().entry(part_number.get()).or_insert(0) += 1;

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.injected_failure(part_number.get()) {
            return Err(err);
        }
        Ok(ETag::parse(part_number.get(), &format!("\"etag-{}-{}\"", part_number, body.len()))?)
    }

    async fn put_direct(&self, url: &str, part_number: PartNumber, body: Bytes) -> Result<ETag> {
        if self.direct_window.is_none() {
            return Err(DeckError::Forbidden(format!("unexpected direct put to {}", url)).into());
        }
        *self.attempts.lock().unwrap().entry(part_number.get()).or_insert(0) += 1;
        if self.take_stall(part_number.get()) {
            std::future::pending::<()>().await;
        }
        Ok(ETag::parse(part_number.get(), &format!("\"etag-{}-{}\"", part_number, body.len()))?)
    }

    async fn record_part(
        &self,
        _target: &UploadTarget,
        _part_number: PartNumber,
        _etag: &ETag,
    ) -> Result<()> {
        Ok(())
    }

    async fn complete(
        &self,
        _target: &UploadTarget,
        parts: &[CompletedPart],
        part_count: u32,
    ) -> Result<()> {
        self.completions.lock().unwrap().push((parts.to_vec(), part_count));
        if self.fail_complete.load(Ordering::SeqCst) {
            return Err(DeckError::StoreUnavailable("complete refused".to_string()).into());
        }
        Ok(())
    }

    async fn abort(&self, _target: &UploadTarget) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn put_object(&self, _bucket: &BucketId, key: &Key, body: Bytes) -> Result<()> {
        self.puts.lock().unwrap().push((key.clone(), body.len()));
        Ok(())
    }
}

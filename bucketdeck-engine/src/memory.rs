//! In-process object store for tests
//!
//! Mirrors the S3 multipart contract closely enough to exercise the upload
//! pipeline: parts are only visible after completion, completion validates
//! order and tokens, and presigned URLs expire against a test-controlled clock.

use async_trait::async_trait;
use bucketdeck_core::*;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::gateway::{ObjectBody, ObjectStore, PresignedPart, StoreError, StoreResult};

const URL_SCHEME: &str = "memory://";

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Clone)]
struct Grant {
    key: Key,
    upload_id: UploadId,
    part_number: PartNumber,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    grants: HashMap<String, Grant>,
    next_upload: u64,
    next_grant: u64,
    clock_skew: TimeDelta,
    unavailable: bool,
    part_failures: HashMap<u32, u32>,
    part_attempts: HashMap<u32, u32>,
    completions: Vec<Vec<CompletedPart>>,
    aborts: Vec<UploadId>,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_skew
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }

    fn store_part(
        &mut self,
        upload_id: &UploadId,
        part_number: PartNumber,
        body: Bytes,
    ) -> StoreResult<String> {
        self.check_available()?;

        let number = part_number.get();
        *self.part_attempts.entry(number).or_insert(0) += 1;
        if let Some(remaining) = self.part_failures.get_mut(&number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Unavailable(format!("injected failure for part {}", number)));
            }
        }

        let upload = self
            .uploads
            .get_mut(upload_id.as_str())
            .ok_or_else(|| StoreError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })?;

        let etag = content_etag(&body);
        upload.parts.insert(number, (etag.clone(), body));
        Ok(etag)
    }
}

/// Quoted ETag derived from content, as S3 reports for single-part objects
fn content_etag(data: &[u8]) -> String {
    let hash = blake3::hash(data).to_hex();
    format!("\"{}\"", &hash.as_str()[..32])
}

/// Thread-safe in-memory store with fault injection
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge every other assertion
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an object directly
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let mut state = self.state();
        let last_modified = state.now();
        state.objects.insert(
            key.to_string(),
            StoredObject {
                etag: content_etag(&data),
                data,
                last_modified,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).map(|object| object.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }

    /// Multipart uploads neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    /// Part lists of every completion request, successful or not
    pub fn completions(&self) -> Vec<Vec<CompletedPart>> {
        self.state().completions.clone()
    }

    pub fn aborts(&self) -> Vec<UploadId> {
        self.state().aborts.clone()
    }

    /// Upload attempts that reached the store for one part
    pub fn part_attempts(&self, part_number: u32) -> u32 {
        self.state().part_attempts.get(&part_number).copied().unwrap_or(0)
    }

    /// Fail the next `times` uploads of `part_number` as unavailable
    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.state().part_failures.insert(part_number, times);
    }

    /// Take the whole store offline or bring it back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Move the store's clock forward, expiring presigned URLs
    pub fn advance_clock(&self, by: Duration) {
        let mut state = self.state();
        let by = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        state.clock_skew = state.clock_skew.checked_add(&by).unwrap_or(TimeDelta::MAX);
    }

    /// Serve a PUT against a URL issued by [`ObjectStore::presign_upload_part`].
    ///
    /// Returns the raw quoted ETag, as the ETag response header would carry it.
    pub fn put_presigned(&self, url: &str, body: Bytes) -> StoreResult<String> {
        let mut state = self.state();
        let grant = state
            .grants
            .get(url)
            .cloned()
            .ok_or_else(|| StoreError::Forbidden(format!("unknown presigned url {}", url)))?;

        if state.now() >= grant.expires_at {
            return Err(StoreError::Expired {
                part_number: grant.part_number.get(),
            });
        }

        let pending_key = state
            .uploads
            .get(grant.upload_id.as_str())
            .map(|upload| upload.key.clone());
        if pending_key.as_deref().is_some_and(|key| key != grant.key.as_str()) {
            return Err(StoreError::Forbidden("signature does not match key".to_string()));
        }

        state.store_part(&grant.upload_id, grant.part_number, body)
    }

    /// Whether `url` was issued by this store
    pub fn is_presigned_url(url: &str) -> bool {
        url.starts_with(URL_SCHEME)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> StoreResult<Listing> {
        let state = self.state();
        state.check_available()?;

        let mut listing = Listing::default();
        for (key, object) in state.objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else { break };
            if rest.is_empty() {
                continue;
            }

            if let Some(delimiter) = delimiter.filter(|d| !d.is_empty()) {
                if let Some(position) = rest.find(delimiter) {
                    let common = format!("{}{}", prefix, &rest[..position + delimiter.len()]);
                    if listing.common_prefixes.last() != Some(&common) {
                        listing.common_prefixes.push(common);
                    }
                    continue;
                }
            }

            listing.objects.push(ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: Some(object.last_modified),
                etag: Some(object.etag.trim_matches('"').to_string()),
            });
        }
        Ok(listing)
    }

    async fn get(&self, key: &Key) -> StoreResult<ObjectBody> {
        let state = self.state();
        state.check_available()?;

        let object = state
            .objects
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;

        let len = object.data.len() as u64;
        Ok(ObjectBody {
            content_type: Some("application/octet-stream".to_string()),
            content_length: Some(len),
            etag: Some(object.etag.trim_matches('"').to_string()),
            body: futures::stream::once(async move { Ok(object.data) }).boxed(),
        })
    }

    async fn put(&self, key: &Key, body: Bytes) -> StoreResult<()> {
        self.state().check_available()?;
        self.insert(key.as_str(), body);
        Ok(())
    }

    async fn delete(&self, key: &Key) -> StoreResult<()> {
        let mut state = self.state();
        state.check_available()?;
        state
            .objects
            .remove(key.as_str())
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn create_multipart_upload(&self, key: &Key) -> StoreResult<UploadId> {
        let mut state = self.state();
        state.check_available()?;

        state.next_upload += 1;
        let id = format!("mem-upload-{:06}", state.next_upload);
        state.uploads.insert(
            id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        UploadId::new(&id).map_err(|e| StoreError::Unknown(e.to_string()))
    }

    async fn upload_part(
        &self,
        _key: &Key,
        upload_id: &UploadId,
        part_number: PartNumber,
        body: Bytes,
    ) -> StoreResult<String> {
        self.state().store_part(upload_id, part_number, body)
    }

    async fn complete_multipart_upload(
        &self,
        key: &Key,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        let mut state = self.state();
        state.check_available()?;
        state.completions.push(parts.to_vec());

        let upload = state
            .uploads
            .get(upload_id.as_str())
            .ok_or_else(|| StoreError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })?;

        if parts.is_empty() {
            return Err(StoreError::Unknown("MalformedXML: no parts".to_string()));
        }
        if !parts.windows(2).all(|w| w[0].part_number < w[1].part_number) {
            return Err(StoreError::Unknown("InvalidPartOrder".to_string()));
        }

        let mut data = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number.get()) {
                Some((etag, body)) if etag.trim_matches('"') == part.etag.as_str() => {
                    data.extend_from_slice(body);
                }
                _ => {
                    return Err(StoreError::Unknown(format!(
                        "InvalidPart: part {} not uploaded with that ETag",
                        part.part_number
                    )))
                }
            }
        }

        state.uploads.remove(upload_id.as_str());
        state.grants.retain(|_, grant| &grant.upload_id != upload_id);
        drop(state);
        self.insert(key.as_str(), data.freeze());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &Key, upload_id: &UploadId) -> StoreResult<()> {
        let mut state = self.state();
        state.check_available()?;
        state
            .uploads
            .remove(upload_id.as_str())
            .ok_or_else(|| StoreError::NoSuchUpload {
                upload_id: upload_id.to_string(),
            })?;
        state.grants.retain(|_, grant| &grant.upload_id != upload_id);
        state.aborts.push(upload_id.clone());
        Ok(())
    }

    async fn presign_upload_part(
        &self,
        key: &Key,
        upload_id: &UploadId,
        part_number: PartNumber,
        expires_in: Duration,
    ) -> StoreResult<PresignedPart> {
        let mut state = self.state();
        state.check_available()?;

        let lifetime =
            TimeDelta::from_std(expires_in).map_err(|e| StoreError::Unknown(e.to_string()))?;
        let expires_at = state.now() + lifetime;
        state.next_grant += 1;
        let url = format!(
            "{}{}?uploadId={}&partNumber={}&signature={}",
            URL_SCHEME, key, upload_id, part_number, state.next_grant
        );
        state.grants.insert(
            url.clone(),
            Grant {
                key: key.clone(),
                upload_id: upload_id.clone(),
                part_number,
                expires_at,
            },
        );

        Ok(PresignedPart { url, expires_at })
    }
}

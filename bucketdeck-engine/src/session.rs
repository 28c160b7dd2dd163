//! Upload session manager
//!
//! Owns every in-flight multipart upload. Each session moves through
//! `Open -> Completing -> Completed` or `Open -> Aborting -> Aborted`; a store
//! error during finalize or abort parks it in `Failed`, where only abort is
//! accepted. Terminal sessions leave the registry.
//!
//! Locks guard plain bookkeeping only and are never held across a store call.

use bucketdeck_core::*;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::gateway::StoreError;
use crate::{Bucket, Engine};

/// Outcome of recording a part completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    New,
    /// Same part with the same token was already recorded
    Duplicate,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub target: UploadTarget,
    pub owner: String,
    pub state: SessionState,
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    parts: BTreeMap<PartNumber, ETag>,
}

/// One open multipart upload
#[derive(Debug)]
pub struct UploadSession {
    bucket: Bucket,
    key: Key,
    upload_id: UploadId,
    owner: String,
    opened_at: Instant,
    inner: Mutex<SessionInner>,
}

impl UploadSession {
    fn new(bucket: Bucket, key: Key, upload_id: UploadId, owner: String) -> Self {
        UploadSession {
            bucket,
            key,
            upload_id,
            owner,
            opened_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Open,
                parts: BTreeMap::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn target(&self) -> UploadTarget {
        UploadTarget::new(self.bucket.id().clone(), self.key.clone(), self.upload_id.clone())
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    fn invalid_state(&self, state: SessionState) -> DeckError {
        DeckError::InvalidState {
            session: self.upload_id.to_string(),
            state,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.inner().state {
            SessionState::Open => Ok(()),
            state => Err(self.invalid_state(state)),
        }
    }

    fn record(&self, part_number: PartNumber, etag: ETag) -> Result<Recorded> {
        let mut inner = self.inner();
        if inner.state != SessionState::Open {
            return Err(self.invalid_state(inner.state));
        }

        match inner.parts.get(&part_number) {
            Some(existing) if *existing == etag => Ok(Recorded::Duplicate),
            Some(_) => Err(DeckError::PartConflict {
                part_number: part_number.get(),
            }),
            None => {
                inner.parts.insert(part_number, etag);
                Ok(Recorded::New)
            }
        }
    }

    /// Move to `Completing` and build the completion payload.
    ///
    /// The recorded part numbers must be exactly `1..=expected`; otherwise the
    /// session stays `Open`.
    fn begin_completion(&self, expected: u32) -> Result<Vec<CompletedPart>> {
        let mut inner = self.inner();
        if inner.state != SessionState::Open {
            return Err(self.invalid_state(inner.state));
        }

        let present = inner.parts.len();
        let contiguous = present == expected as usize
            && inner
                .parts
                .keys()
                .zip(1..=expected)
                .all(|(part, n)| part.get() == n);
        if expected == 0 || !contiguous {
            return Err(DeckError::IncompletePartSet { expected, present });
        }

        // BTreeMap iteration is ascending by part number
        let parts: Vec<CompletedPart> = inner
            .parts
            .iter()
            .map(|(part, etag)| CompletedPart::new(*part, etag.clone()))
            .collect();
        if !parts.windows(2).all(|w| w[0].part_number < w[1].part_number) {
            return Err(DeckError::Internal("completion payload out of order".to_string()));
        }

        inner.state = SessionState::Completing;
        Ok(parts)
    }

    fn begin_abort(&self) -> Result<()> {
        let mut inner = self.inner();
        match inner.state {
            SessionState::Open | SessionState::Failed => {
                inner.state = SessionState::Aborting;
                Ok(())
            }
            state => Err(self.invalid_state(state)),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.inner().state = state;
    }

    fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner();
        SessionSnapshot {
            target: self.target(),
            owner: self.owner.clone(),
            state: inner.state,
            parts: inner
                .parts
                .iter()
                .map(|(part, etag)| CompletedPart::new(*part, etag.clone()))
                .collect(),
        }
    }
}

/// Sessions keyed by upload id
#[derive(Debug, Default)]
struct SessionRegistry {
    sessions: Mutex<HashMap<UploadId, Arc<UploadSession>>>,
}

impl SessionRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<UploadId, Arc<UploadSession>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, session: Arc<UploadSession>) {
        self.lock().insert(session.upload_id.clone(), session);
    }

    fn get(&self, upload_id: &UploadId) -> Option<Arc<UploadSession>> {
        self.lock().get(upload_id).cloned()
    }

    fn remove(&self, upload_id: &UploadId) {
        self.lock().remove(upload_id);
    }

    fn all(&self) -> Vec<Arc<UploadSession>> {
        self.lock().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Server-side owner of multipart upload lifecycles
#[derive(Debug)]
pub struct SessionManager {
    engine: Engine,
    config: UploadConfig,
    registry: SessionRegistry,
}

impl SessionManager {
    pub fn new(engine: Engine, config: UploadConfig) -> Self {
        SessionManager {
            engine,
            config,
            registry: SessionRegistry::default(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Sessions currently tracked, including `Failed` ones
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn state(&self, upload_id: &UploadId) -> Option<SessionState> {
        self.registry.get(upload_id).map(|session| session.state())
    }

    pub fn snapshot(&self, upload_id: &UploadId) -> Option<SessionSnapshot> {
        self.registry.get(upload_id).map(|session| session.snapshot())
    }

    /// Look a session up for `principal`, re-checking bucket access.
    ///
    /// A session opened by someone else, or addressed with the wrong bucket or
    /// key, is reported as unknown.
    fn session(&self, principal: &Principal, target: &UploadTarget) -> Result<Arc<UploadSession>> {
        self.engine.registry().resolve(&target.bucket, &principal.groups)?;

        let session = self
            .registry
            .get(&target.upload_id)
            .filter(|session| {
                session.bucket.id() == &target.bucket
                    && session.key == target.key
                    && session.owner == principal.subject
            })
            .ok_or_else(|| DeckError::UnknownSession(target.upload_id.to_string()))?;
        Ok(session)
    }

    /// Open a multipart upload for `key` in `bucket_id`
    pub async fn open_session(
        &self,
        principal: &Principal,
        bucket_id: &BucketId,
        key: &Key,
    ) -> Result<UploadTarget> {
        let bucket = self.engine.bucket(bucket_id, principal)?;
        let upload_id = bucket.store().create_multipart_upload(key).await?;

        let session = Arc::new(UploadSession::new(
            bucket,
            key.clone(),
            upload_id,
            principal.subject.clone(),
        ));
        let target = session.target();
        self.registry.insert(session);

        info!(
            bucket = %target.bucket,
            key = %target.key,
            upload_id = %target.upload_id,
            owner = %principal.subject,
            "upload session opened"
        );
        Ok(target)
    }

    /// Transport for one part, fixed by the bucket's configured mode
    pub async fn request_part_transport(
        &self,
        principal: &Principal,
        target: &UploadTarget,
        part_number: PartNumber,
    ) -> Result<PartTransport> {
        let session = self.session(principal, target)?;
        session.ensure_open()?;

        match session.bucket.transport_mode() {
            TransportMode::Proxied => Ok(PartTransport::Proxied),
            TransportMode::Direct => {
                let presigned = session
                    .bucket
                    .store()
                    .presign_upload_part(
                        &session.key,
                        &session.upload_id,
                        part_number,
                        self.config.presign_expiry,
                    )
                    .await?;
                debug!(
                    upload_id = %session.upload_id,
                    part = %part_number,
                    expires_at = %presigned.expires_at,
                    "presigned part"
                );
                Ok(PartTransport::Direct {
                    url: presigned.url,
                    expires_at: presigned.expires_at,
                })
            }
        }
    }

    /// Proxied transport: send one buffered part to the store and record it
    pub async fn upload_part(
        &self,
        principal: &Principal,
        target: &UploadTarget,
        part_number: PartNumber,
        body: Bytes,
    ) -> Result<ETag> {
        let session = self.session(principal, target)?;
        session.ensure_open()?;
        if session.bucket.transport_mode() != TransportMode::Proxied {
            return Err(DeckError::InvalidInput(format!(
                "bucket '{}' takes parts through presigned urls",
                target.bucket
            )));
        }

        let size = body.len();
        let raw = session
            .bucket
            .store()
            .upload_part(&session.key, &session.upload_id, part_number, body)
            .await?;
        let etag = ETag::parse(part_number.get(), &raw)?;
        session.record(part_number, etag.clone())?;

        debug!(upload_id = %session.upload_id, part = %part_number, size, "part stored");
        Ok(etag)
    }

    /// Record the completion token a caller obtained for a part
    pub fn record_part_completion(
        &self,
        principal: &Principal,
        target: &UploadTarget,
        part_number: PartNumber,
        token: &str,
    ) -> Result<Recorded> {
        let session = self.session(principal, target)?;
        let etag = ETag::parse(part_number.get(), token)?;
        let recorded = session.record(part_number, etag)?;
        debug!(upload_id = %session.upload_id, part = %part_number, ?recorded, "part recorded");
        Ok(recorded)
    }

    /// Complete the upload once parts `1..=expected_part_count` are recorded
    pub async fn finalize(
        &self,
        principal: &Principal,
        target: &UploadTarget,
        expected_part_count: u32,
    ) -> Result<()> {
        let session = self.session(principal, target)?;
        let parts = session.begin_completion(expected_part_count)?;

        match session
            .bucket
            .store()
            .complete_multipart_upload(&session.key, &session.upload_id, &parts)
            .await
        {
            Ok(()) => {
                session.set_state(SessionState::Completed);
                self.registry.remove(&session.upload_id);
                info!(
                    target: "bucketdeck::audit",
                    bucket = %target.bucket,
                    key = %target.key,
                    upload_id = %target.upload_id,
                    parts = parts.len(),
                    owner = %principal.subject,
                    "upload completed"
                );
                Ok(())
            }
            Err(e) => {
                session.set_state(SessionState::Failed);
                error!(upload_id = %session.upload_id, error = %e, "finalize failed");
                Err(e.into())
            }
        }
    }

    /// Record a caller-supplied part list, then finalize.
    ///
    /// The expected count defaults to the number of listed parts.
    pub async fn complete_with_parts(
        &self,
        principal: &Principal,
        target: &UploadTarget,
        parts: &[CompletedPart],
        part_count: Option<u32>,
    ) -> Result<()> {
        for part in parts {
            self.record_part_completion(principal, target, part.part_number, part.etag.as_str())?;
        }
        let expected = match part_count {
            Some(count) => count,
            None => u32::try_from(parts.len())
                .map_err(|_| DeckError::InvalidInput("too many parts".to_string()))?,
        };
        self.finalize(principal, target, expected).await
    }

    /// Abort the upload so the store discards its parts
    pub async fn abort(&self, principal: &Principal, target: &UploadTarget) -> Result<()> {
        let session = self.session(principal, target)?;
        self.abort_session(&session).await
    }

    async fn abort_session(&self, session: &UploadSession) -> Result<()> {
        session.begin_abort()?;

        match session
            .bucket
            .store()
            .abort_multipart_upload(&session.key, &session.upload_id)
            .await
        {
            Ok(()) => {}
            Err(StoreError::NoSuchUpload { .. }) => {
                warn!(upload_id = %session.upload_id, "store had no such upload, treating abort as done");
            }
            Err(e) => {
                session.set_state(SessionState::Failed);
                error!(upload_id = %session.upload_id, error = %e, "abort failed");
                return Err(e.into());
            }
        }

        session.set_state(SessionState::Aborted);
        self.registry.remove(&session.upload_id);
        info!(
            bucket = %session.bucket.id(),
            key = %session.key,
            upload_id = %session.upload_id,
            "upload aborted"
        );
        Ok(())
    }

    /// Abort sessions left `Open` or `Failed` for longer than `max_age`.
    ///
    /// Returns how many were aborted.
    pub async fn reap_stale(&self, max_age: Duration) -> usize {
        let mut reaped = 0;
        for session in self.registry.all() {
            let state = session.state();
            if !matches!(state, SessionState::Open | SessionState::Failed) || session.age() < max_age {
                continue;
            }
            match self.abort_session(&session).await {
                Ok(()) => reaped += 1,
                Err(e) => warn!(upload_id = %session.upload_id, error = %e, "could not reap stale session"),
            }
        }
        if reaped > 0 {
            info!(reaped, "reaped stale upload sessions");
        }
        reaped
    }
}

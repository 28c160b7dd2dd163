//! Object store gateway
//!
//! Thin seam over an S3-compatible store. Implementations are stateless apart
//! from their connection; session bookkeeping lives in [`crate::session`].

use async_trait::async_trait;
use bucketdeck_core::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Streaming object body
pub type ByteStream = BoxStream<'static, StoreResult<Bytes>>;

/// Coarse classification of a store failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    Forbidden,
    Unavailable,
    Expired,
    Unknown,
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("No such key: {key}")]
    NotFound { key: String },

    #[error("No such multipart upload: {upload_id}")]
    NoSuchUpload { upload_id: String },

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Presigned request for part {part_number} expired")]
    Expired { part_number: u32 },

    #[error("Store error: {0}")]
    Unknown(String),
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::NotFound { .. } | StoreError::NoSuchUpload { .. } => {
                StoreErrorKind::NotFound
            }
            StoreError::Forbidden(_) => StoreErrorKind::Forbidden,
            StoreError::Unavailable(_) => StoreErrorKind::Unavailable,
            StoreError::Expired { .. } => StoreErrorKind::Expired,
            StoreError::Unknown(_) => StoreErrorKind::Unknown,
        }
    }
}

impl From<StoreError> for DeckError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => DeckError::ObjectNotFound { key },
            StoreError::NoSuchUpload { upload_id } => DeckError::UnknownSession(upload_id),
            StoreError::Forbidden(message) => DeckError::Forbidden(message),
            StoreError::Unavailable(message) => DeckError::StoreUnavailable(message),
            StoreError::Expired { part_number } => DeckError::TransportExpired { part_number },
            StoreError::Unknown(message) => DeckError::Internal(message),
        }
    }
}

/// Object payload returned by a download
pub struct ObjectBody {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub body: ByteStream,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

/// Time-limited URL authorizing one part upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedPart {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Operations the upload pipeline and browser need from a store.
///
/// Part ETags are returned raw (possibly quoted); callers normalize them with
/// [`ETag::parse`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// One delimited level under `prefix`
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> StoreResult<Listing>;

    async fn get(&self, key: &Key) -> StoreResult<ObjectBody>;

    /// Single-request write, used for empty files
    async fn put(&self, key: &Key, body: Bytes) -> StoreResult<()>;

    async fn delete(&self, key: &Key) -> StoreResult<()>;

    async fn create_multipart_upload(&self, key: &Key) -> StoreResult<UploadId>;

    async fn upload_part(
        &self,
        key: &Key,
        upload_id: &UploadId,
        part_number: PartNumber,
        body: Bytes,
    ) -> StoreResult<String>;

    /// `parts` must be sorted by ascending part number
    async fn complete_multipart_upload(
        &self,
        key: &Key,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> StoreResult<()>;

    async fn abort_multipart_upload(&self, key: &Key, upload_id: &UploadId) -> StoreResult<()>;

    async fn presign_upload_part(
        &self,
        key: &Key,
        upload_id: &UploadId,
        part_number: PartNumber,
        expires_in: Duration,
    ) -> StoreResult<PresignedPart>;
}

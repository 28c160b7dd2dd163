//! Upload operations the scheduler drives

use async_trait::async_trait;
use bucketdeck_core::*;
use bytes::Bytes;
use chrono::Utc;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// A multipart upload opened on the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedUpload {
    pub target: UploadTarget,
    pub mode: TransportMode,
    /// Part size the server advertised, if any
    pub chunk_size: Option<u64>,
}

/// The session and transport operations one upload needs.
///
/// [`crate::DeckClient`] implements this over HTTP; tests plug in local
/// implementations.
#[async_trait]
pub trait UploadBackend: Send + Sync {
    async fn open(&self, bucket: &BucketId, key: &Key) -> Result<OpenedUpload>;

    async fn request_transport(
        &self,
        target: &UploadTarget,
        part_number: PartNumber,
    ) -> Result<PartTransport>;

    /// Send a part through the server, which records it
    async fn upload_proxied(
        &self,
        target: &UploadTarget,
        part_number: PartNumber,
        body: Bytes,
    ) -> Result<ETag>;

    /// PUT a part to a presigned URL and return its ETag
    async fn put_direct(&self, url: &str, part_number: PartNumber, body: Bytes) -> Result<ETag>;

    async fn record_part(
        &self,
        target: &UploadTarget,
        part_number: PartNumber,
        etag: &ETag,
    ) -> Result<()>;

    async fn complete(
        &self,
        target: &UploadTarget,
        parts: &[CompletedPart],
        part_count: u32,
    ) -> Result<()>;

    async fn abort(&self, target: &UploadTarget) -> Result<()>;

    /// Single-request write for sources too small for multipart
    async fn put_object(&self, bucket: &BucketId, key: &Key, body: Bytes) -> Result<()>;
}

/// Move one part over `transport`, recording it when the server did not.
///
/// A direct PUT still running when its URL's window closes fails as
/// [`DeckError::TransportExpired`], so the caller can retry with a new URL.
pub async fn transfer_part<B: UploadBackend + ?Sized>(
    backend: &B,
    target: &UploadTarget,
    part_number: PartNumber,
    transport: &PartTransport,
    body: Bytes,
) -> Result<ETag> {
    match transport {
        PartTransport::Proxied => backend.upload_proxied(target, part_number, body).await,
        PartTransport::Direct { url, expires_at } => {
            let window = (*expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let put = backend.put_direct(url, part_number, body);
            let etag = match tokio::time::timeout(window, put).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(upload = %target, part = %part_number, "presigned url lapsed mid-upload");
                    return Err(DeckError::TransportExpired {
                        part_number: part_number.get(),
                    }
                    .into());
                }
            };
            backend.record_part(target, part_number, &etag).await?;
            Ok(etag)
        }
    }
}

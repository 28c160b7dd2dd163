//! S3-compatible store backed by the AWS SDK

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use bucketdeck_core::*;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use std::time::Duration;
use tracing::debug;

use crate::gateway::{ObjectBody, ObjectStore, PresignedPart, StoreError, StoreResult};

/// One configured bucket on an S3-compatible endpoint
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store").field("bucket", &self.bucket).finish()
    }
}

impl S3Store {
    /// Build a client from static bucket credentials.
    ///
    /// No network traffic happens here; connection problems surface on the
    /// first request as [`StoreError::Unavailable`].
    pub fn new(config: &BucketConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "bucketdeck",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        S3Store {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }
}

/// What a failing request was about, for error classification
struct Target<'a> {
    key: &'a str,
    upload_id: Option<&'a UploadId>,
}

impl<'a> Target<'a> {
    fn key(key: &'a str) -> Self {
        Target { key, upload_id: None }
    }

    fn upload(key: &'a Key, upload_id: &'a UploadId) -> Self {
        Target {
            key: key.as_str(),
            upload_id: Some(upload_id),
        }
    }
}

fn classify<E>(err: SdkError<E>, target: Target<'_>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();

    if matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    ) {
        return StoreError::Unavailable(message);
    }

    let status = err.raw_response().map(|response| response.status().as_u16());
    match (err.code(), status) {
        (Some("NoSuchUpload"), _) => StoreError::NoSuchUpload {
            upload_id: target.upload_id.map(|id| id.to_string()).unwrap_or_default(),
        },
        (_, Some(404)) if target.upload_id.is_some() => StoreError::NoSuchUpload {
            upload_id: target.upload_id.map(|id| id.to_string()).unwrap_or_default(),
        },
        (Some("NoSuchKey" | "NotFound"), _) | (_, Some(404)) => StoreError::NotFound {
            key: target.key.to_string(),
        },
        (Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch"), _)
        | (_, Some(401 | 403)) => StoreError::Forbidden(message),
        (Some("SlowDown" | "ServiceUnavailable" | "InternalError" | "RequestTimeout"), _) => {
            StoreError::Unavailable(message)
        }
        (_, Some(status)) if status >= 500 => StoreError::Unavailable(message),
        _ => StoreError::Unknown(message),
    }
}

fn to_chrono(timestamp: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}

fn content_length(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> StoreResult<Listing> {
        let mut listing = Listing::default();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(delimiter) = delimiter {
                request = request.delimiter(delimiter);
            }
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| classify(e, Target::key(prefix)))?;

            for common in output.common_prefixes() {
                if let Some(common_prefix) = common.prefix() {
                    listing.common_prefixes.push(common_prefix.to_string());
                }
            }

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                // Folder placeholder objects list themselves
                if key == prefix {
                    continue;
                }
                listing.objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                    last_modified: object.last_modified().and_then(to_chrono),
                    etag: object.e_tag().map(|tag| tag.trim_matches('"').to_string()),
                });
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(
            bucket = %self.bucket,
            prefix,
            folders = listing.common_prefixes.len(),
            objects = listing.objects.len(),
            "listed prefix"
        );
        Ok(listing)
    }

    async fn get(&self, key: &Key) -> StoreResult<ObjectBody> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| classify(e, Target::key(key.as_str())))?;

        let content_type = output.content_type().map(str::to_string);
        let content_length = output.content_length().and_then(|l| u64::try_from(l).ok());
        let etag = output.e_tag().map(|tag| tag.trim_matches('"').to_string());

        let body = futures::stream::try_unfold(output.body, |mut body| async move {
            match body.try_next().await {
                Ok(Some(chunk)) => Ok(Some((chunk, body))),
                Ok(None) => Ok(None),
                Err(e) => Err(StoreError::Unavailable(e.to_string())),
            }
        })
        .boxed();

        Ok(ObjectBody {
            content_type,
            content_length,
            etag,
            body,
        })
    }

    async fn put(&self, key: &Key, body: Bytes) -> StoreResult<()> {
        let len = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_length(content_length(len))
            .body(SdkByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(e, Target::key(key.as_str())))?;
        Ok(())
    }

    async fn delete(&self, key: &Key) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| classify(e, Target::key(key.as_str())))?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &Key) -> StoreResult<UploadId> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| classify(e, Target::key(key.as_str())))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| StoreError::Unknown("store returned no upload id".to_string()))?;
        UploadId::new(upload_id).map_err(|e| StoreError::Unknown(e.to_string()))
    }

    async fn upload_part(
        &self,
        key: &Key,
        upload_id: &UploadId,
        part_number: PartNumber,
        body: Bytes,
    ) -> StoreResult<String> {
        let len = body.len();
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key.as_str())
            .upload_id(upload_id.as_str())
            .part_number(part_number.get() as i32)
            .content_length(content_length(len))
            .body(SdkByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(e, Target::upload(key, upload_id)))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Unknown(format!("no ETag for part {}", part_number)))
    }

    async fn complete_multipart_upload(
        &self,
        key: &Key,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        let parts = parts
            .iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.part_number.get() as i32)
                    .e_tag(part.etag.quoted())
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .upload_id(upload_id.as_str())
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| classify(e, Target::upload(key, upload_id)))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &Key, upload_id: &UploadId) -> StoreResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .upload_id(upload_id.as_str())
            .send()
            .await
            .map_err(|e| classify(e, Target::upload(key, upload_id)))?;
        Ok(())
    }

    async fn presign_upload_part(
        &self,
        key: &Key,
        upload_id: &UploadId,
        part_number: PartNumber,
        expires_in: Duration,
    ) -> StoreResult<PresignedPart> {
        let issued_at = Utc::now();
        let lifetime =
            TimeDelta::from_std(expires_in).map_err(|e| StoreError::Unknown(e.to_string()))?;
        let presigning =
            PresigningConfig::expires_in(expires_in).map_err(|e| StoreError::Unknown(e.to_string()))?;

        let request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key.as_str())
            .upload_id(upload_id.as_str())
            .part_number(part_number.get() as i32)
            .presigned(presigning)
            .await
            .map_err(|e| classify(e, Target::upload(key, upload_id)))?;

        Ok(PresignedPart {
            url: request.uri().to_string(),
            expires_at: issued_at + lifetime,
        })
    }
}

//! HTTP client for the bucketdeck API

use async_trait::async_trait;
use bucketdeck_core::*;
use bucketdeck_wire::*;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::backend::{OpenedUpload, UploadBackend};
use crate::{ClientError, Result};

/// Network time limits of a [`DeckClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// Establishing a TCP/TLS connection
    pub connect: Duration,
    /// Whole API call or part upload, body included
    pub request: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        ClientTimeouts {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(300),
        }
    }
}

/// Client for one bucketdeck server, authenticated with a session token
#[derive(Clone)]
pub struct DeckClient {
    endpoint: Url,
    token: String,
    timeouts: ClientTimeouts,
    http: reqwest::Client,
}

impl std::fmt::Debug for DeckClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeckClient")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl DeckClient {
    pub fn new(endpoint: &str, token: impl Into<String>) -> Result<Self> {
        Self::with_timeouts(endpoint, token, ClientTimeouts::default())
    }

    pub fn with_timeouts(
        endpoint: &str,
        token: impl Into<String>,
        timeouts: ClientTimeouts,
    ) -> Result<Self> {
        let endpoint =
            Url::parse(endpoint).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                endpoint.scheme()
            )));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("bucketdeck/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeouts.connect)
            .build()?;

        Ok(DeckClient {
            endpoint,
            token: token.into(),
            timeouts,
            http,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.endpoint
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", path, e)))
    }

    fn url_with_query<Q: Serialize>(&self, path: &str, query: &Q) -> Result<Url> {
        let mut url = self.url(path)?;
        url.set_query(Some(&encode_query(query)?));
        Ok(url)
    }

    pub fn timeouts(&self) -> ClientTimeouts {
        self.timeouts
    }

    /// API request carrying the session token
    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .timeout(self.timeouts.request)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn send_success(&self, request: RequestBuilder) -> Result<()> {
        let response: SuccessResponse = self.send_json(request).await?;
        if !response.success {
            return Err(ClientError::InvalidResponse("server reported failure".to_string()));
        }
        Ok(())
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let url = self.url(routes::HEALTH)?;
        self.send_json(self.http.get(url).timeout(self.timeouts.request)).await
    }

    /// Buckets visible to the token's groups
    pub async fn list_buckets(&self) -> Result<BucketsResponse> {
        let url = self.url(routes::BUCKETS)?;
        self.send_json(self.request(Method::GET, url)).await
    }

    /// One folder level of `bucket` under `prefix`
    pub async fn browse(&self, bucket: &BucketId, prefix: &str) -> Result<ListResponse> {
        let query = BrowseQuery {
            prefix: prefix.to_string(),
        };
        let url = self.url_with_query(&routes::bucket(bucket.as_str()), &query)?;
        self.send_json(self.request(Method::GET, url)).await
    }

    pub async fn delete(&self, bucket: &BucketId, key: &Key) -> Result<()> {
        let url = self.url(&routes::bucket(bucket.as_str()))?;
        let body = DeleteRequest {
            file_key: key.clone(),
        };
        self.send_success(self.request(Method::DELETE, url).json(&body)).await
    }

    async fn download_response(&self, bucket: &BucketId, key: &Key) -> Result<Response> {
        let query = DownloadQuery { key: key.clone() };
        let url = self.url_with_query(&routes::download(bucket.as_str()), &query)?;
        // No total timeout: the body streams for as long as the object takes
        let request = self.http.get(url).bearer_auth(&self.token);
        check(request.send().await?).await
    }

    /// Whole object in memory
    pub async fn download(&self, bucket: &BucketId, key: &Key) -> Result<Bytes> {
        let response = self.download_response(bucket, key).await?;
        Ok(response.bytes().await?)
    }

    /// Stream an object into a file, returning the bytes written
    pub async fn download_to(&self, bucket: &BucketId, key: &Key, path: &Path) -> Result<u64> {
        let response = self.download_response(bucket, key).await?;
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(bucket = %bucket, key = %key, written, "download finished");
        Ok(written)
    }
}

/// Pass successful responses through; turn the rest into errors
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await?;
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(ClientError::api(status.as_u16(), body)),
        Err(_) => Err(ClientError::Http {
            status: status.as_u16(),
            body: text,
        }),
    }
}

#[async_trait]
impl UploadBackend for DeckClient {
    async fn open(&self, bucket: &BucketId, key: &Key) -> Result<OpenedUpload> {
        let url = self.url(routes::UPLOAD_INIT)?;
        let body = InitUploadRequest {
            bucket_id: bucket.clone(),
            key: key.clone(),
        };
        let response: InitUploadResponse =
            self.send_json(self.request(Method::POST, url).json(&body)).await?;

        Ok(OpenedUpload {
            target: UploadTarget::new(bucket.clone(), key.clone(), response.upload_id),
            mode: response.mode,
            chunk_size: response.chunk_size,
        })
    }

    async fn request_transport(
        &self,
        target: &UploadTarget,
        part_number: PartNumber,
    ) -> Result<PartTransport> {
        let url = self.url(routes::PRESIGN_PART)?;
        let body = PartRequest::new(target, part_number);
        self.send_json(self.request(Method::POST, url).json(&body)).await
    }

    async fn upload_proxied(
        &self,
        target: &UploadTarget,
        part_number: PartNumber,
        body: Bytes,
    ) -> Result<ETag> {
        let url = self.url_with_query(routes::UPLOAD_PART, &PartRequest::new(target, part_number))?;
        let request = self
            .request(Method::POST, url)
            .header(CONTENT_LENGTH, body.len())
            .body(body);
        let response: EtagResponse = self.send_json(request).await?;
        Ok(response.etag)
    }

    async fn put_direct(&self, url: &str, part_number: PartNumber, body: Bytes) -> Result<ETag> {
        // Presigned URLs carry their own signature; a bearer header would clash with it
        let response = self
            .http
            .put(url)
            .timeout(self.timeouts.request)
            .header(CONTENT_LENGTH, body.len())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            if status.as_u16() == 403 && text.to_ascii_lowercase().contains("expired") {
                return Err(DeckError::TransportExpired {
                    part_number: part_number.get(),
                }
                .into());
            }
            return Err(ClientError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let raw = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        Ok(ETag::parse(part_number.get(), raw)?)
    }

    async fn record_part(
        &self,
        target: &UploadTarget,
        part_number: PartNumber,
        etag: &ETag,
    ) -> Result<()> {
        let url = self.url(routes::RECORD_PART)?;
        let body = RecordPartRequest {
            bucket_id: target.bucket.clone(),
            key: target.key.clone(),
            upload_id: target.upload_id.clone(),
            part_number,
            etag: etag.as_str().to_string(),
        };
        self.send_success(self.request(Method::POST, url).json(&body)).await
    }

    async fn complete(
        &self,
        target: &UploadTarget,
        parts: &[CompletedPart],
        part_count: u32,
    ) -> Result<()> {
        let url = self.url(routes::COMPLETE)?;
        let body = CompleteRequest {
            bucket_id: target.bucket.clone(),
            key: target.key.clone(),
            upload_id: target.upload_id.clone(),
            parts: parts.iter().map(ReportedPart::from).collect(),
            part_count: Some(part_count),
        };
        self.send_success(self.request(Method::POST, url).json(&body)).await
    }

    async fn abort(&self, target: &UploadTarget) -> Result<()> {
        let url = self.url(routes::ABORT)?;
        let body = UploadRef::from(target);
        self.send_success(self.request(Method::POST, url).json(&body)).await
    }

    async fn put_object(&self, bucket: &BucketId, key: &Key, body: Bytes) -> Result<()> {
        let query = ObjectQuery {
            bucket_id: bucket.clone(),
            key: key.clone(),
        };
        let url = self.url_with_query(routes::PUT_OBJECT, &query)?;
        let request = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, body.len())
            .body(body);
        self.send_success(request).await
    }
}

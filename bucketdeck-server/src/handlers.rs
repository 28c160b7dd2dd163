//! HTTP request handlers
//!
//! Handlers are generic over the request body so tests can drive them with
//! in-memory bodies instead of a socket.

use bucketdeck_core::*;
use bucketdeck_engine::ByteStream;
use bucketdeck_wire::*;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH,
    CONTENT_TYPE, ETAG, IF_NONE_MATCH, SERVER,
};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::result::Result;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::server::AppState;
use crate::thumbnail::{etag_matches, render_thumbnail};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

const SERVER_HEADER: &str = concat!("bucketdeck/", env!("CARGO_PKG_VERSION"));

const THUMBNAIL_CACHE_CONTROL: &str = "public, max-age=86400, stale-while-revalidate=3600";

/// Request failures, each mapped to one status code
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Deck(#[from] DeckError),

    #[error("Content-Length header required")]
    LengthRequired,

    #[error("Body of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("No such route")]
    RouteNotFound,

    #[error("Failed to read request body: {0}")]
    Body(String),
}

impl From<WireError> for ApiError {
    fn from(err: WireError) -> Self {
        ApiError::Deck(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Deck(err) => StatusCode::from_u16(status_for(err.code()))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            ApiError::LengthRequired => StatusCode::LENGTH_REQUIRED,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RouteNotFound => StatusCode::NOT_FOUND,
            ApiError::Body(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            ApiError::Deck(err) => ErrorBody::from(err),
            ApiError::RouteNotFound => ErrorBody {
                error: self.to_string(),
                code: ErrorCode::NotFound,
            },
            _ => ErrorBody {
                error: self.to_string(),
                code: ErrorCode::InvalidInput,
            },
        }
    }
}

/// Main request handler
pub async fn handle_request<B>(req: Request<B>, state: Arc<AppState>) -> Response<ResponseBody>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = match dispatch(req, &state).await {
        Ok(response) => response,
        Err(err) => {
            let status = err.status();
            if status.is_server_error() {
                error!(%method, %path, error = %err, "request failed");
            } else {
                debug!(%method, %path, error = %err, "request rejected");
            }
            error_response(&err)
        }
    };

    debug!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "handled request"
    );
    response
}

async fn dispatch<B>(req: Request<B>, state: &AppState) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let route =
        Route::resolve(parts.method.as_str(), parts.uri.path()).ok_or(ApiError::RouteNotFound)?;

    let principal = if route.requires_auth() {
        authenticate(&parts.headers, &state.verifier)?
    } else {
        Principal::new("anonymous", Vec::new())
    };

    match route {
        Route::Health => json_response(StatusCode::OK, &HealthResponse::healthy()),
        Route::ListBuckets => {
            let buckets = state.engine().buckets_for(&principal);
            json_response(StatusCode::OK, &BucketsResponse::from(buckets))
        }
        Route::Browse { bucket } => browse(state, &principal, &bucket, &parts).await,
        Route::Delete { bucket } => delete_object(state, &principal, &bucket, body).await,
        Route::Download { bucket } => download(state, &principal, &bucket, &parts).await,
        Route::Thumbnail { bucket } => thumbnail(state, &principal, &bucket, &parts).await,
        Route::UploadInit => upload_init(state, &principal, body).await,
        Route::PresignPart => presign_part(state, &principal, body).await,
        Route::UploadPart => upload_part(state, &principal, &parts, body).await,
        Route::RecordPart => record_part(state, &principal, body).await,
        Route::Complete => complete(state, &principal, body).await,
        Route::Abort => abort(state, &principal, body).await,
        Route::PutObject => put_object(state, &principal, &parts, body).await,
    }
}

fn authenticate(headers: &HeaderMap, verifier: &SessionVerifier) -> Result<Principal, ApiError> {
    let header = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
    let token = bearer_token(header)?;
    Ok(verifier.verify(token)?)
}

async fn browse(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    parts: &Parts,
) -> Result<Response<ResponseBody>, ApiError> {
    let query: BrowseQuery = decode_query(parts.uri.query())?;
    let bucket = state.engine().bucket(&BucketId::new(bucket)?, principal)?;
    let listing = bucket.list(&query.prefix).await?;
    json_response(StatusCode::OK, &ListResponse::from(listing))
}

async fn delete_object<B>(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    body: B,
) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let bucket = state.engine().bucket(&BucketId::new(bucket)?, principal)?;
    let request: DeleteRequest = read_json(body, state.limits.max_json_body).await?;
    bucket.delete(&request.file_key).await?;
    json_response(StatusCode::OK, &SuccessResponse::ok())
}

async fn download(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    parts: &Parts,
) -> Result<Response<ResponseBody>, ApiError> {
    let query: DownloadQuery = decode_query(parts.uri.query())?;
    let bucket = state.engine().bucket(&BucketId::new(bucket)?, principal)?;
    let object = bucket.get(&query.key).await?;

    info!(
        target: "bucketdeck::audit",
        bucket = %bucket.id(),
        key = %query.key,
        subject = %principal.subject,
        "object downloaded"
    );

    let content_type = object
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_DISPOSITION, content_disposition(query.key.file_name()))
        .header(CACHE_CONTROL, "no-store")
        .header(SERVER, SERVER_HEADER);
    if let Some(len) = object.content_length {
        builder = builder.header(CONTENT_LENGTH, len);
    }

    let frames = object
        .body
        .map_ok(Frame::data)
        .map_err(|e| Box::new(e) as BoxError);
    builder
        .body(StreamBody::new(frames).boxed_unsync())
        .map_err(|e| ApiError::Deck(DeckError::Internal(e.to_string())))
}

/// JPEG preview fitting 400x400, revalidated through the object's ETag
async fn thumbnail(
    state: &AppState,
    principal: &Principal,
    bucket: &str,
    parts: &Parts,
) -> Result<Response<ResponseBody>, ApiError> {
    let query: DownloadQuery = decode_query(parts.uri.query())?;
    let bucket = state.engine().bucket(&BucketId::new(bucket)?, principal)?;
    let object = bucket.get(&query.key).await?;
    let etag = object.etag.as_deref().map(|tag| format!("\"{}\"", tag.trim_matches('"')));

    let if_none_match = parts
        .headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok());
    if let (Some(etag), Some(candidates)) = (etag.as_deref(), if_none_match) {
        if etag_matches(candidates, etag) {
            debug!(bucket = %bucket.id(), key = %query.key, "thumbnail not modified");
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(ETAG, etag)
                .header(CACHE_CONTROL, THUMBNAIL_CACHE_CONTROL)
                .header(SERVER, SERVER_HEADER)
                .body(full(Bytes::new()))
                .map_err(|e| ApiError::Deck(DeckError::Internal(e.to_string())));
        }
    }

    let source = collect_stream(object.body, state.limits.max_image_size).await?;
    let jpeg = tokio::task::spawn_blocking(move || render_thumbnail(&source))
        .await
        .map_err(|e| DeckError::Internal(format!("thumbnail task failed: {}", e)))??;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "image/jpeg")
        .header(CONTENT_LENGTH, jpeg.len())
        .header(CACHE_CONTROL, THUMBNAIL_CACHE_CONTROL)
        .header(SERVER, SERVER_HEADER);
    if let Some(etag) = etag {
        builder = builder.header(ETAG, etag);
    }
    builder
        .body(full(jpeg))
        .map_err(|e| ApiError::Deck(DeckError::Internal(e.to_string())))
}

async fn upload_init<B>(
    state: &AppState,
    principal: &Principal,
    body: B,
) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let request: InitUploadRequest = read_json(body, state.limits.max_json_body).await?;
    let mode = state
        .engine()
        .bucket(&request.bucket_id, principal)?
        .transport_mode();
    let target = state
        .manager
        .open_session(principal, &request.bucket_id, &request.key)
        .await?;

    json_response(
        StatusCode::OK,
        &InitUploadResponse {
            upload_id: target.upload_id,
            mode,
            chunk_size: Some(state.manager.config().chunk_size),
        },
    )
}

async fn presign_part<B>(
    state: &AppState,
    principal: &Principal,
    body: B,
) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let request: PartRequest = read_json(body, state.limits.max_json_body).await?;
    let transport = state
        .manager
        .request_part_transport(principal, &request.target(), request.part_number)
        .await?;
    json_response(StatusCode::OK, &transport)
}

/// Proxied transport: buffer one part, bounded by the proxy permit pool
async fn upload_part<B>(
    state: &AppState,
    principal: &Principal,
    parts: &Parts,
    body: B,
) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let request: PartRequest = decode_query(parts.uri.query())?;
    let declared = declared_length(&parts.headers, state.limits.max_part_size)?;

    let _permit = state
        .proxy_permits
        .acquire()
        .await
        .map_err(|_| DeckError::Internal("proxy permit pool closed".to_string()))?;
    let bytes = read_declared(body, declared).await?;

    let etag = state
        .manager
        .upload_part(principal, &request.target(), request.part_number, bytes)
        .await?;
    json_response(StatusCode::OK, &EtagResponse { etag })
}

async fn record_part<B>(
    state: &AppState,
    principal: &Principal,
    body: B,
) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let request: RecordPartRequest = read_json(body, state.limits.max_json_body).await?;
    state.manager.record_part_completion(
        principal,
        &request.target(),
        request.part_number,
        &request.etag,
    )?;
    json_response(StatusCode::OK, &SuccessResponse::ok())
}

async fn complete<B>(
    state: &AppState,
    principal: &Principal,
    body: B,
) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let request: CompleteRequest = read_json(body, state.limits.max_json_body).await?;
    let parts = request.completed_parts()?;
    state
        .manager
        .complete_with_parts(principal, &request.target(), &parts, request.part_count)
        .await?;
    json_response(StatusCode::OK, &SuccessResponse::ok())
}

async fn abort<B>(
    state: &AppState,
    principal: &Principal,
    body: B,
) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let request: UploadRef = read_json(body, state.limits.max_json_body).await?;
    state.manager.abort(principal, &request.target()).await?;
    json_response(StatusCode::OK, &SuccessResponse::ok())
}

/// Single-request write for sources that skip multipart
async fn put_object<B>(
    state: &AppState,
    principal: &Principal,
    parts: &Parts,
    body: B,
) -> Result<Response<ResponseBody>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let query: ObjectQuery = decode_query(parts.uri.query())?;
    let declared = declared_length(&parts.headers, state.limits.max_part_size)?;
    let bucket = state.engine().bucket(&query.bucket_id, principal)?;

    let _permit = state
        .proxy_permits
        .acquire()
        .await
        .map_err(|_| DeckError::Internal("proxy permit pool closed".to_string()))?;
    let bytes = read_declared(body, declared).await?;

    bucket.put(&query.key, bytes).await?;
    json_response(StatusCode::OK, &SuccessResponse::ok())
}

/// Parse `Content-Length`, enforcing `limit`
fn declared_length(headers: &HeaderMap, limit: u64) -> Result<u64, ApiError> {
    let value = headers.get(CONTENT_LENGTH).ok_or(ApiError::LengthRequired)?;
    let size: u64 = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| DeckError::InvalidInput("malformed Content-Length".to_string()))?;
    if size > limit {
        return Err(ApiError::PayloadTooLarge { size, limit });
    }
    Ok(size)
}

/// Collect a body of at most `limit` bytes
async fn collect_limited<B>(body: B, limit: u64) -> Result<Bytes, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut buffer = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ApiError::Body(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            let size = (buffer.len() + data.len()) as u64;
            if size > limit {
                return Err(ApiError::PayloadTooLarge { size, limit });
            }
            buffer.extend_from_slice(&data);
        }
    }
    Ok(buffer.freeze())
}

/// Collect an object stream of at most `limit` bytes
async fn collect_stream(mut body: ByteStream, limit: u64) -> Result<Bytes, ApiError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.try_next().await.map_err(DeckError::from)? {
        let size = (buffer.len() + chunk.len()) as u64;
        if size > limit {
            return Err(DeckError::InvalidInput(format!(
                "object exceeds the {} byte thumbnail source limit",
                limit
            ))
            .into());
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Collect a body that must match its declared length exactly
async fn read_declared<B>(body: B, declared: u64) -> Result<Bytes, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let bytes = collect_limited(body, declared).await?;
    if bytes.len() as u64 != declared {
        warn!(declared, received = bytes.len(), "body shorter than Content-Length");
        return Err(ApiError::Body(format!(
            "expected {} bytes, received {}",
            declared,
            bytes.len()
        )));
    }
    Ok(bytes)
}

async fn read_json<B, T>(body: B, limit: usize) -> Result<T, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
    T: serde::de::DeserializeOwned,
{
    let bytes = collect_limited(body, limit as u64).await?;
    Ok(decode_json(&bytes)?)
}

fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<ResponseBody>, ApiError> {
    let body = serde_json::to_vec(value).map_err(DeckError::from)?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(SERVER, SERVER_HEADER)
        .body(full(body))
        .map_err(|e| ApiError::Deck(DeckError::Internal(e.to_string())))
}

fn error_response(err: &ApiError) -> Response<ResponseBody> {
    let body = serde_json::to_vec(&err.body()).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(full(body));
    *response.status_mut() = err.status();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(SERVER, HeaderValue::from_static(SERVER_HEADER));
    response
}

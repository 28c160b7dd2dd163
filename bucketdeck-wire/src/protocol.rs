//! Routes and JSON bodies of the HTTP API

use bucketdeck_core::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Service name reported by the health endpoint
pub const SERVICE_NAME: &str = "bucketdeck";

/// API version reported by the health endpoint
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Route paths
pub mod routes {
    pub const HEALTH: &str = "/health";
    pub const BUCKETS: &str = "/api/buckets";
    pub const BUCKET: &str = "/api/bucket";
    pub const UPLOAD_INIT: &str = "/api/upload/init";
    pub const PRESIGN_PART: &str = "/api/upload/presign-part";
    pub const UPLOAD_PART: &str = "/api/upload/upload-part";
    pub const RECORD_PART: &str = "/api/upload/record-part";
    pub const COMPLETE: &str = "/api/upload/complete";
    pub const ABORT: &str = "/api/upload/abort";
    pub const PUT_OBJECT: &str = "/api/upload/object";

    pub fn bucket(id: &str) -> String {
        format!("{}/{}", BUCKET, id)
    }

    pub fn download(id: &str) -> String {
        format!("{}/{}/download", BUCKET, id)
    }

    pub fn thumbnail(id: &str) -> String {
        format!("{}/{}/thumbnail", BUCKET, id)
    }
}

/// A resolved API endpoint. Bucket ids are left raw for the handler to validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    ListBuckets,
    Browse { bucket: String },
    Delete { bucket: String },
    Download { bucket: String },
    Thumbnail { bucket: String },
    UploadInit,
    PresignPart,
    UploadPart,
    RecordPart,
    Complete,
    Abort,
    PutObject,
}

impl Route {
    /// Match a request line; `None` for unknown paths or methods
    pub fn resolve(method: &str, path: &str) -> Option<Route> {
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };

        let route = match (method, path) {
            ("GET", routes::HEALTH) => Route::Health,
            ("GET", routes::BUCKETS) => Route::ListBuckets,
            ("POST", routes::UPLOAD_INIT) => Route::UploadInit,
            ("POST", routes::PRESIGN_PART) => Route::PresignPart,
            ("POST", routes::UPLOAD_PART) => Route::UploadPart,
            ("POST", routes::RECORD_PART) => Route::RecordPart,
            ("POST", routes::COMPLETE) => Route::Complete,
            ("POST", routes::ABORT) => Route::Abort,
            ("PUT", routes::PUT_OBJECT) => Route::PutObject,
            _ => {
                let rest = path.strip_prefix(routes::BUCKET)?.strip_prefix('/')?;
                let segments: Vec<&str> = rest.split('/').collect();
                match (method, segments.as_slice()) {
                    ("GET", [bucket]) => Route::Browse { bucket: bucket.to_string() },
                    ("DELETE", [bucket]) => Route::Delete { bucket: bucket.to_string() },
                    ("GET", [bucket, "download"]) => Route::Download { bucket: bucket.to_string() },
                    ("GET", [bucket, "thumbnail"]) => Route::Thumbnail { bucket: bucket.to_string() },
                    _ => return None,
                }
            }
        };
        Some(route)
    }

    /// Whether the route needs a session token
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Route::Health)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        HealthResponse {
            status: "healthy".to_string(),
            version: API_VERSION.to_string(),
            service: SERVICE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketsResponse {
    pub total: usize,
    pub items: Vec<BucketSummary>,
}

impl From<Vec<BucketSummary>> for BucketsResponse {
    fn from(items: Vec<BucketSummary>) -> Self {
        BucketsResponse {
            total: items.len(),
            items,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseQuery {
    #[serde(default)]
    pub prefix: String,
}

/// Entry of a folder listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ListItem {
    Folder {
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    File {
        key: String,
        size: u64,
        last_modified: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub items: Vec<ListItem>,
}

impl From<Listing> for ListResponse {
    /// Folders first, then files, each in store order
    fn from(listing: Listing) -> Self {
        let folders = listing
            .common_prefixes
            .into_iter()
            .map(|key| ListItem::Folder { key });
        let files = listing.objects.into_iter().map(|object| ListItem::File {
            key: object.key,
            size: object.size,
            last_modified: object.last_modified,
        });
        ListResponse {
            items: folders.chain(files).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadQuery {
    pub key: Key,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub file_key: Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        SuccessResponse { success: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub bucket_id: BucketId,
    pub key: Key,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: UploadId,
    pub mode: TransportMode,
    /// Part size the server expects; older servers omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// Addresses an open upload; also the abort body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRef {
    pub bucket_id: BucketId,
    pub key: Key,
    pub upload_id: UploadId,
}

impl UploadRef {
    pub fn target(&self) -> UploadTarget {
        UploadTarget::new(self.bucket_id.clone(), self.key.clone(), self.upload_id.clone())
    }
}

impl From<&UploadTarget> for UploadRef {
    fn from(target: &UploadTarget) -> Self {
        UploadRef {
            bucket_id: target.bucket.clone(),
            key: target.key.clone(),
            upload_id: target.upload_id.clone(),
        }
    }
}

/// Presign body and upload-part query string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRequest {
    pub bucket_id: BucketId,
    pub key: Key,
    pub upload_id: UploadId,
    pub part_number: PartNumber,
}

impl PartRequest {
    pub fn new(target: &UploadTarget, part_number: PartNumber) -> Self {
        PartRequest {
            bucket_id: target.bucket.clone(),
            key: target.key.clone(),
            upload_id: target.upload_id.clone(),
            part_number,
        }
    }

    pub fn target(&self) -> UploadTarget {
        UploadTarget::new(self.bucket_id.clone(), self.key.clone(), self.upload_id.clone())
    }
}

/// Completion token reported after a direct part upload.
///
/// The token stays a plain string so an empty one is reported as an invalid
/// part rather than a malformed body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPartRequest {
    pub bucket_id: BucketId,
    pub key: Key,
    pub upload_id: UploadId,
    pub part_number: PartNumber,
    pub etag: String,
}

impl RecordPartRequest {
    pub fn target(&self) -> UploadTarget {
        UploadTarget::new(self.bucket_id.clone(), self.key.clone(), self.upload_id.clone())
    }
}

/// Entry of a completion part list, ETag still raw like in [`RecordPartRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: PartNumber,
    #[serde(rename = "ETag")]
    pub etag: String,
}

impl From<&CompletedPart> for ReportedPart {
    fn from(part: &CompletedPart) -> Self {
        ReportedPart {
            part_number: part.part_number,
            etag: part.etag.as_str().to_string(),
        }
    }
}

impl ReportedPart {
    pub fn parse(&self) -> Result<CompletedPart> {
        let etag = ETag::parse(self.part_number.get(), &self.etag)?;
        Ok(CompletedPart::new(self.part_number, etag))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub bucket_id: BucketId,
    pub key: Key,
    pub upload_id: UploadId,
    #[serde(default)]
    pub parts: Vec<ReportedPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_count: Option<u32>,
}

impl CompleteRequest {
    pub fn target(&self) -> UploadTarget {
        UploadTarget::new(self.bucket_id.clone(), self.key.clone(), self.upload_id.clone())
    }

    /// Validated part list; an empty ETag fails as an invalid part
    pub fn completed_parts(&self) -> Result<Vec<CompletedPart>> {
        self.parts.iter().map(ReportedPart::parse).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtagResponse {
    pub etag: ETag,
}

/// Query string of a single-object write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectQuery {
    pub bucket_id: BucketId,
    pub key: Key,
}

/// Body of every error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
}

impl From<&DeckError> for ErrorBody {
    fn from(err: &DeckError) -> Self {
        ErrorBody {
            error: err.to_string(),
            code: err.code(),
        }
    }
}

/// HTTP status for an error code
pub fn status_for(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::InvalidInput | ErrorCode::InvalidPart => 400,
        ErrorCode::Unauthenticated => 401,
        ErrorCode::Forbidden => 403,
        ErrorCode::BucketNotFound | ErrorCode::NotFound | ErrorCode::UnknownSession => 404,
        ErrorCode::PartConflict | ErrorCode::IncompletePartSet | ErrorCode::InvalidState => 409,
        ErrorCode::TransportExpired => 410,
        ErrorCode::StoreUnavailable => 503,
        ErrorCode::Cancelled | ErrorCode::Config | ErrorCode::Internal => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_resolution() {
        assert_eq!(Route::resolve("GET", "/health"), Some(Route::Health));
        assert_eq!(Route::resolve("GET", "/api/buckets/"), Some(Route::ListBuckets));
        assert_eq!(
            Route::resolve("GET", "/api/bucket/media"),
            Some(Route::Browse { bucket: "media".to_string() })
        );
        assert_eq!(
            Route::resolve("DELETE", "/api/bucket/media"),
            Some(Route::Delete { bucket: "media".to_string() })
        );
        assert_eq!(
            Route::resolve("GET", "/api/bucket/media/download"),
            Some(Route::Download { bucket: "media".to_string() })
        );
        assert_eq!(Route::resolve("PUT", "/api/upload/object"), Some(Route::PutObject));
        assert_eq!(Route::resolve("GET", "/api/upload/init"), None);
        assert_eq!(
            Route::resolve("GET", "/api/bucket/media/thumbnail"),
            Some(Route::Thumbnail { bucket: "media".to_string() })
        );
        assert_eq!(Route::resolve("POST", "/api/bucket/media/thumbnail"), None);
        assert_eq!(Route::resolve("GET", "/api/bucket"), None);
        assert!(!Route::Health.requires_auth());
        assert!(Route::Complete.requires_auth());
    }

    #[test]
    fn test_listing_puts_folders_first() {
        let listing = Listing {
            common_prefixes: vec!["docs/2024/".to_string()],
            objects: vec![ObjectInfo {
                key: "docs/a.txt".to_string(),
                size: 12,
                last_modified: None,
                etag: None,
            }],
        };
        let json = serde_json::to_value(ListResponse::from(listing)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"items": [
                {"type": "folder", "key": "docs/2024/"},
                {"type": "file", "key": "docs/a.txt", "size": 12, "lastModified": null}
            ]})
        );
    }

    #[test]
    fn test_complete_request_shape() {
        let request: CompleteRequest = serde_json::from_str(
            r#"{"bucketId":"media","key":"a.bin","uploadId":"u1",
                "parts":[{"PartNumber":2,"ETag":"\"b\""},{"PartNumber":1,"ETag":"a"}]}"#,
        )
        .unwrap();
        let parts = request.completed_parts().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].etag.as_str(), "b");
        assert_eq!(request.part_count, None);
        assert_eq!(request.target().upload_id.as_str(), "u1");
    }

    #[test]
    fn test_empty_completion_etag_is_an_invalid_part() {
        let request: CompleteRequest = serde_json::from_str(
            r#"{"bucketId":"media","key":"a.bin","uploadId":"u1",
                "parts":[{"PartNumber":1,"ETag":"a"},{"PartNumber":2,"ETag":"\"\""}]}"#,
        )
        .unwrap();
        let err = request.completed_parts().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPart);
        assert!(matches!(err, DeckError::InvalidPart { part_number: 2, .. }));
    }

    #[test]
    fn test_init_response_chunk_size_is_optional() {
        let old: InitUploadResponse =
            serde_json::from_str(r#"{"uploadId":"u1","mode":"proxied"}"#).unwrap();
        assert_eq!(old.chunk_size, None);

        let json = serde_json::to_value(InitUploadResponse {
            upload_id: UploadId::new("u1").unwrap(),
            mode: TransportMode::Direct,
            chunk_size: Some(5 * 1024 * 1024),
        })
        .unwrap();
        assert_eq!(json["chunkSize"], 5 * 1024 * 1024);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::PartConflict), 409);
        assert_eq!(status_for(ErrorCode::IncompletePartSet), 409);
        assert_eq!(status_for(ErrorCode::TransportExpired), 410);
        assert_eq!(status_for(ErrorCode::UnknownSession), 404);
        assert_eq!(status_for(ErrorCode::StoreUnavailable), 503);
        assert_eq!(status_for(ErrorCode::InvalidPart), 400);
    }

    #[test]
    fn test_error_body_keeps_retryability() {
        let body = ErrorBody::from(&DeckError::TransportExpired { part_number: 3 });
        let json = serde_json::to_string(&body).unwrap();
        let back: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, ErrorCode::TransportExpired);
        assert!(back.code.is_retryable());
    }
}

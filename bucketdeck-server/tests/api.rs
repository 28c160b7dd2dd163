//! HTTP API tests driven through the request handler with in-memory stores

use bucketdeck_core::*;
use bucketdeck_engine::{Engine, MemoryStore};
use bucketdeck_server::*;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{HeaderMap, Request, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const REGISTRY: &str = r#"{
    "buckets": [
        {"id": "media", "provider": "minio", "bucket": "acme-media", "group": "media",
         "accessKeyId": "k1", "secretAccessKey": "media-secret"},
        {"id": "vault", "bucket": "acme-vault", "group": "media",
         "accessKeyId": "k2", "secretAccessKey": "vault-secret", "transport": "direct"},
        {"id": "finance", "bucket": "acme-finance", "group": "finance",
         "accessKeyId": "k3", "secretAccessKey": "finance-secret"}
    ]
}"#;

struct Harness {
    state: Arc<AppState>,
    stores: HashMap<BucketId, Arc<MemoryStore>>,
    verifier: SessionVerifier,
    token: String,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn code(&self) -> String {
        self.json()["code"].as_str().unwrap_or_default().to_string()
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_limits(BodyLimits::default())
    }

    fn with_limits(limits: BodyLimits) -> Self {
        let registry = BucketRegistry::from_json(REGISTRY).unwrap();
        let (engine, stores) = Engine::in_memory(registry);
        let verifier = SessionVerifier::new(b"api-test-secret").unwrap();
        let state = Arc::new(AppState::new(engine, verifier.clone(), UploadConfig::default(), limits));
        let token = verifier
            .issue(&Principal::new("alice", vec!["media".to_string()]), Duration::from_secs(3600))
            .unwrap();
        Harness {
            state,
            stores,
            verifier,
            token,
        }
    }

    fn store(&self, bucket: &str) -> &MemoryStore {
        &self.stores[&BucketId::new(bucket).unwrap()]
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Reply {
        let response = handle_request(request, self.state.clone()).await;
        let (parts, body) = response.into_parts();
        Reply {
            status: parts.status,
            headers: parts.headers,
            body: body.collect().await.unwrap().to_bytes(),
        }
    }

    async fn get(&self, uri: &str) -> Reply {
        let request = Request::get(uri)
            .header("authorization", format!("Bearer {}", self.token))
            .body(Full::new(Bytes::new()))
            .unwrap();
        self.send(request).await
    }

    async fn post(&self, uri: &str, body: Value) -> Reply {
        self.json_request("POST", uri, body).await
    }

    async fn json_request(&self, method: &str, uri: &str, body: Value) -> Reply {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", self.token))
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        self.send(request).await
    }

    async fn raw(&self, method: &str, uri: &str, data: &'static [u8], declare_length: bool) -> Reply {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", self.token));
        if declare_length {
            builder = builder.header("content-length", data.len());
        }
        self.send(builder.body(Full::new(Bytes::from_static(data))).unwrap()).await
    }

    async fn init(&self, bucket: &str, key: &str) -> String {
        let reply = self
            .post("/api/upload/init", json!({"bucketId": bucket, "key": key}))
            .await;
        assert_eq!(reply.status, StatusCode::OK);
        reply.json()["uploadId"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn health_needs_no_token() {
    let h = Harness::new();
    let reply = h
        .send(Request::get("/health").body(Full::new(Bytes::new())).unwrap())
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["service"], "bucketdeck");
    assert_eq!(reply.json()["status"], "healthy");
}

#[tokio::test]
async fn api_requires_valid_token() {
    let h = Harness::new();

    let anonymous = h
        .send(Request::get("/api/buckets").body(Full::new(Bytes::new())).unwrap())
        .await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
    assert_eq!(anonymous.code(), "Unauthenticated");

    let forged = SessionVerifier::new(b"other-secret")
        .unwrap()
        .issue(&Principal::new("mallory", vec!["admin".to_string()]), Duration::from_secs(60))
        .unwrap();
    let reply = h
        .send(
            Request::get("/api/buckets")
                .header("authorization", format!("Bearer {}", forged))
                .body(Full::new(Bytes::new()))
                .unwrap(),
        )
        .await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bucket_list_is_filtered_and_redacted() {
    let h = Harness::new();
    let reply = h.get("/api/buckets").await;
    assert_eq!(reply.status, StatusCode::OK);

    let body = reply.json();
    assert_eq!(body["total"], 2);
    assert_eq!(body["items"][0]["id"], "media");
    assert_eq!(body["items"][0]["provider"], "minio");
    assert_eq!(body["items"][1]["mode"], "direct");
    assert!(!String::from_utf8_lossy(&reply.body).contains("secret"));

    let admin = h
        .verifier
        .issue(&Principal::new("root", vec!["admin".to_string()]), Duration::from_secs(60))
        .unwrap();
    let reply = h
        .send(
            Request::get("/api/buckets")
                .header("authorization", format!("Bearer {}", admin))
                .body(Full::new(Bytes::new()))
                .unwrap(),
        )
        .await;
    assert_eq!(reply.json()["total"], 3);
}

#[tokio::test]
async fn browse_lists_one_folder_level() {
    let h = Harness::new();
    h.store("media").insert("docs/", "");
    h.store("media").insert("docs/a.txt", "hello");
    h.store("media").insert("docs/2024/b.txt", "b");

    let reply = h.get("/api/bucket/media?prefix=docs%2F").await;
    assert_eq!(reply.status, StatusCode::OK);
    let items = reply.json()["items"].clone();
    assert_eq!(items.as_array().unwrap().len(), 2);
    assert_eq!(items[0], json!({"type": "folder", "key": "docs/2024/"}));
    assert_eq!(items[1]["type"], "file");
    assert_eq!(items[1]["key"], "docs/a.txt");
    assert_eq!(items[1]["size"], 5);

    assert_eq!(h.get("/api/bucket/finance").await.status, StatusCode::FORBIDDEN);
    let missing = h.get("/api/bucket/nowhere").await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.code(), "BucketNotFound");
}

#[tokio::test]
async fn proxied_upload_end_to_end() {
    let h = Harness::new();
    let upload_id = h.init("media", "clips/take1.mov").await;

    let mut parts = Vec::new();
    for (n, data) in [(1u32, &b"first-"[..]), (2, &b"second-"[..]), (3, &b"third"[..])] {
        let uri = format!(
            "/api/upload/upload-part?bucketId=media&key=clips%2Ftake1.mov&uploadId={}&partNumber={}",
            upload_id, n
        );
        let request = Request::post(uri)
            .header("authorization", format!("Bearer {}", h.token))
            .header("content-length", data.len())
            .body(Full::new(Bytes::copy_from_slice(data)))
            .unwrap();
        let reply = h.send(request).await;
        assert_eq!(reply.status, StatusCode::OK, "{:?}", reply.body);
        parts.push(json!({"PartNumber": n, "ETag": reply.json()["etag"]}));
    }
    parts.reverse();

    let reply = h
        .post(
            "/api/upload/complete",
            json!({"bucketId": "media", "key": "clips/take1.mov", "uploadId": upload_id, "parts": parts}),
        )
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), json!({"success": true}));
    assert_eq!(
        h.store("media").object("clips/take1.mov").unwrap(),
        Bytes::from_static(b"first-second-third")
    );
}

#[tokio::test]
async fn proxied_part_requires_declared_length_within_limit() {
    let h = Harness::with_limits(BodyLimits {
        max_part_size: 8,
        ..BodyLimits::default()
    });
    let upload_id = h.init("media", "a.bin").await;
    let uri = format!(
        "/api/upload/upload-part?bucketId=media&key=a.bin&uploadId={}&partNumber=1",
        upload_id
    );

    let reply = h.raw("POST", &uri, b"1234", false).await;
    assert_eq!(reply.status, StatusCode::LENGTH_REQUIRED);

    let reply = h.raw("POST", &uri, b"0123456789", true).await;
    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);

    let reply = h.raw("POST", &uri, b"01234567", true).await;
    assert_eq!(reply.status, StatusCode::OK);
}

#[tokio::test]
async fn completion_errors_map_to_conflict() {
    let h = Harness::new();
    let upload_id = h.init("media", "partial.bin").await;
    let target = json!({"bucketId": "media", "key": "partial.bin", "uploadId": upload_id});

    let record = |part: u32, etag: &str| {
        let mut body = target.clone();
        body["partNumber"] = json!(part);
        body["etag"] = json!(etag);
        body
    };

    assert_eq!(h.post("/api/upload/record-part", record(1, "aaa")).await.status, StatusCode::OK);
    assert_eq!(h.post("/api/upload/record-part", record(1, "aaa")).await.status, StatusCode::OK);

    let conflict = h.post("/api/upload/record-part", record(1, "bbb")).await;
    assert_eq!(conflict.status, StatusCode::CONFLICT);
    assert_eq!(conflict.code(), "PartConflict");

    let empty = h.post("/api/upload/record-part", record(2, "\"\"")).await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);
    assert_eq!(empty.code(), "InvalidPart");

    let mut complete = target.clone();
    complete["partCount"] = json!(2);
    let reply = h.post("/api/upload/complete", complete).await;
    assert_eq!(reply.status, StatusCode::CONFLICT);
    assert_eq!(reply.code(), "IncompletePartSet");

    // Same code for an empty token inside the completion list
    let mut complete = target.clone();
    complete["parts"] = json!([{"PartNumber": 1, "ETag": "aaa"}, {"PartNumber": 2, "ETag": ""}]);
    let reply = h.post("/api/upload/complete", complete).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.code(), "InvalidPart");
}

#[tokio::test]
async fn init_advertises_chunk_size() {
    let h = Harness::new();
    let reply = h
        .post("/api/upload/init", json!({"bucketId": "media", "key": "a.bin"}))
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["chunkSize"], DEFAULT_CHUNK_SIZE);
    assert_eq!(reply.json()["mode"], "proxied");
}

#[tokio::test]
async fn direct_upload_presigns_and_records() {
    let h = Harness::new();
    let upload_id = h.init("vault", "disk.img").await;
    let target = json!({"bucketId": "vault", "key": "disk.img", "uploadId": upload_id});

    let mut presign = target.clone();
    presign["partNumber"] = json!(1);
    let reply = h.post("/api/upload/presign-part", presign).await;
    assert_eq!(reply.status, StatusCode::OK);
    let transport = reply.json();
    assert_eq!(transport["mode"], "direct");
    assert!(transport["expiresAt"].is_string());

    let etag = h
        .store("vault")
        .put_presigned(transport["url"].as_str().unwrap(), Bytes::from_static(b"image"))
        .unwrap();

    let mut record = target.clone();
    record["partNumber"] = json!(1);
    record["etag"] = json!(etag);
    assert_eq!(h.post("/api/upload/record-part", record).await.status, StatusCode::OK);

    let mut complete = target.clone();
    complete["partCount"] = json!(1);
    assert_eq!(h.post("/api/upload/complete", complete).await.status, StatusCode::OK);
    assert_eq!(h.store("vault").object("disk.img").unwrap(), Bytes::from_static(b"image"));
}

#[tokio::test]
async fn abort_and_unknown_sessions() {
    let h = Harness::new();
    let upload_id = h.init("media", "dropped.bin").await;
    let target = json!({"bucketId": "media", "key": "dropped.bin", "uploadId": upload_id});

    assert_eq!(h.post("/api/upload/abort", target.clone()).await.status, StatusCode::OK);
    assert_eq!(h.store("media").open_uploads(), 0);

    let again = h.post("/api/upload/abort", target).await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
    assert_eq!(again.code(), "UnknownSession");
}

#[tokio::test]
async fn download_sets_attachment_headers() {
    let h = Harness::new();
    h.store("media").insert("reports/Q1 summary.pdf", "pdf-bytes");

    let reply = h
        .get("/api/bucket/media/download?key=reports%2FQ1%20summary.pdf")
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, Bytes::from_static(b"pdf-bytes"));
    assert_eq!(reply.headers["cache-control"], "no-store");
    assert_eq!(
        reply.headers["content-disposition"],
        "attachment; filename=\"Q1 summary.pdf\"; filename*=UTF-8''Q1%20summary.pdf"
    );

    let missing = h.get("/api/bucket/media/download?key=nope.txt").await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.code(), "NotFound");

    let no_key = h.get("/api/bucket/media/download").await;
    assert_eq!(no_key.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_removes_object() {
    let h = Harness::new();
    h.store("media").insert("old.txt", "x");

    let reply = h
        .json_request("DELETE", "/api/bucket/media", json!({"fileKey": "old.txt"}))
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(h.store("media").object("old.txt").is_none());

    let reply = h
        .json_request("DELETE", "/api/bucket/media", json!({"fileKey": "old.txt"}))
        .await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_object_is_written_in_one_request() {
    let h = Harness::new();
    let reply = h
        .raw("PUT", "/api/upload/object?bucketId=media&key=empty.txt", b"", true)
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(h.store("media").object("empty.txt").unwrap().len(), 0);
    assert_eq!(h.store("media").open_uploads(), 0);
}

#[tokio::test]
async fn unknown_routes_and_store_outages() {
    let h = Harness::new();
    assert_eq!(h.get("/api/nothing").await.status, StatusCode::NOT_FOUND);

    h.store("media").set_unavailable(true);
    let reply = h.get("/api/bucket/media").await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply.code(), "StoreUnavailable");
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[tokio::test]
async fn thumbnail_shrinks_images_and_revalidates() {
    let h = Harness::new();
    h.store("media").insert("photos/beach.png", png(800, 600));

    let reply = h.get("/api/bucket/media/thumbnail?key=photos%2Fbeach.png").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["content-type"], "image/jpeg");
    assert_eq!(
        reply.headers["cache-control"],
        "public, max-age=86400, stale-while-revalidate=3600"
    );
    let thumb = image::load_from_memory(&reply.body).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (400, 300));

    let etag = reply.headers["etag"].to_str().unwrap().to_string();
    assert!(etag.starts_with('"') && etag.ends_with('"'));

    let request = Request::get("/api/bucket/media/thumbnail?key=photos%2Fbeach.png")
        .header("authorization", format!("Bearer {}", h.token))
        .header("if-none-match", etag.as_str())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let cached = h.send(request).await;
    assert_eq!(cached.status, StatusCode::NOT_MODIFIED);
    assert!(cached.body.is_empty());
    assert_eq!(cached.headers["etag"], etag.as_str());

    let request = Request::get("/api/bucket/media/thumbnail?key=photos%2Fbeach.png")
        .header("authorization", format!("Bearer {}", h.token))
        .header("if-none-match", "\"stale\"")
        .body(Full::new(Bytes::new()))
        .unwrap();
    assert_eq!(h.send(request).await.status, StatusCode::OK);
}

#[tokio::test]
async fn thumbnail_errors() {
    let h = Harness::new();
    h.store("media").insert("notes.txt", "not an image");

    let missing = h.get("/api/bucket/media/thumbnail?key=photos%2Fnone.png").await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.code(), "NotFound");

    let text = h.get("/api/bucket/media/thumbnail?key=notes.txt").await;
    assert_eq!(text.status, StatusCode::BAD_REQUEST);

    assert_eq!(h.get("/api/bucket/media/thumbnail").await.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        h.get("/api/bucket/finance/thumbnail?key=a.png").await.status,
        StatusCode::FORBIDDEN
    );

    let anonymous = h
        .send(
            Request::get("/api/bucket/media/thumbnail?key=notes.txt")
                .body(Full::new(Bytes::new()))
                .unwrap(),
        )
        .await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);
}

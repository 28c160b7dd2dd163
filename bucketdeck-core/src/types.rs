//! Core data types for bucketdeck

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeckError, Result};

/// Highest part number the S3 multipart protocol accepts
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Longest object key S3 accepts, in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Identifier of a configured bucket (not the store-side bucket name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BucketId(String);

impl BucketId {
    /// Create a new bucket ID with validation
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(DeckError::InvalidBucketName("empty name".to_string()));
        }

        // Alphanumeric, hyphens, underscores and dots only
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(DeckError::InvalidBucketName(format!(
                "invalid characters in '{}'",
                name
            )));
        }

        Ok(BucketId(name.to_string()))
    }

    /// Get the bucket id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BucketId {
    type Error = DeckError;

    fn try_from(value: String) -> Result<Self> {
        BucketId::new(&value)
    }
}

impl From<BucketId> for String {
    fn from(id: BucketId) -> Self {
        id.0
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object key within a bucket
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    /// Create a new key with validation
    pub fn new(key: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(DeckError::InvalidKey("empty key".to_string()));
        }

        if key.len() > MAX_KEY_LEN {
            return Err(DeckError::InvalidKey(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(DeckError::InvalidKey(
                "control characters not allowed".to_string(),
            ));
        }

        Ok(Key(key.to_string()))
    }

    /// Join an optional folder prefix and a file name the way the browser does
    pub fn in_folder(prefix: &str, name: &str) -> Result<Self> {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            Key::new(name)
        } else {
            Key::new(&format!("{}/{}", prefix, name))
        }
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, used as the download file name
    pub fn file_name(&self) -> &str {
        self.0
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("file")
    }
}

impl TryFrom<String> for Key {
    type Error = DeckError;

    fn try_from(value: String) -> Result<Self> {
        Key::new(&value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned multipart upload identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UploadId(String);

impl UploadId {
    pub fn new(id: &str) -> Result<Self> {
        if id.trim().is_empty() {
            return Err(DeckError::InvalidInput("empty upload id".to_string()));
        }
        Ok(UploadId(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UploadId {
    type Error = DeckError;

    fn try_from(value: String) -> Result<Self> {
        UploadId::new(&value)
    }
}

impl From<UploadId> for String {
    fn from(id: UploadId) -> Self {
        id.0
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based part number, bounded by the multipart protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PartNumber(u32);

impl PartNumber {
    pub fn new(number: u32) -> Result<Self> {
        if number == 0 || number > MAX_PART_NUMBER {
            return Err(DeckError::InvalidInput(format!(
                "part number {} outside 1..={}",
                number, MAX_PART_NUMBER
            )));
        }
        Ok(PartNumber(number))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for PartNumber {
    type Error = DeckError;

    fn try_from(value: u32) -> Result<Self> {
        PartNumber::new(value)
    }
}

impl From<PartNumber> for u32 {
    fn from(part: PartNumber) -> Self {
        part.0
    }
}

impl std::fmt::Display for PartNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-issued completion token for one part, without quoting
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ETag(String);

impl ETag {
    /// Normalize a raw ETag as returned by the store.
    ///
    /// Stores return ETags wrapped in double quotes; every quote is removed.
    /// An empty token is rejected because the part could never be finalized.
    pub fn parse(part_number: u32, raw: &str) -> Result<Self> {
        let token: String = raw.trim().chars().filter(|c| *c != '"').collect();
        if token.is_empty() {
            return Err(DeckError::InvalidPart {
                part_number,
                reason: "empty completion token".to_string(),
            });
        }
        Ok(ETag(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted form as sent back to the store on completion
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl TryFrom<String> for ETag {
    type Error = DeckError;

    fn try_from(value: String) -> Result<Self> {
        // Part number is unknown at this level; callers re-parse with it
        ETag::parse(0, &value)
    }
}

impl From<ETag> for String {
    fn from(etag: ETag) -> Self {
        etag.0
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A finished part as listed in the completion call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: PartNumber,
    #[serde(rename = "ETag")]
    pub etag: ETag,
}

impl CompletedPart {
    pub fn new(part_number: PartNumber, etag: ETag) -> Self {
        CompletedPart { part_number, etag }
    }
}

/// Everything that addresses one open multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadTarget {
    pub bucket: BucketId,
    pub key: Key,
    pub upload_id: UploadId,
}

impl UploadTarget {
    pub fn new(bucket: BucketId, key: Key, upload_id: UploadId) -> Self {
        UploadTarget {
            bucket,
            key,
            upload_id,
        }
    }
}

impl std::fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.bucket, self.key, self.upload_id)
    }
}

/// How part bytes reach the store for a given bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Bytes flow through the server
    #[default]
    Proxied,
    /// Bytes go straight to the store through a presigned URL
    Direct,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Proxied => write!(f, "proxied"),
            TransportMode::Direct => write!(f, "direct"),
        }
    }
}

/// Transport handed out for a single part upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PartTransport {
    Proxied,
    Direct {
        url: String,
        #[serde(rename = "expiresAt")]
        expires_at: DateTime<Utc>,
    },
}

impl PartTransport {
    pub fn mode(&self) -> TransportMode {
        match self {
            PartTransport::Proxied => TransportMode::Proxied,
            PartTransport::Direct { .. } => TransportMode::Direct,
        }
    }

    /// Whether a direct URL has passed its window at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            PartTransport::Proxied => false,
            PartTransport::Direct { expires_at, .. } => now >= *expires_at,
        }
    }
}

/// Lifecycle of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Completing,
    Completed,
    Aborting,
    Aborted,
    Failed,
}

impl SessionState {
    /// Terminal sessions are dropped from the registry
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Open => "open",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Aborting => "aborting",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// An object as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// One level of a delimited listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub common_prefixes: Vec<String>,
    pub objects: Vec<ObjectInfo>,
}

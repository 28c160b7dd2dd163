//! Bucket and upload configuration
//!
//! The bucket registry is parsed and validated once at startup. Handlers look
//! buckets up through [`BucketRegistry::resolve`], which also applies group
//! authorization.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::auth::authorize;
use crate::chunking::{DEFAULT_CHUNK_SIZE, MIN_PART_SIZE};
use crate::{BucketId, DeckError, Result, TransportMode};

/// Group that may access every bucket unless configured otherwise
pub const DEFAULT_ADMIN_GROUP: &str = "admin";

/// Presigned part URLs are valid for one hour
pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(3600);

/// Connection and access settings for one S3-compatible bucket
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    pub id: BucketId,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Store-side bucket name
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    /// Group whose members may use this bucket
    pub group: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub transport: TransportMode,
}

fn default_provider() -> String {
    "s3".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl std::fmt::Debug for BucketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketConfig")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .field("group", &self.group)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("transport", &self.transport)
            .finish()
    }
}

impl BucketConfig {
    /// Check the fields the store client cannot do without
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("bucket", &self.bucket),
            ("region", &self.region),
            ("group", &self.group),
            ("accessKeyId", &self.access_key_id),
            ("secretAccessKey", &self.secret_access_key),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(DeckError::Config(format!(
                    "bucket '{}': {} must not be empty",
                    self.id, field
                )));
            }
        }

        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(DeckError::Config(format!(
                    "bucket '{}': endpoint '{}' must be an http(s) URL",
                    self.id, endpoint
                )));
            }
        }

        Ok(())
    }

    /// Public view, safe to hand to callers
    pub fn summary(&self) -> BucketSummary {
        BucketSummary {
            id: self.id.clone(),
            provider: self.provider.clone(),
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            mode: self.transport,
        }
    }
}

/// Bucket description without credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub id: BucketId,
    pub provider: String,
    pub bucket: String,
    pub region: String,
    pub mode: TransportMode,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryFile {
    #[serde(default = "default_admin_group")]
    admin_group: String,
    buckets: Vec<BucketConfig>,
}

fn default_admin_group() -> String {
    DEFAULT_ADMIN_GROUP.to_string()
}

/// Validated set of configured buckets
#[derive(Debug, Clone)]
pub struct BucketRegistry {
    admin_group: String,
    buckets: Vec<BucketConfig>,
    index: HashMap<BucketId, usize>,
}

impl BucketRegistry {
    pub fn new(admin_group: impl Into<String>, buckets: Vec<BucketConfig>) -> Result<Self> {
        let admin_group = admin_group.into();
        if admin_group.trim().is_empty() {
            return Err(DeckError::Config("adminGroup must not be empty".to_string()));
        }

        let mut index = HashMap::with_capacity(buckets.len());
        for (position, bucket) in buckets.iter().enumerate() {
            bucket.validate()?;
            if index.insert(bucket.id.clone(), position).is_some() {
                return Err(DeckError::Config(format!(
                    "duplicate bucket id '{}'",
                    bucket.id
                )));
            }
        }

        Ok(BucketRegistry {
            admin_group,
            buckets,
            index,
        })
    }

    /// Parse a registry document
    pub fn from_json(document: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(document)
            .map_err(|e| DeckError::Config(format!("invalid bucket registry: {}", e)))?;
        Self::new(file.admin_group, file.buckets)
    }

    /// Load a registry file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|e| {
            DeckError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&document)
    }

    pub fn admin_group(&self) -> &str {
        &self.admin_group
    }

    pub fn get(&self, id: &BucketId) -> Option<&BucketConfig> {
        self.index.get(id).map(|&position| &self.buckets[position])
    }

    /// Look a bucket up on behalf of a caller holding `groups`
    pub fn resolve(&self, id: &BucketId, groups: &[String]) -> Result<&BucketConfig> {
        let bucket = self
            .get(id)
            .ok_or_else(|| DeckError::BucketNotFound(id.to_string()))?;

        if !authorize(groups, bucket, &self.admin_group) {
            return Err(DeckError::Forbidden(id.to_string()));
        }

        Ok(bucket)
    }

    /// Buckets a caller may see, in configuration order
    pub fn visible_to(&self, groups: &[String]) -> Vec<&BucketConfig> {
        self.buckets
            .iter()
            .filter(|bucket| authorize(groups, bucket, &self.admin_group))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BucketConfig> {
        self.buckets.iter()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Tunables of the upload pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadConfig {
    /// Nominal part size; the last part may be shorter
    pub chunk_size: u64,
    /// Part uploads in flight per file
    pub concurrency: usize,
    /// Retries of a transient part failure before the upload is aborted
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff
    pub retry_backoff: Duration,
    /// Lifetime of a presigned part URL
    pub presign_expiry: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 4,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            presign_expiry: DEFAULT_PRESIGN_EXPIRY,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_PART_SIZE {
            return Err(DeckError::Config(format!(
                "chunk size {} is below the store minimum of {} bytes",
                self.chunk_size, MIN_PART_SIZE
            )));
        }
        if self.concurrency == 0 {
            return Err(DeckError::Config("concurrency must be at least 1".to_string()));
        }
        if self.presign_expiry.is_zero() {
            return Err(DeckError::Config("presign expiry must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"{
        "buckets": [
            {
                "id": "media",
                "bucket": "acme-media",
                "region": "eu-west-1",
                "group": "media-team",
                "accessKeyId": "AKIAEXAMPLE",
                "secretAccessKey": "shh",
                "transport": "direct"
            },
            {
                "id": "backups",
                "provider": "minio",
                "bucket": "backups",
                "endpoint": "http://127.0.0.1:9000",
                "forcePathStyle": true,
                "group": "ops",
                "accessKeyId": "minio",
                "secretAccessKey": "minio123"
            }
        ]
    }"#;

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|g| g.to_string()).collect()
    }

    #[test]
    fn test_registry_parses_defaults() {
        let registry = BucketRegistry::from_json(REGISTRY).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.admin_group(), DEFAULT_ADMIN_GROUP);

        let backups = registry.get(&BucketId::new("backups").unwrap()).unwrap();
        assert!(backups.force_path_style);
        assert_eq!(backups.region, "us-east-1");
        assert_eq!(backups.transport, TransportMode::Proxied);

        let media = registry.get(&BucketId::new("media").unwrap()).unwrap();
        assert_eq!(media.provider, "s3");
        assert_eq!(media.transport, TransportMode::Direct);
    }

    #[test]
    fn test_resolve_distinguishes_missing_and_forbidden() {
        let registry = BucketRegistry::from_json(REGISTRY).unwrap();
        let media = BucketId::new("media").unwrap();

        assert!(registry.resolve(&media, &groups(&["media-team"])).is_ok());
        assert!(registry.resolve(&media, &groups(&["admin"])).is_ok());
        assert!(matches!(
            registry.resolve(&media, &groups(&["ops"])),
            Err(DeckError::Forbidden(_))
        ));
        assert!(matches!(
            registry.resolve(&BucketId::new("nope").unwrap(), &groups(&["admin"])),
            Err(DeckError::BucketNotFound(_))
        ));
    }

    #[test]
    fn test_visible_to_filters_by_group() {
        let registry = BucketRegistry::from_json(REGISTRY).unwrap();
        let visible: Vec<_> = registry
            .visible_to(&groups(&["ops"]))
            .into_iter()
            .map(|b| b.id.as_str().to_string())
            .collect();
        assert_eq!(visible, vec!["backups"]);
        assert_eq!(registry.visible_to(&groups(&["admin"])).len(), 2);
        assert!(registry.visible_to(&[]).is_empty());
    }

    #[test]
    fn test_rejects_duplicates_and_missing_credentials() {
        let bucket: BucketConfig = serde_json::from_str(
            r#"{"id":"a","bucket":"a","group":"g","accessKeyId":"k","secretAccessKey":"s"}"#,
        )
        .unwrap();
        assert!(BucketRegistry::new("admin", vec![bucket.clone(), bucket.clone()]).is_err());

        let mut no_secret = bucket;
        no_secret.secret_access_key = String::new();
        assert!(matches!(
            BucketRegistry::new("admin", vec![no_secret]),
            Err(DeckError::Config(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let registry = BucketRegistry::from_json(REGISTRY).unwrap();
        let rendered = format!("{:?}", registry);
        assert!(!rendered.contains("minio123"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buckets.json");
        std::fs::write(&path, REGISTRY).unwrap();
        assert_eq!(BucketRegistry::load(&path).unwrap().len(), 2);
        assert!(BucketRegistry::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_upload_config_validation() {
        assert!(UploadConfig::default().validate().is_ok());
        let tiny = UploadConfig {
            chunk_size: 1024,
            ..UploadConfig::default()
        };
        assert!(tiny.validate().is_err());
        let idle = UploadConfig {
            concurrency: 0,
            ..UploadConfig::default()
        };
        assert!(idle.validate().is_err());
    }
}

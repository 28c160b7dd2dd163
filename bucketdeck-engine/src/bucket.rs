//! Authorized handle to one configured bucket

use bucketdeck_core::*;
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

use crate::gateway::{ObjectBody, ObjectStore};

/// Bucket handle returned after authorization
#[derive(Clone)]
pub struct Bucket {
    config: Arc<BucketConfig>,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("config", &self.config).finish()
    }
}

impl Bucket {
    pub(crate) fn new(config: Arc<BucketConfig>, store: Arc<dyn ObjectStore>) -> Self {
        Bucket { config, store }
    }

    pub fn id(&self) -> &BucketId {
        &self.config.id
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.config.transport
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// One folder level under `prefix`, split on `/`
    pub async fn list(&self, prefix: &str) -> Result<Listing> {
        Ok(self.store.list(prefix, Some("/")).await?)
    }

    pub async fn get(&self, key: &Key) -> Result<ObjectBody> {
        Ok(self.store.get(key).await?)
    }

    /// Single-request write; only used for sources too small for multipart
    pub async fn put(&self, key: &Key, body: Bytes) -> Result<()> {
        let size = body.len();
        self.store.put(key, body).await?;
        info!(target: "bucketdeck::audit", bucket = %self.id(), key = %key, size, "object written");
        Ok(())
    }

    pub async fn delete(&self, key: &Key) -> Result<()> {
        self.store.delete(key).await?;
        info!(target: "bucketdeck::audit", bucket = %self.id(), key = %key, "object deleted");
        Ok(())
    }
}

//! Object store access and upload session management

use bucketdeck_core::*;
use std::collections::HashMap;
use std::sync::Arc;

pub mod bucket;
pub mod gateway;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod s3;
pub mod session;

pub use bucket::*;
pub use gateway::*;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::*;
pub use s3::*;
pub use session::*;

/// Bucket registry plus one store connection per configured bucket
#[derive(Clone)]
pub struct Engine {
    registry: Arc<BucketRegistry>,
    buckets: Arc<HashMap<BucketId, (Arc<BucketConfig>, Arc<dyn ObjectStore>)>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("buckets", &self.registry.len())
            .field("admin_group", &self.registry.admin_group())
            .finish()
    }
}

impl Engine {
    /// Connect every configured bucket to its S3-compatible endpoint
    pub fn connect(registry: BucketRegistry) -> Self {
        let stores = registry
            .iter()
            .map(|config| {
                let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(config));
                (config.id.clone(), store)
            })
            .collect();
        Self::assemble(registry, stores)
    }

    /// Use caller-provided stores; every configured bucket needs one
    pub fn with_stores(
        registry: BucketRegistry,
        mut stores: HashMap<BucketId, Arc<dyn ObjectStore>>,
    ) -> Result<Self> {
        if let Some(missing) = registry.iter().find(|config| !stores.contains_key(&config.id)) {
            return Err(DeckError::Config(format!("no store for bucket '{}'", missing.id)));
        }
        stores.retain(|id, _| registry.get(id).is_some());
        Ok(Self::assemble(registry, stores))
    }

    fn assemble(registry: BucketRegistry, mut stores: HashMap<BucketId, Arc<dyn ObjectStore>>) -> Self {
        let buckets = registry
            .iter()
            .filter_map(|config| {
                let store = stores.remove(&config.id)?;
                Some((config.id.clone(), (Arc::new(config.clone()), store)))
            })
            .collect();
        Engine {
            registry: Arc::new(registry),
            buckets: Arc::new(buckets),
        }
    }

    /// Engine whose buckets all live in memory
    #[cfg(any(test, feature = "test-utils"))]
    pub fn in_memory(registry: BucketRegistry) -> (Self, HashMap<BucketId, Arc<MemoryStore>>) {
        let memory: HashMap<BucketId, Arc<MemoryStore>> = registry
            .iter()
            .map(|config| (config.id.clone(), Arc::new(MemoryStore::new())))
            .collect();
        let stores = memory
            .iter()
            .map(|(id, store)| (id.clone(), store.clone() as Arc<dyn ObjectStore>))
            .collect();
        (Self::assemble(registry, stores), memory)
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.registry
    }

    /// Bucket handle for `principal`, or `BucketNotFound` / `Forbidden`
    pub fn bucket(&self, id: &BucketId, principal: &Principal) -> Result<Bucket> {
        self.registry.resolve(id, &principal.groups)?;
        let (config, store) = self
            .buckets
            .get(id)
            .ok_or_else(|| DeckError::BucketNotFound(id.to_string()))?;
        Ok(Bucket::new(config.clone(), store.clone()))
    }

    /// Buckets `principal` may see, without credentials
    pub fn buckets_for(&self, principal: &Principal) -> Vec<BucketSummary> {
        self.registry
            .visible_to(&principal.groups)
            .into_iter()
            .map(BucketConfig::summary)
            .collect()
    }
}

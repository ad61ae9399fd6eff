use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{PipelineError, PipelineResult};
use crate::registry::Registry;
use crate::storage::LocalFileStorage;

/// Durable home of registry documents, one per site.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load(&self, site_id: &str) -> PipelineResult<Option<Registry>>;
    /// Persists the whole document at once.
    async fn save(&self, registry: &Registry) -> PipelineResult<()>;
    async fn delete(&self, site_id: &str) -> PipelineResult<()>;
}

/// `{registry_dir}/{site_id}.json`.
#[derive(Clone, Debug)]
pub struct FileRegistryStore {
    storage: LocalFileStorage,
}

impl FileRegistryStore {
    pub fn new(storage: LocalFileStorage) -> Self {
        Self { storage }
    }

    fn key(site_id: &str) -> String {
        format!("{site_id}.json")
    }
}

#[async_trait]
impl RegistryStore for FileRegistryStore {
    async fn load(&self, site_id: &str) -> PipelineResult<Option<Registry>> {
        let Some(bytes) = self.storage.get(&Self::key(site_id)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| PipelineError::StorageCorruption {
                detail: format!("registry for {site_id} is unreadable: {err}"),
            })
    }

    async fn save(&self, registry: &Registry) -> PipelineResult<()> {
        let payload = serde_json::to_vec_pretty(registry)?;
        self.storage
            .put_atomic(&Self::key(&registry.site_id), &payload)
            .await?;
        Ok(())
    }

    async fn delete(&self, site_id: &str) -> PipelineResult<()> {
        self.storage.delete(&Self::key(site_id)).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRegistryStore {
    documents: RwLock<HashMap<String, Registry>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn load(&self, site_id: &str) -> PipelineResult<Option<Registry>> {
        Ok(self.documents.read().get(site_id).cloned())
    }

    async fn save(&self, registry: &Registry) -> PipelineResult<()> {
        self.documents
            .write()
            .insert(registry.site_id.clone(), registry.clone());
        Ok(())
    }

    async fn delete(&self, site_id: &str) -> PipelineResult<()> {
        self.documents.write().remove(site_id);
        Ok(())
    }
}

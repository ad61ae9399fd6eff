//! Per-site image registry: which originals exist, which derivatives were
//! rendered from them, and which content files reference them.
//!
//! Orphan detection is a linear scan over this index rather than a walk of the
//! site's content tree. Writes for one site are serialized through a per-site
//! lock so concurrent `get -> mutate -> save` cycles cannot drop each other's
//! changes.

pub mod model;
pub mod store;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
pub use model::{
    ImageMetadata, MetadataUpdate, OrphanReport, OrphanedOriginal, REGISTRY_VERSION, Registry,
    RegistryEntry, UsageStats,
};
pub use store::{FileRegistryStore, MemoryRegistryStore, RegistryStore};

#[derive(Clone)]
pub struct ImageRegistry {
    store: Arc<dyn RegistryStore>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ImageRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// The stored registry, or an empty one when the site has none yet.
    pub async fn get(&self, site_id: &str) -> PipelineResult<Registry> {
        Ok(self
            .store
            .load(site_id)
            .await?
            .unwrap_or_else(|| Registry::empty(site_id)))
    }

    pub async fn save(&self, registry: &Registry) -> PipelineResult<()> {
        let lock = self.site_lock(&registry.site_id);
        let _held = lock.lock().await;
        self.store.save(registry).await
    }

    /// Serialized read-modify-write of one site's registry. The document is only
    /// saved when `mutate` succeeds.
    pub async fn update<T, F>(&self, site_id: &str, mutate: F) -> PipelineResult<T>
    where
        F: FnOnce(&mut Registry) -> PipelineResult<T>,
    {
        let lock = self.site_lock(site_id);
        let _held = lock.lock().await;
        let mut registry = self.get(site_id).await?;
        let result = mutate(&mut registry)?;
        registry.touch();
        self.store.save(&registry).await?;
        Ok(result)
    }

    /// Registers an upload. Re-uploading an existing path refreshes its metadata
    /// and keeps references and derivatives.
    pub async fn add_image(
        &self,
        site_id: &str,
        path: &str,
        metadata: ImageMetadata,
    ) -> PipelineResult<()> {
        self.update(site_id, |registry| {
            let now = Utc::now();
            match registry.images.get_mut(path) {
                Some(entry) => {
                    entry.size_bytes = metadata.size_bytes;
                    entry.width = metadata.width;
                    entry.height = metadata.height;
                    if metadata.alt.is_some() {
                        entry.alt = metadata.alt;
                    }
                    entry.last_accessed = now;
                }
                None => {
                    registry
                        .images
                        .insert(path.to_string(), RegistryEntry::new(metadata, now));
                }
            }
            Ok(())
        })
        .await?;
        info!(site_id, path, "registered original");
        Ok(())
    }

    pub async fn update_metadata(
        &self,
        site_id: &str,
        path: &str,
        update: MetadataUpdate,
    ) -> PipelineResult<()> {
        self.update(site_id, |registry| {
            let entry = registry
                .images
                .get_mut(path)
                .ok_or_else(|| PipelineError::entry_not_found(path))?;
            entry.apply(update);
            Ok(())
        })
        .await
    }

    /// Links a derivative to its original. Re-adding a known key is a no-op.
    pub async fn add_derivative(
        &self,
        site_id: &str,
        original_path: &str,
        derivative_key: &str,
    ) -> PipelineResult<()> {
        let current = self.get(site_id).await?;
        match current.images.get(original_path) {
            None => return Err(PipelineError::entry_not_found(original_path)),
            Some(entry) if entry.derivative_paths.contains(derivative_key) => return Ok(()),
            Some(_) => {}
        }
        self.update(site_id, |registry| {
            let entry = registry
                .images
                .get_mut(original_path)
                .ok_or_else(|| PipelineError::entry_not_found(original_path))?;
            entry.derivative_paths.insert(derivative_key.to_string());
            entry.last_accessed = Utc::now();
            Ok(())
        })
        .await
    }

    pub async fn remove_derivative(
        &self,
        site_id: &str,
        original_path: &str,
        derivative_key: &str,
    ) -> PipelineResult<bool> {
        self.update(site_id, |registry| {
            Ok(registry
                .images
                .get_mut(original_path)
                .map(|entry| entry.derivative_paths.remove(derivative_key))
                .unwrap_or(false))
        })
        .await
    }

    /// Replaces the set of images `content_file` references. Dropped references
    /// are only noticed when that file is saved again.
    pub async fn update_references(
        &self,
        site_id: &str,
        content_file: &str,
        image_paths: &[String],
    ) -> PipelineResult<Vec<String>> {
        let unknown = self
            .update(site_id, |registry| {
                Ok(registry.set_references(content_file, image_paths))
            })
            .await?;
        if !unknown.is_empty() {
            debug!(site_id, content_file, ?unknown, "references to unregistered images");
        }
        Ok(unknown)
    }

    pub async fn remove_image(&self, site_id: &str, path: &str) -> PipelineResult<Option<RegistryEntry>> {
        self.update(site_id, |registry| Ok(registry.images.remove(path)))
            .await
    }

    /// Removes several entries in one write. Returns how many existed.
    pub async fn remove_images(&self, site_id: &str, paths: &[String]) -> PipelineResult<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        self.update(site_id, |registry| {
            Ok(paths
                .iter()
                .filter(|path| registry.images.remove(path.as_str()).is_some())
                .count())
        })
        .await
    }

    pub async fn get_orphaned(&self, site_id: &str) -> PipelineResult<OrphanReport> {
        Ok(self.get(site_id).await?.orphans())
    }

    pub async fn get_usage_stats(&self, site_id: &str) -> PipelineResult<UsageStats> {
        Ok(self.get(site_id).await?.usage_stats())
    }

    pub async fn clear_site(&self, site_id: &str) -> PipelineResult<()> {
        let lock = self.site_lock(site_id);
        let _held = lock.lock().await;
        self.store.delete(site_id).await
    }

    fn site_lock(&self, site_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(site_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ImageRegistry {
        ImageRegistry::new(Arc::new(MemoryRegistryStore::new()))
    }

    fn meta(size_bytes: u64) -> ImageMetadata {
        ImageMetadata { size_bytes, ..Default::default() }
    }

    #[tokio::test]
    async fn missing_registry_is_empty_not_error() {
        let registry = registry().get("nobody").await.unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.version, REGISTRY_VERSION);
    }

    #[tokio::test]
    async fn update_metadata_requires_entry() {
        let registry = registry();
        let err = registry
            .update_metadata("s", "assets/x.png", MetadataUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RegistryEntryNotFound { .. }));

        registry.add_image("s", "assets/x.png", meta(5)).await.unwrap();
        registry
            .update_metadata(
                "s",
                "assets/x.png",
                MetadataUpdate { alt: Some("cat".into()), width: Some(9), ..Default::default() },
            )
            .await
            .unwrap();
        let entry = registry.get("s").await.unwrap().images["assets/x.png"].clone();
        assert_eq!(entry.alt.as_deref(), Some("cat"));
        assert_eq!(entry.width, Some(9));
        assert_eq!(entry.size_bytes, 5);
    }

    #[tokio::test]
    async fn add_derivative_is_idempotent() {
        let registry = registry();
        registry.add_image("s", "assets/x.png", meta(5)).await.unwrap();
        for _ in 0..3 {
            registry
                .add_derivative("s", "assets/x.png", "s/assets/derivatives/x_w1_hauto_c-fill_g-center.png")
                .await
                .unwrap();
        }
        let entry = registry.get("s").await.unwrap().images["assets/x.png"].clone();
        assert_eq!(entry.derivative_paths.len(), 1);
        assert!(registry.add_derivative("s", "assets/none.png", "k").await.is_err());
    }

    #[tokio::test]
    async fn orphan_round_trip_through_references() {
        let registry = registry();
        registry.add_image("s", "assets/x.png", meta(5)).await.unwrap();
        assert_eq!(registry.get_orphaned("s").await.unwrap().orphaned_originals.len(), 1);

        registry
            .update_references("s", "posts/a.md", &["assets/x.png".to_string()])
            .await
            .unwrap();
        assert!(registry.get_orphaned("s").await.unwrap().orphaned_originals.is_empty());

        registry.update_references("s", "posts/a.md", &[]).await.unwrap();
        assert_eq!(registry.get_orphaned("s").await.unwrap().orphaned_originals.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_keep_every_entry() {
        let registry = registry();
        let mut handles = Vec::new();
        for i in 0..20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .add_image("s", &format!("assets/img{i}.png"), meta(i))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.get("s").await.unwrap().images.len(), 20);
    }

    #[tokio::test]
    async fn remove_images_counts_existing_entries() {
        let registry = registry();
        registry.add_image("s", "assets/a.png", meta(1)).await.unwrap();
        registry.add_image("s", "assets/b.png", meta(1)).await.unwrap();
        let removed = registry
            .remove_images("s", &["assets/a.png".into(), "assets/zzz.png".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(registry.remove_image("s", "assets/b.png").await.unwrap().is_some());
        assert!(registry.get("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn usage_stats_then_clear_site() {
        let registry = registry();
        registry.add_image("s", "assets/originals/a.png", meta(4)).await.unwrap();
        registry.add_image("s", "assets/originals/b.png", meta(6)).await.unwrap();
        registry
            .update_references("s", "index.md", &["assets/originals/a.png".to_string()])
            .await
            .unwrap();
        let stats = registry.get_usage_stats("s").await.unwrap();
        assert_eq!(stats.total_images, 2);
        assert_eq!(stats.referenced_images, 1);
        assert_eq!(stats.orphaned_bytes, 6);

        registry.clear_site("s").await.unwrap();
        assert!(registry.get("s").await.unwrap().is_empty());
    }
}

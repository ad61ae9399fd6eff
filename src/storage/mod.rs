//! Original-image blob storage.
//!
//! The blob store is authoritative for original bytes. Everything else in the
//! pipeline (derivatives, registry) can be rebuilt from it.

pub mod local;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{PipelineError, PipelineResult};
pub use local::{LocalFileStorage, StoredObject};

pub const ORIGINALS_PREFIX: &str = "assets/originals";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "avif"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetInfo {
    pub path: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_asset(&self, site_id: &str, path: &str) -> PipelineResult<Option<Bytes>>;

    async fn save_asset(&self, site_id: &str, path: &str, blob: Bytes) -> PipelineResult<()>;

    /// Returns `false` when the asset did not exist.
    async fn delete_asset(&self, site_id: &str, path: &str) -> PipelineResult<bool>;

    async fn list_assets(&self, site_id: &str) -> PipelineResult<Vec<AssetInfo>>;

    /// Where the asset can be fetched directly, if the backend serves it.
    fn public_url(&self, _site_id: &str, _path: &str) -> Option<String> {
        None
    }

    async fn get_all_assets(&self, site_id: &str) -> PipelineResult<BTreeMap<String, Bytes>> {
        let mut assets = BTreeMap::new();
        for info in self.list_assets(site_id).await? {
            if let Some(blob) = self.get_asset(site_id, &info.path).await? {
                assets.insert(info.path, blob);
            }
        }
        Ok(assets)
    }

    async fn save_all_assets(
        &self,
        site_id: &str,
        assets: BTreeMap<String, Bytes>,
    ) -> PipelineResult<()> {
        for (path, blob) in assets {
            self.save_asset(site_id, &path, blob).await?;
        }
        Ok(())
    }
}

pub fn is_image_path(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Originals on disk, one directory per site.
#[derive(Clone, Debug)]
pub struct FileBlobStore {
    storage: LocalFileStorage,
}

impl FileBlobStore {
    pub fn new(storage: LocalFileStorage) -> Self {
        Self { storage }
    }

    fn key(site_id: &str, path: &str) -> String {
        format!("{site_id}/{}", path.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn get_asset(&self, site_id: &str, path: &str) -> PipelineResult<Option<Bytes>> {
        let bytes = self.storage.get(&Self::key(site_id, path)).await?;
        Ok(bytes.map(Bytes::from))
    }

    async fn save_asset(&self, site_id: &str, path: &str, blob: Bytes) -> PipelineResult<()> {
        self.storage.put(&Self::key(site_id, path), &blob).await?;
        Ok(())
    }

    async fn delete_asset(&self, site_id: &str, path: &str) -> PipelineResult<bool> {
        Ok(self.storage.delete(&Self::key(site_id, path)).await?)
    }

    fn public_url(&self, site_id: &str, path: &str) -> Option<String> {
        Some(self.storage.get_public_url(&Self::key(site_id, path)))
    }

    async fn list_assets(&self, site_id: &str) -> PipelineResult<Vec<AssetInfo>> {
        let site_prefix = format!("{site_id}/");
        let objects = self.storage.list(site_id).await?;
        Ok(objects
            .into_iter()
            .filter_map(|object| {
                object.key.strip_prefix(&site_prefix).map(|path| AssetInfo {
                    path: path.to_string(),
                    size_bytes: object.size,
                })
            })
            .collect())
    }
}

/// In-process blob store, used by tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryBlobStore {
    sites: RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get_asset(&self, site_id: &str, path: &str) -> PipelineResult<Option<Bytes>> {
        Ok(self
            .sites
            .read()
            .get(site_id)
            .and_then(|assets| assets.get(path).cloned()))
    }

    async fn save_asset(&self, site_id: &str, path: &str, blob: Bytes) -> PipelineResult<()> {
        if path.is_empty() {
            return Err(PipelineError::Storage("empty asset path".into()));
        }
        self.sites
            .write()
            .entry(site_id.to_string())
            .or_default()
            .insert(path.to_string(), blob);
        Ok(())
    }

    async fn delete_asset(&self, site_id: &str, path: &str) -> PipelineResult<bool> {
        Ok(self
            .sites
            .write()
            .get_mut(site_id)
            .map(|assets| assets.remove(path).is_some())
            .unwrap_or(false))
    }

    async fn list_assets(&self, site_id: &str) -> PipelineResult<Vec<AssetInfo>> {
        Ok(self
            .sites
            .read()
            .get(site_id)
            .map(|assets| {
                assets
                    .iter()
                    .map(|(path, blob)| AssetInfo {
                        path: path.clone(),
                        size_bytes: blob.len() as u64,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_image_extensions() {
        assert!(is_image_path("assets/originals/a.JPG"));
        assert!(is_image_path("assets/originals/b.webp"));
        assert!(!is_image_path("assets/data.json"));
        assert!(!is_image_path("assets/noext"));
    }

    #[tokio::test]
    async fn file_store_lists_site_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(LocalFileStorage::new(
            dir.path().to_path_buf(),
            "http://localhost/originals".into(),
        ));
        store
            .save_asset("site", "assets/originals/a.png", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        store
            .save_asset("site-extended", "assets/originals/b.png", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let listed = store.list_assets("site").await.unwrap();
        assert_eq!(
            listed,
            vec![AssetInfo { path: "assets/originals/a.png".into(), size_bytes: 3 }]
        );
        assert_eq!(
            store.public_url("site", "assets/originals/a.png").as_deref(),
            Some("http://localhost/originals/site/assets/originals/a.png")
        );
        let all = store.get_all_assets("site").await.unwrap();
        assert_eq!(all.get("assets/originals/a.png").map(|b| b.len()), Some(3));
        assert!(store.delete_asset("site", "assets/originals/a.png").await.unwrap());
        assert!(store.list_assets("site").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_round_trips_asset_map() {
        let store = MemoryBlobStore::new();
        let mut assets = BTreeMap::new();
        assets.insert("assets/originals/a.png".to_string(), Bytes::from_static(b"1"));
        assets.insert("assets/originals/b.png".to_string(), Bytes::from_static(b"22"));
        store.save_all_assets("s", assets.clone()).await.unwrap();
        assert_eq!(store.get_all_assets("s").await.unwrap(), assets);
        assert!(!store.delete_asset("s", "missing.png").await.unwrap());
    }
}

//! Registry bootstrap and reconciliation.
//!
//! When a site has no registry (first run, lost document) it is rebuilt from
//! the originals in the blob store plus a scan of the site's content. Original
//! creation times are not recoverable, so rebuilt entries are stamped "now".

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::content::{ReferenceScanner, SiteData};
use crate::error::PipelineResult;
use crate::registry::{ImageMetadata, ImageRegistry, Registry, RegistryEntry};
use crate::storage::{AssetInfo, BlobStore, is_image_path};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub references_updated: Vec<String>,
    /// Image paths referenced by content that have no stored original.
    pub missing_originals: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.references_updated.is_empty()
            && self.missing_originals.is_empty()
    }

    pub fn discrepancies(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.extend(self.added.iter().map(|p| format!("registered untracked original {p}")));
        lines.extend(self.removed.iter().map(|p| format!("dropped entry for missing original {p}")));
        lines.extend(
            self.references_updated
                .iter()
                .map(|p| format!("recomputed references of {p}")),
        );
        lines.extend(
            self.missing_originals
                .iter()
                .map(|p| format!("content references missing original {p}")),
        );
        lines
    }
}

#[derive(Clone)]
pub struct RegistryMigrator {
    blobs: Arc<dyn BlobStore>,
    registry: ImageRegistry,
    scanner: ReferenceScanner,
}

impl RegistryMigrator {
    pub fn new(blobs: Arc<dyn BlobStore>, registry: ImageRegistry, scanner: ReferenceScanner) -> Self {
        Self {
            blobs,
            registry,
            scanner,
        }
    }

    /// Returns the stored registry when it has entries, otherwise rebuilds it.
    pub async fn ensure_registry(&self, site: &SiteData) -> PipelineResult<Registry> {
        let existing = self.registry.get(&site.site_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        let assets = self.stored_originals(&site.site_id).await?;
        if assets.is_empty() {
            return Ok(existing);
        }
        let usage = site.usage_index(&self.scanner);
        let rebuilt = build_entries(&assets, &usage);
        let count = rebuilt.len();
        let registry = self
            .registry
            .update(&site.site_id, move |registry| {
                // Another caller may have rebuilt it while we were scanning.
                if registry.is_empty() {
                    registry.images = rebuilt;
                }
                Ok(registry.clone())
            })
            .await?;
        info!(site_id = %site.site_id, images = count, "rebuilt image registry");
        Ok(registry)
    }

    /// Reconciles the registry with storage and content, reporting every change.
    pub async fn validate_and_repair(&self, site: &SiteData) -> PipelineResult<RepairReport> {
        let assets = self.stored_originals(&site.site_id).await?;
        let usage = site.usage_index(&self.scanner);
        let stored: BTreeMap<&str, &AssetInfo> =
            assets.iter().map(|info| (info.path.as_str(), info)).collect();

        let report = self
            .registry
            .update(&site.site_id, |registry| {
                let mut report = RepairReport::default();
                let now = Utc::now();

                registry.images.retain(|path, _| {
                    let keep = stored.contains_key(path.as_str());
                    if !keep {
                        report.removed.push(path.clone());
                    }
                    keep
                });
                for (path, info) in &stored {
                    if !registry.images.contains_key(*path) {
                        let metadata = ImageMetadata {
                            size_bytes: info.size_bytes,
                            ..ImageMetadata::default()
                        };
                        registry
                            .images
                            .insert(path.to_string(), RegistryEntry::new(metadata, now));
                        report.added.push(path.to_string());
                    }
                }
                for (path, entry) in registry.images.iter_mut() {
                    let expected = usage.get(path).cloned().unwrap_or_default();
                    if entry.referenced_in != expected {
                        entry.referenced_in = expected;
                        report.references_updated.push(path.clone());
                    }
                }
                report.missing_originals = usage
                    .keys()
                    .filter(|path| !stored.contains_key(path.as_str()))
                    .cloned()
                    .collect();
                Ok(report)
            })
            .await?;

        for line in report.discrepancies() {
            warn!(site_id = %site.site_id, "{line}");
        }
        Ok(report)
    }

    async fn stored_originals(&self, site_id: &str) -> PipelineResult<Vec<AssetInfo>> {
        Ok(self
            .blobs
            .list_assets(site_id)
            .await?
            .into_iter()
            .filter(|info| is_image_path(&info.path))
            .collect())
    }
}

fn build_entries(
    assets: &[AssetInfo],
    usage: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeMap<String, RegistryEntry> {
    let now = Utc::now();
    assets
        .iter()
        .map(|info| {
            let mut entry = RegistryEntry::new(
                ImageMetadata {
                    size_bytes: info.size_bytes,
                    ..ImageMetadata::default()
                },
                now,
            );
            entry.referenced_in = usage.get(&info.path).cloned().unwrap_or_default();
            (info.path.clone(), entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentFile;
    use crate::registry::MemoryRegistryStore;
    use crate::storage::MemoryBlobStore;
    use bytes::Bytes;

    async fn fixture() -> (RegistryMigrator, ImageRegistry, Arc<MemoryBlobStore>, SiteData) {
        let blobs = Arc::new(MemoryBlobStore::new());
        for (path, size) in [("assets/originals/a.png", 3), ("assets/originals/b.png", 5), ("assets/originals/c.png", 7)] {
            blobs.save_asset("s", path, Bytes::from(vec![0u8; size])).await.unwrap();
        }
        blobs.save_asset("s", "assets/site.css", Bytes::from_static(b"body{}")).await.unwrap();
        let registry = ImageRegistry::new(Arc::new(MemoryRegistryStore::new()));
        let migrator = RegistryMigrator::new(blobs.clone(), registry.clone(), ReferenceScanner::default());
        let site = SiteData::new("s").with_content(ContentFile {
            path: "posts/one.md".into(),
            fields: serde_json::json!({ "cover": { "serviceId": "local", "src": "assets/originals/b.png" } }),
            body: "![a](assets/originals/a.png)".into(),
        });
        (migrator, registry, blobs, site)
    }

    #[tokio::test]
    async fn rebuilds_empty_registry_from_storage_and_content() {
        let (migrator, registry, _, site) = fixture().await;
        let rebuilt = migrator.ensure_registry(&site).await.unwrap();
        assert_eq!(rebuilt.images.len(), 3);
        assert!(rebuilt.images["assets/originals/a.png"].referenced_in.contains("posts/one.md"));
        assert!(rebuilt.images["assets/originals/b.png"].referenced_in.contains("posts/one.md"));
        assert!(rebuilt.images["assets/originals/c.png"].is_orphaned());
        assert_eq!(rebuilt.images["assets/originals/c.png"].size_bytes, 7);
        assert_eq!(registry.get("s").await.unwrap().images.len(), 3);
    }

    #[tokio::test]
    async fn non_empty_registry_is_returned_unchanged() {
        let (migrator, registry, _, site) = fixture().await;
        registry
            .add_image("s", "assets/originals/a.png", ImageMetadata { size_bytes: 99, ..Default::default() })
            .await
            .unwrap();
        let got = migrator.ensure_registry(&site).await.unwrap();
        assert_eq!(got.images.len(), 1);
        assert!(got.images["assets/originals/a.png"].is_orphaned());
    }

    #[tokio::test]
    async fn repair_reports_every_discrepancy() {
        let (migrator, registry, blobs, mut site) = fixture().await;
        migrator.ensure_registry(&site).await.unwrap();
        blobs.delete_asset("s", "assets/originals/c.png").await.unwrap();
        blobs
            .save_asset("s", "assets/originals/d.png", Bytes::from_static(b"d"))
            .await
            .unwrap();
        site.content_files[0].body = "![d](assets/originals/d.png) ![z](assets/originals/zzz.png)".into();

        let report = migrator.validate_and_repair(&site).await.unwrap();
        assert_eq!(report.removed, vec!["assets/originals/c.png"]);
        assert_eq!(report.added, vec!["assets/originals/d.png"]);
        assert_eq!(report.missing_originals, vec!["assets/originals/zzz.png"]);
        assert!(report.references_updated.contains(&"assets/originals/a.png".to_string()));
        assert!(report.references_updated.contains(&"assets/originals/d.png".to_string()));

        let stored = registry.get("s").await.unwrap();
        assert!(stored.images["assets/originals/a.png"].is_orphaned());
        assert!(!stored.images["assets/originals/d.png"].is_orphaned());

        let again = migrator.validate_and_repair(&site).await.unwrap();
        assert!(again.references_updated.is_empty());
        assert!(again.added.is_empty() && again.removed.is_empty());
    }
}

//! Orphan reclamation.
//!
//! Only things the registry proves unreferenced are deleted. If the registry
//! cannot be loaded or rebuilt the run drops into a safe mode that deletes
//! nothing. Each removal is isolated: one failed delete is logged and the rest
//! of the batch continues.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::{DerivativeCache, ParsedDerivative, parse_derivative_key};
use crate::content::SiteData;
use crate::error::{PipelineError, PipelineResult};
use crate::migration::RegistryMigrator;
use crate::registry::{ImageRegistry, OrphanedOriginal};
use crate::storage::{BlobStore, is_image_path};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub originals_removed: usize,
    pub derivatives_removed: usize,
    pub bytes_freed: u64,
    pub removed_originals: Vec<String>,
    /// Set when the registry was unusable and nothing was deleted.
    pub fallback_mode: bool,
    pub failures: Vec<String>,
    pub log: Vec<String>,
}

impl CleanupResult {
    /// The per-item failures as an error, if there were any.
    pub fn partial_failure(&self) -> Option<PipelineError> {
        (!self.failures.is_empty()).then(|| PipelineError::PartialCleanupFailure {
            failures: self.failures.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPreview {
    pub orphaned_originals: Vec<OrphanedOriginal>,
    pub orphaned_derivatives: Vec<String>,
    pub estimated_bytes: u64,
    pub fallback_mode: bool,
    pub log: Vec<String>,
}

struct Discovery {
    originals: Vec<OrphanedOriginal>,
    /// Registry-linked and cache-scanned keys, with whether the cache listed them.
    derivatives: BTreeMap<String, bool>,
}

#[derive(Clone)]
pub struct OrphanCleaner {
    blobs: Arc<dyn BlobStore>,
    cache: DerivativeCache,
    registry: ImageRegistry,
    migrator: RegistryMigrator,
    read_attempts: usize,
    runs: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl OrphanCleaner {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        cache: DerivativeCache,
        registry: ImageRegistry,
        migrator: RegistryMigrator,
        read_attempts: usize,
    ) -> Self {
        Self {
            blobs,
            cache,
            registry,
            migrator,
            read_attempts: read_attempts.max(1),
            runs: Arc::new(DashMap::new()),
        }
    }

    pub async fn cleanup(&self, site: &SiteData) -> CleanupResult {
        let site_id = site.site_id.as_str();
        let lock = self.run_lock(site_id);
        let _running = lock.lock().await;

        let mut result = CleanupResult::default();
        let discovery = match self.discover(site, &mut result.log).await {
            Ok(discovery) => discovery,
            Err(err) => {
                result.fallback_mode = true;
                self.fallback_report(site_id, &err, &mut result.log).await;
                return result;
            }
        };

        let mut unregister = Vec::with_capacity(discovery.originals.len());
        for orphan in &discovery.originals {
            match self.remove_original(site_id, &orphan.path).await {
                Ok(Some(size)) => {
                    result.bytes_freed += size;
                    result.originals_removed += 1;
                    result.removed_originals.push(orphan.path.clone());
                    result.log.push(format!("removed original {} ({size} bytes)", orphan.path));
                    unregister.push(orphan.path.clone());
                }
                Ok(None) => {
                    result.log.push(format!("original {} already gone", orphan.path));
                    unregister.push(orphan.path.clone());
                }
                Err(err) => {
                    warn!(site_id, path = %orphan.path, error = %err, "failed to remove orphaned original");
                    result.failures.push(format!("{}: {err}", orphan.path));
                }
            }
        }
        if let Err(err) = self.registry.remove_images(site_id, &unregister).await {
            warn!(site_id, error = %err, "failed to drop removed originals from registry");
            result
                .failures
                .push(format!("registry update after removal: {err}"));
        }

        for (key, listed) in &discovery.derivatives {
            match self.cache.try_remove(key).await {
                Ok(()) if *listed => {
                    result.derivatives_removed += 1;
                    result.log.push(format!("removed derivative {key}"));
                }
                Ok(()) => result.log.push(format!("derivative {key} already evicted")),
                Err(err) => result.failures.push(format!("{key}: {err}")),
            }
        }

        info!(
            site_id,
            originals = result.originals_removed,
            derivatives = result.derivatives_removed,
            bytes = result.bytes_freed,
            failures = result.failures.len(),
            "cleanup finished"
        );
        result
    }

    /// Same discovery as [`cleanup`](Self::cleanup) without touching storage.
    pub async fn preview(&self, site: &SiteData) -> CleanupPreview {
        let site_id = site.site_id.as_str();
        let mut preview = CleanupPreview::default();
        let discovery = match self.discover(site, &mut preview.log).await {
            Ok(discovery) => discovery,
            Err(err) => {
                preview.fallback_mode = true;
                self.fallback_report(site_id, &err, &mut preview.log).await;
                return preview;
            }
        };
        let sizes: BTreeMap<String, u64> = match self.blobs.list_assets(site_id).await {
            Ok(assets) => assets.into_iter().map(|a| (a.path, a.size_bytes)).collect(),
            Err(err) => {
                preview
                    .log
                    .push(format!("blob listing failed, using registry sizes: {err}"));
                BTreeMap::new()
            }
        };
        for orphan in discovery.originals {
            let size = sizes.get(&orphan.path).copied().unwrap_or(orphan.size_bytes);
            preview.estimated_bytes += size;
            preview.orphaned_originals.push(OrphanedOriginal {
                path: orphan.path,
                size_bytes: size,
            });
        }
        preview.orphaned_derivatives = discovery.derivatives.into_keys().collect();
        preview
    }

    async fn discover(&self, site: &SiteData, log: &mut Vec<String>) -> PipelineResult<Discovery> {
        let registry = retry(self.read_attempts, || self.migrator.ensure_registry(site)).await?;
        let report = registry.orphans();
        let live = registry.live_identities();
        log.push(format!(
            "registry has {} images, {} orphaned",
            registry.images.len(),
            report.orphaned_originals.len()
        ));

        let mut derivatives: BTreeMap<String, bool> = report
            .orphaned_derivatives
            .into_iter()
            .map(|key| (key, false))
            .collect();
        for key in self.cache.list_keys(&site.site_id).await {
            match parse_derivative_key(&key) {
                ParsedDerivative::Unrecognized { .. } => {
                    warn!(key, "unrecognized derivative name, treating as orphaned");
                    log.push(format!("unrecognized derivative {key}"));
                    derivatives.insert(key, true);
                }
                parsed if parsed.belongs_to(&live) => {
                    derivatives.remove(&key);
                }
                _ => {
                    derivatives.insert(key, true);
                }
            }
        }
        // Registry-linked keys that still resolve to a live original stay.
        derivatives.retain(|key, _| !parse_derivative_key(key).belongs_to(&live));

        Ok(Discovery {
            originals: report.orphaned_originals,
            derivatives,
        })
    }

    /// Deletes one original, returning the bytes it occupied, or `None` when
    /// storage no longer had it.
    async fn remove_original(&self, site_id: &str, path: &str) -> PipelineResult<Option<u64>> {
        let blob = retry(self.read_attempts, || self.blobs.get_asset(site_id, path)).await?;
        let size = blob.map(|b| b.len() as u64).unwrap_or(0);
        let deleted = retry(self.read_attempts, || self.blobs.delete_asset(site_id, path)).await?;
        Ok(deleted.then_some(size))
    }

    async fn fallback_report(&self, site_id: &str, err: &PipelineError, log: &mut Vec<String>) {
        warn!(site_id, error = %err, "registry unavailable, cleanup in safe mode");
        log.push(format!("registry unavailable ({err}); nothing removed"));
        match self.blobs.list_assets(site_id).await {
            Ok(assets) => {
                let originals = assets.iter().filter(|a| is_image_path(&a.path)).count();
                log.push(format!("{originals} stored originals"));
            }
            Err(err) => log.push(format!("stored originals unknown: {err}")),
        }
        let derivatives = self.cache.list_keys(site_id).await.len();
        log.push(format!("{derivatives} cached derivatives"));
    }

    fn run_lock(&self, site_id: &str) -> Arc<Mutex<()>> {
        self.runs
            .entry(site_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

/// Runs `op` up to `attempts` times, returning the first success or last error.
async fn retry<T, F, Fut>(attempts: usize, mut op: F) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(attempt, error = %err, "storage read failed");
                last = Some(err);
            }
        }
    }
    Err(last.unwrap_or(PipelineError::Interrupted))
}

//! One handle over every pipeline component, shared by the HTTP routes and
//! the MCP tools.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::cache::{CacheStore, DerivativeCache, FileCacheStore, MemoryCacheStore, TransformOptions};
use crate::cleanup::{CleanupPreview, CleanupResult, OrphanCleaner};
use crate::config::{AppConfig, CacheBackend, PipelineConfig};
use crate::content::{ReferenceScanner, SiteData, load_site_content};
use crate::error::{PipelineError, PipelineResult};
use crate::export::{AssetBundle, AssetBundler};
use crate::image_processing::{ImageResizer, RasterResizer};
use crate::manifest::{
    GenerateOptions, ImportOptions, ImportResult, MediaManifest, MediaManifestService, ValidationReport,
};
use crate::migration::{RegistryMigrator, RepairReport};
use crate::processor::DerivativeProcessor;
use crate::registry::{FileRegistryStore, ImageMetadata, ImageRegistry, MemoryRegistryStore, RegistryStore, UsageStats};
use crate::storage::{BlobStore, FileBlobStore, LocalFileStorage, MemoryBlobStore, ORIGINALS_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedOriginal {
    pub path: String,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Storage backends plus tunables; everything else is derived from these.
pub struct Backends {
    pub blobs: Arc<dyn BlobStore>,
    pub cache: Arc<dyn CacheStore>,
    pub registry: Arc<dyn RegistryStore>,
    pub resizer: Arc<dyn ImageResizer>,
    pub config: PipelineConfig,
    /// Root of the per-site content directories; `None` means sites have no
    /// content on disk.
    pub content_dir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct MediaPipeline {
    blobs: Arc<dyn BlobStore>,
    resizer: Arc<dyn ImageResizer>,
    registry: ImageRegistry,
    processor: DerivativeProcessor,
    migrator: RegistryMigrator,
    cleaner: OrphanCleaner,
    manifests: MediaManifestService,
    bundler: AssetBundler,
    content_dir: Option<PathBuf>,
}

impl MediaPipeline {
    pub fn new(backends: Backends) -> Self {
        let Backends {
            blobs,
            cache,
            registry,
            resizer,
            config,
            content_dir,
        } = backends;
        let cache = DerivativeCache::new(cache, &config);
        let registry = ImageRegistry::new(registry);
        let scanner = ReferenceScanner::new(config.scan_depth_limit);
        let migrator = RegistryMigrator::new(blobs.clone(), registry.clone(), scanner);
        let cleaner = OrphanCleaner::new(
            blobs.clone(),
            cache.clone(),
            registry.clone(),
            migrator.clone(),
            config.storage_read_attempts,
        );
        let manifests = MediaManifestService::new(registry.clone(), migrator.clone());
        let bundler = AssetBundler::new(blobs.clone(), cache.clone(), manifests.clone());
        let processor = DerivativeProcessor::new(blobs.clone(), cache, resizer.clone(), config)
            .with_registry(registry.clone());
        Self {
            blobs,
            resizer,
            registry,
            processor,
            migrator,
            cleaner,
            manifests,
            bundler,
            content_dir,
        }
    }

    /// File-backed pipeline rooted at the configured data directory.
    pub fn from_config(config: &AppConfig) -> Self {
        let originals = LocalFileStorage::new(config.originals_dir(), config.public_base_url.clone());
        let cache: Arc<dyn CacheStore> = match config.cache_backend {
            CacheBackend::File => Arc::new(FileCacheStore::new(LocalFileStorage::new(
                config.derivatives_dir(),
                String::new(),
            ))),
            CacheBackend::Memory => match config.cache_ttl {
                Some(ttl) => Arc::new(MemoryCacheStore::with_ttl(config.cache_capacity, ttl)),
                None => Arc::new(MemoryCacheStore::new(config.cache_capacity)),
            },
        };
        let registry = FileRegistryStore::new(LocalFileStorage::new(config.registry_dir(), String::new()));
        Self::new(Backends {
            blobs: Arc::new(FileBlobStore::new(originals)),
            cache,
            registry: Arc::new(registry),
            resizer: Arc::new(RasterResizer),
            config: config.pipeline.clone(),
            content_dir: Some(config.content_dir()),
        })
    }

    /// Everything in memory; content is supplied by callers as [`SiteData`].
    pub fn in_memory(config: PipelineConfig) -> Self {
        Self::new(Backends {
            blobs: Arc::new(MemoryBlobStore::new()),
            cache: Arc::new(MemoryCacheStore::default()),
            registry: Arc::new(MemoryRegistryStore::new()),
            resizer: Arc::new(RasterResizer),
            config,
            content_dir: None,
        })
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn registry(&self) -> &ImageRegistry {
        &self.registry
    }

    pub fn processor(&self) -> &DerivativeProcessor {
        &self.processor
    }

    pub fn cache(&self) -> &DerivativeCache {
        self.processor.cache()
    }

    pub async fn load_site(&self, site_id: &str) -> PipelineResult<SiteData> {
        match &self.content_dir {
            Some(dir) => load_site_content(dir, site_id).await,
            None => Ok(SiteData::new(site_id)),
        }
    }

    /// Stores an original under `assets/originals/` and registers it. A
    /// re-upload of the same name drops the derivatives of the old bytes.
    pub async fn upload_original(
        &self,
        site_id: &str,
        file_name: &str,
        blob: Bytes,
    ) -> PipelineResult<UploadedOriginal> {
        let name = sanitize_file_name(file_name)
            .ok_or_else(|| PipelineError::Storage(format!("unusable file name '{file_name}'")))?;
        let (width, height) = self.resizer.dimensions(&blob).await?;
        let path = format!("{ORIGINALS_PREFIX}/{name}");
        let size_bytes = blob.len() as u64;
        self.blobs.save_asset(site_id, &path, blob).await?;
        self.registry
            .add_image(
                site_id,
                &path,
                ImageMetadata {
                    size_bytes,
                    width: Some(width),
                    height: Some(height),
                    alt: None,
                },
            )
            .await?;
        let stale = self.processor.invalidate_source(site_id, &path).await;
        info!(site_id, path, size_bytes, stale, "stored original");
        Ok(UploadedOriginal {
            url: self.blobs.public_url(site_id, &path),
            path,
            size_bytes,
            width,
            height,
        })
    }

    pub async fn display(
        &self,
        site_id: &str,
        source_path: &str,
        options: &TransformOptions,
    ) -> PipelineResult<Bytes> {
        let source_path = source_path.trim_start_matches('/');
        self.processor.get_display_blob(site_id, source_path, options).await
    }

    pub async fn update_references(
        &self,
        site_id: &str,
        content_file: &str,
        images: &[String],
    ) -> PipelineResult<Vec<String>> {
        self.registry.update_references(site_id, content_file, images).await
    }

    /// Removes orphans, then forgets any memoized bytes of removed originals.
    pub async fn cleanup(&self, site_id: &str) -> PipelineResult<CleanupResult> {
        let site = self.load_site(site_id).await?;
        let result = self.cleaner.cleanup(&site).await;
        for path in &result.removed_originals {
            self.processor.invalidate_source(site_id, path).await;
        }
        Ok(result)
    }

    pub async fn preview_cleanup(&self, site_id: &str) -> PipelineResult<CleanupPreview> {
        let site = self.load_site(site_id).await?;
        Ok(self.cleaner.preview(&site).await)
    }

    pub async fn repair_registry(&self, site_id: &str) -> PipelineResult<RepairReport> {
        let site = self.load_site(site_id).await?;
        self.migrator.validate_and_repair(&site).await
    }

    pub async fn usage_stats(&self, site_id: &str) -> PipelineResult<UsageStats> {
        let site = self.load_site(site_id).await?;
        Ok(self.migrator.ensure_registry(&site).await?.usage_stats())
    }

    pub async fn export_manifest(&self, site_id: &str, options: GenerateOptions) -> PipelineResult<MediaManifest> {
        let site = self.load_site(site_id).await?;
        self.manifests.generate(&site, options).await
    }

    pub fn validate_manifest(&self, candidate: &Value) -> ValidationReport {
        crate::manifest::validate(candidate)
    }

    pub async fn import_manifest(
        &self,
        candidate: &Value,
        target_site_id: &str,
        options: &ImportOptions,
    ) -> PipelineResult<ImportResult> {
        self.manifests.import(candidate, target_site_id, options).await
    }

    pub async fn bundle(&self, site_id: &str, options: GenerateOptions) -> PipelineResult<AssetBundle> {
        let site = self.load_site(site_id).await?;
        self.bundler.bundle(&site, options).await
    }

    pub async fn restore(&self, bundle: &AssetBundle, target_site_id: &str) -> PipelineResult<ImportResult> {
        self.bundler.restore(bundle, target_site_id).await
    }
}

/// Site ids become directory and key prefixes, so they are restricted to
/// `[A-Za-z0-9_-]{1,128}`.
pub fn is_valid_site_id(site_id: &str) -> bool {
    !site_id.is_empty()
        && site_id.len() <= 128
        && site_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// Keeps `[A-Za-z0-9._-]`, maps everything else to `-`, and refuses names that
/// are empty or only dots once cleaned.
pub fn sanitize_file_name(file_name: &str) -> Option<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name).trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_processing::tests::png;

    #[test]
    fn sanitizes_upload_names() {
        assert_eq!(sanitize_file_name("My Photo (1).JPG").as_deref(), Some("My-Photo--1-.JPG"));
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("C:\\tmp\\cat.png").as_deref(), Some("cat.png"));
        assert_eq!(sanitize_file_name(".hidden.png").as_deref(), Some("hidden.png"));
        assert_eq!(sanitize_file_name("..."), None);
        assert_eq!(sanitize_file_name(""), None);
    }

    #[tokio::test]
    async fn upload_registers_dimensions_and_resets_derivatives() {
        let pipeline = MediaPipeline::in_memory(PipelineConfig::default());
        let uploaded = pipeline.upload_original("s", "cat.png", png(30, 20)).await.unwrap();
        assert_eq!(uploaded.path, "assets/originals/cat.png");
        assert_eq!((uploaded.width, uploaded.height), (30, 20));

        let options = TransformOptions::new(Some(10), None);
        pipeline.display("s", "/assets/originals/cat.png", &options).await.unwrap();
        assert_eq!(pipeline.cache().list_keys("s").await.len(), 1);

        pipeline.upload_original("s", "cat.png", png(60, 40)).await.unwrap();
        assert!(pipeline.cache().list_keys("s").await.is_empty());
        let entry = pipeline.registry().get("s").await.unwrap().images["assets/originals/cat.png"].clone();
        assert_eq!(entry.width, Some(60));
        assert!(entry.derivative_paths.is_empty());
    }

    #[tokio::test]
    async fn upload_rejects_non_images() {
        let pipeline = MediaPipeline::in_memory(PipelineConfig::default());
        let err = pipeline
            .upload_original("s", "notes.png", Bytes::from_static(b"plain text"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Image(_)));
        assert!(pipeline.blobs().list_assets("s").await.unwrap().is_empty());
    }
}

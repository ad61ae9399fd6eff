//! Export asset bundles: the media manifest plus the bytes it describes, each
//! file carrying a SHA-256 digest so a restore can detect damaged transfers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{DerivativeCache, compute_hash, parse_derivative_key, source_identity};
use crate::content::SiteData;
use crate::error::{PipelineError, PipelineResult};
use crate::manifest::{GenerateOptions, ImportOptions, ImportResult, MediaManifest, MediaManifestService};
use crate::storage::BlobStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    /// Site-relative path, e.g. `assets/originals/a.png`.
    pub path: String,
    pub bytes: Bytes,
    pub sha256: String,
}

impl BundleFile {
    pub fn new(path: impl Into<String>, bytes: Bytes) -> Self {
        let sha256 = compute_hash(&bytes);
        Self {
            path: path.into(),
            bytes,
            sha256,
        }
    }

    pub fn verify(&self) -> bool {
        compute_hash(&self.bytes) == self.sha256
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBundle {
    pub manifest: MediaManifest,
    pub originals: Vec<BundleFile>,
    pub derivatives: Vec<BundleFile>,
}

impl AssetBundle {
    pub fn summary(&self) -> BundleSummary {
        let listing = |files: &[BundleFile]| {
            files
                .iter()
                .map(|f| BundleEntrySummary {
                    path: f.path.clone(),
                    size_bytes: f.bytes.len() as u64,
                    sha256: f.sha256.clone(),
                })
                .collect()
        };
        BundleSummary {
            images: self.manifest.images.len(),
            originals: listing(&self.originals),
            derivatives: listing(&self.derivatives),
        }
    }
}

/// Byte-free view of a bundle for tool responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    pub images: usize,
    pub originals: Vec<BundleEntrySummary>,
    pub derivatives: Vec<BundleEntrySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntrySummary {
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Clone)]
pub struct AssetBundler {
    blobs: Arc<dyn BlobStore>,
    cache: DerivativeCache,
    manifests: MediaManifestService,
}

impl AssetBundler {
    pub fn new(blobs: Arc<dyn BlobStore>, cache: DerivativeCache, manifests: MediaManifestService) -> Self {
        Self {
            blobs,
            cache,
            manifests,
        }
    }

    /// Collects every manifest original still in storage and every cached
    /// derivative rendered from one of them.
    pub async fn bundle(&self, site: &SiteData, options: GenerateOptions) -> PipelineResult<AssetBundle> {
        let site_id = site.site_id.as_str();
        let manifest = self.manifests.generate(site, options).await?;

        let mut originals = Vec::with_capacity(manifest.images.len());
        for path in manifest.images.keys() {
            match self.blobs.get_asset(site_id, path).await? {
                Some(bytes) => originals.push(BundleFile::new(path.as_str(), bytes)),
                None => warn!(site_id, path, "manifest original missing from storage"),
            }
        }

        let identities: BTreeSet<(String, String)> =
            manifest.images.keys().map(|path| source_identity(path)).collect();
        let site_prefix = format!("{site_id}/");
        let mut derivatives = Vec::new();
        for key in self.cache.list_keys(site_id).await {
            if !parse_derivative_key(&key).belongs_to(&identities) {
                continue;
            }
            let Some(bytes) = self.cache.get(&key).await else {
                continue;
            };
            let relative = key.strip_prefix(&site_prefix).unwrap_or(&key);
            derivatives.push(BundleFile::new(relative, bytes));
        }

        info!(
            site_id,
            originals = originals.len(),
            derivatives = derivatives.len(),
            "bundled site assets"
        );
        Ok(AssetBundle {
            manifest,
            originals,
            derivatives,
        })
    }

    /// Writes the bundle's originals into `target_site_id` and imports its
    /// manifest. Nothing is written if any digest fails to verify.
    pub async fn restore(&self, bundle: &AssetBundle, target_site_id: &str) -> PipelineResult<ImportResult> {
        let damaged: Vec<String> = bundle
            .originals
            .iter()
            .filter(|file| !file.verify())
            .map(|file| format!("{}: sha256 mismatch", file.path))
            .collect();
        if !damaged.is_empty() {
            return Err(PipelineError::InvalidManifest { errors: damaged });
        }

        let manifest = serde_json::to_value(&bundle.manifest)?;
        let report = crate::manifest::validate(&manifest);
        if !report.is_valid {
            return Err(PipelineError::InvalidManifest { errors: report.errors });
        }

        let assets: BTreeMap<String, Bytes> = bundle
            .originals
            .iter()
            .map(|file| (file.path.clone(), file.bytes.clone()))
            .collect();
        let count = assets.len();
        self.blobs.save_all_assets(target_site_id, assets).await?;
        let result = self
            .manifests
            .import(&manifest, target_site_id, &ImportOptions::default())
            .await?;
        info!(site_id = target_site_id, originals = count, "restored asset bundle");
        Ok(result)
    }
}

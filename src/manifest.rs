//! `media.json`: the portable description of a site's images used at the
//! export/import boundary.
//!
//! Only source metadata and reference lists travel. Derivative keys are not
//! part of the manifest; an imported registry starts with empty derivative
//! lists and the cache refills on demand.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::content::SiteData;
use crate::error::{PipelineError, PipelineResult};
use crate::migration::RegistryMigrator;
use crate::registry::{ImageMetadata, ImageRegistry, Registry, RegistryEntry};

pub const MANIFEST_VERSION: u32 = 1;
pub const KNOWN_VERSIONS: &[u64] = &[1];
pub const KNOWN_IMAGE_SERVICES: &[&str] = &["local", "cloudinary"];
pub const MAX_PATH_LEN: usize = 512;
const LOCAL_ORIGINALS_PREFIX: &str = "assets/originals/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaManifestEntry {
    pub referenced_in: Vec<String>,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaManifest {
    pub version: u32,
    pub image_service: String,
    pub images: BTreeMap<String, MediaManifestEntry>,
}

impl MediaManifest {
    pub fn from_registry(registry: &Registry, image_service: &str, include_orphaned: bool) -> Self {
        let images = registry
            .images
            .iter()
            .filter(|(_, entry)| include_orphaned || !entry.is_orphaned())
            .map(|(path, entry)| {
                (
                    path.clone(),
                    MediaManifestEntry {
                        referenced_in: entry.referenced_in.iter().cloned().collect(),
                        metadata: entry.metadata(),
                    },
                )
            })
            .collect();
        Self {
            version: MANIFEST_VERSION,
            image_service: image_service.to_string(),
            images,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateOptions {
    #[serde(default)]
    pub include_orphaned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStats {
    pub total_images: usize,
    pub total_references: usize,
    pub total_size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: ManifestStats,
}

/// Structural validation of an untrusted manifest document.
///
/// Hard errors make the manifest unusable; type drift in optional fields and
/// unknown versions or services only produce warnings.
pub fn validate(candidate: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(root) = candidate.as_object() else {
        report.errors.push("manifest root must be an object".into());
        return report;
    };

    match root.get("version") {
        Some(Value::Number(n)) => {
            if !n.as_u64().is_some_and(|v| KNOWN_VERSIONS.contains(&v)) {
                report.warnings.push(format!("unknown manifest version {n}"));
            }
        }
        Some(_) => report.errors.push("version must be a number".into()),
        None => report.errors.push("missing version".into()),
    }

    match root.get("imageService") {
        Some(Value::String(service)) => {
            if !KNOWN_IMAGE_SERVICES.contains(&service.as_str()) {
                report.warnings.push(format!("unknown image service '{service}'"));
            }
        }
        Some(_) => report.errors.push("imageService must be a string".into()),
        None => report.errors.push("missing imageService".into()),
    }

    match root.get("images") {
        Some(Value::Object(images)) => {
            for (path, entry) in images {
                validate_entry(path, entry, &mut report);
            }
        }
        Some(_) => report.errors.push("images must be an object".into()),
        None => report.errors.push("missing images".into()),
    }

    report.is_valid = report.errors.is_empty();
    report
}

fn validate_entry(path: &str, entry: &Value, report: &mut ValidationReport) {
    if let Err(reason) = check_image_path(path) {
        report.errors.push(format!("invalid image path format '{path}': {reason}"));
    }
    let Some(entry) = entry.as_object() else {
        report.errors.push(format!("{path}: entry must be an object"));
        return;
    };
    report.stats.total_images += 1;

    match entry.get("referencedIn") {
        Some(Value::Array(refs)) => {
            report.stats.total_references += refs.len();
            if refs.iter().any(|r| !r.is_string()) {
                report.warnings.push(format!("{path}: non-string referencedIn items are ignored"));
            }
        }
        _ => report.errors.push(format!("{path}: referencedIn must be an array")),
    }

    let Some(metadata) = entry.get("metadata").and_then(Value::as_object) else {
        report.errors.push(format!("{path}: metadata must be an object"));
        return;
    };
    match metadata.get("sizeBytes").and_then(Value::as_f64) {
        Some(size) if size > 0.0 => report.stats.total_size_bytes += size as u64,
        _ => report.errors.push(format!("{path}: metadata.sizeBytes must be a positive number")),
    }
    for field in ["width", "height"] {
        if let Some(value) = metadata.get(field) {
            if !value.is_null() && value.as_u64().is_none() {
                report
                    .warnings
                    .push(format!("{path}: metadata.{field} is not a non-negative integer"));
            }
        }
    }
    if let Some(alt) = metadata.get("alt") {
        if !alt.is_null() && !alt.is_string() {
            report.warnings.push(format!("{path}: metadata.alt is not a string"));
        }
    }
}

/// `assets/...` with no empty, `.` or `..` segments and a bounded length.
pub fn check_image_path(path: &str) -> Result<(), String> {
    if path.len() > MAX_PATH_LEN {
        return Err(format!("longer than {MAX_PATH_LEN} characters"));
    }
    if !path.starts_with("assets/") {
        return Err("must start with assets/".into());
    }
    if path.chars().any(|c| c.is_control() || c == '\\') {
        return Err("contains control characters or backslashes".into());
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err("contains empty or relative segments".into());
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    pub migrate_to_service: Option<String>,
    #[serde(default)]
    pub preserve_existing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub images_imported: usize,
    pub references_imported: usize,
    pub image_service: String,
    pub remapped_paths: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct MediaManifestService {
    registry: ImageRegistry,
    migrator: RegistryMigrator,
}

impl MediaManifestService {
    pub fn new(registry: ImageRegistry, migrator: RegistryMigrator) -> Self {
        Self { registry, migrator }
    }

    pub async fn generate(&self, site: &SiteData, options: GenerateOptions) -> PipelineResult<MediaManifest> {
        let registry = self.migrator.ensure_registry(site).await?;
        let manifest = MediaManifest::from_registry(&registry, &site.image_service, options.include_orphaned);
        info!(
            site_id = %site.site_id,
            images = manifest.images.len(),
            include_orphaned = options.include_orphaned,
            "generated media manifest"
        );
        Ok(manifest)
    }

    /// Validates, optionally remaps paths for a service migration, and writes
    /// the target site's registry. An invalid manifest changes nothing.
    pub async fn import(
        &self,
        candidate: &Value,
        target_site_id: &str,
        options: &ImportOptions,
    ) -> PipelineResult<ImportResult> {
        let validation = validate(candidate);
        if !validation.is_valid {
            return Err(PipelineError::InvalidManifest {
                errors: validation.errors,
            });
        }
        let source_service = candidate
            .get("imageService")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut result = ImportResult {
            image_service: options
                .migrate_to_service
                .clone()
                .unwrap_or_else(|| source_service.clone()),
            warnings: validation.warnings,
            ..ImportResult::default()
        };
        if let Some(target) = options.migrate_to_service.as_deref() {
            if !KNOWN_IMAGE_SERVICES.contains(&target) {
                result.warnings.push(format!("migrating to unknown image service '{target}'"));
            }
        }

        let mut imported: BTreeMap<String, RegistryEntry> = BTreeMap::new();
        let now = Utc::now();
        let images = candidate
            .get("images")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (path, raw) in &images {
            let entry = match parse_entry(raw) {
                Ok(entry) => entry,
                Err(reason) => {
                    warn!(path, reason, "skipping manifest image");
                    result.warnings.push(format!("{path}: skipped, {reason}"));
                    continue;
                }
            };
            let target_path = match options.migrate_to_service.as_deref() {
                Some(service) if service != source_service => {
                    let mapped = migrate_path(path, service);
                    if mapped != *path {
                        result.remapped_paths.insert(path.clone(), mapped.clone());
                    }
                    mapped
                }
                _ => path.clone(),
            };
            let mut registry_entry = RegistryEntry::new(entry.metadata, now);
            registry_entry.referenced_in = entry.referenced_in.into_iter().collect();
            result.references_imported += registry_entry.referenced_in.len();
            match imported.get_mut(&target_path) {
                Some(existing) => {
                    result
                        .warnings
                        .push(format!("{path}: maps onto an already imported path {target_path}"));
                    existing.referenced_in.extend(registry_entry.referenced_in);
                }
                None => {
                    imported.insert(target_path, registry_entry);
                }
            }
        }
        result.images_imported = imported.len();

        let preserve = options.preserve_existing;
        self.registry
            .update(target_site_id, move |registry| {
                if !preserve {
                    registry.images = imported;
                    return Ok(());
                }
                for (path, entry) in imported {
                    match registry.images.get_mut(&path) {
                        Some(existing) => existing.referenced_in.extend(entry.referenced_in),
                        None => {
                            registry.images.insert(path, entry);
                        }
                    }
                }
                Ok(())
            })
            .await?;
        info!(
            site_id = target_site_id,
            images = result.images_imported,
            references = result.references_imported,
            "imported media manifest"
        );
        Ok(result)
    }
}

struct ParsedEntry {
    referenced_in: BTreeSet<String>,
    metadata: ImageMetadata,
}

fn parse_entry(raw: &Value) -> Result<ParsedEntry, String> {
    let referenced_in = raw
        .get("referencedIn")
        .and_then(Value::as_array)
        .ok_or("referencedIn is not an array")?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    let metadata = raw.get("metadata").ok_or("metadata missing")?;
    let size_bytes = metadata
        .get("sizeBytes")
        .and_then(Value::as_f64)
        .filter(|size| *size > 0.0)
        .ok_or("sizeBytes is not a positive number")?;
    let dimension = |field: &str| {
        metadata
            .get(field)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    };
    Ok(ParsedEntry {
        referenced_in,
        metadata: ImageMetadata {
            size_bytes: size_bytes as u64,
            width: dimension("width"),
            height: dimension("height"),
            alt: metadata.get("alt").and_then(Value::as_str).map(str::to_string),
        },
    })
}

/// Local storage keeps every original under `assets/originals/`.
fn migrate_path(path: &str, service: &str) -> String {
    if service != "local" || path.starts_with(LOCAL_ORIGINALS_PREFIX) {
        return path.to_string();
    }
    let rest = path.strip_prefix("assets/").unwrap_or(path);
    format!("{LOCAL_ORIGINALS_PREFIX}{rest}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn good_manifest() -> Value {
        json!({
            "version": 1,
            "imageService": "local",
            "images": {
                "assets/originals/a.png": {
                    "referencedIn": ["posts/one.md"],
                    "metadata": { "sizeBytes": 120, "width": 10, "height": 12, "alt": "A" }
                }
            }
        })
    }

    #[test]
    fn accepts_well_formed_manifest() {
        let report = validate(&good_manifest());
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty());
        assert_eq!(report.stats.total_images, 1);
        assert_eq!(report.stats.total_references, 1);
        assert_eq!(report.stats.total_size_bytes, 120);
    }

    #[test]
    fn rejects_path_traversal() {
        let candidate = json!({
            "version": 1,
            "imageService": "local",
            "images": {
                "assets/../../etc/passwd": {
                    "referencedIn": [],
                    "metadata": { "sizeBytes": 1 }
                }
            }
        });
        let report = validate(&candidate);
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.contains("invalid image path format")));
    }

    #[test]
    fn rejects_bad_structure() {
        assert!(!validate(&json!([1, 2])).is_valid);
        let mut manifest = good_manifest();
        manifest["images"]["assets/originals/a.png"]["referencedIn"] = json!("posts/one.md");
        manifest["images"]["assets/originals/a.png"]["metadata"]["sizeBytes"] = json!(0);
        let report = validate(&manifest);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn drift_is_only_a_warning() {
        let mut manifest = good_manifest();
        manifest["version"] = json!(7);
        manifest["imageService"] = json!("imgix");
        manifest["images"]["assets/originals/a.png"]["metadata"]["width"] = json!("10px");
        manifest["images"]["assets/originals/a.png"]["metadata"]["alt"] = json!(false);
        let report = validate(&manifest);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 4);
    }

    #[test]
    fn path_rules() {
        assert!(check_image_path("assets/originals/a.png").is_ok());
        assert!(check_image_path("assets//a.png").is_err());
        assert!(check_image_path("images/a.png").is_err());
        assert!(check_image_path(&format!("assets/{}", "a".repeat(600))).is_err());
        assert!(check_image_path("assets/originals/photo..final.png").is_ok());
    }

    #[test]
    fn migrates_paths_onto_local_prefix() {
        assert_eq!(migrate_path("assets/photos/a.png", "local"), "assets/originals/photos/a.png");
        assert_eq!(migrate_path("assets/originals/a.png", "local"), "assets/originals/a.png");
        assert_eq!(migrate_path("assets/photos/a.png", "cloudinary"), "assets/photos/a.png");
    }
}

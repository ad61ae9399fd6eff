use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::source_identity;

pub const REGISTRY_VERSION: u32 = 1;

/// Size and display metadata of an original. Also the `metadata` object of a
/// media manifest entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

/// Partial metadata update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdate {
    pub size_bytes: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// Derivative keys believed to exist. The cache may have evicted any of them.
    #[serde(default)]
    pub derivative_paths: BTreeSet<String>,
    #[serde(default)]
    pub referenced_in: BTreeSet<String>,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn new(metadata: ImageMetadata, now: DateTime<Utc>) -> Self {
        Self {
            derivative_paths: BTreeSet::new(),
            referenced_in: BTreeSet::new(),
            size_bytes: metadata.size_bytes,
            width: metadata.width,
            height: metadata.height,
            alt: metadata.alt,
            created_at: now,
            last_accessed: now,
        }
    }

    pub fn is_orphaned(&self) -> bool {
        self.referenced_in.is_empty()
    }

    pub fn metadata(&self) -> ImageMetadata {
        ImageMetadata {
            size_bytes: self.size_bytes,
            width: self.width,
            height: self.height,
            alt: self.alt.clone(),
        }
    }

    pub fn apply(&mut self, update: MetadataUpdate) {
        if let Some(size_bytes) = update.size_bytes {
            self.size_bytes = size_bytes;
        }
        if update.width.is_some() {
            self.width = update.width;
        }
        if update.height.is_some() {
            self.height = update.height;
        }
        if update.alt.is_some() {
            self.alt = update.alt;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub site_id: String,
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub images: BTreeMap<String, RegistryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedOriginal {
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReport {
    pub orphaned_originals: Vec<OrphanedOriginal>,
    pub orphaned_derivatives: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_images: usize,
    pub referenced_images: usize,
    pub orphaned_images: usize,
    pub total_derivatives: usize,
    pub total_references: usize,
    pub total_bytes: u64,
    pub orphaned_bytes: u64,
}

impl Registry {
    pub fn empty(site_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            version: REGISTRY_VERSION,
            last_updated: Utc::now(),
            images: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Replaces what `content_file` references. Paths without an entry are
    /// returned and otherwise ignored.
    pub fn set_references(&mut self, content_file: &str, image_paths: &[String]) -> Vec<String> {
        for entry in self.images.values_mut() {
            entry.referenced_in.remove(content_file);
        }
        let mut unknown = Vec::new();
        for path in image_paths {
            match self.images.get_mut(path) {
                Some(entry) => {
                    entry.referenced_in.insert(content_file.to_string());
                }
                None => unknown.push(path.clone()),
            }
        }
        unknown
    }

    pub fn orphans(&self) -> OrphanReport {
        let mut report = OrphanReport::default();
        for (path, entry) in &self.images {
            if entry.is_orphaned() {
                report.orphaned_originals.push(OrphanedOriginal {
                    path: path.clone(),
                    size_bytes: entry.size_bytes,
                });
                report
                    .orphaned_derivatives
                    .extend(entry.derivative_paths.iter().cloned());
            }
        }
        report
    }

    /// `(stem, extension)` of every original still referenced somewhere.
    pub fn live_identities(&self) -> BTreeSet<(String, String)> {
        self.images
            .iter()
            .filter(|(_, entry)| !entry.is_orphaned())
            .map(|(path, _)| source_identity(path))
            .collect()
    }

    pub fn usage_stats(&self) -> UsageStats {
        let mut stats = UsageStats {
            total_images: self.images.len(),
            ..UsageStats::default()
        };
        for entry in self.images.values() {
            stats.total_bytes += entry.size_bytes;
            stats.total_derivatives += entry.derivative_paths.len();
            stats.total_references += entry.referenced_in.len();
            if entry.is_orphaned() {
                stats.orphaned_images += 1;
                stats.orphaned_bytes += entry.size_bytes;
            } else {
                stats.referenced_images += 1;
            }
        }
        stats
    }
}

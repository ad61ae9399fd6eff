//! Content files and the image-reference scanner.
//!
//! Content arrives as structured fields (frontmatter, site manifest) plus raw
//! markdown. Images are referenced either inline as `![alt](assets/...)` or as
//! `{ "serviceId": ..., "src": ... }` objects anywhere in the field tree.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{PipelineError, PipelineResult};

/// Reference location used for the site-level manifest fields.
pub const MANIFEST_LOCATION: &str = "manifest";
pub const DEFAULT_IMAGE_SERVICE: &str = "local";

static INLINE_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"!\[[^\]]*\]\(\s*<?(/?assets/[^)\s"'>]+)>?(?:\s+["'][^"']*["'])?\s*\)"#)
        .expect("inline image pattern is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentFile {
    pub path: String,
    #[serde(default)]
    pub fields: Value,
    #[serde(default)]
    pub body: String,
}

/// Everything the registry rebuild and manifest export need to know about a site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteData {
    pub site_id: String,
    pub image_service: String,
    pub manifest: Value,
    pub content_files: Vec<ContentFile>,
}

impl SiteData {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            image_service: DEFAULT_IMAGE_SERVICE.to_string(),
            manifest: Value::Null,
            content_files: Vec::new(),
        }
    }

    pub fn with_content(mut self, file: ContentFile) -> Self {
        self.content_files.push(file);
        self
    }

    /// Image paths referenced from each location (content file path or
    /// [`MANIFEST_LOCATION`]).
    pub fn reference_map(&self, scanner: &ReferenceScanner) -> BTreeMap<String, BTreeSet<String>> {
        let mut map = BTreeMap::new();
        let manifest_refs = scanner.scan_value(&self.manifest);
        if !manifest_refs.is_empty() {
            map.insert(MANIFEST_LOCATION.to_string(), manifest_refs);
        }
        for file in &self.content_files {
            let refs = scanner.scan_file(file);
            if !refs.is_empty() {
                map.insert(file.path.clone(), refs);
            }
        }
        map
    }

    /// Inverts [`reference_map`](Self::reference_map): image path -> locations.
    pub fn usage_index(&self, scanner: &ReferenceScanner) -> BTreeMap<String, BTreeSet<String>> {
        let mut index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (location, paths) in self.reference_map(scanner) {
            for path in paths {
                index.entry(path).or_default().insert(location.clone());
            }
        }
        index
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReferenceScanner {
    depth_limit: usize,
}

impl ReferenceScanner {
    pub fn new(depth_limit: usize) -> Self {
        Self { depth_limit }
    }

    pub fn scan_file(&self, file: &ContentFile) -> BTreeSet<String> {
        let mut found = self.scan_value(&file.fields);
        found.extend(scan_markdown(&file.body));
        found
    }

    /// Walks `root` up to the depth limit. Nodes are tracked by address so a
    /// value reachable twice is only visited once.
    pub fn scan_value(&self, root: &Value) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut visited: HashSet<*const Value> = HashSet::new();
        let mut stack: Vec<(&Value, usize)> = vec![(root, 0)];
        let mut truncated = false;

        while let Some((node, depth)) = stack.pop() {
            if !visited.insert(node as *const Value) {
                continue;
            }
            if depth > self.depth_limit {
                truncated = true;
                continue;
            }
            match node {
                Value::Object(map) => {
                    if let Some(src) = service_image_src(map) {
                        found.insert(src);
                    }
                    stack.extend(map.values().map(|child| (child, depth + 1)));
                }
                Value::Array(items) => {
                    stack.extend(items.iter().map(|child| (child, depth + 1)));
                }
                Value::String(text) => found.extend(scan_markdown(text)),
                _ => {}
            }
        }
        if truncated {
            debug!(limit = self.depth_limit, "reference scan hit depth limit");
        }
        found
    }
}

impl Default for ReferenceScanner {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Inline markdown image paths, normalized without a leading slash.
pub fn scan_markdown(text: &str) -> BTreeSet<String> {
    INLINE_IMAGE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| normalize_path(m.as_str()))
        .collect()
}

fn service_image_src(map: &serde_json::Map<String, Value>) -> Option<String> {
    map.get("serviceId")?.as_str()?;
    let src = map.get("src")?.as_str()?.trim();
    if src.is_empty() {
        return None;
    }
    Some(normalize_path(src))
}

fn normalize_path(path: &str) -> String {
    path.trim().trim_start_matches('/').to_string()
}

/// Loads `{content_dir}/{site_id}`: every `*.md` file (YAML frontmatter between
/// `---` fences, then markdown) and the optional `site.json` manifest.
pub async fn load_site_content(content_dir: &Path, site_id: &str) -> PipelineResult<SiteData> {
    let site_dir = content_dir.join(site_id);
    let site_id = site_id.to_string();
    tokio::task::spawn_blocking(move || load_site_dir(&site_dir, site_id))
        .await
        .map_err(|err| PipelineError::Storage(format!("content load task failed: {err}")))?
}

fn load_site_dir(site_dir: &Path, site_id: String) -> PipelineResult<SiteData> {
    let mut site = SiteData::new(site_id);
    if !site_dir.exists() {
        return Ok(site);
    }
    let manifest_path = site_dir.join("site.json");
    if manifest_path.exists() {
        let bytes = std::fs::read(&manifest_path)?;
        site.manifest = serde_json::from_slice(&bytes)?;
        if let Some(service) = site.manifest.get("imageService").and_then(Value::as_str) {
            site.image_service = service.to_string();
        }
    }
    for entry in WalkDir::new(site_dir) {
        let entry = entry.map_err(|err| PipelineError::Storage(err.to_string()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("md") {
            continue;
        }
        let raw = std::fs::read_to_string(path)?;
        let relative = path
            .strip_prefix(site_dir)
            .map_err(|err| PipelineError::Storage(err.to_string()))?
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        site.content_files.push(parse_markdown_file(&relative, &raw));
    }
    site.content_files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(site)
}

/// Splits frontmatter from body. Unparseable frontmatter is kept out of the
/// structured fields and logged; the body is still scanned.
pub fn parse_markdown_file(path: &str, raw: &str) -> ContentFile {
    let (frontmatter, body) = split_frontmatter(raw);
    let fields = match frontmatter {
        Some(yaml) => match serde_yaml::from_str::<serde_yaml::Value>(yaml)
            .map_err(|err| err.to_string())
            .and_then(|value| serde_json::to_value(value).map_err(|err| err.to_string()))
        {
            Ok(value) => value,
            Err(err) => {
                warn!(path, error = %err, "ignoring unparseable frontmatter");
                Value::Null
            }
        },
        None => Value::Null,
    };
    ContentFile {
        path: path.to_string(),
        fields,
        body: body.to_string(),
    }
}

fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let Some(rest) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return (None, raw);
    };
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return (Some(&rest[..offset]), &rest[offset + line.len()..]);
        }
        offset += line.len();
    }
    (None, raw)
}

//! Deterministic derivative cache keys.
//!
//! A key is `{site_id}/assets/derivatives/{stem}_w{w}_h{h}_c-{crop}_g-{gravity}{ext}`
//! where `stem` is the original's site-relative path without its extension and
//! `w`/`h` are pixel counts or `auto`. Identical transform requests for the
//! same source always produce the same key, and distinct originals never share
//! one. Cleanup parses keys back to find the original they were rendered from.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DERIVATIVES_DIR: &str = "assets/derivatives";

static CURRENT_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<base>.+)_w(?P<w>\d+|auto)_h(?P<h>\d+|auto)_c-(?P<crop>fill|fit|scale)_g-(?P<gravity>center|north|south|east|west|auto)(?P<ext>\.[A-Za-z0-9]+)?$",
    )
    .expect("derivative key pattern is valid")
});

static LEGACY_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<base>.+)_w(?P<w>\d+|auto)_h(?P<h>\d+|auto)(?P<ext>\.[A-Za-z0-9]+)?$")
        .expect("legacy derivative key pattern is valid")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CropMode {
    #[default]
    Fill,
    Fit,
    Scale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Gravity {
    #[default]
    Center,
    North,
    South,
    East,
    West,
    Auto,
}

impl CropMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fill => "fill",
            Self::Fit => "fit",
            Self::Scale => "scale",
        }
    }
}

impl Gravity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Center => "center",
            Self::North => "north",
            Self::South => "south",
            Self::East => "east",
            Self::West => "west",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for CropMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fill" => Ok(Self::Fill),
            "fit" => Ok(Self::Fit),
            "scale" => Ok(Self::Scale),
            other => Err(format!("unknown crop mode: {other}")),
        }
    }
}

impl FromStr for Gravity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "center" => Ok(Self::Center),
            "north" => Ok(Self::North),
            "south" => Ok(Self::South),
            "east" => Ok(Self::East),
            "west" => Ok(Self::West),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown gravity: {other}")),
        }
    }
}

/// Requested rendition of an original. `None` dimensions mean "auto".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    #[serde(default)]
    pub crop: CropMode,
    #[serde(default)]
    pub gravity: Gravity,
}

impl TransformOptions {
    pub fn new(width: Option<u32>, height: Option<u32>) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn with_crop(mut self, crop: CropMode) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_gravity(mut self, gravity: Gravity) -> Self {
        self.gravity = gravity;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivativeKey {
    pub site_id: String,
    /// Site-relative path of the original, extension removed.
    pub stem: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub crop: CropMode,
    pub gravity: Gravity,
    /// Includes the leading dot, empty when the source has no extension.
    pub extension: String,
}

impl DerivativeKey {
    pub fn new(site_id: &str, source_path: &str, options: &TransformOptions) -> Self {
        let (stem, extension) = source_identity(source_path);
        Self {
            site_id: site_id.to_string(),
            stem,
            width: options.width,
            height: options.height,
            crop: options.crop,
            gravity: options.gravity,
            extension,
        }
    }

    pub fn filename(&self) -> String {
        format!(
            "{}_w{}_h{}_c-{}_g-{}{}",
            self.stem,
            dimension_label(self.width),
            dimension_label(self.height),
            self.crop.as_str(),
            self.gravity.as_str(),
            self.extension
        )
    }

    /// The site-relative path, without the site prefix.
    pub fn relative_path(&self) -> String {
        format!("{DERIVATIVES_DIR}/{}", self.filename())
    }

    /// Path of the original this key was rendered from.
    pub fn source_path(&self) -> String {
        format!("{}{}", self.stem, self.extension)
    }

    pub fn matches_source(&self, source_path: &str) -> bool {
        let (stem, extension) = source_identity(source_path);
        self.stem == stem && self.extension == extension
    }
}

impl fmt::Display for DerivativeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site_id, self.relative_path())
    }
}

/// Result of reverse-parsing a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedDerivative {
    Current(DerivativeKey),
    /// Older naming: file stem only, no crop/gravity. Only the original's file
    /// name is recoverable, not its directory.
    Legacy {
        site_id: String,
        basename: String,
        extension: String,
    },
    Unrecognized {
        site_id: Option<String>,
        key: String,
    },
}

impl ParsedDerivative {
    /// Whether this derivative was rendered from one of `live`, a set of
    /// [`source_identity`] pairs. Legacy names match on file name alone.
    pub fn belongs_to(&self, live: &BTreeSet<(String, String)>) -> bool {
        match self {
            Self::Current(key) => live.contains(&(key.stem.clone(), key.extension.clone())),
            Self::Legacy {
                basename,
                extension,
                ..
            } => live.iter().any(|(stem, ext)| {
                ext == extension && stem.rsplit('/').next() == Some(basename.as_str())
            }),
            Self::Unrecognized { .. } => false,
        }
    }
}

pub fn parse_derivative_key(key: &str) -> ParsedDerivative {
    let marker = format!("/{DERIVATIVES_DIR}/");
    let Some((site_id, filename)) = key.split_once(&marker) else {
        return ParsedDerivative::Unrecognized {
            site_id: key.split_once('/').map(|(site, _)| site.to_string()),
            key: key.to_string(),
        };
    };
    if let Some(caps) = CURRENT_FORMAT.captures(filename) {
        let crop = caps["crop"].parse().unwrap_or_default();
        let gravity = caps["gravity"].parse().unwrap_or_default();
        return ParsedDerivative::Current(DerivativeKey {
            site_id: site_id.to_string(),
            stem: caps["base"].to_string(),
            width: parse_dimension(&caps["w"]),
            height: parse_dimension(&caps["h"]),
            crop,
            gravity,
            extension: caps.name("ext").map(|m| m.as_str().to_string()).unwrap_or_default(),
        });
    }
    if let Some(caps) = LEGACY_FORMAT.captures(filename) {
        return ParsedDerivative::Legacy {
            site_id: site_id.to_string(),
            basename: caps["base"].to_string(),
            extension: caps.name("ext").map(|m| m.as_str().to_string()).unwrap_or_default(),
        };
    }
    ParsedDerivative::Unrecognized {
        site_id: Some(site_id.to_string()),
        key: key.to_string(),
    }
}

/// `(stem, extension)` for an original path: the site-relative path split at
/// the file's last dot. Joining the two gives the path back, so different
/// originals always get different identities.
pub fn source_identity(source_path: &str) -> (String, String) {
    let trimmed = source_path.trim_start_matches('/');
    let (dir, file) = match trimmed.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, trimmed),
    };
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let stem = match dir {
                Some(dir) => format!("{dir}/{stem}"),
                None => stem.to_string(),
            };
            (stem, format!(".{ext}"))
        }
        _ => (trimmed.to_string(), String::new()),
    }
}

fn dimension_label(value: Option<u32>) -> String {
    value.map_or_else(|| "auto".to_string(), |v| v.to_string())
}

fn parse_dimension(value: &str) -> Option<u32> {
    value.parse().ok()
}

//! Error taxonomy for the derivative pipeline.
//!
//! Soft failures (timeouts, per-item cleanup failures) are normally logged and
//! absorbed by the layer that sees them; the variants still exist so callers
//! that want to surface them can. Every variant is `Clone` so one failed
//! derivative generation can be handed to every waiter joined on it.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("storage operation timed out: {operation}")]
    StorageTimeout { operation: String },

    #[error("storage corrupted: {detail}")]
    StorageCorruption { detail: String },

    #[error("source image not found: {path}")]
    SourceNotFound { path: String },

    #[error("image processing timed out after {millis}ms")]
    CompressionTimeout { millis: u64 },

    #[error("no registry entry for {path}")]
    RegistryEntryNotFound { path: String },

    #[error("invalid media manifest: {}", errors.join("; "))]
    InvalidManifest { errors: Vec<String> },

    #[error("cleanup finished with {} failure(s)", failures.len())]
    PartialCleanupFailure { failures: Vec<String> },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("derivative generation was interrupted")]
    Interrupted,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn source_not_found(path: impl Into<String>) -> Self {
        Self::SourceNotFound { path: path.into() }
    }

    pub fn entry_not_found(path: impl Into<String>) -> Self {
        Self::RegistryEntryNotFound { path: path.into() }
    }

    pub fn compression_timeout(limit: std::time::Duration) -> Self {
        Self::CompressionTimeout {
            millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::StorageTimeout {
            operation: operation.into(),
        }
    }

    /// Failures that leave the whole subsystem untrustworthy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StorageCorruption { .. } | Self::InvalidManifest { .. }
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err.to_string())
    }
}

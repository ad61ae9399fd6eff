pub mod cleanup;
pub mod display_image;
pub mod manifest;
pub mod registry;
pub mod site_validation;

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;
use serde_json::Value;

use crate::error::PipelineError;

pub use cleanup::{CleanupOrphansRequest, PreviewCleanupRequest, cleanup_orphans, preview_cleanup};
pub use display_image::{GetDisplayImageRequest, get_display_image};
pub use manifest::{
    ExportAssetBundleRequest, ExportMediaManifestRequest, ImportMediaManifestRequest,
    ValidateMediaManifestRequest, export_asset_bundle, export_media_manifest, import_media_manifest,
    validate_media_manifest,
};
pub use registry::{RepairRegistryRequest, RegistryUsageStatsRequest, registry_usage_stats, repair_registry};
pub use site_validation::{validate_original_path, validate_site_id};

#[derive(Serialize)]
pub struct ToolResponse<T: Serialize> {
    pub name: String,
    pub text: String,
    pub data: T,
}

/// Caller mistakes become `invalid_params`; everything else is internal.
pub fn pipeline_error(err: PipelineError) -> McpError {
    match &err {
        PipelineError::SourceNotFound { .. } | PipelineError::RegistryEntryNotFound { .. } => {
            McpError::invalid_params(err.to_string(), None)
        }
        PipelineError::InvalidManifest { errors } => McpError::invalid_params(
            "invalid media manifest",
            Some(Value::Array(errors.iter().cloned().map(Value::String).collect())),
        ),
        _ => McpError::internal_error(
            "pipeline operation failed",
            Some(Value::String(err.to_string())),
        ),
    }
}

pub fn json_result<T: Serialize>(name: &str, text: String, data: T) -> Result<CallToolResult, McpError> {
    let response = ToolResponse {
        name: name.to_string(),
        text,
        data,
    };
    let json = serde_json::to_string(&response).map_err(|err| {
        McpError::internal_error(
            "serialize tool response failed",
            Some(Value::String(err.to_string())),
        )
    })?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

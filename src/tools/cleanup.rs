use rmcp::{
    ErrorData as McpError,
    handler::server::wrapper::Parameters,
    model::CallToolResult,
    schemars::JsonSchema,
};
use serde::Deserialize;

use crate::{
    pipeline::MediaPipeline,
    tools::{json_result, pipeline_error, validate_site_id},
};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PreviewCleanupRequest {
    #[schemars(description = "Site identifier")]
    pub site_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CleanupOrphansRequest {
    #[schemars(description = "Site identifier")]
    pub site_id: String,
}

pub async fn preview_cleanup(
    pipeline: &MediaPipeline,
    Parameters(request): Parameters<PreviewCleanupRequest>,
) -> Result<CallToolResult, McpError> {
    let site_id = validate_site_id(&request.site_id)?;
    let preview = pipeline.preview_cleanup(&site_id).await.map_err(pipeline_error)?;
    let text = if preview.fallback_mode {
        "Registry unavailable; nothing would be removed.".to_string()
    } else {
        format!(
            "{} orphaned originals ({} bytes) and {} orphaned derivatives.",
            preview.orphaned_originals.len(),
            preview.estimated_bytes,
            preview.orphaned_derivatives.len()
        )
    };
    json_result("cleanup-preview", text, preview)
}

pub async fn cleanup_orphans(
    pipeline: &MediaPipeline,
    Parameters(request): Parameters<CleanupOrphansRequest>,
) -> Result<CallToolResult, McpError> {
    let site_id = validate_site_id(&request.site_id)?;
    let result = pipeline.cleanup(&site_id).await.map_err(pipeline_error)?;
    let mut text = format!(
        "Removed {} originals and {} derivatives, freed {} bytes.",
        result.originals_removed, result.derivatives_removed, result.bytes_freed
    );
    if result.fallback_mode {
        text = "Registry unavailable; ran in safe mode and removed nothing.".to_string();
    } else if let Some(partial) = result.partial_failure() {
        text.push(' ');
        text.push_str(&partial.to_string());
    }
    json_result("cleanup-result", text, result)
}

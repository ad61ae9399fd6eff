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
pub struct RegistryUsageStatsRequest {
    #[schemars(description = "Site identifier")]
    pub site_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RepairRegistryRequest {
    #[schemars(description = "Site identifier")]
    pub site_id: String,
}

pub async fn registry_usage_stats(
    pipeline: &MediaPipeline,
    Parameters(request): Parameters<RegistryUsageStatsRequest>,
) -> Result<CallToolResult, McpError> {
    let site_id = validate_site_id(&request.site_id)?;
    let stats = pipeline.usage_stats(&site_id).await.map_err(pipeline_error)?;
    let text = format!(
        "{} images ({} referenced, {} orphaned), {} derivatives.",
        stats.total_images, stats.referenced_images, stats.orphaned_images, stats.total_derivatives
    );
    json_result("registry-usage", text, stats)
}

pub async fn repair_registry(
    pipeline: &MediaPipeline,
    Parameters(request): Parameters<RepairRegistryRequest>,
) -> Result<CallToolResult, McpError> {
    let site_id = validate_site_id(&request.site_id)?;
    let report = pipeline.repair_registry(&site_id).await.map_err(pipeline_error)?;
    let text = if report.is_clean() {
        "Registry matches storage and content.".to_string()
    } else {
        report.discrepancies().join("\n")
    };
    json_result("registry-repair", text, report)
}

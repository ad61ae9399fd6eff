use rmcp::{
    ErrorData as McpError,
    handler::server::wrapper::Parameters,
    model::CallToolResult,
    schemars::JsonSchema,
};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    manifest::{GenerateOptions, ImportOptions},
    pipeline::MediaPipeline,
    tools::{json_result, pipeline_error, validate_site_id},
};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExportMediaManifestRequest {
    #[schemars(description = "Site identifier")]
    pub site_id: String,
    #[schemars(description = "Also list originals no content references")]
    #[serde(default)]
    pub include_orphaned: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExportAssetBundleRequest {
    #[schemars(description = "Site identifier")]
    pub site_id: String,
    #[schemars(description = "Also bundle originals no content references")]
    #[serde(default)]
    pub include_orphaned: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ValidateMediaManifestRequest {
    #[schemars(description = "media.json document")]
    pub manifest: Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ImportMediaManifestRequest {
    #[schemars(description = "media.json document")]
    pub manifest: Value,
    #[schemars(description = "Site that receives the imported registry")]
    pub target_site_id: String,
    #[schemars(description = "Remap image paths for this image service, e.g. local")]
    pub migrate_to_service: Option<String>,
    #[schemars(description = "Merge into the existing registry instead of replacing it")]
    #[serde(default)]
    pub preserve_existing: bool,
}

pub async fn export_media_manifest(
    pipeline: &MediaPipeline,
    Parameters(request): Parameters<ExportMediaManifestRequest>,
) -> Result<CallToolResult, McpError> {
    let site_id = validate_site_id(&request.site_id)?;
    let options = GenerateOptions {
        include_orphaned: request.include_orphaned,
    };
    let manifest = pipeline
        .export_manifest(&site_id, options)
        .await
        .map_err(pipeline_error)?;
    let text = format!("media.json with {} images.", manifest.images.len());
    json_result("media-manifest", text, manifest)
}

pub async fn export_asset_bundle(
    pipeline: &MediaPipeline,
    Parameters(request): Parameters<ExportAssetBundleRequest>,
) -> Result<CallToolResult, McpError> {
    let site_id = validate_site_id(&request.site_id)?;
    let options = GenerateOptions {
        include_orphaned: request.include_orphaned,
    };
    let bundle = pipeline.bundle(&site_id, options).await.map_err(pipeline_error)?;
    let summary = bundle.summary();
    let text = format!(
        "{} originals and {} derivatives ready for export.",
        summary.originals.len(),
        summary.derivatives.len()
    );
    json_result("asset-bundle", text, summary)
}

pub async fn validate_media_manifest(
    pipeline: &MediaPipeline,
    Parameters(request): Parameters<ValidateMediaManifestRequest>,
) -> Result<CallToolResult, McpError> {
    let report = pipeline.validate_manifest(&request.manifest);
    let text = if report.is_valid {
        format!("Valid, {} warnings.", report.warnings.len())
    } else {
        format!("Invalid: {}", report.errors.join("; "))
    };
    json_result("manifest-validation", text, report)
}

pub async fn import_media_manifest(
    pipeline: &MediaPipeline,
    Parameters(request): Parameters<ImportMediaManifestRequest>,
) -> Result<CallToolResult, McpError> {
    let target_site_id = validate_site_id(&request.target_site_id)?;
    let options = ImportOptions {
        migrate_to_service: request.migrate_to_service,
        preserve_existing: request.preserve_existing,
    };
    let result = pipeline
        .import_manifest(&request.manifest, &target_site_id, &options)
        .await
        .map_err(pipeline_error)?;
    let text = format!(
        "Imported {} images with {} references into {target_site_id}.",
        result.images_imported, result.references_imported
    );
    json_result("manifest-import", text, result)
}

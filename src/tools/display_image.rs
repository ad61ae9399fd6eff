use base64::Engine;
use rmcp::{
    ErrorData as McpError,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content},
    schemars::JsonSchema,
};
use serde::{Deserialize, Serialize};

use crate::{
    cache::{CropMode, DerivativeKey, Gravity, TransformOptions},
    image_processing,
    pipeline::MediaPipeline,
    tools::{pipeline_error, validate_original_path, validate_site_id},
};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetDisplayImageRequest {
    #[schemars(description = "Site identifier")]
    pub site_id: String,
    #[schemars(description = "Original image path, e.g. assets/originals/cat.jpg")]
    pub path: String,
    #[schemars(description = "Target width in pixels; omitted means auto")]
    pub width: Option<u32>,
    #[schemars(description = "Target height in pixels; omitted means auto")]
    pub height: Option<u32>,
    #[schemars(description = "fill (default), fit or scale")]
    pub crop: Option<CropMode>,
    #[schemars(description = "Anchor used by fill cropping; defaults to center")]
    pub gravity: Option<Gravity>,
}

#[derive(Debug, Serialize)]
struct DisplayImageResponse {
    key: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(rename = "sizeBytes")]
    size_bytes: usize,
    width: u32,
    height: u32,
}

pub async fn get_display_image(
    pipeline: &MediaPipeline,
    Parameters(request): Parameters<GetDisplayImageRequest>,
) -> Result<CallToolResult, McpError> {
    let site_id = validate_site_id(&request.site_id)?;
    let path = validate_original_path(&request.path)?;
    if request.width == Some(0) || request.height == Some(0) {
        return Err(McpError::invalid_params("width and height must be positive", None));
    }
    let options = TransformOptions {
        width: request.width,
        height: request.height,
        crop: request.crop.unwrap_or_default(),
        gravity: request.gravity.unwrap_or_default(),
    };
    let blob = pipeline
        .display(&site_id, &path, &options)
        .await
        .map_err(pipeline_error)?;
    let mime_type = image_processing::detect_mime_type(&blob).unwrap_or("application/octet-stream");
    let (width, height) = image_processing::get_dimensions(&blob).map_err(pipeline_error)?;
    let response = DisplayImageResponse {
        key: DerivativeKey::new(&site_id, &path, &options).to_string(),
        mime_type: mime_type.to_string(),
        size_bytes: blob.len(),
        width,
        height,
    };
    let json = serde_json::to_string(&response).map_err(|err| {
        McpError::internal_error(
            "serialize tool response failed",
            Some(serde_json::Value::String(err.to_string())),
        )
    })?;
    let base64_image = base64::engine::general_purpose::STANDARD.encode(&blob);
    Ok(CallToolResult::success(vec![
        Content::image(base64_image, mime_type),
        Content::text(json),
    ]))
}

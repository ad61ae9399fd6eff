use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::cache::{CropMode, Gravity, TransformOptions};
use crate::error::PipelineError;
use crate::image_processing::{detect_mime_type, get_extension_from_mime_type};
use crate::manifest::check_image_path;
use crate::pipeline::{MediaPipeline, is_valid_site_id};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReferencesResponse {
    content_file: String,
    images: usize,
    unknown_images: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DisplayQuery {
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub crop: Option<String>,
    pub gravity: Option<String>,
}

impl DisplayQuery {
    pub fn to_options(&self) -> Result<TransformOptions, String> {
        if self.w == Some(0) || self.h == Some(0) {
            return Err("w and h must be positive".into());
        }
        let crop = match self.crop.as_deref() {
            Some(raw) => raw.parse::<CropMode>()?,
            None => CropMode::default(),
        };
        let gravity = match self.gravity.as_deref() {
            Some(raw) => raw.parse::<Gravity>()?,
            None => Gravity::default(),
        };
        Ok(TransformOptions::new(self.w, self.h)
            .with_crop(crop)
            .with_gravity(gravity))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencesRequest {
    pub content_file: String,
    #[serde(default)]
    pub images: Vec<String>,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse { error: message.to_string() })).into_response()
}

pub fn error_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::SourceNotFound { .. } | PipelineError::RegistryEntryNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        PipelineError::InvalidManifest { .. } | PipelineError::Image(_) => StatusCode::BAD_REQUEST,
        PipelineError::StorageTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::CompressionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn pipeline_error(err: PipelineError) -> Response {
    json_error(error_status(&err), &err.to_string())
}

fn extension_from_filename(file_name: &str) -> Option<String> {
    if let Some((stem, ext)) = file_name.rsplit_once('.') {
        let trimmed = ext.trim();
        if !stem.is_empty() && !trimmed.is_empty() {
            return Some(trimmed.to_lowercase());
        }
    }
    None
}

/// Upload names without an extension get one from the sniffed content.
fn upload_name(file_name: &str, bytes: &[u8]) -> String {
    if extension_from_filename(file_name).is_some() {
        return file_name.to_string();
    }
    let ext = detect_mime_type(bytes)
        .map(get_extension_from_mime_type)
        .unwrap_or("bin");
    let stem = if file_name.trim().is_empty() { "upload" } else { file_name };
    format!("{stem}.{ext}")
}

pub async fn handle_upload(
    State(pipeline): State<MediaPipeline>,
    Path(site_id): Path<String>,
    mut multipart: Multipart,
) -> Response {
    if !is_valid_site_id(&site_id) {
        return json_error(StatusCode::BAD_REQUEST, "invalid site id");
    }
    let mut file_name = None;
    let mut content_type = None;
    let mut bytes = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() == Some("file") {
                    content_type = field.content_type().map(|value| value.to_string());
                    file_name = Some(field.file_name().unwrap_or("").to_string());
                    match field.bytes().await {
                        Ok(data) => bytes = Some(data),
                        Err(err) => {
                            return json_error(
                                StatusCode::BAD_REQUEST,
                                &format!("failed to read file: {err}"),
                            );
                        }
                    }
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                return json_error(StatusCode::BAD_REQUEST, &format!("failed to read form: {err}"));
            }
        }
    }

    if let Some(content_type) = content_type.as_deref() {
        if !content_type.starts_with("image/") && content_type != "application/octet-stream" {
            return json_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "only images can be uploaded");
        }
    }
    let (Some(file_name), Some(bytes)) = (file_name, bytes) else {
        return json_error(StatusCode::BAD_REQUEST, "missing 'file' field");
    };
    if bytes.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "uploaded file is empty");
    }

    let name = upload_name(&file_name, &bytes);
    match pipeline.upload_original(&site_id, &name, bytes).await {
        Ok(uploaded) => (StatusCode::OK, Json(uploaded)).into_response(),
        Err(err) => pipeline_error(err),
    }
}

pub async fn serve_display(
    State(pipeline): State<MediaPipeline>,
    Path((site_id, path)): Path<(String, String)>,
    Query(query): Query<DisplayQuery>,
) -> Response {
    if !is_valid_site_id(&site_id) {
        return json_error(StatusCode::BAD_REQUEST, "invalid site id");
    }
    let path = path.trim_start_matches('/');
    if let Err(reason) = check_image_path(path) {
        return json_error(StatusCode::BAD_REQUEST, &format!("invalid image path: {reason}"));
    }
    let options = match query.to_options() {
        Ok(options) => options,
        Err(reason) => return json_error(StatusCode::BAD_REQUEST, &reason),
    };
    match pipeline.display(&site_id, path, &options).await {
        Ok(blob) => {
            let mime = detect_mime_type(&blob).unwrap_or("application/octet-stream");
            let mut response = blob.into_response();
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=3600"));
            response
        }
        Err(err) => pipeline_error(err),
    }
}

pub async fn update_references(
    State(pipeline): State<MediaPipeline>,
    Path(site_id): Path<String>,
    Json(request): Json<ReferencesRequest>,
) -> Response {
    if !is_valid_site_id(&site_id) {
        return json_error(StatusCode::BAD_REQUEST, "invalid site id");
    }
    if request.content_file.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "contentFile must not be empty");
    }
    let images: Vec<String> = request
        .images
        .iter()
        .map(|path| path.trim().trim_start_matches('/').to_string())
        .filter(|path| !path.is_empty())
        .collect();
    match pipeline
        .update_references(&site_id, &request.content_file, &images)
        .await
    {
        Ok(unknown_images) => Json(ReferencesResponse {
            content_file: request.content_file,
            images: images.len(),
            unknown_images,
        })
        .into_response(),
        Err(err) => pipeline_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_query_parses_modes() {
        let query = DisplayQuery {
            w: Some(300),
            h: None,
            crop: Some("FIT".into()),
            gravity: Some("north".into()),
        };
        let options = query.to_options().unwrap();
        assert_eq!(options.width, Some(300));
        assert_eq!(options.height, None);
        assert_eq!(options.crop, CropMode::Fit);
        assert_eq!(options.gravity, Gravity::North);
        assert_eq!(DisplayQuery::default().to_options().unwrap(), TransformOptions::default());
    }

    #[test]
    fn display_query_rejects_bad_values() {
        let zero = DisplayQuery { w: Some(0), ..DisplayQuery::default() };
        assert!(zero.to_options().is_err());
        let crop = DisplayQuery { crop: Some("stretch".into()), ..DisplayQuery::default() };
        assert!(crop.to_options().is_err());
    }

    #[test]
    fn upload_names_get_sniffed_extension() {
        let png = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(upload_name("photo", &png), "photo.png");
        assert_eq!(upload_name("", &png), "upload.png");
        assert_eq!(upload_name("cat.JPG", &png), "cat.JPG");
    }

    #[test]
    fn errors_map_to_http_status() {
        assert_eq!(
            error_status(&PipelineError::source_not_found("assets/a.png")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&PipelineError::CompressionTimeout { millis: 30_000 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(error_status(&PipelineError::Interrupted), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

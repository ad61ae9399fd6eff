//! The resize capability. The processor treats it as a black box behind
//! [`ImageResizer`]; [`RasterResizer`] is the in-process implementation.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};

use crate::cache::{CropMode, Gravity};
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeOptions {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub crop: CropMode,
    pub gravity: Gravity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressOptions {
    pub max_size_mb: f64,
    pub quality: u8,
}

impl CompressOptions {
    pub fn max_bytes(&self) -> usize {
        (self.max_size_mb * 1024.0 * 1024.0) as usize
    }
}

#[async_trait]
pub trait ImageResizer: Send + Sync {
    async fn dimensions(&self, blob: &Bytes) -> PipelineResult<(u32, u32)>;
    async fn resize(&self, blob: Bytes, options: ResizeOptions) -> PipelineResult<Bytes>;
    async fn compress(&self, blob: Bytes, options: CompressOptions) -> PipelineResult<Bytes>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RasterResizer;

#[async_trait]
impl ImageResizer for RasterResizer {
    async fn dimensions(&self, blob: &Bytes) -> PipelineResult<(u32, u32)> {
        get_dimensions(blob)
    }

    async fn resize(&self, blob: Bytes, options: ResizeOptions) -> PipelineResult<Bytes> {
        tokio::task::spawn_blocking(move || resize_blob(&blob, options))
            .await
            .map_err(|err| PipelineError::Image(format!("resize task failed: {err}")))?
    }

    async fn compress(&self, blob: Bytes, options: CompressOptions) -> PipelineResult<Bytes> {
        tokio::task::spawn_blocking(move || compress_blob(blob, options))
            .await
            .map_err(|err| PipelineError::Image(format!("compress task failed: {err}")))?
    }
}

/// Reads pixel dimensions from the header without decoding the image.
pub fn get_dimensions(bytes: &[u8]) -> PipelineResult<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    Ok(reader.into_dimensions()?)
}

pub fn resize_blob(bytes: &[u8], options: ResizeOptions) -> PipelineResult<Bytes> {
    if options.max_width.is_none() && options.max_height.is_none() {
        return Ok(Bytes::copy_from_slice(bytes));
    }
    let format = source_format(bytes)?;
    let image = image::load_from_memory_with_format(bytes, format)?;
    let resized = transform(&image, options);
    encode(&resized, format, None)
}

pub fn compress_blob(blob: Bytes, options: CompressOptions) -> PipelineResult<Bytes> {
    let max_bytes = options.max_bytes();
    if blob.len() <= max_bytes {
        return Ok(blob);
    }
    let format = source_format(&blob)?;
    let image = image::load_from_memory_with_format(&blob, format)?;
    if format == ImageFormat::Jpeg {
        return encode(&image, format, Some(options.quality));
    }
    // Lossless formats only shrink by losing pixels.
    let ratio = (max_bytes as f64 / blob.len() as f64).sqrt().clamp(0.1, 1.0);
    let (width, height) = image.dimensions();
    let width = ((width as f64 * ratio).round() as u32).max(1);
    let height = ((height as f64 * ratio).round() as u32).max(1);
    encode(&image.resize_exact(width, height, FilterType::Triangle), format, None)
}

fn transform(image: &DynamicImage, options: ResizeOptions) -> DynamicImage {
    let (src_w, src_h) = image.dimensions();
    let (target_w, target_h) = match (options.max_width, options.max_height) {
        (Some(w), Some(h)) => (w.clamp(1, src_w), h.clamp(1, src_h)),
        (Some(w), None) => {
            let w = w.clamp(1, src_w);
            (w, scaled(src_h, w, src_w))
        }
        (None, Some(h)) => {
            let h = h.clamp(1, src_h);
            (scaled(src_w, h, src_h), h)
        }
        (None, None) => return image.clone(),
    };
    if options.max_width.is_none() || options.max_height.is_none() {
        return image.resize_exact(target_w, target_h, FilterType::Lanczos3);
    }
    match options.crop {
        CropMode::Fit => image.resize(target_w, target_h, FilterType::Lanczos3),
        CropMode::Scale => image.resize_exact(target_w, target_h, FilterType::Lanczos3),
        CropMode::Fill => fill(image, target_w, target_h, options.gravity),
    }
}

/// Scales to cover the target box, then crops the overflow according to gravity.
fn fill(image: &DynamicImage, target_w: u32, target_h: u32, gravity: Gravity) -> DynamicImage {
    let (src_w, src_h) = image.dimensions();
    let scale = f64::max(
        target_w as f64 / src_w as f64,
        target_h as f64 / src_h as f64,
    );
    let cover_w = ((src_w as f64 * scale).ceil() as u32).clamp(target_w, src_w.max(target_w));
    let cover_h = ((src_h as f64 * scale).ceil() as u32).clamp(target_h, src_h.max(target_h));
    let covered = image.resize_exact(cover_w, cover_h, FilterType::Lanczos3);
    let (x, y) = crop_origin(cover_w, cover_h, target_w, target_h, gravity);
    covered.crop_imm(x, y, target_w, target_h)
}

fn crop_origin(width: u32, height: u32, target_w: u32, target_h: u32, gravity: Gravity) -> (u32, u32) {
    let spare_x = width.saturating_sub(target_w);
    let spare_y = height.saturating_sub(target_h);
    match gravity {
        Gravity::North => (spare_x / 2, 0),
        Gravity::South => (spare_x / 2, spare_y),
        Gravity::West => (0, spare_y / 2),
        Gravity::East => (spare_x, spare_y / 2),
        Gravity::Center | Gravity::Auto => (spare_x / 2, spare_y / 2),
    }
}

fn scaled(other: u32, target: u32, source: u32) -> u32 {
    ((other as f64 * target as f64 / source as f64).round() as u32).max(1)
}

fn encode(image: &DynamicImage, format: ImageFormat, quality: Option<u8>) -> PipelineResult<Bytes> {
    let mut output = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut output, quality.unwrap_or(90));
            rgb.write_with_encoder(encoder)?;
        }
        other => {
            image.write_to(&mut Cursor::new(&mut output), other)?;
        }
    }
    Ok(Bytes::from(output))
}

fn source_format(bytes: &[u8]) -> PipelineResult<ImageFormat> {
    let mime = detect_mime_type(bytes)
        .ok_or_else(|| PipelineError::Image("unsupported image type".into()))?;
    mime_to_format(mime)
}

pub fn detect_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"BM") {
        return Some("image/bmp");
    }
    None
}

pub fn mime_to_format(mime_type: &str) -> PipelineResult<ImageFormat> {
    match mime_type {
        "image/png" => Ok(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Ok(ImageFormat::Jpeg),
        "image/gif" => Ok(ImageFormat::Gif),
        "image/webp" => Ok(ImageFormat::WebP),
        "image/bmp" => Ok(ImageFormat::Bmp),
        _ => Err(PipelineError::Image(format!("unsupported mime type: {mime_type}"))),
    }
}

pub fn get_extension_from_mime_type(mime_type: &str) -> &str {
    match mime_type.to_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/svg+xml" => "svg",
        "image/avif" => "avif",
        _ => "bin",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    pub(crate) fn png(width: u32, height: u32) -> Bytes {
        let image = RgbaImage::from_pixel(width, height, Rgba([200, 30, 30, 255]));
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        Bytes::from(out)
    }

    fn options(w: Option<u32>, h: Option<u32>, crop: CropMode) -> ResizeOptions {
        ResizeOptions { max_width: w, max_height: h, crop, gravity: Gravity::Center }
    }

    #[test]
    fn fill_produces_exact_box() {
        let out = resize_blob(&png(400, 200), options(Some(100), Some(100), CropMode::Fill)).unwrap();
        assert_eq!(get_dimensions(&out).unwrap(), (100, 100));
    }

    #[test]
    fn fit_preserves_aspect_ratio() {
        let out = resize_blob(&png(400, 200), options(Some(100), Some(100), CropMode::Fit)).unwrap();
        assert_eq!(get_dimensions(&out).unwrap(), (100, 50));
    }

    #[test]
    fn single_dimension_keeps_aspect() {
        let out = resize_blob(&png(400, 200), options(None, Some(50), CropMode::Scale)).unwrap();
        assert_eq!(get_dimensions(&out).unwrap(), (100, 50));
    }

    #[test]
    fn never_upscales() {
        let out = resize_blob(&png(40, 30), options(Some(4000), Some(3000), CropMode::Fill)).unwrap();
        assert_eq!(get_dimensions(&out).unwrap(), (40, 30));
    }

    #[test]
    fn compress_is_noop_below_threshold() {
        let blob = png(10, 10);
        let out = compress_blob(blob.clone(), CompressOptions { max_size_mb: 1.0, quality: 80 }).unwrap();
        assert_eq!(out, blob);
    }

    #[test]
    fn gravity_moves_crop_window() {
        assert_eq!(crop_origin(200, 100, 100, 100, Gravity::West), (0, 0));
        assert_eq!(crop_origin(200, 100, 100, 100, Gravity::East), (100, 0));
        assert_eq!(crop_origin(100, 200, 100, 100, Gravity::South), (0, 100));
        assert_eq!(crop_origin(200, 100, 100, 100, Gravity::Auto), (50, 0));
    }

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(detect_mime_type(&png(1, 1)), Some("image/png"));
        assert_eq!(detect_mime_type(b"GIF89a...."), Some("image/gif"));
        assert_eq!(detect_mime_type(b"plain text"), None);
        assert_eq!(get_extension_from_mime_type("IMAGE/JPEG"), "jpg");
    }
}

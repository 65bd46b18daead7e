use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use thiserror::Error;
use tracing::debug;

/// Side length at which resolution stops contributing to the quality score.
const QUALITY_FULL_RESOLUTION_SIDE: f64 = 1024.0;
/// Laplacian variance treated as "fully sharp".
const QUALITY_FULL_SHARPNESS_VARIANCE: f64 = 400.0;
const QUALITY_ANALYSIS_MAX_SIDE: u32 = 512;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("source image is empty")]
    Empty,
    #[error("could not decode source image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("could not encode image: {0}")]
    Encode(#[source] image::ImageError),
}

#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/heic" => "heic",
        _ => "jpg",
    }
}

/// Downscales so the longer side is at most `max_side` and re-encodes as JPEG.
pub fn prepare_source_image(
    bytes: &[u8],
    max_side: u32,
    jpeg_quality: u8,
) -> Result<PreparedImage, MediaError> {
    if bytes.is_empty() {
        return Err(MediaError::Empty);
    }
    let image = image::load_from_memory(bytes).map_err(MediaError::Decode)?;
    let (width, height) = image.dimensions();
    let max_side = max_side.max(1);
    let image = if width.max(height) > max_side {
        image.resize(max_side, max_side, FilterType::Lanczos3)
    } else {
        image
    };

    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, jpeg_quality.clamp(1, 100));
    rgb.write_with_encoder(encoder).map_err(MediaError::Encode)?;

    let (out_width, out_height) = rgb.dimensions();
    debug!(
        "Prepared source image {}x{} -> {}x{} ({} bytes)",
        width,
        height,
        out_width,
        out_height,
        buffer.get_ref().len()
    );
    Ok(PreparedImage {
        bytes: buffer.into_inner(),
        mime_type: "image/jpeg".to_string(),
        width: out_width,
        height: out_height,
    })
}

/// Rough 0..=100 quality score: half resolution, half sharpness (variance of
/// the Laplacian). `None` when the bytes are not a decodable image.
pub fn estimate_image_quality(bytes: &[u8]) -> Option<f64> {
    let image = image::load_from_memory(bytes).ok()?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }

    let resolution = (f64::from(width.min(height)) / QUALITY_FULL_RESOLUTION_SIDE).min(1.0);

    let analysis = if width.max(height) > QUALITY_ANALYSIS_MAX_SIDE {
        image.resize(QUALITY_ANALYSIS_MAX_SIDE, QUALITY_ANALYSIS_MAX_SIDE, FilterType::Triangle)
    } else {
        image
    };
    let sharpness =
        (laplacian_variance(&analysis.to_luma8()) / QUALITY_FULL_SHARPNESS_VARIANCE).min(1.0);

    Some(((resolution * 50.0) + (sharpness * 50.0)).clamp(0.0, 100.0))
}

fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let pixel = |x: u32, y: u32| f64::from(gray.get_pixel(x, y)[0]);
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0.0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let value = pixel(x - 1, y) + pixel(x + 1, y) + pixel(x, y - 1) + pixel(x, y + 1)
                - 4.0 * pixel(x, y);
            sum += value;
            sum_sq += value * value;
            count += 1.0;
        }
    }
    let mean = sum / count;
    (sum_sq / count) - mean * mean
}

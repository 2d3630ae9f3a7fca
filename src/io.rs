use std::fs;
use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageError, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::canvas::RasterImage;

/// Maximum supported dimension in pixels (per axis) for decoded inputs.
/// Prevents memory exhaustion from crafted files.
pub const MAX_RASTER_DIM: u32 = 32_768;

pub const DEFAULT_QUALITY: u8 = 90;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("image codec error: {0}")]
    Image(#[from] ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image too large: {width}x{height}")]
    TooLarge { width: u32, height: u32 },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

// ============================================================================
// EXPORT FORMATS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl ExportFormat {
    pub fn all() -> &'static [ExportFormat] {
        &[ExportFormat::Png, ExportFormat::Jpeg, ExportFormat::Webp]
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Webp => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Png => "image/png",
            ExportFormat::Jpeg => "image/jpeg",
            ExportFormat::Webp => "image/webp",
        }
    }

    /// Whether the quality setting affects the output.
    pub fn is_lossy(&self) -> bool {
        matches!(self, ExportFormat::Jpeg)
    }

    /// Parse a format name or file extension (`"jpg"`, `"JPEG"`, `"webp"` …).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "png" => Some(ExportFormat::Png),
            "jpg" | "jpeg" => Some(ExportFormat::Jpeg),
            "webp" => Some(ExportFormat::Webp),
            _ => None,
        }
    }

    /// Infer the format from a path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension().and_then(|e| e.to_str()).and_then(Self::from_name)
    }
}

// ============================================================================
// ENCODE / DECODE
// ============================================================================

/// Encode a raster for download or storage.
///
/// `quality` (clamped to 1–100) applies to JPEG. WEBP is written lossless, so
/// quality is ignored there; JPEG drops the alpha channel.
pub fn encode(raster: &RasterImage, format: ExportFormat, quality: u8) -> CodecResult<Vec<u8>> {
    let quality = quality.clamp(1, 100);
    let mut cursor = Cursor::new(Vec::new());
    let pixels = raster.pixels();

    match format {
        ExportFormat::Png => {
            let encoder = PngEncoder::new(&mut cursor);
            DynamicImage::ImageRgba8(pixels.clone()).write_with_encoder(encoder)?;
        }
        ExportFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(pixels.clone()).to_rgb8();
            let encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
            DynamicImage::ImageRgb8(rgb).write_with_encoder(encoder)?;
        }
        ExportFormat::Webp => {
            let encoder = WebPEncoder::new_lossless(&mut cursor);
            DynamicImage::ImageRgba8(pixels.clone()).write_with_encoder(encoder)?;
        }
    }

    Ok(cursor.into_inner())
}

/// Size in bytes the raster would occupy when exported, for live estimates.
pub fn estimate_encoded_size(raster: &RasterImage, format: ExportFormat, quality: u8) -> CodecResult<usize> {
    encode(raster, format, quality).map(|bytes| bytes.len())
}

/// Decode any supported image buffer into a raster.
pub fn decode(bytes: &[u8]) -> CodecResult<RasterImage> {
    let img = image::load_from_memory(bytes)?;
    if img.width() > MAX_RASTER_DIM || img.height() > MAX_RASTER_DIM {
        return Err(CodecError::TooLarge {
            width: img.width(),
            height: img.height(),
        });
    }
    Ok(RasterImage::new(img.into_rgba8()))
}

/// Synchronously load an image file.
pub fn load_image_sync(path: &Path) -> CodecResult<RasterImage> {
    let bytes = fs::read(path)?;
    decode(&bytes)
}

/// Encode and write a raster to disk.
pub fn encode_and_write(raster: &RasterImage, path: &Path, format: ExportFormat, quality: u8) -> CodecResult<()> {
    let bytes = encode(raster, format, quality)?;
    fs::write(path, bytes)?;
    Ok(())
}

/// Guess the format of an encoded buffer.
pub fn sniff_format(bytes: &[u8]) -> Option<ExportFormat> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some(ExportFormat::Png),
        ImageFormat::Jpeg => Some(ExportFormat::Jpeg),
        ImageFormat::WebP => Some(ExportFormat::Webp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn gradient(w: u32, h: u32) -> RasterImage {
        RasterImage::new(RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 11 % 256) as u8, 90, 255])
        }))
    }

    #[test]
    fn png_is_lossless() {
        let src = gradient(17, 9);
        let bytes = encode(&src, ExportFormat::Png, 90).expect("encode png");
        assert_eq!(sniff_format(&bytes), Some(ExportFormat::Png));
        assert_eq!(decode(&bytes).expect("decode png"), src);
    }

    #[test]
    fn webp_is_lossless() {
        let src = gradient(8, 8);
        let bytes = encode(&src, ExportFormat::Webp, 10).expect("encode webp");
        assert_eq!(sniff_format(&bytes), Some(ExportFormat::Webp));
        assert_eq!(decode(&bytes).expect("decode webp"), src);
    }

    #[test]
    fn jpeg_quality_changes_size() {
        let src = gradient(64, 64);
        let low = estimate_encoded_size(&src, ExportFormat::Jpeg, 5).expect("low");
        let high = estimate_encoded_size(&src, ExportFormat::Jpeg, 100).expect("high");
        assert!(low < high, "low={low} high={high}");
        let bytes = encode(&src, ExportFormat::Jpeg, 80).expect("jpeg");
        assert_eq!(decode(&bytes).expect("decode").dimensions(), (64, 64));
    }

    #[test]
    fn format_names_and_extensions_parse() {
        assert_eq!(ExportFormat::from_name("JPG"), Some(ExportFormat::Jpeg));
        assert_eq!(ExportFormat::from_name(".webp"), Some(ExportFormat::Webp));
        assert_eq!(ExportFormat::from_path(Path::new("a/b/out.png")), Some(ExportFormat::Png));
        assert_eq!(ExportFormat::from_name("tiff"), None);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode(b"definitely not an image").is_err());
    }
}

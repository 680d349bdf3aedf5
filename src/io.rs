// ============================================================================
// RASTER I/O: base64 interchange and file codecs
// ============================================================================
//
// Every raster that crosses a component boundary travels as a base64-encoded
// single image.  Masks and composites are always PNG; the base layer keeps
// whatever format it was loaded in.

use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::Path;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, GrayImage, ImageFormat, ImageOutputFormat, RgbaImage};

/// JPEG quality used when the caller does not pick one.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Error type for raster encode/decode.
#[derive(Debug)]
pub enum RasterError {
    Base64(String),
    Decode(String),
    Encode(String),
    Io(std::io::Error),
}

impl std::fmt::Display for RasterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RasterError::Base64(e) => write!(f, "Failed to decode base64: {}", e),
            RasterError::Decode(e) => write!(f, "Failed to load image: {}", e),
            RasterError::Encode(e) => write!(f, "Failed to encode image: {}", e),
            RasterError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for RasterError {}

impl From<std::io::Error> for RasterError {
    fn from(e: std::io::Error) -> Self {
        RasterError::Io(e)
    }
}

impl From<base64::DecodeError> for RasterError {
    fn from(e: base64::DecodeError) -> Self {
        RasterError::Base64(e.to_string())
    }
}

/// Output formats accepted for exports and patch composites.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl ExportFormat {
    /// Anything unrecognised falls back to PNG.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "jpg" | "jpeg" => ExportFormat::Jpeg,
            "webp" => ExportFormat::Webp,
            _ => ExportFormat::Png,
        }
    }

    /// Infer from a file extension, defaulting to PNG.
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::parse)
            .unwrap_or_default()
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Webp => "webp",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpeg",
            ExportFormat::Webp => "webp",
        }
    }
}

// ============================================================================
// BASE64
// ============================================================================

pub fn decode_base64_image(data: &str) -> Result<RgbaImage, RasterError> {
    // Tolerate data URLs ("data:image/png;base64,....").
    let payload = match data.find(";base64,") {
        Some(idx) => &data[idx + ";base64,".len()..],
        None => data,
    };
    let bytes = STANDARD.decode(payload.trim())?;
    decode_image_bytes(&bytes)
}

pub fn decode_image_bytes(bytes: &[u8]) -> Result<RgbaImage, RasterError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| RasterError::Decode(e.to_string()))
}

pub fn encode_base64_image(image: &RgbaImage, format: ExportFormat) -> Result<String, RasterError> {
    let bytes = encode_image_bytes(image, format)?;
    Ok(STANDARD.encode(bytes))
}

pub fn encode_png_base64(image: &RgbaImage) -> Result<String, RasterError> {
    encode_base64_image(image, ExportFormat::Png)
}

/// Masks go over the wire as 8-bit grayscale PNGs.
pub fn encode_mask_base64(mask: &GrayImage) -> Result<String, RasterError> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(mask.clone())
        .write_to(&mut buffer, ImageOutputFormat::Png)
        .map_err(|e| RasterError::Encode(e.to_string()))?;
    Ok(STANDARD.encode(buffer.into_inner()))
}

pub fn encode_image_bytes(image: &RgbaImage, format: ExportFormat) -> Result<Vec<u8>, RasterError> {
    let mut buffer = Cursor::new(Vec::new());
    let dyn_img = DynamicImage::ImageRgba8(image.clone());
    let result = match format {
        ExportFormat::Png => dyn_img.write_to(&mut buffer, ImageOutputFormat::Png),
        ExportFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(dyn_img.to_rgb8());
            rgb.write_to(&mut buffer, ImageOutputFormat::Jpeg(DEFAULT_JPEG_QUALITY))
        }
        // Needs an encoder-enabled build of `image`; otherwise this is an
        // `Unsupported` encode error at runtime.
        ExportFormat::Webp => dyn_img.write_to(&mut buffer, ImageFormat::WebP),
    };
    result.map_err(|e| RasterError::Encode(e.to_string()))?;
    Ok(buffer.into_inner())
}

// ============================================================================
// FILES
// ============================================================================

pub fn load_image(path: &Path) -> Result<RgbaImage, RasterError> {
    let bytes = std::fs::read(path)?;
    decode_image_bytes(&bytes)
}

/// Read a file and hand back its bytes as base64 along with the decoded
/// dimensions, keeping the source format intact.
pub fn load_image_base64(path: &Path) -> Result<(String, u32, u32), RasterError> {
    let bytes = std::fs::read(path)?;
    let img = decode_image_bytes(&bytes)?;
    Ok((STANDARD.encode(&bytes), img.width(), img.height()))
}

pub fn save_image(image: &RgbaImage, path: &Path, format: ExportFormat) -> Result<(), RasterError> {
    use std::io::Write;

    let bytes = encode_image_bytes(image, format)?;
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

pub fn save_mask(mask: &GrayImage, path: &Path) -> Result<(), RasterError> {
    mask.save_with_format(path, ImageFormat::Png)
        .map_err(|e| RasterError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    #[test]
    fn png_base64_preserves_pixels() {
        let mut img = RgbaImage::new(3, 2);
        img.put_pixel(1, 1, Rgba([10, 20, 30, 128]));
        let encoded = encode_png_base64(&img).unwrap();
        let decoded = decode_base64_image(&encoded).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn data_url_prefix_is_accepted() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([1, 2, 3, 255]));
        let encoded = format!("data:image/png;base64,{}", encode_png_base64(&img).unwrap());
        assert_eq!(decode_base64_image(&encoded).unwrap(), img);
    }

    #[test]
    fn corrupt_payloads_are_typed_errors() {
        assert!(matches!(decode_base64_image("@@not base64@@"), Err(RasterError::Base64(_))));
        let not_an_image = STANDARD.encode(b"hello world");
        assert!(matches!(decode_base64_image(&not_an_image), Err(RasterError::Decode(_))));
    }

    #[test]
    fn mask_encodes_as_grayscale_png() {
        let mask = GrayImage::from_pixel(4, 4, Luma([255]));
        let encoded = encode_mask_base64(&mask).unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!(img.color(), image::ColorType::L8);
    }

    #[test]
    fn jpeg_export_drops_alpha_without_failing() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([200, 10, 10, 100]));
        let bytes = encode_image_bytes(&img, ExportFormat::Jpeg).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn format_parsing_defaults_to_png() {
        assert_eq!(ExportFormat::parse("JPG"), ExportFormat::Jpeg);
        assert_eq!(ExportFormat::parse("webp"), ExportFormat::Webp);
        assert_eq!(ExportFormat::parse("tiff"), ExportFormat::Png);
        assert_eq!(ExportFormat::from_path(Path::new("out.jpeg")), ExportFormat::Jpeg);
        assert_eq!(ExportFormat::from_path(Path::new("noext")), ExportFormat::Png);
    }

    #[test]
    fn save_and_load_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        let img = RgbaImage::from_pixel(5, 4, Rgba([9, 8, 7, 255]));
        save_image(&img, &path, ExportFormat::Png).unwrap();
        assert_eq!(load_image(&path).unwrap(), img);
        let (b64, w, h) = load_image_base64(&path).unwrap();
        assert_eq!((w, h), (5, 4));
        assert_eq!(decode_base64_image(&b64).unwrap(), img);
    }
}

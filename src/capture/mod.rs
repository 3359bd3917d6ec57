//! Image Ingestion Layer
//!
//! Decodes uploaded image files (PNG, JPEG, anything the `image` crate
//! reads) and camera frames into [`DocumentImage`] before preprocessing.

pub mod frame;

use image::{ColorType, DynamicImage, ImageFormat, ImageReader};
use serde::Serialize;
use std::io::{BufRead, Cursor, Seek};
use std::path::Path;
use tracing::debug;

use crate::errors::OcrError;
use crate::vision::image::DocumentImage;

pub use frame::{CapturedFrame, PixelLayout};

/// Basic facts about a decoded image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageDetails {
    /// Container format ("PNG", "JPEG", ...) when it could be determined
    pub format: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Pixel mode ("L", "RGB", "RGBA", ...)
    pub mode: String,
}

/// A decoded image and its details
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub image: DocumentImage,
    pub details: ImageDetails,
}

/// Decode an image file
pub fn load_image(path: &Path) -> Result<LoadedImage, OcrError> {
    let reader = ImageReader::open(path)
        .map_err(|e| OcrError::PreprocessingFailed(format!("cannot open {}: {}", path.display(), e)))?;
    decode(reader, &path.display().to_string())
}

/// Decode an in-memory image (an upload body, a clipboard paste)
pub fn load_image_bytes(bytes: &[u8]) -> Result<LoadedImage, OcrError> {
    decode(ImageReader::new(Cursor::new(bytes)), "in-memory image")
}

fn decode<R: BufRead + Seek>(reader: ImageReader<R>, source: &str) -> Result<LoadedImage, OcrError> {
    let reader = reader
        .with_guessed_format()
        .map_err(|e| OcrError::PreprocessingFailed(format!("cannot read {}: {}", source, e)))?;
    let format = reader.format();

    let decoded = reader
        .decode()
        .map_err(|e| OcrError::PreprocessingFailed(format!("cannot decode {}: {}", source, e)))?;

    let details = image_details(&decoded, format);
    debug!(
        "Loaded {} ({:?} {}x{} {})",
        source, details.format, details.width, details.height, details.mode
    );

    Ok(LoadedImage {
        image: DocumentImage::from_dynamic(decoded),
        details,
    })
}

/// Details of a decoded image
pub fn image_details(image: &DynamicImage, format: Option<ImageFormat>) -> ImageDetails {
    ImageDetails {
        format: format.map(|f| format!("{:?}", f).to_uppercase()),
        width: image.width(),
        height: image.height(),
        mode: color_mode(image.color()).to_string(),
    }
}

fn color_mode(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 => "L",
        ColorType::La8 => "LA",
        ColorType::Rgb8 => "RGB",
        ColorType::Rgba8 => "RGBA",
        ColorType::L16 => "I;16",
        ColorType::La16 => "LA;16",
        ColorType::Rgb16 => "RGB;16",
        ColorType::Rgba16 => "RGBA;16",
        ColorType::Rgb32F => "RGB;F",
        ColorType::Rgba32F => "RGBA;F",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::image::ColorSpace;
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    fn png_bytes() -> Vec<u8> {
        let img = RgbaImage::from_pixel(6, 4, Rgba([200, 100, 50, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_load_image_bytes() {
        let loaded = load_image_bytes(&png_bytes()).unwrap();
        assert_eq!(loaded.details.format.as_deref(), Some("PNG"));
        assert_eq!((loaded.details.width, loaded.details.height), (6, 4));
        assert_eq!(loaded.details.mode, "RGBA");
        assert_eq!(loaded.image.color_space(), ColorSpace::Rgb);
    }

    #[test]
    fn test_load_image_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.png");
        std::fs::write(&path, png_bytes()).unwrap();

        let loaded = load_image(&path).unwrap();
        assert_eq!(loaded.image.width(), 6);
    }

    #[test]
    fn test_garbage_bytes_fail_preprocessing() {
        let err = load_image_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, OcrError::PreprocessingFailed(_)));
    }

    #[test]
    fn test_missing_file_fails() {
        let err = load_image(Path::new("/nonexistent/scan.jpg")).unwrap_err();
        assert!(matches!(err, OcrError::PreprocessingFailed(_)));
    }
}

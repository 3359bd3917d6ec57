//! Document image representation
//!
//! Every preprocessing stage produces a new [`DocumentImage`]; nothing is
//! mutated in place once captured.

use image::{DynamicImage, GrayImage, RgbImage};
use serde::Serialize;

/// Color space tag of a document image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    Rgb,
    Grayscale,
    /// Single channel holding only 0 and 255
    Binary,
}

/// A 2-D pixel grid, either 3-channel RGB or single channel
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentImage {
    Rgb(RgbImage),
    Gray(GrayImage),
    Binary(GrayImage),
}

impl DocumentImage {
    /// Normalize any decoded image into the internal representation.
    /// Alpha is dropped; 8-bit luma inputs stay single channel.
    pub fn from_dynamic(image: DynamicImage) -> Self {
        match image {
            DynamicImage::ImageLuma8(gray) => DocumentImage::Gray(gray),
            DynamicImage::ImageRgb8(rgb) => DocumentImage::Rgb(rgb),
            other if other.color().channel_count() <= 2 => DocumentImage::Gray(other.to_luma8()),
            other => DocumentImage::Rgb(other.to_rgb8()),
        }
    }

    /// Build from raw RGB bytes (row-major, 3 bytes per pixel)
    pub fn from_rgb_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(DocumentImage::Rgb)
    }

    pub fn width(&self) -> u32 {
        match self {
            DocumentImage::Rgb(img) => img.width(),
            DocumentImage::Gray(img) | DocumentImage::Binary(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            DocumentImage::Rgb(img) => img.height(),
            DocumentImage::Gray(img) | DocumentImage::Binary(img) => img.height(),
        }
    }

    /// Number of channels (3 for RGB, 1 otherwise)
    pub fn channels(&self) -> u8 {
        match self {
            DocumentImage::Rgb(_) => 3,
            DocumentImage::Gray(_) | DocumentImage::Binary(_) => 1,
        }
    }

    pub fn color_space(&self) -> ColorSpace {
        match self {
            DocumentImage::Rgb(_) => ColorSpace::Rgb,
            DocumentImage::Gray(_) => ColorSpace::Grayscale,
            DocumentImage::Binary(_) => ColorSpace::Binary,
        }
    }

    pub fn is_single_channel(&self) -> bool {
        self.channels() == 1
    }

    /// Borrow the single-channel buffer, if any
    pub fn as_gray(&self) -> Option<&GrayImage> {
        match self {
            DocumentImage::Rgb(_) => None,
            DocumentImage::Gray(img) | DocumentImage::Binary(img) => Some(img),
        }
    }

    /// Convert to an `image` crate value for encoding or model input
    pub fn to_dynamic(&self) -> DynamicImage {
        match self {
            DocumentImage::Rgb(img) => DynamicImage::ImageRgb8(img.clone()),
            DocumentImage::Gray(img) | DocumentImage::Binary(img) => {
                DynamicImage::ImageLuma8(img.clone())
            }
        }
    }

    /// Expand to RGB (gray values replicated into each channel)
    pub fn to_rgb(&self) -> RgbImage {
        match self {
            DocumentImage::Rgb(img) => img.clone(),
            DocumentImage::Gray(img) | DocumentImage::Binary(img) => {
                DynamicImage::ImageLuma8(img.clone()).to_rgb8()
            }
        }
    }

    /// Encode as PNG bytes
    pub fn to_png_bytes(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut bytes = Vec::new();
        self.to_dynamic()
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        Ok(bytes)
    }
}

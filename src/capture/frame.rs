//! Raw camera frames

use std::time::Instant;

use crate::errors::OcrError;
use crate::vision::image::DocumentImage;

/// Byte order of a frame's pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb,
    Rgba,
    /// Common for camera drivers
    Bgr,
    Bgra,
}

impl PixelLayout {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelLayout::Rgb | PixelLayout::Bgr => 3,
            PixelLayout::Rgba | PixelLayout::Bgra => 4,
        }
    }
}

/// A still frame handed over by a camera integration
#[derive(Debug)]
pub struct CapturedFrame {
    /// Packed pixel data, row-major, no padding
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    /// When the frame was grabbed
    pub timestamp: Instant,
}

impl CapturedFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, layout: PixelLayout) -> Self {
        Self {
            data,
            width,
            height,
            layout,
            timestamp: Instant::now(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Convert to an RGB document image, dropping alpha
    pub fn to_document_image(&self) -> Result<DocumentImage, OcrError> {
        let bpp = self.layout.bytes_per_pixel();
        let expected = self.width as usize * self.height as usize * bpp;
        if self.data.len() != expected {
            return Err(OcrError::PreprocessingFailed(format!(
                "frame is {} bytes, expected {} for {}x{} {:?}",
                self.data.len(),
                expected,
                self.width,
                self.height,
                self.layout
            )));
        }

        let swap = matches!(self.layout, PixelLayout::Bgr | PixelLayout::Bgra);
        let rgb: Vec<u8> = self
            .data
            .chunks_exact(bpp)
            .flat_map(|px| if swap { [px[2], px[1], px[0]] } else { [px[0], px[1], px[2]] })
            .collect();

        DocumentImage::from_rgb_raw(self.width, self.height, rgb).ok_or_else(|| {
            OcrError::PreprocessingFailed("frame buffer does not match its dimensions".to_string())
        })
    }
}

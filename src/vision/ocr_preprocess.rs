//! Image preprocessing filters for OCR optimization
//!
//! Turns a photographed or scanned page into a high-contrast, single-channel
//! image. Steps run in a fixed order:
//!
//! 1. grayscale (if enabled)
//! 2. CLAHE contrast equalization (if enabled)
//! 3. bilateral smoothing (always)
//! 4. Gaussian adaptive threshold (always)
//! 5. non-local-means denoising (if enabled)
//! 6. dilation (always; kernel 1 is a no-op)
//!
//! CLAHE and thresholding need one channel. When a color image reaches
//! either step it is converted to luminance there and a
//! [`PreprocessWarning`] is recorded; it is never rejected.

use serde::Serialize;
use std::time::Instant;
use tracing::{debug, warn};

use super::filters;
use super::image::DocumentImage;
use crate::config::PreprocessingConfig;
use crate::errors::OcrError;

/// CLAHE tile grid (tiles per axis)
pub const CLAHE_TILE_GRID: u32 = 8;
/// Bilateral filter window diameter
pub const BILATERAL_DIAMETER: u32 = 9;
/// Bilateral filter sigma for both color and space
pub const BILATERAL_SIGMA: f32 = 75.0;
/// Adaptive threshold neighbourhood size
pub const THRESHOLD_BLOCK_SIZE: u32 = 11;
/// Constant subtracted from the local mean
pub const THRESHOLD_OFFSET: f32 = 2.0;
/// Non-local-means filter strength
pub const DENOISE_STRENGTH: f32 = 3.0;
pub const DENOISE_TEMPLATE_WINDOW: u32 = 7;
pub const DENOISE_SEARCH_WINDOW: u32 = 21;

/// Conversion the preprocessor had to make that the flags did not ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessWarning {
    /// `contrast` was requested on a color image with `grayscale` off
    ContrastForcedGrayscale,
    /// Color image reached binarization and was converted to luminance
    ThresholdForcedGrayscale,
}

/// Result of preprocessing
#[derive(Debug, Clone)]
pub struct PreprocessResult {
    /// Processed single-channel image
    pub image: DocumentImage,
    /// Implicit conversions applied along the way
    pub warnings: Vec<PreprocessWarning>,
}

/// Run the preprocessing pipeline. Pure function of `(image, settings)`.
pub fn preprocess(image: &DocumentImage, settings: &PreprocessingConfig) -> Result<PreprocessResult, OcrError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(OcrError::PreprocessingFailed(format!(
            "image has no pixels ({}x{})",
            image.width(),
            image.height()
        )));
    }

    let start = Instant::now();
    debug!(
        "OCR preprocessing {}x{} {:?}: grayscale={}, contrast={} (level {}), denoise={}, dilate={}",
        image.width(),
        image.height(),
        image.color_space(),
        settings.grayscale,
        settings.contrast,
        settings.contrast_level,
        settings.denoise,
        settings.dilate_kernel
    );

    let mut warnings = Vec::new();

    // 1. Grayscale
    let mut current = if settings.grayscale {
        to_gray(image)
    } else {
        image.clone()
    };

    // 2. Contrast (needs one channel)
    if settings.contrast {
        if !current.is_single_channel() {
            warn!("Contrast enhancement requested on a color image; converting to grayscale first");
            warnings.push(PreprocessWarning::ContrastForcedGrayscale);
            current = to_gray(&current);
        }
        if let Some(gray) = current.as_gray() {
            let equalized = filters::clahe(gray, settings.effective_contrast_level(), CLAHE_TILE_GRID);
            current = DocumentImage::Gray(equalized);
        }
    }

    // 3. Edge-preserving smoothing
    current = match &current {
        DocumentImage::Rgb(rgb) => DocumentImage::Rgb(filters::bilateral_rgb(
            rgb,
            BILATERAL_DIAMETER,
            BILATERAL_SIGMA,
            BILATERAL_SIGMA,
        )),
        DocumentImage::Gray(gray) | DocumentImage::Binary(gray) => DocumentImage::Gray(
            filters::bilateral_gray(gray, BILATERAL_DIAMETER, BILATERAL_SIGMA, BILATERAL_SIGMA),
        ),
    };

    // 4. Adaptive threshold (needs one channel)
    let gray = match current {
        DocumentImage::Rgb(rgb) => {
            warn!("Binarizing a color image; converting to grayscale");
            warnings.push(PreprocessWarning::ThresholdForcedGrayscale);
            filters::luminance(&rgb)
        }
        DocumentImage::Gray(gray) | DocumentImage::Binary(gray) => gray,
    };
    let binary = filters::adaptive_threshold_gaussian(&gray, THRESHOLD_BLOCK_SIZE, THRESHOLD_OFFSET);
    current = DocumentImage::Binary(binary);

    // 5. Denoise; output is no longer strictly two-valued
    if settings.denoise {
        if let Some(gray) = current.as_gray() {
            current = DocumentImage::Gray(filters::non_local_means(
                gray,
                DENOISE_STRENGTH,
                DENOISE_TEMPLATE_WINDOW,
                DENOISE_SEARCH_WINDOW,
            ));
        }
    }

    // 6. Dilation
    let kernel = settings.effective_dilate_kernel();
    current = match current {
        DocumentImage::Binary(img) => DocumentImage::Binary(filters::dilate(&img, kernel)),
        DocumentImage::Gray(img) => DocumentImage::Gray(filters::dilate(&img, kernel)),
        rgb @ DocumentImage::Rgb(_) => rgb,
    };

    debug!("OCR preprocessing complete in {:?}", start.elapsed());

    Ok(PreprocessResult {
        image: current,
        warnings,
    })
}

fn to_gray(image: &DocumentImage) -> DocumentImage {
    match image {
        DocumentImage::Rgb(rgb) => DocumentImage::Gray(filters::luminance(rgb)),
        other => other.clone(),
    }
}

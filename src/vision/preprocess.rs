//! Tensor preparation for the neural engine
//!
//! Resizing, normalization and layout conversion for the PaddleOCR
//! detection and recognition models.

use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::{Array3, Array4};

/// PaddleOCR maps [0, 255] to [-1, 1]: (pixel / 255 - 0.5) / 0.5
pub const PADDLE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const PADDLE_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Detector input sides must be multiples of this
const DET_STRIDE: u32 = 32;

/// Detection tensor plus what is needed to map boxes back
#[derive(Debug, Clone)]
pub struct DetectionInput {
    /// NCHW tensor, batch size 1
    pub tensor: Array4<f32>,
    /// Width and height fed to the model
    pub resized: (u32, u32),
    /// Source pixels per model pixel on each axis
    pub ratio: (f32, f32),
}

/// Convert an RGB image to an HWC f32 array in [0, 1]
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    Array3::from_shape_fn(image.dim(), |(y, x, c)| (image[[y, x, c]] - mean[c]) / std[c])
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    Array4::from_shape_fn((1, c, h, w), |(_, ch, y, x)| image[[y, x, ch]])
}

/// Model input size for detection: longest side at most `max_side`,
/// both sides rounded to the stride.
pub fn detection_size(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height).max(1);
    let scale = (max_side as f32 / longest as f32).min(1.0);
    let round = |v: u32| {
        let scaled = (v as f32 * scale).round() as u32;
        (scaled.div_ceil(DET_STRIDE) * DET_STRIDE).max(DET_STRIDE)
    };
    (round(width), round(height))
}

/// Build the detector input
pub fn detection_input(image: &RgbImage, max_side: u32) -> DetectionInput {
    let (w, h) = image.dimensions();
    let (new_w, new_h) = detection_size(w, h, max_side);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let normalized = normalize(&rgb_to_f32(&resized), &PADDLE_MEAN, &PADDLE_STD);

    DetectionInput {
        tensor: hwc_to_nchw(&normalized),
        resized: (new_w, new_h),
        ratio: (w as f32 / new_w as f32, h as f32 / new_h as f32),
    }
}

/// Build the recognizer input for one text crop: fixed height, width
/// following the aspect ratio up to `max_width`.
pub fn recognition_input(crop: &RgbImage, target_height: u32, max_width: u32) -> Array4<f32> {
    let (w, h) = crop.dimensions();
    let aspect = w as f32 / h.max(1) as f32;
    let new_w = ((target_height as f32 * aspect).ceil() as u32).clamp(DET_STRIDE / 4, max_width);
    let resized = imageops::resize(crop, new_w, target_height, FilterType::Triangle);

    let normalized = normalize(&rgb_to_f32(&resized), &PADDLE_MEAN, &PADDLE_STD);
    hwc_to_nchw(&normalized)
}

/// Copy a rectangle `(x, y, width, height)` out of `image`, clipped to its
/// bounds. Returns `None` when nothing of the rectangle is inside.
pub fn crop(image: &RgbImage, bounds: (u32, u32, u32, u32)) -> Option<RgbImage> {
    let (img_w, img_h) = image.dimensions();
    let (x, y, w, h) = bounds;
    if x >= img_w || y >= img_h {
        return None;
    }
    let w = w.min(img_w - x);
    let h = h.min(img_h - y);
    if w == 0 || h == 0 {
        return None;
    }
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

//! Pixel-level filters used by the OCR preprocessor
//!
//! All functions take a borrowed buffer and return a new one. Border pixels
//! are handled by clamping coordinates (replicate border).

use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;

/// Convert RGB to single-channel luminance (ITU-R BT.601 weights)
pub fn luminance(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        let gray = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        Luma([gray.round().clamp(0.0, 255.0) as u8])
    })
}

/// Contrast-limited adaptive histogram equalization.
///
/// `clip_limit` is relative to a uniform histogram (same meaning as the
/// OpenCV parameter); `grid` is the number of tiles per axis.
pub fn clahe(image: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let grid = grid.max(1);
    let tile_w = width.div_ceil(grid).max(1);
    let tile_h = height.div_ceil(grid).max(1);
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    // One 256-entry lookup table per tile
    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[image.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            let area = (x1 - x0) * (y1 - y0);
            clip_histogram(&mut hist, clip_limit, area);

            let lut = &mut luts[(ty * tiles_x + tx) as usize];
            let scale = 255.0 / area.max(1) as f32;
            let mut cdf = 0u32;
            for (value, count) in hist.iter().enumerate() {
                cdf += count;
                lut[value] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    let lut_index = |tx: i64, ty: i64| -> usize {
        let tx = tx.clamp(0, tiles_x as i64 - 1) as u32;
        let ty = ty.clamp(0, tiles_y as i64 - 1) as u32;
        (ty * tiles_x + tx) as usize
    };

    // Bilinear interpolation between the four surrounding tile mappings
    GrayImage::from_fn(width, height, |x, y| {
        let v = image.get_pixel(x, y)[0] as usize;
        let gx = x as f32 / tile_w as f32 - 0.5;
        let gy = y as f32 / tile_h as f32 - 0.5;
        let tx = gx.floor();
        let ty = gy.floor();
        let fx = gx - tx;
        let fy = gy - ty;
        let (tx, ty) = (tx as i64, ty as i64);

        let lut = |tx: i64, ty: i64| luts[lut_index(tx, ty)][v] as f32;
        let top = lut(tx, ty) * (1.0 - fx) + lut(tx + 1, ty) * fx;
        let bottom = lut(tx, ty + 1) * (1.0 - fx) + lut(tx + 1, ty + 1) * fx;
        Luma([(top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8])
    })
}

/// Clip a tile histogram and redistribute the excess evenly
fn clip_histogram(hist: &mut [u32; 256], clip_limit: f32, area: u32) {
    if clip_limit <= 0.0 {
        return;
    }
    let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);

    let mut excess = 0u32;
    for count in hist.iter_mut() {
        if *count > limit {
            excess += *count - limit;
            *count = limit;
        }
    }

    let per_bin = excess / 256;
    let residual = excess % 256;
    for count in hist.iter_mut() {
        *count += per_bin;
    }
    if residual > 0 {
        let step = (256 / residual).max(1) as usize;
        let mut left = residual;
        let mut i = 0usize;
        while left > 0 && i < 256 {
            hist[i] += 1;
            left -= 1;
            i += step;
        }
    }
}

/// Edge-preserving bilateral filter over a circular window.
///
/// `diameter` is the window width in pixels, `sigma_color` weighs intensity
/// differences and `sigma_space` weighs distance from the center.
pub fn bilateral_gray(image: &GrayImage, diameter: u32, sigma_color: f32, sigma_space: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    let offsets = spatial_kernel(diameter, sigma_space);
    let color_lut = color_weights(sigma_color, 1);

    GrayImage::from_fn(width, height, |x, y| {
        let center = image.get_pixel(x, y)[0] as i32;
        let mut sum = 0.0f32;
        let mut norm = 0.0f32;
        for &(dx, dy, spatial) in &offsets {
            let v = image.get_pixel(clamp_coord(x, dx, width), clamp_coord(y, dy, height))[0] as i32;
            let w = spatial * color_lut[(v - center).unsigned_abs() as usize];
            sum += w * v as f32;
            norm += w;
        }
        Luma([(sum / norm).round().clamp(0.0, 255.0) as u8])
    })
}

/// Bilateral filter on a 3-channel image; color distance is the sum of
/// absolute channel differences.
pub fn bilateral_rgb(image: &RgbImage, diameter: u32, sigma_color: f32, sigma_space: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let offsets = spatial_kernel(diameter, sigma_space);
    let color_lut = color_weights(sigma_color, 3);

    RgbImage::from_fn(width, height, |x, y| {
        let c = image.get_pixel(x, y);
        let mut sum = [0.0f32; 3];
        let mut norm = 0.0f32;
        for &(dx, dy, spatial) in &offsets {
            let p = image.get_pixel(clamp_coord(x, dx, width), clamp_coord(y, dy, height));
            let dist: u32 = (0..3)
                .map(|i| (p[i] as i32 - c[i] as i32).unsigned_abs())
                .sum();
            let w = spatial * color_lut[dist as usize];
            for i in 0..3 {
                sum[i] += w * p[i] as f32;
            }
            norm += w;
        }
        image::Rgb(sum.map(|s| (s / norm).round().clamp(0.0, 255.0) as u8))
    })
}

fn spatial_kernel(diameter: u32, sigma_space: f32) -> Vec<(i32, i32, f32)> {
    let radius = (diameter.max(1) / 2) as i32;
    let coeff = -0.5 / (sigma_space * sigma_space);
    let mut offsets = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f32;
            if r2.sqrt() > radius as f32 {
                continue;
            }
            offsets.push((dx, dy, (r2 * coeff).exp()));
        }
    }
    offsets
}

fn color_weights(sigma_color: f32, channels: usize) -> Vec<f32> {
    let coeff = -0.5 / (sigma_color * sigma_color);
    (0..=255 * channels)
        .map(|d| ((d * d) as f32 * coeff).exp())
        .collect()
}

/// Adaptive threshold against a Gaussian-weighted local mean.
///
/// A pixel becomes 255 when it is brighter than `mean - offset`, else 0.
/// `block_size` must be odd; even sizes are bumped to the next odd value.
pub fn adaptive_threshold_gaussian(image: &GrayImage, block_size: u32, offset: f32) -> GrayImage {
    let block = (block_size | 1).max(3);
    let radius = (block / 2) as i32;
    // Same sigma OpenCV derives from the kernel size
    let sigma = 0.3 * ((block as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let kernel = gaussian_kernel(radius, sigma);

    let mean = separable_blur(image, &kernel);
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let idx = (y * width + x) as usize;
        let v = image.get_pixel(x, y)[0] as f32;
        if v > mean[idx].round() - offset {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

fn gaussian_kernel(radius: i32, sigma: f32) -> Vec<f32> {
    let coeff = -0.5 / (sigma * sigma);
    let raw: Vec<f32> = (-radius..=radius)
        .map(|i| ((i * i) as f32 * coeff).exp())
        .collect();
    let total: f32 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

/// Separable convolution with a symmetric kernel; returns row-major floats
fn separable_blur(image: &GrayImage, kernel: &[f32]) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let radius = (kernel.len() / 2) as i32;
    let (w, h) = (width as usize, height as usize);

    let mut horizontal = vec![0.0f32; w * h];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = clamp_coord(x, k as i32 - radius, width);
                acc += weight * image.get_pixel(sx, y)[0] as f32;
            }
            horizontal[y as usize * w + x as usize] = acc;
        }
    }

    let mut out = vec![0.0f32; w * h];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = clamp_coord(y, k as i32 - radius, height);
                acc += weight * horizontal[sy as usize * w + x as usize];
            }
            out[y as usize * w + x as usize] = acc;
        }
    }
    out
}

/// Non-local-means denoising.
///
/// Every pixel is replaced by a weighted average of the pixels in a
/// `search_window` neighbourhood, weighted by how similar their
/// `template_window` patches are. `h` controls filter strength.
/// Patch distances are computed per search offset with an integral image,
/// so the cost is O(pixels x search_window^2).
pub fn non_local_means(image: &GrayImage, h: f32, template_window: u32, search_window: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let tr = (template_window / 2) as i32;
    let sr = (search_window / 2) as i32;
    let (w, hgt) = (width as i32, height as i32);
    let patch_area = ((2 * tr + 1) * (2 * tr + 1)) as f32;
    let inv_h2 = 1.0 / (h * h).max(f32::EPSILON);

    // Replicate-padded copy so the inner loops never clamp
    let margin = tr + sr;
    let pw = w + 2 * margin;
    let ph = hgt + 2 * margin;
    let padded: Vec<f32> = (0..ph)
        .flat_map(|py| {
            (0..pw).map(move |px| {
                let sx = (px - margin).clamp(0, w - 1) as u32;
                let sy = (py - margin).clamp(0, hgt - 1) as u32;
                image.get_pixel(sx, sy)[0] as f32
            })
        })
        .collect();
    let pixel = |x: i32, y: i32| -> f32 { padded[((y + margin) * pw + x + margin) as usize] };

    // Region covering every template window: image extended by `tr` on each side
    let rw = (w + 2 * tr) as usize;
    let rh = (hgt + 2 * tr) as usize;
    let mut integral = vec![0.0f64; (rw + 1) * (rh + 1)];
    let mut weight_sum = vec![0.0f32; (w * hgt) as usize];
    let mut value_sum = vec![0.0f32; (w * hgt) as usize];

    for dy in -sr..=sr {
        for dx in -sr..=sr {
            for ry in 0..rh {
                let mut row_acc = 0.0f64;
                for rx in 0..rw {
                    let ix = rx as i32 - tr;
                    let iy = ry as i32 - tr;
                    let d = pixel(ix, iy) - pixel(ix + dx, iy + dy);
                    row_acc += (d * d) as f64;
                    integral[(ry + 1) * (rw + 1) + rx + 1] = integral[ry * (rw + 1) + rx + 1] + row_acc;
                }
            }

            let span = (2 * tr + 1) as usize;
            for y in 0..hgt as usize {
                for x in 0..w as usize {
                    let a = integral[y * (rw + 1) + x];
                    let b = integral[y * (rw + 1) + x + span];
                    let c = integral[(y + span) * (rw + 1) + x];
                    let d = integral[(y + span) * (rw + 1) + x + span];
                    let dist = ((d - b - c + a) as f32 / patch_area).max(0.0);
                    let weight = (-dist * inv_h2).exp();
                    let idx = y * w as usize + x;
                    weight_sum[idx] += weight;
                    value_sum[idx] += weight * pixel(x as i32 + dx, y as i32 + dy);
                }
            }
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        let idx = (y * width + x) as usize;
        Luma([(value_sum[idx] / weight_sum[idx]).round().clamp(0.0, 255.0) as u8])
    })
}

/// Morphological dilation with a square `kernel_size` x `kernel_size` element.
/// A kernel of 1 leaves the image unchanged.
pub fn dilate(image: &GrayImage, kernel_size: u8) -> GrayImage {
    let radius = kernel_size.max(1) / 2;
    if radius == 0 {
        return image.clone();
    }
    imageproc::morphology::dilate(image, Norm::LInf, radius)
}

fn clamp_coord(base: u32, delta: i32, limit: u32) -> u32 {
    (base as i64 + delta as i64).clamp(0, limit as i64 - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| Luma([((x * 7 + y * 3) % 256) as u8]))
    }

    #[test]
    fn test_luminance_weights() {
        let img = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        assert_eq!(luminance(&img).get_pixel(0, 0)[0], 76);
    }

    #[test]
    fn test_clahe_uniform_image_stays_uniform() {
        let img = GrayImage::from_pixel(32, 32, Luma([100]));
        let out = clahe(&img, 2.0, 8);
        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));
    }

    #[test]
    fn test_clahe_stretches_low_contrast() {
        let img = GrayImage::from_fn(64, 64, |x, _| Luma([if x % 2 == 0 { 124 } else { 128 }]));
        let out = clahe(&img, 3.0, 8);
        let min = out.pixels().map(|p| p[0]).min().unwrap();
        let max = out.pixels().map(|p| p[0]).max().unwrap();
        assert!(max - min > 4);
    }

    #[test]
    fn test_clip_histogram_preserves_total() {
        let mut hist = [0u32; 256];
        hist[10] = 1000;
        hist[20] = 24;
        clip_histogram(&mut hist, 2.0, 1024);
        assert_eq!(hist.iter().sum::<u32>(), 1024);
        assert!(hist[10] < 1000);
    }

    #[test]
    fn test_bilateral_keeps_flat_region() {
        let img = GrayImage::from_pixel(10, 10, Luma([77]));
        let out = bilateral_gray(&img, 9, 75.0, 75.0);
        assert!(out.pixels().all(|p| p[0] == 77));
    }

    #[test]
    fn test_bilateral_preserves_strong_edge() {
        let img = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 0 } else { 255 }]));
        let out = bilateral_gray(&img, 9, 20.0, 75.0);
        assert!(out.get_pixel(8, 5)[0] < 20);
        assert!(out.get_pixel(11, 5)[0] > 235);
    }

    #[test]
    fn test_adaptive_threshold_is_binary() {
        let out = adaptive_threshold_gaussian(&gradient(30, 30), 11, 2.0);
        assert!(out.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn test_adaptive_threshold_dark_text_on_light() {
        let mut img = GrayImage::from_pixel(21, 21, Luma([220]));
        for y in 8..13 {
            img.put_pixel(10, y, Luma([30]));
        }
        let out = adaptive_threshold_gaussian(&img, 11, 2.0);
        assert_eq!(out.get_pixel(10, 10)[0], 0);
        assert_eq!(out.get_pixel(2, 2)[0], 255);
    }

    #[test]
    fn test_nlm_removes_isolated_speck() {
        let mut img = GrayImage::from_pixel(16, 16, Luma([255]));
        img.put_pixel(8, 8, Luma([0]));
        let out = non_local_means(&img, 30.0, 7, 11);
        assert!(out.get_pixel(8, 8)[0] > 128);
    }

    #[test]
    fn test_dilate_kernel_one_is_identity() {
        let img = gradient(12, 9);
        assert_eq!(dilate(&img, 1), img);
    }

    #[test]
    fn test_dilate_kernel_three_grows_bright() {
        let mut img = GrayImage::new(5, 5);
        img.put_pixel(2, 2, Luma([255]));
        let out = dilate(&img, 3);
        assert_eq!(out.get_pixel(1, 1)[0], 255);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
    }
}

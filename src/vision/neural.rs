//! Neural OCR engine (PaddleOCR via ONNX Runtime)
//!
//! Two-stage pipeline:
//! 1. DB text detection produces a probability map; connected regions
//!    above threshold become text boxes.
//! 2. Each box is cropped and fed to the recognizer, whose per-timestep
//!    class probabilities are CTC-decoded against the character list.
//!
//! The recognizer is language-agnostic; the requested language and mode do
//! not change its behavior.

use anyhow::{Context, Result};
use image::{GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array4;
use ort::value::Tensor;
use parking_lot::Mutex;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use super::engine::{EngineDetail, EngineKind, EngineResult, Language, OcrAdapter, OcrMode, TextRegion};
use super::image::DocumentImage;
use super::models::{ModelManager, ModelType, OnnxSession};
use super::preprocess;
use crate::config::NeuralEngineConfig;
use crate::errors::EngineError;

const KIND: EngineKind = EngineKind::Neural;

/// Recognizer input height
pub const REC_HEIGHT: u32 = 48;
/// Widest crop fed to the recognizer
pub const REC_MAX_WIDTH: u32 = 1280;
/// Boxes thinner than this (model pixels) are dropped
const MIN_BOX_SIDE: u32 = 3;
/// Boxes whose tops differ by less than this are on one line
const SAME_LINE_TOLERANCE: u32 = 10;

/// Detection post-processing parameters
#[derive(Debug, Clone, Copy)]
pub struct DetectionParams {
    pub det_threshold: f32,
    pub box_threshold: f32,
    pub unclip_ratio: f32,
    pub max_side: u32,
}

impl From<&NeuralEngineConfig> for DetectionParams {
    fn from(config: &NeuralEngineConfig) -> Self {
        Self {
            det_threshold: config.det_threshold,
            box_threshold: config.box_threshold,
            unclip_ratio: config.unclip_ratio,
            max_side: config.max_side,
        }
    }
}

/// PaddleOCR adapter. Sessions sit behind locks because ONNX Runtime
/// needs exclusive access per run.
pub struct PaddleOcr {
    detector: Mutex<OnnxSession>,
    recognizer: Mutex<OnnxSession>,
    /// Class index -> character; 0 is the CTC blank
    charset: Vec<String>,
    params: DetectionParams,
}

impl PaddleOcr {
    /// Resolve model files (downloading if allowed) and load both sessions
    pub fn new(config: &NeuralEngineConfig) -> Result<Self, EngineError> {
        let not_installed = |e: anyhow::Error| EngineError::NotInstalled {
            engine: KIND,
            reason: format!("{:#}", e),
        };

        let manager = ModelManager::new(config.models_dir.clone()).map_err(not_installed)?;
        let det = manager.ensure_model(ModelType::Detection).map_err(not_installed)?;
        let rec = manager.ensure_model(ModelType::Recognition).map_err(not_installed)?;
        let dict = manager
            .ensure_model(ModelType::CharacterDictionary)
            .map_err(not_installed)?;

        Self::from_files(&det, &rec, &dict, config).map_err(not_installed)
    }

    /// Load from explicit model paths
    pub fn from_files(det: &Path, rec: &Path, dict: &Path, config: &NeuralEngineConfig) -> Result<Self> {
        let dict_content = std::fs::read_to_string(dict)
            .with_context(|| format!("Failed to read character dictionary {:?}", dict))?;
        let charset = load_charset(&dict_content);

        let detector = OnnxSession::new(det, config.use_gpu)?;
        let recognizer = OnnxSession::new(rec, config.use_gpu)?;

        info!("PaddleOCR ready ({} recognizer classes)", charset.len());

        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
            charset,
            params: DetectionParams::from(config),
        })
    }

    /// Text boxes `(x, y, width, height)` in source pixels, reading order
    fn detect(&self, image: &RgbImage) -> Result<Vec<(u32, u32, u32, u32)>, EngineError> {
        let input = preprocess::detection_input(image, self.params.max_side);
        let (model_w, model_h) = input.resized;

        let (dims, probs) = infer(&self.detector, input.tensor)?;
        // [1, 1, H, W]
        let (map_h, map_w) = match dims.as_slice() {
            [.., h, w] => (*h, *w),
            _ => {
                return Err(EngineError::InvalidOutput {
                    engine: KIND,
                    reason: format!("unexpected detection output shape {:?}", dims),
                })
            }
        };
        if map_h * map_w > probs.len() || map_h != model_h as usize || map_w != model_w as usize {
            return Err(EngineError::InvalidOutput {
                engine: KIND,
                reason: format!("detection map {:?} does not match input {}x{}", dims, model_w, model_h),
            });
        }

        let boxes = boxes_from_probability_map(&probs[..map_h * map_w], model_w, model_h, &self.params);
        let (src_w, src_h) = image.dimensions();
        let mut scaled: Vec<(u32, u32, u32, u32)> = boxes
            .into_iter()
            .filter_map(|b| scale_box(b, input.ratio, (src_w, src_h)))
            .collect();
        sort_reading_order(&mut scaled);
        Ok(scaled)
    }

    fn recognize_crop(&self, crop: &RgbImage) -> Result<(String, f32), EngineError> {
        let tensor = preprocess::recognition_input(crop, REC_HEIGHT, REC_MAX_WIDTH);
        let (dims, probs) = infer(&self.recognizer, tensor)?;

        // [1, T, C] or [T, C]
        let (steps, classes) = match dims.as_slice() {
            [1, t, c] | [t, c] => (*t, *c),
            _ => {
                return Err(EngineError::InvalidOutput {
                    engine: KIND,
                    reason: format!("unexpected recognition output shape {:?}", dims),
                })
            }
        };
        if steps * classes > probs.len() {
            return Err(EngineError::InvalidOutput {
                engine: KIND,
                reason: format!("recognition output {:?} shorter than its shape", dims),
            });
        }

        Ok(ctc_greedy_decode(&probs, steps, classes, &self.charset))
    }
}

impl OcrAdapter for PaddleOcr {
    fn kind(&self) -> EngineKind {
        KIND
    }

    fn recognize(
        &self,
        image: &DocumentImage,
        _language: Language,
        _mode: OcrMode,
    ) -> Result<EngineResult, EngineError> {
        let start = Instant::now();
        let rgb = image.to_rgb();

        let boxes = self.detect(&rgb)?;
        debug!("PaddleOCR detected {} text boxes in {:?}", boxes.len(), start.elapsed());

        let mut regions = Vec::with_capacity(boxes.len());
        for bounds in boxes {
            let Some(crop) = preprocess::crop(&rgb, bounds) else {
                continue;
            };
            let (text, confidence) = self.recognize_crop(&crop)?;
            if text.trim().is_empty() {
                continue;
            }
            regions.push(TextRegion {
                text: text.trim().to_string(),
                bounds,
                confidence,
            });
        }

        let result = assemble(regions)?;
        debug!(
            "PaddleOCR recognized {} chars in {:?}, confidence {:.1}",
            result.text.chars().count(),
            start.elapsed(),
            result.confidence
        );
        Ok(result)
    }

    fn shutdown(&self) {
        debug!("Releasing PaddleOCR sessions");
    }
}

/// Join recognized regions into one result. A page without any readable
/// region is an engine failure so it never competes in fusion.
fn assemble(regions: Vec<TextRegion>) -> Result<EngineResult, EngineError> {
    if regions.is_empty() {
        return Err(EngineError::InvalidOutput {
            engine: KIND,
            reason: "no text regions".to_string(),
        });
    }

    let text = regions
        .iter()
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let confidence = regions.iter().map(|r| r.confidence).sum::<f32>() / regions.len() as f32 * 100.0;

    Ok(EngineResult {
        text,
        confidence,
        detail: EngineDetail::Neural { regions },
    })
}

/// Run one NCHW tensor through a session; returns output shape and data
fn infer(session: &Mutex<OnnxSession>, tensor: Array4<f32>) -> Result<(Vec<usize>, Vec<f32>), EngineError> {
    let (n, c, h, w) = tensor.dim();
    let (data, _offset) = tensor.into_raw_vec_and_offset();
    let value = Tensor::from_array(([n, c, h, w], data)).map_err(|e| EngineError::invocation(KIND, e))?;

    let mut guard = session.lock();
    let input_name = guard
        .primary_input()
        .map_err(|e| EngineError::invocation(KIND, e))?
        .to_string();
    let output_name = guard
        .primary_output()
        .map_err(|e| EngineError::invocation(KIND, e))?
        .to_string();

    let outputs = guard
        .session_mut()
        .run(ort::inputs![input_name.as_str() => value])
        .map_err(|e| EngineError::invocation(KIND, e))?;

    let (shape, values) = outputs[output_name.as_str()]
        .try_extract_tensor::<f32>()
        .map_err(|e| EngineError::InvalidOutput {
            engine: KIND,
            reason: e.to_string(),
        })?;

    // Copy out before the session lock is released
    let dims = shape.iter().map(|&d| d.max(0) as usize).collect();
    Ok((dims, values.to_vec()))
}

/// Build the class table: blank, the dictionary lines, then space
pub fn load_charset(content: &str) -> Vec<String> {
    let mut charset = vec![String::new()];
    charset.extend(
        content
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string),
    );
    charset.push(" ".to_string());
    charset
}

/// Greedy CTC decoding of per-step class probabilities.
///
/// Repeats collapse and blanks (class 0) are dropped. Confidence is the
/// mean probability of the emitted characters, 0 when none were emitted.
pub fn ctc_greedy_decode(probs: &[f32], steps: usize, classes: usize, charset: &[String]) -> (String, f32) {
    let mut text = String::new();
    let mut scores = Vec::new();
    let mut prev: Option<usize> = None;

    for step in probs.chunks_exact(classes).take(steps) {
        let (best, score) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

        if best != 0 && Some(best) != prev {
            if let Some(ch) = charset.get(best) {
                text.push_str(ch);
                scores.push(score.clamp(0.0, 1.0));
            }
        }
        prev = Some(best);
    }

    let confidence = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f32>() / scores.len() as f32
    };
    (text, confidence)
}

/// Text boxes `(x0, y0, x1, y1)` in model pixels from a detection map
pub fn boxes_from_probability_map(
    probs: &[f32],
    width: u32,
    height: u32,
    params: &DetectionParams,
) -> Vec<(f32, f32, f32, f32)> {
    let mask = GrayImage::from_fn(width, height, |x, y| {
        let p = probs[(y * width + x) as usize];
        Luma([if p > params.det_threshold { 255 } else { 0 }])
    });
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    // label -> (min_x, min_y, max_x, max_y)
    let mut extents: Vec<Option<(u32, u32, u32, u32)>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if extents.len() <= label {
            extents.resize(label + 1, None);
        }
        extents[label] = Some(match extents[label] {
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            None => (x, y, x, y),
        });
    }

    extents
        .into_iter()
        .flatten()
        .filter(|&(x0, y0, x1, y1)| x1 - x0 + 1 >= MIN_BOX_SIDE && y1 - y0 + 1 >= MIN_BOX_SIDE)
        .filter(|&rect| box_score(probs, width, rect) >= params.box_threshold)
        .map(|(x0, y0, x1, y1)| {
            unclip(
                (x0 as f32, y0 as f32, (x1 + 1) as f32, (y1 + 1) as f32),
                params.unclip_ratio,
                (width as f32, height as f32),
            )
        })
        .collect()
}

/// Mean probability inside an inclusive rectangle
fn box_score(probs: &[f32], width: u32, (x0, y0, x1, y1): (u32, u32, u32, u32)) -> f32 {
    let mut sum = 0.0;
    for y in y0..=y1 {
        let row = (y * width) as usize;
        sum += probs[row + x0 as usize..=row + x1 as usize].iter().sum::<f32>();
    }
    let area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f32;
    sum / area
}

/// Grow a box by `area * ratio / perimeter` on every side, clipped to `limit`
pub fn unclip(
    (x0, y0, x1, y1): (f32, f32, f32, f32),
    ratio: f32,
    limit: (f32, f32),
) -> (f32, f32, f32, f32) {
    let (w, h) = (x1 - x0, y1 - y0);
    let perimeter = 2.0 * (w + h);
    if perimeter <= f32::EPSILON {
        return (x0, y0, x1, y1);
    }
    let distance = w * h * ratio / perimeter;
    (
        (x0 - distance).max(0.0),
        (y0 - distance).max(0.0),
        (x1 + distance).min(limit.0),
        (y1 + distance).min(limit.1),
    )
}

/// Map a model-space box to source pixels as `(x, y, width, height)`
fn scale_box(
    (x0, y0, x1, y1): (f32, f32, f32, f32),
    ratio: (f32, f32),
    source: (u32, u32),
) -> Option<(u32, u32, u32, u32)> {
    let left = ((x0 * ratio.0).floor().max(0.0) as u32).min(source.0);
    let top = ((y0 * ratio.1).floor().max(0.0) as u32).min(source.1);
    let right = ((x1 * ratio.0).ceil().max(0.0) as u32).min(source.0);
    let bottom = ((y1 * ratio.1).ceil().max(0.0) as u32).min(source.1);
    (right > left && bottom > top).then(|| (left, top, right - left, bottom - top))
}

/// Top-to-bottom, then left-to-right for boxes on roughly the same line
pub fn sort_reading_order(boxes: &mut [(u32, u32, u32, u32)]) {
    boxes.sort_by_key(|&(x, y, _, _)| (y, x));
    for i in 0..boxes.len().saturating_sub(1) {
        for j in (0..=i).rev() {
            let (a, b) = (boxes[j], boxes[j + 1]);
            if b.1.abs_diff(a.1) < SAME_LINE_TOLERANCE && b.0 < a.0 {
                boxes.swap(j, j + 1);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn params() -> DetectionParams {
        DetectionParams {
            det_threshold: 0.3,
            box_threshold: 0.6,
            unclip_ratio: 1.5,
            max_side: 960,
        }
    }

    #[test]
    fn test_no_regions_is_an_engine_failure() {
        let err = assemble(Vec::new()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput { engine: EngineKind::Neural, .. }));
        assert!(err.to_string().contains("no text regions"));
    }

    #[test]
    fn test_regions_join_and_average() {
        let regions = vec![
            TextRegion {
                text: "Total".to_string(),
                bounds: (0, 0, 40, 12),
                confidence: 0.9,
            },
            TextRegion {
                text: "42.00".to_string(),
                bounds: (50, 0, 40, 12),
                confidence: 0.7,
            },
        ];
        let result = assemble(regions).unwrap();
        assert_eq!(result.text, "Total 42.00");
        assert!((result.confidence - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_charset_layout() {
        let charset = load_charset("a\nb\r\nc\n");
        assert_eq!(charset, vec!["", "a", "b", "c", " "]);
    }

    #[test]
    fn test_ctc_collapses_repeats_and_blanks() {
        let charset = load_charset("h\ni");
        // steps: h h blank i i  -> "hi"
        let probs = [
            0.1, 0.9, 0.0, 0.0, //
            0.1, 0.8, 0.1, 0.0, //
            0.9, 0.05, 0.05, 0.0, //
            0.0, 0.0, 0.7, 0.3, //
            0.0, 0.0, 0.9, 0.1,
        ];
        let (text, conf) = ctc_greedy_decode(&probs, 5, 4, &charset);
        assert_eq!(text, "hi");
        assert!((conf - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_ctc_blank_separates_double_letters() {
        let charset = load_charset("l");
        let probs = [0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let (text, _) = ctc_greedy_decode(&probs, 3, 3, &charset);
        assert_eq!(text, "ll");
    }

    #[test]
    fn test_ctc_all_blank() {
        let charset = load_charset("a");
        let (text, conf) = ctc_greedy_decode(&[1.0, 0.0, 0.0], 1, 3, &charset);
        assert_eq!(text, "");
        assert_eq!(conf, 0.0);
    }

    #[test]
    fn test_boxes_from_probability_map() {
        let (w, h) = (64u32, 32u32);
        let mut probs = vec![0.0f32; (w * h) as usize];
        // Strong blob
        for y in 8..16 {
            for x in 4..30 {
                probs[(y * w + x) as usize] = 0.9;
            }
        }
        // Weak blob: above det threshold, below box threshold
        for y in 20..26 {
            for x in 40..60 {
                probs[(y * w + x) as usize] = 0.4;
            }
        }
        // Speck
        probs[(30 * w + 2) as usize] = 0.95;

        let boxes = boxes_from_probability_map(&probs, w, h, &params());
        assert_eq!(boxes.len(), 1);
        let (x0, y0, x1, y1) = boxes[0];
        assert!(x0 < 4.0 && y0 < 8.0 && x1 > 30.0 && y1 > 16.0);
    }

    #[test]
    fn test_unclip_expands_and_clips() {
        // 20x10 box: area 200, perimeter 60, ratio 1.5 -> 5 px per side
        let grown = unclip((10.0, 10.0, 30.0, 20.0), 1.5, (100.0, 100.0));
        assert_eq!(grown, (5.0, 5.0, 35.0, 25.0));
        let clipped = unclip((0.0, 0.0, 20.0, 10.0), 1.5, (22.0, 100.0));
        assert_eq!(clipped, (0.0, 0.0, 22.0, 15.0));
    }

    #[test]
    fn test_scale_box_to_source() {
        let b = scale_box((10.0, 5.0, 20.0, 15.0), (2.0, 2.0), (100, 100)).unwrap();
        assert_eq!(b, (20, 10, 20, 20));
        assert!(scale_box((5.0, 5.0, 5.0, 9.0), (1.0, 1.0), (10, 10)).is_none());
    }

    #[test]
    fn test_reading_order() {
        let mut boxes = vec![(200, 52, 50, 20), (10, 100, 50, 20), (10, 50, 50, 20)];
        sort_reading_order(&mut boxes);
        assert_eq!(boxes, vec![(10, 50, 50, 20), (200, 52, 50, 20), (10, 100, 50, 20)]);

        // Same line, right box slightly higher
        let mut boxes = vec![(300, 48, 50, 20), (10, 50, 50, 20)];
        sort_reading_order(&mut boxes);
        assert_eq!(boxes[0].0, 10);
    }

    #[test]
    fn test_missing_model_files_fail() {
        let missing = PathBuf::from("/nonexistent/models");
        let result = PaddleOcr::from_files(
            &missing.join("det.onnx"),
            &missing.join("rec.onnx"),
            &missing.join("dict.txt"),
            &NeuralEngineConfig::default(),
        );
        assert!(result.is_err());
    }
}

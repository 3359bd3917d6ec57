//! OCR engine capability interface
//!
//! Both backends implement [`OcrAdapter`]. Each result carries a detail
//! variant tagged with the engine that produced it, so fusion can match
//! exhaustively instead of looking up string keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use super::image::DocumentImage;
use crate::errors::EngineError;

/// The two OCR backends. Ordering doubles as fusion preference on ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Neural detector + recognizer (PaddleOCR via ONNX Runtime)
    Neural,
    /// Classical language-specific recognizer (Tesseract)
    Classical,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Neural => "neural",
            EngineKind::Classical => "classical",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speed/accuracy trade-off requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMode {
    #[default]
    Fast,
    Accurate,
}

impl FromStr for OcrMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(OcrMode::Fast),
            "accurate" => Ok(OcrMode::Accurate),
            other => Err(format!("unknown OCR mode '{}' (expected fast or accurate)", other)),
        }
    }
}

/// Supported document languages (3-letter codes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "eng")]
    English,
    #[serde(rename = "fra")]
    French,
    #[serde(rename = "deu")]
    German,
    #[serde(rename = "spa")]
    Spanish,
    #[serde(rename = "hin")]
    Hindi,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::English,
        Language::French,
        Language::German,
        Language::Spanish,
        Language::Hindi,
    ];

    /// 3-letter code, also the Tesseract traineddata name
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "eng",
            Language::French => "fra",
            Language::German => "deu",
            Language::Spanish => "spa",
            Language::Hindi => "hin",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Language::English => "English",
            Language::French => "French",
            Language::German => "German",
            Language::Spanish => "Spanish",
            Language::Hindi => "Hindi",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .into_iter()
            .find(|lang| lang.code().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let codes: Vec<&str> = Language::ALL.iter().map(|l| l.code()).collect();
                format!("unsupported language '{}' (expected one of {})", s, codes.join(", "))
            })
    }
}

/// Text region found by the neural detector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextRegion {
    /// Recognized text content
    pub text: String,
    /// Bounding box (x, y, width, height) in source image pixels
    pub bounds: (u32, u32, u32, u32),
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
}

/// Word reported by the classical engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedWord {
    pub text: String,
    /// Confidence (0 - 100); `None` when the engine had no estimate
    pub confidence: Option<f32>,
}

/// Engine-specific part of a result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum EngineDetail {
    Neural { regions: Vec<TextRegion> },
    Classical { words: Vec<RecognizedWord>, engine_mode: u8 },
}

/// Output of one OCR engine for one image; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineResult {
    pub text: String,
    /// Confidence on a 0 - 100 scale
    pub confidence: f32,
    pub detail: EngineDetail,
}

impl EngineResult {
    /// Engine that produced this result
    pub fn engine(&self) -> EngineKind {
        match self.detail {
            EngineDetail::Neural { .. } => EngineKind::Neural,
            EngineDetail::Classical { .. } => EngineKind::Classical,
        }
    }
}

/// Uniform capability of an OCR backend.
///
/// Implementations hold process-wide, read-only engine state and must be
/// safe to call from several requests at once.
pub trait OcrAdapter: Send + Sync {
    /// Which backend this adapter is
    fn kind(&self) -> EngineKind;

    /// Recognize text in an already preprocessed image
    fn recognize(
        &self,
        image: &DocumentImage,
        language: Language,
        mode: OcrMode,
    ) -> Result<EngineResult, EngineError>;

    /// Like [`recognize`](Self::recognize), but an engine that runs an
    /// external process or a long loop may stop early once `cancel` fires.
    fn recognize_cancellable(
        &self,
        image: &DocumentImage,
        language: Language,
        mode: OcrMode,
        _cancel: &CancellationToken,
    ) -> Result<EngineResult, EngineError> {
        self.recognize(image, language, mode)
    }

    /// Release engine resources. Called once by the registry.
    fn shutdown(&self) {}
}

//! Vision/OCR Layer
//!
//! Hybrid text extraction from document images:
//! - Image preprocessing (grayscale, CLAHE, bilateral, threshold, denoise, dilate)
//! - PaddleOCR via ONNX Runtime (neural engine)
//! - Tesseract command line (classical engine)
//! - Confidence-based fusion and dictionary spell correction

pub mod classical;
pub mod engine;
pub mod filters;
pub mod fusion;
pub mod image;
pub mod models;
pub mod neural;
pub mod ocr_preprocess;
pub mod pipeline;
pub mod preprocess;
pub mod registry;
pub mod spell;

pub use classical::TesseractOcr;
pub use engine::{EngineDetail, EngineKind, EngineResult, Language, OcrAdapter, OcrMode, RecognizedWord, TextRegion};
pub use fusion::{fuse, FusionResult};
pub use self::image::{ColorSpace, DocumentImage};
pub use models::{ModelManager, ModelType, OnnxSession};
pub use neural::PaddleOcr;
pub use ocr_preprocess::{preprocess, PreprocessResult, PreprocessWarning};
pub use pipeline::{ExtractionRequest, ExtractionResult, Pipeline};
pub use registry::{EngineRegistry, RegistryBuilder};
pub use spell::{validate, Dictionary, ValidationResult};

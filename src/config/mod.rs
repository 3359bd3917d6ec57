//! Application Configuration
//!
//! User settings stored in TOML format. Only the language, preprocessing
//! options and OCR mode reach the extraction core; the rest configures
//! engine initialization and document export.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::export::FontName;
use crate::vision::engine::{Language, OcrMode};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default preprocessing options
    pub preprocessing: PreprocessingConfig,
    /// OCR engine settings
    pub engines: EnginesConfig,
    /// Spell correction settings
    pub spellcheck: SpellcheckConfig,
    /// Request defaults
    pub extraction: ExtractionSettings,
    /// Word document export defaults
    pub export: ExportSettings,
}

/// Image preprocessing flags, constructed once per extraction request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    /// Convert color input to luminance first
    pub grayscale: bool,
    /// Non-local-means denoising after binarization
    pub denoise: bool,
    /// Local contrast equalization (CLAHE)
    pub contrast: bool,
    /// CLAHE clip limit, 1.0 - 3.0
    pub contrast_level: f32,
    /// Square dilation kernel size (1 = no-op)
    pub dilate_kernel: u8,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            grayscale: true,
            denoise: true,
            contrast: false,
            contrast_level: 1.5,
            dilate_kernel: 1,
        }
    }
}

impl PreprocessingConfig {
    pub const MIN_CONTRAST_LEVEL: f32 = 1.0;
    pub const MAX_CONTRAST_LEVEL: f32 = 3.0;

    /// Clip limit actually applied, clamped into the supported range
    pub fn effective_contrast_level(&self) -> f32 {
        let level = if self.contrast_level.is_nan() {
            Self::MIN_CONTRAST_LEVEL
        } else {
            self.contrast_level
                .clamp(Self::MIN_CONTRAST_LEVEL, Self::MAX_CONTRAST_LEVEL)
        };
        if (level - self.contrast_level).abs() > f32::EPSILON {
            warn!(
                "Contrast level {} outside [{}, {}], using {}",
                self.contrast_level,
                Self::MIN_CONTRAST_LEVEL,
                Self::MAX_CONTRAST_LEVEL,
                level
            );
        }
        level
    }

    /// Dilation kernel rounded down to an odd size (minimum 1)
    pub fn effective_dilate_kernel(&self) -> u8 {
        let kernel = self.dilate_kernel.max(1);
        if kernel % 2 == 0 {
            kernel - 1
        } else {
            kernel
        }
    }
}

/// Settings for both OCR engines
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    pub neural: NeuralEngineConfig,
    pub classical: ClassicalEngineConfig,
}

/// Neural (PaddleOCR / ONNX Runtime) engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralEngineConfig {
    pub enabled: bool,
    /// Initialization failure is fatal for the whole process
    pub required: bool,
    /// Model directory; defaults to `<data_dir>/models`
    pub models_dir: Option<PathBuf>,
    /// Whether to try GPU execution providers
    pub use_gpu: bool,
    /// Probability threshold for the detection map
    pub det_threshold: f32,
    /// Minimum mean probability for a text box
    pub box_threshold: f32,
    /// Box expansion ratio
    pub unclip_ratio: f32,
    /// Longest side fed to the detector
    pub max_side: u32,
}

impl Default for NeuralEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required: true,
            models_dir: None,
            use_gpu: false,
            det_threshold: 0.3,
            box_threshold: 0.6,
            unclip_ratio: 1.5,
            max_side: 960,
        }
    }
}

/// Classical (Tesseract) engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassicalEngineConfig {
    pub enabled: bool,
    pub required: bool,
    /// Path to the tesseract binary; `tesseract` on PATH when unset
    pub binary: Option<PathBuf>,
    /// Tesseract page segmentation mode
    pub page_segmentation_mode: u8,
}

impl Default for ClassicalEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            binary: None,
            page_segmentation_mode: 6,
        }
    }
}

/// Dictionary spell correction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpellcheckConfig {
    pub enabled: bool,
    /// Directory holding `<lang>.txt` / `<lang>.json` word lists;
    /// defaults to `<data_dir>/dictionaries`
    pub dictionary_dir: Option<PathBuf>,
    /// Largest edit distance considered for suggestions
    pub max_edit_distance: usize,
}

impl Default for SpellcheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dictionary_dir: None,
            max_edit_distance: 2,
        }
    }
}

/// Per-request defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    pub language: Language,
    pub mode: OcrMode,
    /// Whole-request timeout in seconds (0 disables it)
    pub timeout_secs: u64,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            language: Language::English,
            mode: OcrMode::Fast,
            timeout_secs: 120,
        }
    }
}

impl ExtractionSettings {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Word export defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub title: String,
    pub font: FontName,
    pub font_size: u8,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            title: "Scanned Document".to_string(),
            font: FontName::Calibri,
            font_size: 11,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        // Preprocessing defaults
        assert!(config.preprocessing.grayscale);
        assert!(config.preprocessing.denoise);
        assert!(!config.preprocessing.contrast);
        assert!((config.preprocessing.contrast_level - 1.5).abs() < 0.01);
        assert_eq!(config.preprocessing.dilate_kernel, 1);

        // Engine defaults
        assert!(config.engines.neural.required);
        assert!(!config.engines.classical.required);
        assert_eq!(config.engines.classical.page_segmentation_mode, 6);

        // Request defaults
        assert_eq!(config.extraction.language, Language::English);
        assert_eq!(config.extraction.mode, OcrMode::Fast);
        assert_eq!(config.extraction.timeout(), Some(Duration::from_secs(120)));

        // Export defaults
        assert_eq!(config.export.font, FontName::Calibri);
        assert_eq!(config.export.font_size, 11);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.preprocessing, parsed.preprocessing);
        assert_eq!(config.extraction.language, parsed.extraction.language);
        assert_eq!(config.spellcheck.max_edit_distance, parsed.spellcheck.max_edit_distance);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [extraction]
            language = "fra"
            mode = "accurate"

            [engines.classical]
            binary = "/usr/local/bin/tesseract"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.extraction.language, Language::French);
        assert_eq!(parsed.extraction.mode, OcrMode::Accurate);
        assert_eq!(
            parsed.engines.classical.binary,
            Some(PathBuf::from("/usr/local/bin/tesseract"))
        );
        assert!(parsed.engines.classical.enabled);
        assert!(parsed.preprocessing.grayscale);
    }

    #[test]
    fn test_contrast_level_clamped() {
        let mut pp = PreprocessingConfig::default();
        pp.contrast_level = 7.0;
        assert!((pp.effective_contrast_level() - 3.0).abs() < f32::EPSILON);
        pp.contrast_level = 0.2;
        assert!((pp.effective_contrast_level() - 1.0).abs() < f32::EPSILON);
        pp.contrast_level = 2.2;
        assert!((pp.effective_contrast_level() - 2.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_dilate_kernel_rounds_to_odd() {
        let mut pp = PreprocessingConfig::default();
        pp.dilate_kernel = 4;
        assert_eq!(pp.effective_dilate_kernel(), 3);
        pp.dilate_kernel = 0;
        assert_eq!(pp.effective_dilate_kernel(), 1);
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = AppConfig::default();
        config.extraction.timeout_secs = 30;

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(loaded.extraction.timeout_secs, 30);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}

//! Document Export
//!
//! Turns extracted text into a Word document or a plain text file. Export
//! errors are reported on their own and never touch the extraction result.

use docx_rs::{BreakType, Docx, PageMargin, Paragraph, Run, RunFonts, Style, StyleType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::ExportSettings;
use crate::errors::ExportError;

/// One inch in twentieths of a point
const PAGE_MARGIN_TWIPS: i32 = 1440;
/// Title heading size in half-points
const TITLE_SIZE: usize = 56;
const TITLE_STYLE: &str = "Title";

/// Fonts offered for exported documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FontName {
    #[default]
    Calibri,
    Arial,
    TimesNewRoman,
}

impl FontName {
    pub const ALL: [FontName; 3] = [FontName::Calibri, FontName::Arial, FontName::TimesNewRoman];

    /// Font family name as Word knows it
    pub fn family(&self) -> &'static str {
        match self {
            FontName::Calibri => "Calibri",
            FontName::Arial => "Arial",
            FontName::TimesNewRoman => "Times New Roman",
        }
    }
}

impl fmt::Display for FontName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family())
    }
}

impl FromStr for FontName {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "calibri" => Ok(FontName::Calibri),
            "arial" => Ok(FontName::Arial),
            "timesnewroman" | "times" => Ok(FontName::TimesNewRoman),
            _ => Err(ExportError::DocumentExportFailed(format!("unsupported font: {}", s))),
        }
    }
}

/// Font size in points, 8 to 16
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FontSize(u8);

impl FontSize {
    pub const MIN: u8 = 8;
    pub const MAX: u8 = 16;

    pub fn new(points: u8) -> Result<Self, ExportError> {
        if (Self::MIN..=Self::MAX).contains(&points) {
            Ok(Self(points))
        } else {
            Err(ExportError::DocumentExportFailed(format!(
                "font size {} outside {}-{}",
                points,
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn points(&self) -> u8 {
        self.0
    }

    fn half_points(&self) -> usize {
        self.0 as usize * 2
    }
}

impl Default for FontSize {
    fn default() -> Self {
        Self(11)
    }
}

/// Layout choices for a generated document
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentOptions {
    pub title: String,
    pub font: FontName,
    pub font_size: FontSize,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            title: "Scanned Document".to_string(),
            font: FontName::default(),
            font_size: FontSize::default(),
        }
    }
}

impl TryFrom<&ExportSettings> for DocumentOptions {
    type Error = ExportError;

    fn try_from(settings: &ExportSettings) -> Result<Self, Self::Error> {
        Ok(Self {
            title: settings.title.clone(),
            font: settings.font,
            font_size: FontSize::new(settings.font_size)?,
        })
    }
}

fn fonts(font: FontName) -> RunFonts {
    RunFonts::new()
        .ascii(font.family())
        .hi_ansi(font.family())
        .east_asia(font.family())
        .cs(font.family())
}

/// Build a .docx holding a title heading and the text as one paragraph
pub fn create_word_document(text: &str, options: &DocumentOptions) -> Result<Vec<u8>, ExportError> {
    let title_style = Style::new(TITLE_STYLE, StyleType::Paragraph)
        .name(TITLE_STYLE)
        .size(TITLE_SIZE)
        .bold();

    let heading = Paragraph::new().style(TITLE_STYLE).add_run(
        Run::new()
            .add_text(options.title.as_str())
            .fonts(fonts(options.font))
            .size(TITLE_SIZE),
    );

    let mut body = Run::new()
        .fonts(fonts(options.font))
        .size(options.font_size.half_points());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            body = body.add_break(BreakType::TextWrapping);
        }
        body = body.add_text(line.trim_end_matches('\r'));
    }

    let margins = PageMargin::new()
        .top(PAGE_MARGIN_TWIPS)
        .bottom(PAGE_MARGIN_TWIPS)
        .left(PAGE_MARGIN_TWIPS)
        .right(PAGE_MARGIN_TWIPS);

    let mut buffer = Cursor::new(Vec::new());
    Docx::new()
        .add_style(title_style)
        .page_margin(margins)
        .add_paragraph(heading)
        .add_paragraph(Paragraph::new().add_run(body))
        .build()
        .pack(&mut buffer)
        .map_err(|e| ExportError::DocumentExportFailed(e.to_string()))?;

    let bytes = buffer.into_inner();
    debug!("Built Word document: {} bytes, font {} {}pt", bytes.len(), options.font, options.font_size.points());
    Ok(bytes)
}

/// Write a generated document to disk
pub fn save_docx(bytes: &[u8], path: &Path) -> Result<(), ExportError> {
    write_all(path, bytes)?;
    info!("Saved Word document to {:?}", path);
    Ok(())
}

/// Write extracted text as UTF-8
pub fn save_text(text: &str, path: &Path) -> Result<(), ExportError> {
    write_all(path, text.as_bytes())?;
    info!("Saved text to {:?}", path);
    Ok(())
}

fn write_all(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    std::fs::write(path, bytes).map_err(|source| ExportError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_word_document_is_zip() {
        let bytes = create_word_document("Hello\nworld", &DocumentOptions::default()).unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn test_empty_text_still_exports() {
        let options = DocumentOptions {
            title: "Receipt".to_string(),
            font: FontName::TimesNewRoman,
            font_size: FontSize::new(14).unwrap(),
        };
        assert!(!create_word_document("", &options).unwrap().is_empty());
    }

    #[test]
    fn test_font_size_bounds() {
        assert!(FontSize::new(8).is_ok());
        assert!(FontSize::new(16).is_ok());
        assert!(matches!(FontSize::new(7), Err(ExportError::DocumentExportFailed(_))));
        assert!(FontSize::new(17).is_err());
        assert_eq!(FontSize::default().points(), 11);
    }

    #[test]
    fn test_font_name_parsing() {
        assert_eq!("calibri".parse::<FontName>().unwrap(), FontName::Calibri);
        assert_eq!("Times New Roman".parse::<FontName>().unwrap(), FontName::TimesNewRoman);
        assert_eq!("times_new_roman".parse::<FontName>().unwrap(), FontName::TimesNewRoman);
        assert!("comic sans".parse::<FontName>().is_err());
        assert_eq!(FontName::TimesNewRoman.to_string(), "Times New Roman");
    }

    #[test]
    fn test_options_from_settings() {
        let mut settings = ExportSettings::default();
        let options = DocumentOptions::try_from(&settings).unwrap();
        assert_eq!(options, DocumentOptions::default());

        settings.font_size = 30;
        assert!(DocumentOptions::try_from(&settings).is_err());
    }

    #[test]
    fn test_save_files() {
        let dir = TempDir::new().unwrap();
        let docx_path = dir.path().join("scan.docx");
        let text_path = dir.path().join("scan.txt");

        let bytes = create_word_document("text", &DocumentOptions::default()).unwrap();
        save_docx(&bytes, &docx_path).unwrap();
        save_text("text", &text_path).unwrap();

        assert_eq!(std::fs::read(&docx_path).unwrap(), bytes);
        assert_eq!(std::fs::read_to_string(&text_path).unwrap(), "text");
    }

    #[test]
    fn test_save_to_missing_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("scan.txt");
        assert!(matches!(save_text("x", &path), Err(ExportError::Io { .. })));
    }
}

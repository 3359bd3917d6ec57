//! Classical OCR engine (Tesseract)
//!
//! Drives the `tesseract` command-line program. The preprocessed image is
//! PNG-encoded and piped through stdin; TSV output on stdout gives both
//! the text layout and per-word confidences.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{EngineDetail, EngineKind, EngineResult, Language, OcrAdapter, OcrMode, RecognizedWord};
use super::image::DocumentImage;
use crate::errors::EngineError;

const KIND: EngineKind = EngineKind::Classical;

/// LSTM-only engine, slower and more accurate
pub const OEM_LSTM: u8 = 1;
/// Default engine selection, faster
pub const OEM_DEFAULT: u8 = 3;

/// Confidence value Tesseract reports for rows without an estimate
const NO_CONFIDENCE: f32 = -1.0;

/// TSV row level for a single word
const LEVEL_WORD: u8 = 5;

/// How often a running tesseract process is checked for exit or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Tesseract engine mode for a requested OCR mode
pub fn engine_mode(mode: OcrMode) -> u8 {
    match mode {
        OcrMode::Accurate => OEM_LSTM,
        OcrMode::Fast => OEM_DEFAULT,
    }
}

/// Tesseract command-line adapter
pub struct TesseractOcr {
    binary: PathBuf,
    page_segmentation_mode: u8,
    version: String,
    /// Installed traineddata, when the binary could list them
    installed: Option<Vec<String>>,
}

impl TesseractOcr {
    /// Locate the binary and verify it runs
    pub fn new(binary: Option<PathBuf>, page_segmentation_mode: u8) -> Result<Self, EngineError> {
        let binary = binary.unwrap_or_else(|| PathBuf::from("tesseract"));

        let output = Command::new(&binary)
            .arg("--version")
            .output()
            .map_err(|e| EngineError::NotInstalled {
                engine: KIND,
                reason: format!("failed to execute {}: {}", binary.display(), e),
            })?;

        if !output.status.success() {
            return Err(EngineError::NotInstalled {
                engine: KIND,
                reason: format!(
                    "{} --version exited with {}",
                    binary.display(),
                    output.status
                ),
            });
        }

        // Older releases print the banner on stderr
        let banner = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        let version = banner.lines().next().unwrap_or("tesseract").trim().to_string();

        let installed = match list_languages(&binary) {
            Ok(langs) => Some(langs),
            Err(e) => {
                warn!("Could not list Tesseract languages: {}", e);
                None
            }
        };

        info!(
            "Tesseract ready: {} ({} languages)",
            version,
            installed.as_ref().map_or(0, Vec::len)
        );

        Ok(Self {
            binary,
            page_segmentation_mode,
            version,
            installed,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Traineddata names installed for this binary
    pub fn available_languages(&self) -> Result<Vec<String>, EngineError> {
        match &self.installed {
            Some(langs) => Ok(langs.clone()),
            None => list_languages(&self.binary),
        }
    }

    fn run(&self, png: Vec<u8>, language: Language, oem: u8, cancel: &CancellationToken) -> Result<String, EngineError> {
        let child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", language.code()])
            .args(["--oem", &oem.to_string()])
            .args(["--psm", &self.page_segmentation_mode.to_string()])
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::invocation(KIND, format!("failed to spawn tesseract: {}", e)))?;

        let output = finish_child(child, png, cancel)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::invocation(
                KIND,
                format!("tesseract exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        String::from_utf8(output.stdout).map_err(|e| EngineError::InvalidOutput {
            engine: KIND,
            reason: format!("output is not UTF-8: {}", e),
        })
    }
}

/// Feed `input` to a piped child and collect its output. The child is
/// killed if `cancel` fires before it exits.
fn finish_child(mut child: Child, input: Vec<u8>, cancel: &CancellationToken) -> Result<Output, EngineError> {
    let (Some(mut stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(EngineError::invocation(KIND, "tesseract pipes unavailable"));
    };

    // Pipes are served from their own threads so a full buffer cannot deadlock the child
    let writer = std::thread::spawn(move || stdin.write_all(&input));
    let out_reader = spawn_reader(stdout);
    let err_reader = spawn_reader(stderr);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if cancel.is_cancelled() => {
                let _ = child.kill();
                let _ = child.wait();
                debug!("Killed tesseract process {} on cancellation", child.id());
                return Err(EngineError::invocation(KIND, "cancelled while tesseract was running"));
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Err(EngineError::invocation(KIND, format!("failed to wait for tesseract: {}", e)));
            }
        }
    };

    let write_result = writer
        .join()
        .map_err(|_| EngineError::invocation(KIND, "stdin writer panicked"))?;
    let stdout = join_reader(out_reader)?;
    let stderr = join_reader(err_reader)?;

    if status.success() {
        write_result.map_err(|e| EngineError::invocation(KIND, format!("failed to write image: {}", e)))?;
    }

    Ok(Output { status, stdout, stderr })
}

fn spawn_reader(mut pipe: impl Read + Send + 'static) -> std::thread::JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).map(|_| buf)
    })
}

fn join_reader(handle: std::thread::JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>, EngineError> {
    handle
        .join()
        .map_err(|_| EngineError::invocation(KIND, "output reader panicked"))?
        .map_err(|e| EngineError::invocation(KIND, format!("failed to read tesseract output: {}", e)))
}

impl OcrAdapter for TesseractOcr {
    fn kind(&self) -> EngineKind {
        KIND
    }

    fn recognize(
        &self,
        image: &DocumentImage,
        language: Language,
        mode: OcrMode,
    ) -> Result<EngineResult, EngineError> {
        self.recognize_cancellable(image, language, mode, &CancellationToken::new())
    }

    fn recognize_cancellable(
        &self,
        image: &DocumentImage,
        language: Language,
        mode: OcrMode,
        cancel: &CancellationToken,
    ) -> Result<EngineResult, EngineError> {
        if let Some(installed) = &self.installed {
            if !installed.iter().any(|l| l == language.code()) {
                return Err(EngineError::invocation(
                    KIND,
                    format!("language '{}' is not installed", language.code()),
                ));
            }
        }

        let start = Instant::now();
        let png = image
            .to_png_bytes()
            .map_err(|e| EngineError::invocation(KIND, format!("failed to encode image: {}", e)))?;

        let oem = engine_mode(mode);
        let tsv = self.run(png, language, oem, cancel)?;
        let page = parse_tsv(&tsv)?;

        debug!(
            "Tesseract ({}, oem {}) read {} words in {:?}, confidence {:.1}",
            language,
            oem,
            page.words.len(),
            start.elapsed(),
            page.confidence
        );

        Ok(EngineResult {
            text: page.text,
            confidence: page.confidence,
            detail: EngineDetail::Classical {
                words: page.words,
                engine_mode: oem,
            },
        })
    }
}

fn list_languages(binary: &Path) -> Result<Vec<String>, EngineError> {
    let output = Command::new(binary)
        .arg("--list-langs")
        .output()
        .map_err(|e| EngineError::invocation(KIND, format!("failed to list languages: {}", e)))?;

    if !output.status.success() {
        return Err(EngineError::invocation(
            KIND,
            format!("--list-langs exited with {}", output.status),
        ));
    }

    // Some versions print the list on stderr
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    Ok(parse_language_list(&text))
}

/// Parse `--list-langs` output, skipping the "List of available..." header
fn parse_language_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of"))
        .map(str::to_string)
        .collect()
}

/// Text and confidence extracted from one TSV page
#[derive(Debug, Clone, PartialEq)]
struct TsvPage {
    text: String,
    confidence: f32,
    words: Vec<RecognizedWord>,
}

/// Parse `tesseract ... tsv` output.
///
/// Words are joined by spaces within a line and lines by newlines; a blank
/// line separates paragraphs and blocks. Confidence is the mean over rows
/// that carry one; the -1 sentinel counts neither in sum nor in count.
fn parse_tsv(tsv: &str) -> Result<TsvPage, EngineError> {
    let mut lines = tsv.lines();
    let header = lines.next().unwrap_or_default();
    if !header.starts_with("level") {
        return Err(EngineError::InvalidOutput {
            engine: KIND,
            reason: "missing TSV header".to_string(),
        });
    }

    let mut text = String::new();
    let mut words = Vec::new();
    let mut conf_sum = 0.0f32;
    let mut conf_count = 0usize;
    // (block, paragraph, line) of the last word written
    let mut last_key: Option<(u32, u32, u32)> = None;

    for row in lines {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 11 {
            continue;
        }
        let parse_u32 = |i: usize| cols[i].trim().parse::<u32>().ok();
        let (Some(level), Some(block), Some(par), Some(line)) =
            (parse_u32(0), parse_u32(2), parse_u32(3), parse_u32(4))
        else {
            continue;
        };
        let conf = cols[10].trim().parse::<f32>().unwrap_or(NO_CONFIDENCE);

        if conf >= 0.0 {
            conf_sum += conf;
            conf_count += 1;
        }

        if level != LEVEL_WORD as u32 {
            continue;
        }
        let word = cols.get(11).map(|t| t.trim()).unwrap_or_default();
        if word.is_empty() {
            continue;
        }

        let key = (block, par, line);
        match last_key {
            None => {}
            Some((b, p, _)) if (b, p) != (block, par) => text.push_str("\n\n"),
            Some(prev) if prev != key => text.push('\n'),
            Some(_) => text.push(' '),
        }
        text.push_str(word);
        last_key = Some(key);

        words.push(RecognizedWord {
            text: word.to_string(),
            confidence: (conf >= 0.0).then_some(conf),
        });
    }

    let confidence = if conf_count == 0 {
        0.0
    } else {
        conf_sum / conf_count as f32
    };

    Ok(TsvPage {
        text: text.trim().to_string(),
        confidence,
        words,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn tsv(rows: &[&str]) -> String {
        let mut out = String::from(HEADER);
        for row in rows {
            out.push('\n');
            out.push_str(row);
        }
        out
    }

    fn piped(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_child_output_is_collected() {
        let output = finish_child(piped("cat", &[]), b"level\ttext".to_vec(), &CancellationToken::new()).unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"level\ttext");
    }

    #[cfg(unix)]
    #[test]
    fn test_cancelled_child_is_killed() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = Instant::now();
        let result = finish_child(piped("sleep", &["30"]), Vec::new(), &cancel);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cancelled"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_parse_tsv_layout_and_confidence() {
        let input = tsv(&[
            "1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t",
            "2\t1\t1\t0\t0\t0\t10\t10\t300\t60\t-1\t",
            "4\t1\t1\t1\t1\t0\t10\t10\t300\t20\t-1\t",
            "5\t1\t1\t1\t1\t1\t10\t10\t80\t20\t96.5\tInvoice",
            "5\t1\t1\t1\t1\t2\t95\t10\t60\t20\t91\t#1234",
            "5\t1\t1\t1\t2\t1\t10\t40\t60\t20\t80\tTotal:",
            "5\t1\t2\t1\t1\t1\t10\t200\t60\t20\t88.5\tThanks",
        ]);

        let page = parse_tsv(&input).unwrap();
        assert_eq!(page.text, "Invoice #1234\nTotal:\n\nThanks");
        assert_eq!(page.words.len(), 4);
        let expected = (96.5 + 91.0 + 80.0 + 88.5) / 4.0;
        assert!((page.confidence - expected).abs() < 1e-4);
    }

    #[test]
    fn test_sentinel_excluded_from_mean() {
        let input = tsv(&[
            "5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t90\ta",
            "5\t1\t1\t1\t1\t2\t0\t0\t10\t10\t-1\t",
            "5\t1\t1\t1\t1\t3\t0\t0\t10\t10\t70\tb",
        ]);
        let page = parse_tsv(&input).unwrap();
        assert_eq!(page.text, "a b");
        assert!((page.confidence - 80.0).abs() < 1e-4);
    }

    #[test]
    fn test_blank_page() {
        let input = tsv(&["1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t"]);
        let page = parse_tsv(&input).unwrap();
        assert_eq!(page.text, "");
        assert_eq!(page.confidence, 0.0);
        assert!(page.words.is_empty());
    }

    #[test]
    fn test_missing_header_is_invalid_output() {
        let err = parse_tsv("garbage").unwrap_err();
        assert!(matches!(err, EngineError::InvalidOutput { .. }));
    }

    #[test]
    fn test_engine_mode_mapping() {
        assert_eq!(engine_mode(OcrMode::Accurate), 1);
        assert_eq!(engine_mode(OcrMode::Fast), 3);
    }

    #[test]
    fn test_parse_language_list() {
        let out = "List of available languages in \"/usr/share/tessdata/\" (3):\neng\nfra\nosd\n";
        assert_eq!(parse_language_list(out), vec!["eng", "fra", "osd"]);
    }

    #[test]
    fn test_missing_binary_is_not_installed() {
        let result = TesseractOcr::new(Some(PathBuf::from("/nonexistent/tesseract-binary")), 6);
        assert!(matches!(result, Err(EngineError::NotInstalled { .. })));
    }
}

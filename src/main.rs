//! Hybrid OCR - command line front end
//!
//! Loads a document image, runs the extraction pipeline and prints or saves
//! the recognized text.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use hybrid_ocr::capture;
use hybrid_ocr::config::{self, AppConfig};
use hybrid_ocr::export::{self, DocumentOptions, FontName, FontSize};
use hybrid_ocr::storage;
use hybrid_ocr::vision::{EngineRegistry, ExtractionRequest, Language, ModelManager, ModelType, OcrMode, Pipeline, TesseractOcr};

/// Hybrid OCR - document text extraction with two engines
#[derive(Parser, Debug)]
#[command(name = "hybrid-ocr", version)]
#[command(about = "Extract text from document images using a neural and a classical OCR engine")]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract text from an image
    Extract(ExtractArgs),
    /// List supported and installed languages
    Languages,
    /// Show neural model status
    Models {
        /// Download missing model files
        #[arg(long)]
        download: bool,
    },
}

#[derive(clap::Args, Debug)]
struct ExtractArgs {
    /// Image file (PNG, JPEG, ...)
    image: PathBuf,

    /// Language code (eng, fra, deu, spa, hin)
    #[arg(short, long)]
    lang: Option<Language>,

    /// fast or accurate
    #[arg(short, long)]
    mode: Option<OcrMode>,

    /// Skip grayscale conversion
    #[arg(long)]
    no_grayscale: bool,

    /// Skip denoising
    #[arg(long)]
    no_denoise: bool,

    /// Enable contrast enhancement with this clip limit (1.0 - 3.0)
    #[arg(long)]
    contrast: Option<f32>,

    /// Dilation kernel size
    #[arg(long)]
    dilate: Option<u8>,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,

    /// Also write the text to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also write a Word document
    #[arg(long)]
    docx: Option<PathBuf>,

    /// Word document font (calibri, arial, times new roman)
    #[arg(long)]
    font: Option<FontName>,

    /// Word document font size (8 - 16)
    #[arg(long)]
    font_size: Option<u8>,

    /// Word document title
    #[arg(long)]
    title: Option<String>,

    /// Save the preprocessed image as PNG
    #[arg(long)]
    save_processed: Option<PathBuf>,

    /// Request timeout in seconds (0 disables it)
    #[arg(long)]
    timeout: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_or_create_config(args.config.as_deref())?;

    match args.command {
        Command::Extract(extract) => run_extract(extract, &config),
        Command::Languages => list_languages(&config),
        Command::Models { download } => show_models(&config, download),
    }
}

/// Load configuration from file or fall back to defaults
fn load_or_create_config(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        let config = config::load_config(path).with_context(|| format!("Failed to load {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_path) = storage::get_config_path() {
        if config_path.exists() {
            match config::load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return Ok(config);
                }
                Err(e) => warn!("Ignoring unreadable {:?}: {:#}", config_path, e),
            }
        }
    }
    info!("Using default configuration");
    Ok(AppConfig::default())
}

fn build_request(args: &ExtractArgs, config: &AppConfig) -> ExtractionRequest {
    let mut request = ExtractionRequest::from_config(config);
    if let Some(language) = args.lang {
        request.language = language;
    }
    if let Some(mode) = args.mode {
        request.mode = mode;
    }
    if args.no_grayscale {
        request.preprocessing.grayscale = false;
    }
    if args.no_denoise {
        request.preprocessing.denoise = false;
    }
    if let Some(level) = args.contrast {
        request.preprocessing.contrast = true;
        request.preprocessing.contrast_level = level;
    }
    if let Some(kernel) = args.dilate {
        request.preprocessing.dilate_kernel = kernel;
    }
    request
}

fn document_options(args: &ExtractArgs, config: &AppConfig) -> Result<DocumentOptions> {
    let mut options = DocumentOptions::try_from(&config.export)?;
    if let Some(font) = args.font {
        options.font = font;
    }
    if let Some(size) = args.font_size {
        options.font_size = FontSize::new(size)?;
    }
    if let Some(title) = &args.title {
        options.title = title.clone();
    }
    Ok(options)
}

fn run_extract(args: ExtractArgs, config: &AppConfig) -> Result<()> {
    let loaded = capture::load_image(&args.image)?;
    info!(
        "Loaded {:?}: {}x{} {}",
        args.image, loaded.details.width, loaded.details.height, loaded.details.mode
    );

    let request = build_request(&args, config);
    let timeout = match args.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.extraction.timeout(),
    };

    // Engines start before the runtime: model downloads block on their own
    let pipeline = Arc::new(Pipeline::new(EngineRegistry::init(&config.engines, &config.spellcheck)));

    if let Some(path) = &args.save_processed {
        let preview = pipeline.preview(&loaded.image, &request.preprocessing)?;
        preview
            .image
            .to_dynamic()
            .save(path)
            .with_context(|| format!("Failed to save processed image to {:?}", path))?;
        info!("Saved processed image to {:?}", path);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let cancel = CancellationToken::new();
    let outcome = runtime.block_on({
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        async move {
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling extraction");
                    interrupt.cancel();
                }
            });
            pipeline.extract_async(loaded.image, request, cancel, timeout).await
        }
    });
    // An engine call abandoned by a timeout may still hold a blocking thread
    runtime.shutdown_background();

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            error!("Extraction failed: {}", e);
            return Err(e.into());
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.text);
        info!(
            "Confidence {:.1}, {} words, engines {:?}",
            result.confidence,
            result.word_count,
            result.engines_used()
        );
    }

    if let Some(path) = &args.output {
        export::save_text(&result.text, path)?;
    }
    if let Some(path) = &args.docx {
        let options = document_options(&args, config)?;
        let bytes = export::create_word_document(&result.text, &options)?;
        export::save_docx(&bytes, path)?;
    }

    if let Ok(pipeline) = Arc::try_unwrap(pipeline) {
        pipeline.shutdown();
    }
    Ok(())
}

fn list_languages(config: &AppConfig) -> Result<()> {
    println!("Supported languages:");
    for language in Language::ALL {
        println!("  {}  {}", language.code(), language.display_name());
    }

    let classical = &config.engines.classical;
    match TesseractOcr::new(classical.binary.clone(), classical.page_segmentation_mode) {
        Ok(tesseract) => {
            println!("\nTesseract {} languages:", tesseract.version());
            for code in tesseract.available_languages()? {
                println!("  {}", code);
            }
        }
        Err(e) => warn!("Tesseract not available: {}", e),
    }
    Ok(())
}

fn show_models(config: &AppConfig, download: bool) -> Result<()> {
    let manager = ModelManager::new(config.engines.neural.models_dir.clone())?;

    if download {
        let progress: &dyn Fn(ModelType, u64, Option<u64>) = &|model, done, total| match total {
            Some(total) if total > 0 => eprint!("\r{}: {}%   ", model.display_name(), done * 100 / total),
            _ => eprint!("\r{}: {} KB   ", model.display_name(), done / 1024),
        };
        manager.ensure_all_models(Some(progress))?;
        eprintln!();
    }

    println!("Models in {:?}:", manager.models_dir());
    for status in manager.get_model_status() {
        let size = status
            .size_bytes
            .map(|bytes| format!("{:.1} MB", bytes as f64 / 1_048_576.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:<10} {}",
            status.model_type.display_name(),
            if status.available { "ready" } else { "missing" },
            size
        );
    }
    Ok(())
}

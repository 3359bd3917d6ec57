//! Model management for ONNX Runtime
//!
//! Locates the PaddleOCR detection/recognition models and their character
//! list, downloading missing files on demand, and wraps ONNX Runtime
//! sessions.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::session::{builder::GraphOptimizationLevel, Session};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Environment variable that disables model downloads
pub const OFFLINE_ENV: &str = "HYBRID_OCR_OFFLINE";

const MANIFEST_FILE: &str = "manifest.json";

/// Files that make up the neural engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Text detection model (DBNet)
    Detection,
    /// Text recognition model (SVTR/CRNN with CTC head)
    Recognition,
    /// Character list matching the recognition model's output classes
    CharacterDictionary,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [
        ModelType::Detection,
        ModelType::Recognition,
        ModelType::CharacterDictionary,
    ];

    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::Detection => "det.onnx",
            ModelType::Recognition => "rec.onnx",
            ModelType::CharacterDictionary => "dict.txt",
        }
    }

    /// PaddleOCR exports hosted on Hugging Face (monkt/paddleocr-onnx)
    pub fn download_url(&self) -> &'static str {
        match self {
            ModelType::Detection => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/detection/v3/det.onnx"
            }
            ModelType::Recognition => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/rec.onnx"
            }
            ModelType::CharacterDictionary => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/dict.txt"
            }
        }
    }

    /// Plausible file size bounds, used to reject truncated downloads
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::Detection => (1_000_000, 50_000_000),
            ModelType::Recognition => (1_000_000, 100_000_000),
            ModelType::CharacterDictionary => (100, 1_000_000),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::Detection => "Text Detection",
            ModelType::Recognition => "Text Recognition",
            ModelType::CharacterDictionary => "Character Dictionary",
        }
    }
}

/// Record of downloaded model files, kept next to them
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    /// Unix timestamp (seconds)
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Download progress: (bytes so far, total if known)
pub type DownloadProgress<'a> = &'a dyn Fn(ModelType, u64, Option<u64>);

/// Status line for one model file
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub model_type: ModelType,
    pub path: PathBuf,
    pub available: bool,
    pub size_bytes: Option<u64>,
}

/// Model manager for downloading and caching ONNX models
pub struct ModelManager {
    models_dir: PathBuf,
}

impl ModelManager {
    /// Use `models_dir`, or `<data_dir>/models` when unset
    pub fn new(models_dir: Option<PathBuf>) -> Result<Self> {
        match models_dir {
            Some(dir) => Self::with_dir(dir),
            None => Self::with_dir(crate::storage::get_models_dir()?),
        }
    }

    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self { models_dir })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    /// Whether the file exists with a plausible size
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    pub fn are_models_ready(&self) -> bool {
        ModelType::ALL.iter().all(|&m| self.is_model_available(m))
    }

    pub fn get_model_status(&self) -> Vec<ModelStatus> {
        ModelType::ALL
            .iter()
            .map(|&model_type| {
                let path = self.model_path(model_type);
                let size_bytes = std::fs::metadata(&path).ok().map(|m| m.len());
                ModelStatus {
                    model_type,
                    available: self.is_model_available(model_type),
                    path,
                    size_bytes,
                }
            })
            .collect()
    }

    /// Return the path to a model file, downloading it first if needed
    pub fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        self.download_model(model_type, None)?;
        Ok(path)
    }

    /// Download every missing model file
    pub fn ensure_all_models(&self, progress: Option<DownloadProgress<'_>>) -> Result<()> {
        for model_type in ModelType::ALL {
            if self.is_model_available(model_type) {
                info!("Model {:?} already available, skipping download", model_type);
                continue;
            }
            self.download_model(model_type, progress)?;
        }
        Ok(())
    }

    /// Download one model file (blocking)
    pub fn download_model(&self, model_type: ModelType, progress: Option<DownloadProgress<'_>>) -> Result<()> {
        let url = model_type.download_url();
        let path = self.model_path(model_type);

        if std::env::var_os(OFFLINE_ENV).is_some() {
            anyhow::bail!(
                "Offline mode: cannot download models. Please download manually from {} and place at {:?}",
                url,
                path
            );
        }

        info!("Downloading {} model from {}", model_type.display_name(), url);

        let (size_bytes, sha256) = fetch_blocking(url, &path, |done, total| {
            if let Some(callback) = progress {
                callback(model_type, done, total);
            }
        })?;

        if !self.is_model_available(model_type) {
            anyhow::bail!(
                "Downloaded {} ({} bytes) failed size verification",
                model_type.filename(),
                size_bytes
            );
        }

        self.record_download(model_type, size_bytes, sha256)?;

        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(())
    }

    fn record_download(&self, model_type: ModelType, size_bytes: u64, sha256: String) -> Result<()> {
        let mut manifest = match self.load_manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring unreadable model manifest: {}", e);
                ModelManifest::default()
            }
        };

        let model_info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes,
            sha256: Some(sha256),
            downloaded_at: unix_timestamp(),
        };

        if let Some(existing) = manifest
            .models
            .iter_mut()
            .find(|m| m.filename == model_info.filename)
        {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            let manifest: ModelManifest = serde_json::from_str(&content)?;
            Ok(manifest)
        } else {
            Ok(ModelManifest::default())
        }
    }

    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join(MANIFEST_FILE);
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Run [`download_file`] to completion from synchronous code.
///
/// The download gets its own runtime on a worker thread, so this also works
/// when the caller is already inside a tokio runtime. Progress is relayed
/// back and reported on the calling thread.
fn fetch_blocking(url: &str, path: &Path, progress: impl Fn(u64, Option<u64>)) -> Result<(u64, String)> {
    let (tx, rx) = std::sync::mpsc::channel();

    std::thread::scope(|scope| {
        let worker = scope.spawn(move || -> Result<(u64, String)> {
            let rt = Runtime::new().context("Failed to create tokio runtime")?;
            rt.block_on(download_file(url, path, |done, total| {
                // Receiver outlives the worker
                let _ = tx.send((done, total));
            }))
        });

        for (done, total) in rx {
            progress(done, total);
        }

        worker
            .join()
            .unwrap_or_else(|_| Err(anyhow::anyhow!("Download worker panicked")))
    })
}

/// Stream `url` into `path` through a temp file. Returns size and SHA-256.
async fn download_file(
    url: &str,
    path: &Path,
    progress: impl Fn(u64, Option<u64>),
) -> Result<(u64, String)> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    let total_size = response.content_length();
    debug!("Download size: {:?} bytes", total_size);

    let temp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                std::fs::remove_file(&temp_path).ok();
                return Err(e).context("Error reading download stream");
            }
        };

        file.write_all(&chunk).context("Failed to write to temp file")?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
        progress(downloaded, total_size);
    }

    file.flush().context("Failed to flush temp file")?;
    drop(file);

    std::fs::rename(&temp_path, path)
        .context("Failed to move downloaded file to final location")?;

    Ok((downloaded, format!("{:x}", hasher.finalize())))
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// ONNX Runtime session with its input/output names
pub struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    /// Load a model file. With `use_gpu`, DirectML is tried on Windows;
    /// other platforms run on CPU.
    pub fn new(model_path: &Path, use_gpu: bool) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        #[cfg(target_os = "windows")]
        let builder = if use_gpu {
            use ort::execution_providers::DirectMLExecutionProvider;
            match builder.with_execution_providers([DirectMLExecutionProvider::default().build()]) {
                Ok(builder) => {
                    info!("DirectML GPU acceleration enabled");
                    builder
                }
                Err(e) => {
                    warn!("DirectML not available, using CPU: {}", e);
                    Session::builder()?
                        .with_optimization_level(GraphOptimizationLevel::Level3)?
                        .with_intra_threads(4)?
                }
            }
        } else {
            builder
        };

        #[cfg(not(target_os = "windows"))]
        {
            if use_gpu {
                warn!("GPU execution is only wired up for DirectML; using CPU");
            }
        }

        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        debug!("Model loaded. Inputs: {:?}, Outputs: {:?}", input_names, output_names);

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }

    /// Session for running inference (`run` needs exclusive access)
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Name of the first input, which is the image tensor for both models
    pub fn primary_input(&self) -> Result<&str> {
        self.input_names
            .first()
            .map(String::as_str)
            .context("ONNX model declares no inputs")
    }

    pub fn primary_output(&self) -> Result<&str> {
        self.output_names
            .first()
            .map(String::as_str)
            .context("ONNX model declares no outputs")
    }
}

//! Extraction pipeline
//!
//! preprocess -> both engines (concurrently, joined) -> fuse -> spell
//! correction -> result. Engine and dictionary failures only degrade the
//! result; a request fails outright only when preprocessing fails, the
//! engines never initialized, or the caller cancels.

use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use super::engine::{EngineKind, EngineResult, Language, OcrMode};
use super::fusion::fuse;
use super::image::DocumentImage;
use super::ocr_preprocess::{preprocess, PreprocessResult, PreprocessWarning};
use super::registry::EngineRegistry;
use super::spell::validate;
use crate::config::{AppConfig, PreprocessingConfig};
use crate::errors::{EngineError, OcrError};

/// Per-request inputs
#[derive(Debug, Clone, Default)]
pub struct ExtractionRequest {
    pub language: Language,
    pub preprocessing: PreprocessingConfig,
    pub mode: OcrMode,
}

impl ExtractionRequest {
    /// Request with the configured defaults
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            language: config.extraction.language,
            preprocessing: config.preprocessing.clone(),
            mode: config.extraction.mode,
        }
    }
}

/// Final output of one extraction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub text: String,
    /// 0 - 100; blended with the spell-check average when correction ran
    pub confidence: f32,
    pub language: Language,
    pub word_count: usize,
    /// Result of every engine that succeeded
    pub details: BTreeMap<EngineKind, EngineResult>,
    /// Per-token confidences, present when spell correction ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_confidence: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preprocessing_warnings: Vec<PreprocessWarning>,
}

impl ExtractionResult {
    /// Engines that contributed, in preference order
    pub fn engines_used(&self) -> Vec<EngineKind> {
        self.details.keys().copied().collect()
    }
}

/// Overall confidence once spell correction ran
pub fn blend_confidence(fusion_confidence: f32, average_word_confidence: f32) -> f32 {
    (fusion_confidence + average_word_confidence * 100.0) / 2.0
}

/// Request orchestrator over a shared [`EngineRegistry`]
pub struct Pipeline {
    engines: Result<EngineRegistry, OcrError>,
}

impl Pipeline {
    /// Wrap the outcome of engine initialization. A failure is kept and
    /// returned by every later extraction instead of retrying.
    pub fn new(engines: Result<EngineRegistry, OcrError>) -> Self {
        match &engines {
            Ok(registry) => info!("Extraction pipeline ready with engines {:?}", registry.engines()),
            Err(e) => error!("OCR engine initialization failed: {}", e),
        }
        Self { engines }
    }

    pub fn registry(&self) -> Result<&EngineRegistry, OcrError> {
        self.engines.as_ref().map_err(Clone::clone)
    }

    /// Run one extraction to completion
    pub fn extract(&self, image: &DocumentImage, request: &ExtractionRequest) -> Result<ExtractionResult, OcrError> {
        self.extract_with_cancel(image, request, &CancellationToken::new())
    }

    /// Run one extraction, checking `cancel` between stages
    pub fn extract_with_cancel(
        &self,
        image: &DocumentImage,
        request: &ExtractionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult, OcrError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("extract", request_id = %request_id, language = %request.language);
        let _enter = span.enter();

        let registry = self.registry()?;
        let start = Instant::now();

        let outcome = catch_unwind(AssertUnwindSafe(|| run(registry, image, request, cancel)))
            .unwrap_or_else(|payload| Err(OcrError::Internal(panic_message(payload.as_ref()))));

        match &outcome {
            Ok(result) => info!(
                "Extracted {} words from {:?} at confidence {:.1} in {:?}",
                result.word_count,
                result.engines_used(),
                result.confidence,
                start.elapsed()
            ),
            Err(OcrError::Cancelled) => info!("Extraction cancelled after {:?}", start.elapsed()),
            Err(e) => error!("Extraction failed: {}", e),
        }
        outcome
    }

    /// Run an extraction on the blocking pool, bounded by `cancel` and an
    /// optional timeout. On cancel or timeout the worker is told to stop at
    /// its next stage boundary; an engine call already running finishes in
    /// the background.
    pub async fn extract_async(
        self: Arc<Self>,
        image: DocumentImage,
        request: ExtractionRequest,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ExtractionResult, OcrError> {
        let worker_token = cancel.child_token();
        let worker_cancel = worker_token.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            self.extract_with_cancel(&image, &request, &worker_cancel)
        });

        let run = async {
            tokio::select! {
                joined = &mut handle => joined.unwrap_or_else(|e| {
                    Err(OcrError::Internal(format!("extraction task failed: {}", e)))
                }),
                _ = cancel.cancelled() => Err(OcrError::Cancelled),
            }
        };

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .unwrap_or(Err(OcrError::TimedOut(limit))),
            None => run.await,
        };

        if outcome.is_err() {
            worker_token.cancel();
        }
        outcome
    }

    /// Preprocess only, for showing what the engines will see
    pub fn preview(&self, image: &DocumentImage, settings: &PreprocessingConfig) -> Result<PreprocessResult, OcrError> {
        preprocess(image, settings)
    }

    /// Release engines
    pub fn shutdown(self) {
        if let Ok(registry) = self.engines {
            registry.shutdown();
        }
    }
}

fn run(
    registry: &EngineRegistry,
    image: &DocumentImage,
    request: &ExtractionRequest,
    cancel: &CancellationToken,
) -> Result<ExtractionResult, OcrError> {
    checkpoint(cancel)?;
    let processed = preprocess(image, &request.preprocessing)?;

    checkpoint(cancel)?;
    let results = run_engines(registry, &processed.image, request.language, request.mode, cancel);

    checkpoint(cancel)?;
    let fused = fuse(results);

    let (text, confidence, word_confidence) = match registry.dictionary(request.language) {
        Some(dictionary) if !dictionary.is_empty() && !fused.text.trim().is_empty() => {
            let validation = validate(&fused.text, dictionary);
            let blended = blend_confidence(fused.confidence, validation.average_confidence);
            (validation.corrected_text, blended, Some(validation.word_confidence))
        }
        Some(_) => (fused.text, fused.confidence, None),
        None => {
            debug!("No {} dictionary, skipping spell correction", request.language);
            (fused.text, fused.confidence, None)
        }
    };

    let word_count = text.split_whitespace().count();
    Ok(ExtractionResult {
        text,
        confidence,
        language: request.language,
        word_count,
        details: fused.per_engine,
        word_confidence,
        preprocessing_warnings: processed.warnings,
    })
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), OcrError> {
    if cancel.is_cancelled() {
        Err(OcrError::Cancelled)
    } else {
        Ok(())
    }
}

/// Invoke every engine on its own scoped thread and wait for all of them
fn run_engines(
    registry: &EngineRegistry,
    image: &DocumentImage,
    language: Language,
    mode: OcrMode,
    cancel: &CancellationToken,
) -> BTreeMap<EngineKind, EngineResult> {
    let parent = tracing::Span::current();

    let outcomes: Vec<(EngineKind, Result<EngineResult, EngineError>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = registry
            .adapters()
            .map(|adapter| {
                let kind = adapter.kind();
                let parent = parent.clone();
                let handle = scope.spawn(move || {
                    let _enter = parent.enter();
                    let start = Instant::now();
                    let result = adapter.recognize_cancellable(image, language, mode, cancel);
                    debug!("{} engine finished in {:?}", kind, start.elapsed());
                    result
                });
                (kind, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(kind, handle)| {
                let result = handle.join().unwrap_or_else(|payload| {
                    Err(EngineError::invocation(
                        kind,
                        format!("engine panicked: {}", panic_message(payload.as_ref())),
                    ))
                });
                (kind, result)
            })
            .collect()
    });

    let mut results = BTreeMap::new();
    for (kind, outcome) in outcomes {
        match outcome {
            Ok(result) if result.engine() == kind => {
                results.insert(kind, result);
            }
            Ok(result) => warn!("{} engine returned a {} result, ignoring it", kind, result.engine()),
            Err(e) => warn!("{}", e),
        }
    }
    results
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::engine::{EngineDetail, OcrAdapter, RecognizedWord, TextRegion};
    use crate::vision::spell::Dictionary;
    use image::{GrayImage, Luma};

    enum Behavior {
        Succeed(&'static str, f32),
        NoText,
        /// Wait until the request is cancelled
        UntilCancelled,
        Fail,
        Panic,
    }

    struct MockEngine {
        kind: EngineKind,
        behavior: Behavior,
        delay: Option<Duration>,
    }

    impl MockEngine {
        fn new(kind: EngineKind, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                kind,
                behavior,
                delay: None,
            })
        }

        fn slow(kind: EngineKind, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                kind,
                behavior: Behavior::Succeed("late", 50.0),
                delay: Some(delay),
            })
        }
    }

    impl OcrAdapter for MockEngine {
        fn kind(&self) -> EngineKind {
            self.kind
        }

        fn recognize_cancellable(
            &self,
            image: &DocumentImage,
            language: Language,
            mode: OcrMode,
            cancel: &CancellationToken,
        ) -> Result<EngineResult, EngineError> {
            if let Behavior::UntilCancelled = self.behavior {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                return Err(EngineError::invocation(self.kind, "stopped on cancellation"));
            }
            self.recognize(image, language, mode)
        }

        fn recognize(&self, image: &DocumentImage, _: Language, _: OcrMode) -> Result<EngineResult, EngineError> {
            assert!(image.is_single_channel());
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            match self.behavior {
                Behavior::Succeed(text, confidence) => {
                    let detail = match self.kind {
                        EngineKind::Neural => EngineDetail::Neural {
                            regions: vec![TextRegion {
                                text: text.to_string(),
                                bounds: (0, 0, image.width(), image.height()),
                                confidence: confidence / 100.0,
                            }],
                        },
                        EngineKind::Classical => EngineDetail::Classical {
                            words: text
                                .split_whitespace()
                                .map(|w| RecognizedWord {
                                    text: w.to_string(),
                                    confidence: Some(confidence),
                                })
                                .collect(),
                            engine_mode: 3,
                        },
                    };
                    Ok(EngineResult {
                        text: text.to_string(),
                        confidence,
                        detail,
                    })
                }
                Behavior::NoText => Err(EngineError::InvalidOutput {
                    engine: self.kind,
                    reason: "no text regions".to_string(),
                }),
                Behavior::Fail => Err(EngineError::invocation(self.kind, "simulated failure")),
                Behavior::Panic => panic!("simulated crash"),
                Behavior::UntilCancelled => unreachable!("handled in recognize_cancellable"),
            }
        }
    }

    fn page() -> DocumentImage {
        DocumentImage::Gray(GrayImage::from_fn(48, 24, |x, y| {
            if (8..40).contains(&x) && (10..14).contains(&y) {
                Luma([0])
            } else {
                Luma([255])
            }
        }))
    }

    fn request() -> ExtractionRequest {
        ExtractionRequest {
            preprocessing: PreprocessingConfig {
                denoise: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn english() -> Dictionary {
        Dictionary::from_words(["the", "quick", "brown", "fox", "Hello", "world"])
    }

    fn pipeline(neural: Behavior, classical: Behavior, dictionary: Option<Dictionary>) -> Pipeline {
        let mut builder = EngineRegistry::builder()
            .adapter(MockEngine::new(EngineKind::Neural, neural))
            .adapter(MockEngine::new(EngineKind::Classical, classical));
        if let Some(dictionary) = dictionary {
            builder = builder.dictionary(Language::English, dictionary);
        }
        Pipeline::new(builder.build())
    }

    #[test]
    fn test_both_engines_contribute() {
        let pipeline = pipeline(
            Behavior::Succeed("The quick brown fox", 93.0),
            Behavior::Succeed("The quick brown fax", 88.0),
            Some(english()),
        );
        let result = pipeline.extract(&page(), &request()).unwrap();

        assert_eq!(result.text, "The quick brown fox");
        assert_eq!(result.word_count, 4);
        assert_eq!(result.details.len(), 2);
        assert_eq!(result.engines_used(), vec![EngineKind::Neural, EngineKind::Classical]);
        assert!(result.confidence > 80.0);
        assert_eq!(result.confidence, blend_confidence(93.0, 1.0));
        assert_eq!(result.language, Language::English);
        assert_eq!(result.word_confidence, Some(vec![1.0; 4]));
    }

    #[test]
    fn test_failed_engine_is_excluded() {
        let pipeline = pipeline(Behavior::Succeed("quick fox", 70.0), Behavior::Fail, None);
        let result = pipeline.extract(&page(), &request()).unwrap();

        assert_eq!(result.details.len(), 1);
        assert!(result.details.contains_key(&EngineKind::Neural));
        assert_eq!(result.text, "quick fox");
        assert_eq!(result.confidence, 70.0);
        assert!(result.word_confidence.is_none());
    }

    #[test]
    fn test_blank_neural_page_leaves_classical_text() {
        let pipeline = pipeline(Behavior::NoText, Behavior::Succeed("Invoice", 0.0), None);
        let result = pipeline.extract(&page(), &request()).unwrap();

        assert_eq!(result.text, "Invoice");
        assert_eq!(result.details.len(), 1);
        assert!(result.details.contains_key(&EngineKind::Classical));
    }

    #[test]
    fn test_all_engines_failing_gives_empty_result() {
        let pipeline = pipeline(Behavior::Fail, Behavior::Fail, Some(english()));
        let result = pipeline.extract(&page(), &request()).unwrap();

        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.word_count, 0);
        assert!(result.details.is_empty());
        assert!(result.word_confidence.is_none());
    }

    #[test]
    fn test_spell_correction_applied_to_winner() {
        let pipeline = pipeline(
            Behavior::Succeed("Helo wrld", 60.0),
            Behavior::Succeed("He1o wr1d", 40.0),
            Some(english()),
        );
        let result = pipeline.extract(&page(), &request()).unwrap();

        assert_eq!(result.text, "Hello world");
        let word_confidence = result.word_confidence.unwrap();
        assert!(word_confidence.iter().all(|&c| c > 0.5));
        // Raw engine output is kept untouched
        assert_eq!(result.details[&EngineKind::Neural].text, "Helo wrld");
    }

    #[test]
    fn test_classical_wins_when_more_confident() {
        let pipeline = pipeline(
            Behavior::Succeed("Hel1o", 40.0),
            Behavior::Succeed("Hello", 85.0),
            None,
        );
        let result = pipeline.extract(&page(), &request()).unwrap();
        assert_eq!(result.text, "Hello");
        assert_eq!(result.confidence, 85.0);
    }

    #[test]
    fn test_panicking_engine_is_contained() {
        let pipeline = pipeline(Behavior::Panic, Behavior::Succeed("fox", 55.0), None);
        let result = pipeline.extract(&page(), &request()).unwrap();
        assert_eq!(result.engines_used(), vec![EngineKind::Classical]);
        assert_eq!(result.text, "fox");
    }

    #[test]
    fn test_init_failure_is_replayed() {
        let pipeline = Pipeline::new(Err(OcrError::EngineUnavailable("det.onnx missing".to_string())));
        for _ in 0..2 {
            let err = pipeline.extract(&page(), &request()).unwrap_err();
            assert!(matches!(err, OcrError::EngineUnavailable(ref m) if m == "det.onnx missing"));
        }
    }

    #[test]
    fn test_empty_image_fails_request() {
        let pipeline = pipeline(Behavior::Succeed("x", 1.0), Behavior::Fail, None);
        let empty = DocumentImage::Gray(GrayImage::new(0, 0));
        let err = pipeline.extract(&empty, &request()).unwrap_err();
        assert!(matches!(err, OcrError::PreprocessingFailed(_)));
    }

    #[test]
    fn test_cancelled_before_start() {
        let pipeline = pipeline(Behavior::Succeed("x", 1.0), Behavior::Fail, None);
        let token = CancellationToken::new();
        token.cancel();
        let err = pipeline.extract_with_cancel(&page(), &request(), &token).unwrap_err();
        assert!(matches!(err, OcrError::Cancelled));
    }

    #[test]
    fn test_cancel_reaches_running_engines() {
        let pipeline = pipeline(Behavior::UntilCancelled, Behavior::Succeed("fox", 80.0), None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.cancel();
        });

        let err = pipeline.extract_with_cancel(&page(), &request(), &cancel).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, OcrError::Cancelled));
    }

    #[test]
    fn test_empty_dictionary_skips_correction() {
        let pipeline = pipeline(
            Behavior::Succeed("Helo wrld", 60.0),
            Behavior::Fail,
            Some(Dictionary::from_words(Vec::<String>::new())),
        );
        let result = pipeline.extract(&page(), &request()).unwrap();

        assert_eq!(result.text, "Helo wrld");
        assert_eq!(result.confidence, 60.0);
        assert!(result.word_confidence.is_none());
    }

    #[test]
    fn test_preview_returns_processed_image() {
        let pipeline = pipeline(Behavior::Fail, Behavior::Fail, None);
        let preview = pipeline.preview(&page(), &request().preprocessing).unwrap();
        assert!(preview.image.is_single_channel());
        assert_eq!(preview.image.width(), 48);
    }

    #[test]
    fn test_result_serializes_engine_keys() {
        let pipeline = pipeline(Behavior::Succeed("fox", 90.0), Behavior::Fail, None);
        let result = pipeline.extract(&page(), &request()).unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["language"], "eng");
        assert_eq!(json["details"]["neural"]["text"], "fox");
        assert!(json.get("word_confidence").is_none());
    }

    #[tokio::test]
    async fn test_async_extraction_completes() {
        let pipeline = Arc::new(pipeline(Behavior::Succeed("quick", 75.0), Behavior::Fail, None));
        let result = pipeline
            .extract_async(page(), request(), CancellationToken::new(), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(result.text, "quick");
    }

    #[tokio::test]
    async fn test_async_extraction_times_out() {
        let registry = EngineRegistry::builder()
            .adapter(MockEngine::slow(EngineKind::Neural, Duration::from_millis(300)))
            .build();
        let pipeline = Arc::new(Pipeline::new(registry));

        let err = pipeline
            .extract_async(page(), request(), CancellationToken::new(), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_async_extraction_cancelled() {
        let registry = EngineRegistry::builder()
            .adapter(MockEngine::slow(EngineKind::Neural, Duration::from_millis(300)))
            .build();
        let pipeline = Arc::new(Pipeline::new(registry));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = pipeline
            .extract_async(page(), request(), token, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OcrError::Cancelled));
    }
}

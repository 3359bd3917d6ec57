//! Engine registry
//!
//! Owns the process-wide OCR engines and spell-check dictionaries. Built
//! once at startup and handed to the pipeline; engine state is read-only
//! afterwards and shared by concurrent requests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::classical::TesseractOcr;
use super::engine::{EngineKind, Language, OcrAdapter};
use super::neural::PaddleOcr;
use super::spell::Dictionary;
use crate::config::{EnginesConfig, SpellcheckConfig};
use crate::errors::{EngineError, OcrError};

/// Initialized engines and dictionaries
pub struct EngineRegistry {
    adapters: BTreeMap<EngineKind, Arc<dyn OcrAdapter>>,
    dictionaries: HashMap<Language, Arc<Dictionary>>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.engines())
            .field("dictionaries", &self.dictionaries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EngineRegistry {
    /// Start configured engines and load dictionaries.
    ///
    /// A required engine that fails, or ending up with no engine at all,
    /// is fatal. Optional engines that fail are logged and left out.
    pub fn init(engines: &EnginesConfig, spellcheck: &SpellcheckConfig) -> Result<Self, OcrError> {
        let mut builder = Self::builder();

        if engines.neural.enabled {
            let started = PaddleOcr::new(&engines.neural);
            builder = builder.try_adapter(EngineKind::Neural, started, engines.neural.required)?;
        }

        if engines.classical.enabled {
            let started = TesseractOcr::new(
                engines.classical.binary.clone(),
                engines.classical.page_segmentation_mode,
            );
            builder = builder.try_adapter(EngineKind::Classical, started, engines.classical.required)?;
        }

        if spellcheck.enabled {
            match spellcheck
                .dictionary_dir
                .clone()
                .map_or_else(crate::storage::get_dictionaries_dir, Ok)
            {
                Ok(dir) => builder = builder.dictionaries_from_dir(&dir, spellcheck.max_edit_distance),
                Err(e) => warn!("No dictionary directory, spell correction disabled: {}", e),
            }
        }

        builder.build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn adapter(&self, kind: EngineKind) -> Option<&Arc<dyn OcrAdapter>> {
        self.adapters.get(&kind)
    }

    /// Adapters in fusion preference order
    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn OcrAdapter>> {
        self.adapters.values()
    }

    pub fn engines(&self) -> Vec<EngineKind> {
        self.adapters.keys().copied().collect()
    }

    pub fn dictionary(&self, language: Language) -> Option<&Arc<Dictionary>> {
        self.dictionaries.get(&language)
    }

    /// Release engine resources
    pub fn shutdown(mut self) {
        for (kind, adapter) in std::mem::take(&mut self.adapters) {
            adapter.shutdown();
            info!("{} engine shut down", kind);
        }
        self.dictionaries.clear();
    }
}

/// Incremental registry construction; also the injection point for
/// custom or test adapters.
#[derive(Default)]
pub struct RegistryBuilder {
    adapters: BTreeMap<EngineKind, Arc<dyn OcrAdapter>>,
    dictionaries: HashMap<Language, Arc<Dictionary>>,
}

impl RegistryBuilder {
    pub fn adapter(mut self, adapter: Arc<dyn OcrAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Add an engine that may have failed to start
    pub fn try_adapter<A>(
        self,
        kind: EngineKind,
        started: Result<A, EngineError>,
        required: bool,
    ) -> Result<Self, OcrError>
    where
        A: OcrAdapter + 'static,
    {
        match started {
            Ok(adapter) => {
                info!("{} engine initialized", kind);
                Ok(self.adapter(Arc::new(adapter)))
            }
            Err(e) if required => Err(OcrError::EngineUnavailable(e.to_string())),
            Err(e) => {
                warn!("Optional {} engine unavailable: {}", kind, e);
                Ok(self)
            }
        }
    }

    pub fn dictionary(mut self, language: Language, dictionary: Dictionary) -> Self {
        self.dictionaries.insert(language, Arc::new(dictionary));
        self
    }

    /// Load `<code>.txt` or `<code>.json` for every supported language
    pub fn dictionaries_from_dir(mut self, dir: &Path, max_edit_distance: usize) -> Self {
        for language in Language::ALL {
            let Some(path) = dictionary_path(dir, language) else {
                warn!(
                    "No {} dictionary in {:?}; spell correction skipped for that language",
                    language.display_name(),
                    dir
                );
                continue;
            };
            match Dictionary::load(&path) {
                Ok(dictionary) if dictionary.is_empty() => {
                    warn!("Dictionary {:?} has no words; spell correction skipped for that language", path);
                }
                Ok(dictionary) => {
                    self = self.dictionary(language, dictionary.with_max_edit_distance(max_edit_distance));
                }
                Err(e) => warn!("Failed to load {:?}: {:#}", path, e),
            }
        }
        self
    }

    pub fn build(self) -> Result<EngineRegistry, OcrError> {
        if self.adapters.is_empty() {
            return Err(OcrError::EngineUnavailable(
                "no OCR engine could be initialized".to_string(),
            ));
        }
        Ok(EngineRegistry {
            adapters: self.adapters,
            dictionaries: self.dictionaries,
        })
    }
}

fn dictionary_path(dir: &Path, language: Language) -> Option<PathBuf> {
    ["txt", "json"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", language.code(), ext)))
        .find(|path| path.is_file())
}

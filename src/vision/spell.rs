//! Dictionary spell correction
//!
//! Token-level correction of OCR output against a word list. Every token
//! gets a confidence in `[0, 1]`: 1.0 for dictionary words, the similarity
//! of the chosen correction otherwise, and 0.5 when nothing close exists.
//!
//! Correction is lossy. A correctly recognized word that is missing from
//! the dictionary (a name, jargon) is replaced by its nearest entry.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// Confidence for an unknown token with no suggestion
pub const UNKNOWN_WORD_CONFIDENCE: f32 = 0.5;

/// Default largest edit distance searched for candidates
pub const DEFAULT_MAX_EDIT_DISTANCE: usize = 2;

/// Word list used for validation. Lookups are case-insensitive; suggestions
/// come back in the spelling the list used.
#[derive(Debug, Clone)]
pub struct Dictionary {
    /// Lowercased word -> spelling as listed
    words: HashMap<String, String>,
    /// Lowercased words bucketed by char count, sorted within a bucket
    by_length: BTreeMap<usize, Vec<String>>,
    max_edit_distance: usize,
}

/// JSON word list formats
#[derive(Deserialize)]
#[serde(untagged)]
enum WordListFile {
    /// `{"word": frequency}`
    Frequencies(HashMap<String, u64>),
    /// `["word", ...]`
    Words(Vec<String>),
}

impl Dictionary {
    /// Build from any word iterator. Empty entries are ignored; the first
    /// spelling of a word wins.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map = HashMap::new();
        for word in words {
            let word = word.as_ref().trim();
            if word.is_empty() {
                continue;
            }
            map.entry(word.to_lowercase()).or_insert_with(|| word.to_string());
        }

        let mut by_length: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for key in map.keys() {
            by_length.entry(key.chars().count()).or_default().push(key.clone());
        }
        for bucket in by_length.values_mut() {
            bucket.sort();
        }

        Self {
            words: map,
            by_length,
            max_edit_distance: DEFAULT_MAX_EDIT_DISTANCE,
        }
    }

    /// Change how far candidates may be from the token (at least 1)
    pub fn with_max_edit_distance(mut self, distance: usize) -> Self {
        self.max_edit_distance = distance.max(1);
        self
    }

    /// Load a word list.
    ///
    /// `.json` files hold either a `{"word": count}` map or a list of
    /// words. Anything else is read as text: one word per line, optionally
    /// followed by a frequency, `#` starting a comment line.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dictionary {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let dictionary = if is_json {
            let parsed: WordListFile = serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON dictionary {}", path.display()))?;
            match parsed {
                WordListFile::Frequencies(map) => Self::from_words(map.keys()),
                WordListFile::Words(list) => Self::from_words(list),
            }
        } else {
            Self::from_words(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.starts_with('#'))
                    .filter_map(|line| line.split_whitespace().next()),
            )
        };

        info!("Loaded dictionary {} ({} words)", path.display(), dictionary.len());
        Ok(dictionary)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Whether `word` is in the list, ignoring case
    pub fn known(&self, word: &str) -> bool {
        self.words.contains_key(&word.to_lowercase())
    }

    /// Near matches for `word`, closest distance tier only.
    ///
    /// Entries one edit away are returned if any exist, otherwise those two
    /// edits away, and so on up to the configured maximum. The set is
    /// ordered lexicographically, which fixes tie-breaking downstream.
    pub fn candidates(&self, word: &str) -> BTreeSet<String> {
        let needle = word.to_lowercase();
        let len = needle.chars().count();
        let max = self.max_edit_distance;

        let mut tiers: Vec<BTreeSet<String>> = vec![BTreeSet::new(); max + 1];
        for (_, bucket) in self.by_length.range(len.saturating_sub(max)..=len + max) {
            for key in bucket {
                let distance = strsim::levenshtein(&needle, key);
                if (1..=max).contains(&distance) {
                    if let Some(spelling) = self.words.get(key) {
                        tiers[distance].insert(spelling.clone());
                    }
                }
            }
        }

        tiers.into_iter().find(|tier| !tier.is_empty()).unwrap_or_default()
    }
}

/// Output of [`validate`]
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub corrected_text: String,
    /// One entry per non-empty token of the input, each in `[0, 1]`
    pub word_confidence: Vec<f32>,
    /// Mean of `word_confidence`, 0 when there were no tokens
    pub average_confidence: f32,
}

/// Correct `text` token by token.
///
/// Tokens are split on any whitespace and the corrected tokens are joined
/// with single spaces, so line breaks and runs of spaces collapse.
pub fn validate(text: &str, dictionary: &Dictionary) -> ValidationResult {
    let mut corrected = Vec::new();
    let mut word_confidence = Vec::new();
    let mut corrections = 0usize;

    for token in text.split_whitespace() {
        let (word, confidence) = correct_token(token, dictionary);
        if word != token {
            corrections += 1;
        }
        corrected.push(word);
        word_confidence.push(confidence);
    }
    let corrected_text = corrected.join(" ");

    let average_confidence = if word_confidence.is_empty() {
        0.0
    } else {
        word_confidence.iter().sum::<f32>() / word_confidence.len() as f32
    };

    debug!(
        "Spell validation: {} token(s), {} corrected, average confidence {:.3}",
        word_confidence.len(),
        corrections,
        average_confidence
    );

    ValidationResult {
        corrected_text,
        word_confidence,
        average_confidence,
    }
}

fn correct_token(token: &str, dictionary: &Dictionary) -> (String, f32) {
    if dictionary.known(token) {
        return (token.to_string(), 1.0);
    }

    let best = dictionary
        .candidates(token)
        .into_iter()
        .map(|candidate| (strsim::levenshtein(token, &candidate), candidate))
        // min_by_key keeps the first of equal elements: lexicographic order
        .min_by_key(|(distance, _)| *distance);

    match best {
        Some((distance, candidate)) => {
            let confidence = similarity(distance, token, &candidate);
            (candidate, confidence)
        }
        None => (token.to_string(), UNKNOWN_WORD_CONFIDENCE),
    }
}

/// `1 - distance / longest length`, in chars
fn similarity(distance: usize, a: &str, b: &str) -> f32 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    (1.0 - distance as f32 / longest as f32).clamp(0.0, 1.0)
}

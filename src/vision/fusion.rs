//! Result fusion
//!
//! Picks the text of the most confident engine. Confidences are only
//! compared, never blended, so the fused confidence is always one of the
//! inputs.

use std::collections::BTreeMap;
use tracing::debug;

use super::engine::{EngineKind, EngineResult};

/// Fused output of all engines that produced a result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionResult {
    /// Text of the winning engine
    pub text: String,
    /// Confidence of the winning engine (0 - 100)
    pub confidence: f32,
    /// Engine whose result was picked; `None` when no engine ran
    pub winner: Option<EngineKind>,
    /// Every engine result, untouched
    pub per_engine: BTreeMap<EngineKind, EngineResult>,
}

/// Select the most confident result.
///
/// Ties go to the engine that sorts first in [`EngineKind`] order (neural).
/// With no results the output is empty text at confidence 0.
pub fn fuse(results: BTreeMap<EngineKind, EngineResult>) -> FusionResult {
    let mut best: Option<(EngineKind, &EngineResult)> = None;
    for (kind, result) in &results {
        // Iteration follows preference order, so only a strictly higher
        // confidence displaces the current pick
        match best {
            Some((_, current)) if result.confidence <= current.confidence => {}
            _ => best = Some((*kind, result)),
        }
    }

    let Some((winner, picked)) = best else {
        debug!("Fusion received no engine results");
        return FusionResult::default();
    };

    debug!(
        "Fusion picked {} ({:.1}) out of {} result(s)",
        winner,
        picked.confidence,
        results.len()
    );

    let text = picked.text.clone();
    let confidence = picked.confidence;
    FusionResult {
        text,
        confidence,
        winner: Some(winner),
        per_engine: results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::engine::EngineDetail;

    fn neural(text: &str, confidence: f32) -> EngineResult {
        EngineResult {
            text: text.to_string(),
            confidence,
            detail: EngineDetail::Neural { regions: vec![] },
        }
    }

    fn classical(text: &str, confidence: f32) -> EngineResult {
        EngineResult {
            text: text.to_string(),
            confidence,
            detail: EngineDetail::Classical { words: vec![], engine_mode: 3 },
        }
    }

    fn both(n: EngineResult, c: EngineResult) -> BTreeMap<EngineKind, EngineResult> {
        BTreeMap::from([(EngineKind::Neural, n), (EngineKind::Classical, c)])
    }

    #[test]
    fn test_higher_confidence_wins() {
        let fused = fuse(both(neural("Invoice #1234", 92.0), classical("Invoice #1Z34", 71.0)));
        assert_eq!(fused.text, "Invoice #1234");
        assert_eq!(fused.confidence, 92.0);
        assert_eq!(fused.winner, Some(EngineKind::Neural));
        assert_eq!(fused.per_engine.len(), 2);

        let fused = fuse(both(neural("Hel1o", 40.0), classical("Hello", 88.5)));
        assert_eq!(fused.text, "Hello");
        assert_eq!(fused.winner, Some(EngineKind::Classical));
    }

    #[test]
    fn test_tie_prefers_neural() {
        let fused = fuse(both(neural("A", 80.0), classical("B", 80.0)));
        assert_eq!(fused.text, "A");
        assert_eq!(fused.winner, Some(EngineKind::Neural));
    }

    #[test]
    fn test_single_engine_passes_through() {
        let results = BTreeMap::from([(EngineKind::Classical, classical("only", 12.0))]);
        let fused = fuse(results);
        assert_eq!(fused.text, "only");
        assert_eq!(fused.confidence, 12.0);
    }

    #[test]
    fn test_no_results() {
        let fused = fuse(BTreeMap::new());
        assert_eq!(fused.text, "");
        assert_eq!(fused.confidence, 0.0);
        assert!(fused.winner.is_none());
        assert!(fused.per_engine.is_empty());
    }

    #[test]
    fn test_confidence_is_max_of_inputs() {
        for (a, b) in [(0.0, 100.0), (55.5, 55.4), (99.0, 99.5), (10.0, 10.0)] {
            let fused = fuse(both(neural("n", a), classical("c", b)));
            assert_eq!(fused.confidence, f32::max(a, b));
        }
    }

    #[test]
    fn test_raising_winner_confidence_keeps_it_winning() {
        let before = fuse(both(neural("n", 70.0), classical("c", 60.0)));
        let after = fuse(both(neural("n", 75.0), classical("c", 60.0)));
        assert_eq!(before.winner, after.winner);
    }
}

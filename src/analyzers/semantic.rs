//! Lexical-overlap analyzer
//!
//! Treats old and new text as unordered word sets and reports how far
//! apart they are. This is a cheap stand-in for meaning, not an embedding
//! model: a rewrite that keeps the vocabulary scores as "same context".

use super::{clamp_unit, AnalysisInput, SignalAnalyzer};
use crate::error::Result;
use crate::types::{ContextDefinition, ContextSignal, SignalEvidence, SignalKind};
use crate::utils::{jaccard_similarity, word_set};
use std::collections::BTreeSet;

/// Sensitivity boost so modest rewrites still register
const SENSITIVITY: f64 = 1.5;

/// Word-set (Jaccard) distance between revisions
#[derive(Debug, Default)]
pub struct SemanticAnalyzer {
    // (context id, lowercase keywords) of every context except the active one
    contexts: Vec<(String, BTreeSet<String>)>,
}

impl SemanticAnalyzer {
    /// Create an analyzer with no known contexts
    pub fn new() -> Self {
        Self::default()
    }

    /// Context sharing the most vocabulary with `words`, if any
    fn closest_context(&self, words: &BTreeSet<String>, active: Option<&str>) -> Option<String> {
        self.contexts
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != active)
            .map(|(id, keywords)| (id, keywords.intersection(words).count()))
            .filter(|(_, overlap)| *overlap > 0)
            // First context wins ties
            .fold(None, |best: Option<(&String, usize)>, (id, overlap)| match best {
                Some((_, top)) if top >= overlap => best,
                _ => Some((id, overlap)),
            })
            .map(|(id, _)| id.clone())
    }
}

impl SignalAnalyzer for SemanticAnalyzer {
    fn kind(&self) -> SignalKind {
        SignalKind::Semantic
    }

    fn analyze(&mut self, input: &AnalysisInput<'_>) -> Result<Vec<ContextSignal>> {
        let new_words = word_set(input.new_content);
        let old_words = word_set(input.old_content.unwrap_or_default());

        let similarity = jaccard_similarity(&old_words, &new_words);
        let shared_words = old_words.intersection(&new_words).count();
        let total_words = old_words.union(&new_words).count();

        Ok(vec![ContextSignal {
            kind: SignalKind::Semantic,
            confidence: clamp_unit((1.0 - similarity) * SENSITIVITY),
            weight: 1.0,
            suggested_context: self.closest_context(&new_words, input.active_context),
            evidence: SignalEvidence::Semantic {
                similarity,
                shared_words,
                total_words,
            },
        }])
    }

    fn update_contexts(&mut self, contexts: &[ContextDefinition]) {
        self.contexts = contexts
            .iter()
            .filter(|c| !c.is_active)
            .map(|c| {
                let keywords = c.keywords.iter().map(|k| k.to_lowercase()).collect();
                (c.id.clone(), keywords)
            })
            .collect();
    }

    fn reset(&mut self) {
        self.contexts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::test_support::input;

    #[test]
    fn test_identical_text_has_zero_confidence() {
        let mut analyzer = SemanticAnalyzer::new();
        let signals = analyzer
            .analyze(&input("the cat sat on the mat", Some("The cat sat on the mat.")))
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].confidence, 0.0);
        assert_eq!(signals[0].weight, 1.0);
    }

    #[test]
    fn test_confidence_is_boosted_and_capped() {
        let mut analyzer = SemanticAnalyzer::new();

        // similarity 0.5 -> (1 - 0.5) * 1.5 = 0.75
        let signals = analyzer.analyze(&input("the cat ran", Some("the cat sat"))).unwrap();
        assert!((signals[0].confidence - 0.75).abs() < 1e-9);

        let signals = analyzer.analyze(&input("dragons", Some("spreadsheets"))).unwrap();
        assert_eq!(signals[0].confidence, 1.0);
        match &signals[0].evidence {
            SignalEvidence::Semantic { similarity, shared_words, .. } => {
                assert_eq!(*similarity, 0.0);
                assert_eq!(*shared_words, 0);
            }
            other => panic!("unexpected evidence {:?}", other),
        }
    }

    #[test]
    fn test_suggests_context_by_vocabulary() {
        let mut analyzer = SemanticAnalyzer::new();
        analyzer.update_contexts(&[
            ContextDefinition::new("space", "Space", ["rocket", "orbit"]),
            ContextDefinition::new("sea", "Sea", ["ship", "wave", "harbor"]),
        ]);

        let signals = analyzer
            .analyze(&input("The ship left the harbor on a wave", Some("Quarterly report")))
            .unwrap();
        assert_eq!(signals[0].suggested_context.as_deref(), Some("sea"));

        let signals = analyzer.analyze(&input("nothing relevant", None)).unwrap();
        assert_eq!(signals[0].suggested_context, None);
    }
}

//! Context keyword analyzer
//!
//! Finds whole-word, case-insensitive occurrences of the keywords of every
//! known context and scores each candidate context (other than the active
//! one) separately.
//!
//! ## Scoring
//!
//! Per keyword, confidence blends how often it appears, how dense it is in
//! the text and how specific it is (longer keywords weigh more, capped):
//!
//! ```text
//! confidence = 0.4 * min(count / 3, 1)
//!            + 0.3 * min(count / max(len / 100, 1), 1)
//!            + 0.3 * min(keyword_len / 10, 1)
//! ```
//!
//! multiplied by 1.2 when the average match lies in the first or last 20% of
//! the text, then capped at 1. Per context:
//!
//! ```text
//! score = 0.5 * avg(confidence) + 0.3 * min(unique / 5, 1) + 0.2 * min(density, 1)
//! ```
//!
//! with `density = occurrences / max(len / 100, 1)`. Contexts scoring above
//! 0.2 become signals.

use super::{clamp_unit, AnalysisInput, SignalAnalyzer};
use crate::collections::BoundedCache;
use crate::error::Result;
use crate::types::{ContextDefinition, ContextSignal, KeywordMatch, SignalEvidence, SignalKind};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// Contexts must score above this to be reported
const MIN_CONTEXT_SCORE: f64 = 0.2;

/// Keywords this long or longer get the full specificity weight
const SPECIFIC_KEYWORD_LEN: f64 = 10.0;

/// Matches in the outer 20% of the text count for more
const EDGE_SHARE: f64 = 0.2;
const EDGE_BOOST: f64 = 1.2;

/// Reverse-indexed keyword matcher
#[derive(Debug)]
pub struct KeywordAnalyzer {
    /// lowercase keyword -> context ids using it
    index: BTreeMap<String, BTreeSet<String>>,
    /// Context flagged active in its definition
    active_context: Option<String>,
    patterns: BoundedCache<String, Regex>,
}

impl KeywordAnalyzer {
    /// Create an analyzer with a bounded pattern cache
    pub fn new(cache_size: usize) -> Self {
        Self {
            index: BTreeMap::new(),
            active_context: None,
            patterns: BoundedCache::new(cache_size),
        }
    }

    /// Number of distinct indexed keywords
    pub fn keyword_count(&self) -> usize {
        self.index.len()
    }

    /// Compiled patterns currently cached
    pub fn cached_patterns(&self) -> usize {
        self.patterns.len()
    }

    /// Byte offsets of whole-word, case-insensitive occurrences
    pub fn find_matches(&mut self, keyword: &str, content: &str) -> Result<Vec<usize>> {
        let key = keyword.to_lowercase();
        if !self.patterns.contains_key(&key) {
            let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&key)))?;
            self.patterns.insert(key.clone(), pattern);
        }
        Ok(self
            .patterns
            .get(&key)
            .map(|re| re.find_iter(content).map(|m| m.start()).collect())
            .unwrap_or_default())
    }

    fn keyword_confidence(keyword: &str, positions: &[usize], content_len: usize) -> f64 {
        let count = positions.len() as f64;
        let len = content_len as f64;
        let per_hundred = (len / 100.0).max(1.0);

        let frequency = (count / 3.0).min(1.0);
        let density = (count / per_hundred).min(1.0);
        let specificity = (keyword.chars().count() as f64 / SPECIFIC_KEYWORD_LEN).min(1.0);

        let mut confidence = 0.4 * frequency + 0.3 * density + 0.3 * specificity;

        if content_len > 0 && !positions.is_empty() {
            let average = positions.iter().sum::<usize>() as f64 / count;
            let relative = average / len;
            if relative < EDGE_SHARE || relative > 1.0 - EDGE_SHARE {
                confidence *= EDGE_BOOST;
            }
        }
        clamp_unit(confidence)
    }
}

impl Default for KeywordAnalyzer {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SignalAnalyzer for KeywordAnalyzer {
    fn kind(&self) -> SignalKind {
        SignalKind::Keyword
    }

    fn analyze(&mut self, input: &AnalysisInput<'_>) -> Result<Vec<ContextSignal>> {
        let content = input.new_content;
        if content.is_empty() || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let active = input.active_context.or(self.active_context.as_deref()).map(str::to_string);
        let keywords: Vec<(String, BTreeSet<String>)> =
            self.index.iter().map(|(k, ids)| (k.clone(), ids.clone())).collect();

        let mut by_context: BTreeMap<String, Vec<KeywordMatch>> = BTreeMap::new();
        for (keyword, context_ids) in keywords {
            let positions = self.find_matches(&keyword, content)?;
            if positions.is_empty() {
                continue;
            }
            let confidence = Self::keyword_confidence(&keyword, &positions, content.len());
            let found = KeywordMatch {
                keyword,
                occurrences: positions.len(),
                positions,
                confidence,
            };
            for context_id in context_ids {
                if active.as_deref() == Some(context_id.as_str()) {
                    continue;
                }
                by_context.entry(context_id).or_default().push(found.clone());
            }
        }

        let per_hundred = (content.len() as f64 / 100.0).max(1.0);
        let mut signals = Vec::new();
        for (context_id, matches) in by_context {
            let total_occurrences: usize = matches.iter().map(|m| m.occurrences).sum();
            let unique_keywords = matches.len();
            let avg_confidence = matches.iter().map(|m| m.confidence).sum::<f64>() / unique_keywords as f64;
            let diversity = (unique_keywords as f64 / 5.0).min(1.0);
            let density = total_occurrences as f64 / per_hundred;

            let score = 0.5 * avg_confidence + 0.3 * diversity + 0.2 * density.min(1.0);
            if score <= MIN_CONTEXT_SCORE {
                continue;
            }

            signals.push(ContextSignal {
                kind: SignalKind::Keyword,
                confidence: clamp_unit(score),
                weight: 1.0,
                suggested_context: Some(context_id),
                evidence: SignalEvidence::Keyword {
                    matches,
                    total_occurrences,
                    unique_keywords,
                    density,
                    score,
                },
            });
        }
        Ok(signals)
    }

    fn update_contexts(&mut self, contexts: &[ContextDefinition]) {
        self.index.clear();
        self.active_context = None;
        for context in contexts {
            if context.is_active {
                self.active_context = Some(context.id.clone());
            }
            for keyword in &context.keywords {
                let keyword = keyword.trim().to_lowercase();
                if keyword.is_empty() {
                    continue;
                }
                self.index.entry(keyword).or_default().insert(context.id.clone());
            }
        }
    }

    fn reset(&mut self) {
        self.index.clear();
        self.active_context = None;
        self.patterns.clear();
    }
}

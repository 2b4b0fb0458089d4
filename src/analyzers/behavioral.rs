//! Edit-size analyzer

use super::{AnalysisInput, SignalAnalyzer};
use crate::error::Result;
use crate::types::{ContextSignal, SignalEvidence, SignalKind};

/// Reports how many characters the content grew or shrank by
///
/// Only the previous content length is remembered. On the first call the
/// caller-provided old content (if any) stands in for it.
#[derive(Debug, Default)]
pub struct BehavioralAnalyzer {
    previous_length: Option<usize>,
}

impl BehavioralAnalyzer {
    /// Create an analyzer with no remembered length
    pub fn new() -> Self {
        Self::default()
    }

    /// Confidence for an absolute character delta
    pub fn confidence_for(change_size: usize) -> f64 {
        match change_size {
            300.. => 1.0,
            50..=299 => 0.7,
            20..=49 => 0.3,
            _ => 0.0,
        }
    }
}

impl SignalAnalyzer for BehavioralAnalyzer {
    fn kind(&self) -> SignalKind {
        SignalKind::Behavioral
    }

    fn analyze(&mut self, input: &AnalysisInput<'_>) -> Result<Vec<ContextSignal>> {
        let current_length = input.new_content.chars().count();
        let previous_length = self
            .previous_length
            .or_else(|| input.old_content.map(|old| old.chars().count()))
            .unwrap_or(0);
        self.previous_length = Some(current_length);

        let change_size = current_length.abs_diff(previous_length);
        Ok(vec![ContextSignal {
            kind: SignalKind::Behavioral,
            confidence: Self::confidence_for(change_size),
            weight: 0.75,
            suggested_context: None,
            evidence: SignalEvidence::Behavioral {
                previous_length,
                current_length,
                change_size,
            },
        }])
    }

    fn reset(&mut self) {
        self.previous_length = None;
    }
}

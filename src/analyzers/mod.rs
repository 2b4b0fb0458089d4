//! Signal analyzers
//!
//! Each analyzer looks at one aspect of an edit and reports zero or more
//! [`ContextSignal`]s about whether the author moved to a different writing
//! context. The [`crate::detection::ContextDetectionEngine`] fuses them.
//!
//! | Analyzer | Looks at | Signals per call |
//! |---|---|---|
//! | [`SemanticAnalyzer`] | word overlap between old and new text | exactly one |
//! | [`KeywordAnalyzer`] | context keywords in the new text | one per candidate context |
//! | [`TemporalAnalyzer`] | idle gaps, sessions, time of day, bursts | one per fired pattern |
//! | [`BehavioralAnalyzer`] | size of the edit | exactly one |
//!
//! Analyzers own only small bounded state (previous length, recent edit
//! times, compiled patterns). Custom analyzers plug in through the
//! [`SignalAnalyzer`] trait.

pub mod behavioral;
pub mod keyword;
pub mod semantic;
pub mod temporal;

pub use behavioral::BehavioralAnalyzer;
pub use keyword::KeywordAnalyzer;
pub use semantic::SemanticAnalyzer;
pub use temporal::TemporalAnalyzer;

use crate::error::Result;
use crate::types::{ContextDefinition, ContextSignal, FileOperation, SignalKind};
use chrono::{DateTime, Utc};

/// Everything an analyzer may look at for one edit
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInput<'a> {
    /// Content after the edit
    pub new_content: &'a str,
    /// Content before the edit, if known
    pub old_content: Option<&'a str>,
    /// Context the author is currently believed to be writing in
    pub active_context: Option<&'a str>,
    /// Time of the edit
    pub timestamp: DateTime<Utc>,
    /// What triggered the analysis
    pub trigger: FileOperation,
}

/// A source of context-shift signals
pub trait SignalAnalyzer: Send {
    /// Kind of signal this analyzer emits
    fn kind(&self) -> SignalKind;

    /// Inspect one edit
    ///
    /// An error drops this analyzer's contribution for the edit; it never
    /// aborts detection as a whole.
    fn analyze(&mut self, input: &AnalysisInput<'_>) -> Result<Vec<ContextSignal>>;

    /// Receive the current set of context definitions
    fn update_contexts(&mut self, _contexts: &[ContextDefinition]) {}

    /// Forget accumulated state
    fn reset(&mut self) {}
}

/// Clamp a computed confidence into [0,1]
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

//! Context-shift detection
//!
//! [`ContextDetectionEngine`] runs every registered analyzer over an edit
//! and fuses their signals into a single probability:
//!
//! ```text
//! probability = Σ(confidence × weight) / Σ(weight)
//! ```
//!
//! An analyzer that fails is logged and skipped; detection carries on with
//! whatever signals remain. A result is produced only when at least one
//! usable signal survives and the fused probability clears the engine's
//! minimum-confidence gate.
//!
//! ## Example
//!
//! ```rust
//! use palimpsest::detection::ContextDetectionEngine;
//! use palimpsest::types::{ContextDefinition, FileOperation};
//!
//! let mut engine = ContextDetectionEngine::default();
//! engine.initialize(vec![ContextDefinition::new(
//!     "fantasy-magic",
//!     "Fantasy",
//!     ["magic", "spell", "wizard"],
//! )]);
//!
//! let detection = engine
//!     .analyze(
//!         "The wizard raised a staff and the spell tore the sky open.",
//!         Some("Quarterly revenue grew four percent."),
//!         FileOperation::Modify,
//!     )
//!     .expect("a complete rewrite is a shift");
//! assert_eq!(detection.suggested_context.as_deref(), Some("fantasy-magic"));
//! ```

use crate::analyzers::{
    AnalysisInput, BehavioralAnalyzer, KeywordAnalyzer, SemanticAnalyzer, SignalAnalyzer, TemporalAnalyzer,
};
use crate::clock::{Clock, SystemClock};
use crate::logging::Logger;
use crate::types::{
    ContextDefinition, ContextShiftDetection, ContextSignal, FileOperation, VersioningConfig, MAX_SESSION_PAUSE_SECS,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Multi-signal context-shift detector
pub struct ContextDetectionEngine {
    analyzers: Vec<Box<dyn SignalAnalyzer>>,
    contexts: BTreeMap<String, ContextDefinition>,
    active_context: Option<String>,
    min_confidence: f64,
    clock: Arc<dyn Clock>,
    logger: Logger,
}

impl std::fmt::Debug for ContextDetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextDetectionEngine")
            .field("analyzers", &self.analyzers.iter().map(|a| a.kind()).collect::<Vec<_>>())
            .field("contexts", &self.contexts.len())
            .field("active_context", &self.active_context)
            .field("min_confidence", &self.min_confidence)
            .finish()
    }
}

impl ContextDetectionEngine {
    /// Create an engine with the four built-in analyzers
    ///
    /// A session pause beyond [`MAX_SESSION_PAUSE_SECS`] is clamped to it.
    pub fn new(config: &VersioningConfig, clock: Arc<dyn Clock>, logger: Logger) -> Self {
        let session_pause = chrono::Duration::seconds(config.session_pause_secs.min(MAX_SESSION_PAUSE_SECS) as i64);
        let analyzers: Vec<Box<dyn SignalAnalyzer>> = vec![
            Box::new(SemanticAnalyzer::new()),
            Box::new(KeywordAnalyzer::new(config.keyword_cache_size)),
            Box::new(TemporalAnalyzer::new(session_pause)),
            Box::new(BehavioralAnalyzer::new()),
        ];
        Self {
            analyzers,
            contexts: BTreeMap::new(),
            active_context: None,
            min_confidence: config.min_detection_confidence,
            clock,
            logger,
        }
    }

    /// Create an engine with no analyzers at all
    pub fn empty(clock: Arc<dyn Clock>, logger: Logger) -> Self {
        Self {
            analyzers: Vec::new(),
            contexts: BTreeMap::new(),
            active_context: None,
            min_confidence: 0.0,
            clock,
            logger,
        }
    }

    /// Register an additional analyzer
    pub fn add_analyzer(&mut self, mut analyzer: Box<dyn SignalAnalyzer>) {
        analyzer.update_contexts(&self.context_list());
        self.analyzers.push(analyzer);
    }

    /// Number of registered analyzers
    pub fn analyzer_count(&self) -> usize {
        self.analyzers.len()
    }

    /// Load the initial set of contexts
    pub fn initialize(&mut self, contexts: Vec<ContextDefinition>) {
        self.logger.debug(format!("Initializing detection with {} contexts", contexts.len()));
        self.update_contexts(contexts);
    }

    /// Replace all known contexts
    pub fn update_contexts(&mut self, contexts: Vec<ContextDefinition>) {
        self.contexts = contexts.into_iter().map(|c| (c.id.clone(), c)).collect();
        if let Some(active) = self.contexts.values().find(|c| c.is_active) {
            self.active_context = Some(active.id.clone());
        } else if let Some(current) = &self.active_context {
            if !self.contexts.contains_key(current) {
                self.active_context = None;
            }
        }
        self.propagate();
    }

    /// Add or replace one context
    pub fn add_context(&mut self, context: ContextDefinition) {
        if context.is_active {
            self.active_context = Some(context.id.clone());
        }
        self.contexts.insert(context.id.clone(), context);
        self.propagate();
    }

    /// Remove a context, returning whether it existed
    pub fn remove_context(&mut self, context_id: &str) -> bool {
        let removed = self.contexts.remove(context_id).is_some();
        if removed {
            if self.active_context.as_deref() == Some(context_id) {
                self.active_context = None;
            }
            self.propagate();
        }
        removed
    }

    /// Known contexts
    pub fn contexts(&self) -> impl Iterator<Item = &ContextDefinition> {
        self.contexts.values()
    }

    /// Context the author is believed to be writing in
    pub fn active_context(&self) -> Option<&str> {
        self.active_context.as_deref()
    }

    /// Mark a context as the one currently being written in
    ///
    /// Keyword matches for the active context are not reported as shifts.
    pub fn set_active_context(&mut self, context_id: Option<String>) {
        for context in self.contexts.values_mut() {
            context.is_active = context_id.as_deref() == Some(context.id.as_str());
        }
        self.active_context = context_id;
        self.propagate();
    }

    /// Minimum fused probability for a detection to be returned
    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Change the minimum-confidence gate
    pub fn set_min_confidence(&mut self, min_confidence: f64) {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
    }

    /// Clear analyzer state (sessions, remembered lengths, caches)
    pub fn reset(&mut self) {
        for analyzer in &mut self.analyzers {
            analyzer.reset();
        }
        self.propagate();
    }

    /// Analyse one edit
    ///
    /// Returns `None` when no analyzer produced a usable signal or the fused
    /// probability falls below the minimum-confidence gate.
    pub fn analyze(
        &mut self,
        new_content: &str,
        old_content: Option<&str>,
        trigger: FileOperation,
    ) -> Option<ContextShiftDetection> {
        let timestamp = self.clock.now();
        let input = AnalysisInput {
            new_content,
            old_content,
            active_context: self.active_context.as_deref(),
            timestamp,
            trigger,
        };

        let mut signals: Vec<ContextSignal> = Vec::new();
        for analyzer in &mut self.analyzers {
            match analyzer.analyze(&input) {
                Ok(produced) => {
                    let usable = produced.into_iter().filter(|s| {
                        s.confidence.is_finite() && s.weight.is_finite() && s.weight > 0.0
                    });
                    signals.extend(usable);
                }
                Err(e) => {
                    self.logger
                        .warn(format!("{} analyzer failed, continuing without it: {}", analyzer.kind(), e));
                }
            }
        }

        if signals.is_empty() {
            self.logger.debug("No usable signals for this edit");
            return None;
        }

        let probability = Self::fuse(&signals);
        if probability < self.min_confidence {
            self.logger.trace(format!(
                "Shift probability {:.3} below gate {:.3}",
                probability, self.min_confidence
            ));
            return None;
        }

        let suggested_context = Self::suggest(&signals);
        self.logger.debug(format!(
            "Fused {} signals into probability {:.3} (suggested context: {:?})",
            signals.len(),
            probability,
            suggested_context
        ));

        Some(ContextShiftDetection {
            probability,
            suggested_context,
            signals,
            timestamp,
            trigger,
        })
    }

    /// Weighted mean of signal confidences, zero for no signals
    pub fn fuse(signals: &[ContextSignal]) -> f64 {
        let total_weight: f64 = signals.iter().map(|s| s.weight).sum();
        if signals.is_empty() || total_weight <= 0.0 {
            return 0.0;
        }
        let weighted: f64 = signals.iter().map(ContextSignal::weighted).sum();
        (weighted / total_weight).clamp(0.0, 1.0)
    }

    /// Context named by the strongest signal that names one
    fn suggest(signals: &[ContextSignal]) -> Option<String> {
        signals
            .iter()
            .filter(|s| s.suggested_context.is_some())
            .fold(None, |best: Option<&ContextSignal>, s| match best {
                Some(b) if b.weighted() >= s.weighted() => Some(b),
                _ => Some(s),
            })
            .and_then(|s| s.suggested_context.clone())
    }

    fn context_list(&self) -> Vec<ContextDefinition> {
        self.contexts.values().cloned().collect()
    }

    fn propagate(&mut self) {
        let contexts = self.context_list();
        for analyzer in &mut self.analyzers {
            analyzer.update_contexts(&contexts);
        }
    }
}

impl Default for ContextDetectionEngine {
    fn default() -> Self {
        Self::new(&VersioningConfig::default(), Arc::new(SystemClock), Logger::new("detection"))
    }
}

//! Timing analyzer
//!
//! Watches *when* edits happen rather than what they contain. Four patterns
//! can fire independently on each call:
//!
//! | Pattern | Fires when | Confidence | Weight |
//! |---|---|---|---|
//! | idle gap | ≥ 5 min since last analysis (≥ 1 min) | 1.0 (0.5) | 0.8 |
//! | unusual hour | hour holds < 2% of ≥ 20 past edits | 0.6 | 0.5 |
//! | intensity shift | session edit rate deviates > 50% from past sessions | deviation, capped | 0.6 |
//! | edit burst | ≥ 5 edits within 5 min | 0.7 | 0.7 |
//!
//! A session ends after a configurable pause (15 minutes by default).

use super::{clamp_unit, AnalysisInput, SignalAnalyzer};
use crate::error::Result;
use crate::types::{ContextSignal, SignalEvidence, SignalKind, TemporalEvidence};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::VecDeque;

const LONG_IDLE_SECS: i64 = 5 * 60;
const SHORT_IDLE_SECS: i64 = 60;
const BURST_WINDOW_SECS: i64 = 5 * 60;
const BURST_OPERATIONS: usize = 5;
const MIN_HOUR_SAMPLES: u32 = 20;
const UNUSUAL_HOUR_SHARE: f64 = 0.02;
const INTENSITY_DEVIATION: f64 = 0.5;
/// Sessions shorter than this many edits say nothing about intensity
const MIN_SESSION_EDITS: usize = 3;
const MAX_RECENT_EDITS: usize = 256;
const MAX_SESSIONS: usize = 50;

#[derive(Debug, Clone, Copy)]
struct Session {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    edits: usize,
}

impl Session {
    fn starting(at: DateTime<Utc>) -> Self {
        Self {
            start: at,
            end: at,
            edits: 0,
        }
    }

    /// Edits per minute, treating anything shorter than a minute as one
    fn rate(&self) -> f64 {
        let minutes = (self.end - self.start).num_seconds() as f64 / 60.0;
        self.edits as f64 / minutes.max(1.0)
    }
}

/// Idle, rhythm and time-of-day analyzer
#[derive(Debug)]
pub struct TemporalAnalyzer {
    session_pause: Duration,
    last_analysis: Option<DateTime<Utc>>,
    recent_edits: VecDeque<DateTime<Utc>>,
    hour_histogram: [u32; 24],
    current_session: Option<Session>,
    past_sessions: VecDeque<Session>,
}

impl TemporalAnalyzer {
    /// Create an analyzer with the given session pause
    pub fn new(session_pause: Duration) -> Self {
        Self {
            session_pause,
            last_analysis: None,
            recent_edits: VecDeque::new(),
            hour_histogram: [0; 24],
            current_session: None,
            past_sessions: VecDeque::new(),
        }
    }

    /// Number of finished sessions remembered
    pub fn session_count(&self) -> usize {
        self.past_sessions.len()
    }

    fn signal(confidence: f64, weight: f64, evidence: TemporalEvidence) -> ContextSignal {
        ContextSignal {
            kind: SignalKind::Temporal,
            confidence: clamp_unit(confidence),
            weight,
            suggested_context: None,
            evidence: SignalEvidence::Temporal(evidence),
        }
    }

    fn idle_signal(&self, now: DateTime<Utc>) -> Option<ContextSignal> {
        let idle_seconds = (now - self.last_analysis?).num_seconds();
        let confidence = if idle_seconds >= LONG_IDLE_SECS {
            1.0
        } else if idle_seconds >= SHORT_IDLE_SECS {
            0.5
        } else {
            return None;
        };
        Some(Self::signal(confidence, 0.8, TemporalEvidence::IdleGap { idle_seconds }))
    }

    fn hour_signal(&self, now: DateTime<Utc>) -> Option<ContextSignal> {
        let total: u32 = self.hour_histogram.iter().sum();
        if total < MIN_HOUR_SAMPLES {
            return None;
        }
        let hour = now.hour();
        let share = self.hour_histogram[hour as usize] as f64 / total as f64;
        (share < UNUSUAL_HOUR_SHARE).then(|| Self::signal(0.6, 0.5, TemporalEvidence::UnusualHour { hour, share }))
    }

    fn intensity_signal(&self) -> Option<ContextSignal> {
        let current = self.current_session?;
        if current.edits < MIN_SESSION_EDITS || self.past_sessions.is_empty() {
            return None;
        }
        let average_rate =
            self.past_sessions.iter().map(Session::rate).sum::<f64>() / self.past_sessions.len() as f64;
        if average_rate <= 0.0 {
            return None;
        }
        let current_rate = current.rate();
        let deviation = (current_rate - average_rate).abs() / average_rate;
        (deviation > INTENSITY_DEVIATION).then(|| {
            Self::signal(
                deviation,
                0.6,
                TemporalEvidence::IntensityShift {
                    current_rate,
                    average_rate,
                    deviation,
                },
            )
        })
    }

    fn burst_signal(&self, now: DateTime<Utc>) -> Option<ContextSignal> {
        let window_start = now - Duration::seconds(BURST_WINDOW_SECS);
        let operations = self.recent_edits.iter().filter(|t| **t >= window_start).count();
        (operations >= BURST_OPERATIONS).then(|| {
            Self::signal(
                0.7,
                0.7,
                TemporalEvidence::EditBurst {
                    operations,
                    window_seconds: BURST_WINDOW_SECS,
                },
            )
        })
    }

    /// Fold the edit at `now` into sessions, history and the histogram
    fn record(&mut self, now: DateTime<Utc>) {
        let continues = self
            .current_session
            .map(|s| now - s.end < self.session_pause)
            .unwrap_or(false);
        if !continues {
            if let Some(finished) = self.current_session.take() {
                if finished.edits >= MIN_SESSION_EDITS {
                    self.past_sessions.push_back(finished);
                    if self.past_sessions.len() > MAX_SESSIONS {
                        self.past_sessions.pop_front();
                    }
                }
            }
            self.current_session = Some(Session::starting(now));
        }
        if let Some(session) = self.current_session.as_mut() {
            session.edits += 1;
            session.end = now;
        }

        self.recent_edits.push_back(now);
        if self.recent_edits.len() > MAX_RECENT_EDITS {
            self.recent_edits.pop_front();
        }
        self.hour_histogram[now.hour() as usize] += 1;
        self.last_analysis = Some(now);
    }
}

impl Default for TemporalAnalyzer {
    fn default() -> Self {
        Self::new(Duration::minutes(15))
    }
}

impl SignalAnalyzer for TemporalAnalyzer {
    fn kind(&self) -> SignalKind {
        SignalKind::Temporal
    }

    fn analyze(&mut self, input: &AnalysisInput<'_>) -> Result<Vec<ContextSignal>> {
        let now = input.timestamp;
        let mut signals = Vec::new();

        // Idle and hour checks look at the past only
        signals.extend(self.idle_signal(now));
        signals.extend(self.hour_signal(now));

        self.record(now);

        signals.extend(self.intensity_signal());
        signals.extend(self.burst_signal(now));
        Ok(signals)
    }

    fn reset(&mut self) {
        *self = Self::new(self.session_pause);
    }
}

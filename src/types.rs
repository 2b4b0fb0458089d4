//! Core data types used throughout the Palimpsest library
//!
//! This module contains the data structures shared across components.
//!
//! ## Overview
//!
//! - **Timeline**: [`TimelineNode`], [`TimelineBranch`], [`FileVersionHistory`],
//!   the append-mostly DAG of versions. All references between entities are
//!   ids looked up in the store, never embedded objects.
//! - **Content**: [`VersionSnapshot`], [`CompressedDiff`], the payload of a
//!   node, either full text or a compressed patch against its parent.
//! - **Detection**: [`ContextDefinition`], [`ContextSignal`],
//!   [`ContextShiftDetection`], the inputs and output of signal fusion.
//! - **Navigation and merging**: [`NavigationPath`], [`MergeOptions`],
//!   [`MergeResult`], [`MergeConflict`].
//! - **Host surface**: [`FileEvent`], [`ChangeOutcome`], [`VersioningConfig`],
//!   [`Statistics`].

use crate::compression::CompressionStrategy;
use crate::error::{Result, VersioningError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Who created a timeline node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Creator {
    /// Explicit user action (manual checkpoint, merge, branch switch)
    User,
    /// Created by context-shift detection
    Auto,
}

/// Per-node metadata describing the version it stands for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Owning file id
    pub file_id: String,
    /// File path at the time the node was created
    pub file_path: String,
    /// Words in the version's content
    pub word_count: usize,
    /// Characters in the version's content
    pub char_count: usize,
    /// SHA-256 of the version's content
    pub content_hash: String,
    /// Whether a user or the detector created the node
    pub creator: Creator,
}

/// One point in a file's history
///
/// More than one parent marks a merge node; more than one child marks a
/// branch point. Edges are stored on both ends and must agree: every id in
/// `child_ids` of A lists A in its own `parent_ids`, and vice versa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineNode {
    /// Unique identifier
    pub id: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Parent node ids, in order
    pub parent_ids: Vec<String>,
    /// Child node ids, in creation order
    pub child_ids: Vec<String>,
    /// Context the version was written in, if known
    pub context_id: Option<String>,
    /// Human readable label
    pub label: String,
    /// Whether this node is a manual checkpoint
    pub is_checkpoint: bool,
    /// Version metadata
    pub metadata: NodeMetadata,
}

impl TimelineNode {
    /// Whether this node joins two or more lines of history
    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }

    /// Whether history forks at this node
    pub fn is_branch_point(&self) -> bool {
        self.child_ids.len() > 1
    }

    /// Whether this is the first node of a file
    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }

    /// First parent, which is what backward navigation follows
    pub fn first_parent(&self) -> Option<&str> {
        self.parent_ids.first().map(String::as_str)
    }

    /// Owning file id
    pub fn file_id(&self) -> &str {
        &self.metadata.file_id
    }

    /// Get a one-line display string for this node
    pub fn display_format(&self) -> String {
        let mut marks = String::new();
        if self.is_checkpoint {
            marks.push_str(" [checkpoint]");
        }
        if self.is_merge() {
            marks.push_str(" [merge]");
        }
        format!(
            "{} {} {}{}",
            crate::utils::short_id(&self.id),
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.label,
            marks
        )
    }
}

/// Compression algorithm applied to a stored payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    None,
    /// LZ4 block compression with prepended size
    Lz4,
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::None => write!(f, "none"),
            CompressionAlgorithm::Lz4 => write!(f, "lz4"),
        }
    }
}

/// A compressed payload tagged with the algorithm that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedDiff {
    /// Algorithm used for `data`
    pub algorithm: CompressionAlgorithm,
    /// Compressed bytes
    pub data: Vec<u8>,
    /// Size before compression
    pub original_size: usize,
    /// Size after compression (`data.len()`)
    pub compressed_size: usize,
}

impl CompressedDiff {
    /// Fraction of space saved, 0.0 when nothing was saved
    pub fn savings(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        1.0 - (self.compressed_size as f64 / self.original_size as f64).min(1.0)
    }
}

/// The content payload for one timeline node
///
/// Exactly one of `full_content` and `diff_from_parent` is set. A diff is
/// relative to the snapshot named by `parent_snapshot_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    /// Unique identifier
    pub id: String,
    /// Owning file id
    pub file_id: String,
    /// Node this snapshot belongs to
    pub node_id: String,
    /// Snapshot the diff applies to
    pub parent_snapshot_id: Option<String>,
    /// SHA-256 of the reconstructed content
    pub content_hash: String,
    /// Size of the reconstructed content in bytes
    pub size: usize,
    /// Complete text
    pub full_content: Option<String>,
    /// Compressed patch from the parent snapshot's content
    pub diff_from_parent: Option<CompressedDiff>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl VersionSnapshot {
    /// Whether this snapshot carries full content
    pub fn is_full(&self) -> bool {
        self.full_content.is_some()
    }

    /// Check that exactly one payload is present
    pub fn validate(&self) -> Result<()> {
        match (&self.full_content, &self.diff_from_parent) {
            (Some(_), None) => Ok(()),
            (None, Some(_)) if self.parent_snapshot_id.is_some() => Ok(()),
            (None, Some(_)) => Err(VersioningError::integrity(format!(
                "snapshot {} carries a diff but names no parent snapshot",
                self.id
            ))),
            (Some(_), Some(_)) => Err(VersioningError::integrity(format!(
                "snapshot {} carries both full content and a diff",
                self.id
            ))),
            (None, None) => Err(VersioningError::integrity(format!(
                "snapshot {} carries neither full content nor a diff",
                self.id
            ))),
        }
    }

    /// Bytes this snapshot occupies in storage
    pub fn stored_size(&self) -> usize {
        match (&self.full_content, &self.diff_from_parent) {
            (Some(content), _) => content.len(),
            (None, Some(diff)) => diff.compressed_size,
            (None, None) => 0,
        }
    }
}

/// Per-file aggregate of history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileVersionHistory {
    /// File id
    pub file_id: String,
    /// Current path of the file
    pub file_path: String,
    /// Head node id
    pub current_version: Option<String>,
    /// Snapshot ids, oldest first
    pub snapshots: Vec<String>,
    /// Branch ids, oldest first
    pub branches: Vec<String>,
    /// Last mutation time
    pub last_modified: DateTime<Utc>,
}

impl FileVersionHistory {
    /// Create an empty history
    pub fn new(file_id: impl Into<String>, file_path: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            file_id: file_id.into(),
            file_path: file_path.into(),
            current_version: None,
            snapshots: Vec::new(),
            branches: Vec::new(),
            last_modified: now,
        }
    }
}

/// An alternate line of development within one file
///
/// The node sequence always starts at `parent_node_id`. At most one branch
/// per file is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineBranch {
    /// Unique identifier
    pub id: String,
    /// Owning file id
    pub file_id: String,
    /// Display name
    pub name: String,
    /// Node the branch was started from
    pub parent_node_id: String,
    /// Nodes on this branch, starting with `parent_node_id`
    pub node_ids: Vec<String>,
    /// Whether this is the file's active branch
    pub is_active: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl TimelineBranch {
    /// Last node on the branch
    pub fn last_node(&self) -> Option<&str> {
        self.node_ids.last().map(String::as_str)
    }

    /// Whether the branch contains a node
    pub fn contains(&self, node_id: &str) -> bool {
        self.node_ids.iter().any(|id| id == node_id)
    }
}

/// A writing context the detector can suggest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDefinition {
    /// Unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Keywords that indicate this context
    pub keywords: Vec<String>,
    /// Display color (hex)
    pub color: String,
    /// Whether the author is currently writing in this context
    pub is_active: bool,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ContextDefinition {
    /// Create an inactive context with the given keywords
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            keywords: keywords.into_iter().map(Into::into).collect(),
            color: "#888888".to_string(),
            is_active: false,
            metadata: BTreeMap::new(),
        }
    }
}

/// Analyzer that produced a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Lexical overlap between old and new text
    Semantic,
    /// Idle gaps, session rhythm and time of day
    Temporal,
    /// Size of the edit
    Behavioral,
    /// Context keyword matches
    Keyword,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Semantic => "semantic",
            SignalKind::Temporal => "temporal",
            SignalKind::Behavioral => "behavioral",
            SignalKind::Keyword => "keyword",
        };
        f.write_str(name)
    }
}

/// One keyword found in the analysed text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordMatch {
    /// Keyword as defined on the context
    pub keyword: String,
    /// Number of whole-word occurrences
    pub occurrences: usize,
    /// Byte offsets of each occurrence
    pub positions: Vec<usize>,
    /// Per-keyword confidence in [0,1]
    pub confidence: f64,
}

/// Which temporal pattern fired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "kebab-case")]
pub enum TemporalEvidence {
    /// Long pause since the previous analysis
    IdleGap {
        /// Seconds since the previous analysis
        idle_seconds: i64,
    },
    /// Editing at an hour the author rarely writes at
    UnusualHour {
        /// Hour of day (UTC)
        hour: u32,
        /// Share of past edits made at this hour
        share: f64,
    },
    /// Current session's edit rate deviates from the historical average
    IntensityShift {
        /// Edits per minute in the current session
        current_rate: f64,
        /// Average edits per minute over past sessions
        average_rate: f64,
        /// Relative deviation
        deviation: f64,
    },
    /// Many edits in a short window
    EditBurst {
        /// Edits inside the window
        operations: usize,
        /// Window length in seconds
        window_seconds: i64,
    },
}

/// Analyzer-specific evidence carried by a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalEvidence {
    /// Word-set comparison
    Semantic {
        /// Jaccard similarity of old and new word sets
        similarity: f64,
        /// Words present in both
        shared_words: usize,
        /// Words present in either
        total_words: usize,
    },
    /// Keyword hits for one candidate context
    Keyword {
        /// Matched keywords
        matches: Vec<KeywordMatch>,
        /// Sum of occurrences across keywords
        total_occurrences: usize,
        /// Distinct keywords matched
        unique_keywords: usize,
        /// Occurrences per 100 characters
        density: f64,
        /// Combined score before thresholding
        score: f64,
    },
    /// Timing pattern
    Temporal(TemporalEvidence),
    /// Edit size
    Behavioral {
        /// Content length at the previous analysis
        previous_length: usize,
        /// Content length now
        current_length: usize,
        /// Absolute character delta
        change_size: usize,
    },
}

impl SignalEvidence {
    /// Number of keyword occurrences, zero for non-keyword evidence
    pub fn match_count(&self) -> usize {
        match self {
            SignalEvidence::Keyword { total_occurrences, .. } => *total_occurrences,
            _ => 0,
        }
    }
}

/// One analyzer's opinion on whether the writing context changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSignal {
    /// Analyzer kind
    pub kind: SignalKind,
    /// Confidence in [0,1]
    pub confidence: f64,
    /// Fusion weight
    pub weight: f64,
    /// Context this signal points at, if any
    pub suggested_context: Option<String>,
    /// What the analyzer saw
    pub evidence: SignalEvidence,
}

impl ContextSignal {
    /// Weighted contribution to fusion
    pub fn weighted(&self) -> f64 {
        self.confidence * self.weight
    }
}

/// What happened to a file to trigger an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    /// File created
    Create,
    /// File content changed
    Modify,
    /// File renamed
    Rename,
    /// File deleted
    Delete,
}

/// Fused detection result for one edit
///
/// Ephemeral: consumed by the orchestrator, never persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextShiftDetection {
    /// Fused probability in [0,1]
    pub probability: f64,
    /// Best context candidate
    pub suggested_context: Option<String>,
    /// Signals that contributed
    pub signals: Vec<ContextSignal>,
    /// Analysis time
    pub timestamp: DateTime<Utc>,
    /// Operation that triggered the analysis
    pub trigger: FileOperation,
}

/// Notification delivered by the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// A new file appeared
    Created {
        /// File id
        file_id: String,
        /// File path
        path: String,
        /// Initial content
        content: String,
    },
    /// A file's content changed
    Modified {
        /// File id
        file_id: String,
        /// File path
        path: String,
        /// New content
        content: String,
    },
    /// A file moved
    Renamed {
        /// File id
        file_id: String,
        /// Previous path
        old_path: String,
        /// New path
        new_path: String,
    },
    /// A file was removed
    Deleted {
        /// File id
        file_id: String,
        /// Last known path
        path: String,
    },
}

impl FileEvent {
    /// File id the event is about
    pub fn file_id(&self) -> &str {
        match self {
            FileEvent::Created { file_id, .. }
            | FileEvent::Modified { file_id, .. }
            | FileEvent::Renamed { file_id, .. }
            | FileEvent::Deleted { file_id, .. } => file_id,
        }
    }

    /// Operation kind
    pub fn operation(&self) -> FileOperation {
        match self {
            FileEvent::Created { .. } => FileOperation::Create,
            FileEvent::Modified { .. } => FileOperation::Modify,
            FileEvent::Renamed { .. } => FileOperation::Rename,
            FileEvent::Deleted { .. } => FileOperation::Delete,
        }
    }
}

/// What the orchestrator did with one change
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// Content is identical to the head version
    Unchanged,
    /// Detection ran but did not clear the shift threshold
    NoShift {
        /// Fused probability, zero when the gate suppressed the result
        probability: f64,
    },
    /// A snapshot and node were created
    Versioned {
        /// New snapshot id
        snapshot_id: String,
        /// New node id
        node_id: String,
        /// Detection that caused it, `None` for initial versions
        detection: Option<ContextShiftDetection>,
    },
    /// A shift was detected but the per-file rate limit was reached
    RateLimited {
        /// The suppressed detection
        detection: ContextShiftDetection,
    },
    /// The snapshot was stored but the timeline could not be updated
    PartialSuccess {
        /// Stored snapshot id
        snapshot_id: String,
        /// What failed
        reason: String,
    },
    /// Event needed no versioning work (rename, delete)
    Recorded,
}

impl ChangeOutcome {
    /// Whether a new version was stored
    pub fn created_version(&self) -> bool {
        matches!(self, ChangeOutcome::Versioned { .. } | ChangeOutcome::PartialSuccess { .. })
    }
}

/// How two branches are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Target content wins outright
    LatestWins,
    /// Line-by-line merge that fails on any conflicting line
    SmartMerge,
    /// Embed both variants between conflict markers
    ConflictMarkers,
    /// Report conflicts only
    Manual,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStrategy::LatestWins => "latest-wins",
            MergeStrategy::SmartMerge => "smart-merge",
            MergeStrategy::ConflictMarkers => "conflict-markers",
            MergeStrategy::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl FromStr for MergeStrategy {
    type Err = VersioningError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "latest-wins" => Ok(MergeStrategy::LatestWins),
            "smart-merge" => Ok(MergeStrategy::SmartMerge),
            "conflict-markers" => Ok(MergeStrategy::ConflictMarkers),
            "manual" => Ok(MergeStrategy::Manual),
            other => Err(VersioningError::InvalidConfiguration(format!(
                "unknown merge strategy '{}'",
                other
            ))),
        }
    }
}

/// Category of a merge conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// Text differs on both sides
    Content,
    /// Node metadata (context) differs
    Metadata,
    /// Shape of history prevents merging
    Structure,
}

/// One detected conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    /// Conflict category
    pub kind: ConflictKind,
    /// 1-based line number for content conflicts
    pub line: Option<usize>,
    /// Source side value
    pub source: String,
    /// Target side value
    pub target: String,
    /// Human readable description
    pub description: String,
}

/// Parameters of a branch merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    /// Strategy
    pub strategy: MergeStrategy,
    /// Deactivate the source branch after a successful merge
    pub preserve_history: bool,
    /// Label for the merge node
    pub label: Option<String>,
}

impl MergeOptions {
    /// Options with the given strategy and defaults otherwise
    pub fn new(strategy: MergeStrategy) -> Self {
        Self {
            strategy,
            preserve_history: false,
            label: None,
        }
    }
}

/// Outcome of a branch merge
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    /// Whether a merge node was created
    pub success: bool,
    /// Strategy used
    pub strategy: MergeStrategy,
    /// The merge node, on success
    pub merged_node: Option<TimelineNode>,
    /// Merged text, when the strategy produced one
    pub merged_content: Option<String>,
    /// Detected conflicts
    pub conflicts: Vec<MergeConflict>,
}

/// Shape of a path between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    /// No branching or merging along the path
    Linear,
    /// Some node on the path has more than one child
    Branched,
    /// Some node on the path has more than one parent
    Merged,
}

/// A route through the timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationPath {
    /// Node ids from start to end, inclusive
    pub nodes: Vec<String>,
    /// Shape classification
    pub kind: PathKind,
    /// Number of edges traversed
    pub length: usize,
}

/// Tunable behaviour of the versioning engine
///
/// # Examples
///
/// ```rust
/// use palimpsest::types::VersioningConfig;
///
/// let config = VersioningConfig {
///     max_snapshots_per_hour: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    /// Fused probability a change must exceed to become a version
    pub shift_threshold: f64,
    /// Detections below this probability are suppressed by the engine
    pub min_detection_confidence: f64,
    /// Automatic snapshots allowed per file in any one-hour window
    pub max_snapshots_per_hour: usize,
    /// Minimum seconds between automatic snapshots of one file
    pub min_snapshot_interval_secs: u64,
    /// Quiet period before a buffered change is analysed
    pub debounce_window_ms: u64,
    /// Pause that ends a writing session
    pub session_pause_secs: u64,
    /// Longest run of diff snapshots before a full snapshot is forced
    pub max_diff_chain_length: usize,
    /// Compression applied to stored patches
    pub compression: CompressionStrategy,
    /// Maximum depth of each half of a bidirectional path search
    pub max_path_depth: usize,
    /// Maximum nodes a path search may visit
    pub max_path_visited: usize,
    /// Entries in the decompressed-content cache
    pub content_cache_size: usize,
    /// Entries in the compiled keyword pattern cache
    pub keyword_cache_size: usize,
    /// Entries kept in each file's navigation history
    pub navigation_history_size: usize,
    /// Name of the branch created with a file's first node
    pub main_branch_name: String,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            shift_threshold: 0.5,
            min_detection_confidence: 0.3,
            max_snapshots_per_hour: 12,
            min_snapshot_interval_secs: 0,
            debounce_window_ms: 2_000,
            session_pause_secs: 15 * 60,
            max_diff_chain_length: 1,
            compression: CompressionStrategy::default(),
            max_path_depth: 100,
            max_path_visited: 10_000,
            content_cache_size: 64,
            keyword_cache_size: 256,
            navigation_history_size: 50,
            main_branch_name: "main".to_string(),
        }
    }
}

impl VersioningConfig {
    /// Reject out-of-range settings
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(VersioningError::InvalidConfiguration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )))
            }
        };
        unit("shift_threshold", self.shift_threshold)?;
        unit("min_detection_confidence", self.min_detection_confidence)?;

        if self.max_diff_chain_length == 0 {
            return Err(VersioningError::InvalidConfiguration(
                "max_diff_chain_length must be at least 1".to_string(),
            ));
        }
        if self.max_path_depth == 0 || self.max_path_visited == 0 {
            return Err(VersioningError::InvalidConfiguration(
                "path search bounds must be positive".to_string(),
            ));
        }
        if self.main_branch_name.trim().is_empty() {
            return Err(VersioningError::InvalidConfiguration(
                "main_branch_name must not be empty".to_string(),
            ));
        }
        self.session_pause()?;
        self.min_snapshot_interval()?;
        self.debounce_window()?;
        Ok(())
    }

    /// Pause that ends a writing session, as a duration
    pub fn session_pause(&self) -> Result<TimeDelta> {
        bounded_delta(
            "session_pause_secs",
            self.session_pause_secs,
            MAX_SESSION_PAUSE_SECS,
            TimeDelta::try_seconds,
        )
    }

    /// Minimum gap between automatic snapshots, as a duration
    pub fn min_snapshot_interval(&self) -> Result<TimeDelta> {
        bounded_delta(
            "min_snapshot_interval_secs",
            self.min_snapshot_interval_secs,
            MAX_SNAPSHOT_INTERVAL_SECS,
            TimeDelta::try_seconds,
        )
    }

    /// Debounce window, as a duration
    pub fn debounce_window(&self) -> Result<TimeDelta> {
        bounded_delta(
            "debounce_window_ms",
            self.debounce_window_ms,
            MAX_DEBOUNCE_WINDOW_MS,
            TimeDelta::try_milliseconds,
        )
    }
}

fn bounded_delta(name: &str, value: u64, max: u64, to_delta: impl Fn(i64) -> Option<TimeDelta>) -> Result<TimeDelta> {
    if value > max {
        return Err(VersioningError::InvalidConfiguration(format!(
            "{} must be at most {}, got {}",
            name, max, value
        )));
    }
    i64::try_from(value)
        .ok()
        .and_then(to_delta)
        .ok_or_else(|| VersioningError::InvalidConfiguration(format!("{} is out of range: {}", name, value)))
}

/// Longest accepted session pause (one week)
pub const MAX_SESSION_PAUSE_SECS: u64 = 7 * 24 * 60 * 60;
/// Longest accepted minimum interval between automatic snapshots (one day)
pub const MAX_SNAPSHOT_INTERVAL_SECS: u64 = 24 * 60 * 60;
/// Longest accepted debounce window (ten minutes)
pub const MAX_DEBOUNCE_WINDOW_MS: u64 = 10 * 60 * 1000;

/// Running counters exposed to the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Snapshots created of any kind
    pub total_snapshots: u64,
    /// Snapshots created by detection
    pub automatic_snapshots: u64,
    /// Manual checkpoints
    pub manual_checkpoints: u64,
    /// First versions of newly seen files
    pub initial_versions: u64,
    /// Detections suppressed by the rate limit or interval
    pub rate_limited: u64,
    /// Analyses performed
    pub detections_run: u64,
    /// Analyses that cleared the shift threshold
    pub shifts_detected: u64,
    /// Times the user corrected a suggested context
    pub user_corrections: u64,
    /// Feedback events received (including corrections)
    pub feedback_events: u64,
    /// Feedback events that accepted the detector's choice
    pub feedback_accepted: u64,
    /// Snapshots stored without a matching timeline update
    pub partial_failures: u64,
    /// Merges that produced a node
    pub merges: u64,
}

impl Statistics {
    /// Share of feedback that accepted the detector's choice
    ///
    /// Returns 1.0 before any feedback has been received.
    pub fn success_rate(&self) -> f64 {
        if self.feedback_events == 0 {
            1.0
        } else {
            self.feedback_accepted as f64 / self.feedback_events as f64
        }
    }
}

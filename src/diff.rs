//! Token-level patches between two revisions of a document
//!
//! The [`DiffEngine`] turns a pair of texts into a [`Patch`] that can later
//! rebuild the newer text from the older one, byte for byte.
//!
//! ## Algorithm
//!
//! 1. Both texts are split into tokens (words and the whitespace between
//!    them by default) and diffed with `similar`'s Myers implementation.
//! 2. The raw change list is folded into alternating *equal* and *edit*
//!    segments.
//! 3. **Semantic cleanup**: an equal run sandwiched between two edits is
//!    absorbed into them when it is no longer than the larger side of the
//!    edit on either flank. Writers tend to rewrite phrases, not scattered
//!    single words, and the merged hunks are both smaller to store and
//!    easier to read.
//! 4. Equal runs become `Retain(len)` and edits become `Delete(text)` /
//!    `Insert(text)` operations.
//!
//! Deletions carry the removed text, so applying a patch to the wrong base
//! fails loudly instead of producing garbage.
//!
//! ## Examples
//!
//! ```rust
//! use palimpsest::diff::DiffEngine;
//!
//! let engine = DiffEngine::default();
//! let old = "The knight rode north at dawn.";
//! let new = "The wizard rode south at dusk.";
//!
//! let patch = engine.create_patch(old, new);
//! assert_eq!(engine.apply_patch(&patch, old).unwrap(), new);
//! ```

use crate::error::{Result, VersioningError};
use crate::logging::Logger;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, ChangeTag, TextDiff};
use std::time::Duration;

/// Token size the diff operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffGranularity {
    /// Words and the whitespace runs between them (default)
    #[default]
    Word,
    /// Whole lines
    Line,
    /// Unicode scalar values
    Char,
}

/// One step of a patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    /// Copy this many bytes from the source
    Retain(usize),
    /// Skip this exact text in the source
    Delete(String),
    /// Emit this text
    Insert(String),
}

/// A reversible description of how to turn one text into another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Byte length of the text the patch applies to
    pub source_len: usize,
    /// Byte length of the text the patch produces
    pub target_len: usize,
    /// Operations, in source order
    pub ops: Vec<PatchOp>,
}

impl Patch {
    /// Whether applying the patch changes nothing
    pub fn is_identity(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, PatchOp::Retain(_)))
    }

    /// Number of delete/insert operations
    pub fn edit_count(&self) -> usize {
        self.ops.iter().filter(|op| !matches!(op, PatchOp::Retain(_))).count()
    }

    /// Serialize to the compact binary form stored in snapshots
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Deserialize from [`Patch::encode`] output
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (patch, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(patch)
    }
}

/// Summary of a change between two texts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    /// Bytes inserted
    pub bytes_inserted: usize,
    /// Bytes deleted
    pub bytes_deleted: usize,
    /// Edit hunks after cleanup
    pub hunks: usize,
}

/// Equal text or a replaced region, alternating
#[derive(Debug)]
enum Segment {
    Equal(String),
    Edit { delete: String, insert: String },
}

/// Patch producer and applier
#[derive(Debug, Clone)]
pub struct DiffEngine {
    granularity: DiffGranularity,
    semantic_cleanup: bool,
    timeout: Option<Duration>,
    logger: Logger,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new(DiffGranularity::default(), Logger::new("diff"))
    }
}

impl DiffEngine {
    /// Create an engine with a given granularity
    pub fn new(granularity: DiffGranularity, logger: Logger) -> Self {
        Self {
            granularity,
            semantic_cleanup: true,
            timeout: Some(Duration::from_secs(1)),
            logger,
        }
    }

    /// Enable or disable semantic cleanup
    pub fn with_semantic_cleanup(mut self, enabled: bool) -> Self {
        self.semantic_cleanup = enabled;
        self
    }

    /// Bound the time spent searching for a minimal diff
    ///
    /// Past the deadline `similar` falls back to a coarser (still correct)
    /// diff.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Compute a patch that turns `old` into `new`
    pub fn create_patch(&self, old: &str, new: &str) -> Patch {
        let mut segments = self.segments(old, new);
        if self.semantic_cleanup {
            cleanup_semantic(&mut segments);
        }

        let mut ops = Vec::with_capacity(segments.len() * 2);
        for segment in segments {
            match segment {
                Segment::Equal(text) => ops.push(PatchOp::Retain(text.len())),
                Segment::Edit { delete, insert } => {
                    if !delete.is_empty() {
                        ops.push(PatchOp::Delete(delete));
                    }
                    if !insert.is_empty() {
                        ops.push(PatchOp::Insert(insert));
                    }
                }
            }
        }

        self.logger.trace(format!(
            "Created patch with {} ops ({} -> {} bytes)",
            ops.len(),
            old.len(),
            new.len()
        ));
        Patch {
            source_len: old.len(),
            target_len: new.len(),
            ops,
        }
    }

    /// Rebuild the target text from `source`
    ///
    /// # Errors
    ///
    /// Returns [`VersioningError::Diff`] when the patch does not fit the
    /// source: wrong length, a deletion that does not match, or a retain
    /// that runs past the end or splits a character.
    pub fn apply_patch(&self, patch: &Patch, source: &str) -> Result<String> {
        if source.len() != patch.source_len {
            return Err(VersioningError::diff(format!(
                "patch expects a {} byte source, got {} bytes",
                patch.source_len,
                source.len()
            )));
        }

        // The recorded target length may be corrupt, so it only hints
        let mut output = String::with_capacity(patch.target_len.min(source.len().saturating_mul(2)));
        let mut cursor = 0usize;

        for op in &patch.ops {
            match op {
                PatchOp::Retain(len) => {
                    let end = cursor.checked_add(*len).filter(|end| *end <= source.len());
                    let Some(end) = end.filter(|end| source.is_char_boundary(*end)) else {
                        return Err(VersioningError::diff(format!(
                            "retain of {} bytes at offset {} does not fit the source",
                            len, cursor
                        )));
                    };
                    output.push_str(&source[cursor..end]);
                    cursor = end;
                }
                PatchOp::Delete(text) => {
                    if !source[cursor..].starts_with(text.as_str()) {
                        return Err(VersioningError::diff(format!(
                            "deleted text does not match source at offset {}",
                            cursor
                        )));
                    }
                    cursor += text.len();
                }
                PatchOp::Insert(text) => output.push_str(text),
            }
        }

        if cursor != source.len() {
            return Err(VersioningError::diff(format!(
                "patch consumed {} of {} source bytes",
                cursor,
                source.len()
            )));
        }
        if output.len() != patch.target_len {
            return Err(VersioningError::diff(format!(
                "patch produced {} bytes, expected {}",
                output.len(),
                patch.target_len
            )));
        }
        Ok(output)
    }

    /// Insert/delete totals between two texts
    pub fn stats(&self, old: &str, new: &str) -> DiffStats {
        let patch = self.create_patch(old, new);
        let mut stats = DiffStats::default();
        let mut in_hunk = false;
        for op in &patch.ops {
            match op {
                PatchOp::Retain(_) => in_hunk = false,
                PatchOp::Delete(text) | PatchOp::Insert(text) => {
                    if matches!(op, PatchOp::Delete(_)) {
                        stats.bytes_deleted += text.len();
                    } else {
                        stats.bytes_inserted += text.len();
                    }
                    if !in_hunk {
                        stats.hunks += 1;
                        in_hunk = true;
                    }
                }
            }
        }
        stats
    }

    /// Render a line-based unified diff for display
    pub fn unified_diff(&self, old: &str, new: &str, context_lines: usize) -> String {
        let diff = TextDiff::from_lines(old, new);
        let mut output = String::new();

        for (idx, group) in diff.grouped_ops(context_lines).iter().enumerate() {
            if idx > 0 {
                output.push_str("...\n");
            }
            for op in group {
                for change in diff.iter_changes(op) {
                    let sign = match change.tag() {
                        ChangeTag::Delete => "-",
                        ChangeTag::Insert => "+",
                        ChangeTag::Equal => " ",
                    };
                    output.push_str(sign);
                    output.push_str(change.value());
                    if change.missing_newline() {
                        output.push('\n');
                    }
                }
            }
        }

        output
    }

    fn segments(&self, old: &str, new: &str) -> Vec<Segment> {
        let mut config = TextDiff::configure();
        config.algorithm(Algorithm::Myers);
        if let Some(timeout) = self.timeout {
            config.timeout(timeout);
        }
        let diff = match self.granularity {
            DiffGranularity::Word => config.diff_words(old, new),
            DiffGranularity::Line => config.diff_lines(old, new),
            DiffGranularity::Char => config.diff_chars(old, new),
        };

        let mut segments: Vec<Segment> = Vec::new();
        for change in diff.iter_all_changes() {
            let value = change.value();
            match change.tag() {
                ChangeTag::Equal => match segments.last_mut() {
                    Some(Segment::Equal(text)) => text.push_str(value),
                    _ => segments.push(Segment::Equal(value.to_string())),
                },
                tag => {
                    if !matches!(segments.last(), Some(Segment::Edit { .. })) {
                        segments.push(Segment::Edit {
                            delete: String::new(),
                            insert: String::new(),
                        });
                    }
                    if let Some(Segment::Edit { delete, insert }) = segments.last_mut() {
                        if tag == ChangeTag::Delete {
                            delete.push_str(value);
                        } else {
                            insert.push_str(value);
                        }
                    }
                }
            }
        }
        segments
    }
}

/// Absorb short equalities that separate two edits
///
/// Follows the classic semantic-cleanup rule: an equality is eliminated when
/// its length is at most the larger side (deleted or inserted) of the edit
/// before it and of the edit after it.
fn cleanup_semantic(segments: &mut Vec<Segment>) {
    let mut i = 1;
    while i + 1 < segments.len() {
        let absorb = match (&segments[i - 1], &segments[i], &segments[i + 1]) {
            (
                Segment::Edit { delete: d1, insert: i1 },
                Segment::Equal(eq),
                Segment::Edit { delete: d2, insert: i2 },
            ) => {
                let eq_len = eq.chars().count();
                let before = d1.chars().count().max(i1.chars().count());
                let after = d2.chars().count().max(i2.chars().count());
                eq_len <= before && eq_len <= after
            }
            _ => false,
        };

        if !absorb {
            i += 1;
            continue;
        }

        let next = segments.remove(i + 1);
        let equal = segments.remove(i);
        if let (Segment::Edit { delete, insert }, Segment::Equal(eq), Segment::Edit { delete: d2, insert: i2 }) =
            (&mut segments[i - 1], equal, next)
        {
            delete.push_str(&eq);
            delete.push_str(&d2);
            insert.push_str(&eq);
            insert.push_str(&i2);
        }
        // The grown edit may now swallow the equality after it
        i = i.saturating_sub(1).max(1);
    }
}

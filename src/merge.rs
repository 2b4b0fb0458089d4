//! Line-based merge strategies
//!
//! Merging compares the two branch heads line by line, by position. What
//! happens to lines that differ depends on the [`MergeStrategy`]:
//!
//! | Strategy | Differing lines | Success |
//! |---|---|---|
//! | `latest-wins` | target text used unchanged | always |
//! | `smart-merge` | target line kept, conflict recorded | no content conflicts |
//! | `conflict-markers` | both sides kept between markers | always |
//! | `manual` | nothing merged, conflicts reported | never |
//!
//! Lines present on one side only (one text is longer) are additions and
//! pass through unchanged in every strategy that produces content.

use crate::types::{ConflictKind, MergeConflict, MergeStrategy};

/// Opens the source side of a conflict block
pub const MARKER_BEGIN: &str = "<<<<<<< source";
/// Separates the two sides
pub const MARKER_SEPARATOR: &str = "=======";
/// Closes the target side
pub const MARKER_END: &str = ">>>>>>> target";

/// Result of merging two texts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMerge {
    /// Merged text, `None` for strategies that produce none
    pub content: Option<String>,
    /// Conflicts found
    pub conflicts: Vec<MergeConflict>,
    /// Whether the strategy considers the merge complete
    pub success: bool,
}

/// Merge `source` into `target`
///
/// # Examples
///
/// ```rust
/// use palimpsest::merge::merge_texts;
/// use palimpsest::types::MergeStrategy;
///
/// let merged = merge_texts("a\nb", "a\nc", MergeStrategy::SmartMerge);
/// assert!(!merged.success);
/// assert_eq!(merged.conflicts[0].line, Some(2));
/// ```
pub fn merge_texts(source: &str, target: &str, strategy: MergeStrategy) -> TextMerge {
    match strategy {
        MergeStrategy::LatestWins => TextMerge {
            content: Some(target.to_string()),
            conflicts: Vec::new(),
            success: true,
        },
        MergeStrategy::SmartMerge => smart_merge(source, target),
        MergeStrategy::ConflictMarkers => conflict_markers(source, target),
        MergeStrategy::Manual => TextMerge {
            content: None,
            conflicts: find_conflicts(source, target),
            success: false,
        },
    }
}

/// Every position where both texts have a line and the lines differ
///
/// Line terminators are not compared, so `"a\r\n"` and `"a\n"` agree.
pub fn find_conflicts(source: &str, target: &str) -> Vec<MergeConflict> {
    let source_lines = split_lines(source);
    let target_lines = split_lines(target);
    source_lines
        .iter()
        .zip(target_lines.iter())
        .enumerate()
        .filter(|(_, (s, t))| s.text != t.text)
        .map(|(i, (s, t))| content_conflict(i + 1, s.text, t.text))
        .collect()
}

/// Conflict for differing context ids on the two heads, if any
pub fn metadata_conflict(source: Option<&str>, target: Option<&str>) -> Option<MergeConflict> {
    if source == target {
        return None;
    }
    Some(MergeConflict {
        kind: ConflictKind::Metadata,
        line: None,
        source: source.unwrap_or_default().to_string(),
        target: target.unwrap_or_default().to_string(),
        description: "branch heads were written in different contexts".to_string(),
    })
}

/// One line of a text, with and without its terminator
#[derive(Debug, Clone, Copy)]
struct Line<'a> {
    text: &'a str,
    raw: &'a str,
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    text.split_inclusive('\n')
        .map(|raw| Line {
            text: raw
                .strip_suffix("\r\n")
                .or_else(|| raw.strip_suffix('\n'))
                .unwrap_or(raw),
            raw,
        })
        .collect()
}

/// Terminator used by the texts, target first
fn line_ending(target: &[Line<'_>], source: &[Line<'_>]) -> &'static str {
    let terminated = target
        .iter()
        .chain(source)
        .find(|line| line.raw.len() != line.text.len());
    match terminated {
        Some(line) if line.raw.ends_with("\r\n") => "\r\n",
        _ => "\n",
    }
}

/// Merged text under construction
struct Output {
    text: String,
    eol: &'static str,
}

impl Output {
    fn new(capacity: usize, eol: &'static str) -> Self {
        Self {
            text: String::with_capacity(capacity),
            eol,
        }
    }

    /// Append a line, first terminating an unterminated previous one
    fn push(&mut self, raw: &str) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push_str(self.eol);
        }
        self.text.push_str(raw);
    }

    fn terminate_if(&mut self, line: &Line<'_>) {
        if line.raw.len() != line.text.len() {
            self.text.push_str(self.eol);
        }
    }
}

fn smart_merge(source: &str, target: &str) -> TextMerge {
    let source_lines = split_lines(source);
    let target_lines = split_lines(target);
    let mut merged = Output::new(source.len().max(target.len()), line_ending(&target_lines, &source_lines));
    let mut conflicts = Vec::new();

    for i in 0..source_lines.len().max(target_lines.len()) {
        match (source_lines.get(i), target_lines.get(i)) {
            (Some(s), Some(t)) if s.text == t.text => merged.push(t.raw),
            (Some(s), Some(t)) => {
                conflicts.push(content_conflict(i + 1, s.text, t.text));
                merged.push(t.raw);
            }
            (Some(only), None) | (None, Some(only)) => merged.push(only.raw),
            (None, None) => {}
        }
    }

    TextMerge {
        success: conflicts.is_empty(),
        content: Some(merged.text),
        conflicts,
    }
}

fn conflict_markers(source: &str, target: &str) -> TextMerge {
    let source_lines = split_lines(source);
    let target_lines = split_lines(target);
    let mut out = Output::new(source.len() + target.len(), line_ending(&target_lines, &source_lines));
    let mut conflicts = Vec::new();
    let mut i = 0;
    let common = source_lines.len().min(target_lines.len());

    while i < common {
        if source_lines[i].text == target_lines[i].text {
            out.push(target_lines[i].raw);
            i += 1;
            continue;
        }
        // Group consecutive differing lines into one block
        let start = i;
        while i < common && source_lines[i].text != target_lines[i].text {
            conflicts.push(content_conflict(i + 1, source_lines[i].text, target_lines[i].text));
            i += 1;
        }
        out.push(MARKER_BEGIN);
        for line in &source_lines[start..i] {
            out.push(line.raw);
        }
        out.push(MARKER_SEPARATOR);
        for line in &target_lines[start..i] {
            out.push(line.raw);
        }
        out.push(MARKER_END);
        out.terminate_if(&target_lines[i - 1]);
    }
    for line in source_lines[common..].iter().chain(&target_lines[common..]) {
        out.push(line.raw);
    }

    TextMerge {
        content: Some(out.text),
        conflicts,
        success: true,
    }
}

fn content_conflict(line: usize, source: &str, target: &str) -> MergeConflict {
    MergeConflict {
        kind: ConflictKind::Content,
        line: Some(line),
        source: source.to_string(),
        target: target.to_string(),
        description: format!("line {} differs on both branches", line),
    }
}

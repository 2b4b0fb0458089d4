//! Moving through a file's timeline
//!
//! ## Overview
//!
//! The navigation engine keeps a per-file *position*, separate from the
//! timeline head: looking at an old version never rewrites history. It also
//! finds routes between nodes and merges branches.
//!
//! - [`NavigationEngine::navigate_to_node`] jumps to a node
//! - [`NavigationEngine::navigate_relative`] walks forward through children
//!   (preferring the main branch) or backward through first parents
//! - [`NavigationEngine::find_path`] runs a bounded bidirectional search
//!   over parent and child edges
//! - [`NavigationEngine::merge_branches`] combines two branch heads into a
//!   merge node using a [`MergeStrategy`](crate::types::MergeStrategy)
//!
//! Each file also has a short navigation history so callers can go back to
//! where they were before the last jump.

use crate::collections::{HashMap, HashMapExt};
use crate::error::{Result, VersioningError};
use crate::ids::IdGenerator;
use crate::logging::Logger;
use crate::merge::{merge_texts, metadata_conflict};
use crate::store::VersionStore;
use crate::timeline::{NodeSpec, TimelineEngine};
use crate::types::{
    ConflictKind, Creator, MergeConflict, MergeOptions, MergeResult, MergeStrategy, NavigationPath,
    PathKind, TimelineBranch, TimelineNode, VersioningConfig,
};
use crate::version::VersionManager;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct Position {
    current: Option<String>,
    history: VecDeque<String>,
}

/// Per-file positions, path search and merging
pub struct NavigationEngine {
    store: Arc<dyn VersionStore>,
    timeline: Arc<TimelineEngine>,
    versions: Arc<VersionManager>,
    ids: Arc<dyn IdGenerator>,
    positions: Mutex<HashMap<String, Position>>,
    history_size: usize,
    max_depth: usize,
    max_visited: usize,
    logger: Logger,
}

impl std::fmt::Debug for NavigationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationEngine")
            .field("tracked_files", &self.positions.lock().len())
            .field("max_depth", &self.max_depth)
            .field("max_visited", &self.max_visited)
            .finish()
    }
}

impl NavigationEngine {
    /// Create an engine sharing the timeline and version managers
    pub fn new(
        store: Arc<dyn VersionStore>,
        timeline: Arc<TimelineEngine>,
        versions: Arc<VersionManager>,
        ids: Arc<dyn IdGenerator>,
        config: &VersioningConfig,
        logger: Logger,
    ) -> Self {
        Self {
            store,
            timeline,
            versions,
            ids,
            positions: Mutex::new(HashMap::new()),
            history_size: config.navigation_history_size,
            max_depth: config.max_path_depth,
            max_visited: config.max_path_visited,
            logger,
        }
    }

    /// Node the file is positioned at
    pub fn current_position(&self, file_id: &str) -> Option<String> {
        self.positions.lock().get(file_id).and_then(|p| p.current.clone())
    }

    /// Previous positions, most recent last
    pub fn position_history(&self, file_id: &str) -> Vec<String> {
        self.positions
            .lock()
            .get(file_id)
            .map(|p| p.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a file's position and history
    pub fn forget_file(&self, file_id: &str) {
        self.positions.lock().remove(file_id);
    }

    /// Position a file at a node
    ///
    /// Returns `false` if the node does not exist or belongs to another file.
    pub async fn navigate_to_node(&self, file_id: &str, node_id: &str) -> Result<bool> {
        match self.store.get_node(node_id).await? {
            Some(node) if node.file_id() == file_id => {
                self.move_to(file_id, node.id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Move `steps` nodes forward (positive) or backward (negative)
    ///
    /// Starts from the current position, or the head if there is none.
    /// Stops early at a root or a leaf. Returns the new position, `None`
    /// when the file has no nodes.
    pub async fn navigate_relative(&self, file_id: &str, steps: i64) -> Result<Option<String>> {
        let start = match self.current_position(file_id) {
            Some(id) => Some(id),
            None => self
                .timeline
                .get_history(file_id)
                .await?
                .and_then(|h| h.current_version),
        };
        let Some(start) = start else {
            return Ok(None);
        };

        let preferred = self.preferred_branches(file_id).await?;
        let mut current = start.clone();
        for _ in 0..steps.unsigned_abs() {
            let Some(node) = self.store.get_node(&current).await? else {
                return Err(VersioningError::not_found("node", current));
            };
            let next = if steps > 0 {
                Self::forward_child(&node, &preferred)
            } else {
                node.first_parent().map(str::to_string)
            };
            match next {
                Some(next) => current = next,
                None => break,
            }
        }

        if current != start || self.current_position(file_id).is_none() {
            self.move_to(file_id, current.clone());
        }
        Ok(Some(current))
    }

    /// Return to the position before the last move
    pub fn go_back(&self, file_id: &str) -> Option<String> {
        let mut positions = self.positions.lock();
        let position = positions.get_mut(file_id)?;
        let previous = position.history.pop_back()?;
        position.current = Some(previous.clone());
        Some(previous)
    }

    /// Shortest route between two nodes over parent and child edges
    ///
    /// The search expands alternately from both ends and gives up after
    /// `max_path_depth` levels per side or `max_path_visited` nodes, so it
    /// terminates on malformed graphs. Returns `None` when either node is
    /// missing or no route is found within the bounds.
    ///
    /// Paths through a merge node are [`PathKind::Merged`], otherwise paths
    /// through a branch point are [`PathKind::Branched`].
    pub async fn find_path(&self, from: &str, to: &str) -> Result<Option<NavigationPath>> {
        let mut nodes: HashMap<String, TimelineNode> = HashMap::new();
        for id in [from, to] {
            match self.store.get_node(id).await? {
                Some(node) => {
                    nodes.insert(node.id.clone(), node);
                }
                None => return Ok(None),
            }
        }
        if from == to {
            return Ok(Some(self.classify(vec![from.to_string()], &mut nodes).await?));
        }

        // node -> neighbour one step closer to the side's origin
        let mut from_start: HashMap<String, Option<String>> = HashMap::new();
        let mut from_end: HashMap<String, Option<String>> = HashMap::new();
        from_start.insert(from.to_string(), None);
        from_end.insert(to.to_string(), None);
        let mut frontier_start = vec![from.to_string()];
        let mut frontier_end = vec![to.to_string()];
        let (mut depth_start, mut depth_end) = (0usize, 0usize);

        let meeting = loop {
            let expand_start = match (depth_start < self.max_depth, depth_end < self.max_depth) {
                (false, false) => return Ok(None),
                (true, false) => true,
                (false, true) => false,
                (true, true) => frontier_start.len() <= frontier_end.len(),
            };
            let (frontier, seen, other, depth) = if expand_start {
                (&mut frontier_start, &mut from_start, &from_end, &mut depth_start)
            } else {
                (&mut frontier_end, &mut from_end, &from_start, &mut depth_end)
            };

            let mut next = Vec::new();
            let mut met = None;
            'expand: for id in frontier.iter() {
                for neighbour in self.neighbours(id, &mut nodes).await? {
                    if seen.contains_key(&neighbour) {
                        continue;
                    }
                    seen.insert(neighbour.clone(), Some(id.clone()));
                    if other.contains_key(&neighbour) {
                        met = Some(neighbour);
                        break 'expand;
                    }
                    next.push(neighbour);
                }
            }
            *frontier = next;
            *depth += 1;

            if let Some(met) = met {
                break met;
            }
            if frontier_start.is_empty() || frontier_end.is_empty() {
                return Ok(None);
            }
            if from_start.len() + from_end.len() > self.max_visited {
                self.logger.warn(format!(
                    "Path search from {} to {} stopped after visiting {} nodes",
                    from,
                    to,
                    from_start.len() + from_end.len()
                ));
                return Ok(None);
            }
        };

        let mut path = Vec::new();
        let mut cursor = Some(meeting.clone());
        while let Some(id) = cursor {
            cursor = from_start.get(&id).cloned().flatten();
            path.push(id);
        }
        path.reverse();
        let mut cursor = from_end.get(&meeting).cloned().flatten();
        while let Some(id) = cursor {
            cursor = from_end.get(&id).cloned().flatten();
            path.push(id);
        }

        Ok(Some(self.classify(path, &mut nodes).await?))
    }

    /// Merge the head of `source_branch_id` into `target_branch_id`
    ///
    /// A successful merge stores the merged text as a full snapshot and
    /// creates a node whose parents are exactly the two heads, appended to
    /// the target branch. With `preserve_history` the source branch is
    /// deactivated afterwards.
    ///
    /// Structural problems (unknown branches, different files, a branch
    /// merged into itself) are reported as conflicts, not errors.
    pub async fn merge_branches(
        &self,
        source_branch_id: &str,
        target_branch_id: &str,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        let source = self.store.get_branch(source_branch_id).await?;
        let target = self.store.get_branch(target_branch_id).await?;
        let (source, target) = match (source, target) {
            (Some(source), Some(target)) => (source, target),
            (source, _) => {
                let missing = if source.is_none() { source_branch_id } else { target_branch_id };
                return Ok(Self::structural_failure(
                    options.strategy,
                    format!("branch {} does not exist", missing),
                ));
            }
        };
        if let Some(reason) = Self::structural_problem(&source, &target) {
            return Ok(Self::structural_failure(options.strategy, reason));
        }
        let (Some(source_head), Some(target_head)) = (source.last_node(), target.last_node()) else {
            return Ok(Self::structural_failure(options.strategy, "cannot merge an empty branch".to_string()));
        };
        if source_head == target_head {
            return Ok(Self::structural_failure(
                options.strategy,
                "branches already point at the same node".to_string(),
            ));
        }

        let source_node = self.require_node(source_head).await?;
        let target_node = self.require_node(target_head).await?;
        let source_text = self.require_content(source_head).await?;
        let target_text = self.require_content(target_head).await?;

        let text = merge_texts(&source_text, &target_text, options.strategy);
        let mut conflicts = text.conflicts;
        if options.strategy == MergeStrategy::Manual {
            conflicts.extend(metadata_conflict(
                source_node.context_id.as_deref(),
                target_node.context_id.as_deref(),
            ));
        }

        let merged_content = match (text.success, text.content) {
            (true, Some(content)) => content,
            (_, content) => {
                self.logger.info(format!(
                    "Merge of '{}' into '{}' ({}) not completed: {} conflicts",
                    source.name,
                    target.name,
                    options.strategy,
                    conflicts.len()
                ));
                return Ok(MergeResult {
                    success: false,
                    strategy: options.strategy,
                    merged_node: None,
                    merged_content: content,
                    conflicts,
                });
            }
        };

        let file_id = target.file_id.clone();
        let node_id = self.ids.next_id();
        let snapshot = self
            .versions
            .create_version_snapshot(&file_id, &node_id, &merged_content, true)
            .await?;
        let label = options
            .label
            .clone()
            .unwrap_or_else(|| format!("Merge '{}' into '{}'", source.name, target.name));
        let spec = NodeSpec::new(file_id.clone(), label)
            .id(node_id)
            .parents(vec![source_head.to_string(), target_head.to_string()])
            .branch(target.id.clone())
            .context(target_node.context_id.clone())
            .creator(Creator::User)
            .content(merged_content.clone());

        let node = match self.timeline.create_node_with(spec).await {
            Ok(node) => node,
            Err(e) => {
                if let Err(cleanup) = self.store.delete_snapshot(&snapshot.id).await {
                    self.logger
                        .error(format!("Could not remove merge snapshot {}: {}", snapshot.id, cleanup));
                }
                self.versions.forget(&[snapshot.id]);
                return Err(e);
            }
        };

        if options.preserve_history {
            self.timeline.deactivate_branch(&source.id).await?;
        }
        self.logger.info(format!(
            "Merged '{}' into '{}' as {} ({} conflicts)",
            source.name,
            target.name,
            node.id,
            conflicts.len()
        ));

        Ok(MergeResult {
            success: true,
            strategy: options.strategy,
            merged_node: Some(node),
            merged_content: Some(merged_content),
            conflicts,
        })
    }

    fn move_to(&self, file_id: &str, node_id: String) {
        let mut positions = self.positions.lock();
        let position = positions.entry(file_id.to_string()).or_default();
        if position.current.as_deref() == Some(node_id.as_str()) {
            return;
        }
        if let Some(previous) = position.current.take() {
            position.history.push_back(previous);
            while position.history.len() > self.history_size {
                position.history.pop_front();
            }
        }
        position.current = Some(node_id);
    }

    /// Branches whose nodes forward navigation prefers, main first
    async fn preferred_branches(&self, file_id: &str) -> Result<Vec<TimelineBranch>> {
        let mut branches = self.timeline.get_branches(file_id).await?;
        let main = self.timeline.main_branch_name().to_string();
        branches.sort_by_key(|b| (b.name != main, !b.is_active));
        Ok(branches)
    }

    fn forward_child(node: &TimelineNode, preferred: &[TimelineBranch]) -> Option<String> {
        if node.child_ids.len() > 1 {
            for branch in preferred {
                if let Some(child) = node.child_ids.iter().find(|c| branch.contains(c)) {
                    return Some(child.clone());
                }
            }
        }
        node.child_ids.first().cloned()
    }

    async fn neighbours(&self, id: &str, nodes: &mut HashMap<String, TimelineNode>) -> Result<Vec<String>> {
        if !nodes.contains_key(id) {
            match self.store.get_node(id).await? {
                Some(node) => {
                    nodes.insert(id.to_string(), node);
                }
                None => return Ok(Vec::new()),
            }
        }
        Ok(nodes
            .get(id)
            .map(|n| n.parent_ids.iter().chain(n.child_ids.iter()).cloned().collect())
            .unwrap_or_default())
    }

    async fn classify(&self, path: Vec<String>, nodes: &mut HashMap<String, TimelineNode>) -> Result<NavigationPath> {
        let mut merged = false;
        let mut branched = false;
        for id in &path {
            if !nodes.contains_key(id) {
                if let Some(node) = self.store.get_node(id).await? {
                    nodes.insert(id.clone(), node);
                }
            }
            if let Some(node) = nodes.get(id) {
                merged |= node.is_merge();
                branched |= node.is_branch_point();
            }
        }
        let kind = if merged {
            PathKind::Merged
        } else if branched {
            PathKind::Branched
        } else {
            PathKind::Linear
        };
        Ok(NavigationPath {
            length: path.len().saturating_sub(1),
            nodes: path,
            kind,
        })
    }

    async fn require_node(&self, id: &str) -> Result<TimelineNode> {
        self.store
            .get_node(id)
            .await?
            .ok_or_else(|| VersioningError::not_found("node", id))
    }

    async fn require_content(&self, node_id: &str) -> Result<String> {
        self.versions
            .restore_node(node_id)
            .await?
            .ok_or_else(|| VersioningError::not_found("snapshot", node_id))
    }

    fn structural_problem(source: &TimelineBranch, target: &TimelineBranch) -> Option<String> {
        if source.id == target.id {
            Some("cannot merge a branch into itself".to_string())
        } else if source.file_id != target.file_id {
            Some(format!(
                "branches belong to different files ({} and {})",
                source.file_id, target.file_id
            ))
        } else {
            None
        }
    }

    fn structural_failure(strategy: MergeStrategy, description: String) -> MergeResult {
        MergeResult {
            success: false,
            strategy,
            merged_node: None,
            merged_content: None,
            conflicts: vec![MergeConflict {
                kind: ConflictKind::Structure,
                line: None,
                source: String::new(),
                target: String::new(),
                description,
            }],
        }
    }
}

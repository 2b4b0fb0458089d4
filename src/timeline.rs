//! Version timeline: a per-file DAG of nodes plus named branches
//!
//! ## Overview
//!
//! Every version of a file is a [`TimelineNode`]. Nodes reference each other
//! only by id, through `parent_ids` and `child_ids`, and live in the store.
//! The graph supports:
//!
//! - **Linear history**: each new node's single parent is the file's head
//! - **Branching**: several nodes can share a parent
//! - **Merging**: a merge node has two parents
//!
//! Branches do not fork storage. A [`TimelineBranch`] is a named sequence of
//! node ids starting at the node it was created from; at most one branch
//! per file is active, and new nodes are appended to it.
//!
//! ## Structure
//!
//! ```text
//! initial
//! ├── draft-2
//! │   └── draft-3          (main)
//! └── alt-ending           (experiment)
//!     └── merge of main    (two parents)
//! ```
//!
//! ## Consistency
//!
//! Creating a node writes the node first, then adds it to each parent's
//! child list through the store's atomic append. If any later step fails,
//! the edges already added and the node itself are removed again, so the
//! graph never keeps a one-sided edge.

use crate::clock::Clock;
use crate::collections::{HashMap, HashMapExt, HashSet, HashSetExt};
use crate::error::{Result, VersioningError};
use crate::ids::IdGenerator;
use crate::logging::Logger;
use crate::store::VersionStore;
use crate::types::{Creator, FileVersionHistory, NodeMetadata, TimelineBranch, TimelineNode};
use crate::utils::{hash_content, word_count};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Everything needed to create one node
///
/// # Examples
///
/// ```rust
/// use palimpsest::timeline::NodeSpec;
///
/// let spec = NodeSpec::new("chapter-1", "Rewrote the opening")
///     .checkpoint(true)
///     .context(Some("fantasy".to_string()))
///     .content("It was a dark and stormy night.");
/// assert!(spec.is_checkpoint);
/// ```
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    /// Pre-allocated id; generated when absent
    pub id: Option<String>,
    /// Owning file
    pub file_id: String,
    /// File path recorded in metadata; the history's path when absent
    pub file_path: Option<String>,
    /// Label
    pub label: String,
    /// Manual checkpoint flag
    pub is_checkpoint: bool,
    /// Context the version belongs to
    pub context_id: Option<String>,
    /// Who created the node
    pub creator: Option<Creator>,
    /// Content used for metadata counts and hash
    pub content: Option<String>,
    /// Explicit parents; the file head when absent
    pub parent_ids: Option<Vec<String>>,
    /// Branch to append to; the active branch when absent
    pub branch_id: Option<String>,
}

impl NodeSpec {
    /// Spec for a node on `file_id`
    pub fn new(file_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            label: label.into(),
            ..Default::default()
        }
    }

    /// Use a pre-allocated id
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Record a file path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Mark as a manual checkpoint
    pub fn checkpoint(mut self, is_checkpoint: bool) -> Self {
        self.is_checkpoint = is_checkpoint;
        self
    }

    /// Attach a context
    pub fn context(mut self, context_id: Option<String>) -> Self {
        self.context_id = context_id;
        self
    }

    /// Set the creator
    pub fn creator(mut self, creator: Creator) -> Self {
        self.creator = Some(creator);
        self
    }

    /// Compute metadata from this content
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Use explicit parents
    pub fn parents(mut self, parent_ids: Vec<String>) -> Self {
        self.parent_ids = Some(parent_ids);
        self
    }

    /// Append to a specific branch
    pub fn branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }
}

/// Undo log for a partially applied node creation
#[derive(Debug, Default)]
struct Rollback {
    node_id: Option<String>,
    linked_parents: Vec<String>,
    branch_before: Option<TimelineBranch>,
    created_branch: Option<String>,
}

/// Creates and links nodes, manages branches
pub struct TimelineEngine {
    store: Arc<dyn VersionStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    logger: Logger,
    main_branch_name: String,
}

impl std::fmt::Debug for TimelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineEngine")
            .field("main_branch_name", &self.main_branch_name)
            .finish()
    }
}

impl TimelineEngine {
    /// Create an engine over a store
    pub fn new(
        store: Arc<dyn VersionStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        logger: Logger,
        main_branch_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ids,
            clock,
            logger,
            main_branch_name: main_branch_name.into(),
        }
    }

    /// Name given to each file's first branch
    pub fn main_branch_name(&self) -> &str {
        &self.main_branch_name
    }

    /// Fetch a file's history, creating an empty one if needed
    pub async fn ensure_history(&self, file_id: &str, file_path: &str) -> Result<FileVersionHistory> {
        if let Some(history) = self.store.get_file_history(file_id).await? {
            return Ok(history);
        }
        let history = FileVersionHistory::new(file_id, file_path, self.clock.now());
        self.store.save_file_history(&history).await?;
        Ok(history)
    }

    /// Fetch a file's history
    pub async fn get_history(&self, file_id: &str) -> Result<Option<FileVersionHistory>> {
        self.store.get_file_history(file_id).await
    }

    /// Fetch a node
    pub async fn get_node(&self, node_id: &str) -> Result<Option<TimelineNode>> {
        self.store.get_node(node_id).await
    }

    /// Create a node whose single parent is the file's head
    pub async fn create_node(&self, file_id: &str, label: &str, is_checkpoint: bool) -> Result<TimelineNode> {
        self.create_node_with(NodeSpec::new(file_id, label).checkpoint(is_checkpoint))
            .await
    }

    /// Create a node from a full spec
    ///
    /// # Errors
    ///
    /// - [`VersioningError::NotFound`] if an explicit parent does not exist
    /// - [`VersioningError::CircularDependency`] if the spec names the new
    ///   node as its own parent
    /// - storage errors, after undoing every partial write
    pub async fn create_node_with(&self, spec: NodeSpec) -> Result<TimelineNode> {
        let now = self.clock.now();
        let mut history = match self.store.get_file_history(&spec.file_id).await? {
            Some(history) => history,
            None => FileVersionHistory::new(
                spec.file_id.clone(),
                spec.file_path.clone().unwrap_or_else(|| spec.file_id.clone()),
                now,
            ),
        };

        let id = spec.id.clone().unwrap_or_else(|| self.ids.next_id());
        let parent_ids = match &spec.parent_ids {
            Some(parents) => parents.clone(),
            None => history.current_version.iter().cloned().collect(),
        };
        if parent_ids.iter().any(|p| *p == id) {
            return Err(VersioningError::CircularDependency);
        }
        for parent_id in &parent_ids {
            if self.store.get_node(parent_id).await?.is_none() {
                return Err(VersioningError::not_found("node", parent_id.clone()));
            }
        }

        let content = spec.content.as_deref().unwrap_or_default();
        let node = TimelineNode {
            id: id.clone(),
            timestamp: now,
            parent_ids: parent_ids.clone(),
            child_ids: Vec::new(),
            context_id: spec.context_id.clone(),
            label: spec.label.clone(),
            is_checkpoint: spec.is_checkpoint,
            metadata: NodeMetadata {
                file_id: spec.file_id.clone(),
                file_path: spec.file_path.clone().unwrap_or_else(|| history.file_path.clone()),
                word_count: word_count(content),
                char_count: content.chars().count(),
                content_hash: hash_content(content),
                creator: spec
                    .creator
                    .unwrap_or(if spec.is_checkpoint { Creator::User } else { Creator::Auto }),
            },
        };

        let mut rollback = Rollback::default();
        match self.link_node(&node, &spec, &mut history, &mut rollback).await {
            Ok(()) => {
                self.logger.debug(format!(
                    "Created node {} on {} with parents {:?}",
                    node.id, node.metadata.file_id, node.parent_ids
                ));
                Ok(node)
            }
            Err(e) => {
                self.logger
                    .warn(format!("Creating node {} failed, rolling back: {}", node.id, e));
                self.undo(rollback).await;
                Err(e)
            }
        }
    }

    async fn link_node(
        &self,
        node: &TimelineNode,
        spec: &NodeSpec,
        history: &mut FileVersionHistory,
        rollback: &mut Rollback,
    ) -> Result<()> {
        self.store.save_node(node).await?;
        rollback.node_id = Some(node.id.clone());

        for parent_id in &node.parent_ids {
            if !self.store.append_child_to_node(parent_id, &node.id).await? {
                return Err(VersioningError::integrity(format!(
                    "parent {} vanished while linking {}",
                    parent_id, node.id
                )));
            }
            rollback.linked_parents.push(parent_id.clone());
        }

        let now = node.timestamp;
        let target_branch = match &spec.branch_id {
            Some(id) => Some(id.clone()),
            None => self.active_branch_of(history).await?.map(|b| b.id),
        };
        match target_branch {
            Some(branch_id) => {
                let mut branch = self
                    .store
                    .get_branch(&branch_id)
                    .await?
                    .ok_or_else(|| VersioningError::not_found("branch", branch_id.clone()))?;
                rollback.branch_before = Some(branch.clone());
                branch.node_ids.push(node.id.clone());
                branch.updated_at = now;
                self.store.save_branch(&branch).await?;
            }
            None if history.branches.is_empty() => {
                let branch = TimelineBranch {
                    id: self.ids.next_id(),
                    file_id: history.file_id.clone(),
                    name: self.main_branch_name.clone(),
                    parent_node_id: node.id.clone(),
                    node_ids: vec![node.id.clone()],
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                };
                self.store.save_branch(&branch).await?;
                rollback.created_branch = Some(branch.id.clone());
                history.branches.push(branch.id);
            }
            None => {}
        }

        history.current_version = Some(node.id.clone());
        history.last_modified = now;
        self.store.save_file_history(history).await
    }

    /// Best-effort reversal of a failed creation
    async fn undo(&self, rollback: Rollback) {
        let Some(node_id) = rollback.node_id else {
            return;
        };
        for parent_id in &rollback.linked_parents {
            let result = match self.store.get_node(parent_id).await {
                Ok(Some(mut parent)) => {
                    parent.child_ids.retain(|c| *c != node_id);
                    self.store.save_node(&parent).await
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.logger
                    .error(format!("Could not unlink {} from parent {}: {}", node_id, parent_id, e));
            }
        }
        if let Some(branch) = rollback.branch_before {
            if let Err(e) = self.store.save_branch(&branch).await {
                self.logger.error(format!("Could not restore branch {}: {}", branch.id, e));
            }
        }
        if let Some(branch_id) = rollback.created_branch {
            if let Err(e) = self.store.delete_branch(&branch_id).await {
                self.logger.error(format!("Could not remove branch {}: {}", branch_id, e));
            }
        }
        if let Err(e) = self.store.delete_node(&node_id).await {
            self.logger.error(format!("Could not remove node {}: {}", node_id, e));
        }
    }

    /// Start a branch at an existing node of the file
    ///
    /// The new branch is inactive until switched to.
    pub async fn create_branch(&self, file_id: &str, name: &str, parent_node_id: &str) -> Result<TimelineBranch> {
        let parent = self
            .store
            .get_node(parent_node_id)
            .await?
            .filter(|n| n.file_id() == file_id)
            .ok_or_else(|| VersioningError::not_found("node", parent_node_id))?;
        let mut history = self
            .store
            .get_file_history(file_id)
            .await?
            .ok_or_else(|| VersioningError::not_found("file history", file_id))?;

        let now = self.clock.now();
        let branch = TimelineBranch {
            id: self.ids.next_id(),
            file_id: file_id.to_string(),
            name: name.to_string(),
            parent_node_id: parent.id.clone(),
            node_ids: vec![parent.id],
            is_active: false,
            created_at: now,
            updated_at: now,
        };
        self.store.save_branch(&branch).await?;
        history.branches.push(branch.id.clone());
        history.last_modified = now;
        self.store.save_file_history(&history).await?;

        self.logger
            .info(format!("Created branch '{}' at {}", branch.name, branch.parent_node_id));
        Ok(branch)
    }

    /// Make a branch the file's only active branch and move the head to
    /// its last node
    ///
    /// Returns `false` if the branch is unknown, belongs to another file, or
    /// has no nodes.
    pub async fn switch_branch(&self, file_id: &str, branch_id: &str) -> Result<bool> {
        let Some(target) = self.store.get_branch(branch_id).await? else {
            return Ok(false);
        };
        if target.file_id != file_id {
            return Ok(false);
        }
        let Some(last) = target.last_node().map(str::to_string) else {
            return Ok(false);
        };
        let Some(mut history) = self.store.get_file_history(file_id).await? else {
            return Ok(false);
        };

        let now = self.clock.now();
        for id in &history.branches {
            let Some(mut branch) = self.store.get_branch(id).await? else {
                continue;
            };
            let should_be_active = branch.id == branch_id;
            if branch.is_active != should_be_active {
                branch.is_active = should_be_active;
                branch.updated_at = now;
                self.store.save_branch(&branch).await?;
            }
        }

        history.current_version = Some(last.clone());
        history.last_modified = now;
        self.store.save_file_history(&history).await?;
        self.logger
            .info(format!("Switched {} to branch '{}' at {}", file_id, target.name, last));
        Ok(true)
    }

    /// All branches of a file, in creation order
    pub async fn get_branches(&self, file_id: &str) -> Result<Vec<TimelineBranch>> {
        let Some(history) = self.store.get_file_history(file_id).await? else {
            return Ok(Vec::new());
        };
        let mut branches = Vec::with_capacity(history.branches.len());
        for id in &history.branches {
            if let Some(branch) = self.store.get_branch(id).await? {
                branches.push(branch);
            }
        }
        Ok(branches)
    }

    /// The file's active branch
    pub async fn active_branch(&self, file_id: &str) -> Result<Option<TimelineBranch>> {
        match self.store.get_file_history(file_id).await? {
            Some(history) => self.active_branch_of(&history).await,
            None => Ok(None),
        }
    }

    /// Find a branch by name
    pub async fn find_branch(&self, file_id: &str, name: &str) -> Result<Option<TimelineBranch>> {
        Ok(self
            .get_branches(file_id)
            .await?
            .into_iter()
            .find(|b| b.name == name))
    }

    /// Mark a branch inactive without activating another
    pub async fn deactivate_branch(&self, branch_id: &str) -> Result<bool> {
        let Some(mut branch) = self.store.get_branch(branch_id).await? else {
            return Ok(false);
        };
        if branch.is_active {
            branch.is_active = false;
            branch.updated_at = self.clock.now();
            self.store.save_branch(&branch).await?;
        }
        Ok(true)
    }

    /// Change the context recorded on a node
    pub async fn set_node_context(&self, node_id: &str, context_id: Option<String>) -> Result<bool> {
        let Some(mut node) = self.store.get_node(node_id).await? else {
            return Ok(false);
        };
        node.context_id = context_id;
        self.store.save_node(&node).await?;
        Ok(true)
    }

    /// Load the whole graph of a file
    pub async fn get_timeline(&self, file_id: &str) -> Result<Option<Timeline>> {
        let Some(history) = self.store.get_file_history(file_id).await? else {
            return Ok(None);
        };
        let nodes = self.store.list_nodes_for_file(file_id).await?;
        let branches = self.get_branches(file_id).await?;
        Ok(Some(Timeline {
            file_id: history.file_id,
            file_path: history.file_path,
            order: nodes.iter().map(|n| n.id.clone()).collect(),
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            branches,
            head: history.current_version,
            position: None,
        }))
    }

    async fn active_branch_of(&self, history: &FileVersionHistory) -> Result<Option<TimelineBranch>> {
        for id in &history.branches {
            if let Some(branch) = self.store.get_branch(id).await? {
                if branch.is_active {
                    return Ok(Some(branch));
                }
            }
        }
        Ok(None)
    }
}

/// Read-only view of one file's graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    /// File id
    pub file_id: String,
    /// File path
    pub file_path: String,
    /// Nodes by id
    pub nodes: BTreeMap<String, TimelineNode>,
    /// Node ids, oldest first
    pub order: Vec<String>,
    /// Branches in creation order
    pub branches: Vec<TimelineBranch>,
    /// Head node
    pub head: Option<String>,
    /// Navigation position, when the caller tracks one
    pub position: Option<String>,
}

impl Timeline {
    /// Look up a node
    pub fn node(&self, id: &str) -> Option<&TimelineNode> {
        self.nodes.get(id)
    }

    /// Nodes without parents, oldest first
    pub fn roots(&self) -> Vec<&TimelineNode> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.is_root())
            .collect()
    }

    /// Direct children of a node
    pub fn children(&self, id: &str) -> Vec<&TimelineNode> {
        self.nodes
            .get(id)
            .map(|n| n.child_ids.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// All ancestors of a node, nearest first
    pub fn ancestors(&self, id: &str) -> Vec<&TimelineNode> {
        self.walk(id, |n| &n.parent_ids)
    }

    /// All descendants of a node, nearest first
    pub fn descendants(&self, id: &str) -> Vec<&TimelineNode> {
        self.walk(id, |n| &n.child_ids)
    }

    /// Whether `ancestor` is reachable from `id` through parent links
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        self.ancestors(id).iter().any(|n| n.id == ancestor)
    }

    /// Nearest node that both `a` and `b` descend from (or are)
    pub fn common_ancestor(&self, a: &str, b: &str) -> Option<&TimelineNode> {
        let mut of_a: HashSet<&str> = HashSet::new();
        of_a.insert(a);
        of_a.extend(self.ancestors(a).into_iter().map(|n| n.id.as_str()));

        std::iter::once(self.nodes.get(b)?)
            .chain(self.ancestors(b))
            .find(|n| of_a.contains(n.id.as_str()))
    }

    /// Graph statistics
    pub fn stats(&self) -> TimelineStats {
        let mut depth: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        let mut visiting: HashSet<&str> = HashSet::new();
        for id in self.nodes.keys() {
            let mut stack = vec![id.as_str()];
            while let Some(&top) = stack.last() {
                if depth.contains_key(top) {
                    stack.pop();
                    continue;
                }
                let Some(node) = self.nodes.get(top) else {
                    stack.pop();
                    continue;
                };
                visiting.insert(top);
                let pending: Vec<&str> = node
                    .parent_ids
                    .iter()
                    .map(String::as_str)
                    .filter(|p| self.nodes.contains_key(*p) && !depth.contains_key(p) && !visiting.contains(p))
                    .collect();
                if pending.is_empty() {
                    // Parents still being visited close a cycle and are skipped
                    let d = node
                        .parent_ids
                        .iter()
                        .filter_map(|p| depth.get(p.as_str()))
                        .max()
                        .map_or(1, |d| d + 1);
                    depth.insert(top, d);
                    visiting.remove(top);
                    stack.pop();
                } else {
                    stack.extend(pending);
                }
            }
        }

        TimelineStats {
            total_nodes: self.nodes.len(),
            root_nodes: self.nodes.values().filter(|n| n.is_root()).count(),
            leaf_nodes: self.nodes.values().filter(|n| n.child_ids.is_empty()).count(),
            checkpoints: self.nodes.values().filter(|n| n.is_checkpoint).count(),
            merge_nodes: self.nodes.values().filter(|n| n.is_merge()).count(),
            branch_points: self.nodes.values().filter(|n| n.is_branch_point()).count(),
            branches: self.branches.len(),
            max_depth: depth.values().copied().max().unwrap_or(0),
        }
    }

    /// ASCII tree of the graph
    ///
    /// Merge nodes appear under their first parent; the other parents point
    /// at them with a `(merged into ...)` note.
    pub fn format_tree(&self) -> String {
        let mut out = String::new();
        let mut printed: HashSet<&str> = HashSet::new();
        let roots = self.roots();
        for (i, root) in roots.iter().enumerate() {
            self.format_node(root, "", i + 1 == roots.len(), &mut printed, &mut out);
        }
        out
    }

    fn format_node<'a>(
        &'a self,
        node: &'a TimelineNode,
        prefix: &str,
        is_last: bool,
        printed: &mut HashSet<&'a str>,
        out: &mut String,
    ) {
        let connector = if is_last { "└── " } else { "├── " };
        let head = if self.head.as_deref() == Some(node.id.as_str()) { "* " } else { "" };
        let here = if self.position.as_deref() == Some(node.id.as_str()) { "@ " } else { "" };
        out.push_str(prefix);
        out.push_str(connector);
        out.push_str(head);
        out.push_str(here);
        out.push_str(&node.display_format());
        out.push('\n');
        printed.insert(node.id.as_str());

        let extension = if is_last { "    " } else { "│   " };
        let child_prefix = format!("{}{}", prefix, extension);
        let children = self.children(&node.id);
        for (i, child) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            if child.first_parent() != Some(node.id.as_str()) || printed.contains(child.id.as_str()) {
                out.push_str(&child_prefix);
                out.push_str(if last { "└── " } else { "├── " });
                out.push_str(&format!("(merged into {})\n", crate::utils::short_id(&child.id)));
                continue;
            }
            self.format_node(child, &child_prefix, last, printed, out);
        }
    }

    fn walk<'a>(&'a self, id: &str, next: impl Fn(&'a TimelineNode) -> &'a Vec<String>) -> Vec<&'a TimelineNode> {
        let mut found = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        if let Some(start) = self.nodes.get(id) {
            seen.insert(start.id.as_str());
            queue.extend(next(start).iter().map(String::as_str));
        }
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                found.push(node);
                queue.extend(next(node).iter().map(String::as_str));
            }
        }
        found
    }
}

/// Timeline statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineStats {
    /// Total number of nodes
    pub total_nodes: usize,
    /// Nodes without parents
    pub root_nodes: usize,
    /// Nodes without children
    pub leaf_nodes: usize,
    /// Manual checkpoints
    pub checkpoints: usize,
    /// Nodes with more than one parent
    pub merge_nodes: usize,
    /// Nodes with more than one child
    pub branch_points: usize,
    /// Named branches
    pub branches: usize,
    /// Longest root-to-node chain, in nodes
    pub max_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ids::SequentialIdGenerator;
    use crate::store::memory::StoreOp;
    use crate::store::InMemoryStore;
    use tracing_test::traced_test;

    fn engine() -> (Arc<InMemoryStore>, Arc<ManualClock>, TimelineEngine) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let engine = TimelineEngine::new(
            store.clone(),
            Arc::new(SequentialIdGenerator::new("id")),
            clock.clone(),
            Logger::new("timeline"),
            "main",
        );
        (store, clock, engine)
    }

    #[tokio::test]
    async fn test_linear_history() {
        let (store, clock, engine) = engine();
        let first = engine.create_node("doc", "first", false).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let second = engine.create_node("doc", "second", true).await.unwrap();

        assert!(first.is_root());
        assert_eq!(second.parent_ids, vec![first.id.clone()]);
        assert_eq!(store.get_node(&first.id).await.unwrap().unwrap().child_ids, vec![second.id.clone()]);

        let history = engine.get_history("doc").await.unwrap().unwrap();
        assert_eq!(history.current_version.as_deref(), Some(second.id.as_str()));

        let main = engine.active_branch("doc").await.unwrap().unwrap();
        assert_eq!(main.name, "main");
        assert_eq!(main.node_ids, vec![first.id, second.id]);
        assert_eq!(second.metadata.creator, Creator::User);
    }

    #[tokio::test]
    async fn test_branch_create_and_switch() {
        let (_store, clock, engine) = engine();
        let root = engine.create_node("doc", "root", false).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let tip = engine.create_node("doc", "tip", false).await.unwrap();

        let experiment = engine.create_branch("doc", "experiment", &root.id).await.unwrap();
        assert_eq!(experiment.node_ids, vec![root.id.clone()]);
        assert!(!experiment.is_active);

        assert!(engine.switch_branch("doc", &experiment.id).await.unwrap());
        let branches = engine.get_branches("doc").await.unwrap();
        assert_eq!(branches.iter().filter(|b| b.is_active).count(), 1);
        assert_eq!(engine.active_branch("doc").await.unwrap().unwrap().id, experiment.id);
        assert_eq!(
            engine.get_history("doc").await.unwrap().unwrap().current_version.as_deref(),
            Some(root.id.as_str())
        );

        clock.advance(chrono::Duration::seconds(1));
        let alt = engine.create_node("doc", "alt", false).await.unwrap();
        assert_eq!(alt.parent_ids, vec![root.id.clone()]);
        let experiment = engine.find_branch("doc", "experiment").await.unwrap().unwrap();
        assert_eq!(experiment.node_ids, vec![root.id.clone(), alt.id.clone()]);

        let main = engine.find_branch("doc", "main").await.unwrap().unwrap();
        assert_eq!(main.last_node(), Some(tip.id.as_str()));
        assert!(engine.get_node(&root.id).await.unwrap().unwrap().is_branch_point());
    }

    #[tokio::test]
    async fn test_switch_to_unknown_branch_fails() {
        let (store, _clock, engine) = engine();
        engine.create_node("doc", "root", false).await.unwrap();
        assert!(!engine.switch_branch("doc", "missing").await.unwrap());

        let mut empty = engine.find_branch("doc", "main").await.unwrap().unwrap();
        empty.id = "empty".to_string();
        empty.node_ids.clear();
        store.save_branch(&empty).await.unwrap();
        assert!(!engine.switch_branch("doc", "empty").await.unwrap());

        assert!(!engine.switch_branch("other-doc", &engine.active_branch("doc").await.unwrap().unwrap().id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_create_branch_requires_node_of_file() {
        let (_store, _clock, engine) = engine();
        let a = engine.create_node("a", "root", false).await.unwrap();
        engine.create_node("b", "root", false).await.unwrap();
        assert!(matches!(
            engine.create_branch("b", "x", &a.id).await,
            Err(VersioningError::NotFound { kind: "node", .. })
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_link_rolls_back() {
        let (store, _clock, engine) = engine();
        let root = engine.create_node("doc", "root", false).await.unwrap();

        store.fail_on(StoreOp::SaveFileHistory);
        let err = engine.create_node("doc", "doomed", false).await.unwrap_err();
        assert!(err.is_recoverable());
        store.clear_failures();

        assert_eq!(store.node_count(), 1);
        let root = store.get_node(&root.id).await.unwrap().unwrap();
        assert!(root.child_ids.is_empty());
        let main = engine.find_branch("doc", "main").await.unwrap().unwrap();
        assert_eq!(main.node_ids, vec![root.id.clone()]);
        assert!(logs_contain("rolling back"));
    }

    #[tokio::test]
    async fn test_failed_append_leaves_no_node() {
        let (store, _clock, engine) = engine();
        engine.create_node("doc", "root", false).await.unwrap();
        store.fail_on(StoreOp::AppendChild);
        assert!(engine.create_node("doc", "doomed", false).await.is_err());
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn test_explicit_parents_and_self_reference() {
        let (_store, _clock, engine) = engine();
        let root = engine.create_node("doc", "root", false).await.unwrap();

        let err = engine
            .create_node_with(NodeSpec::new("doc", "loop").id("self").parents(vec!["self".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, VersioningError::CircularDependency));

        let err = engine
            .create_node_with(NodeSpec::new("doc", "orphan").parents(vec!["ghost".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, VersioningError::NotFound { .. }));

        let child = engine
            .create_node_with(NodeSpec::new("doc", "child").parents(vec![root.id.clone()]).content("two words"))
            .await
            .unwrap();
        assert_eq!(child.metadata.word_count, 2);
        assert_eq!(child.metadata.char_count, 9);
    }

    #[tokio::test]
    async fn test_timeline_view() {
        let (_store, clock, engine) = engine();
        let root = engine.create_node("doc", "root", false).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let a = engine.create_node("doc", "a", false).await.unwrap();
        let branch = engine.create_branch("doc", "alt", &root.id).await.unwrap();
        engine.switch_branch("doc", &branch.id).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let b = engine.create_node("doc", "b", false).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let merge = engine
            .create_node_with(NodeSpec::new("doc", "merge").parents(vec![b.id.clone(), a.id.clone()]))
            .await
            .unwrap();

        let timeline = engine.get_timeline("doc").await.unwrap().unwrap();
        assert_eq!(timeline.roots().len(), 1);
        assert_eq!(timeline.children(&root.id).len(), 2);
        assert!(timeline.is_ancestor(&root.id, &merge.id));
        assert_eq!(timeline.descendants(&root.id).len(), 3);
        assert_eq!(timeline.common_ancestor(&a.id, &b.id).unwrap().id, root.id);
        assert_eq!(timeline.common_ancestor(&root.id, &merge.id).unwrap().id, root.id);

        let stats = timeline.stats();
        assert_eq!(stats.total_nodes, 4);
        assert_eq!(stats.merge_nodes, 1);
        assert_eq!(stats.branch_points, 1);
        assert_eq!(stats.branches, 2);
        assert_eq!(stats.max_depth, 3);

        let tree = timeline.format_tree();
        assert!(tree.contains("root"));
        assert!(tree.contains("[merge]"));
        assert!(tree.contains("merged into"));
        assert!(tree.contains("* "));
    }

    #[tokio::test]
    async fn test_missing_timeline() {
        let (_store, _clock, engine) = engine();
        assert!(engine.get_timeline("nothing").await.unwrap().is_none());
        assert!(engine.get_branches("nothing").await.unwrap().is_empty());
    }
}

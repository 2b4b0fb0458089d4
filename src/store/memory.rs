//! In-memory store
//!
//! Ordered maps behind a single mutex. Every trait method takes the lock
//! once, so each call is atomic with respect to the others.
//!
//! Writes can be made to fail on demand with [`InMemoryStore::fail_on`],
//! which is how rollback and partial-success paths are exercised.

use super::VersionStore;
use crate::error::{Result, VersioningError};
use crate::types::{ContextDefinition, FileVersionHistory, TimelineBranch, TimelineNode, VersionSnapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreOp {
    /// `save_node`
    SaveNode,
    /// `append_child_to_node`
    AppendChild,
    /// `save_branch`
    SaveBranch,
    /// `save_snapshot`
    SaveSnapshot,
    /// `save_file_history`
    SaveFileHistory,
}

#[derive(Debug, Default)]
struct Tables {
    nodes: BTreeMap<String, TimelineNode>,
    branches: BTreeMap<String, TimelineBranch>,
    snapshots: BTreeMap<String, VersionSnapshot>,
    histories: BTreeMap<String, FileVersionHistory>,
    contexts: BTreeMap<String, ContextDefinition>,
    kv: BTreeMap<String, String>,
    failing: BTreeSet<StoreOp>,
}

impl Tables {
    fn check(&self, op: StoreOp) -> Result<()> {
        if self.failing.contains(&op) {
            Err(VersioningError::storage(format!("injected failure in {:?}", op)))
        } else {
            Ok(())
        }
    }
}

/// Volatile store for tests and embedding
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an operation fail until [`InMemoryStore::clear_failures`]
    pub fn fail_on(&self, op: StoreOp) {
        self.tables.lock().failing.insert(op);
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.tables.lock().failing.clear();
    }

    /// Number of stored nodes
    pub fn node_count(&self) -> usize {
        self.tables.lock().nodes.len()
    }

    /// Number of stored snapshots
    pub fn snapshot_count(&self) -> usize {
        self.tables.lock().snapshots.len()
    }
}

#[async_trait]
impl VersionStore for InMemoryStore {
    async fn get_node(&self, id: &str) -> Result<Option<TimelineNode>> {
        Ok(self.tables.lock().nodes.get(id).cloned())
    }

    async fn save_node(&self, node: &TimelineNode) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.check(StoreOp::SaveNode)?;
        tables.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn delete_node(&self, id: &str) -> Result<bool> {
        Ok(self.tables.lock().nodes.remove(id).is_some())
    }

    async fn append_child_to_node(&self, node_id: &str, child_id: &str) -> Result<bool> {
        let mut tables = self.tables.lock();
        tables.check(StoreOp::AppendChild)?;
        match tables.nodes.get_mut(node_id) {
            Some(node) => {
                if !node.child_ids.iter().any(|c| c == child_id) {
                    node.child_ids.push(child_id.to_string());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_nodes_for_file(&self, file_id: &str) -> Result<Vec<TimelineNode>> {
        let tables = self.tables.lock();
        let mut nodes: Vec<TimelineNode> = tables
            .nodes
            .values()
            .filter(|n| n.metadata.file_id == file_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(nodes)
    }

    async fn get_branch(&self, id: &str) -> Result<Option<TimelineBranch>> {
        Ok(self.tables.lock().branches.get(id).cloned())
    }

    async fn save_branch(&self, branch: &TimelineBranch) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.check(StoreOp::SaveBranch)?;
        tables.branches.insert(branch.id.clone(), branch.clone());
        Ok(())
    }

    async fn delete_branch(&self, id: &str) -> Result<bool> {
        Ok(self.tables.lock().branches.remove(id).is_some())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<VersionSnapshot>> {
        Ok(self.tables.lock().snapshots.get(id).cloned())
    }

    async fn get_snapshots(&self, node_id: &str) -> Result<Vec<VersionSnapshot>> {
        let tables = self.tables.lock();
        let mut snapshots: Vec<VersionSnapshot> = tables
            .snapshots
            .values()
            .filter(|s| s.node_id == node_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snapshots)
    }

    async fn save_snapshot(&self, snapshot: &VersionSnapshot) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.check(StoreOp::SaveSnapshot)?;
        tables.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete_snapshot(&self, id: &str) -> Result<bool> {
        Ok(self.tables.lock().snapshots.remove(id).is_some())
    }

    async fn get_file_history(&self, file_id: &str) -> Result<Option<FileVersionHistory>> {
        Ok(self.tables.lock().histories.get(file_id).cloned())
    }

    async fn save_file_history(&self, history: &FileVersionHistory) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.check(StoreOp::SaveFileHistory)?;
        tables.histories.insert(history.file_id.clone(), history.clone());
        Ok(())
    }

    async fn list_file_histories(&self) -> Result<Vec<FileVersionHistory>> {
        Ok(self.tables.lock().histories.values().cloned().collect())
    }

    async fn delete_file_history(&self, file_id: &str) -> Result<bool> {
        Ok(self.tables.lock().histories.remove(file_id).is_some())
    }

    async fn save_context(&self, context: &ContextDefinition) -> Result<()> {
        self.tables.lock().contexts.insert(context.id.clone(), context.clone());
        Ok(())
    }

    async fn list_contexts(&self) -> Result<Vec<ContextDefinition>> {
        Ok(self.tables.lock().contexts.values().cloned().collect())
    }

    async fn delete_context(&self, id: &str) -> Result<bool> {
        Ok(self.tables.lock().contexts.remove(id).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.tables.lock().kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.tables.lock().kv.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Creator, NodeMetadata};
    use chrono::Utc;

    fn node(id: &str, file_id: &str) -> TimelineNode {
        TimelineNode {
            id: id.to_string(),
            timestamp: Utc::now(),
            parent_ids: vec![],
            child_ids: vec![],
            context_id: None,
            label: id.to_string(),
            is_checkpoint: false,
            metadata: NodeMetadata {
                file_id: file_id.to_string(),
                file_path: format!("{}.md", file_id),
                word_count: 0,
                char_count: 0,
                content_hash: String::new(),
                creator: Creator::User,
            },
        }
    }

    #[tokio::test]
    async fn test_append_child_is_idempotent() {
        let store = InMemoryStore::new();
        store.save_node(&node("a", "f")).await.unwrap();

        assert!(store.append_child_to_node("a", "b").await.unwrap());
        assert!(store.append_child_to_node("a", "b").await.unwrap());
        assert_eq!(store.get_node("a").await.unwrap().unwrap().child_ids, vec!["b"]);

        assert!(!store.append_child_to_node("missing", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_lookups_are_none() {
        let store = InMemoryStore::new();
        assert!(store.get_node("x").await.unwrap().is_none());
        assert!(store.get_branch("x").await.unwrap().is_none());
        assert!(store.get_snapshot("x").await.unwrap().is_none());
        assert!(store.get_file_history("x").await.unwrap().is_none());
        assert!(!store.delete_node("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryStore::new();
        store.fail_on(StoreOp::SaveNode);
        let err = store.save_node(&node("a", "f")).await.unwrap_err();
        assert!(err.is_recoverable());

        store.clear_failures();
        store.save_node(&node("a", "f")).await.unwrap();
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn test_list_nodes_for_file() {
        let store = InMemoryStore::new();
        store.save_node(&node("a", "f1")).await.unwrap();
        store.save_node(&node("b", "f2")).await.unwrap();
        store.save_node(&node("c", "f1")).await.unwrap();

        let ids: Vec<_> = store
            .list_nodes_for_file("f1")
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()) && ids.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_key_value() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}

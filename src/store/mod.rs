//! Persistence interface and backends
//!
//! The engines never touch storage directly; they talk to a
//! [`VersionStore`]. The store exclusively owns durable entities (nodes,
//! snapshots, branches, file histories, context definitions). Everything
//! the engines keep in memory can be rebuilt from it.
//!
//! Backends:
//! - [`InMemoryStore`]: maps behind a mutex, for tests and embedding
//! - [`FileStore`]: one record per file under a directory, written atomically
//!
//! [`MigrationRunner`] applies versioned schema steps exactly once, using the
//! store's key-value area for bookkeeping.

pub mod file;
pub mod memory;
pub mod migration;

pub use file::FileStore;
pub use memory::InMemoryStore;
pub use migration::{Migration, MigrationContext, MigrationRunner};

use crate::error::Result;
use crate::types::{ContextDefinition, FileVersionHistory, TimelineBranch, TimelineNode, VersionSnapshot};
use async_trait::async_trait;

/// Key under which the applied schema version is recorded
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Durable storage for the version timeline
///
/// Lookups of absent entities return `Ok(None)` (or `false` for deletes);
/// errors are reserved for failing storage.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Fetch a node by id
    async fn get_node(&self, id: &str) -> Result<Option<TimelineNode>>;

    /// Insert or replace a node
    async fn save_node(&self, node: &TimelineNode) -> Result<()>;

    /// Remove a node, returning whether it existed
    async fn delete_node(&self, id: &str) -> Result<bool>;

    /// Atomically add `child_id` to the node's children
    ///
    /// Idempotent: an existing child is left as is and reported as success.
    /// Returns `false` only when the node does not exist.
    async fn append_child_to_node(&self, node_id: &str, child_id: &str) -> Result<bool>;

    /// All nodes of a file, oldest first
    async fn list_nodes_for_file(&self, file_id: &str) -> Result<Vec<TimelineNode>>;

    /// Fetch a branch by id
    async fn get_branch(&self, id: &str) -> Result<Option<TimelineBranch>>;

    /// Insert or replace a branch
    async fn save_branch(&self, branch: &TimelineBranch) -> Result<()>;

    /// Remove a branch, returning whether it existed
    async fn delete_branch(&self, id: &str) -> Result<bool>;

    /// Fetch a snapshot by id
    async fn get_snapshot(&self, id: &str) -> Result<Option<VersionSnapshot>>;

    /// Snapshots attached to a node
    async fn get_snapshots(&self, node_id: &str) -> Result<Vec<VersionSnapshot>>;

    /// Insert or replace a snapshot
    async fn save_snapshot(&self, snapshot: &VersionSnapshot) -> Result<()>;

    /// Remove a snapshot, returning whether it existed
    async fn delete_snapshot(&self, id: &str) -> Result<bool>;

    /// Fetch a file's history
    async fn get_file_history(&self, file_id: &str) -> Result<Option<FileVersionHistory>>;

    /// Insert or replace a file's history
    async fn save_file_history(&self, history: &FileVersionHistory) -> Result<()>;

    /// Every file history
    async fn list_file_histories(&self) -> Result<Vec<FileVersionHistory>>;

    /// Remove a file's history record, returning whether it existed
    async fn delete_file_history(&self, file_id: &str) -> Result<bool>;

    /// Insert or replace a context definition
    async fn save_context(&self, context: &ContextDefinition) -> Result<()>;

    /// Every context definition
    async fn list_contexts(&self) -> Result<Vec<ContextDefinition>>;

    /// Remove a context definition, returning whether it existed
    async fn delete_context(&self, id: &str) -> Result<bool>;

    /// Read a bookkeeping value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a bookkeeping value
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

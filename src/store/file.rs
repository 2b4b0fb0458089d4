//! File-backed store
//!
//! Each entity is one file under the store root:
//!
//! ```text
//! <root>/
//! ├── nodes/<key>.json
//! ├── branches/<key>.json
//! ├── snapshots/<key>.bin        (bincode, carries binary diff payloads)
//! ├── histories/<key>.json
//! ├── contexts/<key>.json
//! └── kv.json
//! ```
//!
//! `<key>` is a hash of the entity id, so arbitrary ids (including file
//! paths used as file ids) map to safe file names. Every write goes through
//! [`atomic_write`]: a reader sees either the old record or the new one.
//! Writes are serialized by an async lock, which also makes
//! read-modify-write operations like `append_child_to_node` atomic.

use super::VersionStore;
use crate::error::{Result, VersioningError};
use crate::logging::Logger;
use crate::types::{ContextDefinition, FileVersionHistory, TimelineBranch, TimelineNode, VersionSnapshot};
use crate::utils::{atomic_write, hash_content};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const NODES: &str = "nodes";
const BRANCHES: &str = "branches";
const SNAPSHOTS: &str = "snapshots";
const HISTORIES: &str = "histories";
const CONTEXTS: &str = "contexts";
const KV_FILE: &str = "kv.json";

#[derive(Debug, Clone, Copy)]
enum Encoding {
    Json,
    Bincode,
}

impl Encoding {
    fn extension(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Bincode => "bin",
        }
    }

    fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec_pretty(value)?),
            Encoding::Bincode => Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?),
        }
    }

    fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Encoding::Json => Ok(serde_json::from_slice(bytes)?),
            Encoding::Bincode => {
                let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
                Ok(value)
            }
        }
    }
}

/// Directory-backed persistent store
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    logger: Logger,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>, logger: Logger) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [NODES, BRANCHES, SNAPSHOTS, HISTORIES, CONTEXTS] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        logger.debug(format!("Opened file store at {:?}", root));
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            logger,
        })
    }

    /// Whether `root` already holds a store
    pub fn exists(root: impl AsRef<Path>) -> bool {
        root.as_ref().join(NODES).is_dir()
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, table: &str, id: &str, encoding: Encoding) -> PathBuf {
        let key = &hash_content(id)[..32];
        self.root.join(table).join(format!("{}.{}", key, encoding.extension()))
    }

    async fn read_record<T: DeserializeOwned>(&self, table: &str, id: &str, encoding: Encoding) -> Result<Option<T>> {
        let path = self.record_path(table, id, encoding);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(encoding.decode(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record<T: Serialize>(&self, table: &str, id: &str, encoding: Encoding, value: &T) -> Result<()> {
        let path = self.record_path(table, id, encoding);
        let bytes = encoding.encode(value)?;
        self.logger
            .trace(format!("Writing {} record {} ({} bytes)", table, id, bytes.len()));
        write_blocking(path, bytes).await
    }

    async fn remove_record(&self, table: &str, id: &str, encoding: Encoding) -> Result<bool> {
        let path = self.record_path(table, id, encoding);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_table<T: DeserializeOwned>(&self, table: &str, encoding: Encoding) -> Result<Vec<T>> {
        let mut entries = tokio::fs::read_dir(self.root.join(table)).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(encoding.extension()) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            records.push(encoding.decode(&bytes)?);
        }
        Ok(records)
    }

    async fn read_kv(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read(self.root.join(KV_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_blocking(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
        .await
        .map_err(|e| VersioningError::storage(format!("write task failed: {}", e)))?
}

#[async_trait]
impl VersionStore for FileStore {
    async fn get_node(&self, id: &str) -> Result<Option<TimelineNode>> {
        self.read_record(NODES, id, Encoding::Json).await
    }

    async fn save_node(&self, node: &TimelineNode) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_record(NODES, &node.id, Encoding::Json, node).await
    }

    async fn delete_node(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.remove_record(NODES, id, Encoding::Json).await
    }

    async fn append_child_to_node(&self, node_id: &str, child_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut node) = self.read_record::<TimelineNode>(NODES, node_id, Encoding::Json).await? else {
            return Ok(false);
        };
        if node.child_ids.iter().any(|c| c == child_id) {
            return Ok(true);
        }
        node.child_ids.push(child_id.to_string());
        self.write_record(NODES, node_id, Encoding::Json, &node).await?;
        Ok(true)
    }

    async fn list_nodes_for_file(&self, file_id: &str) -> Result<Vec<TimelineNode>> {
        let mut nodes: Vec<TimelineNode> = self
            .read_table::<TimelineNode>(NODES, Encoding::Json)
            .await?
            .into_iter()
            .filter(|n| n.metadata.file_id == file_id)
            .collect();
        nodes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(nodes)
    }

    async fn get_branch(&self, id: &str) -> Result<Option<TimelineBranch>> {
        self.read_record(BRANCHES, id, Encoding::Json).await
    }

    async fn save_branch(&self, branch: &TimelineBranch) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_record(BRANCHES, &branch.id, Encoding::Json, branch).await
    }

    async fn delete_branch(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.remove_record(BRANCHES, id, Encoding::Json).await
    }

    async fn get_snapshot(&self, id: &str) -> Result<Option<VersionSnapshot>> {
        self.read_record(SNAPSHOTS, id, Encoding::Bincode).await
    }

    async fn get_snapshots(&self, node_id: &str) -> Result<Vec<VersionSnapshot>> {
        let mut snapshots: Vec<VersionSnapshot> = self
            .read_table::<VersionSnapshot>(SNAPSHOTS, Encoding::Bincode)
            .await?
            .into_iter()
            .filter(|s| s.node_id == node_id)
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snapshots)
    }

    async fn save_snapshot(&self, snapshot: &VersionSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_record(SNAPSHOTS, &snapshot.id, Encoding::Bincode, snapshot).await
    }

    async fn delete_snapshot(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.remove_record(SNAPSHOTS, id, Encoding::Bincode).await
    }

    async fn get_file_history(&self, file_id: &str) -> Result<Option<FileVersionHistory>> {
        self.read_record(HISTORIES, file_id, Encoding::Json).await
    }

    async fn save_file_history(&self, history: &FileVersionHistory) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_record(HISTORIES, &history.file_id, Encoding::Json, history).await
    }

    async fn list_file_histories(&self) -> Result<Vec<FileVersionHistory>> {
        let mut histories: Vec<FileVersionHistory> = self.read_table(HISTORIES, Encoding::Json).await?;
        histories.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(histories)
    }

    async fn delete_file_history(&self, file_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.remove_record(HISTORIES, file_id, Encoding::Json).await
    }

    async fn save_context(&self, context: &ContextDefinition) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_record(CONTEXTS, &context.id, Encoding::Json, context).await
    }

    async fn list_contexts(&self) -> Result<Vec<ContextDefinition>> {
        let mut contexts: Vec<ContextDefinition> = self.read_table(CONTEXTS, Encoding::Json).await?;
        contexts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(contexts)
    }

    async fn delete_context(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.remove_record(CONTEXTS, id, Encoding::Json).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_kv().await?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut kv = self.read_kv().await?;
        kv.insert(key.to_string(), value.to_string());
        write_blocking(self.root.join(KV_FILE), serde_json::to_vec_pretty(&kv)?).await
    }
}

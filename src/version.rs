//! Snapshot creation and content reconstruction
//!
//! [`VersionManager`] decides how each version's content is stored:
//!
//! - **Full snapshot** when the file has no head yet, when the version is a
//!   checkpoint, or when the head's snapshot already sits at the configured
//!   diff-chain depth (by default: whenever the parent is itself a diff),
//!   or when the head's content can no longer be reconstructed.
//! - **Diff snapshot** otherwise: a word-level patch from the head's content,
//!   bincode-encoded and compressed.
//!
//! A snapshot never carries both payloads.
//!
//! Restoring a diff snapshot walks the `parent_snapshot_id` chain back to
//! the nearest full snapshot (or cached content) and replays the patches
//! forward. Missing ancestors, loops and hash mismatches are integrity
//! errors; a restore never silently returns empty content.

use crate::clock::Clock;
use crate::collections::{BoundedCache, HashSet, HashSetExt};
use crate::compression::{CompressionEngine, CompressionStats};
use crate::diff::{DiffEngine, DiffGranularity, Patch};
use crate::error::{Result, VersioningError};
use crate::ids::IdGenerator;
use crate::logging::Logger;
use crate::store::VersionStore;
use crate::types::{FileVersionHistory, VersionSnapshot, VersioningConfig};
use crate::utils::hash_content;
use parking_lot::Mutex;
use std::sync::Arc;

/// Stores and reconstructs version content
pub struct VersionManager {
    store: Arc<dyn VersionStore>,
    diff: DiffEngine,
    compression: Mutex<CompressionEngine>,
    /// snapshot id -> reconstructed content
    cache: Mutex<BoundedCache<String, Arc<str>>>,
    max_chain_length: usize,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    logger: Logger,
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionManager")
            .field("max_chain_length", &self.max_chain_length)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl VersionManager {
    /// Create a manager over a store
    pub fn new(
        store: Arc<dyn VersionStore>,
        config: &VersioningConfig,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        logger: Logger,
    ) -> Self {
        Self {
            store,
            diff: DiffEngine::new(DiffGranularity::default(), logger.child("diff")),
            compression: Mutex::new(CompressionEngine::new(
                config.compression.clone(),
                logger.child("compression"),
            )),
            cache: Mutex::new(BoundedCache::new(config.content_cache_size)),
            max_chain_length: config.max_diff_chain_length.max(1),
            ids,
            clock,
            logger,
        }
    }

    /// Store the content of a new version of `file_id`
    ///
    /// The snapshot is attached to `node_id`, which the caller creates
    /// afterwards in the timeline. The file history is created if needed
    /// and gains the snapshot id.
    pub async fn create_version_snapshot(
        &self,
        file_id: &str,
        node_id: &str,
        content: &str,
        is_checkpoint: bool,
    ) -> Result<VersionSnapshot> {
        let now = self.clock.now();
        let mut history = match self.store.get_file_history(file_id).await? {
            Some(history) => history,
            None => FileVersionHistory::new(file_id, file_id, now),
        };

        let parent = match (&history.current_version, is_checkpoint) {
            (Some(head), false) => self.latest_snapshot(head).await?,
            _ => None,
        };
        let base = match parent {
            Some(parent) => self.diff_base(file_id, parent).await?,
            None => None,
        };

        let mut snapshot = VersionSnapshot {
            id: self.ids.next_id(),
            file_id: file_id.to_string(),
            node_id: node_id.to_string(),
            parent_snapshot_id: None,
            content_hash: hash_content(content),
            size: content.len(),
            full_content: None,
            diff_from_parent: None,
            created_at: now,
        };

        match base {
            Some((base, base_content)) => {
                let patch = self.diff.create_patch(&base_content, content);
                let encoded = patch.encode()?;
                let compressed = self.compression.lock().compress(&encoded)?;
                self.logger.debug(format!(
                    "Diff snapshot for {}: {} edits, {} bytes stored for {} bytes of text",
                    file_id,
                    patch.edit_count(),
                    compressed.compressed_size,
                    content.len()
                ));
                snapshot.parent_snapshot_id = Some(base.id);
                snapshot.diff_from_parent = Some(compressed);
            }
            None => {
                self.logger
                    .debug(format!("Full snapshot for {} ({} bytes)", file_id, content.len()));
                snapshot.full_content = Some(content.to_string());
            }
        }

        snapshot.validate()?;
        self.store.save_snapshot(&snapshot).await?;

        history.snapshots.push(snapshot.id.clone());
        history.last_modified = now;
        self.store.save_file_history(&history).await?;

        self.cache.lock().insert(snapshot.id.clone(), Arc::from(content));
        Ok(snapshot)
    }

    /// Reconstruct the content of a snapshot
    ///
    /// # Errors
    ///
    /// - [`VersioningError::NotFound`] if the snapshot does not exist
    /// - [`VersioningError::Integrity`] for broken or looping chains and
    ///   content that does not match its recorded hash
    pub async fn restore_version(&self, snapshot_id: &str) -> Result<String> {
        if let Some(cached) = self.cache.lock().get(&snapshot_id.to_string()) {
            return Ok(cached.to_string());
        }

        let target = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| VersioningError::not_found("snapshot", snapshot_id))?;

        // Collect diffs back to a full snapshot or cached content
        let mut pending: Vec<VersionSnapshot> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = target;
        let mut content: String = loop {
            if !visited.insert(current.id.clone()) {
                return Err(VersioningError::integrity(format!(
                    "diff chain of snapshot {} loops at {}",
                    snapshot_id, current.id
                )));
            }
            current.validate()?;

            if current.id != snapshot_id {
                if let Some(cached) = self.cache.lock().get(&current.id) {
                    break cached.to_string();
                }
            }
            if let Some(full) = &current.full_content {
                let full = full.clone();
                Self::verify_hash(&current, &full)?;
                break full;
            }

            let parent_id = current.parent_snapshot_id.clone().ok_or_else(|| {
                VersioningError::integrity(format!("diff snapshot {} has no parent", current.id))
            })?;
            let parent = self.store.get_snapshot(&parent_id).await?.ok_or_else(|| {
                VersioningError::integrity(format!(
                    "diff chain of snapshot {} is broken: ancestor {} is missing",
                    snapshot_id, parent_id
                ))
            })?;
            pending.push(current);
            current = parent;
        };

        if !pending.is_empty() {
            self.logger.trace(format!(
                "Replaying {} patches to restore snapshot {}",
                pending.len(),
                snapshot_id
            ));
        }
        for snapshot in pending.iter().rev() {
            let Some(diff) = &snapshot.diff_from_parent else {
                return Err(VersioningError::integrity(format!(
                    "snapshot {} lost its diff payload",
                    snapshot.id
                )));
            };
            let encoded = self.compression.lock().decompress(diff)?;
            let patch = Patch::decode(&encoded).map_err(|e| {
                VersioningError::integrity(format!("snapshot {} holds an unreadable patch: {}", snapshot.id, e))
            })?;
            content = self.diff.apply_patch(&patch, &content).map_err(|e| {
                VersioningError::integrity(format!("cannot replay snapshot {}: {}", snapshot.id, e))
            })?;
            Self::verify_hash(snapshot, &content)?;
            self.cache.lock().insert(snapshot.id.clone(), Arc::from(content.as_str()));
        }

        Ok(content)
    }

    /// Parent snapshot and its content, if a diff against it is possible
    ///
    /// A parent at the chain limit, or one whose content cannot be
    /// reconstructed, yields `None` so the new version is stored in full.
    async fn diff_base(&self, file_id: &str, parent: VersionSnapshot) -> Result<Option<(VersionSnapshot, String)>> {
        let restored = match self.chain_depth(&parent).await {
            Ok(depth) if depth >= self.max_chain_length => return Ok(None),
            Ok(_) => self.restore_version(&parent.id).await,
            Err(e) => Err(e),
        };
        match restored {
            Ok(content) => Ok(Some((parent, content))),
            Err(e) if e.is_integrity() => {
                self.logger.warn(format!(
                    "Head snapshot {} of {} is unrestorable, storing full content: {}",
                    parent.id, file_id, e
                ));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Most recent snapshot attached to a node
    pub async fn latest_snapshot(&self, node_id: &str) -> Result<Option<VersionSnapshot>> {
        Ok(self.store.get_snapshots(node_id).await?.pop())
    }

    /// Content of a node's most recent snapshot, `None` if it has none
    pub async fn restore_node(&self, node_id: &str) -> Result<Option<String>> {
        match self.latest_snapshot(node_id).await? {
            Some(snapshot) => Ok(Some(self.restore_version(&snapshot.id).await?)),
            None => Ok(None),
        }
    }

    /// Number of diff links between a snapshot and its full ancestor
    pub async fn chain_depth(&self, snapshot: &VersionSnapshot) -> Result<usize> {
        let mut depth = 0;
        let mut current = snapshot.clone();
        let mut visited: HashSet<String> = HashSet::new();
        while !current.is_full() {
            if !visited.insert(current.id.clone()) {
                return Err(VersioningError::integrity(format!(
                    "diff chain loops at snapshot {}",
                    current.id
                )));
            }
            depth += 1;
            let Some(parent_id) = current.parent_snapshot_id.clone() else {
                break;
            };
            match self.store.get_snapshot(&parent_id).await? {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(depth)
    }

    /// Compression statistics so far
    pub fn compression_stats(&self) -> CompressionStats {
        self.compression.lock().stats().clone()
    }

    /// Number of cached contents
    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    /// Drop cached content for the given snapshots
    pub fn forget(&self, snapshot_ids: &[String]) {
        let mut cache = self.cache.lock();
        for id in snapshot_ids {
            cache.remove(id);
        }
    }

    /// Drop all cached content
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn verify_hash(snapshot: &VersionSnapshot, content: &str) -> Result<()> {
        let actual = hash_content(content);
        if actual != snapshot.content_hash {
            return Err(VersioningError::integrity(format!(
                "snapshot {} content hash mismatch (expected {}, got {})",
                snapshot.id, snapshot.content_hash, actual
            )));
        }
        Ok(())
    }
}

//! Context-aware versioning front end
//!
//! [`Palimpsest`] ties detection, storage and the timeline together. For each
//! change to a file it:
//!
//! 1. stores a full "Initial version" if the file has never been seen
//! 2. otherwise runs context-shift detection against the last content
//! 3. if the fused probability exceeds the shift threshold and the file's
//!    hourly budget allows it, stores a snapshot and links a timeline node
//!    labelled with the suggested context
//!
//! Manual checkpoints skip detection and the rate limit. Rapid edits can be
//! debounced with [`Palimpsest::submit_change`] and the flush methods.
//!
//! ## Example
//!
//! ```rust
//! use palimpsest::{PalimpsestBuilder, ContextDefinition};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> palimpsest::Result<()> {
//! let p = PalimpsestBuilder::new()
//!     .context(ContextDefinition::new("fantasy", "Fantasy", ["wizard", "dragon"]))
//!     .build()
//!     .await?;
//!
//! let outcome = p.handle_change("ch1", "ch1.md", "It was a quiet morning.").await?;
//! assert!(outcome.created_version());
//!
//! p.create_manual_checkpoint("ch1", "It was a quiet morning. Then the dragon came.", Some("Dragon"))
//!     .await?;
//! let timeline = p.get_timeline_for_file("ch1").await?.unwrap();
//! assert_eq!(timeline.nodes.len(), 2);
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::collections::{HashMap, HashMapExt};
use crate::detection::ContextDetectionEngine;
use crate::error::Result;
use crate::ids::{IdGenerator, UuidGenerator};
use crate::logging::Logger;
use crate::navigation::NavigationEngine;
use crate::store::{FileStore, InMemoryStore, MigrationRunner, VersionStore};
use crate::timeline::{NodeSpec, Timeline, TimelineEngine};
use crate::types::{
    ChangeOutcome, ContextDefinition, ContextShiftDetection, Creator, FileEvent, FileOperation,
    MergeOptions, MergeResult, NavigationPath, Statistics, TimelineBranch, VersioningConfig,
};
use crate::verification::{FileVerificationReport, TimelineVerifier};
use crate::version::VersionManager;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Key under which the configuration is persisted
pub const CONFIG_KEY: &str = "config";

/// A change waiting for its debounce window to pass
#[derive(Debug, Clone)]
struct PendingChange {
    file_id: String,
    path: String,
    content: String,
    submitted_at: DateTime<Utc>,
}

/// Builder for [`Palimpsest`]
///
/// # Examples
///
/// ```rust
/// use palimpsest::{PalimpsestBuilder, VersioningConfig};
/// use palimpsest::store::InMemoryStore;
/// use std::sync::Arc;
///
/// let builder = PalimpsestBuilder::new()
///     .store(Arc::new(InMemoryStore::new()))
///     .config(VersioningConfig { max_snapshots_per_hour: 4, ..Default::default() });
/// ```
pub struct PalimpsestBuilder {
    store: Option<Arc<dyn VersionStore>>,
    config: Option<VersioningConfig>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    logger: Logger,
    contexts: Vec<ContextDefinition>,
}

impl PalimpsestBuilder {
    /// Builder with an in-memory store and default settings
    pub fn new() -> Self {
        Self {
            store: None,
            config: None,
            ids: Arc::new(UuidGenerator),
            clock: Arc::new(SystemClock),
            logger: Logger::new("palimpsest"),
            contexts: Vec::new(),
        }
    }

    /// Persist into `store`
    pub fn store(mut self, store: Arc<dyn VersionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this configuration instead of the stored or default one
    pub fn config(mut self, config: VersioningConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Identifier source
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Root logger; components log through children of it
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Register a context, saved to the store on build
    pub fn context(mut self, context: ContextDefinition) -> Self {
        self.contexts.push(context);
        self
    }

    /// Open the store, run migrations and load contexts
    ///
    /// Without an explicit [`config`](Self::config), a configuration
    /// persisted in the store is used, falling back to defaults.
    pub async fn build(self) -> Result<Palimpsest> {
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));

        let config = match self.config {
            Some(config) => config,
            None => match store.get(CONFIG_KEY).await? {
                Some(json) => serde_json::from_str(&json)?,
                None => VersioningConfig::default(),
            },
        };
        config.validate()?;

        let applied = MigrationRunner::with_builtin(
            &config.main_branch_name,
            self.clock.clone(),
            self.logger.child("migration"),
        )
        .run(&store)
        .await?;
        if !applied.is_empty() {
            self.logger.info(format!("Applied schema migrations {:?}", applied));
        }

        for context in &self.contexts {
            store.save_context(context).await?;
        }
        let contexts = store
            .list_contexts()
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let versions = Arc::new(VersionManager::new(
            store.clone(),
            &config,
            self.ids.clone(),
            self.clock.clone(),
            self.logger.child("version"),
        ));
        let timeline = Arc::new(TimelineEngine::new(
            store.clone(),
            self.ids.clone(),
            self.clock.clone(),
            self.logger.child("timeline"),
            config.main_branch_name.clone(),
        ));
        let navigation = NavigationEngine::new(
            store.clone(),
            timeline.clone(),
            versions.clone(),
            self.ids.clone(),
            &config,
            self.logger.child("navigation"),
        );

        Ok(Palimpsest {
            store,
            config: RwLock::new(config),
            versions,
            timeline,
            navigation,
            contexts: RwLock::new(contexts),
            detectors: Mutex::new(HashMap::new()),
            last_content: Mutex::new(HashMap::new()),
            recent_snapshots: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            file_locks: Mutex::new(HashMap::new()),
            stats: Mutex::new(Statistics::default()),
            ids: self.ids,
            clock: self.clock,
            logger: self.logger,
        })
    }
}

impl Default for PalimpsestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The versioning engine
pub struct Palimpsest {
    store: Arc<dyn VersionStore>,
    config: RwLock<VersioningConfig>,
    versions: Arc<VersionManager>,
    timeline: Arc<TimelineEngine>,
    navigation: NavigationEngine,
    contexts: RwLock<BTreeMap<String, ContextDefinition>>,
    /// One detector per file, so analyzer state never mixes files
    detectors: Mutex<HashMap<String, ContextDetectionEngine>>,
    last_content: Mutex<HashMap<String, String>>,
    /// Automatic snapshot times per file, oldest first
    recent_snapshots: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    pending: Mutex<Vec<PendingChange>>,
    /// Serialises work on one file
    file_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    stats: Mutex<Statistics>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    logger: Logger,
}

impl std::fmt::Debug for Palimpsest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Palimpsest")
            .field("config", &*self.config.read())
            .field("contexts", &self.contexts.read().len())
            .field("tracked_files", &self.detectors.lock().len())
            .field("pending", &self.pending.lock().len())
            .field("versions", &self.versions)
            .field("navigation", &self.navigation)
            .finish()
    }
}

impl Palimpsest {
    /// Engine over a fresh in-memory store with default settings
    pub async fn in_memory() -> Result<Self> {
        PalimpsestBuilder::new().build().await
    }

    /// Engine over a file-backed store rooted at `root`
    ///
    /// The directory is created if needed. Configuration and contexts
    /// persisted there are picked up.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let builder = PalimpsestBuilder::new();
        let store = FileStore::open(root, builder.logger.child("store"))?;
        builder.store(Arc::new(store)).build().await
    }

    /// Process a change to a file's content
    ///
    /// # Errors
    ///
    /// Storage failures while storing the snapshot. A failure after the
    /// snapshot was stored is reported as [`ChangeOutcome::PartialSuccess`].
    #[instrument(skip(self, content), fields(len = content.len()))]
    pub async fn handle_change(&self, file_id: &str, path: &str, content: &str) -> Result<ChangeOutcome> {
        self.process_change(file_id, path, content, FileOperation::Modify).await
    }

    /// Process a host notification
    #[instrument(skip(self, event), fields(file_id = event.file_id()))]
    pub async fn handle_event(&self, event: FileEvent) -> Result<ChangeOutcome> {
        let operation = event.operation();
        match event {
            FileEvent::Created { file_id, path, content } | FileEvent::Modified { file_id, path, content } => {
                self.process_change(&file_id, &path, &content, operation).await
            }
            FileEvent::Renamed { file_id, old_path, new_path } => {
                let lock = self.file_lock(&file_id);
                let _guard = lock.lock().await;
                if let Some(mut history) = self.store.get_file_history(&file_id).await? {
                    history.file_path = new_path.clone();
                    history.last_modified = self.clock.now();
                    self.store.save_file_history(&history).await?;
                    self.logger
                        .info(format!("{} moved from {} to {}", file_id, old_path, new_path));
                }
                Ok(ChangeOutcome::Recorded)
            }
            FileEvent::Deleted { file_id, path } => {
                self.forget_file(&file_id);
                self.logger
                    .info(format!("{} ({}) deleted, history kept", file_id, path));
                Ok(ChangeOutcome::Recorded)
            }
        }
    }

    /// Store a version unconditionally
    ///
    /// Bypasses detection and the rate limit. The snapshot is always full.
    #[instrument(skip(self, content))]
    pub async fn create_manual_checkpoint(
        &self,
        file_id: &str,
        content: &str,
        label: Option<&str>,
    ) -> Result<ChangeOutcome> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let history = self.timeline.ensure_history(file_id, file_id).await?;
        let context = self.detectors.lock().get(file_id).and_then(|d| d.active_context().map(str::to_string));
        let label = label.map(str::to_string).unwrap_or_else(|| "Manual checkpoint".to_string());
        let outcome = self
            .record_version(&history.file_path, file_id, content, label, true, context, Creator::User, None)
            .await?;

        self.last_content.lock().insert(file_id.to_string(), content.to_string());
        self.stats.lock().manual_checkpoints += 1;
        Ok(outcome)
    }

    /// Buffer a change until the file has been quiet for the debounce window
    pub fn submit_change(&self, file_id: &str, path: &str, content: &str) {
        let mut pending = self.pending.lock();
        pending.retain(|p| p.file_id != file_id);
        pending.push(PendingChange {
            file_id: file_id.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            submitted_at: self.clock.now(),
        });
    }

    /// Number of buffered changes
    pub fn pending_changes(&self) -> usize {
        self.pending.lock().len()
    }

    /// Process buffered changes whose debounce window has passed
    ///
    /// Returns `(file_id, outcome)` pairs in submission order.
    pub async fn flush_ready(&self) -> Result<Vec<(String, ChangeOutcome)>> {
        let window = self.config.read().debounce_window()?;
        let now = self.clock.now();
        let ready: Vec<PendingChange> = {
            let mut pending = self.pending.lock();
            let (ready, waiting) = pending.drain(..).partition(|p| now - p.submitted_at >= window);
            *pending = waiting;
            ready
        };
        self.process_pending(ready).await
    }

    /// Process every buffered change now
    pub async fn flush_all(&self) -> Result<Vec<(String, ChangeOutcome)>> {
        let all = std::mem::take(&mut *self.pending.lock());
        self.process_pending(all).await
    }

    /// Record whether the user accepted an automatic version
    pub fn record_feedback(&self, accepted: bool) {
        let mut stats = self.stats.lock();
        stats.feedback_events += 1;
        if accepted {
            stats.feedback_accepted += 1;
        }
    }

    /// Replace a node's context after the user corrected it
    ///
    /// Also makes the corrected context the file's active one. Returns
    /// `false` if the node does not exist.
    pub async fn correct_node_context(&self, node_id: &str, context_id: Option<String>) -> Result<bool> {
        let Some(node) = self.store.get_node(node_id).await? else {
            return Ok(false);
        };
        if !self.timeline.set_node_context(node_id, context_id.clone()).await? {
            return Ok(false);
        }
        if let Some(detector) = self.detectors.lock().get_mut(node.file_id()) {
            detector.set_active_context(context_id);
        }
        let mut stats = self.stats.lock();
        stats.user_corrections += 1;
        stats.feedback_events += 1;
        Ok(true)
    }

    /// Move the file's position to a node and return its content
    ///
    /// `None` if the node does not exist, belongs to another file, or has no
    /// stored content.
    #[instrument(skip(self))]
    pub async fn navigate_to_version(&self, file_id: &str, node_id: &str) -> Result<Option<String>> {
        if !self.navigation.navigate_to_node(file_id, node_id).await? {
            return Ok(None);
        }
        self.versions.restore_node(node_id).await
    }

    /// Move the file's position `steps` forward or backward
    pub async fn navigate_relative(&self, file_id: &str, steps: i64) -> Result<Option<String>> {
        self.navigation.navigate_relative(file_id, steps).await
    }

    /// Content stored for a node
    pub async fn content_at(&self, node_id: &str) -> Result<Option<String>> {
        self.versions.restore_node(node_id).await
    }

    /// Content at the file's head
    pub async fn head_content(&self, file_id: &str) -> Result<Option<String>> {
        match self.store.get_file_history(file_id).await?.and_then(|h| h.current_version) {
            Some(head) => self.versions.restore_node(&head).await,
            None => Ok(None),
        }
    }

    /// The file's graph, with the navigation position filled in
    pub async fn get_timeline_for_file(&self, file_id: &str) -> Result<Option<Timeline>> {
        let mut timeline = self.timeline.get_timeline(file_id).await?;
        if let Some(timeline) = &mut timeline {
            timeline.position = self.navigation.current_position(file_id);
        }
        Ok(timeline)
    }

    /// Shortest route between two nodes
    pub async fn find_path(&self, from: &str, to: &str) -> Result<Option<NavigationPath>> {
        self.navigation.find_path(from, to).await
    }

    /// Start a branch at a node
    pub async fn create_branch(&self, file_id: &str, name: &str, from_node_id: &str) -> Result<TimelineBranch> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;
        self.timeline.create_branch(file_id, name, from_node_id).await
    }

    /// Branches of a file
    pub async fn get_branches(&self, file_id: &str) -> Result<Vec<TimelineBranch>> {
        self.timeline.get_branches(file_id).await
    }

    /// Activate a branch and move the head to its last node
    pub async fn switch_branch(&self, file_id: &str, branch_id: &str) -> Result<bool> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;
        let switched = self.timeline.switch_branch(file_id, branch_id).await?;
        if switched {
            // Next analysis compares against the new head
            self.last_content.lock().remove(file_id);
        }
        Ok(switched)
    }

    /// Merge one branch into another
    #[instrument(skip(self, options), fields(strategy = %options.strategy))]
    pub async fn merge_branches(
        &self,
        source_branch_id: &str,
        target_branch_id: &str,
        options: &MergeOptions,
    ) -> Result<MergeResult> {
        let file_id = self
            .store
            .get_branch(target_branch_id)
            .await?
            .map(|b| b.file_id);
        let lock = file_id.as_deref().map(|f| self.file_lock(f));
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let result = self
            .navigation
            .merge_branches(source_branch_id, target_branch_id, options)
            .await?;
        if result.success {
            self.stats.lock().merges += 1;
            if let Some(file_id) = &file_id {
                self.last_content.lock().remove(file_id);
            }
        }
        Ok(result)
    }

    /// Check a file's stored history
    pub async fn verify_file(&self, file_id: &str) -> Result<FileVerificationReport> {
        TimelineVerifier::new(self.store.as_ref(), &self.versions)
            .verify_file(file_id)
            .await
    }

    /// Delete everything stored for a file
    ///
    /// Returns `false` if the file has no history.
    #[instrument(skip(self))]
    pub async fn purge_file(&self, file_id: &str) -> Result<bool> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;
        let Some(history) = self.store.get_file_history(file_id).await? else {
            return Ok(false);
        };

        let nodes = self.store.list_nodes_for_file(file_id).await?;
        let mut snapshot_ids = history.snapshots.clone();
        for node in &nodes {
            for snapshot in self.store.get_snapshots(&node.id).await? {
                if !snapshot_ids.contains(&snapshot.id) {
                    snapshot_ids.push(snapshot.id);
                }
            }
        }
        for id in &snapshot_ids {
            self.store.delete_snapshot(id).await?;
        }
        for node in &nodes {
            self.store.delete_node(&node.id).await?;
        }
        for id in &history.branches {
            self.store.delete_branch(id).await?;
        }
        self.store.delete_file_history(file_id).await?;

        self.versions.forget(&snapshot_ids);
        self.forget_file(file_id);
        self.logger.info(format!(
            "Purged {}: {} nodes, {} snapshots, {} branches",
            file_id,
            nodes.len(),
            snapshot_ids.len(),
            history.branches.len()
        ));
        Ok(true)
    }

    /// Counters since start-up
    pub fn get_statistics(&self) -> Statistics {
        self.stats.lock().clone()
    }

    /// Current configuration
    pub fn config(&self) -> VersioningConfig {
        self.config.read().clone()
    }

    /// Save the current configuration to the store
    pub async fn persist_config(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.config.read())?;
        self.store.set(CONFIG_KEY, &json).await
    }

    /// Minimum fused probability for a detection to count at all
    pub fn set_detection_sensitivity(&self, min_confidence: f64) -> Result<()> {
        self.update_config(|c| c.min_detection_confidence = min_confidence)?;
        for detector in self.detectors.lock().values_mut() {
            detector.set_min_confidence(min_confidence);
        }
        Ok(())
    }

    /// Probability a change must exceed to become a version
    pub fn set_shift_threshold(&self, threshold: f64) -> Result<()> {
        self.update_config(|c| c.shift_threshold = threshold)
    }

    /// Minimum time between automatic snapshots of one file
    pub fn set_snapshot_interval(&self, interval: Duration) -> Result<()> {
        self.update_config(|c| c.min_snapshot_interval_secs = interval.as_secs())
    }

    /// Automatic snapshots allowed per file per hour
    pub fn set_max_snapshots_per_hour(&self, max: usize) -> Result<()> {
        self.update_config(|c| c.max_snapshots_per_hour = max)
    }

    /// Quiet period used by [`Palimpsest::flush_ready`]
    pub fn set_debounce_window(&self, window: Duration) -> Result<()> {
        let millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.update_config(|c| c.debounce_window_ms = millis)
    }

    /// Add or replace a context
    pub async fn add_context(&self, context: ContextDefinition) -> Result<()> {
        self.store.save_context(&context).await?;
        for detector in self.detectors.lock().values_mut() {
            detector.add_context(ContextDefinition {
                is_active: false,
                ..context.clone()
            });
        }
        self.contexts.write().insert(context.id.clone(), context);
        Ok(())
    }

    /// Remove a context, returning whether it existed
    pub async fn remove_context(&self, context_id: &str) -> Result<bool> {
        let removed = self.store.delete_context(context_id).await?;
        self.contexts.write().remove(context_id);
        for detector in self.detectors.lock().values_mut() {
            detector.remove_context(context_id);
        }
        Ok(removed)
    }

    /// Known contexts
    pub fn list_contexts(&self) -> Vec<ContextDefinition> {
        self.contexts.read().values().cloned().collect()
    }

    /// Declare which context the author is writing `file_id` in
    pub fn set_active_context(&self, file_id: &str, context_id: Option<String>) {
        let mut detectors = self.detectors.lock();
        let detector = detectors
            .entry(file_id.to_string())
            .or_insert_with(|| self.new_detector());
        detector.set_active_context(context_id);
    }

    /// Timeline engine
    pub fn timeline(&self) -> &TimelineEngine {
        &self.timeline
    }

    /// Version manager
    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    /// Navigation engine
    pub fn navigation(&self) -> &NavigationEngine {
        &self.navigation
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
    }

    async fn process_change(
        &self,
        file_id: &str,
        path: &str,
        content: &str,
        trigger: FileOperation,
    ) -> Result<ChangeOutcome> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let history = self.store.get_file_history(file_id).await?;
        let Some(head) = history.as_ref().and_then(|h| h.current_version.clone()) else {
            return self.initial_version(file_id, path, content).await;
        };

        let cached = self.last_content.lock().get(file_id).cloned();
        let previous = match cached {
            Some(previous) => Some(previous),
            None => self.versions.restore_node(&head).await?,
        };
        if previous.as_deref() == Some(content) {
            return Ok(ChangeOutcome::Unchanged);
        }

        let known = self.detectors.lock().contains_key(file_id);
        if !known {
            let context = self.store.get_node(&head).await?.and_then(|n| n.context_id);
            let mut detector = self.new_detector();
            detector.set_active_context(context);
            self.detectors.lock().entry(file_id.to_string()).or_insert(detector);
        }
        let detection = {
            let mut detectors = self.detectors.lock();
            detectors
                .get_mut(file_id)
                .and_then(|d| d.analyze(content, previous.as_deref(), trigger))
        };
        self.last_content.lock().insert(file_id.to_string(), content.to_string());
        self.stats.lock().detections_run += 1;

        let threshold = self.config.read().shift_threshold;
        let detection = match detection {
            Some(detection) if detection.probability > threshold => detection,
            other => {
                return Ok(ChangeOutcome::NoShift {
                    probability: other.map_or(0.0, |d| d.probability),
                })
            }
        };
        self.stats.lock().shifts_detected += 1;

        let now = self.clock.now();
        if !self.rate_allows(file_id, now)? {
            self.stats.lock().rate_limited += 1;
            self.logger.info(format!(
                "Shift in {} (p={:.2}) not versioned: snapshot budget reached",
                file_id, detection.probability
            ));
            return Ok(ChangeOutcome::RateLimited { detection });
        }

        let label = self.shift_label(&detection);
        let context = detection.suggested_context.clone();
        let outcome = self
            .record_version(path, file_id, content, label, false, context.clone(), Creator::Auto, Some(detection))
            .await?;

        self.recent_snapshots
            .lock()
            .entry(file_id.to_string())
            .or_default()
            .push_back(now);
        self.stats.lock().automatic_snapshots += 1;
        if context.is_some() {
            if let Some(detector) = self.detectors.lock().get_mut(file_id) {
                detector.set_active_context(context);
            }
        }
        Ok(outcome)
    }

    async fn initial_version(&self, file_id: &str, path: &str, content: &str) -> Result<ChangeOutcome> {
        self.timeline.ensure_history(file_id, path).await?;
        let outcome = self
            .record_version(
                path,
                file_id,
                content,
                "Initial version".to_string(),
                false,
                None,
                Creator::Auto,
                None,
            )
            .await?;

        // Prime the detector so the next edit has a baseline
        {
            let mut detectors = self.detectors.lock();
            let detector = detectors
                .entry(file_id.to_string())
                .or_insert_with(|| self.new_detector());
            detector.analyze(content, None, FileOperation::Create);
        }
        self.last_content.lock().insert(file_id.to_string(), content.to_string());
        self.stats.lock().initial_versions += 1;
        Ok(outcome)
    }

    /// Snapshot first, then the node that owns it
    #[allow(clippy::too_many_arguments)]
    async fn record_version(
        &self,
        path: &str,
        file_id: &str,
        content: &str,
        label: String,
        is_checkpoint: bool,
        context: Option<String>,
        creator: Creator,
        detection: Option<ContextShiftDetection>,
    ) -> Result<ChangeOutcome> {
        let node_id = self.ids.next_id();
        let snapshot = self
            .versions
            .create_version_snapshot(file_id, &node_id, content, is_checkpoint)
            .await?;
        self.stats.lock().total_snapshots += 1;

        let spec = NodeSpec::new(file_id, label)
            .id(node_id)
            .path(path)
            .checkpoint(is_checkpoint)
            .context(context)
            .creator(creator)
            .content(content);
        match self.timeline.create_node_with(spec).await {
            Ok(node) => Ok(ChangeOutcome::Versioned {
                snapshot_id: snapshot.id,
                node_id: node.id,
                detection,
            }),
            Err(e) => {
                self.stats.lock().partial_failures += 1;
                self.logger.warn(format!(
                    "Snapshot {} stored but timeline not updated for {}: {}",
                    snapshot.id, file_id, e
                ));
                Ok(ChangeOutcome::PartialSuccess {
                    snapshot_id: snapshot.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Whether another automatic snapshot fits the file's budget
    fn rate_allows(&self, file_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let (max_per_hour, min_interval) = {
            let config = self.config.read();
            (config.max_snapshots_per_hour, config.min_snapshot_interval()?)
        };
        let mut recent = self.recent_snapshots.lock();
        let window = recent.entry(file_id.to_string()).or_default();
        let hour_ago = now - chrono::Duration::hours(1);
        while window.front().is_some_and(|t| *t <= hour_ago) {
            window.pop_front();
        }
        if window.len() >= max_per_hour {
            return Ok(false);
        }
        Ok(match window.back() {
            Some(last) => now - *last >= min_interval,
            None => true,
        })
    }

    fn shift_label(&self, detection: &ContextShiftDetection) -> String {
        let name = detection
            .suggested_context
            .as_ref()
            .map(|id| self.contexts.read().get(id).map_or_else(|| id.clone(), |c| c.name.clone()));
        match name {
            Some(name) => format!("Shift to {}", name),
            None => format!("Context shift ({:.0}%)", detection.probability * 100.0),
        }
    }

    fn new_detector(&self) -> ContextDetectionEngine {
        let config = self.config.read().clone();
        let mut detector = ContextDetectionEngine::new(&config, self.clock.clone(), self.logger.child("detection"));
        let contexts = self
            .contexts
            .read()
            .values()
            .map(|c| ContextDefinition {
                is_active: false,
                ..c.clone()
            })
            .collect();
        detector.initialize(contexts);
        detector
    }

    fn update_config(&self, apply: impl FnOnce(&mut VersioningConfig)) -> Result<()> {
        let mut config = self.config.write();
        let mut updated = config.clone();
        apply(&mut updated);
        updated.validate()?;
        *config = updated;
        Ok(())
    }

    async fn process_pending(&self, changes: Vec<PendingChange>) -> Result<Vec<(String, ChangeOutcome)>> {
        let mut outcomes = Vec::with_capacity(changes.len());
        for change in changes {
            let outcome = self
                .process_change(&change.file_id, &change.path, &change.content, FileOperation::Modify)
                .await?;
            outcomes.push((change.file_id, outcome));
        }
        Ok(outcomes)
    }

    fn file_lock(&self, file_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.file_locks
            .lock()
            .entry(file_id.to_string())
            .or_default()
            .clone()
    }

    fn forget_file(&self, file_id: &str) {
        self.detectors.lock().remove(file_id);
        self.last_content.lock().remove(file_id);
        self.recent_snapshots.lock().remove(file_id);
        self.pending.lock().retain(|p| p.file_id != file_id);
        self.navigation.forget_file(file_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::VersioningError;
    use crate::ids::SequentialIdGenerator;
    use crate::store::memory::StoreOp;
    use crate::types::MergeStrategy;
    use tracing_test::traced_test;

    const CALM: &str = "The cat sat on the mat and looked out of the window at the rain.";

    fn magical(n: usize) -> String {
        let mut text = String::from("The wizard raised his staff and the magic spell filled the tower. ");
        for i in 0..n {
            text.push_str(&format!("Sparks of arcane fire number {} danced over the dragon's hoard. ", i));
        }
        text
    }

    async fn engine(config: VersioningConfig) -> (Palimpsest, Arc<ManualClock>, Arc<InMemoryStore>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::new());
        let p = PalimpsestBuilder::new()
            .store(store.clone())
            .config(config)
            .clock(clock.clone())
            .id_generator(Arc::new(SequentialIdGenerator::new("id")))
            .context(ContextDefinition::new("fantasy", "Fantasy", ["wizard", "magic", "spell", "dragon"]))
            .build()
            .await
            .unwrap();
        (p, clock, store)
    }

    #[tokio::test]
    async fn test_first_change_is_initial_version() {
        let (p, _clock, store) = engine(VersioningConfig::default()).await;
        let outcome = p.handle_change("ch1", "ch1.md", CALM).await.unwrap();
        let ChangeOutcome::Versioned { node_id, detection, .. } = outcome else {
            panic!("expected a version, got {:?}", outcome);
        };
        assert!(detection.is_none());

        let node = store.get_node(&node_id).await.unwrap().unwrap();
        assert_eq!(node.label, "Initial version");
        assert_eq!(node.metadata.file_path, "ch1.md");
        assert_eq!(p.get_statistics().initial_versions, 1);
        assert_eq!(p.head_content("ch1").await.unwrap().as_deref(), Some(CALM));
    }

    #[tokio::test]
    async fn test_unchanged_and_small_edits() {
        let (p, clock, _store) = engine(VersioningConfig::default()).await;
        p.handle_change("ch1", "ch1.md", CALM).await.unwrap();
        assert_eq!(p.handle_change("ch1", "ch1.md", CALM).await.unwrap(), ChangeOutcome::Unchanged);

        clock.advance(chrono::Duration::seconds(5));
        let edited = CALM.replace("rain.", "rain!");
        let outcome = p.handle_change("ch1", "ch1.md", &edited).await.unwrap();
        assert!(matches!(outcome, ChangeOutcome::NoShift { .. }), "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_shift_creates_labelled_version() {
        let (p, clock, store) = engine(VersioningConfig::default()).await;
        p.handle_change("ch1", "ch1.md", CALM).await.unwrap();

        clock.advance(chrono::Duration::minutes(10));
        let outcome = p.handle_change("ch1", "ch1.md", &magical(5)).await.unwrap();
        let ChangeOutcome::Versioned { node_id, detection: Some(detection), .. } = outcome else {
            panic!("expected an automatic version, got {:?}", outcome);
        };
        assert!(detection.probability > 0.5);
        assert_eq!(detection.suggested_context.as_deref(), Some("fantasy"));

        let node = store.get_node(&node_id).await.unwrap().unwrap();
        assert_eq!(node.label, "Shift to Fantasy");
        assert_eq!(node.context_id.as_deref(), Some("fantasy"));
        assert_eq!(node.metadata.creator, Creator::Auto);
        assert_eq!(p.content_at(&node_id).await.unwrap().unwrap(), magical(5));
        assert_eq!(p.get_statistics().automatic_snapshots, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_one_per_hour() {
        let (p, clock, _store) = engine(VersioningConfig {
            max_snapshots_per_hour: 1,
            ..Default::default()
        })
        .await;
        p.handle_change("ch1", "ch1.md", CALM).await.unwrap();

        clock.advance(chrono::Duration::minutes(10));
        let first = p.handle_change("ch1", "ch1.md", &magical(5)).await.unwrap();
        assert!(first.created_version(), "{:?}", first);

        clock.advance(chrono::Duration::minutes(10));
        let second = p.handle_change("ch1", "ch1.md", CALM).await.unwrap();
        assert!(matches!(second, ChangeOutcome::RateLimited { .. }), "{:?}", second);

        let stats = p.get_statistics();
        assert_eq!(stats.automatic_snapshots, 1);
        assert_eq!(stats.rate_limited, 1);

        // Budget frees up once the hour has passed
        clock.advance(chrono::Duration::minutes(55));
        let third = p.handle_change("ch1", "ch1.md", &magical(6)).await.unwrap();
        assert!(!matches!(third, ChangeOutcome::RateLimited { .. }), "{:?}", third);
    }

    #[tokio::test]
    async fn test_manual_checkpoint_bypasses_limit() {
        let (p, _clock, store) = engine(VersioningConfig {
            max_snapshots_per_hour: 0,
            ..Default::default()
        })
        .await;
        p.handle_change("ch1", "ch1.md", CALM).await.unwrap();
        let outcome = p
            .create_manual_checkpoint("ch1", "short", Some("Before rewrite"))
            .await
            .unwrap();
        let ChangeOutcome::Versioned { node_id, .. } = outcome else {
            panic!("expected a version");
        };
        let node = store.get_node(&node_id).await.unwrap().unwrap();
        assert!(node.is_checkpoint);
        assert_eq!(node.metadata.creator, Creator::User);
        assert_eq!(p.get_statistics().manual_checkpoints, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_timeline_failure_is_partial_success() {
        let (p, clock, store) = engine(VersioningConfig::default()).await;
        p.handle_change("ch1", "ch1.md", CALM).await.unwrap();

        store.fail_on(StoreOp::AppendChild);
        clock.advance(chrono::Duration::minutes(10));
        let outcome = p.handle_change("ch1", "ch1.md", &magical(5)).await.unwrap();
        assert!(matches!(outcome, ChangeOutcome::PartialSuccess { .. }), "{:?}", outcome);
        assert_eq!(p.get_statistics().partial_failures, 1);
        assert!(logs_contain("timeline not updated"));
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn test_debounce() {
        let (p, clock, _store) = engine(VersioningConfig::default()).await;
        p.submit_change("ch1", "ch1.md", "first");
        p.submit_change("ch1", "ch1.md", "second");
        p.submit_change("ch2", "ch2.md", "other");
        assert_eq!(p.pending_changes(), 2);

        assert!(p.flush_ready().await.unwrap().is_empty());
        clock.advance(chrono::Duration::seconds(3));
        let flushed = p.flush_ready().await.unwrap();
        assert_eq!(
            flushed.iter().map(|(f, _)| f.as_str()).collect::<Vec<_>>(),
            vec!["ch1", "ch2"]
        );
        assert_eq!(p.head_content("ch1").await.unwrap().as_deref(), Some("second"));

        p.submit_change("ch3", "ch3.md", "now");
        assert_eq!(p.flush_all().await.unwrap().len(), 1);
        assert_eq!(p.pending_changes(), 0);
    }

    #[tokio::test]
    async fn test_events_rename_and_delete() {
        let (p, _clock, store) = engine(VersioningConfig::default()).await;
        p.handle_event(FileEvent::Created {
            file_id: "ch1".into(),
            path: "drafts/ch1.md".into(),
            content: CALM.into(),
        })
        .await
        .unwrap();
        p.handle_event(FileEvent::Renamed {
            file_id: "ch1".into(),
            old_path: "drafts/ch1.md".into(),
            new_path: "final/ch1.md".into(),
        })
        .await
        .unwrap();
        assert_eq!(store.get_file_history("ch1").await.unwrap().unwrap().file_path, "final/ch1.md");

        let outcome = p
            .handle_event(FileEvent::Deleted {
                file_id: "ch1".into(),
                path: "final/ch1.md".into(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ChangeOutcome::Recorded);
        assert!(store.get_file_history("ch1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_feedback_and_corrections() {
        let (p, _clock, store) = engine(VersioningConfig::default()).await;
        let ChangeOutcome::Versioned { node_id, .. } = p.handle_change("ch1", "ch1.md", CALM).await.unwrap() else {
            panic!("expected a version");
        };
        p.record_feedback(true);
        assert!(p.correct_node_context(&node_id, Some("fantasy".into())).await.unwrap());
        assert!(!p.correct_node_context("missing", None).await.unwrap());

        let stats = p.get_statistics();
        assert_eq!(stats.user_corrections, 1);
        assert_eq!(stats.feedback_events, 2);
        assert!((stats.success_rate() - 0.5).abs() < 1e-9);
        assert_eq!(
            store.get_node(&node_id).await.unwrap().unwrap().context_id.as_deref(),
            Some("fantasy")
        );
    }

    #[tokio::test]
    async fn test_config_mutators_validate() {
        let (p, _clock, _store) = engine(VersioningConfig::default()).await;
        p.set_shift_threshold(0.8).unwrap();
        p.set_max_snapshots_per_hour(3).unwrap();
        p.set_snapshot_interval(Duration::from_secs(30)).unwrap();
        p.set_debounce_window(Duration::from_millis(500)).unwrap();
        assert!(p.set_detection_sensitivity(1.5).is_err());

        let config = p.config();
        assert_eq!(config.shift_threshold, 0.8);
        assert_eq!(config.max_snapshots_per_hour, 3);
        assert_eq!(config.min_snapshot_interval_secs, 30);
        assert_eq!(config.debounce_window_ms, 500);
        assert_eq!(config.min_detection_confidence, 0.3);
    }

    #[tokio::test]
    async fn test_oversized_durations_rejected() {
        let (p, clock, _store) = engine(VersioningConfig::default()).await;
        let huge = Duration::from_secs(100_000_000_000_000_000);
        assert!(matches!(
            p.set_snapshot_interval(huge),
            Err(VersioningError::InvalidConfiguration(_))
        ));
        assert!(p.set_debounce_window(huge).is_err());
        assert!(p.set_debounce_window(Duration::MAX).is_err());
        assert_eq!(p.config(), VersioningConfig::default());

        let rejected = PalimpsestBuilder::new()
            .config(VersioningConfig {
                session_pause_secs: 100_000_000_000_000_000,
                ..Default::default()
            })
            .build()
            .await;
        assert!(matches!(rejected, Err(VersioningError::InvalidConfiguration(_))));

        // Still versioning normally after the rejected updates
        p.handle_change("doc", "doc.md", CALM).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));
        let outcome = p.handle_change("doc", "doc.md", &magical(5)).await.unwrap();
        assert!(outcome.created_version());
    }

    #[tokio::test]
    async fn test_config_persists_in_store() {
        let (p, _clock, store) = engine(VersioningConfig::default()).await;
        p.set_max_snapshots_per_hour(7).unwrap();
        p.persist_config().await.unwrap();

        let reopened = PalimpsestBuilder::new().store(store).build().await.unwrap();
        assert_eq!(reopened.config().max_snapshots_per_hour, 7);
        assert_eq!(reopened.list_contexts().len(), 1);
    }

    #[tokio::test]
    async fn test_branch_merge_and_purge() {
        let (p, clock, store) = engine(VersioningConfig::default()).await;
        let ChangeOutcome::Versioned { node_id: root, .. } = p.handle_change("ch1", "ch1.md", "a\nb").await.unwrap() else {
            panic!("expected a version");
        };
        clock.advance(chrono::Duration::seconds(1));
        p.create_manual_checkpoint("ch1", "a\nb\nmain", None).await.unwrap();

        let alt = p.create_branch("ch1", "alt", &root).await.unwrap();
        assert!(p.switch_branch("ch1", &alt.id).await.unwrap());
        clock.advance(chrono::Duration::seconds(1));
        p.create_manual_checkpoint("ch1", "a\nb", Some("alt")).await.unwrap();

        let main = p.timeline().find_branch("ch1", "main").await.unwrap().unwrap();
        let result = p
            .merge_branches(&alt.id, &main.id, &MergeOptions::new(MergeStrategy::SmartMerge))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(p.get_statistics().merges, 1);
        assert!(p.verify_file("ch1").await.unwrap().is_valid());

        assert!(p.purge_file("ch1").await.unwrap());
        assert_eq!(store.node_count(), 0);
        assert_eq!(store.snapshot_count(), 0);
        assert!(p.get_timeline_for_file("ch1").await.unwrap().is_none());
        assert!(!p.purge_file("ch1").await.unwrap());
    }

    #[tokio::test]
    async fn test_navigate_to_version() {
        let (p, clock, _store) = engine(VersioningConfig::default()).await;
        let ChangeOutcome::Versioned { node_id: first, .. } = p.handle_change("ch1", "ch1.md", CALM).await.unwrap() else {
            panic!("expected a version");
        };
        clock.advance(chrono::Duration::seconds(1));
        p.create_manual_checkpoint("ch1", "later text", None).await.unwrap();

        assert_eq!(p.navigate_to_version("ch1", &first).await.unwrap().as_deref(), Some(CALM));
        let timeline = p.get_timeline_for_file("ch1").await.unwrap().unwrap();
        assert_eq!(timeline.position.as_deref(), Some(first.as_str()));
        assert!(p.navigate_to_version("ch1", "missing").await.unwrap().is_none());
    }
}

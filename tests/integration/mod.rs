//! End-to-end writing sessions over the file-backed store
//!
//! Each test drives a [`SessionHarness`]: a `FileStore` in a temporary
//! directory, a manual clock and two writing contexts.

use ::palimpsest::clock::ManualClock;
use ::palimpsest::merge::MARKER_BEGIN;
use ::palimpsest::*;
use chrono::Duration;
use std::sync::Arc;
use tempfile::TempDir;

pub const CALM: &str = "The village was quiet that morning. Mist rolled over the fields and the baker \
opened his shop while the church bell rang seven times.";

pub const FANTASY: &str = "The wizard raised his staff and a spell of blue fire split the sky. Above the \
tower a dragon circled, and the old magic of the kingdom woke from its long sleep. Every torch in the \
citadel flared at once, and far below the dragon answered with a roar that shook the mountains.";

pub const MYSTERY: &str = "Detective Hale studied the ledger under the lamp. The clue was in the margins: \
a date that broke the suspect's alibi. Somebody had lied about the night of the storm, and the detective \
meant to find out who before the morning train left the station.";

/// Engine over a temporary file store with a hand-driven clock
pub struct SessionHarness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub engine: Palimpsest,
}

impl SessionHarness {
    /// Harness with default settings
    pub async fn new() -> Self {
        Self::with_config(None).await
    }

    /// Harness with explicit settings
    pub async fn with_config(config: Option<VersioningConfig>) -> Self {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let engine = Self::build(&dir, clock.clone(), config, true).await;
        Self { dir, clock, engine }
    }

    async fn build(
        dir: &TempDir,
        clock: Arc<ManualClock>,
        config: Option<VersioningConfig>,
        with_contexts: bool,
    ) -> Palimpsest {
        let store = FileStore::open(dir.path().join("store"), Logger::disabled()).unwrap();
        let mut builder = PalimpsestBuilder::new()
            .store(Arc::new(store))
            .clock(clock)
            .logger(Logger::disabled());
        if let Some(config) = config {
            builder = builder.config(config);
        }
        if with_contexts {
            builder = builder
                .context(ContextDefinition::new(
                    "fantasy",
                    "Fantasy",
                    ["wizard", "dragon", "spell", "magic"],
                ))
                .context(ContextDefinition::new(
                    "mystery",
                    "Mystery",
                    ["detective", "clue", "alibi", "suspect"],
                ));
        }
        builder.build().await.unwrap()
    }

    /// Rebuild the engine from what is on disk
    pub async fn reopen(&mut self) {
        self.engine = Self::build(&self.dir, self.clock.clone(), None, false).await;
    }

    /// Advance the clock, then report new content for `file_id`
    pub async fn write(&self, file_id: &str, content: &str, after: Duration) -> ChangeOutcome {
        self.clock.advance(after);
        self.engine.handle_change(file_id, file_id, content).await.unwrap()
    }

    /// Node id of a version-creating outcome
    pub fn node_of(outcome: &ChangeOutcome) -> String {
        match outcome {
            ChangeOutcome::Versioned { node_id, .. } => node_id.clone(),
            other => panic!("expected a new version, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_writing_session_end_to_end() {
    let mut h = SessionHarness::new().await;
    let file = "chapter1.md";

    let initial = h.write(file, CALM, Duration::zero()).await;
    let initial = SessionHarness::node_of(&initial);

    let tweak = h.write(file, &CALM.replace("seven", "eight"), Duration::seconds(20)).await;
    assert!(matches!(tweak, ChangeOutcome::NoShift { .. }), "{:?}", tweak);

    let fantasy = h.write(file, FANTASY, Duration::minutes(10)).await;
    match &fantasy {
        ChangeOutcome::Versioned {
            detection: Some(d), ..
        } => assert_eq!(d.suggested_context.as_deref(), Some("fantasy")),
        other => panic!("expected a detected shift, got {:?}", other),
    }
    let fantasy = SessionHarness::node_of(&fantasy);

    let mystery = h.write(file, MYSTERY, Duration::minutes(10)).await;
    match &mystery {
        ChangeOutcome::Versioned {
            detection: Some(d), ..
        } => assert_eq!(d.suggested_context.as_deref(), Some("mystery")),
        other => panic!("expected a detected shift, got {:?}", other),
    }

    let ending = format!("{}\nThe train whistle blew.", MYSTERY);
    let checkpoint = h
        .engine
        .create_manual_checkpoint(file, &ending, Some("Before the ending"))
        .await
        .unwrap();
    let checkpoint = SessionHarness::node_of(&checkpoint);

    let timeline = h.engine.get_timeline_for_file(file).await.unwrap().unwrap();
    assert_eq!(timeline.nodes.len(), 4);
    assert_eq!(timeline.head.as_deref(), Some(checkpoint.as_str()));
    assert_eq!(timeline.node(&fantasy).unwrap().context_id.as_deref(), Some("fantasy"));
    assert_eq!(timeline.stats().max_depth, 4);
    assert!(timeline.is_ancestor(&initial, &checkpoint));

    // Look back without rewriting history
    assert_eq!(h.engine.navigate_to_version(file, &fantasy).await.unwrap().as_deref(), Some(FANTASY));
    assert_eq!(h.engine.navigation().current_position(file).as_deref(), Some(fantasy.as_str()));

    // Alternate line from the fantasy version
    let what_if = h.engine.create_branch(file, "what-if", &fantasy).await.unwrap();
    assert!(h.engine.switch_branch(file, &what_if.id).await.unwrap());
    let alternate = format!("{}\nThe dragon won.", FANTASY);
    let alt_node = h.engine.create_manual_checkpoint(file, &alternate, None).await.unwrap();
    let alt_node = SessionHarness::node_of(&alt_node);

    let path = h.engine.find_path(&alt_node, &checkpoint).await.unwrap().unwrap();
    assert_eq!(path.nodes.first(), Some(&alt_node));
    assert_eq!(path.nodes.last(), Some(&checkpoint));
    assert_eq!(path.kind, PathKind::Branched);

    let main = h.engine.timeline().find_branch(file, "main").await.unwrap().unwrap();
    let result = h
        .engine
        .merge_branches(&what_if.id, &main.id, &MergeOptions::new(MergeStrategy::ConflictMarkers))
        .await
        .unwrap();
    assert!(result.success);
    assert!(!result.conflicts.is_empty());
    let merged_content = result.merged_content.clone().unwrap();
    assert!(merged_content.contains(MARKER_BEGIN));
    let merged = result.merged_node.unwrap();
    assert_eq!(merged.parent_ids, vec![alt_node.clone(), checkpoint.clone()]);

    let report = h.engine.verify_file(file).await.unwrap();
    assert!(report.is_valid(), "{:?}", report.errors());

    // Everything survives a restart
    h.reopen().await;
    let timeline = h.engine.get_timeline_for_file(file).await.unwrap().unwrap();
    assert_eq!(timeline.nodes.len(), 6);
    assert_eq!(timeline.stats().merge_nodes, 1);
    assert_eq!(timeline.head.as_deref(), Some(merged.id.as_str()));
    assert_eq!(h.engine.content_at(&merged.id).await.unwrap(), Some(merged_content));
    assert_eq!(h.engine.content_at(&initial).await.unwrap().as_deref(), Some(CALM));
    assert_eq!(h.engine.list_contexts().len(), 2);
}

#[tokio::test]
async fn test_rate_limit_allows_one_snapshot_per_hour() {
    let h = SessionHarness::with_config(Some(VersioningConfig {
        max_snapshots_per_hour: 1,
        ..Default::default()
    }))
    .await;
    let file = "notes.md";
    h.write(file, CALM, Duration::zero()).await;

    let first = h.write(file, FANTASY, Duration::minutes(10)).await;
    let second = h.write(file, MYSTERY, Duration::minutes(10)).await;
    assert!(first.created_version(), "{:?}", first);
    assert!(matches!(second, ChangeOutcome::RateLimited { .. }), "{:?}", second);

    let history = h.engine.store().get_file_history(file).await.unwrap().unwrap();
    // Initial version plus one automatic snapshot
    assert_eq!(history.snapshots.len(), 2);

    let stats = h.engine.get_statistics();
    assert_eq!(stats.initial_versions, 1);
    assert_eq!(stats.automatic_snapshots, 1);
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(stats.total_snapshots, 2);
}

#[tokio::test]
async fn test_minimum_interval_between_snapshots() {
    let h = SessionHarness::with_config(Some(VersioningConfig {
        min_snapshot_interval_secs: 30 * 60,
        ..Default::default()
    }))
    .await;
    let file = "interval.md";
    h.write(file, CALM, Duration::zero()).await;
    assert!(h.write(file, FANTASY, Duration::minutes(10)).await.created_version());
    let early = h.write(file, MYSTERY, Duration::minutes(10)).await;
    assert!(matches!(early, ChangeOutcome::RateLimited { .. }), "{:?}", early);
    let later = h.write(file, CALM, Duration::minutes(25)).await;
    assert!(later.created_version(), "{:?}", later);
}

#[tokio::test]
async fn test_debounced_edits_collapse() {
    let h = SessionHarness::new().await;
    for i in 0..5 {
        h.clock.advance(Duration::milliseconds(200));
        h.engine
            .submit_change("draft.md", "draft.md", &format!("{} Draft {}", CALM, i));
    }
    assert_eq!(h.engine.pending_changes(), 1);
    assert!(h.engine.flush_ready().await.unwrap().is_empty());

    h.clock.advance(Duration::seconds(5));
    let flushed = h.engine.flush_ready().await.unwrap();
    assert_eq!(flushed.len(), 1);
    assert!(flushed[0].1.created_version());
    assert_eq!(
        h.engine.head_content("draft.md").await.unwrap(),
        Some(format!("{} Draft 4", CALM))
    );
}

#[tokio::test]
async fn test_host_events() {
    let h = SessionHarness::new().await;
    let created = h
        .engine
        .handle_event(FileEvent::Created {
            file_id: "f1".into(),
            path: "drafts/one.md".into(),
            content: CALM.into(),
        })
        .await
        .unwrap();
    assert!(created.created_version());

    h.engine
        .handle_event(FileEvent::Renamed {
            file_id: "f1".into(),
            old_path: "drafts/one.md".into(),
            new_path: "book/one.md".into(),
        })
        .await
        .unwrap();
    let timeline = h.engine.get_timeline_for_file("f1").await.unwrap().unwrap();
    assert_eq!(timeline.file_path, "book/one.md");

    h.engine
        .handle_event(FileEvent::Deleted {
            file_id: "f1".into(),
            path: "book/one.md".into(),
        })
        .await
        .unwrap();
    // Deleted files keep their history and can be versioned again
    assert_eq!(h.engine.head_content("f1").await.unwrap().as_deref(), Some(CALM));
    let again = h
        .engine
        .create_manual_checkpoint("f1", "restored from trash", None)
        .await
        .unwrap();
    assert!(again.created_version());
}

#[tokio::test]
async fn test_settings_survive_restart() {
    let mut h = SessionHarness::new().await;
    h.engine.set_shift_threshold(0.75).unwrap();
    h.engine.set_max_snapshots_per_hour(3).unwrap();
    h.engine.persist_config().await.unwrap();
    h.engine
        .add_context(ContextDefinition::new("scifi", "Science fiction", ["rocket", "orbit"]))
        .await
        .unwrap();
    assert!(h.engine.remove_context("mystery").await.unwrap());

    h.reopen().await;
    let config = h.engine.config();
    assert_eq!(config.shift_threshold, 0.75);
    assert_eq!(config.max_snapshots_per_hour, 3);
    let ids: Vec<String> = h.engine.list_contexts().into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec!["fantasy".to_string(), "scifi".to_string()]);
}

#[tokio::test]
async fn test_purge_removes_everything_for_file() {
    let h = SessionHarness::new().await;
    h.write("keep.md", CALM, Duration::zero()).await;
    h.write("drop.md", CALM, Duration::zero()).await;
    h.engine
        .create_manual_checkpoint("drop.md", FANTASY, None)
        .await
        .unwrap();

    assert!(h.engine.purge_file("drop.md").await.unwrap());
    let histories = h.engine.store().list_file_histories().await.unwrap();
    assert_eq!(histories.len(), 1);
    assert_eq!(histories[0].file_id, "keep.md");
    assert!(h.engine.store().list_nodes_for_file("drop.md").await.unwrap().is_empty());
    assert!(h.engine.verify_file("keep.md").await.unwrap().is_valid());
}

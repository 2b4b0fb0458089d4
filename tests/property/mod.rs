//! Property-based testing for Palimpsest
//!
//! Uses proptest to check storage and timeline invariants across randomly
//! generated documents and histories.

use ::palimpsest::clock::SystemClock;
use ::palimpsest::diff::DiffEngine;
use ::palimpsest::ids::SequentialIdGenerator;
use ::palimpsest::version::VersionManager;
use ::palimpsest::*;
use proptest::prelude::*;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Prose-like text: words, punctuation, newlines and the odd non-ASCII char
fn text_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            4 => "[a-z]{1,8}",
            1 => "[A-Z][a-z]{0,6}",
            1 => Just(", ".to_string()),
            1 => Just(".\n".to_string()),
            1 => Just("é".to_string()),
            1 => Just("🐉".to_string()),
        ],
        0..60,
    )
    .prop_map(|tokens| tokens.join(" "))
}

/// Operations on one file's timeline
#[derive(Debug, Clone)]
enum TimelineOp {
    Checkpoint(String),
    Branch(usize),
    Switch(usize),
    Merge(usize, usize, MergeStrategy),
}

fn strategy_strategy() -> impl Strategy<Value = MergeStrategy> {
    prop_oneof![
        Just(MergeStrategy::LatestWins),
        Just(MergeStrategy::SmartMerge),
        Just(MergeStrategy::ConflictMarkers),
        Just(MergeStrategy::Manual),
    ]
}

fn timeline_op_strategy() -> impl Strategy<Value = TimelineOp> {
    prop_oneof![
        4 => text_strategy().prop_map(TimelineOp::Checkpoint),
        1 => any::<usize>().prop_map(TimelineOp::Branch),
        1 => any::<usize>().prop_map(TimelineOp::Switch),
        1 => (any::<usize>(), any::<usize>(), strategy_strategy())
            .prop_map(|(a, b, s)| TimelineOp::Merge(a, b, s)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A patch rebuilds the new text from the old one exactly
    #[test]
    fn patch_rebuilds_new_text(old in text_strategy(), new in text_strategy()) {
        let engine = DiffEngine::default();
        let patch = engine.create_patch(&old, &new);
        prop_assert_eq!(engine.apply_patch(&patch, &old).unwrap(), new.clone());
        prop_assert_eq!(patch.is_identity(), old == new);
    }

    /// Compression never changes the payload
    #[test]
    fn compression_is_lossless(
        content in prop::collection::vec(any::<u8>(), 0..20_000),
        fast in any::<bool>()
    ) {
        let strategy = if fast { CompressionStrategy::Fast } else { CompressionStrategy::Adaptive { min_size: 512 } };
        let mut engine = CompressionEngine::new(strategy, Logger::disabled());
        let payload = engine.compress(&content).unwrap();
        prop_assert_eq!(engine.decompress(&payload).unwrap(), content);
    }

    /// Fused probabilities stay within [0, 1]
    #[test]
    fn detection_probability_is_bounded(old in text_strategy(), new in text_strategy()) {
        let mut detector = ContextDetectionEngine::new(
            &VersioningConfig::default(),
            Arc::new(SystemClock),
            Logger::disabled(),
        );
        detector.initialize(vec![ContextDefinition::new("f", "F", ["dragon", "magic"])]);
        if let Some(detection) = detector.analyze(&new, Some(&old), FileOperation::Modify) {
            prop_assert!((0.0..=1.0).contains(&detection.probability));
            prop_assert!(detection.probability >= detector.min_confidence());
            prop_assert!(!detection.signals.is_empty());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Diff chains of any allowed length restore every version exactly
    #[test]
    fn diff_chains_restore_exactly(
        contents in prop::collection::vec(text_strategy(), 2..12),
        chain in 1usize..4
    ) {
        runtime().block_on(async {
            let store = Arc::new(InMemoryStore::new());
            let manager = VersionManager::new(
                store.clone(),
                &VersioningConfig { max_diff_chain_length: chain, ..Default::default() },
                Arc::new(SequentialIdGenerator::new("snap")),
                Arc::new(SystemClock),
                Logger::disabled(),
            );

            let mut written = Vec::new();
            for (i, content) in contents.iter().enumerate() {
                let node_id = format!("n{}", i);
                let snapshot = manager
                    .create_version_snapshot("doc", &node_id, content, false)
                    .await
                    .unwrap();
                // Advance the head the way the timeline does
                let mut history = store.get_file_history("doc").await.unwrap().unwrap();
                history.current_version = Some(node_id);
                store.save_file_history(&history).await.unwrap();
                written.push((snapshot, content.clone()));
            }

            // Full snapshots recur every `chain + 1` versions, diffs fill the gaps
            let full = written.iter().filter(|(s, _)| s.is_full()).count();
            prop_assert_eq!(full, (written.len() + chain) / (chain + 1));
            prop_assert!(written.iter().any(|(s, _)| s.diff_from_parent.is_some()));

            // Fresh cache so every restore replays its chain
            manager.clear_cache();
            for (snapshot, content) in written.iter().rev() {
                prop_assert!(manager.chain_depth(snapshot).await.unwrap() <= chain);
                prop_assert_eq!(&manager.restore_version(&snapshot.id).await.unwrap(), content);
            }
            Ok(())
        })?;
    }

    /// Random branching and merging keeps the graph a consistent DAG
    #[test]
    fn timeline_stays_consistent(ops in prop::collection::vec(timeline_op_strategy(), 1..40)) {
        runtime().block_on(async {
            let engine = PalimpsestBuilder::new()
                .logger(Logger::disabled())
                .build()
                .await
                .unwrap();
            engine.create_manual_checkpoint("doc", "root", None).await.unwrap();

            let mut branch_count = 0;
            for op in ops {
                let timeline = engine.get_timeline_for_file("doc").await.unwrap().unwrap();
                let node_ids: Vec<String> = timeline.nodes.keys().cloned().collect();
                let branches = timeline.branches.clone();
                match op {
                    TimelineOp::Checkpoint(content) => {
                        let outcome = engine.create_manual_checkpoint("doc", &content, None).await.unwrap();
                        prop_assert!(outcome.created_version());
                    }
                    TimelineOp::Branch(i) => {
                        let from = &node_ids[i % node_ids.len()];
                        branch_count += 1;
                        engine
                            .create_branch("doc", &format!("b{}", branch_count), from)
                            .await
                            .unwrap();
                    }
                    TimelineOp::Switch(i) => {
                        let branch = &branches[i % branches.len()];
                        let switched = engine.switch_branch("doc", &branch.id).await.unwrap();
                        prop_assert_eq!(switched, !branch.node_ids.is_empty());
                    }
                    TimelineOp::Merge(a, b, strategy) => {
                        let source = &branches[a % branches.len()];
                        let target = &branches[b % branches.len()];
                        let result = engine
                            .merge_branches(&source.id, &target.id, &MergeOptions::new(strategy))
                            .await
                            .unwrap();
                        prop_assert_eq!(result.success, result.merged_node.is_some());
                    }
                }
            }

            let report = engine.verify_file("doc").await.unwrap();
            prop_assert!(report.is_valid(), "{:?}", report.errors());

            let timeline = engine.get_timeline_for_file("doc").await.unwrap().unwrap();
            for node in timeline.nodes.values() {
                for child in &node.child_ids {
                    prop_assert!(timeline.nodes[child].parent_ids.contains(&node.id));
                }
                for parent in &node.parent_ids {
                    prop_assert!(timeline.nodes[parent].child_ids.contains(&node.id));
                    prop_assert!(!timeline.is_ancestor(&node.id, parent));
                }
            }
            prop_assert_eq!(timeline.roots().len(), 1);
            Ok(())
        })?;
    }
}

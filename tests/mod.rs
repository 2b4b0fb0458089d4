//! Main test module for Palimpsest
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end writing sessions
//! - Property-based tests for storage and timeline invariants
//! - Edge cases and concurrent use

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::palimpsest::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_empty_content() {
        let engine = Palimpsest::in_memory().await.unwrap();
        let outcome = engine.handle_change("empty", "empty.md", "").await.unwrap();
        assert!(outcome.created_version());
        assert_eq!(engine.head_content("empty").await.unwrap().as_deref(), Some(""));

        // Going from empty to text and back must restore exactly
        engine
            .create_manual_checkpoint("empty", "now there is text", None)
            .await
            .unwrap();
        engine.create_manual_checkpoint("empty", "", None).await.unwrap();
        assert_eq!(engine.head_content("empty").await.unwrap().as_deref(), Some(""));
        assert!(engine.verify_file("empty").await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_unicode_content() {
        let engine = Palimpsest::in_memory().await.unwrap();
        let versions = [
            "Der Drache schlief. 🐉",
            "Der Drache erwachte. 🐉🔥",
            "竜が目を覚ました。\nそして飛んだ。",
            "Дракон улетел на север.",
        ];
        let mut nodes = Vec::new();
        for text in versions {
            match engine.create_manual_checkpoint("uni", text, None).await.unwrap() {
                ChangeOutcome::Versioned { node_id, .. } => nodes.push(node_id),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        for (node, text) in nodes.iter().zip(versions) {
            assert_eq!(engine.content_at(node).await.unwrap().as_deref(), Some(text));
        }
    }

    #[tokio::test]
    async fn test_crlf_and_trailing_whitespace_preserved() {
        let engine = Palimpsest::in_memory().await.unwrap();
        let a = "line one\r\nline two\r\n";
        let b = "line one\r\nline 2\r\n   \n\n";
        engine.create_manual_checkpoint("crlf", a, None).await.unwrap();
        let ChangeOutcome::Versioned { node_id, .. } = engine.create_manual_checkpoint("crlf", b, None).await.unwrap()
        else {
            panic!("expected a version");
        };
        assert_eq!(engine.content_at(&node_id).await.unwrap().as_deref(), Some(b));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_errors() {
        let engine = Palimpsest::in_memory().await.unwrap();
        assert!(engine.get_timeline_for_file("nope").await.unwrap().is_none());
        assert!(engine.content_at("nope").await.unwrap().is_none());
        assert!(engine.find_path("a", "b").await.unwrap().is_none());
        assert!(!engine.switch_branch("nope", "nope").await.unwrap());
        assert!(engine.navigate_to_version("nope", "nope").await.unwrap().is_none());
        assert!(engine.verify_file("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_configuration_rejected() {
        let result = PalimpsestBuilder::new()
            .config(VersioningConfig {
                shift_threshold: 1.5,
                ..Default::default()
            })
            .build()
            .await;
        assert!(matches!(result, Err(VersioningError::InvalidConfiguration(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_files() {
        let engine = Arc::new(Palimpsest::in_memory().await.unwrap());

        let handles: Vec<_> = (0..8)
            .map(|task| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let file_id = format!("file-{}", task % 4);
                    for step in 0..10 {
                        let content = format!("Task {} wrote step {}.\nShared line.", task, step);
                        engine.create_manual_checkpoint(&file_id, &content, None).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        for file in 0..4 {
            let file_id = format!("file-{}", file);
            let timeline = engine.get_timeline_for_file(&file_id).await.unwrap().unwrap();
            assert_eq!(timeline.nodes.len(), 20);
            // Serialised per file: one straight line of nodes
            assert_eq!(timeline.stats().max_depth, 20);
            let report = engine.verify_file(&file_id).await.unwrap();
            assert!(report.is_valid(), "{:?}", report.errors());
        }
        assert_eq!(engine.get_statistics().manual_checkpoints, 80);
    }
}

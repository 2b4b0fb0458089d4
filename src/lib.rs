//! # Palimpsest - context-aware document versioning
//!
//! A versioning engine for prose that decides *when* to take a snapshot by
//! watching for context shifts in the writing, and keeps the resulting
//! versions in a branching, mergeable timeline.
//!
//! ## Overview
//!
//! Palimpsest watches a stream of edits to text files and:
//! - Detects when the author moves to a different writing context, by fusing
//!   signals from semantic, keyword, timing and edit-size analyzers
//! - Stores a snapshot when a shift is likely, as a full copy or as a
//!   compressed diff against the previous version
//! - Links every snapshot to a node in a per-file timeline DAG with named
//!   branches
//! - Navigates that DAG, finds paths between versions and merges branches
//!   with one of four strategies
//!
//! ## Architecture
//!
//! - **Signal analyzers**: independent scorers, fused by a weighted mean in
//!   the [`detection::ContextDetectionEngine`]
//! - **Snapshot storage**: the [`version::VersionManager`] alternates full
//!   snapshots with diffs so a restore applies at most a bounded number of
//!   patches; payloads are LZ4-compressed when that pays off
//! - **Timeline**: nodes with bidirectional parent/child edges, maintained
//!   with compensating rollback when a step of node creation fails
//! - **Persistence**: everything goes through the async
//!   [`store::VersionStore`] trait, with in-memory and file-backed
//!   implementations and a schema migration runner
//!
//! ## Quick Start
//!
//! ```rust
//! use palimpsest::{ChangeOutcome, ContextDefinition, PalimpsestBuilder};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> palimpsest::Result<()> {
//! let engine = PalimpsestBuilder::new()
//!     .context(ContextDefinition::new("mystery", "Mystery", ["detective", "clue", "alibi"]))
//!     .build()
//!     .await?;
//!
//! // The first change to a file is always stored
//! let outcome = engine.handle_change("ch1", "chapter1.md", "Rain hammered the office window.").await?;
//! assert!(outcome.created_version());
//!
//! // Small edits are analysed but usually not versioned
//! let outcome = engine.handle_change("ch1", "chapter1.md", "Rain hammered the office windows.").await?;
//! assert!(matches!(outcome, ChangeOutcome::NoShift { .. }));
//! # Ok(())
//! # }
//! ```
//!
//! ## Branching and Merging
//!
//! ```rust
//! use palimpsest::{ChangeOutcome, MergeOptions, MergeStrategy, Palimpsest};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> palimpsest::Result<()> {
//! let engine = Palimpsest::in_memory().await?;
//! let ChangeOutcome::Versioned { node_id: root, .. } =
//!     engine.handle_change("ch1", "ch1.md", "one\ntwo").await?
//! else {
//!     unreachable!()
//! };
//!
//! let alt = engine.create_branch("ch1", "alternate-ending", &root).await?;
//! engine.switch_branch("ch1", &alt.id).await?;
//! engine.create_manual_checkpoint("ch1", "one\ntwo\nthree", Some("New ending")).await?;
//!
//! let main = engine.timeline().find_branch("ch1", "main").await?.unwrap();
//! let result = engine
//!     .merge_branches(&alt.id, &main.id, &MergeOptions::new(MergeStrategy::SmartMerge))
//!     .await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```
//!
//! ### Verification
//!
//! ```rust,no_run
//! # async fn run(engine: palimpsest::Palimpsest) -> palimpsest::Result<()> {
//! let report = engine.verify_file("ch1").await?;
//! if !report.is_valid() {
//!     for problem in report.errors() {
//!         eprintln!("{}", problem);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Context shifts
//!
//! A context is a named set of keywords ("Fantasy": wizard, dragon, ...).
//! Each edit produces signals with a confidence and a weight; the fused
//! probability must clear both the detection gate and the shift threshold
//! before a version is stored. At most a configurable number of automatic
//! snapshots are taken per file per hour. Manual checkpoints always go
//! through.
//!
//! ### Snapshots
//!
//! A snapshot holds either the full content or a compressed diff from its
//! parent snapshot, never both. Every snapshot carries the SHA-256 of the
//! content it reconstructs, checked on every restore.
//!
//! ### Timeline
//!
//! Each file has its own DAG of nodes. A node has one parent, none (the
//! first version) or several (a merge). Branches are named node sequences
//! over the same graph; exactly one is active and receives new nodes.
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`](error::Result) with a
//! [`VersioningError`]. Lookups of things that simply do not exist return
//! `Ok(None)` or `false`. A rate-limited shift and merge conflicts are
//! outcomes, not errors.
//!
//! ## Module Organization
//!
//! - [`orchestrator`]: the [`Palimpsest`] front end and its builder
//! - [`analyzers`] and [`detection`]: context-shift detection
//! - [`diff`], [`compression`] and [`version`]: snapshot storage
//! - [`timeline`], [`navigation`] and [`merge`]: the version graph
//! - [`store`]: persistence trait, backends and migrations
//! - [`verification`]: integrity reports
//! - [`types`] and [`error`]: shared data model

pub mod analyzers;
pub mod clock;
pub mod collections;
pub mod compression;
pub mod detection;
pub mod diff;
pub mod error;
pub mod ids;
pub mod logging;
pub mod merge;
pub mod navigation;
pub mod orchestrator;
pub mod store;
pub mod timeline;
pub mod types;
pub mod utils;
pub mod verification;
pub mod version;

// Re-export main types for convenience
pub use compression::{CompressionEngine, CompressionStrategy};
pub use detection::ContextDetectionEngine;
pub use error::{Result, VersioningError};
pub use logging::Logger;
pub use orchestrator::{Palimpsest, PalimpsestBuilder};
pub use store::{FileStore, InMemoryStore, VersionStore};
pub use timeline::{Timeline, TimelineStats};
pub use types::*;
pub use verification::FileVerificationReport;

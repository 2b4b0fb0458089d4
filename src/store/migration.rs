//! Versioned schema migrations
//!
//! A [`Migration`] is one numbered step. [`MigrationRunner`] applies the
//! steps whose version is above the one recorded under
//! [`SCHEMA_VERSION_KEY`], in ascending order, recording the new version
//! after each step so an interrupted run resumes where it stopped.
//!
//! Built-in steps:
//! 1. record schema creation time
//! 2. give every history that has nodes but no branches a main branch

use super::{VersionStore, SCHEMA_VERSION_KEY};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, VersioningError};
use crate::logging::Logger;
use crate::types::TimelineBranch;
use async_trait::async_trait;
use std::sync::Arc;

/// Capabilities handed to each step
#[derive(Clone)]
pub struct MigrationContext {
    /// Time source for recorded timestamps
    pub clock: Arc<dyn Clock>,
    /// Logger scoped to the migration runner
    pub logger: Logger,
}

/// One schema step
#[async_trait]
pub trait Migration: Send + Sync {
    /// Version this step migrates to; must be unique and positive
    fn version(&self) -> u32;

    /// Short description for logs
    fn description(&self) -> &str;

    /// Apply the step
    async fn apply(&self, store: &dyn VersionStore, ctx: &MigrationContext) -> Result<()>;
}

/// Records when the schema was first created
#[derive(Debug, Default)]
pub struct CreateSchema;

#[async_trait]
impl Migration for CreateSchema {
    fn version(&self) -> u32 {
        1
    }

    fn description(&self) -> &str {
        "create schema"
    }

    async fn apply(&self, store: &dyn VersionStore, ctx: &MigrationContext) -> Result<()> {
        if store.get("schema_created_at").await?.is_none() {
            store.set("schema_created_at", &ctx.clock.now().to_rfc3339()).await?;
        }
        Ok(())
    }
}

/// Adds a main branch to histories recorded before branches existed
#[derive(Debug)]
pub struct BackfillMainBranch {
    branch_name: String,
}

impl BackfillMainBranch {
    /// Backfill using the given main branch name
    pub fn new(branch_name: impl Into<String>) -> Self {
        Self {
            branch_name: branch_name.into(),
        }
    }
}

#[async_trait]
impl Migration for BackfillMainBranch {
    fn version(&self) -> u32 {
        2
    }

    fn description(&self) -> &str {
        "backfill main branches"
    }

    async fn apply(&self, store: &dyn VersionStore, ctx: &MigrationContext) -> Result<()> {
        for mut history in store.list_file_histories().await? {
            if !history.branches.is_empty() {
                continue;
            }
            let nodes = store.list_nodes_for_file(&history.file_id).await?;
            let Some(root) = nodes.iter().find(|n| n.is_root()) else {
                continue;
            };

            // Follow first children from the root, which is the original line
            let mut node_ids = vec![root.id.clone()];
            let mut current = root.clone();
            while let Some(child_id) = current.child_ids.first().cloned() {
                if node_ids.contains(&child_id) {
                    break;
                }
                match nodes.iter().find(|n| n.id == child_id) {
                    Some(child) => {
                        node_ids.push(child_id);
                        current = child.clone();
                    }
                    None => break,
                }
            }

            let now = ctx.clock.now();
            let branch = TimelineBranch {
                id: format!("{}:{}", history.file_id, self.branch_name),
                file_id: history.file_id.clone(),
                name: self.branch_name.clone(),
                parent_node_id: root.id.clone(),
                node_ids,
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            store.save_branch(&branch).await?;
            history.branches.push(branch.id.clone());
            store.save_file_history(&history).await?;
            ctx.logger
                .debug(format!("Backfilled branch {} for {}", branch.name, history.file_id));
        }
        Ok(())
    }
}

/// Applies migrations exactly once, in order
pub struct MigrationRunner {
    migrations: Vec<Box<dyn Migration>>,
    context: MigrationContext,
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("versions", &self.migrations.iter().map(|m| m.version()).collect::<Vec<_>>())
            .finish()
    }
}

impl MigrationRunner {
    /// Runner with no steps
    pub fn new(clock: Arc<dyn Clock>, logger: Logger) -> Self {
        Self {
            migrations: Vec::new(),
            context: MigrationContext { clock, logger },
        }
    }

    /// Runner with the built-in steps
    pub fn with_builtin(main_branch_name: &str, clock: Arc<dyn Clock>, logger: Logger) -> Self {
        Self::new(clock, logger)
            .add(Box::new(CreateSchema))
            .add(Box::new(BackfillMainBranch::new(main_branch_name)))
    }

    /// Add a step
    pub fn add(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Highest version known to this runner
    pub fn latest_version(&self) -> u32 {
        self.migrations.iter().map(|m| m.version()).max().unwrap_or(0)
    }

    /// Version recorded in the store, zero for a fresh store
    pub async fn current_version(store: &dyn VersionStore) -> Result<u32> {
        match store.get(SCHEMA_VERSION_KEY).await? {
            Some(value) => value.trim().parse().map_err(|_| {
                VersioningError::integrity(format!("invalid schema version '{}'", value))
            }),
            None => Ok(0),
        }
    }

    /// Apply every pending step, returning the versions applied
    pub async fn run(&self, store: &Arc<dyn VersionStore>) -> Result<Vec<u32>> {
        let store: &dyn VersionStore = store.as_ref();
        let mut steps: Vec<&dyn Migration> = self.migrations.iter().map(|m| m.as_ref()).collect();
        steps.sort_by_key(|m| m.version());
        if let Some(pair) = steps.windows(2).find(|w| w[0].version() == w[1].version()) {
            return Err(VersioningError::InvalidConfiguration(format!(
                "duplicate migration version {}",
                pair[0].version()
            )));
        }

        let mut current = Self::current_version(store).await?;
        let mut applied = Vec::new();
        for step in steps {
            if step.version() <= current {
                continue;
            }
            self.context
                .logger
                .info(format!("Applying migration {}: {}", step.version(), step.description()));
            step.apply(store, &self.context).await?;
            store.set(SCHEMA_VERSION_KEY, &step.version().to_string()).await?;
            current = step.version();
            applied.push(current);
        }
        Ok(applied)
    }
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Logger::new("migration"))
    }
}

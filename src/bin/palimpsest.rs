//! # Palimpsest CLI - context-aware versioning for text files
//!
//! A command-line host for the Palimpsest library over a file-backed store.
//!
//! ## Features
//! - Feed file changes to context-shift detection and keep the versions it picks
//! - Take manual checkpoints
//! - Inspect, branch and merge the per-file timeline
//! - Verify stored history
//!
//! ## Usage
//! ```bash
//! # Register a writing context
//! palimpsest context add fantasy "Fantasy" -k wizard -k dragon -k spell
//!
//! # Record the current state of a file (versioned only on a context shift)
//! palimpsest track chapter1.md
//!
//! # Force a version
//! palimpsest checkpoint chapter1.md -m "Before the rewrite"
//!
//! # Show the timeline
//! palimpsest log chapter1.md
//! ```

use anyhow::{anyhow, bail, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use palimpsest::utils::{format_bytes, short_id};
use palimpsest::{
    ChangeOutcome, ContextDefinition, FileEvent, MergeOptions, MergeStrategy, PathKind, Palimpsest,
    Timeline,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Palimpsest CLI - versions that follow your writing
#[derive(Parser)]
#[command(name = "palimpsest")]
#[command(version)]
#[command(about = "Context-aware versioning for text files")]
#[command(long_about = None)]
struct Cli {
    /// Store directory (defaults to .palimpsest)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the current content of a file
    Track {
        /// File to read
        file: PathBuf,
    },

    /// Store a version regardless of detection
    #[command(alias = "cp")]
    Checkpoint {
        /// File to read
        file: PathBuf,

        /// Label for the version
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show a file's timeline
    #[command(alias = "tl")]
    Log {
        /// Tracked file
        file: PathBuf,
    },

    /// Print the content of a version
    Show {
        /// Tracked file
        file: PathBuf,

        /// Node id or unique prefix
        node: String,
    },

    /// Start a branch
    Branch {
        /// Tracked file
        file: PathBuf,

        /// Branch name
        name: String,

        /// Node to branch from (defaults to the head)
        #[arg(long)]
        from: Option<String>,
    },

    /// Make a branch active
    Switch {
        /// Tracked file
        file: PathBuf,

        /// Branch name
        branch: String,
    },

    /// Merge one branch into another
    Merge {
        /// Tracked file
        file: PathBuf,

        /// Branch merged from
        source: String,

        /// Branch merged into
        target: String,

        /// Merge strategy
        #[arg(long, value_enum, default_value = "smart")]
        strategy: StrategyArg,

        /// Deactivate the source branch afterwards
        #[arg(long)]
        close_source: bool,
    },

    /// Find the route between two versions
    Path {
        /// Tracked file
        file: PathBuf,

        /// Start node id or prefix
        from: String,

        /// End node id or prefix
        to: String,
    },

    /// Check stored history for damage
    Verify {
        /// Tracked file (all files when omitted)
        file: Option<PathBuf>,
    },

    /// Manage writing contexts
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// Show or change settings
    Config {
        /// Shift probability needed for an automatic version
        #[arg(long)]
        threshold: Option<f64>,

        /// Minimum detection confidence
        #[arg(long)]
        sensitivity: Option<f64>,

        /// Automatic versions per file per hour
        #[arg(long)]
        max_per_hour: Option<usize>,

        /// Minimum time between automatic versions, e.g. "5m"
        #[arg(long)]
        interval: Option<humantime::Duration>,
    },

    /// Summarise tracked files
    Stats,

    /// Forget a file that was removed
    Forget {
        /// Tracked file
        file: PathBuf,

        /// Delete its history as well
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Subcommand)]
enum ContextAction {
    /// Add or replace a context
    Add {
        /// Context id
        id: String,

        /// Display name
        name: String,

        /// Keywords (repeatable)
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,

        /// Display color
        #[arg(long)]
        color: Option<String>,
    },

    /// List contexts
    List,

    /// Remove a context
    Remove {
        /// Context id
        id: String,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Latest,
    Smart,
    Markers,
    Manual,
}

impl From<StrategyArg> for MergeStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Latest => MergeStrategy::LatestWins,
            StrategyArg::Smart => MergeStrategy::SmartMerge,
            StrategyArg::Markers => MergeStrategy::ConflictMarkers,
            StrategyArg::Manual => MergeStrategy::Manual,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<palimpsest::VersioningError>() {
            Some(err) => eprintln!("{}: {}", "Error".red().bold(), err.user_message()),
            None => eprintln!("{}: {:#}", "Error".red().bold(), e),
        }
        std::process::exit(1);
    }
}

/// Main command runner
async fn run(cli: Cli) -> anyhow::Result<()> {
    let store_path = cli.store.unwrap_or_else(|| PathBuf::from(".palimpsest"));
    let engine = Palimpsest::open(&store_path)
        .await
        .with_context(|| format!("opening store at {}", store_path.display()))?;

    match cli.command {
        Commands::Track { file } => cmd_track(&engine, &file).await,
        Commands::Checkpoint { file, message } => cmd_checkpoint(&engine, &file, message).await,
        Commands::Log { file } => cmd_log(&engine, &file).await,
        Commands::Show { file, node } => cmd_show(&engine, &file, &node).await,
        Commands::Branch { file, name, from } => cmd_branch(&engine, &file, &name, from).await,
        Commands::Switch { file, branch } => cmd_switch(&engine, &file, &branch).await,
        Commands::Merge {
            file,
            source,
            target,
            strategy,
            close_source,
        } => cmd_merge(&engine, &file, &source, &target, strategy, close_source).await,
        Commands::Path { file, from, to } => cmd_path(&engine, &file, &from, &to).await,
        Commands::Verify { file } => cmd_verify(&engine, file).await,
        Commands::Context { action } => cmd_context(&engine, action).await,
        Commands::Config {
            threshold,
            sensitivity,
            max_per_hour,
            interval,
        } => cmd_config(&engine, threshold, sensitivity, max_per_hour, interval).await,
        Commands::Stats => cmd_stats(&engine).await,
        Commands::Forget { file, purge } => cmd_forget(&engine, &file, purge).await,
    }
}

/// Feed the file's current content to detection
async fn cmd_track(engine: &Palimpsest, file: &Path) -> anyhow::Result<()> {
    let (file_id, content) = read_file(file)?;
    let start = Instant::now();
    let outcome = engine.handle_change(&file_id, &file_id, &content).await?;
    let elapsed = start.elapsed();

    match &outcome {
        ChangeOutcome::Unchanged => println!("{} {} is unchanged", "•".dimmed(), file_id),
        ChangeOutcome::NoShift { probability } => println!(
            "{} No context shift ({:.0}% likely), nothing stored",
            "•".dimmed(),
            probability * 100.0
        ),
        ChangeOutcome::Versioned {
            node_id, detection, ..
        } => {
            println!("{} Stored version {}", "✓".green().bold(), short_id(node_id).yellow().bold());
            match detection {
                Some(d) => {
                    println!("  Shift: {}", format!("{:.0}%", d.probability * 100.0).cyan());
                    if let Some(context) = &d.suggested_context {
                        println!("  Context: {}", context.cyan());
                    }
                    println!("  Signals: {}", d.signals.len().to_string().cyan());
                }
                None => println!("  {}", "Initial version".cyan()),
            }
        }
        ChangeOutcome::RateLimited { detection } => println!(
            "{} Shift detected ({:.0}%) but the hourly budget is used up",
            "!".yellow().bold(),
            detection.probability * 100.0
        ),
        ChangeOutcome::PartialSuccess { snapshot_id, reason } => println!(
            "{} Stored snapshot {} but the timeline was not updated: {}",
            "!".yellow().bold(),
            short_id(snapshot_id),
            reason
        ),
        ChangeOutcome::Recorded => {}
    }
    if outcome.created_version() {
        println!("  Time: {}", format_duration(round_millis(elapsed)).to_string().cyan());
    }
    Ok(())
}

/// Store a manual checkpoint
async fn cmd_checkpoint(engine: &Palimpsest, file: &Path, message: Option<String>) -> anyhow::Result<()> {
    let (file_id, content) = read_file(file)?;
    if engine.store().get_file_history(&file_id).await?.is_none() {
        engine.handle_change(&file_id, &file_id, &content).await?;
    }
    match engine
        .create_manual_checkpoint(&file_id, &content, message.as_deref())
        .await?
    {
        ChangeOutcome::Versioned { node_id, .. } => {
            println!("{} Created checkpoint {}", "✓".green().bold(), short_id(&node_id).yellow().bold());
            if let Some(msg) = &message {
                println!("  Message: {}", msg.cyan());
            }
            println!("  Size: {}", format_bytes(content.len() as u64).cyan());
        }
        other => println!("{} {:?}", "!".yellow().bold(), other),
    }
    Ok(())
}

/// Print the timeline tree and branches
async fn cmd_log(engine: &Palimpsest, file: &Path) -> anyhow::Result<()> {
    let timeline = load_timeline(engine, file).await?;
    println!("{} {}", "Timeline of".blue().bold(), timeline.file_path.cyan());
    println!();
    print!("{}", timeline.format_tree());
    println!();

    for branch in &timeline.branches {
        let marker = if branch.is_active { "*".green().bold() } else { " ".normal() };
        println!(
            "{} {} ({} nodes, from {})",
            marker,
            branch.name.yellow(),
            branch.node_ids.len(),
            short_id(&branch.parent_node_id)
        );
    }

    let stats = timeline.stats();
    println!();
    println!(
        "{} nodes, {} checkpoints, {} merges, depth {}",
        stats.total_nodes, stats.checkpoints, stats.merge_nodes, stats.max_depth
    );
    Ok(())
}

/// Print one version's content
async fn cmd_show(engine: &Palimpsest, file: &Path, node: &str) -> anyhow::Result<()> {
    let timeline = load_timeline(engine, file).await?;
    let node_id = resolve_node(&timeline, node)?;
    let content = engine
        .navigate_to_version(&timeline.file_id, &node_id)
        .await?
        .ok_or_else(|| anyhow!("no content stored for {}", short_id(&node_id)))?;
    print!("{}", content);
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

/// Create a branch
async fn cmd_branch(engine: &Palimpsest, file: &Path, name: &str, from: Option<String>) -> anyhow::Result<()> {
    let timeline = load_timeline(engine, file).await?;
    let from = match from {
        Some(prefix) => resolve_node(&timeline, &prefix)?,
        None => timeline.head.clone().ok_or_else(|| anyhow!("{} has no versions", timeline.file_id))?,
    };
    let branch = engine.create_branch(&timeline.file_id, name, &from).await?;
    println!(
        "{} Created branch {} at {}",
        "✓".green().bold(),
        branch.name.yellow().bold(),
        short_id(&from)
    );
    println!("  Switch to it with: {}", format!("palimpsest switch {} {}", file.display(), name).yellow());
    Ok(())
}

/// Activate a branch by name
async fn cmd_switch(engine: &Palimpsest, file: &Path, name: &str) -> anyhow::Result<()> {
    let file_id = file_id(file);
    let branch = find_branch(engine, &file_id, name).await?;
    if !engine.switch_branch(&file_id, &branch).await? {
        bail!("branch '{}' has no nodes", name);
    }
    println!("{} Switched to {}", "✓".green().bold(), name.yellow().bold());
    Ok(())
}

/// Merge two branches by name
async fn cmd_merge(
    engine: &Palimpsest,
    file: &Path,
    source: &str,
    target: &str,
    strategy: StrategyArg,
    close_source: bool,
) -> anyhow::Result<()> {
    let file_id = file_id(file);
    let source_id = find_branch(engine, &file_id, source).await?;
    let target_id = find_branch(engine, &file_id, target).await?;

    let mut options = MergeOptions::new(strategy.into());
    options.preserve_history = close_source;
    let result = engine.merge_branches(&source_id, &target_id, &options).await?;

    if result.success {
        let node = result.merged_node.as_ref().map(|n| short_id(&n.id).to_string()).unwrap_or_default();
        println!(
            "{} Merged {} into {} ({})",
            "✓".green().bold(),
            source.yellow(),
            target.yellow(),
            node.cyan()
        );
    } else {
        println!("{} Merge of {} into {} not completed", "✗".red().bold(), source, target);
    }
    for conflict in &result.conflicts {
        let location = conflict.line.map(|l| format!("line {}", l)).unwrap_or_else(|| "-".to_string());
        println!("  {} {:?} {}: {}", "!".yellow(), conflict.kind, location, conflict.description);
    }
    Ok(())
}

/// Print the route between two nodes
async fn cmd_path(engine: &Palimpsest, file: &Path, from: &str, to: &str) -> anyhow::Result<()> {
    let timeline = load_timeline(engine, file).await?;
    let from = resolve_node(&timeline, from)?;
    let to = resolve_node(&timeline, to)?;
    let Some(path) = engine.find_path(&from, &to).await? else {
        println!("{} No path between {} and {}", "✗".red().bold(), short_id(&from), short_id(&to));
        return Ok(());
    };

    let kind = match path.kind {
        PathKind::Linear => "linear".green(),
        PathKind::Branched => "branched".yellow(),
        PathKind::Merged => "merged".magenta(),
    };
    println!("{} path of length {}", kind, path.length);
    let steps: Vec<&str> = path.nodes.iter().map(|id| short_id(id)).collect();
    println!("  {}", steps.join(" → "));
    Ok(())
}

/// Verify one file or all of them
async fn cmd_verify(engine: &Palimpsest, file: Option<PathBuf>) -> anyhow::Result<()> {
    let file_ids = match file {
        Some(file) => vec![file_id(&file)],
        None => engine
            .store()
            .list_file_histories()
            .await?
            .into_iter()
            .map(|h| h.file_id)
            .collect(),
    };

    let mut failures = 0;
    for file_id in file_ids {
        let report = engine.verify_file(&file_id).await?;
        if report.is_valid() {
            println!("{} {}", "✓".green().bold(), report.summary());
        } else {
            failures += 1;
            println!("{} {}", "✗".red().bold(), report.summary());
            for problem in report.errors() {
                println!("  {}", problem.red());
            }
        }
    }
    if failures > 0 {
        bail!("{} file(s) failed verification", failures);
    }
    Ok(())
}

/// Context management
async fn cmd_context(engine: &Palimpsest, action: ContextAction) -> anyhow::Result<()> {
    match action {
        ContextAction::Add {
            id,
            name,
            keywords,
            color,
        } => {
            let mut context = ContextDefinition::new(id, name, keywords);
            if let Some(color) = color {
                context.color = color;
            }
            let summary = format!("{} with {} keywords", context.name.yellow().bold(), context.keywords.len());
            engine.add_context(context).await?;
            println!("{} Saved context {}", "✓".green().bold(), summary);
        }
        ContextAction::List => {
            let contexts = engine.list_contexts();
            if contexts.is_empty() {
                println!("No contexts defined");
            }
            for context in contexts {
                println!(
                    "{} {} [{}]",
                    context.id.yellow(),
                    context.name.bold(),
                    context.keywords.join(", ").dimmed()
                );
            }
        }
        ContextAction::Remove { id } => {
            if engine.remove_context(&id).await? {
                println!("{} Removed context {}", "✓".green().bold(), id.yellow());
            } else {
                bail!("no context '{}'", id);
            }
        }
    }
    Ok(())
}

/// Print settings, persisting any changes first
async fn cmd_config(
    engine: &Palimpsest,
    threshold: Option<f64>,
    sensitivity: Option<f64>,
    max_per_hour: Option<usize>,
    interval: Option<humantime::Duration>,
) -> anyhow::Result<()> {
    let mut changed = false;
    if let Some(threshold) = threshold {
        engine.set_shift_threshold(threshold)?;
        changed = true;
    }
    if let Some(sensitivity) = sensitivity {
        engine.set_detection_sensitivity(sensitivity)?;
        changed = true;
    }
    if let Some(max) = max_per_hour {
        engine.set_max_snapshots_per_hour(max)?;
        changed = true;
    }
    if let Some(interval) = interval {
        engine.set_snapshot_interval(interval.into())?;
        changed = true;
    }
    if changed {
        engine.persist_config().await?;
        println!("{} Configuration saved", "✓".green().bold());
    }

    let config = engine.config();
    println!("  Shift threshold: {}", config.shift_threshold.to_string().cyan());
    println!("  Detection sensitivity: {}", config.min_detection_confidence.to_string().cyan());
    println!("  Max versions per hour: {}", config.max_snapshots_per_hour.to_string().cyan());
    println!(
        "  Min interval: {}",
        format_duration(Duration::from_secs(config.min_snapshot_interval_secs))
            .to_string()
            .cyan()
    );
    println!("  Main branch: {}", config.main_branch_name.cyan());
    Ok(())
}

/// Summarise every tracked file
async fn cmd_stats(engine: &Palimpsest) -> anyhow::Result<()> {
    let histories = engine.store().list_file_histories().await?;
    if histories.is_empty() {
        println!("No tracked files");
        return Ok(());
    }

    println!("{}", "Tracked files".blue().bold());
    for history in histories {
        let Some(timeline) = engine.get_timeline_for_file(&history.file_id).await? else {
            continue;
        };
        let stats = timeline.stats();
        println!(
            "  {} {} versions, {} branches, {} checkpoints, last change {}",
            history.file_path.cyan(),
            stats.total_nodes,
            stats.branches,
            stats.checkpoints,
            history.last_modified.format("%Y-%m-%d %H:%M")
        );
    }
    println!("  Contexts: {}", engine.list_contexts().len().to_string().cyan());
    let compression = engine.versions().compression_stats();
    if compression.payloads_compressed > 0 {
        println!(
            "  Compression saved {} this run",
            format_bytes(compression.bytes_saved as u64).cyan()
        );
    }
    Ok(())
}

/// Drop a deleted file, optionally with its history
async fn cmd_forget(engine: &Palimpsest, file: &Path, purge: bool) -> anyhow::Result<()> {
    let file_id = file_id(file);
    if purge {
        if !engine.purge_file(&file_id).await? {
            bail!("{} is not tracked", file_id);
        }
        println!("{} Purged history of {}", "✓".green().bold(), file_id.yellow());
    } else {
        engine
            .handle_event(FileEvent::Deleted {
                file_id: file_id.clone(),
                path: file_id.clone(),
            })
            .await?;
        println!("{} {} marked deleted, history kept", "✓".green().bold(), file_id.yellow());
    }
    Ok(())
}

fn file_id(file: &Path) -> String {
    file.to_string_lossy().into_owned()
}

fn read_file(file: &Path) -> anyhow::Result<(String, String)> {
    let content = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    Ok((file_id(file), content))
}

async fn load_timeline(engine: &Palimpsest, file: &Path) -> anyhow::Result<Timeline> {
    let file_id = file_id(file);
    engine
        .get_timeline_for_file(&file_id)
        .await?
        .ok_or_else(|| anyhow!("{} is not tracked; run 'palimpsest track {}' first", file_id, file_id))
}

/// Resolve a node id prefix to the full id
fn resolve_node(timeline: &Timeline, prefix: &str) -> anyhow::Result<String> {
    let matches: Vec<&String> = timeline.nodes.keys().filter(|id| id.starts_with(prefix)).collect();
    match matches.as_slice() {
        [id] => Ok((*id).clone()),
        [] => bail!("no version matching '{}'", prefix),
        _ => bail!("'{}' matches {} versions, use a longer prefix", prefix, matches.len()),
    }
}

async fn find_branch(engine: &Palimpsest, file_id: &str, name: &str) -> anyhow::Result<String> {
    engine
        .timeline()
        .find_branch(file_id, name)
        .await?
        .map(|b| b.id)
        .ok_or_else(|| anyhow!("{} has no branch named '{}'", file_id, name))
}

fn round_millis(duration: Duration) -> Duration {
    Duration::from_millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

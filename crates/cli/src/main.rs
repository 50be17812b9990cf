//! blocksync: block-level directory synchronization
//!
//! Turns a destination tree into a byte-exact replica of a source tree,
//! reusing destination content that was renamed, relocated or appended to.

mod config;
mod filter;

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use tracing::{info, warn};

use blocksync_core::{
    start_tracker, BlockStore, LocalStore, NodeHandle, PatchCmd, PatchPlan, Tree,
};

use crate::config::BlocksyncConfig;
use crate::filter::ExcludeFilter;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "blocksync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Block-level directory sync with content reuse")]
#[command(long_about = r#"
blocksync replicates a source tree onto a destination byte-for-byte while
transferring as little as possible.

How it saves work:
  • content index   - every file, directory and 8 KiB block is fingerprinted
  • renames         - identical content found elsewhere is moved, not copied
  • block reuse     - partially-changed files are rebuilt from local blocks
  • crash safety    - rewrites stage into temp files, then rename into place

Examples:
  blocksync sync ./source ./replica        Make replica match source
  blocksync plan ./source ./replica        Show what sync would do
  blocksync index ./source                 Index a tree and print a summary
  blocksync track ./replica                Watch a tree for changes
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a tree and print a summary
    Index {
        /// Directory (or single file) to index
        path: PathBuf,

        /// Output format (summary, json)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// Print the command sequence a sync would execute
    Plan {
        /// Source tree
        src: PathBuf,

        /// Destination tree
        dst: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Make the destination a byte-exact replica of the source
    Sync {
        /// Source tree
        src: PathBuf,

        /// Destination tree
        dst: PathBuf,

        /// Plan only; touch nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Track a tree, re-indexing it periodically
    Track {
        /// Directory to track
        path: PathBuf,

        /// Seconds between re-indexes (overrides .blocksync.toml)
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Index { path, format } => cmd_index(&path, &format),
        Commands::Plan { src, dst, format } => cmd_plan(&src, &dst, &format),
        Commands::Sync { src, dst, dry_run } => cmd_sync(&src, &dst, dry_run),
        Commands::Track { path, interval } => cmd_track(&path, interval),
    }
}

/// Open a store honoring the root's .blocksync.toml excludes.
fn open_store(root: &Path) -> Result<LocalStore> {
    let config = BlocksyncConfig::load(root)?;
    let filter = ExcludeFilter::new(root, &config.exclude)?;
    let store = LocalStore::open_with_filter(root, &filter)?;
    for error in store.index_errors() {
        warn!(%error, "skipped during indexing");
    }
    Ok(store)
}

fn cmd_index(path: &Path, format: &str) -> Result<()> {
    let store = open_store(path)?;
    let tree = store.repo().tree();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(tree)?),
        _ => {
            let (files, bytes) = tree_totals(tree);
            println!("root:   {}", path.display());
            println!("strong: {}", tree.root_strong());
            println!("dirs:   {}", tree.dir_count());
            println!("files:  {files} ({bytes} bytes)");
        }
    }
    Ok(())
}

fn tree_totals(tree: &Tree) -> (usize, u64) {
    let mut files = 0;
    let mut bytes = 0;
    tree.walk(|tree, handle| match handle {
        NodeHandle::File(id) => {
            files += 1;
            bytes += tree.file(id).size;
            false
        }
        NodeHandle::Dir(_) => true,
        NodeHandle::Block(..) => false,
    });
    (files, bytes)
}

fn build_plan(src: &Path, dst: &Path) -> Result<PatchPlan<LocalStore>> {
    let src_store = open_store(src)?;
    let dst_store = open_store(dst)?;
    Ok(PatchPlan::new(src_store, dst_store)?)
}

fn cmd_plan(src: &Path, dst: &Path, format: &str) -> Result<()> {
    let plan = build_plan(src, dst)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&plan.cmds)?),
        _ => print!("{plan}"),
    }
    Ok(())
}

fn cmd_sync(src: &Path, dst: &Path, dry_run: bool) -> Result<()> {
    let mut plan = build_plan(src, dst)?;

    if dry_run {
        print!("{plan}");
        info!(commands = plan.cmds.len(), "dry run; nothing touched");
        return Ok(());
    }

    info!(commands = plan.cmds.len(), "applying patch");
    plan.exec()?;

    for error in plan.set_mode() {
        warn!(%error, "set-mode");
    }
    for error in plan.clean() {
        warn!(%error, "clean");
    }

    print_summary(&plan);
    Ok(())
}

fn print_summary(plan: &PatchPlan<LocalStore>) {
    let mut kept = 0u32;
    let mut transferred = 0u32;
    let mut downloaded = 0u32;
    let mut rewritten = 0u32;
    let mut resized = 0u32;
    let mut conflicts = 0u32;
    for cmd in &plan.cmds {
        match cmd {
            PatchCmd::Keep { .. } => kept += 1,
            PatchCmd::Transfer { .. } => transferred += 1,
            PatchCmd::SrcFileDownload { .. } => downloaded += 1,
            PatchCmd::ReplaceWithTemp { .. } => rewritten += 1,
            PatchCmd::Resize { .. } => resized += 1,
            PatchCmd::Conflict { .. } => conflicts += 1,
            _ => {}
        }
    }
    println!(
        "synced: {kept} kept, {transferred} transferred, {downloaded} downloaded, \
         {rewritten} rewritten, {resized} resized, {conflicts} conflicts resolved"
    );
}

fn cmd_track(path: &Path, interval: Option<u64>) -> Result<()> {
    let config = BlocksyncConfig::load(path)?;
    let secs = interval.unwrap_or(config.track.interval_secs);

    let (tx, rx) = mpsc::channel();
    let tracker = start_tracker(path, rx, Duration::from_secs(secs))?;
    info!(root = %path.display(), interval = secs, "tracking; Ctrl-C to stop");

    // Keep the request channel open until the process is interrupted.
    let _tx = tx;
    tracker
        .join()
        .map_err(|_| color_eyre::eyre::eyre!("tracker thread panicked"))?;
    Ok(())
}

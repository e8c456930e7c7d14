use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use beadwork::{
    BackgroundWorker, BeadworkError, Recipe, Result, Snapshot, SnapshotReady, WorkerComponents,
    WorkerConfig, WorkerError, WorkerMessage,
};

/// How long `snapshot` waits for the first build.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "beadwork")]
#[command(about = "Background snapshots for JSONL issue files")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch an issues file and print every worker message until interrupted
    #[command(visible_alias = "w")]
    Watch {
        /// Path to the JSONL issues file
        file: PathBuf,

        /// Recipe YAML to filter and sort the view
        #[arg(short, long)]
        recipe: Option<PathBuf>,

        /// Use the polling watcher even where native events work
        #[arg(long)]
        force_poll: bool,

        /// Collect detailed metrics and print them with each snapshot
        #[arg(long)]
        metrics: bool,
    },

    /// Build one snapshot and print a summary
    #[command(visible_alias = "s")]
    Snapshot {
        /// Path to the JSONL issues file
        file: PathBuf,

        /// Recipe YAML to filter and sort the view
        #[arg(short, long)]
        recipe: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("beadwork=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_for(file: &Path) -> Result<WorkerConfig> {
    if !file.exists() {
        return Err(BeadworkError::DataFileNotFound(file.to_path_buf()));
    }
    Ok(WorkerConfig {
        beads_path: Some(file.to_path_buf()),
        ..WorkerConfig::from_env()
    })
}

fn load_recipe(path: Option<&Path>) -> Result<Option<Recipe>> {
    path.map(Recipe::load_file).transpose()
}

async fn cmd_watch(file: &Path, recipe: Option<&Path>, force_poll: bool, metrics: bool) -> Result<()> {
    let mut config = config_for(file)?;
    config.force_poll |= force_poll;
    config.metrics_enabled |= metrics;
    let recipe = load_recipe(recipe)?;

    let worker = BackgroundWorker::new(config)?;
    let rx = worker.messages();
    worker.set_recipe(recipe);
    worker.start()?;
    worker.force_refresh();

    let info = worker.watcher_info();
    eprintln!(
        "{} {} ({}, fs: {})",
        "Watching".bold(),
        file.display(),
        if info.polling {
            format!("polling every {:?}", info.poll_interval)
        } else {
            "native events".to_string()
        },
        info.fs_type
    );

    let done = worker.done();
    tokio::pin!(done);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut done => break,
            msg = rx.recv() => match msg {
                Some(msg) => print_message(&worker, &msg, metrics),
                None => break,
            },
        }
    }

    worker.stop().await;
    if let Some(error) = worker.last_error() {
        eprintln!("{} {}", "last error:".red(), error);
    }
    Ok(())
}

fn print_message(worker: &BackgroundWorker, msg: &WorkerMessage, metrics: bool) {
    match msg {
        WorkerMessage::SnapshotReady(ready) => {
            print_ready(ready);
            worker.record_ui_update_latency(ready.sent_at.elapsed());
            if metrics {
                let m = worker.metrics();
                println!(
                    "  {} builds={} last={:?} phase1={:?} swap={:?} pool={}/{} bytes={}",
                    "metrics".dimmed(),
                    m.processing_count,
                    m.processing_duration,
                    m.phase1_duration,
                    m.swap_latency,
                    m.pool_hits,
                    m.pool_misses,
                    m.snapshot_size_bytes
                );
            }
        }
        WorkerMessage::SnapshotError { error, recoverable } => print_error(error, *recoverable),
        WorkerMessage::Phase2Ready { data_hash } => {
            println!("{} {}", "phase2".cyan(), short_hash(data_hash).dimmed());
        }
    }
}

fn print_ready(ready: &SnapshotReady) {
    let snapshot = &ready.snapshot;
    let (added, removed, modified) = snapshot
        .diff
        .as_ref()
        .map(|d| (d.added.len(), d.removed.len(), d.modified.len()))
        .unwrap_or((snapshot.len(), 0, 0));
    println!(
        "{} v{} {} issues ({} open, {} ready, {} blocked, {} closed) +{} -{} ~{} {}",
        "snapshot".green().bold(),
        ready.version,
        snapshot.len(),
        snapshot.count_open,
        snapshot.count_ready,
        snapshot.count_blocked,
        snapshot.count_closed,
        added,
        removed,
        modified,
        short_hash(&snapshot.data_hash).dimmed()
    );
    if ready.coalesce_count > 0 || ready.queue_depth > 1 {
        println!(
            "  {} coalesced={} queue_depth={}",
            "burst".dimmed(),
            ready.coalesce_count,
            ready.queue_depth
        );
    }
    if !snapshot.large_dataset_warning.is_empty() {
        println!("  {}", snapshot.large_dataset_warning.yellow());
    }
}

fn print_error(error: &WorkerError, recoverable: bool) {
    if recoverable {
        eprintln!("{} {}", "error".yellow().bold(), error);
    } else {
        eprintln!("{} {}", "fatal".red().bold(), error);
    }
}

async fn cmd_snapshot(file: &Path, recipe: Option<&Path>, output_json: bool) -> Result<()> {
    let config = config_for(file)?;
    let recipe = load_recipe(recipe)?;

    // One build, nothing to watch.
    let mut components = WorkerComponents::from_config(&config);
    components.watcher = None;
    let worker = BackgroundWorker::with_components(config, components)?;
    let rx = worker.messages();
    worker.set_recipe(recipe);
    worker.start()?;
    worker.force_refresh();

    let outcome = tokio::time::timeout(SNAPSHOT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Some(WorkerMessage::SnapshotReady(ready)) => return Ok(ready.snapshot),
                Some(WorkerMessage::SnapshotError { error, .. }) => {
                    return Err(BeadworkError::Other(error.to_string()));
                }
                Some(WorkerMessage::Phase2Ready { .. }) => continue,
                None => return Err(BeadworkError::WorkerStopped),
            }
        }
    })
    .await
    .map_err(|_| BeadworkError::Other(format!("no snapshot within {SNAPSHOT_TIMEOUT:?}")));

    let snapshot = match outcome {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) | Err(e) => {
            worker.stop().await;
            return Err(e);
        }
    };
    snapshot.analysis().wait_for_phase2().await;
    worker.stop().await;

    if output_json {
        println!("{}", serde_json::to_string_pretty(&snapshot_json(&snapshot))?);
    } else {
        print_summary(&snapshot);
    }
    Ok(())
}

fn snapshot_json(snapshot: &Snapshot) -> serde_json::Value {
    let top: Vec<_> = snapshot
        .scored_list_items()
        .into_iter()
        .take(10)
        .map(|item| {
            json!({
                "id": item.id,
                "title": item.title,
                "status": item.status.as_str(),
                "priority": item.priority,
                "score": item.graph_score,
            })
        })
        .collect();
    json!({
        "issues": snapshot.len(),
        "view": snapshot.view_len(),
        "open": snapshot.count_open,
        "ready": snapshot.count_ready,
        "blocked": snapshot.count_blocked,
        "closed": snapshot.count_closed,
        "hash": snapshot.data_hash,
        "tier": snapshot.tier.as_str(),
        "loaded_open_only": snapshot.loaded_open_only,
        "truncated": snapshot.truncated_count,
        "load_warnings": snapshot.load_warning_count,
        "recipe": snapshot.recipe_name,
        "has_cycle": snapshot.analysis().has_cycle,
        "top": top,
    })
}

fn print_summary(snapshot: &Snapshot) {
    println!(
        "{} issues ({} open, {} ready, {} blocked, {} closed)",
        snapshot.len().to_string().bold(),
        snapshot.count_open,
        snapshot.count_ready.to_string().green(),
        snapshot.count_blocked.to_string().red(),
        snapshot.count_closed.to_string().dimmed()
    );
    println!("{} {}", "tier:".dimmed(), snapshot.tier);
    if !snapshot.recipe_name.is_empty() {
        println!("{} {} ({} shown)", "recipe:".dimmed(), snapshot.recipe_name, snapshot.view_len());
    }
    if snapshot.load_warning_count > 0 {
        println!(
            "{}",
            format!("{} malformed lines skipped", snapshot.load_warning_count).yellow()
        );
    }
    if !snapshot.large_dataset_warning.is_empty() {
        println!("{}", snapshot.large_dataset_warning.yellow());
    }
    if snapshot.analysis().has_cycle {
        println!("{}", "dependency cycle detected".red());
    }

    let top = snapshot.scored_list_items();
    if !top.is_empty() {
        println!();
        println!("{}", "Top issues by graph score:".bold());
        for item in top.iter().take(10) {
            println!(
                "  {:<12} P{} {:<12} {:>6.3}  {}",
                item.id.cyan(),
                item.priority,
                item.status.as_str(),
                item.graph_score,
                item.title
            );
        }
    }
}

fn short_hash(hash: &str) -> &str {
    beadwork::analysis::hash_prefix(hash)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Watch {
            file,
            recipe,
            force_poll,
            metrics,
        } => cmd_watch(&file, recipe.as_deref(), force_poll, metrics).await,
        Commands::Snapshot { file, recipe, json } => cmd_snapshot(&file, recipe.as_deref(), json).await,
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

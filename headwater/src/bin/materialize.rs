//! Materializer binary: turns a Parquet database into one JSONL document per
//! entity, following a relation schema.
//!
//! ## Modes
//!
//! - **Full history** (no `--tasks-dir`): one document per distinct entity id,
//!   every related row embedded, written to `--output`.
//! - **Point in time** (`--tasks-dir` + `--task`): for each split, reads
//!   `<tasks-dir>/<split>.parquet` and writes `<output>/<split>_trees.jsonl`,
//!   where each document only sees rows strictly before its task's cutoff.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin materialize -- \
//!     --schema schemas/rel-amazon.json --db-dir data/rel-amazon/db \
//!     --tasks-dir data/rel-amazon/tasks/user-churn --task user-churn \
//!     --output data/rel-amazon/trees/user-churn
//! ```

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use indicatif::{HumanCount, HumanDuration};
use tracing::{info, warn};

use headwater::common::{DEFAULT_TIMESTAMP_FORMAT, EntityTask};
use headwater::coordinator::{Coordinator, CoordinatorConfig, RunStats};
use headwater::index::TemporalIndex;
use headwater::normalize::DefaultNormalizer;
use headwater::schema::RelationSchema;
use headwater::store::{ParquetStore, TabularStore};
use headwater::tasks;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Materialize nested entity documents from a parquet database")]
struct Args {
    /// Relation schema JSON describing how the tables nest.
    #[arg(long)]
    schema: PathBuf,

    /// Directory holding one `<table>.parquet` file per table.
    #[arg(long)]
    db_dir: PathBuf,

    /// Output JSONL file (full history) or output directory (task splits).
    #[arg(long)]
    output: PathBuf,

    /// Directory holding `<split>.parquet` task tables. Omit for full history.
    #[arg(long)]
    tasks_dir: Option<PathBuf>,

    /// Task name in the schema's `tasks` section. Required with --tasks-dir.
    #[arg(long)]
    task: Option<String>,

    /// Splits to process in task mode. Defaults to train, val and test.
    #[arg(long, value_delimiter = ',')]
    splits: Vec<String>,

    /// Worker threads. Defaults to the number of available cores.
    #[arg(long)]
    num_workers: Option<usize>,

    /// Channel capacity between dispatcher, workers and writer (0 = num workers).
    #[arg(long, default_value_t = 0)]
    queue_depth: usize,

    /// Build one index per worker instead of sharing a single index.
    #[arg(long, default_value_t = false)]
    per_worker_index: bool,

    /// chrono format string for timestamps in the output.
    #[arg(long, default_value = DEFAULT_TIMESTAMP_FORMAT)]
    timestamp_format: String,

    /// Disable the progress bar.
    #[arg(long, default_value_t = false)]
    no_progress: bool,
}

fn create_writer(path: &Path) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

fn log_stats(label: &str, stats: &RunStats, elapsed: std::time::Duration) {
    info!(
        "  {}: {} written, {} skipped (entity not found), {} failed, {} processed in {}",
        label,
        HumanCount(stats.written as u64),
        HumanCount(stats.skipped as u64),
        HumanCount(stats.failed as u64),
        HumanCount(stats.processed as u64),
        HumanDuration(elapsed)
    );
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let pipeline_start = Instant::now();

    info!("Schema:   {}", args.schema.display());
    info!("DB dir:   {}", args.db_dir.display());
    info!("Output:   {}", args.output.display());

    // ── Step 1: Load the relation schema ────────────────────────────────
    info!("Step 1: Loading relation schema...");
    let schema = Arc::new(RelationSchema::load(&args.schema)?);
    info!(
        "  {}: entity {}.{}, {} relations, max depth {}",
        schema.name,
        schema.entity.table,
        schema.entity.primary_key,
        schema.relations.len(),
        schema.max_depth
    );

    let task_spec = match (&args.tasks_dir, &args.task) {
        (Some(_), Some(name)) => Some(
            schema
                .tasks
                .get(name)
                .cloned()
                .ok_or_else(|| format!("task '{name}' is not declared in the schema"))?,
        ),
        (Some(_), None) => return Err("--tasks-dir requires --task".into()),
        (None, _) => None,
    };

    // ── Step 2: Index ───────────────────────────────────────────────────
    let store = Arc::new(ParquetStore::new(&args.db_dir));
    let mut config = CoordinatorConfig {
        queue_depth: args.queue_depth,
        show_progress: !args.no_progress,
        ..CoordinatorConfig::default()
    };
    if let Some(n) = args.num_workers {
        config.num_workers = n;
    }

    let (coordinator, shared_index) = if args.per_worker_index {
        info!(
            "Step 2: Deferring index construction to {} workers...",
            config.num_workers
        );
        let store: Arc<dyn TabularStore> = store.clone();
        (Coordinator::per_worker(config, store, schema.clone()), None)
    } else {
        info!("Step 2: Building temporal index...");
        let start = Instant::now();
        let index = Arc::new(TemporalIndex::build(store.as_ref(), schema.clone())?);
        info!(
            "  Indexed {} entities in {}",
            HumanCount(index.num_entities() as u64),
            HumanDuration(start.elapsed())
        );
        (Coordinator::with_index(config, index.clone()), Some(index))
    };

    let normalizer = DefaultNormalizer::with_format(args.timestamp_format.clone());

    // ── Step 3: Materialize ─────────────────────────────────────────────
    match (task_spec, &args.tasks_dir) {
        (Some(spec), Some(tasks_dir)) => {
            let splits: Vec<String> = if args.splits.is_empty() {
                tasks::DEFAULT_SPLITS.iter().map(|s| s.to_string()).collect()
            } else {
                args.splits.clone()
            };
            info!("Step 3: Materializing {} splits...", splits.len());
            for split in &splits {
                let path = tasks::split_path(tasks_dir, split);
                if !path.exists() {
                    warn!("  No task table for split {} at {}, skipping", split, path.display());
                    continue;
                }
                let set = tasks::load_tasks(&path, &spec)?;
                info!(
                    "  {}: {} tasks ({} invalid rows)",
                    split,
                    HumanCount(set.len() as u64),
                    set.invalid
                );
                let output = tasks::split_output_path(&args.output, split);
                let start = Instant::now();
                let stats = coordinator.run(set.tasks, &normalizer, create_writer(&output)?)?;
                log_stats(split, &stats, start.elapsed());
                info!("  Wrote {}", output.display());
            }
        }
        _ => {
            info!("Step 3: Materializing full history...");
            let entity_tasks: Vec<EntityTask> = match &shared_index {
                Some(index) => {
                    tasks::full_history_tasks(index.entity_table(), &schema.entity.primary_key)?
                }
                None => {
                    let table = store.load_table(&schema.entity.table)?;
                    tasks::full_history_tasks(&table, &schema.entity.primary_key)?
                }
            };
            info!("  {} entities", HumanCount(entity_tasks.len() as u64));
            let start = Instant::now();
            let stats = coordinator.run(entity_tasks, &normalizer, create_writer(&args.output)?)?;
            log_stats("full history", &stats, start.elapsed());
            info!("  Wrote {}", args.output.display());
        }
    }

    info!("Done in {}", HumanDuration(pipeline_start.elapsed()));
    Ok(())
}

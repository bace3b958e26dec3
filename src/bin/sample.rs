//! Down-sample one task's splits and pull the matching documents out of a
//! full-history JSONL file, producing a small dataset for quick experiments.
//!
//! For each split, the first `--<split>-rows` rows of `<tasks-dir>/<split>.parquet`
//! are written to `<output>/<split>.parquet`. The entity ids of all kept rows
//! then select one document each from `--documents` into `<output>/<name>.jsonl`.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin sample -- \
//!     --tasks-dir ~/.cache/relbench/rel-event/tasks/user-repeat --task-id-column user \
//!     --documents data/rel-event/rel-event-user_id.jsonl --document-id-field user_id \
//!     --output data/sampling/rel-event/tasks/user-repeat
//! ```

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use indexmap::IndexSet;
use tracing::{info, warn};

use canopy::sampling::{filter_jsonl, sample_split};
use headwater::common::Key;

#[derive(Parser, Debug)]
#[command(about = "Sample task splits and their documents")]
struct Args {
    /// Directory holding `train.parquet`, `val.parquet` and `test.parquet`.
    #[arg(long)]
    tasks_dir: PathBuf,

    /// Entity id column in the task tables.
    #[arg(long)]
    task_id_column: String,

    /// Full-history JSONL to draw documents from.
    #[arg(long)]
    documents: PathBuf,

    /// Entity id field in the documents.
    #[arg(long)]
    document_id_field: String,

    /// Output directory.
    #[arg(long)]
    output: PathBuf,

    /// Output JSONL name, defaults to the documents file name.
    #[arg(long)]
    name: Option<String>,

    #[arg(long, default_value_t = 2000)]
    train_rows: usize,

    #[arg(long, default_value_t = 500)]
    val_rows: usize,

    #[arg(long, default_value_t = 500)]
    test_rows: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let start = Instant::now();
    std::fs::create_dir_all(&args.output)?;

    let name = match &args.name {
        Some(name) => name.clone(),
        None => args
            .documents
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or("--documents has no file name")?,
    };
    let output = args.output.join(name);
    if output.canonicalize().ok() == Some(args.documents.canonicalize()?) {
        return Err(format!(
            "{} would overwrite --documents, pass --name or another --output",
            output.display()
        )
        .into());
    }

    // ── Step 1: Sample splits ───────────────────────────────────────────
    info!("Step 1: Sampling task splits from {}...", args.tasks_dir.display());
    let mut ids: IndexSet<Key> = IndexSet::new();
    for (split, rows) in [
        ("train", args.train_rows),
        ("val", args.val_rows),
        ("test", args.test_rows),
    ] {
        let input = args.tasks_dir.join(format!("{split}.parquet"));
        if !input.exists() {
            warn!("  No task table at {}, skipping", input.display());
            continue;
        }
        let output = args.output.join(format!("{split}.parquet"));
        let split_ids = sample_split(&input, rows, &output, &args.task_id_column)?;
        let before = ids.len();
        ids.extend(split_ids);
        info!(
            "  {}: kept up to {} rows, {} new ids ({} total)",
            split,
            rows,
            ids.len() - before,
            ids.len()
        );
    }

    // ── Step 2: Filter documents ────────────────────────────────────────
    info!("Step 2: Selecting documents from {}...", args.documents.display());
    let report = filter_jsonl(&args.documents, &args.document_id_field, &ids, &output)?;
    if report.found < report.requested {
        warn!(
            "  {} ids have no document",
            report.requested - report.found
        );
    }
    info!(
        "Wrote {} documents to {} in {:.1}s",
        report.found,
        output.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

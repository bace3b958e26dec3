//! Build and pretty-print the document for one entity. Handy for checking a new
//! relation schema before launching a full run.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use headwater::common::{EntityTask, Key, Timestamp, Value};
use headwater::index::TemporalIndex;
use headwater::materialize::Materializer;
use headwater::normalize::DefaultNormalizer;
use headwater::schema::RelationSchema;
use headwater::store::ParquetStore;

#[derive(Parser, Debug)]
#[command(about = "Materialize a single entity document from a parquet database")]
struct Args {
    /// Relation schema JSON.
    #[arg(long)]
    schema: PathBuf,

    /// Directory holding one `<table>.parquet` file per table.
    #[arg(long)]
    db_dir: PathBuf,

    /// Entity id. Integers are matched as integers, anything else as a string.
    #[arg(long)]
    entity: String,

    /// Cutoff timestamp, e.g. "2015-01-01" or "2015-01-01 12:00:00".
    #[arg(long)]
    cutoff: Option<String>,

    /// Optional label to attach, passed through as a string.
    #[arg(long)]
    label: Option<String>,

    /// Write the document here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let schema = Arc::new(RelationSchema::load(&args.schema)?);
    let store = ParquetStore::new(&args.db_dir);
    let index = TemporalIndex::build(&store, schema)?;

    let cutoff = args
        .cutoff
        .as_deref()
        .map(|c| Timestamp::parse(c).ok_or_else(|| format!("unparseable cutoff '{c}'")))
        .transpose()?;
    let task = EntityTask {
        entity_id: Key::parse_lenient(&args.entity),
        cutoff,
        label: args.label.map(Value::Str),
    };

    let normalizer = DefaultNormalizer::default();
    let materializer = Materializer::new(&index, &normalizer);
    let Some(doc) = materializer.materialize(&task)? else {
        return Err(format!("entity '{}' not found in {}", args.entity, index.entity_table().name()).into());
    };

    let text = serde_json::to_string_pretty(&doc)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{text}\n"))?;
            info!("Wrote {}", path.display());
        }
        None => println!("{text}"),
    }
    Ok(())
}

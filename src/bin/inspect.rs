//! Inspect a materialized JSONL file: count documents, pretty-print one with
//! long lists cut short, or copy the first few lines into a smaller file.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --input data/rel-stack/trees/train_trees.jsonl
//! cargo run --release --bin inspect -- --input trees.jsonl --line 42 --keep 3 --save example.json
//! cargo run --release --bin inspect -- --input trees.jsonl --head 8 --head-output mini.jsonl
//! ```

use std::path::PathBuf;

use clap::Parser;
use serde_json::Value as JsonValue;

use canopy::jsonl;

#[derive(Parser, Debug)]
#[command(about = "Inspect a materialized JSONL file")]
struct Args {
    /// JSONL file produced by the materializer.
    #[arg(long)]
    input: PathBuf,

    /// Document to pretty-print (0-based line number).
    #[arg(long, default_value_t = 0)]
    line: usize,

    /// Array elements to keep when printing (0 prints arrays in full).
    #[arg(long, default_value_t = 5)]
    keep: usize,

    /// Write the untruncated document as pretty JSON to this file.
    #[arg(long)]
    save: Option<PathBuf>,

    /// Copy this many leading lines to --head-output instead of printing.
    #[arg(long, requires = "head_output")]
    head: Option<usize>,

    /// Destination for --head.
    #[arg(long)]
    head_output: Option<PathBuf>,

    /// Skip counting lines (slow on very large files).
    #[arg(long, default_value_t = false)]
    no_count: bool,
}

/// Top-level fields and the size of every array-valued one.
fn print_shape(doc: &JsonValue) {
    let Some(map) = doc.as_object() else {
        println!("│  (not an object)");
        return;
    };
    for (key, value) in map {
        let shape = match value {
            JsonValue::Array(items) => format!("[{} items]", items.len()),
            JsonValue::Object(fields) => format!("{{{} fields}}", fields.len()),
            JsonValue::String(s) => {
                let truncated: String = s.chars().take(40).collect();
                format!("{truncated:?}")
            }
            other => other.to_string(),
        };
        println!("│  {key:<28} {shape}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let (Some(n), Some(dst)) = (args.head, &args.head_output) {
        let copied = jsonl::copy_head(&args.input, dst, n)?;
        println!("Copied {copied} lines to {}", dst.display());
        return Ok(());
    }

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  File: {}", args.input.display());
    if !args.no_count {
        println!("║  Documents: {:>10}", jsonl::count_lines(&args.input)?);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let Some(doc) = jsonl::read_line(&args.input, args.line)? else {
        return Err(format!("{} has no line {}", args.input.display(), args.line).into());
    };

    println!("┌─ Line {}", args.line);
    print_shape(&doc);
    println!("└──────────────────────────────────────────────────────────────");
    println!();

    let shown = if args.keep == 0 {
        doc.clone()
    } else {
        jsonl::truncate_lists(&doc, args.keep)
    };
    println!("{}", serde_json::to_string_pretty(&shown)?);

    if let Some(path) = &args.save {
        std::fs::write(path, serde_json::to_string_pretty(&doc)? + "\n")?;
        eprintln!("Saved line {} to {}", args.line, path.display());
    }
    Ok(())
}

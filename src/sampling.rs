//! Down-sampling of task splits and the matching JSONL documents.
//!
//! A sampled split keeps the first `limit` rows of a task table; the entity ids
//! of those rows then select documents out of a full-history JSONL file.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use indexmap::IndexSet;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use headwater::common::Key;
use headwater::store::{StoreError, read_batch, table_from_batch};

#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("task table {path} has no column '{column}'")]
    MissingColumn { path: String, column: String },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: ParquetError,
    },
    #[error("output {path} is the input document file")]
    OverwritesInput { path: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of [`filter_jsonl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FilterReport {
    pub requested: usize,
    pub found: usize,
    pub malformed: usize,
}

/// Keep the first `limit` rows of `task_parquet`, write them to `out_parquet`
/// and return their entity ids in row order. Null or unkeyable ids are dropped
/// from the returned list but the rows are still written.
pub fn sample_split(
    task_parquet: &Path,
    limit: usize,
    out_parquet: &Path,
    id_column: &str,
) -> Result<Vec<Key>, SamplingError> {
    let batch = read_batch(task_parquet)?;
    if batch.schema().index_of(id_column).is_err() {
        return Err(SamplingError::MissingColumn {
            path: task_parquet.display().to_string(),
            column: id_column.to_string(),
        });
    }
    if limit >= batch.num_rows() {
        warn!(
            "Requested {} rows but {} only has {}, keeping all",
            limit,
            task_parquet.display(),
            batch.num_rows()
        );
    }
    let head = batch.slice(0, limit.min(batch.num_rows()));

    let write_err = |source: ParquetError| SamplingError::Write {
        path: out_parquet.display().to_string(),
        source,
    };
    let file = File::create(out_parquet).map_err(|source| SamplingError::Io {
        path: out_parquet.display().to_string(),
        source,
    })?;
    let mut writer = ArrowWriter::try_new(file, head.schema(), None).map_err(write_err)?;
    writer.write(&head).map_err(write_err)?;
    writer.close().map_err(write_err)?;

    let table = table_from_batch("tasks", &head)?;
    let col = table.column_index(id_column).ok_or_else(|| SamplingError::MissingColumn {
        path: task_parquet.display().to_string(),
        column: id_column.to_string(),
    })?;
    let ids: Vec<Key> = table.rows().filter_map(|(_, row)| row[col].as_key()).collect();
    debug!("Sampled {} rows with {} ids from {}", head.num_rows(), ids.len(), task_parquet.display());
    Ok(ids)
}

/// Join key of a document's id field. Integral floats match integer ids.
fn json_key(value: &JsonValue) -> Option<Key> {
    match value {
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Some(Key::Int(i)),
            None => n
                .as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| Key::Int(f as i64)),
        },
        JsonValue::String(s) => Some(Key::Str(s.clone())),
        _ => None,
    }
}

/// Copy to `output` the first document in `input` for each id in `ids`, in file
/// order. Lines that are not JSON objects are skipped and counted. Fails
/// without touching either file when `output` resolves to `input`.
pub fn filter_jsonl(
    input: &Path,
    id_field: &str,
    ids: &IndexSet<Key>,
    output: &Path,
) -> Result<FilterReport, SamplingError> {
    let io_err = |path: &Path| {
        let path = path.display().to_string();
        move |source: std::io::Error| SamplingError::Io { path, source }
    };
    let source = input.canonicalize().map_err(io_err(input))?;
    if output.canonicalize().is_ok_and(|target| target == source) {
        return Err(SamplingError::OverwritesInput {
            path: output.display().to_string(),
        });
    }
    let reader = BufReader::new(File::open(input).map_err(io_err(input))?);
    let mut writer = BufWriter::new(File::create(output).map_err(io_err(output))?);

    let mut report = FilterReport {
        requested: ids.len(),
        ..FilterReport::default()
    };
    let mut seen: IndexSet<Key> = IndexSet::with_capacity(ids.len());
    for line in reader.lines() {
        let line = line.map_err(io_err(input))?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(JsonValue::Object(doc)) = serde_json::from_str::<JsonValue>(&line) else {
            report.malformed += 1;
            continue;
        };
        let Some(key) = doc.get(id_field).and_then(json_key) else {
            continue;
        };
        if ids.contains(&key) && seen.insert(key) {
            writeln!(writer, "{line}").map_err(io_err(output))?;
            if seen.len() == ids.len() {
                break;
            }
        }
    }
    writer.flush().map_err(io_err(output))?;

    report.found = seen.len();
    if report.malformed > 0 {
        warn!("Skipped {} malformed lines in {}", report.malformed, input.display());
    }
    info!("Found {} / {} requested documents", report.found, report.requested);
    Ok(report)
}

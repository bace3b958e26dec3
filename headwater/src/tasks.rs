//! Task tables: where entity tasks come from.
//!
//! A point-in-time task file is a Parquet table with one row per
//! `(entity, cutoff, label)`, one file per split (`train.parquet`, `val.parquet`,
//! `test.parquet`). Full-history runs instead take every distinct entity id.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::common::{EntityTask, Key, Table};
use crate::schema::TaskSpec;
use crate::store::{self, StoreError};

pub const DEFAULT_SPLITS: [&str; 3] = ["train", "val", "test"];

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task table '{table}' has no column '{column}'")]
    MissingColumn { table: String, column: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tasks read from one task table, plus how many rows could not become a task.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    pub tasks: Vec<EntityTask>,
    /// Rows with an unusable entity id or an unparseable cutoff.
    pub invalid: usize,
}

impl TaskSet {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn column(table: &Table, name: &str) -> Result<usize, TaskError> {
    table
        .column_index(name)
        .ok_or_else(|| TaskError::MissingColumn {
            table: table.name().to_string(),
            column: name.to_string(),
        })
}

/// Read a task Parquet file.
///
/// A row whose cutoff is missing or unparseable is counted as invalid rather than
/// turned into a full-history task, which would leak future rows.
pub fn load_tasks(path: &Path, spec: &TaskSpec) -> Result<TaskSet, TaskError> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let batch = store::read_batch(path)?;
    let table = store::table_from_batch(&name, &batch)?;
    tasks_from_table(&table, spec)
}

pub fn tasks_from_table(table: &Table, spec: &TaskSpec) -> Result<TaskSet, TaskError> {
    let entity_col = column(table, &spec.entity_column)?;
    let time_col = spec
        .time_column
        .as_deref()
        .map(|c| column(table, c))
        .transpose()?;
    let label_col = spec
        .label_column
        .as_deref()
        .map(|c| column(table, c))
        .transpose()?;

    let mut set = TaskSet {
        tasks: Vec::with_capacity(table.num_rows()),
        invalid: 0,
    };
    for (row, values) in table.rows() {
        let Some(entity_id) = values[entity_col].as_key() else {
            set.invalid += 1;
            continue;
        };
        let cutoff = match time_col {
            Some(c) => match values[c].as_timestamp() {
                Some(t) => Some(t),
                None => {
                    debug!("Task row {} has no usable cutoff: {:?}", row.0, values[c]);
                    set.invalid += 1;
                    continue;
                }
            },
            None => None,
        };
        let label = label_col.map(|c| values[c].clone());
        set.tasks.push(EntityTask {
            entity_id,
            cutoff,
            label,
        });
    }
    if set.invalid > 0 {
        warn!(
            "Task table {}: skipped {} of {} rows with an unusable entity id or cutoff",
            table.name(),
            set.invalid,
            table.num_rows()
        );
    }
    Ok(set)
}

/// One full-history task per distinct entity id, in ascending key order.
pub fn full_history_tasks(table: &Table, primary_key: &str) -> Result<Vec<EntityTask>, TaskError> {
    let col = column(table, primary_key)?;
    let keys: BTreeSet<Key> = table
        .rows()
        .filter_map(|(_, values)| values[col].as_key())
        .collect();
    Ok(keys.into_iter().map(EntityTask::full_history).collect())
}

/// `<tasks_dir>/<split>.parquet`
pub fn split_path(tasks_dir: &Path, split: &str) -> PathBuf {
    tasks_dir.join(format!("{split}.parquet"))
}

/// `<output_dir>/<split>_trees.jsonl`
pub fn split_output_path(output_dir: &Path, split: &str) -> PathBuf {
    output_dir.join(format!("{split}_trees.jsonl"))
}

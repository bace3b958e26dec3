//! Tabular stores: where the index gets its tables from.
//!
//! The engine only needs "give me table X by name". [`ParquetStore`] reads
//! `<dir>/<name>.parquet`; [`MemoryStore`] serves tables built in code (tests,
//! benches, and the per-worker index mode, which reloads from a shared store).

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::*;
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, TimeUnit, TimestampMicrosecondType};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::errors::ParquetError;
use tracing::debug;

use crate::common::{Table, TableError, Timestamp, Value};

pub trait TabularStore: Send + Sync {
    fn load_table(&self, name: &str) -> Result<Arc<Table>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("table '{name}' not found")]
    TableNotFound { name: String },
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("arrow: {0}")]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Table(#[from] TableError),
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: HashMap<String, Arc<Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a table under its own name, replacing any previous one.
    pub fn insert(&mut self, table: Table) {
        self.tables
            .insert(table.name().to_string(), Arc::new(table));
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.insert(table);
        self
    }

    /// Snapshot `names` out of another store.
    pub fn load_from(store: &dyn TabularStore, names: &[&str]) -> Result<Self, StoreError> {
        let mut tables = HashMap::with_capacity(names.len());
        for &name in names {
            tables.insert(name.to_string(), store.load_table(name)?);
        }
        Ok(Self { tables })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

impl TabularStore for MemoryStore {
    fn load_table(&self, name: &str) -> Result<Arc<Table>, StoreError> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound {
                name: name.to_string(),
            })
    }
}

// ============================================================================
// Parquet store
// ============================================================================

const DEFAULT_BATCH_SIZE: usize = 1_000_000;

/// One Parquet file per table in a flat directory.
#[derive(Debug, Clone)]
pub struct ParquetStore {
    dir: PathBuf,
    batch_size: usize,
}

impl ParquetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.parquet"))
    }
}

impl TabularStore for ParquetStore {
    fn load_table(&self, name: &str) -> Result<Arc<Table>, StoreError> {
        let path = self.table_path(name);
        if !path.exists() {
            return Err(StoreError::TableNotFound {
                name: name.to_string(),
            });
        }
        debug!("Loading {}", path.display());
        let batch = read_batch_sized(&path, self.batch_size)?;
        Ok(Arc::new(table_from_batch(name, &batch)?))
    }
}

/// Read a whole Parquet file into one record batch.
pub fn read_batch(path: &Path) -> Result<RecordBatch, StoreError> {
    read_batch_sized(path, DEFAULT_BATCH_SIZE)
}

fn read_batch_sized(path: &Path, batch_size: usize) -> Result<RecordBatch, StoreError> {
    let file = File::open(path).map_err(|source| StoreError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(batch_size)
        .build()?;

    let schema = reader.schema();
    let mut batches: Vec<RecordBatch> = reader.collect::<Result<Vec<_>, _>>()?;
    if batches.len() == 1 {
        if let Some(batch) = batches.pop() {
            return Ok(batch);
        }
    }
    Ok(concat_batches(&schema, &batches)?)
}

/// Convert a record batch into a row-major [`Table`].
pub fn table_from_batch(name: &str, batch: &RecordBatch) -> Result<Table, StoreError> {
    let schema = batch.schema();
    let columns: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();

    let mut column_values: Vec<std::vec::IntoIter<Value>> = Vec::with_capacity(columns.len());
    for array in batch.columns() {
        column_values.push(array_to_values(array.as_ref())?.into_iter());
    }

    let mut table = Table::new(name, columns)?;
    for _ in 0..batch.num_rows() {
        let row: Vec<Value> = column_values
            .iter_mut()
            .map(|col| col.next().unwrap_or_default())
            .collect();
        table.push_row(row)?;
    }
    Ok(table)
}

// ============================================================================
// Arrow -> Value
// ============================================================================

fn cast_to_i64(array: &dyn Array) -> Result<Int64Array, ArrowError> {
    let cast = arrow::compute::cast(array, &DataType::Int64)?;
    Ok(cast.as_primitive::<arrow::datatypes::Int64Type>().clone())
}

fn cast_to_f64(array: &dyn Array) -> Result<Float64Array, ArrowError> {
    let cast = arrow::compute::cast(array, &DataType::Float64)?;
    Ok(cast.as_primitive::<arrow::datatypes::Float64Type>().clone())
}

/// Timezone-aware columns keep their zone so the stored values stay UTC.
fn cast_to_timestamp_us(array: &dyn Array) -> Result<TimestampMicrosecondArray, ArrowError> {
    let tz = match array.data_type() {
        DataType::Timestamp(_, tz) => tz.clone(),
        _ => None,
    };
    let cast = arrow::compute::cast(array, &DataType::Timestamp(TimeUnit::Microsecond, tz))?;
    Ok(cast.as_primitive::<TimestampMicrosecondType>().clone())
}

fn collect<T>(array: &dyn Array, n: usize, mut f: impl FnMut(usize) -> T) -> Vec<Value>
where
    T: Into<Value>,
{
    (0..n)
        .map(|i| {
            if array.is_null(i) {
                Value::Null
            } else {
                f(i).into()
            }
        })
        .collect()
}

fn array_to_values(array: &dyn Array) -> Result<Vec<Value>, ArrowError> {
    let n = array.len();
    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; n],
        DataType::Boolean => {
            let ba = array.as_boolean();
            collect(array, n, |i| ba.value(i))
        }
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => {
            let ia = cast_to_i64(array)?;
            collect(array, n, |i| ia.value(i))
        }
        DataType::UInt64 => {
            let ua = array.as_primitive::<arrow::datatypes::UInt64Type>();
            collect(array, n, |i| {
                let v = ua.value(i);
                i64::try_from(v).map_or_else(|_| Value::Str(v.to_string()), Value::Int)
            })
        }
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => {
            let fa = cast_to_f64(array)?;
            collect(array, n, |i| fa.value(i))
        }
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
            let ta = cast_to_timestamp_us(array)?;
            collect(array, n, |i| Timestamp(ta.value(i)))
        }
        DataType::Utf8 => {
            let sa = array.as_string::<i32>();
            collect(array, n, |i| sa.value(i))
        }
        DataType::LargeUtf8 => {
            let sa = array.as_string::<i64>();
            collect(array, n, |i| sa.value(i))
        }
        DataType::Utf8View => {
            let sa = array.as_string_view();
            collect(array, n, |i| sa.value(i))
        }
        DataType::Dictionary(_, value_type) => {
            let decoded = arrow::compute::cast(array, value_type)?;
            array_to_values(decoded.as_ref())?
        }
        DataType::List(_) => {
            let la = array.as_list::<i32>();
            list_values(array, n, |i| la.value(i))?
        }
        DataType::LargeList(_) => {
            let la = array.as_list::<i64>();
            list_values(array, n, |i| la.value(i))?
        }
        DataType::FixedSizeList(_, _) => {
            let la = array.as_fixed_size_list();
            list_values(array, n, |i| la.value(i))?
        }
        _ => {
            let options = FormatOptions::default();
            let formatter = ArrayFormatter::try_new(array, &options)?;
            collect(array, n, |i| formatter.value(i).to_string())
        }
    };
    Ok(values)
}

fn list_values(
    array: &dyn Array,
    n: usize,
    item: impl Fn(usize) -> ArrayRef,
) -> Result<Vec<Value>, ArrowError> {
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        if array.is_null(i) {
            values.push(Value::Null);
        } else {
            values.push(Value::List(array_to_values(item(i).as_ref())?));
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::datatypes::{Field, Schema};
    use parquet::arrow::ArrowWriter;

    use super::*;
    use crate::common::RowIdx;

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("score", DataType::Float64, true),
            Field::new(
                "at",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                true,
            ),
            Field::new("flag", DataType::Boolean, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
                Arc::new(Float64Array::from(vec![Some(0.5), None])),
                Arc::new(TimestampMillisecondArray::from(vec![Some(1_000), None])),
                Arc::new(BooleanArray::from(vec![Some(true), Some(false)])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn batch_converts_to_rows() {
        let table = table_from_batch("t", &sample_batch()).unwrap();
        assert_eq!(table.columns(), &["id", "name", "score", "at", "flag"]);
        assert_eq!(table.num_rows(), 2);
        assert_eq!(
            table.row(RowIdx(0)),
            &[
                Value::Int(1),
                Value::Str("a".into()),
                Value::Float(0.5),
                Value::Timestamp(Timestamp(1_000_000)),
                Value::Bool(true),
            ]
        );
        assert_eq!(
            table.row(RowIdx(1)),
            &[
                Value::Int(2),
                Value::Null,
                Value::Null,
                Value::Null,
                Value::Bool(false),
            ]
        );
    }

    #[test]
    fn list_columns_become_lists() {
        let list = ListArray::from_iter_primitive::<arrow::datatypes::Int64Type, _, _>(vec![
            Some(vec![Some(1), Some(2)]),
            None,
        ]);
        let values = array_to_values(&list).unwrap();
        assert_eq!(values[0], Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(values[1], Value::Null);
    }

    #[test]
    fn dictionary_columns_decode() {
        let dict: DictionaryArray<arrow::datatypes::Int32Type> =
            vec!["x", "y", "x"].into_iter().collect();
        let values = array_to_values(&dict).unwrap();
        assert_eq!(
            values,
            vec![Value::from("x"), Value::from("y"), Value::from("x")]
        );
    }

    #[test]
    fn parquet_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let batch = sample_batch();
        let file = File::create(dir.path().join("people.parquet")).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let store = ParquetStore::new(dir.path());
        let table = store.load_table("people").unwrap();
        assert_eq!(table.name(), "people");
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.value(RowIdx(0), 0), &Value::Int(1));

        assert!(matches!(
            store.load_table("missing"),
            Err(StoreError::TableNotFound { .. })
        ));
    }

    #[test]
    fn memory_store_serves_inserted_tables() {
        let table = Table::from_rows("a", ["x"], vec![vec![Value::Int(1)]]).unwrap();
        let store = MemoryStore::new().with_table(table);
        assert_eq!(store.load_table("a").unwrap().num_rows(), 1);
        let copy = MemoryStore::load_from(&store, &["a"]).unwrap();
        assert_eq!(copy.names().collect::<Vec<_>>(), vec!["a"]);
        assert!(store.load_table("b").is_err());
    }
}

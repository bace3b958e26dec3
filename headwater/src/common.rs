//! Common types used throughout the engine: cell values, join keys, timestamps,
//! in-memory tables and entity tasks.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Index NewTypes
// ============================================================================

/// Row index local to one table.
/// Uses `u32` like the rest of the index, supporting up to ~4B rows per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowIdx(pub u32);

impl RowIdx {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Position of a relation in the schema's `relations` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationIdx(pub u32);

impl RelationIdx {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Formats accepted when a timestamp arrives as text, tried in order after RFC 3339.
const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Display format for timestamps, matching the `YYYY-MM-DD HH:MM:SS` convention of
/// the materialized documents.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// An instant stored as **epoch microseconds**, the same resolution Arrow's
/// `TimestampMicrosecondArray` uses.
///
/// Integer-valued time columns are taken as-is, so a dataset whose event "time" is
/// a plain ordinal (a year, a sequence number) still orders correctly as long as
/// cutoffs are given in the same unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const fn from_micros(us: i64) -> Self {
        Self(us)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Parse a textual timestamp. Returns `None` for anything unparseable.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(Self(dt.timestamp_micros()));
        }
        for fmt in NAIVE_DATETIME_FORMATS {
            if let Ok(ndt) = NaiveDateTime::parse_from_str(text, fmt) {
                return Some(Self(ndt.and_utc().timestamp_micros()));
            }
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|ndt| Self(ndt.and_utc().timestamp_micros()))
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_micros(self.0)
    }

    /// Render with a chrono format string; out-of-range instants fall back to the
    /// raw microsecond count.
    pub fn format(self, fmt: &str) -> String {
        match self.to_datetime() {
            Some(dt) => dt.format(fmt).to_string(),
            None => self.0.to_string(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(DEFAULT_TIMESTAMP_FORMAT))
    }
}

// ============================================================================
// Values and keys
// ============================================================================

/// One cell of a table.
///
/// This is the engine's own representation; converting it to JSON is the job of a
/// [`ScalarNormalizer`](crate::normalize::ScalarNormalizer).
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(Timestamp),
    List(Vec<Value>),
}

impl Value {
    /// Null, or a float that is NaN (the columnar convention for a missing number).
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Interpret this value as a join key. See [`Key`] for the conversion rules.
    pub fn as_key(&self) -> Option<Key> {
        match self {
            Value::Int(i) => Some(Key::Int(*i)),
            Value::Str(s) => Some(Key::Str(s.clone())),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => {
                // Within i64 range the cast is exact for integral floats.
                if *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    Some(Key::Int(*f as i64))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Interpret this value as an instant on the time axis.
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Int(i) => Some(Timestamp(*i)),
            // Integer columns come back as floats once they hold a missing value.
            Value::Float(f)
                if f.is_finite()
                    && f.fract() == 0.0
                    && *f >= i64::MIN as f64
                    && *f < i64::MAX as f64 =>
            {
                Some(Timestamp(*f as i64))
            }
            Value::Str(s) => Timestamp::parse(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A hashable join key.
///
/// Integers and strings are keys as-is. Finite integral floats become `Int`, since
/// id columns that contain missing values are routinely widened to float by the
/// tools that write them. Everything else (fractional floats, booleans,
/// timestamps, lists) cannot take part in a join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::Int(*i),
            Key::Str(s) => Value::Str(s.clone()),
        }
    }

    /// Parse a key given on a command line: integers win, anything else is a string.
    pub fn parse_lenient(text: &str) -> Self {
        match text.trim().parse::<i64>() {
            Ok(i) => Key::Int(i),
            Err(_) => Key::Str(text.to_string()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Int(v as i64)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v)
    }
}

// ============================================================================
// Tables
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("table '{table}': row {row} has {found} values, expected {expected}")]
    WidthMismatch {
        table: String,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("table '{table}': duplicate column '{column}'")]
    DuplicateColumn { table: String, column: String },
    #[error("table '{table}' exceeds u32::MAX rows")]
    TooManyRows { table: String },
}

/// A named, ordered sequence of rows sharing one column set.
///
/// Rows are immutable once the table is built; the index and materializer only
/// ever hold `&Table`/`Arc<Table>` and refer to rows by [`RowIdx`].
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    columns: Vec<String>,
    column_lookup: HashMap<String, usize>,
    rows: Vec<Box<[Value]>>,
}

impl Table {
    /// Create an empty table with the given columns.
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Result<Self, TableError> {
        let name = name.into();
        let mut column_lookup = HashMap::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            if column_lookup.insert(col.clone(), i).is_some() {
                return Err(TableError::DuplicateColumn {
                    table: name,
                    column: col.clone(),
                });
            }
        }
        Ok(Self {
            name,
            columns,
            column_lookup,
            rows: Vec::new(),
        })
    }

    /// Create a table from row-major data.
    pub fn from_rows<S: Into<String>>(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<Value>>,
    ) -> Result<Self, TableError> {
        let mut table = Self::new(name, columns.into_iter().map(Into::into).collect())?;
        table.rows.reserve(rows.len());
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Append one row. Its width must match the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<RowIdx, TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::WidthMismatch {
                table: self.name.clone(),
                row: self.rows.len(),
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        let idx = u32::try_from(self.rows.len()).map_err(|_| TableError::TooManyRows {
            table: self.name.clone(),
        })?;
        self.rows.push(row.into_boxed_slice());
        Ok(RowIdx(idx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.column_lookup.get(column).copied()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_lookup.contains_key(column)
    }

    /// All values of one row, in column order.
    pub fn row(&self, row: RowIdx) -> &[Value] {
        &self.rows[row.as_usize()]
    }

    pub fn value(&self, row: RowIdx, col: usize) -> &Value {
        &self.rows[row.as_usize()][col]
    }

    /// Iterate rows in table order.
    pub fn rows(&self) -> impl Iterator<Item = (RowIdx, &[Value])> + '_ {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, r)| (RowIdx(i as u32), r.as_ref()))
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// One unit of work for the coordinator: materialize `entity_id`, optionally as of
/// `cutoff` and carrying an opaque `label`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTask {
    pub entity_id: Key,
    pub cutoff: Option<Timestamp>,
    pub label: Option<Value>,
}

impl EntityTask {
    /// A full-history task: no cutoff, no label.
    pub fn full_history(entity_id: impl Into<Key>) -> Self {
        Self {
            entity_id: entity_id.into(),
            cutoff: None,
            label: None,
        }
    }

    /// A point-in-time task observed at `cutoff`.
    pub fn at(entity_id: impl Into<Key>, cutoff: Timestamp) -> Self {
        Self {
            entity_id: entity_id.into(),
            cutoff: Some(cutoff),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<Value>) -> Self {
        self.label = Some(label.into());
        self
    }
}

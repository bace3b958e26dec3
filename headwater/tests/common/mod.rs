//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use serde_json::Value as JsonValue;

use headwater::common::{EntityTask, Table, Timestamp, Value};
use headwater::index::TemporalIndex;
use headwater::materialize::Materializer;
use headwater::normalize::DefaultNormalizer;
use headwater::schema::{RelationSchema, RelationSpec};
use headwater::store::MemoryStore;

pub fn t(n: i64) -> Timestamp {
    Timestamp(n)
}

fn ts(n: i64) -> Value {
    Value::Timestamp(t(n))
}

/// Load a schema from tests/test_data.
pub fn load_schema(name: &str) -> RelationSchema {
    let path = format!("tests/test_data/{}", name);
    RelationSchema::load(Path::new(&path))
        .unwrap_or_else(|e| panic!("Failed to load schema {}: {}", name, e))
}

// =============================================================================
// Event dataset
// =============================================================================
//
// users 1..=3. User 1 created events 100 (t1), 101 (t2), 102 (t3) and attended
// its own event 101 plus 200 (t2) and 201 (no time). User 2 created 200 (t2) and
// 201 (no time). User 3 created nothing. User 1 lists itself as a friend.

pub fn event_schema() -> RelationSchema {
    load_schema("rel_event.json")
}

pub fn event_store() -> MemoryStore {
    MemoryStore::new()
        .with_table(
            Table::from_rows(
                "users",
                ["user_id", "locale"],
                vec![
                    vec![1.into(), "en".into()],
                    vec![2.into(), "fr".into()],
                    vec![3.into(), "de".into()],
                ],
            )
            .unwrap(),
        )
        .with_table(
            Table::from_rows(
                "events",
                ["event_id", "user_id", "start_time", "city"],
                vec![
                    vec![100.into(), 1.into(), ts(1), "a".into()],
                    vec![101.into(), 1.into(), ts(2), "b".into()],
                    vec![102.into(), 1.into(), ts(3), "c".into()],
                    vec![200.into(), 2.into(), ts(2), "d".into()],
                    vec![201.into(), 2.into(), Value::Null, "e".into()],
                ],
            )
            .unwrap(),
        )
        .with_table(
            Table::from_rows(
                "event_attendees",
                ["event", "user_id", "status", "start_time"],
                vec![
                    vec![100.into(), 2.into(), "yes".into(), ts(1)],
                    vec![101.into(), 1.into(), "yes".into(), ts(2)],
                    vec![200.into(), 1.into(), "yes".into(), ts(2)],
                    vec![201.into(), 1.into(), "maybe".into(), Value::Null],
                    vec![200.into(), 3.into(), "no".into(), ts(2)],
                    vec![102.into(), 3.into(), "yes".into(), ts(3)],
                ],
            )
            .unwrap(),
        )
        .with_table(
            Table::from_rows(
                "user_friends",
                ["user", "friend"],
                vec![
                    vec![1.into(), 1.into()],
                    vec![1.into(), 2.into()],
                    vec![1.into(), 3.into()],
                    vec![2.into(), 1.into()],
                ],
            )
            .unwrap(),
        )
}

pub fn event_index() -> TemporalIndex {
    TemporalIndex::build(&event_store(), Arc::new(event_schema())).unwrap()
}

// =============================================================================
// Trial dataset (many-to-many)
// =============================================================================

pub fn trial_store() -> MemoryStore {
    MemoryStore::new()
        .with_table(
            Table::from_rows("studies", ["nct_id", "phase"], vec![
                vec![1.into(), "II".into()],
                vec![2.into(), "III".into()],
            ])
            .unwrap(),
        )
        .with_table(
            Table::from_rows("sponsors", ["sponsor_id", "name", "agency_class"], vec![
                vec![10.into(), "acme".into(), "industry".into()],
                vec![11.into(), "globex".into(), "nih".into()],
            ])
            .unwrap(),
        )
        .with_table(
            Table::from_rows("sponsors_studies", ["nct_id", "sponsor_id", "lead_or_collaborator"], vec![
                vec![1.into(), 10.into(), "lead".into()],
                vec![1.into(), 11.into(), "collaborator".into()],
            ])
            .unwrap(),
        )
}

pub fn trial_schema() -> RelationSchema {
    RelationSchema::new(
        "rel-trial-mini",
        "studies",
        "nct_id",
        vec![RelationSpec::many_to_many(
            "studies",
            "sponsors_studies",
            "sponsors",
            "nct_id",
            "sponsor_id",
            "sponsors",
        )],
    )
}

// =============================================================================
// Helpers
// =============================================================================

pub fn materialize(index: &TemporalIndex, task: &EntityTask) -> Option<JsonValue> {
    let normalizer = DefaultNormalizer::default();
    Materializer::new(index, &normalizer)
        .materialize(task)
        .unwrap()
        .map(JsonValue::Object)
}

/// The `field` values of every element of `doc[array]`.
pub fn ids(doc: &JsonValue, array: &str, field: &str) -> Vec<i64> {
    doc[array]
        .as_array()
        .unwrap_or_else(|| panic!("{} is not an array: {}", array, doc[array]))
        .iter()
        .map(|item| item[field].as_i64().unwrap())
        .collect()
}

fn write_batch(dir: &Path, name: &str, columns: Vec<(&str, ArrayRef)>) {
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|(n, a)| Field::new(*n, a.data_type().clone(), true))
            .collect::<Vec<_>>(),
    ));
    let batch = RecordBatch::try_new(
        schema.clone(),
        columns.into_iter().map(|(_, a)| a).collect(),
    )
    .unwrap();
    let file = File::create(dir.join(format!("{name}.parquet"))).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

fn int64(values: &[i64]) -> ArrayRef {
    Arc::new(Int64Array::from(values.to_vec()))
}

fn strings(values: &[&str]) -> ArrayRef {
    Arc::new(StringArray::from(values.to_vec()))
}

fn times(values: &[Option<i64>]) -> ArrayRef {
    Arc::new(TimestampMicrosecondArray::from(values.to_vec()))
}

/// The event dataset as Parquet files, one per table.
pub fn write_event_db(dir: &Path) {
    write_batch(dir, "users", vec![
        ("user_id", int64(&[1, 2, 3])),
        ("locale", strings(&["en", "fr", "de"])),
    ]);
    write_batch(dir, "events", vec![
        ("event_id", int64(&[100, 101, 102, 200, 201])),
        ("user_id", int64(&[1, 1, 1, 2, 2])),
        ("start_time", times(&[Some(1), Some(2), Some(3), Some(2), None])),
        ("city", strings(&["a", "b", "c", "d", "e"])),
    ]);
    write_batch(dir, "event_attendees", vec![
        ("event", int64(&[100, 101, 200, 201, 200, 102])),
        ("user_id", int64(&[2, 1, 1, 1, 3, 3])),
        ("status", strings(&["yes", "yes", "yes", "maybe", "no", "yes"])),
        ("start_time", times(&[Some(1), Some(2), Some(2), None, Some(2), Some(3)])),
    ]);
    write_batch(dir, "user_friends", vec![
        ("user", int64(&[1, 1, 1, 2])),
        ("friend", int64(&[1, 2, 3, 1])),
    ]);
}

/// A task table for the event dataset.
pub fn write_event_tasks(dir: &Path, split: &str, rows: &[(i64, Option<i64>, i64)]) {
    write_batch(dir, split, vec![
        ("user_id", int64(&rows.iter().map(|r| r.0).collect::<Vec<_>>())),
        ("timestamp", times(&rows.iter().map(|r| r.1).collect::<Vec<_>>())),
        ("target", int64(&rows.iter().map(|r| r.2).collect::<Vec<_>>())),
    ]);
}

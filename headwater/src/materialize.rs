//! Tree materializer: one entity task in, one nested JSON document out.
//!
//! The document root carries the entity row's emitted columns, then the label and
//! cutoff (when the task has them), then one field per relation declared on the
//! entity table. Child documents are built the same way, recursively, so a search
//! event embeds the results it displayed and each result embeds its ad.
//!
//! Field shapes never depend on the data:
//!
//! | kind           | field value                                        |
//! |----------------|----------------------------------------------------|
//! | `one_to_many`  | array of child documents, possibly empty           |
//! | `many_to_many` | array of child documents, possibly empty           |
//! | `lookup`       | one child document, `{}` for a null/dangling key   |
//! | `self_group`   | array of `{engagement, peer}` peer references      |
//!
//! The cutoff is applied to every relation that declares a time column, at any
//! depth. Relations without one (static reference data) are never filtered.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::common::{EntityTask, Key, RelationIdx, RowIdx, Table, Timestamp, Value};
use crate::index::TemporalIndex;
use crate::normalize::ScalarNormalizer;
use crate::schema::{RelationKind, RelationSpec};

pub type Document = serde_json::Map<String, JsonValue>;

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("{table}.{column} at row {row} holds {value}, which cannot be used as a join key")]
    InvalidKey {
        table: String,
        column: String,
        row: u32,
        value: String,
    },
    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Builds documents from a shared index. Cheap to construct; one per worker.
pub struct Materializer<'a> {
    index: &'a TemporalIndex,
    normalizer: &'a dyn ScalarNormalizer,
}

impl<'a> Materializer<'a> {
    pub fn new(index: &'a TemporalIndex, normalizer: &'a dyn ScalarNormalizer) -> Self {
        Self { index, normalizer }
    }

    /// `Ok(None)` when the entity does not exist; the caller skips the task.
    pub fn materialize(&self, task: &EntityTask) -> Result<Option<Document>, MaterializeError> {
        let Some(row) = self.index.entity_row(&task.entity_id) else {
            return Ok(None);
        };
        let schema = self.index.schema();
        let entity = self.index.entity_table();

        let mut doc = self.row_document(entity, &schema.entity.table, row);
        if let Some(label) = &task.label {
            doc.insert(schema.label_field.clone(), self.normalizer.normalize(label));
        }
        if let Some(cutoff) = task.cutoff {
            doc.insert(
                schema.timestamp_field.clone(),
                self.normalizer.normalize(&Value::Timestamp(cutoff)),
            );
        }
        self.attach_relations(&mut doc, entity, &schema.entity.table, row, task.cutoff, 1)?;
        Ok(Some(doc))
    }

    /// The document serialized as a single JSON line (no trailing newline).
    pub fn materialize_line(&self, task: &EntityTask) -> Result<Option<String>, MaterializeError> {
        match self.materialize(task)? {
            Some(doc) => Ok(Some(serde_json::to_string(&doc)?)),
            None => Ok(None),
        }
    }

    fn row_document(&self, table: &Table, table_name: &str, row: RowIdx) -> Document {
        let columns = self.index.emitted_columns(table_name);
        let mut doc = Document::new();
        for &c in columns {
            doc.insert(
                table.columns()[c].clone(),
                self.normalizer.normalize(table.value(row, c)),
            );
        }
        doc
    }

    fn attach_relations(
        &self,
        doc: &mut Document,
        table: &Table,
        table_name: &str,
        row: RowIdx,
        cutoff: Option<Timestamp>,
        depth: usize,
    ) -> Result<(), MaterializeError> {
        let schema = self.index.schema();
        for (idx, rel) in schema.relations_of(table_name) {
            let value = if depth > schema.max_depth {
                empty_field(rel.kind)
            } else {
                let key = self.parent_key(idx, rel, table, row)?;
                match (rel.kind, key) {
                    (_, None) => empty_field(rel.kind),
                    (RelationKind::OneToMany | RelationKind::ManyToMany, Some(key)) => {
                        let child = self.index.relation_table(idx);
                        let mut items = Vec::new();
                        for child_row in self.index.query(idx, &key, cutoff) {
                            let mut child_doc = self.row_document(child, &rel.child_table, child_row);
                            self.attach_relations(
                                &mut child_doc,
                                child,
                                &rel.child_table,
                                child_row,
                                cutoff,
                                depth + 1,
                            )?;
                            items.push(JsonValue::Object(child_doc));
                        }
                        JsonValue::Array(items)
                    }
                    (RelationKind::Lookup, Some(key)) => match self.index.lookup(idx, &key) {
                        Some(child_row) => {
                            let child = self.index.relation_table(idx);
                            let mut child_doc = self.row_document(child, &rel.child_table, child_row);
                            self.attach_relations(
                                &mut child_doc,
                                child,
                                &rel.child_table,
                                child_row,
                                cutoff,
                                depth + 1,
                            )?;
                            JsonValue::Object(child_doc)
                        }
                        None => JsonValue::Object(Document::new()),
                    },
                    (RelationKind::SelfGroup, Some(key)) => {
                        self.peer_references(idx, rel, table_name, &key, cutoff)?
                    }
                }
            };
            doc.insert(rel.output_field.clone(), value);
        }
        Ok(())
    }

    /// Join key of the parent row: `None` for null, an error for unusable values.
    fn parent_key(
        &self,
        idx: RelationIdx,
        rel: &RelationSpec,
        table: &Table,
        row: RowIdx,
    ) -> Result<Option<Key>, MaterializeError> {
        let value = table.value(row, self.index.parent_column(idx));
        if value.is_null() {
            return Ok(None);
        }
        match value.as_key() {
            Some(key) => Ok(Some(key)),
            None => Err(MaterializeError::InvalidKey {
                table: rel.parent_table.clone(),
                column: rel.parent_key.clone(),
                row: row.0,
                value: format!("{value:?}"),
            }),
        }
    }

    /// Peers reached through engagement records, minus the parent itself and the
    /// ids the parent already embeds through `exclude_field`.
    fn peer_references(
        &self,
        idx: RelationIdx,
        rel: &RelationSpec,
        table_name: &str,
        key: &Key,
        cutoff: Option<Timestamp>,
    ) -> Result<JsonValue, MaterializeError> {
        let schema = self.index.schema();
        let peer_table = self.index.relation_table(idx);

        let mut excluded: Vec<Key> = Vec::new();
        if rel.child_table == table_name {
            excluded.push(key.clone());
        }
        if let Some(owner) = rel
            .exclude_field
            .as_deref()
            .and_then(|field| schema.find_relation(table_name, field))
        {
            let owned_table = self.index.relation_table(owner);
            if let Some(peer_col) = owned_table.column_index(&rel.child_key) {
                excluded.extend(
                    self.index
                        .query(owner, key, cutoff)
                        .into_iter()
                        .filter_map(|r| owned_table.value(r, peer_col).as_key()),
                );
            }
        }

        // Peer key -> (merged engagement details, sources already merged).
        let mut peers: IndexMap<Key, (Document, Vec<usize>)> = IndexMap::new();
        for engagement in self.index.engagements(idx, key, cutoff) {
            if excluded.contains(&engagement.peer) {
                continue;
            }
            let (details, merged) = peers.entry(engagement.peer).or_default();
            if merged.contains(&engagement.source) {
                continue;
            }
            merged.push(engagement.source);
            let Some(source_table) = self.index.engagement_table(idx, engagement.source) else {
                continue;
            };
            let source_name = &rel.engagements[engagement.source].table;
            details.extend(self.row_document(source_table, source_name, engagement.row));
        }

        let items = peers
            .into_iter()
            .map(|(peer, (details, _))| {
                let peer_doc = match self.index.lookup(idx, &peer) {
                    Some(peer_row) => self.row_document(peer_table, &rel.child_table, peer_row),
                    None => Document::new(),
                };
                let mut reference = Document::new();
                reference.insert(rel.engagement_field().to_string(), JsonValue::Object(details));
                reference.insert(rel.peer_field().to_string(), JsonValue::Object(peer_doc));
                JsonValue::Object(reference)
            })
            .collect();
        Ok(JsonValue::Array(items))
    }
}

fn empty_field(kind: RelationKind) -> JsonValue {
    match kind {
        RelationKind::Lookup => JsonValue::Object(Document::new()),
        _ => JsonValue::Array(Vec::new()),
    }
}

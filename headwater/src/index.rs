//! Temporal index: per-relation partitions of child rows, keyed by the parent's
//! join key and sorted by event time.
//!
//! ## Partitions
//!
//! Every grouping key owns a partition with two views of the same rows:
//!
//! - `timed`: rows whose time column parsed, sorted **newest first** (ties keep
//!   table order). A cutoff query is one binary search: everything strictly before
//!   the cutoff is a suffix of this vector, already in output order.
//! - `all`: every row including untimed ones, in table order. Full-history queries
//!   and queries on relations without a time column read this.
//!
//! Rows with a null or unparseable time therefore never appear under a cutoff, but
//! still appear in full history.
//!
//! For MANY_TO_MANY relations "table order" is link-table order: child rows are
//! inner-joined through the link table and grouped by the link's parent column.
//!
//! The index is immutable once built. Tables are held by `Arc`, never copied, so a
//! single index can be shared read-only across worker threads.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::common::{Key, RelationIdx, RowIdx, Table, Timestamp};
use crate::schema::{RelationKind, RelationSchema, RelationSpec, SchemaError};
use crate::store::{StoreError, TabularStore};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("table '{table}' is referenced by the schema but missing from the store")]
    MissingTable { table: String },
    #[error("table '{table}' has no column '{column}' ({context})")]
    UnknownColumn {
        table: String,
        column: String,
        context: String,
    },
    #[error("output field '{field}' on table '{table}' shadows a column of the same name")]
    FieldShadowsColumn { table: String, field: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ============================================================================
// Partitions
// ============================================================================

/// Child rows for one grouping key.
#[derive(Debug, Clone, Default)]
struct Partition {
    timed: Vec<(Timestamp, RowIdx)>,
    all: Vec<RowIdx>,
}

impl Partition {
    fn select(&self, temporal: bool, cutoff: Option<Timestamp>) -> Vec<RowIdx> {
        match cutoff {
            Some(cutoff) if temporal => {
                let start = self.timed.partition_point(|(t, _)| *t >= cutoff);
                self.timed[start..].iter().map(|&(_, row)| row).collect()
            }
            _ => self.all.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub relations: usize,
    pub groups: usize,
    pub timed_rows: usize,
    pub untimed_rows: usize,
    /// Rows dropped because a later row repeated an already-indexed primary key.
    pub duplicate_keys: usize,
    /// Rows whose join key was non-null but could not be used as a key.
    pub unkeyed_rows: usize,
}

impl IndexStats {
    fn merge(&mut self, other: IndexStats) {
        self.relations += other.relations;
        self.groups += other.groups;
        self.timed_rows += other.timed_rows;
        self.untimed_rows += other.untimed_rows;
        self.duplicate_keys += other.duplicate_keys;
        self.unkeyed_rows += other.unkeyed_rows;
    }
}

impl fmt::Display for IndexStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} relations, {} groups, {} timed rows, {} untimed rows, {} duplicate keys, {} unkeyed rows",
            self.relations,
            self.groups,
            self.timed_rows,
            self.untimed_rows,
            self.duplicate_keys,
            self.unkeyed_rows
        )
    }
}

/// Accumulates rows in table order, then sorts the timed view once.
#[derive(Default)]
struct PartitionBuilder {
    groups: HashMap<Key, Partition>,
    stats: IndexStats,
}

impl PartitionBuilder {
    fn push(&mut self, key: Key, time: Option<Timestamp>, row: RowIdx) {
        let partition = self.groups.entry(key).or_default();
        partition.all.push(row);
        match time {
            Some(t) => {
                partition.timed.push((t, row));
                self.stats.timed_rows += 1;
            }
            None => self.stats.untimed_rows += 1,
        }
    }

    fn finish(mut self) -> (HashMap<Key, Partition>, IndexStats) {
        for partition in self.groups.values_mut() {
            // Stable: equal timestamps keep insertion (table) order.
            partition.timed.sort_by_key(|&(t, _)| Reverse(t));
        }
        self.stats.groups = self.groups.len();
        (self.groups, self.stats)
    }
}

/// Key of `table[row][col]`: `Ok(None)` for null, `Err(())` for a non-null value
/// that cannot be a key.
fn key_at(table: &Table, row: RowIdx, col: usize) -> Result<Option<Key>, ()> {
    let value = table.value(row, col);
    if value.is_null() {
        return Ok(None);
    }
    value.as_key().map(Some).ok_or(())
}

fn group_by(
    table: &Table,
    key_col: usize,
    time_col: Option<usize>,
) -> (HashMap<Key, Partition>, IndexStats) {
    let mut builder = PartitionBuilder::default();
    for (row, values) in table.rows() {
        match key_at(table, row, key_col) {
            Ok(Some(key)) => {
                let time = time_col.and_then(|c| values[c].as_timestamp());
                builder.push(key, time, row);
            }
            Ok(None) => {}
            Err(()) => builder.stats.unkeyed_rows += 1,
        }
    }
    builder.finish()
}

/// Primary-key map; the first row wins on duplicates.
fn key_map(table: &Table, key_col: usize) -> (HashMap<Key, RowIdx>, IndexStats) {
    let mut map = HashMap::with_capacity(table.num_rows());
    let mut stats = IndexStats::default();
    for (row, _) in table.rows() {
        match key_at(table, row, key_col) {
            Ok(Some(key)) => {
                if map.contains_key(&key) {
                    stats.duplicate_keys += 1;
                } else {
                    map.insert(key, row);
                }
            }
            Ok(None) => {}
            Err(()) => stats.unkeyed_rows += 1,
        }
    }
    (map, stats)
}

// ============================================================================
// Relations
// ============================================================================

#[derive(Debug)]
struct EngagementIndex {
    table: Arc<Table>,
    peer_col: usize,
    temporal: bool,
    groups: HashMap<Key, Partition>,
}

#[derive(Debug)]
enum RelationBody {
    Grouped {
        temporal: bool,
        groups: HashMap<Key, Partition>,
    },
    Lookup {
        rows: HashMap<Key, RowIdx>,
    },
    SelfGroup {
        peers: HashMap<Key, RowIdx>,
        sources: Vec<EngagementIndex>,
    },
}

#[derive(Debug)]
struct RelationIndex {
    parent_col: usize,
    child: Arc<Table>,
    body: RelationBody,
}

/// One engagement record that survived the cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Engagement {
    /// Position of the source in the relation's `engagements` list.
    pub source: usize,
    pub row: RowIdx,
    pub peer: Key,
}

// ============================================================================
// TemporalIndex
// ============================================================================

#[derive(Debug)]
pub struct TemporalIndex {
    schema: Arc<RelationSchema>,
    entity: Arc<Table>,
    entity_rows: HashMap<Key, RowIdx>,
    relations: Vec<RelationIndex>,
    layouts: HashMap<String, Vec<usize>>,
    stats: IndexStats,
}

fn column(table: &Table, column: &str, context: &str) -> Result<usize, BuildError> {
    table
        .column_index(column)
        .ok_or_else(|| BuildError::UnknownColumn {
            table: table.name().to_string(),
            column: column.to_string(),
            context: context.to_string(),
        })
}

fn get_table(tables: &HashMap<String, Arc<Table>>, name: &str) -> Result<Arc<Table>, BuildError> {
    tables.get(name).cloned().ok_or_else(|| BuildError::MissingTable {
        table: name.to_string(),
    })
}

fn optional_column(
    table: &Table,
    name: Option<&str>,
    context: &str,
) -> Result<Option<usize>, BuildError> {
    name.map(|c| column(table, c, context)).transpose()
}

impl TemporalIndex {
    /// Validate the schema, load each referenced table once and partition every
    /// relation. Any missing table or column fails the whole build.
    pub fn build(
        store: &dyn TabularStore,
        schema: Arc<RelationSchema>,
    ) -> Result<Self, BuildError> {
        schema.validate()?;

        let mut tables: HashMap<String, Arc<Table>> = HashMap::new();
        for name in schema.required_tables() {
            let table = store.load_table(name).map_err(|e| match e {
                StoreError::TableNotFound { .. } => BuildError::MissingTable {
                    table: name.to_string(),
                },
                other => BuildError::Store(other),
            })?;
            debug!("Loaded table {} ({} rows)", name, table.num_rows());
            tables.insert(name.to_string(), table);
        }

        let layouts = Self::build_layouts(&schema, &tables)?;
        for rel in &schema.relations {
            let emitted = layouts.get(&rel.parent_table).map(Vec::as_slice).unwrap_or_default();
            let parent = get_table(&tables, &rel.parent_table)?;
            if emitted
                .iter()
                .any(|&c| parent.columns()[c] == rel.output_field)
            {
                return Err(BuildError::FieldShadowsColumn {
                    table: rel.parent_table.clone(),
                    field: rel.output_field.clone(),
                });
            }
        }

        let entity = get_table(&tables, &schema.entity.table)?;
        let entity_pk = column(&entity, &schema.entity.primary_key, "entity primary key")?;
        for field in [&schema.label_field, &schema.timestamp_field] {
            let emitted = layouts.get(&schema.entity.table).map(Vec::as_slice).unwrap_or_default();
            if emitted.iter().any(|&c| &entity.columns()[c] == field) {
                return Err(BuildError::FieldShadowsColumn {
                    table: schema.entity.table.clone(),
                    field: field.clone(),
                });
            }
        }
        let (entity_rows, mut stats) = key_map(&entity, entity_pk);
        if stats.duplicate_keys > 0 {
            warn!(
                "Entity table {} has {} duplicate primary keys; keeping the first row of each",
                entity.name(),
                stats.duplicate_keys
            );
        }

        let built: Vec<(RelationIndex, IndexStats)> = schema
            .relations
            .par_iter()
            .map(|rel| Self::build_relation(rel, &tables))
            .collect::<Result<_, _>>()?;

        let mut relations = Vec::with_capacity(built.len());
        for (rel, (index, rel_stats)) in schema.relations.iter().zip(built) {
            if rel_stats.duplicate_keys > 0 {
                warn!(
                    "Relation {}: {} duplicate keys in {}; keeping the first row of each",
                    rel.output_field, rel_stats.duplicate_keys, rel.child_table
                );
            }
            if rel_stats.unkeyed_rows > 0 {
                warn!(
                    "Relation {}: {} rows with unusable join keys were not indexed",
                    rel.output_field, rel_stats.unkeyed_rows
                );
            }
            stats.merge(rel_stats);
            relations.push(index);
        }

        info!("Temporal index for {}: {}", schema.name, stats);

        Ok(Self {
            schema,
            entity,
            entity_rows,
            relations,
            layouts,
            stats,
        })
    }

    fn build_layouts(
        schema: &RelationSchema,
        tables: &HashMap<String, Arc<Table>>,
    ) -> Result<HashMap<String, Vec<usize>>, BuildError> {
        let mut layouts = HashMap::with_capacity(tables.len());
        for (name, table) in tables {
            let columns = match schema.projection(name) {
                Some(projection) => projection
                    .iter()
                    .map(|c| column(table, c, "output projection"))
                    .collect::<Result<Vec<_>, _>>()?,
                None => (0..table.num_columns()).collect(),
            };
            layouts.insert(name.clone(), columns);
        }
        for name in schema.tables.keys() {
            if !tables.contains_key(name) {
                warn!("Projection declared for table {name}, which no relation references");
            }
        }
        Ok(layouts)
    }

    fn build_relation(
        rel: &RelationSpec,
        tables: &HashMap<String, Arc<Table>>,
    ) -> Result<(RelationIndex, IndexStats), BuildError> {
        let parent = get_table(tables, &rel.parent_table)?;
        let child = get_table(tables, &rel.child_table)?;
        let parent_col = column(&parent, &rel.parent_key, "parent_key")?;
        let child_col = column(&child, &rel.child_key, "child_key")?;
        let time_col = optional_column(&child, rel.time_column.as_deref(), "time_column")?;

        let (body, mut stats) = match rel.kind {
            RelationKind::OneToMany => {
                let (groups, stats) = group_by(&child, child_col, time_col);
                let body = RelationBody::Grouped {
                    temporal: time_col.is_some(),
                    groups,
                };
                (body, stats)
            }
            RelationKind::ManyToMany => {
                let link_name = rel.link_table.as_deref().ok_or_else(|| {
                    BuildError::Schema(SchemaError::MissingField {
                        relation: rel.output_field.clone(),
                        field: "link_table",
                    })
                })?;
                let link = get_table(tables, link_name)?;
                let link_parent = column(&link, rel.link_parent_key(), "link_parent_key")?;
                let link_child = column(&link, rel.link_child_key(), "link_child_key")?;

                let mut by_child: HashMap<Key, Vec<RowIdx>> = HashMap::new();
                let mut stats = IndexStats::default();
                for (row, _) in child.rows() {
                    match key_at(&child, row, child_col) {
                        Ok(Some(key)) => by_child.entry(key).or_default().push(row),
                        Ok(None) => {}
                        Err(()) => stats.unkeyed_rows += 1,
                    }
                }

                let mut builder = PartitionBuilder::default();
                for (link_row, _) in link.rows() {
                    let (parent_key, child_key) = match (
                        key_at(&link, link_row, link_parent),
                        key_at(&link, link_row, link_child),
                    ) {
                        (Ok(Some(p)), Ok(Some(c))) => (p, c),
                        (Err(()), _) | (_, Err(())) => {
                            builder.stats.unkeyed_rows += 1;
                            continue;
                        }
                        _ => continue,
                    };
                    // Inner join: dangling link rows contribute nothing.
                    let Some(child_rows) = by_child.get(&child_key) else {
                        continue;
                    };
                    for &row in child_rows {
                        let time = time_col.and_then(|c| child.value(row, c).as_timestamp());
                        builder.push(parent_key.clone(), time, row);
                    }
                }
                let (groups, link_stats) = builder.finish();
                stats.merge(link_stats);
                let body = RelationBody::Grouped {
                    temporal: time_col.is_some(),
                    groups,
                };
                (body, stats)
            }
            RelationKind::Lookup => {
                let (rows, stats) = key_map(&child, child_col);
                (RelationBody::Lookup { rows }, stats)
            }
            RelationKind::SelfGroup => {
                let (peers, mut stats) = key_map(&child, child_col);
                let mut sources = Vec::with_capacity(rel.engagements.len());
                for source in &rel.engagements {
                    let table = get_table(tables, &source.table)?;
                    let parent_col = column(&table, &source.parent_column, "engagement parent_column")?;
                    let peer_col = column(&table, &source.peer_column, "engagement peer_column")?;
                    let source_time = optional_column(
                        &table,
                        source.time_column.as_deref(),
                        "engagement time_column",
                    )?;

                    let mut builder = PartitionBuilder::default();
                    for (row, values) in table.rows() {
                        let keys = (
                            key_at(&table, row, parent_col),
                            key_at(&table, row, peer_col),
                        );
                        match keys {
                            (Ok(Some(key)), Ok(Some(_))) => {
                                let time = source_time.and_then(|c| values[c].as_timestamp());
                                builder.push(key, time, row);
                            }
                            (Err(()), _) | (_, Err(())) => builder.stats.unkeyed_rows += 1,
                            _ => {}
                        }
                    }
                    let (groups, source_stats) = builder.finish();
                    stats.merge(source_stats);
                    sources.push(EngagementIndex {
                        table,
                        peer_col,
                        temporal: source_time.is_some(),
                        groups,
                    });
                }
                (RelationBody::SelfGroup { peers, sources }, stats)
            }
        };
        stats.relations = 1;

        Ok((
            RelationIndex {
                parent_col,
                child,
                body,
            },
            stats,
        ))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Child rows of `relation` for `key`.
    ///
    /// Without a cutoff: every row, in table order. With a cutoff on a relation
    /// that declares a time column: rows with time strictly before the cutoff,
    /// newest first. Relations without a time column ignore the cutoff. Unknown
    /// keys yield an empty vector.
    ///
    /// LOOKUP relations yield at most one row. SELF_GROUP relations yield the
    /// distinct peer rows reached through their engagements.
    pub fn query(
        &self,
        relation: RelationIdx,
        key: &Key,
        cutoff: Option<Timestamp>,
    ) -> Vec<RowIdx> {
        match &self.relations[relation.as_usize()].body {
            RelationBody::Grouped { temporal, groups } => groups
                .get(key)
                .map(|p| p.select(*temporal, cutoff))
                .unwrap_or_default(),
            RelationBody::Lookup { rows } => rows.get(key).copied().into_iter().collect(),
            RelationBody::SelfGroup { peers, .. } => {
                let mut seen = std::collections::HashSet::new();
                self.engagements(relation, key, cutoff)
                    .into_iter()
                    .filter(|e| seen.insert(e.peer.clone()))
                    .filter_map(|e| peers.get(&e.peer).copied())
                    .collect()
            }
        }
    }

    /// The referenced row of a LOOKUP relation, or a SELF_GROUP peer by key.
    pub fn lookup(&self, relation: RelationIdx, key: &Key) -> Option<RowIdx> {
        match &self.relations[relation.as_usize()].body {
            RelationBody::Lookup { rows } => rows.get(key).copied(),
            RelationBody::SelfGroup { peers, .. } => peers.get(key).copied(),
            RelationBody::Grouped { .. } => None,
        }
    }

    /// Engagement records of a SELF_GROUP relation, source by source, each source
    /// in the same order [`query`](Self::query) would use.
    pub fn engagements(
        &self,
        relation: RelationIdx,
        key: &Key,
        cutoff: Option<Timestamp>,
    ) -> Vec<Engagement> {
        let RelationBody::SelfGroup { sources, .. } = &self.relations[relation.as_usize()].body
        else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (i, source) in sources.iter().enumerate() {
            let Some(partition) = source.groups.get(key) else {
                continue;
            };
            for row in partition.select(source.temporal, cutoff) {
                if let Some(peer) = source.table.value(row, source.peer_col).as_key() {
                    out.push(Engagement {
                        source: i,
                        row,
                        peer,
                    });
                }
            }
        }
        out
    }

    pub fn engagement_table(&self, relation: RelationIdx, source: usize) -> Option<&Table> {
        match &self.relations[relation.as_usize()].body {
            RelationBody::SelfGroup { sources, .. } => sources.get(source).map(|s| s.table.as_ref()),
            _ => None,
        }
    }

    pub fn entity_row(&self, key: &Key) -> Option<RowIdx> {
        self.entity_rows.get(key).copied()
    }

    pub fn entity_table(&self) -> &Table {
        &self.entity
    }

    pub fn num_entities(&self) -> usize {
        self.entity_rows.len()
    }

    /// The child (or peer) table of a relation.
    pub fn relation_table(&self, relation: RelationIdx) -> &Table {
        &self.relations[relation.as_usize()].child
    }

    /// Position of the relation's `parent_key` within its parent table.
    pub fn parent_column(&self, relation: RelationIdx) -> usize {
        self.relations[relation.as_usize()].parent_col
    }

    /// Column positions emitted when a row of `table` is materialized.
    pub fn emitted_columns(&self, table: &str) -> &[usize] {
        self.layouts.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn schema(&self) -> &RelationSchema {
        &self.schema
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }
}

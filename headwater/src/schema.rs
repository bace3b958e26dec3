//! Relation schema: the per-dataset declaration of how tables join and nest.
//!
//! A schema is data, not code. It is read from a JSON document so the same engine
//! serves every dataset:
//!
//! ```json
//! {
//!   "name": "rel-avito",
//!   "entity": { "table": "UserInfo", "primary_key": "UserID" },
//!   "relations": [
//!     { "kind": "one_to_many", "parent_table": "UserInfo", "child_table": "SearchInfo",
//!       "parent_key": "UserID", "child_key": "UserID", "time_column": "SearchDate",
//!       "output_field": "search_history" },
//!     { "kind": "lookup", "parent_table": "SearchInfo", "child_table": "Location",
//!       "parent_key": "LocationID", "child_key": "LocationID",
//!       "output_field": "search_location" }
//!   ]
//! }
//! ```
//!
//! [`RelationSchema::validate`] performs the structural checks that need no data.
//! Column-level checks happen when the index is built against real tables.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::common::RelationIdx;

pub const DEFAULT_MAX_DEPTH: usize = 8;
pub const DEFAULT_LABEL_FIELD: &str = "label";
pub const DEFAULT_TIMESTAMP_FIELD: &str = "timestamp";
pub const DEFAULT_TASK_TIME_COLUMN: &str = "timestamp";
pub const DEFAULT_ENGAGEMENT_FIELD: &str = "engagement";
pub const DEFAULT_PEER_FIELD: &str = "peer";

// ============================================================================
// Schema objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Child rows whose `child_key` equals the parent's `parent_key`.
    OneToMany,
    /// Child rows reached through a link table.
    ManyToMany,
    /// Peer references gathered from engagement tables, minus ids the parent
    /// already owns. Never recursed into.
    SelfGroup,
    /// A single referenced row (many-to-one), e.g. an ad's category.
    Lookup,
}

impl RelationKind {
    /// Whether materializing this relation recurses into the child's own relations.
    pub fn nests(self) -> bool {
        !matches!(self, RelationKind::SelfGroup)
    }
}

/// One table whose rows record an entity engaging with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementSource {
    pub table: String,
    /// Column holding the engaging entity's key.
    pub parent_column: String,
    /// Column holding the peer's key.
    pub peer_column: String,
    /// Event time of the engagement record, if it is cutoff-filterable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,
}

/// One edge of the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub kind: RelationKind,
    pub parent_table: String,
    pub child_table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_table: Option<String>,
    pub parent_key: String,
    pub child_key: String,
    /// Link-table column matching the parent key. Defaults to `parent_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_parent_key: Option<String>,
    /// Link-table column matching the child key. Defaults to `child_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_child_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,
    pub output_field: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub engagements: Vec<EngagementSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engagement_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_field: Option<String>,
}

impl RelationSpec {
    fn base(
        kind: RelationKind,
        parent_table: &str,
        child_table: &str,
        parent_key: &str,
        child_key: &str,
        output_field: &str,
    ) -> Self {
        Self {
            kind,
            parent_table: parent_table.to_string(),
            child_table: child_table.to_string(),
            link_table: None,
            parent_key: parent_key.to_string(),
            child_key: child_key.to_string(),
            link_parent_key: None,
            link_child_key: None,
            time_column: None,
            output_field: output_field.to_string(),
            engagements: Vec::new(),
            exclude_field: None,
            engagement_field: None,
            peer_field: None,
        }
    }

    pub fn one_to_many(
        parent_table: &str,
        child_table: &str,
        parent_key: &str,
        child_key: &str,
        output_field: &str,
    ) -> Self {
        Self::base(
            RelationKind::OneToMany,
            parent_table,
            child_table,
            parent_key,
            child_key,
            output_field,
        )
    }

    pub fn many_to_many(
        parent_table: &str,
        link_table: &str,
        child_table: &str,
        parent_key: &str,
        child_key: &str,
        output_field: &str,
    ) -> Self {
        let mut spec = Self::base(
            RelationKind::ManyToMany,
            parent_table,
            child_table,
            parent_key,
            child_key,
            output_field,
        );
        spec.link_table = Some(link_table.to_string());
        spec
    }

    pub fn lookup(
        parent_table: &str,
        child_table: &str,
        parent_key: &str,
        child_key: &str,
        output_field: &str,
    ) -> Self {
        Self::base(
            RelationKind::Lookup,
            parent_table,
            child_table,
            parent_key,
            child_key,
            output_field,
        )
    }

    /// `peer_table`/`peer_key` name the peer entities and their primary key.
    pub fn self_group(
        parent_table: &str,
        parent_key: &str,
        peer_table: &str,
        peer_key: &str,
        engagements: Vec<EngagementSource>,
        output_field: &str,
    ) -> Self {
        let mut spec = Self::base(
            RelationKind::SelfGroup,
            parent_table,
            peer_table,
            parent_key,
            peer_key,
            output_field,
        );
        spec.engagements = engagements;
        spec
    }

    pub fn with_time_column(mut self, column: &str) -> Self {
        self.time_column = Some(column.to_string());
        self
    }

    pub fn with_link_keys(mut self, parent: &str, child: &str) -> Self {
        self.link_parent_key = Some(parent.to_string());
        self.link_child_key = Some(child.to_string());
        self
    }

    pub fn excluding(mut self, field: &str) -> Self {
        self.exclude_field = Some(field.to_string());
        self
    }

    pub fn with_peer_fields(mut self, engagement_field: &str, peer_field: &str) -> Self {
        self.engagement_field = Some(engagement_field.to_string());
        self.peer_field = Some(peer_field.to_string());
        self
    }

    pub fn link_parent_key(&self) -> &str {
        self.link_parent_key.as_deref().unwrap_or(&self.parent_key)
    }

    pub fn link_child_key(&self) -> &str {
        self.link_child_key.as_deref().unwrap_or(&self.child_key)
    }

    pub fn engagement_field(&self) -> &str {
        self.engagement_field
            .as_deref()
            .unwrap_or(DEFAULT_ENGAGEMENT_FIELD)
    }

    pub fn peer_field(&self) -> &str {
        self.peer_field.as_deref().unwrap_or(DEFAULT_PEER_FIELD)
    }

    /// Whether a cutoff applies to this relation's rows.
    pub fn is_temporal(&self) -> bool {
        match self.kind {
            RelationKind::SelfGroup => self.engagements.iter().any(|e| e.time_column.is_some()),
            _ => self.time_column.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub table: String,
    pub primary_key: String,
}

/// Per-table output options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Columns emitted when a row of this table is materialized. `None` emits all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

/// How to read one prediction task's Parquet files into entity tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub entity_column: String,
    #[serde(default = "default_task_time_column")]
    pub time_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_column: Option<String>,
}

fn default_task_time_column() -> Option<String> {
    Some(DEFAULT_TASK_TIME_COLUMN.to_string())
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_label_field() -> String {
    DEFAULT_LABEL_FIELD.to_string()
}

fn default_timestamp_field() -> String {
    DEFAULT_TIMESTAMP_FIELD.to_string()
}

/// The complete declaration for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub name: String,
    pub entity: EntitySpec,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tables: IndexMap<String, TableSpec>,
    pub relations: Vec<RelationSpec>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tasks: IndexMap<String, TaskSpec>,
    /// Relation levels expanded below the entity. Deeper levels are emitted empty.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_label_field")]
    pub label_field: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to read schema '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid schema JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("relation '{relation}': missing required field '{field}'")]
    MissingField { relation: String, field: &'static str },
    #[error("relation '{relation}': {reason}")]
    InvalidRelation { relation: String, reason: String },
    #[error("table '{table}' declares output field '{field}' more than once")]
    DuplicateOutputField { table: String, field: String },
    #[error("relation '{relation}': exclude_field '{field}' does not name a sibling relation")]
    UnknownExcludeField { relation: String, field: String },
    #[error("relations form a cycle through table '{table}'")]
    Cycle { table: String },
    #[error("max_depth must be at least 1")]
    ZeroDepth,
}

// ============================================================================
// Loading and validation
// ============================================================================

impl RelationSchema {
    /// A schema with default depth and field names.
    pub fn new(name: &str, entity_table: &str, primary_key: &str, relations: Vec<RelationSpec>) -> Self {
        Self {
            name: name.to_string(),
            entity: EntitySpec {
                table: entity_table.to_string(),
                primary_key: primary_key.to_string(),
            },
            tables: IndexMap::new(),
            relations,
            tasks: IndexMap::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            label_field: default_label_field(),
            timestamp_field: default_timestamp_field(),
        }
    }

    /// Read and validate a schema from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a schema from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        let schema: Self = serde_json::from_str(text)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn relation(&self, idx: RelationIdx) -> &RelationSpec {
        &self.relations[idx.as_usize()]
    }

    /// Relations hanging off `table`, in declaration order.
    pub fn relations_of<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = (RelationIdx, &'a RelationSpec)> + 'a {
        self.relations
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.parent_table == table)
            .map(|(i, r)| (RelationIdx(i as u32), r))
    }

    /// Position of the relation on `parent_table` whose output field is `field`.
    pub fn find_relation(&self, parent_table: &str, field: &str) -> Option<RelationIdx> {
        self.relations_of(parent_table)
            .find(|(_, r)| r.output_field == field)
            .map(|(idx, _)| idx)
    }

    /// Every table the schema touches, entity table first, in declaration order.
    pub fn required_tables(&self) -> Vec<&str> {
        let mut tables: IndexSet<&str> = IndexSet::new();
        tables.insert(&self.entity.table);
        for rel in &self.relations {
            tables.insert(&rel.parent_table);
            tables.insert(&rel.child_table);
            if let Some(link) = &rel.link_table {
                tables.insert(link);
            }
            for source in &rel.engagements {
                tables.insert(&source.table);
            }
        }
        tables.into_iter().collect()
    }

    /// Output columns declared for `table`, if projected.
    pub fn projection(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).and_then(|t| t.columns.as_deref())
    }

    /// Structural checks that need no table data.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.max_depth == 0 {
            return Err(SchemaError::ZeroDepth);
        }

        for rel in &self.relations {
            self.validate_relation(rel)?;
        }

        // Output fields are unique per parent table; the entity's also avoid the
        // label/timestamp fields.
        let mut seen: HashMap<&str, HashSet<&str>> = HashMap::new();
        for rel in &self.relations {
            let fields = seen.entry(&rel.parent_table).or_default();
            let reserved = rel.parent_table == self.entity.table
                && (rel.output_field == self.label_field || rel.output_field == self.timestamp_field);
            if reserved || !fields.insert(&rel.output_field) {
                return Err(SchemaError::DuplicateOutputField {
                    table: rel.parent_table.clone(),
                    field: rel.output_field.clone(),
                });
            }
        }
        if self.label_field == self.timestamp_field {
            return Err(SchemaError::DuplicateOutputField {
                table: self.entity.table.clone(),
                field: self.label_field.clone(),
            });
        }

        for rel in &self.relations {
            if let Some(field) = &rel.exclude_field {
                let owner = self
                    .relations_of(&rel.parent_table)
                    .map(|(_, r)| r)
                    .find(|r| &r.output_field == field)
                    .ok_or_else(|| SchemaError::UnknownExcludeField {
                        relation: rel.output_field.clone(),
                        field: field.clone(),
                    })?;
                let owns_peers = matches!(
                    owner.kind,
                    RelationKind::OneToMany | RelationKind::ManyToMany
                ) && owner.child_table == rel.child_table;
                if !owns_peers {
                    return Err(SchemaError::InvalidRelation {
                        relation: rel.output_field.clone(),
                        reason: format!(
                            "exclude_field '{field}' must be a one_to_many or many_to_many \
                             relation onto '{}'",
                            rel.child_table
                        ),
                    });
                }
            }
        }

        self.check_acyclic()?;

        let reachable = self.reachable_tables();
        for rel in &self.relations {
            if !reachable.contains(rel.parent_table.as_str()) {
                warn!(
                    "Relation '{}' hangs off table '{}', which is unreachable from entity table '{}'",
                    rel.output_field, rel.parent_table, self.entity.table
                );
            }
        }

        Ok(())
    }

    fn validate_relation(&self, rel: &RelationSpec) -> Result<(), SchemaError> {
        let name = || rel.output_field.clone();
        if rel.output_field.is_empty() {
            return Err(SchemaError::MissingField {
                relation: format!("{} -> {}", rel.parent_table, rel.child_table),
                field: "output_field",
            });
        }
        match rel.kind {
            RelationKind::OneToMany => {
                if rel.link_table.is_some() {
                    return Err(SchemaError::InvalidRelation {
                        relation: name(),
                        reason: "link_table is only valid on many_to_many relations".into(),
                    });
                }
            }
            RelationKind::ManyToMany => {
                if rel.link_table.is_none() {
                    return Err(SchemaError::MissingField {
                        relation: name(),
                        field: "link_table",
                    });
                }
            }
            RelationKind::Lookup => {
                if rel.time_column.is_some() {
                    return Err(SchemaError::InvalidRelation {
                        relation: name(),
                        reason: "lookup relations reference static data and cannot declare a time_column"
                            .into(),
                    });
                }
            }
            RelationKind::SelfGroup => {
                if rel.engagements.is_empty() {
                    return Err(SchemaError::MissingField {
                        relation: name(),
                        field: "engagements",
                    });
                }
                if rel.time_column.is_some() {
                    return Err(SchemaError::InvalidRelation {
                        relation: name(),
                        reason: "self_group relations filter by each engagement source's time_column"
                            .into(),
                    });
                }
                if rel.engagement_field() == rel.peer_field() {
                    return Err(SchemaError::InvalidRelation {
                        relation: name(),
                        reason: "engagement_field and peer_field must differ".into(),
                    });
                }
            }
        }
        if rel.kind != RelationKind::SelfGroup && rel.exclude_field.is_some() {
            return Err(SchemaError::InvalidRelation {
                relation: name(),
                reason: "exclude_field is only valid on self_group relations".into(),
            });
        }
        Ok(())
    }

    /// Nesting relations must form a DAG, otherwise a document could embed a full
    /// copy of one of its ancestors.
    fn check_acyclic(&self) -> Result<(), SchemaError> {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for rel in self.relations.iter().filter(|r| r.kind.nests()) {
            edges
                .entry(rel.parent_table.as_str())
                .or_default()
                .push(rel.child_table.as_str());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            table: &'a str,
            edges: &HashMap<&'a str, Vec<&'a str>>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), SchemaError> {
            match marks.get(table) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(SchemaError::Cycle {
                        table: table.to_string(),
                    });
                }
                None => {}
            }
            marks.insert(table, Mark::Visiting);
            for &child in edges.get(table).map(Vec::as_slice).unwrap_or_default() {
                visit(child, edges, marks)?;
            }
            marks.insert(table, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for &table in edges.keys() {
            visit(table, &edges, &mut marks)?;
        }
        Ok(())
    }

    fn reachable_tables(&self) -> HashSet<&str> {
        let mut reachable = HashSet::new();
        let mut stack = vec![self.entity.table.as_str()];
        while let Some(table) = stack.pop() {
            if !reachable.insert(table) {
                continue;
            }
            for (_, rel) in self.relations_of(table) {
                if rel.kind.nests() {
                    stack.push(&rel.child_table);
                }
            }
        }
        reachable
    }
}

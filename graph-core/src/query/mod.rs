//! Query definition and the closed filter algebra (spec §4.3).
//!
//! Grounded on the teacher's design note (spec §9: "Duck-typed filter
//! objects ... replace with a closed sum type over the variants; the
//! dispatcher is an exhaustive switch") and on the shape of
//! `core/src/selection/filter.rs`'s predicate evaluator, adapted from a
//! SQL-like AST to the typed variant list the spec calls for.

pub mod eval;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::value::Value;

pub const DEFAULT_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemporalField {
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemporalOp {
    Within,
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationType {
    ChildOf,
    OwnedBy,
    LinksTo,
    LinkedFrom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Supertag { id: String, include_inherited: bool },
    Property { field_system_id: String, op: PropertyOp, value: Option<Value> },
    Content { query: String, case_sensitive: bool },
    HasField { field_system_id: String, negate: bool },
    Temporal { field: TemporalField, op: TemporalOp, days: Option<i64>, date: Option<DateTime<Utc>> },
    Relation { relation_type: RelationType, target_node_id: Option<NodeId>, field_system_id: Option<String> },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Vec<Filter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    Content,
    CreatedAt,
    UpdatedAt,
    SystemId,
    /// Addressed by field system id or field content name (spec §4.3 sort).
    Property(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub filters: Vec<Filter>,
    pub sort: Option<SortSpec>,
    pub limit: usize,
}

impl Default for QueryDefinition {
    fn default() -> Self { Self { filters: Vec::new(), sort: None, limit: DEFAULT_LIMIT } }
}

impl QueryDefinition {
    pub fn new(filters: Vec<Filter>) -> Self { Self { filters, ..Default::default() } }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone)]
pub struct EvalResult {
    pub nodes: Vec<crate::model::AssembledNode>,
    pub total_count: usize,
    pub evaluated_at: DateTime<Utc>,
}

impl EvalResult {
    pub fn ids(&self) -> Vec<NodeId> { self.nodes.iter().map(|n| n.id).collect() }
}

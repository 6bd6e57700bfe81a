//! The node/property data model (spec §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::ids::NodeId;
use crate::value::Value;

/// A node row as persisted by the store, before assembly.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub content: Option<String>,
    pub content_plain: Option<String>,
    pub system_id: Option<String>,
    pub owner_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl GraphNode {
    pub fn is_live(&self) -> bool { self.deleted_at.is_none() }
}

/// A single `(node, field-node, value)` triple (spec §3).
#[derive(Debug, Clone)]
pub struct PropertyRow {
    pub row_id: i64,
    pub node_id: NodeId,
    pub field_node_id: NodeId,
    /// The JSON-encoded text as stored, kept for round-trip fidelity.
    pub raw_value: String,
    pub order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PropertyRow {
    pub fn decoded_value(&self) -> Value { Value::from_json_str(&self.raw_value).unwrap_or(Value::Null) }
}

/// Supertag reference resolved onto an assembled node.
#[derive(Debug, Clone, PartialEq)]
pub struct SupertagRef {
    pub id: NodeId,
    pub system_id: String,
    pub content: Option<String>,
}

/// One property value as seen on an assembled node (spec §4.1 "assemble").
#[derive(Debug, Clone)]
pub struct FieldEntry {
    pub value: Value,
    pub raw_value: String,
    pub field_node_id: NodeId,
    pub field_system_id: String,
    pub order: i64,
}

/// A node with its supertags and properties resolved, as returned by the
/// store's `assemble` operation and consumed exclusively by the evaluator.
/// Fields are addressable by field system id OR field content name (spec
/// §9: "the evaluator never introspects a generic structure").
#[derive(Debug, Clone)]
pub struct AssembledNode {
    pub id: NodeId,
    pub content: Option<String>,
    pub system_id: Option<String>,
    pub owner_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,

    pub supertags: Vec<SupertagRef>,
    pub fields_by_system_id: HashMap<String, Vec<FieldEntry>>,
    pub fields_by_name: HashMap<String, Vec<FieldEntry>>,
}

impl AssembledNode {
    pub fn new(node: &GraphNode) -> Self {
        Self {
            id: node.id,
            content: node.content.clone(),
            system_id: node.system_id.clone(),
            owner_id: node.owner_id,
            created_at: node.created_at,
            updated_at: node.updated_at,
            deleted_at: node.deleted_at,
            supertags: Vec::new(),
            fields_by_system_id: HashMap::new(),
            fields_by_name: HashMap::new(),
        }
    }

    pub fn push_field(&mut self, name: Option<&str>, entry: FieldEntry) {
        self.fields_by_system_id.entry(entry.field_system_id.clone()).or_default().push(entry.clone());
        if let Some(name) = name {
            self.fields_by_name.entry(name.to_string()).or_default().push(entry);
        }
    }

    /// First value for a field addressed by system id or content name.
    pub fn value(&self, field_system_id_or_name: &str) -> Option<Value> {
        self.fields_by_system_id
            .get(field_system_id_or_name)
            .or_else(|| self.fields_by_name.get(field_system_id_or_name))
            .and_then(|entries| entries.first())
            .map(|e| e.value.clone())
    }

    /// All values for a multi-valued field, in `order`.
    pub fn values(&self, field_system_id_or_name: &str) -> Vec<Value> {
        self.fields_by_system_id
            .get(field_system_id_or_name)
            .or_else(|| self.fields_by_name.get(field_system_id_or_name))
            .map(|entries| entries.iter().map(|e| e.value.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_field(&self, field_system_id: &str) -> bool {
        self.fields_by_system_id.get(field_system_id).map(|v| !v.is_empty()).unwrap_or(false)
    }

    pub fn has_supertag(&self, supertag_system_id: &str) -> bool { self.supertags.iter().any(|s| s.system_id == supertag_system_id) }

    /// Structural equality used by the diff engine to decide `changed`
    /// membership (spec §4.4). Two assembled nodes are equal iff their
    /// externally visible shape is equal.
    pub fn structurally_eq(&self, other: &AssembledNode) -> bool {
        self.id == other.id
            && self.content == other.content
            && self.system_id == other.system_id
            && self.owner_id == other.owner_id
            && self.updated_at == other.updated_at
            && self.deleted_at == other.deleted_at
            && self.supertags == other.supertags
            && field_maps_eq(&self.fields_by_system_id, &other.fields_by_system_id)
    }
}

fn field_maps_eq(a: &HashMap<String, Vec<FieldEntry>>, b: &HashMap<String, Vec<FieldEntry>>) -> bool {
    if a.len() != b.len() {
        return false;
    }
    for (k, av) in a {
        match b.get(k) {
            Some(bv) if av.len() == bv.len() => {
                for (x, y) in av.iter().zip(bv.iter()) {
                    if x.raw_value != y.raw_value || x.order != y.order {
                        return false;
                    }
                }
            }
            _ => return false,
        }
    }
    true
}

impl PartialEq for FieldEntry {
    fn eq(&self, other: &Self) -> bool { self.raw_value == other.raw_value && self.order == other.order && self.field_system_id == other.field_system_id }
}

//! Graph store interface (spec §4.1) plus an in-process reference
//! implementation used by the reactive layer's own tests.
//!
//! Grounded on the teacher's `StorageEngine`/`StorageCollection` split
//! (`core/src/storage.rs`, `storage/sqlite/src/engine.rs`): the reactive
//! layer depends only on this trait, never on a concrete backend. The
//! SQLite-backed implementation lives in the sibling `graph-storage-sqlite`
//! crate.

mod memory;

pub use memory::InMemoryGraphStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{GraphError, StoreError, ValidationError};
use crate::ids::NodeId;
use crate::model::{AssembledNode, GraphNode, PropertyRow};
use crate::value::Value;

/// Options for `GraphStore::create_node` (spec §4.1).
#[derive(Debug, Clone, Default)]
pub struct CreateNodeOptions {
    pub content: Option<String>,
    pub system_id: Option<String>,
    pub owner_id: Option<NodeId>,
    pub supertag_system_id: Option<String>,
}

/// Uniform node/property read/write surface the reactive layer depends on.
/// Implementations must emit exactly one `MutationEvent` per successful
/// write (spec §3 invariant) to the bus they were constructed with, and
/// must never emit an event for a call that returns `Err`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // --- reads ---

    async fn get_node(&self, id: NodeId) -> Result<Option<GraphNode>, StoreError>;

    async fn get_node_by_system_id(&self, system_id: &str, include_deleted: bool) -> Result<Option<GraphNode>, StoreError>;

    /// All live (non soft-deleted) node identifiers.
    async fn list_live_node_ids(&self) -> Result<Vec<NodeId>, StoreError>;

    async fn properties_of(&self, node_id: NodeId) -> Result<Vec<PropertyRow>, StoreError>;

    /// Properties across all nodes for a given field-node (required by the
    /// evaluator for `relation{linkedFrom}` and reverse lookups).
    async fn properties_by_field(&self, field_node_id: NodeId) -> Result<Vec<PropertyRow>, StoreError>;

    /// Resolve a node's content, supertags and fields (by content name).
    async fn assemble(&self, id: NodeId) -> Result<Option<AssembledNode>, StoreError>;

    /// Like `assemble`, but merges default values from the node's supertags
    /// and their ancestors (shallower supertag wins), bounded at depth 10
    /// with a visited set (spec §4.1, §4.3 inheritance walk).
    async fn assemble_inherited(&self, id: NodeId) -> Result<Option<AssembledNode>, StoreError>;

    /// The immediate parent of a supertag via `field:extends`, if any.
    async fn supertag_parent(&self, supertag_system_id: &str) -> Result<Option<String>, StoreError>;

    /// All supertags that directly or transitively extend `supertag_system_id`
    /// (bounded walk, spec §4.3).
    async fn supertag_descendants(&self, supertag_system_id: &str) -> Result<Vec<String>, StoreError>;

    // --- writes ---

    async fn create_node(&self, opts: CreateNodeOptions) -> Result<GraphNode, GraphError>;

    async fn update_content(&self, id: NodeId, content: String) -> Result<GraphNode, GraphError>;

    async fn soft_delete(&self, id: NodeId) -> Result<(), GraphError>;

    async fn purge(&self, id: NodeId) -> Result<(), GraphError>;

    async fn set_property(&self, node_id: NodeId, field_system_id: &str, order: i64, value: Value) -> Result<(), GraphError>;

    async fn add_property(&self, node_id: NodeId, field_system_id: &str, value: Value) -> Result<(), GraphError>;

    async fn clear_property(&self, node_id: NodeId, field_system_id: &str) -> Result<(), GraphError>;

    async fn add_supertag(&self, node_id: NodeId, supertag_system_id: &str) -> Result<(), GraphError>;

    async fn remove_supertag(&self, node_id: NodeId, supertag_system_id: &str) -> Result<(), GraphError>;

    /// Seed the well-known system nodes (spec §6). Idempotent.
    async fn bootstrap(&self) -> Result<(), GraphError>;
}

pub(crate) fn require_live(node: &GraphNode) -> Result<(), ValidationError> {
    if node.is_live() {
        Ok(())
    } else {
        Err(ValidationError::NodeDeleted(node.id))
    }
}

pub(crate) fn now() -> DateTime<Utc> { Utc::now() }

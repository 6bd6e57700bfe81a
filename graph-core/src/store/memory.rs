//! In-process reference `GraphStore`. Backs the reactive layer's own unit
//! tests; the shipped production backend is `graph-storage-sqlite`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{now, require_live, CreateNodeOptions, GraphStore};
use crate::error::{GraphError, StoreError, ValidationError};
use crate::event::{EventBus, MutationEvent};
use crate::ids::{well_known, NodeId, SystemId};
use crate::model::{AssembledNode, FieldEntry, GraphNode, PropertyRow, SupertagRef};
use crate::value::Value;

const MAX_INHERITANCE_DEPTH: u32 = 10;

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, GraphNode>,
    system_id_index: HashMap<String, NodeId>,
    properties: HashMap<NodeId, Vec<PropertyRow>>,
    next_row_id: i64,
}

pub struct InMemoryGraphStore {
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl InMemoryGraphStore {
    pub fn new(bus: Arc<EventBus>) -> Self { Self { bus, inner: Mutex::new(Inner::default()) } }

    fn field_node_for(&self, inner: &Inner, field_system_id: &str) -> Result<NodeId, ValidationError> {
        inner
            .system_id_index
            .get(field_system_id)
            .copied()
            .ok_or_else(|| ValidationError::UnknownField(field_system_id.to_string()))
    }

    fn insert_node(&self, inner: &mut Inner, node: GraphNode) {
        if let Some(sid) = &node.system_id {
            inner.system_id_index.insert(sid.clone(), node.id);
        }
        inner.nodes.insert(node.id, node);
    }

    fn seed_system_node(&self, inner: &mut Inner, system_id: &str, content: &str) -> NodeId {
        if let Some(id) = inner.system_id_index.get(system_id) {
            return *id;
        }
        let id = NodeId::new();
        let ts = now();
        self.insert_node(
            inner,
            GraphNode {
                id,
                content: Some(content.to_string()),
                content_plain: Some(content.to_lowercase()),
                system_id: Some(system_id.to_string()),
                owner_id: None,
                created_at: ts,
                updated_at: ts,
                deleted_at: None,
            },
        );
        id
    }

    fn assemble_locked(&self, inner: &Inner, id: NodeId) -> Option<AssembledNode> {
        let node = inner.nodes.get(&id)?;
        if !node.is_live() {
            return None;
        }
        let mut assembled = AssembledNode::new(node);
        if let Some(rows) = inner.properties.get(&id) {
            let mut rows = rows.clone();
            rows.sort_by_key(|r| (r.field_node_id, r.order));
            for row in rows {
                let Some(field_node) = inner.nodes.get(&row.field_node_id) else { continue };
                let Some(field_sid) = &field_node.system_id else { continue };
                let entry = FieldEntry {
                    value: row.decoded_value(),
                    raw_value: row.raw_value.clone(),
                    field_node_id: row.field_node_id,
                    field_system_id: field_sid.clone(),
                    order: row.order,
                };
                assembled.push_field(field_node.content.as_deref(), entry);
            }
        }
        if let Some(entries) = assembled.fields_by_system_id.get(well_known::FIELD_SUPERTAG).cloned() {
            for entry in entries {
                if let Value::String(sid) = &entry.value {
                    if let Some(stag_node) = inner.system_id_index.get(sid).and_then(|id| inner.nodes.get(id)) {
                        assembled.supertags.push(SupertagRef { id: stag_node.id, system_id: sid.clone(), content: stag_node.content.clone() });
                    }
                }
            }
        }
        Some(assembled)
    }

    fn supertag_parent_locked(&self, inner: &Inner, supertag_system_id: &str) -> Option<String> {
        let stag_id = inner.system_id_index.get(supertag_system_id)?;
        let assembled = self.assemble_locked(inner, *stag_id)?;
        match assembled.value(well_known::FIELD_EXTENDS) {
            Some(Value::String(parent)) => Some(parent),
            _ => None,
        }
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get_node(&self, id: NodeId) -> Result<Option<GraphNode>, StoreError> { Ok(self.inner.lock().unwrap().nodes.get(&id).cloned()) }

    async fn get_node_by_system_id(&self, system_id: &str, include_deleted: bool) -> Result<Option<GraphNode>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.system_id_index.get(system_id).and_then(|id| inner.nodes.get(id)).filter(|n| include_deleted || n.is_live()).cloned())
    }

    async fn list_live_node_ids(&self) -> Result<Vec<NodeId>, StoreError> {
        Ok(self.inner.lock().unwrap().nodes.values().filter(|n| n.is_live()).map(|n| n.id).collect())
    }

    async fn properties_of(&self, node_id: NodeId) -> Result<Vec<PropertyRow>, StoreError> {
        Ok(self.inner.lock().unwrap().properties.get(&node_id).cloned().unwrap_or_default())
    }

    async fn properties_by_field(&self, field_node_id: NodeId) -> Result<Vec<PropertyRow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.properties.values().flatten().filter(|r| r.field_node_id == field_node_id).cloned().collect())
    }

    async fn assemble(&self, id: NodeId) -> Result<Option<AssembledNode>, StoreError> {
        Ok(self.assemble_locked(&self.inner.lock().unwrap(), id))
    }

    async fn assemble_inherited(&self, id: NodeId) -> Result<Option<AssembledNode>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let Some(mut result) = self.assemble_locked(&inner, id) else { return Ok(None) };

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, u32)> = result.supertags.iter().map(|s| (s.system_id.clone(), 1)).collect();
        for (sid, _) in &queue {
            visited.insert(sid.clone());
        }

        while let Some((sid, depth)) = queue.pop_front() {
            if depth > MAX_INHERITANCE_DEPTH {
                continue;
            }
            if let Some(stag_id) = inner.system_id_index.get(&sid) {
                if let Some(stag_assembled) = self.assemble_locked(&inner, *stag_id) {
                    for (key, entries) in &stag_assembled.fields_by_system_id {
                        if key == well_known::FIELD_SUPERTAG || key == well_known::FIELD_EXTENDS {
                            continue;
                        }
                        result.fields_by_system_id.entry(key.clone()).or_insert_with(|| entries.clone());
                    }
                    for (key, entries) in &stag_assembled.fields_by_name {
                        result.fields_by_name.entry(key.clone()).or_insert_with(|| entries.clone());
                    }
                }
            }
            if let Some(parent) = self.supertag_parent_locked(&inner, &sid) {
                if visited.insert(parent.clone()) {
                    queue.push_back((parent, depth + 1));
                }
            }
        }
        Ok(Some(result))
    }

    async fn supertag_parent(&self, supertag_system_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.supertag_parent_locked(&self.inner.lock().unwrap(), supertag_system_id))
    }

    async fn supertag_descendants(&self, supertag_system_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for node in inner.nodes.values() {
            let Some(sid) = &node.system_id else { continue };
            if !sid.starts_with("supertag:") || sid == supertag_system_id || !node.is_live() {
                continue;
            }
            let mut visited = HashSet::new();
            let mut current = sid.clone();
            let mut depth = 0;
            loop {
                if depth > MAX_INHERITANCE_DEPTH || !visited.insert(current.clone()) {
                    break;
                }
                match self.supertag_parent_locked(&inner, &current) {
                    Some(parent) if parent == supertag_system_id => {
                        out.push(sid.clone());
                        break;
                    }
                    Some(parent) => {
                        current = parent;
                        depth += 1;
                    }
                    None => break,
                }
            }
        }
        Ok(out)
    }

    async fn create_node(&self, opts: CreateNodeOptions) -> Result<GraphNode, GraphError> {
        if let Some(sid) = &opts.system_id {
            SystemId::try_from(sid.as_str()).map_err(GraphError::Validation)?;
            let inner = self.inner.lock().unwrap();
            if inner.system_id_index.contains_key(sid) {
                return Err(GraphError::Validation(ValidationError::DuplicateSystemId(sid.clone())));
            }
        }
        let ts = now();
        let id = NodeId::new();
        let node = GraphNode {
            id,
            content: opts.content.clone(),
            content_plain: opts.content.as_ref().map(|c| c.to_lowercase()),
            system_id: opts.system_id.clone(),
            owner_id: opts.owner_id,
            created_at: ts,
            updated_at: ts,
            deleted_at: None,
        };
        {
            let mut inner = self.inner.lock().unwrap();
            self.insert_node(&mut inner, node.clone());
        }
        self.bus.emit(&MutationEvent::NodeCreated {
            node_id: id,
            system_id: opts.system_id.clone(),
            supertag_system_id: opts.supertag_system_id.clone(),
            timestamp: ts,
        });
        if let Some(supertag) = &opts.supertag_system_id {
            self.add_supertag(id, supertag).await?;
        }
        Ok(node)
    }

    async fn update_content(&self, id: NodeId, content: String) -> Result<GraphNode, GraphError> {
        let ts = now();
        let (before, updated) = {
            let mut inner = self.inner.lock().unwrap();
            let node = inner.nodes.get_mut(&id).ok_or(ValidationError::NodeNotFound(id))?;
            require_live(node).map_err(GraphError::Validation)?;
            let before = node.content.clone();
            node.content = Some(content.clone());
            node.content_plain = Some(content.to_lowercase());
            node.updated_at = ts;
            (before, node.clone())
        };
        self.bus.emit(&MutationEvent::NodeUpdated { node_id: id, before_content: before, after_content: Some(content), timestamp: ts });
        Ok(updated)
    }

    async fn soft_delete(&self, id: NodeId) -> Result<(), GraphError> {
        let ts = now();
        {
            let mut inner = self.inner.lock().unwrap();
            let node = inner.nodes.get_mut(&id).ok_or(ValidationError::NodeNotFound(id))?;
            require_live(node).map_err(GraphError::Validation)?;
            node.deleted_at = Some(ts);
            node.updated_at = ts;
        }
        self.bus.emit(&MutationEvent::NodeDeleted { node_id: id, timestamp: ts });
        Ok(())
    }

    async fn purge(&self, id: NodeId) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.nodes.remove(&id) {
            if let Some(sid) = &node.system_id {
                inner.system_id_index.remove(sid);
            }
        }
        inner.properties.remove(&id);
        for rows in inner.properties.values_mut() {
            rows.retain(|r| r.field_node_id != id);
        }
        Ok(())
    }

    async fn set_property(&self, node_id: NodeId, field_system_id: &str, order: i64, value: Value) -> Result<(), GraphError> {
        let ts = now();
        let (field_node_id, before_value) = {
            let inner = self.inner.lock().unwrap();
            let node = inner.nodes.get(&node_id).ok_or(ValidationError::NodeNotFound(node_id))?;
            require_live(node).map_err(GraphError::Validation)?;
            let field_node_id = self.field_node_for(&inner, field_system_id).map_err(GraphError::Validation)?;
            let before = inner
                .properties
                .get(&node_id)
                .and_then(|rows| rows.iter().find(|r| r.field_node_id == field_node_id && r.order == order))
                .map(|r| r.decoded_value());
            (field_node_id, before)
        };
        let raw = value.to_json().to_string();
        {
            let mut inner = self.inner.lock().unwrap();
            let row_id = inner.next_row_id;
            inner.next_row_id += 1;
            let rows = inner.properties.entry(node_id).or_default();
            if let Some(existing) = rows.iter_mut().find(|r| r.field_node_id == field_node_id && r.order == order) {
                existing.raw_value = raw.clone();
                existing.updated_at = ts;
            } else {
                rows.push(PropertyRow { row_id, node_id, field_node_id, raw_value: raw.clone(), order, created_at: ts, updated_at: ts });
            }
        }
        self.bus.emit(&MutationEvent::PropertySet {
            node_id,
            field_system_id: field_system_id.to_string(),
            order,
            before_value,
            after_value: value,
            timestamp: ts,
        });
        Ok(())
    }

    async fn add_property(&self, node_id: NodeId, field_system_id: &str, value: Value) -> Result<(), GraphError> {
        let field_node_id = {
            let inner = self.inner.lock().unwrap();
            self.field_node_for(&inner, field_system_id).map_err(GraphError::Validation)?
        };
        let next_order = {
            let inner = self.inner.lock().unwrap();
            inner.properties.get(&node_id).map(|rows| rows.iter().filter(|r| r.field_node_id == field_node_id).map(|r| r.order).max()).flatten().map(|m| m + 1).unwrap_or(0)
        };
        self.set_property(node_id, field_system_id, next_order, value).await
    }

    async fn clear_property(&self, node_id: NodeId, field_system_id: &str) -> Result<(), GraphError> {
        let ts = now();
        let field_node_id = {
            let inner = self.inner.lock().unwrap();
            let node = inner.nodes.get(&node_id).ok_or(ValidationError::NodeNotFound(node_id))?;
            require_live(node).map_err(GraphError::Validation)?;
            self.field_node_for(&inner, field_system_id).map_err(GraphError::Validation)?
        };
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(rows) = inner.properties.get_mut(&node_id) {
                rows.retain(|r| r.field_node_id != field_node_id);
            }
        }
        self.bus.emit(&MutationEvent::PropertyCleared { node_id, field_system_id: field_system_id.to_string(), timestamp: ts });
        Ok(())
    }

    async fn add_supertag(&self, node_id: NodeId, supertag_system_id: &str) -> Result<(), GraphError> {
        let ts = now();
        let field_node_id = {
            let inner = self.inner.lock().unwrap();
            let node = inner.nodes.get(&node_id).ok_or(ValidationError::NodeNotFound(node_id))?;
            require_live(node).map_err(GraphError::Validation)?;
            self.field_node_for(&inner, well_known::FIELD_SUPERTAG).map_err(GraphError::Validation)?
        };
        let already_present = {
            let inner = self.inner.lock().unwrap();
            inner.properties.get(&node_id).map(|rows| {
                rows.iter().any(|r| r.field_node_id == field_node_id && r.decoded_value() == Value::String(supertag_system_id.to_string()))
            }).unwrap_or(false)
        };
        if already_present {
            return Ok(());
        }
        let next_order = {
            let inner = self.inner.lock().unwrap();
            inner.properties.get(&node_id).map(|rows| rows.iter().filter(|r| r.field_node_id == field_node_id).map(|r| r.order).max()).flatten().map(|m| m + 1).unwrap_or(0)
        };
        let raw = Value::String(supertag_system_id.to_string()).to_json().to_string();
        {
            let mut inner = self.inner.lock().unwrap();
            let row_id = inner.next_row_id;
            inner.next_row_id += 1;
            inner.properties.entry(node_id).or_default().push(PropertyRow {
                row_id,
                node_id,
                field_node_id,
                raw_value: raw,
                order: next_order,
                created_at: ts,
                updated_at: ts,
            });
        }
        self.bus.emit(&MutationEvent::SupertagAdded { node_id, supertag_system_id: supertag_system_id.to_string(), timestamp: ts });
        Ok(())
    }

    async fn remove_supertag(&self, node_id: NodeId, supertag_system_id: &str) -> Result<(), GraphError> {
        let ts = now();
        let field_node_id = {
            let inner = self.inner.lock().unwrap();
            self.field_node_for(&inner, well_known::FIELD_SUPERTAG).map_err(GraphError::Validation)?
        };
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let rows = inner.properties.entry(node_id).or_default();
            let before = rows.len();
            rows.retain(|r| !(r.field_node_id == field_node_id && r.decoded_value() == Value::String(supertag_system_id.to_string())));
            before != rows.len()
        };
        if removed {
            self.bus.emit(&MutationEvent::SupertagRemoved { node_id, supertag_system_id: supertag_system_id.to_string(), timestamp: ts });
        }
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().unwrap();
        self.seed_system_node(&mut inner, well_known::FIELD_SUPERTAG, "Supertag");
        self.seed_system_node(&mut inner, well_known::FIELD_EXTENDS, "Extends");
        self.seed_system_node(&mut inner, well_known::FIELD_TYPE, "Field Type");
        self.seed_system_node(&mut inner, well_known::FIELD_DEFINITION, "Definition");
        self.seed_system_node(&mut inner, well_known::SUPERTAG_SUPERTAG, "Supertag");
        self.seed_system_node(&mut inner, well_known::SUPERTAG_FIELD, "Field");
        self.seed_system_node(&mut inner, well_known::SUPERTAG_SYSTEM, "System");
        self.seed_system_node(&mut inner, well_known::SUPERTAG_AUTOMATION, "Automation");
        self.seed_system_node(&mut inner, well_known::SUPERTAG_COMPUTED_FIELD, "Computed Field");
        for (sid, name) in [("supertag:item", "Item"), ("supertag:tag", "Tag"), ("supertag:command", "Command")] {
            self.seed_system_node(&mut inner, sid, name);
        }
        Ok(())
    }
}

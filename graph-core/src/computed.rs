//! Reactive computed-field aggregator (spec §4.8): COUNT/SUM/AVG/MIN/MAX
//! over a live query's result set.
//!
//! No literal teacher precedent for server-side aggregation exists; grounded
//! on the same subscribe/unsubscribe-handle shape as `automation`, reusing
//! the registry's already-maintained result set rather than re-querying
//! (spec §4.8: "no redundant query").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ids::{well_known, NodeId};
use crate::model::AssembledNode;
use crate::query::QueryDefinition;
use crate::reactor::{Delta, SubscriptionHandle, SubscriptionRegistry};
use crate::store::{CreateNodeOptions, GraphStore};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedFieldDefinition {
    pub name: String,
    pub aggregation: Aggregation,
    pub query: QueryDefinition,
    pub field_system_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ValueChange {
    pub id: u64,
    pub previous_value: Option<f64>,
    pub current_value: Option<f64>,
    pub changed_at: DateTime<Utc>,
}

type ChangeListener = Box<dyn Fn(ValueChange) + Send + Sync>;

struct ComputedFieldState {
    definition: ComputedFieldDefinition,
    current_value: Option<f64>,
    listeners: Vec<(u64, ChangeListener)>,
    next_listener_id: u64,
    handle: Option<SubscriptionHandle>,
}

pub struct ComputedFieldAggregator {
    store: Arc<dyn GraphStore>,
    registry: Arc<SubscriptionRegistry>,
    fields: Mutex<HashMap<u64, ComputedFieldState>>,
    next_id: AtomicU64,
}

impl ComputedFieldAggregator {
    pub fn new(store: Arc<dyn GraphStore>, registry: Arc<SubscriptionRegistry>) -> Arc<Self> {
        Arc::new(Self { store, registry, fields: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) })
    }

    pub async fn create(self: &Arc<Self>, definition: ComputedFieldDefinition) -> Result<u64, ValidationError> {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let aggregator = self.clone();

        let handle = self
            .registry
            .subscribe(definition.query.clone(), move |delta: Delta| {
                aggregator.on_delta(id, &delta);
            })
            .await
            .map_err(|e| ValidationError::InvalidValue(e.to_string()))?;

        let initial_results = handle.get_last_results();
        let initial_value = compute(&definition, &initial_results);

        self.fields.lock().unwrap().insert(
            id,
            ComputedFieldState { definition, current_value: initial_value, listeners: Vec::new(), next_listener_id: 1, handle: Some(handle) },
        );
        Ok(id)
    }

    pub fn get_value(&self, id: u64) -> Option<Option<f64>> { self.fields.lock().unwrap().get(&id).map(|f| f.current_value) }

    pub fn on_value_change(&self, id: u64, listener: impl Fn(ValueChange) + Send + Sync + 'static) -> Option<u64> {
        let mut fields = self.fields.lock().unwrap();
        let field = fields.get_mut(&id)?;
        let listener_id = field.next_listener_id;
        field.next_listener_id += 1;
        field.listeners.push((listener_id, Box::new(listener)));
        Some(listener_id)
    }

    pub fn unsubscribe_listener(&self, id: u64, listener_id: u64) {
        if let Some(field) = self.fields.lock().unwrap().get_mut(&id) {
            field.listeners.retain(|(lid, _)| *lid != listener_id);
        }
    }

    /// Force a recompute from the subscription's current result set
    /// without waiting for a delta (spec §4.8).
    pub fn recompute(&self, id: u64) {
        let mut fields = self.fields.lock().unwrap();
        let Some(field) = fields.get_mut(&id) else { return };
        let results = match &field.handle {
            Some(handle) => handle.get_last_results(),
            None => return,
        };
        let new_value = compute(&field.definition, &results);
        apply_new_value(id, field, new_value);
    }

    pub fn delete(&self, id: u64) {
        if let Some(field) = self.fields.lock().unwrap().remove(&id) {
            if let Some(handle) = field.handle {
                handle.unsubscribe();
            }
        }
    }

    pub fn clear(&self) {
        let mut fields = self.fields.lock().unwrap();
        for (_, field) in fields.drain() {
            if let Some(handle) = field.handle {
                handle.unsubscribe();
            }
        }
    }

    /// Load persisted computed-field definitions from `supertag:computed_field`
    /// nodes and re-register them (spec §6).
    pub async fn initialize(self: &Arc<Self>) -> Result<(), ValidationError> {
        let ids = self.store.list_live_node_ids().await.map_err(|e| ValidationError::InvalidValue(e.to_string()))?;
        for node_id in ids {
            let Some(assembled) = self.store.assemble(node_id).await.map_err(|e| ValidationError::InvalidValue(e.to_string()))? else { continue };
            if !assembled.has_supertag(well_known::SUPERTAG_COMPUTED_FIELD) {
                continue;
            }
            let Some(Value::String(raw)) = assembled.value(well_known::FIELD_DEFINITION) else { continue };
            match serde_json::from_str::<ComputedFieldDefinition>(&raw) {
                Ok(def) => {
                    self.create(def).await?;
                }
                Err(err) => tracing::warn!(node_id = %node_id, error = %err, "failed to parse persisted computed field definition"),
            }
        }
        Ok(())
    }

    fn on_delta(&self, id: u64, delta: &Delta) {
        let mut fields = self.fields.lock().unwrap();
        let Some(field) = fields.get_mut(&id) else { return };
        let results = match &field.handle {
            Some(handle) => handle.get_last_results(),
            None => return,
        };
        let _ = delta;
        let new_value = compute(&field.definition, &results);
        apply_new_value(id, field, new_value);
    }
}

fn apply_new_value(id: u64, field: &mut ComputedFieldState, new_value: Option<f64>) {
    // Strict inequality; `null` is distinct from `0` (spec §4.8).
    if new_value == field.current_value {
        return;
    }
    let change = ValueChange { id, previous_value: field.current_value, current_value: new_value, changed_at: Utc::now() };
    field.current_value = new_value;
    for (_, listener) in &field.listeners {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(change)));
        if outcome.is_err() {
            tracing::warn!("computed field value-change listener panicked");
        }
    }
}

fn compute(definition: &ComputedFieldDefinition, results: &[AssembledNode]) -> Option<f64> {
    match definition.aggregation {
        Aggregation::Count => Some(results.len() as f64),
        Aggregation::Sum | Aggregation::Avg | Aggregation::Min | Aggregation::Max => {
            let Some(field_id) = &definition.field_system_id else { return None };
            let values: Vec<f64> = results.iter().filter_map(|n| n.value(field_id)).filter_map(|v| v.coerce_number()).collect();
            if values.is_empty() {
                return None;
            }
            match definition.aggregation {
                Aggregation::Sum => Some(values.iter().sum()),
                Aggregation::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
                Aggregation::Min => values.into_iter().fold(f64::INFINITY, f64::min).into(),
                Aggregation::Max => values.into_iter().fold(f64::NEG_INFINITY, f64::max).into(),
                Aggregation::Count => unreachable!(),
            }
        }
    }
}

/// Persist a computed-field definition as a graph node (spec §6).
pub async fn persist_definition(store: &dyn GraphStore, definition: &ComputedFieldDefinition) -> Result<NodeId, ValidationError> {
    let json = serde_json::to_string(definition).map_err(|e| ValidationError::InvalidValue(e.to_string()))?;
    let node = store
        .create_node(CreateNodeOptions {
            content: Some(definition.name.clone()),
            supertag_system_id: Some(well_known::SUPERTAG_COMPUTED_FIELD.to_string()),
            ..Default::default()
        })
        .await
        .map_err(|e| match e {
            crate::error::GraphError::Validation(v) => v,
            crate::error::GraphError::Store(s) => ValidationError::InvalidValue(s.to_string()),
        })?;
    store.set_property(node.id, well_known::FIELD_DEFINITION, 0, Value::String(json)).await.map_err(|e| match e {
        crate::error::GraphError::Validation(v) => v,
        crate::error::GraphError::Store(s) => ValidationError::InvalidValue(s.to_string()),
    })?;
    Ok(node.id)
}

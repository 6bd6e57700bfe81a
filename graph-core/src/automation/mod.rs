//! Automation runner (spec §4.7): declarative rules firing actions on
//! subscription membership deltas.
//!
//! Grounded on the teacher's subscribe/unsubscribe-handle convention
//! (`core/src/reactor.rs`): an automation is itself a subscription, so the
//! runner is built entirely on top of `reactor::SubscriptionRegistry`
//! rather than introducing its own evaluation path. There is no literal
//! teacher precedent for declarative trigger/action rules; this module is
//! new relative to the teacher, grounded on that subscribe/unsubscribe
//! shape and on the error-isolation pattern used throughout the reactor.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AutomationActionError, ValidationError};
use crate::ids::{well_known, NodeId};
use crate::query::QueryDefinition;
use crate::reactor::{Delta, SubscriptionHandle, SubscriptionRegistry};
use crate::store::{CreateNodeOptions, GraphStore};
use crate::value::Value;
use crate::webhook::{build_node_context, WebhookQueue};

pub const DEFAULT_CYCLE_LIMIT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEvent {
    OnEnter,
    OnExit,
    OnChange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub query_definition: QueryDefinition,
    pub event: TriggerEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

/// `value` may be a literal or the `$now` sentinel (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionValue {
    Now,
    Literal(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Action {
    SetProperty { field_system_id: String, value: ActionValue },
    ClearProperty { field_system_id: String },
    AddSupertag { supertag_system_id: String },
    RemoveSupertag { supertag_system_id: String },
    Webhook { url: String, method: HttpMethod, headers: Option<HashMap<String, String>>, body: Option<serde_json::Value> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationDefinition {
    pub name: String,
    pub enabled: bool,
    pub trigger: Trigger,
    pub action: Action,
}

struct PendingFire {
    automation_id: u64,
    node_id: NodeId,
}

struct RegisteredAutomation {
    definition: AutomationDefinition,
    handle: Option<SubscriptionHandle>,
}

/// Executes automation actions for matching deltas, with a cycle-depth
/// counter bounding re-entrant chains (spec §4.7).
pub struct AutomationRunner {
    store: Arc<dyn GraphStore>,
    registry: Arc<SubscriptionRegistry>,
    webhook_queue: Arc<WebhookQueue>,
    definitions: Mutex<HashMap<u64, RegisteredAutomation>>,
    queue: Arc<Mutex<VecDeque<PendingFire>>>,
    next_id: AtomicU64,
    hard_limit: u32,
}

impl AutomationRunner {
    pub fn new(store: Arc<dyn GraphStore>, registry: Arc<SubscriptionRegistry>, webhook_queue: Arc<WebhookQueue>) -> Arc<Self> {
        Self::with_cycle_limit(store, registry, webhook_queue, DEFAULT_CYCLE_LIMIT)
    }

    pub fn with_cycle_limit(store: Arc<dyn GraphStore>, registry: Arc<SubscriptionRegistry>, webhook_queue: Arc<WebhookQueue>, hard_limit: u32) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            webhook_queue,
            definitions: Mutex::new(HashMap::new()),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            next_id: AtomicU64::new(1),
            hard_limit,
        })
    }

    /// Register an automation: subscribes to its trigger query. Disabled
    /// automations are stored but never fire (spec §4.7).
    pub async fn register(self: &Arc<Self>, definition: AutomationDefinition) -> Result<u64, AutomationActionError> {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let enabled = definition.enabled;
        let event = definition.trigger.event;
        let query = definition.trigger.query_definition.clone();

        let handle = if enabled {
            let queue = self.queue.clone();
            let handle = self
                .registry
                .subscribe(query, move |delta: Delta| {
                    enqueue_fires(&queue, id, event, &delta);
                })
                .await
                .map_err(|e| AutomationActionError::Store(crate::error::StoreError::Backend(anyhow::anyhow!(e.to_string()))))?;
            Some(handle)
        } else {
            None
        };

        self.definitions.lock().unwrap().insert(id, RegisteredAutomation { definition, handle });
        Ok(id)
    }

    pub fn unregister(&self, id: u64) {
        if let Some(reg) = self.definitions.lock().unwrap().remove(&id) {
            if let Some(handle) = reg.handle {
                handle.unsubscribe();
            }
        }
    }

    /// Load persisted automation definitions from `supertag:automation`
    /// nodes and re-register them (spec §6).
    pub async fn initialize(self: &Arc<Self>) -> Result<(), AutomationActionError> {
        for node_id_candidate in self.store.list_live_node_ids().await.map_err(AutomationActionError::Store)? {
            let Some(assembled) = self.store.assemble(node_id_candidate).await.map_err(AutomationActionError::Store)? else { continue };
            if !assembled.has_supertag(well_known::SUPERTAG_AUTOMATION) {
                continue;
            }
            let Some(Value::String(raw)) = assembled.value(well_known::FIELD_DEFINITION) else { continue };
            match serde_json::from_str::<AutomationDefinition>(&raw) {
                Ok(def) => {
                    self.register(def).await?;
                }
                Err(err) => tracing::warn!(node_id = %node_id_candidate, error = %err, "failed to parse persisted automation definition"),
            }
        }
        Ok(())
    }

    /// Drain all actions queued by deltas observed since the last drain,
    /// executing each with cycle-depth isolation (spec §4.7, testable
    /// property 9). Must be called by the engine facade after every
    /// subscription-registry drain so automation-triggered mutations are
    /// picked back up.
    pub async fn drain(self: &Arc<Self>) -> Result<(), ()> {
        let mut depth: u32 = 0;
        loop {
            let next = { self.queue.lock().unwrap().pop_front() };
            let Some(fire) = next else { break };

            if depth >= self.hard_limit {
                tracing::warn!(depth, limit = self.hard_limit, "automation cycle depth exceeded, skipping action");
                continue;
            }
            depth += 1;

            if let Err(err) = self.execute(fire.automation_id, fire.node_id).await {
                tracing::warn!(automation_id = fire.automation_id, node_id = %fire.node_id, error = %err, "automation action failed");
            }

            // Re-entrant mutations from this action may have queued more
            // fires via the registry's own delta delivery.
            let _ = self.registry.drain_pending().await;
        }
        Ok(())
    }

    async fn execute(&self, automation_id: u64, node_id: NodeId) -> Result<(), AutomationActionError> {
        let (action, automation_name) = {
            let defs = self.definitions.lock().unwrap();
            let Some(reg) = defs.get(&automation_id) else { return Ok(()) };
            if !reg.definition.enabled {
                return Ok(());
            }
            (reg.definition.action.clone(), reg.definition.name.clone())
        };

        match action {
            Action::SetProperty { field_system_id, value } => {
                let resolved = match value {
                    ActionValue::Now => Value::String(Utc::now().to_rfc3339()),
                    ActionValue::Literal(v) => v,
                };
                self.store.set_property(node_id, &field_system_id, 0, resolved).await.map_err(to_action_error)?;
            }
            Action::ClearProperty { field_system_id } => {
                self.store.clear_property(node_id, &field_system_id).await.map_err(to_action_error)?;
            }
            Action::AddSupertag { supertag_system_id } => {
                self.store.add_supertag(node_id, &supertag_system_id).await.map_err(to_action_error)?;
            }
            Action::RemoveSupertag { supertag_system_id } => {
                self.store.remove_supertag(node_id, &supertag_system_id).await.map_err(to_action_error)?;
            }
            Action::Webhook { url, method, headers, body } => {
                let context = build_node_context(self.store.as_ref(), node_id, automation_id, &automation_name).await.map_err(AutomationActionError::Store)?;
                self.webhook_queue.enqueue(automation_id, url, method, headers.unwrap_or_default(), body, context).await;
            }
        }
        Ok(())
    }
}

fn to_action_error(e: crate::error::GraphError) -> AutomationActionError {
    match e {
        crate::error::GraphError::Validation(v) => AutomationActionError::Validation(v),
        crate::error::GraphError::Store(s) => AutomationActionError::Store(s),
    }
}

fn enqueue_fires(queue: &Arc<Mutex<VecDeque<PendingFire>>>, automation_id: u64, event: TriggerEvent, delta: &Delta) {
    let ids: &[NodeId] = match event {
        TriggerEvent::OnEnter => &delta.added,
        TriggerEvent::OnExit => &delta.removed,
        TriggerEvent::OnChange => &delta.changed,
    };
    if ids.is_empty() {
        return;
    }
    let mut q = queue.lock().unwrap();
    for &node_id in ids {
        q.push_back(PendingFire { automation_id, node_id });
    }
}

/// Helper for persisting an automation definition as a graph node (spec
/// §6). Not used by `register` itself, which operates purely in memory;
/// callers that want persistence create the node explicitly.
pub async fn persist_definition(store: &dyn GraphStore, definition: &AutomationDefinition) -> Result<NodeId, ValidationError> {
    let json = serde_json::to_string(definition).map_err(|e| ValidationError::InvalidValue(e.to_string()))?;
    let node = store
        .create_node(CreateNodeOptions { content: Some(definition.name.clone()), supertag_system_id: Some(well_known::SUPERTAG_AUTOMATION.to_string()), ..Default::default() })
        .await
        .map_err(|e| match e {
            crate::error::GraphError::Validation(v) => v,
            crate::error::GraphError::Store(s) => ValidationError::InvalidValue(s.to_string()),
        })?;
    store
        .set_property(node.id, well_known::FIELD_DEFINITION, 0, Value::String(json))
        .await
        .map_err(|e| match e {
            crate::error::GraphError::Validation(v) => v,
            crate::error::GraphError::Store(s) => ValidationError::InvalidValue(s.to_string()),
        })?;
    Ok(node.id)
}

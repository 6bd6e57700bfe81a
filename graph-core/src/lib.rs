//! A reactive, uniform node/property knowledge graph: mutation-driven live
//! queries, cycle-limited automations, reactive aggregates, and an
//! at-least-once webhook queue.
//!
//! Grounded on the teacher's `Node` facade (`core/src/node.rs`): a single
//! owning type wires the store, event bus and reactive services together,
//! exposing both an explicit-builder form and a process-wide default (spec
//! §9).

pub mod automation;
pub mod computed;
pub mod error;
pub mod event;
pub mod ids;
pub mod model;
pub mod query;
pub mod reactor;
pub mod store;
pub mod value;
pub mod webhook;

use std::sync::{Arc, OnceLock};

use crate::automation::{AutomationDefinition, AutomationRunner};
use crate::computed::{ComputedFieldAggregator, ComputedFieldDefinition};
use crate::error::{EvaluationError, GraphError, SubscriptionError, ValidationError};
use crate::event::EventBus;
use crate::ids::NodeId;
use crate::model::{AssembledNode, GraphNode};
use crate::query::{eval, EvalResult, QueryDefinition};
use crate::reactor::{Delta, SubscriptionHandle, SubscriptionRegistry};
use crate::store::{CreateNodeOptions, GraphStore};
use crate::value::Value;
use crate::webhook::{Fetch, ReqwestFetch, WebhookQueue};

/// Tunables for an `Engine` instance (ambient configuration; spec §9
/// expansion — the teacher has no external config crate for this layer, so
/// a plain struct with named defaults plays the same role).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_debounce_ms: u64,
    pub smart_invalidation: bool,
    pub automation_cycle_limit: u32,
    pub webhook_max_attempts: u32,
    pub webhook_base_delay_ms: i64,
    pub webhook_max_delay_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_debounce_ms: 0,
            smart_invalidation: true,
            automation_cycle_limit: automation::DEFAULT_CYCLE_LIMIT,
            webhook_max_attempts: webhook::DEFAULT_MAX_ATTEMPTS,
            webhook_base_delay_ms: webhook::DEFAULT_BASE_DELAY_MS,
            webhook_max_delay_ms: webhook::DEFAULT_MAX_DELAY_MS,
        }
    }
}

/// The engine: owns the store, the event bus, the subscription registry,
/// the automation runner, the computed-field aggregator, and the webhook
/// queue. Every mutation goes through `Engine`'s wrapper methods so the
/// registry and automation runner are drained before the call returns
/// (spec §5: "all emitted events reach all listeners before the call
/// returns").
pub struct Engine {
    store: Arc<dyn GraphStore>,
    bus: Arc<EventBus>,
    pub registry: Arc<SubscriptionRegistry>,
    pub automations: Arc<AutomationRunner>,
    pub computed_fields: Arc<ComputedFieldAggregator>,
    pub webhooks: Arc<WebhookQueue>,
}

impl Engine {
    /// Explicit-builder form (spec §9): pass a concrete store. Tests
    /// instantiate this directly with `store::InMemoryGraphStore`.
    pub fn build(store: Arc<dyn GraphStore>, config: EngineConfig) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        Self::build_with_bus(store, bus, config, Arc::new(ReqwestFetch::default()))
    }

    pub fn build_with_bus(store: Arc<dyn GraphStore>, bus: Arc<EventBus>, config: EngineConfig, fetch: Arc<dyn Fetch>) -> Arc<Self> {
        let registry = SubscriptionRegistry::new(store.clone(), bus.clone());
        registry.set_default_debounce_ms(config.default_debounce_ms);
        registry.set_smart_invalidation(config.smart_invalidation);

        let webhooks = Arc::new(WebhookQueue::new(fetch).with_retry_policy(config.webhook_max_attempts, config.webhook_base_delay_ms, config.webhook_max_delay_ms));
        let automations = AutomationRunner::with_cycle_limit(store.clone(), registry.clone(), webhooks.clone(), config.automation_cycle_limit);
        let computed_fields = ComputedFieldAggregator::new(store.clone(), registry.clone());

        Arc::new(Self { store, bus, registry, automations, computed_fields, webhooks })
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> { &self.store }

    pub fn bus(&self) -> &Arc<EventBus> { &self.bus }

    /// Seed well-known system nodes, then re-register persisted automations
    /// and computed fields (spec §6).
    pub async fn initialize(self: &Arc<Self>) -> Result<(), GraphError> {
        self.store.bootstrap().await?;
        self.automations.initialize().await.map_err(automation_err_to_graph_err)?;
        self.computed_fields.initialize().await.map_err(GraphError::Validation)?;
        Ok(())
    }

    async fn after_mutation(self: &Arc<Self>) -> Result<(), SubscriptionError> {
        self.registry.drain_pending().await?;
        let _ = self.automations.drain().await;
        Ok(())
    }

    pub async fn create_node(self: &Arc<Self>, opts: CreateNodeOptions) -> Result<GraphNode, GraphError> {
        let node = self.store.create_node(opts).await?;
        self.after_mutation().await.map_err(subscription_err_to_graph_err)?;
        Ok(node)
    }

    pub async fn update_content(self: &Arc<Self>, id: NodeId, content: String) -> Result<GraphNode, GraphError> {
        let node = self.store.update_content(id, content).await?;
        self.after_mutation().await.map_err(subscription_err_to_graph_err)?;
        Ok(node)
    }

    pub async fn soft_delete(self: &Arc<Self>, id: NodeId) -> Result<(), GraphError> {
        self.store.soft_delete(id).await?;
        self.after_mutation().await.map_err(subscription_err_to_graph_err)?;
        Ok(())
    }

    pub async fn set_property(self: &Arc<Self>, node_id: NodeId, field_system_id: &str, order: i64, value: Value) -> Result<(), GraphError> {
        self.store.set_property(node_id, field_system_id, order, value).await?;
        self.after_mutation().await.map_err(subscription_err_to_graph_err)?;
        Ok(())
    }

    pub async fn add_property(self: &Arc<Self>, node_id: NodeId, field_system_id: &str, value: Value) -> Result<(), GraphError> {
        self.store.add_property(node_id, field_system_id, value).await?;
        self.after_mutation().await.map_err(subscription_err_to_graph_err)?;
        Ok(())
    }

    pub async fn clear_property(self: &Arc<Self>, node_id: NodeId, field_system_id: &str) -> Result<(), GraphError> {
        self.store.clear_property(node_id, field_system_id).await?;
        self.after_mutation().await.map_err(subscription_err_to_graph_err)?;
        Ok(())
    }

    pub async fn add_supertag(self: &Arc<Self>, node_id: NodeId, supertag_system_id: &str) -> Result<(), GraphError> {
        self.store.add_supertag(node_id, supertag_system_id).await?;
        self.after_mutation().await.map_err(subscription_err_to_graph_err)?;
        Ok(())
    }

    pub async fn remove_supertag(self: &Arc<Self>, node_id: NodeId, supertag_system_id: &str) -> Result<(), GraphError> {
        self.store.remove_supertag(node_id, supertag_system_id).await?;
        self.after_mutation().await.map_err(subscription_err_to_graph_err)?;
        Ok(())
    }

    pub async fn get(&self, id: NodeId) -> Result<Option<AssembledNode>, GraphError> { Ok(self.store.assemble_inherited(id).await?) }

    pub async fn query(&self, definition: &QueryDefinition) -> Result<EvalResult, EvaluationError> { eval::evaluate(self.store.as_ref(), definition).await }

    pub async fn subscribe(
        self: &Arc<Self>,
        definition: QueryDefinition,
        callback: impl Fn(Delta) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle, EvaluationError> {
        self.registry.subscribe(definition, callback).await
    }

    pub async fn register_automation(self: &Arc<Self>, definition: AutomationDefinition) -> Result<u64, ValidationError> {
        self.automations.register(definition).await.map_err(|e| match e {
            error::AutomationActionError::Validation(v) => v,
            error::AutomationActionError::Store(s) => ValidationError::InvalidValue(s.to_string()),
            error::AutomationActionError::CycleLimitExceeded(n) => ValidationError::InvalidValue(format!("cycle limit exceeded: {n}")),
        })
    }

    pub async fn create_computed_field(self: &Arc<Self>, definition: ComputedFieldDefinition) -> Result<u64, ValidationError> {
        self.computed_fields.create(definition).await
    }

    /// Drive the webhook queue's retry tick (spec §4.9). Callers run this
    /// on a fixed `process_interval_ms` timer; `process_queue` is
    /// re-entrant safe if called more often.
    pub async fn process_webhooks(&self) -> usize { self.webhooks.process_queue().await }
}

fn subscription_err_to_graph_err(e: SubscriptionError) -> GraphError {
    match e {
        SubscriptionError::Evaluation(ev) => GraphError::Validation(ValidationError::InvalidValue(ev.to_string())),
        SubscriptionError::Store(s) => GraphError::Store(s),
        SubscriptionError::NotFound => GraphError::Validation(ValidationError::InvalidValue("subscription not found".to_string())),
    }
}

fn automation_err_to_graph_err(e: error::AutomationActionError) -> GraphError {
    match e {
        error::AutomationActionError::Validation(v) => GraphError::Validation(v),
        error::AutomationActionError::Store(s) => GraphError::Store(s),
        error::AutomationActionError::CycleLimitExceeded(n) => GraphError::Validation(ValidationError::InvalidValue(format!("cycle limit exceeded: {n}"))),
    }
}

/// Process-wide default registry singleton (spec §9: "Provide both a
/// builder and a process-wide default"). Re-initializing from the same
/// process reuses it; intended for embedding contexts that don't carry an
/// explicit `Engine` handle through every call site. Tests use the builder
/// form via `Engine::build`.
static DEFAULT_ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

/// Install (or fetch) the process-wide default engine. Only the first
/// caller's store/config wins; subsequent calls return the existing
/// instance.
pub fn default_engine(store_factory: impl FnOnce() -> Arc<dyn GraphStore>) -> Arc<Engine> {
    DEFAULT_ENGINE.get_or_init(|| Engine::build(store_factory(), EngineConfig::default())).clone()
}

/// Fetch the process-wide default engine, if one has been installed.
pub fn try_default_engine() -> Option<Arc<Engine>> { DEFAULT_ENGINE.get().cloned() }

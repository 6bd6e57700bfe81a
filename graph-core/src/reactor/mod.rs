//! Subscription registry: live queries with diffed delivery (spec §4.4).
//!
//! Bridges the synchronous event bus (`event.rs`) with the async store and
//! evaluator. A bus listener is registered once at construction; it only
//! pushes the event onto an internal queue (cheap, non-blocking, safe to run
//! from inside `EventBus::emit`'s lock). The engine facade (`lib.rs`) drains
//! that queue with `drain_pending().await` immediately after every mutating
//! store call, which is how spec §5's "all emitted events reach all
//! listeners before the call returns" is honored despite the bus itself
//! being synchronous: the async drain is on the same call stack as the
//! mutation, just one layer up, in the facade rather than inside `emit`.

pub mod diff;
pub mod invalidation;
pub mod scheduler;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::error::{EvaluationError, SubscriptionError};
use crate::event::{EventBus, ListenerId, MutationEvent};
use crate::model::AssembledNode;
use crate::query::{eval, QueryDefinition};
use crate::store::GraphStore;

pub use diff::Delta;
pub use invalidation::{ChangeSet, Fingerprint};

pub type DeltaCallback = Box<dyn Fn(Delta) + Send + Sync>;

struct SubscriptionState {
    id: u64,
    definition: QueryDefinition,
    last_results: Vec<AssembledNode>,
    fingerprint: Fingerprint,
    debounce_ms: u64,
    callback: Arc<DeltaCallback>,
    /// Node ids named by mutation events since the last dispatched
    /// evaluation. Accumulated across an entire debounce window (not just
    /// the event that (re)armed the timer) so a burst of mutations against
    /// several different nodes all land in `touched` by the time the
    /// window fires — a single-event snapshot would only see the last
    /// mutation's node and silently drop the others from `changed`
    /// classification (spec §9's third open question).
    pending_touched: HashSet<crate::ids::NodeId>,
}

struct RegistryInner {
    subscriptions: std::collections::HashMap<u64, SubscriptionState>,
    pending_events: VecDeque<MutationEvent>,
    smart_invalidation: bool,
    default_debounce_ms: u64,
    skipped_evaluations: u64,
}

/// A live query plus its callback. Dropping the handle does not
/// unsubscribe; call `unsubscribe` explicitly or `registry.clear()` (spec
/// §9: both explicit disposal and scope-bound disposal are supported —
/// callers that want scope-bound behavior wrap the handle in their own
/// guard type).
pub struct SubscriptionHandle {
    pub id: u64,
    registry: Arc<SubscriptionRegistry>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) { self.registry.unsubscribe(self.id); }

    pub fn get_last_results(&self) -> Vec<AssembledNode> { self.registry.get_last_results(self.id).unwrap_or_default() }
}

pub struct SubscriptionRegistry {
    store: Arc<dyn GraphStore>,
    bus: Arc<EventBus>,
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
    listener_id: Mutex<Option<ListenerId>>,
    scheduler: scheduler::BatchScheduler,
}

impl SubscriptionRegistry {
    /// Construct an explicit-instance registry (spec §9 builder form).
    pub fn new(store: Arc<dyn GraphStore>, bus: Arc<EventBus>) -> Arc<Self> {
        let registry = Arc::new(Self {
            store,
            bus: bus.clone(),
            inner: Mutex::new(RegistryInner {
                subscriptions: std::collections::HashMap::new(),
                pending_events: VecDeque::new(),
                smart_invalidation: true,
                default_debounce_ms: 0,
                skipped_evaluations: 0,
            }),
            next_id: AtomicU64::new(1),
            listener_id: Mutex::new(None),
            scheduler: scheduler::BatchScheduler::new(),
        });

        let weak_inner = Arc::downgrade(&registry);
        let listener_id = bus.subscribe(move |event: &MutationEvent| {
            if let Some(registry) = weak_inner.upgrade() {
                registry.inner.lock().unwrap().pending_events.push_back(event.clone());
            }
        });
        *registry.listener_id.lock().unwrap() = Some(listener_id);

        registry
    }

    /// Evaluate once immediately and register. The callback is never
    /// invoked for these initial results (spec §4.4).
    pub async fn subscribe(
        self: &Arc<Self>,
        definition: QueryDefinition,
        callback: impl Fn(Delta) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle, EvaluationError> {
        let result = eval::evaluate(self.store.as_ref(), &definition).await?;
        let fingerprint = Fingerprint::from_definition(&definition);
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);

        let debounce_ms = {
            let inner = self.inner.lock().unwrap();
            inner.default_debounce_ms
        };

        let state = SubscriptionState {
            id,
            definition,
            last_results: result.nodes,
            fingerprint,
            debounce_ms,
            callback: Arc::new(Box::new(callback)),
            pending_touched: HashSet::new(),
        };
        self.inner.lock().unwrap().subscriptions.insert(id, state);

        Ok(SubscriptionHandle { id, registry: self.clone() })
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().unwrap().subscriptions.remove(&id);
        self.scheduler.clear_subscription(id);
    }

    pub fn get_last_results(&self, id: u64) -> Option<Vec<AssembledNode>> {
        self.inner.lock().unwrap().subscriptions.get(&id).map(|s| s.last_results.clone())
    }

    pub fn set_debounce_ms(&self, id: u64, ms: u64) {
        if let Some(sub) = self.inner.lock().unwrap().subscriptions.get_mut(&id) {
            sub.debounce_ms = ms;
        }
    }

    pub fn set_default_debounce_ms(&self, ms: u64) { self.inner.lock().unwrap().default_debounce_ms = ms; }

    pub fn set_smart_invalidation(&self, enabled: bool) { self.inner.lock().unwrap().smart_invalidation = enabled; }

    pub fn skipped_evaluations(&self) -> u64 { self.inner.lock().unwrap().skipped_evaluations }

    /// Drain events queued by the bus listener since the last drain,
    /// routing each to its candidate subscriptions. Called by the engine
    /// facade right after every mutating store call.
    pub async fn drain_pending(self: &Arc<Self>) -> Result<(), SubscriptionError> {
        let events: Vec<MutationEvent> = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending_events.drain(..).collect()
        };
        for event in events {
            self.route_event(&event).await?;
        }
        Ok(())
    }

    async fn route_event(self: &Arc<Self>, event: &MutationEvent) -> Result<(), SubscriptionError> {
        let change = ChangeSet::from_event(event);
        let node_id = event.node_id();

        let candidates: Vec<(u64, u64)> = {
            let mut inner = self.inner.lock().unwrap();
            let smart = inner.smart_invalidation;
            let mut out = Vec::new();
            for sub in inner.subscriptions.values_mut() {
                if invalidation::is_candidate(&sub.fingerprint, &change, smart) {
                    sub.pending_touched.insert(node_id);
                    out.push((sub.id, sub.debounce_ms));
                } else {
                    inner.skipped_evaluations += 1;
                }
            }
            out
        };

        for (sub_id, debounce_ms) in candidates {
            let registry = self.clone();
            self.scheduler
                .schedule(sub_id, debounce_ms, move || async move {
                    if let Err(err) = registry.process_subscription(sub_id).await {
                        tracing::warn!(subscription_id = sub_id, error = %err, "subscription evaluation failed");
                    }
                })
                .await;
        }
        Ok(())
    }

    /// Re-evaluate one subscription, diff against its stored results, and
    /// dispatch a non-empty delta. Used both by the debounce window firing
    /// and by `refresh_all`/`flush_pending_mutations`. Consumes (and
    /// clears) whatever `pending_touched` has accumulated since the last
    /// firing — possibly several mutations' worth if a debounce window
    /// coalesced a burst.
    async fn process_subscription(self: &Arc<Self>, sub_id: u64) -> Result<(), SubscriptionError> {
        let (definition, old_results, callback, touched) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(sub) = inner.subscriptions.get_mut(&sub_id) else { return Ok(()) };
            let touched = std::mem::take(&mut sub.pending_touched);
            (sub.definition.clone(), sub.last_results.clone(), sub.callback.clone(), touched)
        };

        let result = eval::evaluate(self.store.as_ref(), &definition).await?;
        let delta = diff::compute_delta(sub_id, &old_results, &result.nodes, &touched, result.total_count, result.evaluated_at);

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(sub) = inner.subscriptions.get_mut(&sub_id) {
                sub.last_results = result.nodes;
            }
        }

        if !delta.is_empty() {
            let callback = callback.clone();
            // Callback isolation: exceptions are logged and swallowed (spec
            // §4.4). Rust has no exceptions to catch post-hoc here; a
            // panicking callback is caught with `catch_unwind` so one
            // misbehaving subscriber cannot abort delivery to siblings.
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(delta)));
            if outcome.is_err() {
                tracing::warn!(subscription_id = sub_id, "subscription callback panicked");
            }
        }

        Ok(())
    }

    /// Force a re-evaluate-and-diff across every subscription, bypassing
    /// the event bus (spec §4.4).
    pub async fn refresh_all(self: &Arc<Self>) -> Result<(), SubscriptionError> {
        let ids: Vec<u64> = self.inner.lock().unwrap().subscriptions.keys().copied().collect();
        for id in ids {
            self.process_subscription(id).await?;
        }
        Ok(())
    }

    /// Fire every armed debounce window immediately (spec §4.6).
    pub async fn flush_pending_mutations(self: &Arc<Self>) -> Result<(), SubscriptionError> {
        for sub_id in self.scheduler.take_armed() {
            self.process_subscription(sub_id).await?;
        }
        Ok(())
    }

    /// Remove all subscriptions, cancel pending batches, drop the bus
    /// listener (spec §4.4).
    pub fn clear(&self) {
        self.inner.lock().unwrap().subscriptions.clear();
        self.scheduler.clear();
        if let Some(id) = self.listener_id.lock().unwrap().take() {
            self.bus.unsubscribe(id);
        }
    }
}

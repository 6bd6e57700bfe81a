//! The mutation event bus (spec §4.2).
//!
//! Single-process, synchronous, typed pub/sub: grounded on the teacher's
//! reactor/subscription idiom (`core/src/reactor.rs`'s `subscribe` ->
//! unsubscribe-handle shape) but applied to a flat fan-out rather than the
//! teacher's predicate-indexed watcher set — that indexing is reproduced,
//! generalized, in `reactor::invalidation`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::ids::NodeId;
use crate::value::Value;

/// One event per successful write (spec §3 invariant, §4.2 table).
#[derive(Debug, Clone)]
pub enum MutationEvent {
    NodeCreated { node_id: NodeId, system_id: Option<String>, supertag_system_id: Option<String>, timestamp: DateTime<Utc> },
    NodeUpdated { node_id: NodeId, before_content: Option<String>, after_content: Option<String>, timestamp: DateTime<Utc> },
    NodeDeleted { node_id: NodeId, timestamp: DateTime<Utc> },
    PropertySet {
        node_id: NodeId,
        field_system_id: String,
        order: i64,
        before_value: Option<Value>,
        after_value: Value,
        timestamp: DateTime<Utc>,
    },
    PropertyCleared { node_id: NodeId, field_system_id: String, timestamp: DateTime<Utc> },
    SupertagAdded { node_id: NodeId, supertag_system_id: String, timestamp: DateTime<Utc> },
    SupertagRemoved { node_id: NodeId, supertag_system_id: String, timestamp: DateTime<Utc> },
}

impl MutationEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            MutationEvent::NodeCreated { node_id, .. }
            | MutationEvent::NodeUpdated { node_id, .. }
            | MutationEvent::NodeDeleted { node_id, .. }
            | MutationEvent::PropertySet { node_id, .. }
            | MutationEvent::PropertyCleared { node_id, .. }
            | MutationEvent::SupertagAdded { node_id, .. }
            | MutationEvent::SupertagRemoved { node_id, .. } => *node_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MutationEvent::NodeCreated { timestamp, .. }
            | MutationEvent::NodeUpdated { timestamp, .. }
            | MutationEvent::NodeDeleted { timestamp, .. }
            | MutationEvent::PropertySet { timestamp, .. }
            | MutationEvent::PropertyCleared { timestamp, .. }
            | MutationEvent::SupertagAdded { timestamp, .. }
            | MutationEvent::SupertagRemoved { timestamp, .. } => *timestamp,
        }
    }
}

impl fmt::Display for MutationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationEvent::NodeCreated { node_id, .. } => write!(f, "node:created({node_id})"),
            MutationEvent::NodeUpdated { node_id, .. } => write!(f, "node:updated({node_id})"),
            MutationEvent::NodeDeleted { node_id, .. } => write!(f, "node:deleted({node_id})"),
            MutationEvent::PropertySet { node_id, field_system_id, .. } => write!(f, "property:set({node_id}, {field_system_id})"),
            MutationEvent::PropertyCleared { node_id, field_system_id, .. } => {
                write!(f, "property:cleared({node_id}, {field_system_id})")
            }
            MutationEvent::SupertagAdded { node_id, supertag_system_id, .. } => {
                write!(f, "supertag:added({node_id}, {supertag_system_id})")
            }
            MutationEvent::SupertagRemoved { node_id, supertag_system_id, .. } => {
                write!(f, "supertag:removed({node_id}, {supertag_system_id})")
            }
        }
    }
}

pub type ListenerId = u64;

type Listener = Box<dyn Fn(&MutationEvent) + Send + Sync>;

/// Synchronous, single-threaded fan-out. Listeners run on the thread that
/// called `emit`, in registration order; a panicking/erroring listener is
/// impossible to represent with a plain `Fn`, so callers that need
/// isolation (the subscription registry) catch their own errors inside the
/// listener closure rather than relying on the bus for it.
pub struct EventBus {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self { Self::new() }
}

impl EventBus {
    pub fn new() -> Self { Self { listeners: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) } }

    /// Subscribe; returns an id usable with `unsubscribe`. Order of
    /// delivery matches order of subscription (spec §4.2).
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where F: Fn(&MutationEvent) + Send + Sync + 'static {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        self.listeners.lock().unwrap().push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) { self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id); }

    pub fn listener_count(&self) -> usize { self.listeners.lock().unwrap().len() }

    pub fn clear(&self) { self.listeners.lock().unwrap().clear(); }

    /// Deliver synchronously, on the caller's thread, to all listeners
    /// registered at the time of the call (spec §4.2, §5). Listeners must
    /// not subscribe/unsubscribe re-entrantly — the bus is a plain `Mutex`,
    /// not a reentrant lock.
    pub fn emit(&self, event: &MutationEvent) {
        tracing::debug!(event = %event, "EventBus.emit");
        let guard = self.listeners.lock().unwrap();
        for (_, listener) in guard.iter() {
            listener(event);
        }
    }
}

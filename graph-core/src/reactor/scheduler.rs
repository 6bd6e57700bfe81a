//! Batch scheduler (spec §4.6): per-subscription debounce windows.
//!
//! Grounded on the teacher's timer-owning reactor loop (`core/src/reactor.rs`
//! drives re-evaluation off a tokio timer rather than a suspended
//! coroutine per subscriber, per spec §9's "no suspended coroutines per
//! subscription" note). Each armed window is a generation counter plus a
//! spawned `tokio::time::sleep`; a later event for the same subscription
//! bumps the generation, which makes the earlier sleep's wakeup a no-op
//! when it fires — this is how re-arming without cancelling a task handle
//! is achieved without pulling in a timer wheel crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct TimerSlot {
    generation: AtomicU64,
    /// Bumped whenever a flush/clear should make any in-flight sleep a
    /// no-op, independent of a freshly-armed window.
    armed: Mutex<bool>,
}

/// Owns debounce state for a set of subscriptions, identified by opaque
/// `u64` ids. Does not know about queries or callbacks; `BatchScheduler`
/// calls back into a supplied closure when a window elapses.
pub struct BatchScheduler {
    slots: Mutex<HashMap<u64, Arc<TimerSlot>>>,
}

impl Default for BatchScheduler {
    fn default() -> Self { Self::new() }
}

impl BatchScheduler {
    pub fn new() -> Self { Self { slots: Mutex::new(HashMap::new()) } }

    fn slot_for(&self, subscription_id: u64) -> Arc<TimerSlot> {
        self.slots.lock().unwrap().entry(subscription_id).or_insert_with(|| Arc::new(TimerSlot::default())).clone()
    }

    /// Arm (or re-arm) the debounce window for `subscription_id`. `on_fire`
    /// runs once the window elapses undisturbed by a later call. With
    /// `debounce_ms == 0` it runs immediately, synchronously, matching the
    /// "delivery is synchronous-on-return" rule (spec §5).
    pub async fn schedule<F, Fut>(&self, subscription_id: u64, debounce_ms: u64, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if debounce_ms == 0 {
            on_fire().await;
            return;
        }

        let slot = self.slot_for(subscription_id);
        let generation = slot.generation.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        *slot.armed.lock().unwrap() = true;

        let slot_for_task = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
            let still_current = slot_for_task.generation.load(AtomicOrdering::SeqCst) == generation;
            let still_armed = *slot_for_task.armed.lock().unwrap();
            if still_current && still_armed {
                *slot_for_task.armed.lock().unwrap() = false;
                on_fire().await;
            }
        });
    }

    /// Force-fire every armed window immediately (spec §4.6:
    /// `flush_pending_mutations`). The caller supplies the ids and fire
    /// closure since the scheduler itself holds no query/registry state.
    pub fn take_armed(&self) -> Vec<u64> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .filter_map(|(id, slot)| {
                let mut armed = slot.armed.lock().unwrap();
                if *armed {
                    *armed = false;
                    slot.generation.fetch_add(1, AtomicOrdering::SeqCst);
                    Some(*id)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Drop all pending buffers without firing (spec §4.6 `clear()`).
    pub fn clear(&self) {
        let slots = self.slots.lock().unwrap();
        for slot in slots.values() {
            *slot.armed.lock().unwrap() = false;
            slot.generation.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    pub fn clear_subscription(&self, subscription_id: u64) {
        if let Some(slot) = self.slots.lock().unwrap().remove(&subscription_id) {
            *slot.armed.lock().unwrap() = false;
            slot.generation.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }
}

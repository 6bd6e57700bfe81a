//! Delta computation for the subscription registry (spec §4.4).

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::ids::NodeId;
use crate::model::AssembledNode;

/// `{added, removed, changed, total_count, evaluated_at}` delivered to a
/// subscription callback when non-empty.
#[derive(Debug, Clone)]
pub struct Delta {
    pub subscription_id: u64,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub changed: Vec<NodeId>,
    pub total_count: usize,
    pub evaluated_at: DateTime<Utc>,
}

impl Delta {
    pub fn is_empty(&self) -> bool { self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty() }
}

/// Compute a delta between a subscription's previous result set and a fresh
/// evaluation.
///
/// `touched` is the set of node ids that a mutation event named since the
/// last evaluation (possibly empty, e.g. for `refresh_all`). Per the design
/// decision recorded in DESIGN.md resolving spec §9's third open question,
/// `changed` is the union of structural differences *and* nodes the caller
/// flags as touched — the source includes any mutation, not only ones that
/// move the externally visible shape.
pub fn compute_delta(
    subscription_id: u64,
    old_results: &[AssembledNode],
    new_results: &[AssembledNode],
    touched: &HashSet<NodeId>,
    total_count: usize,
    evaluated_at: DateTime<Utc>,
) -> Delta {
    let old_ids: HashSet<NodeId> = old_results.iter().map(|n| n.id).collect();
    let new_ids: HashSet<NodeId> = new_results.iter().map(|n| n.id).collect();

    let added: Vec<NodeId> = new_ids.difference(&old_ids).copied().collect();
    let removed: Vec<NodeId> = old_ids.difference(&new_ids).copied().collect();

    let mut changed = Vec::new();
    for new_node in new_results {
        if !old_ids.contains(&new_node.id) {
            continue;
        }
        let differs_structurally = old_results.iter().find(|n| n.id == new_node.id).map(|old| !old.structurally_eq(new_node)).unwrap_or(false);
        if differs_structurally || touched.contains(&new_node.id) {
            changed.push(new_node.id);
        }
    }

    Delta { subscription_id, added, removed, changed, total_count, evaluated_at }
}

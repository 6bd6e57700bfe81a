//! Smart invalidation index (spec §4.5).
//!
//! Dependency fingerprints are extracted once per subscription (at register
//! time) and compared against a per-mutation change set; a subscription is
//! a re-evaluation candidate iff the two intersect, mirroring the teacher's
//! predicate-indexed watcher set (`core/src/reactor.rs`) but expressed over
//! the closed `Filter` algebra instead of a generic predicate tree.

use std::collections::HashSet;

use crate::event::MutationEvent;
use crate::ids::NodeId;
use crate::query::{Filter, QueryDefinition, RelationType};

/// Compact dependency summary of a query definition.
#[derive(Debug, Clone, Default)]
pub struct Fingerprint {
    pub supertag_ids: HashSet<String>,
    pub field_ids: HashSet<String>,
    pub relation_targets: HashSet<NodeId>,
    pub references_content: bool,
    pub uses_temporal: bool,
}

impl Fingerprint {
    pub fn from_definition(def: &QueryDefinition) -> Self {
        let mut fp = Fingerprint::default();
        for filter in &def.filters {
            fp.absorb_filter(filter);
        }
        fp
    }

    fn absorb_filter(&mut self, filter: &Filter) {
        match filter {
            Filter::Supertag { id, .. } => {
                self.supertag_ids.insert(id.clone());
            }
            Filter::Property { field_system_id, .. } => {
                self.field_ids.insert(field_system_id.clone());
            }
            Filter::HasField { field_system_id, .. } => {
                self.field_ids.insert(field_system_id.clone());
            }
            Filter::Content { .. } => {
                self.references_content = true;
            }
            Filter::Temporal { .. } => {
                self.uses_temporal = true;
            }
            Filter::Relation { target_node_id, field_system_id, relation_type } => {
                if let Some(target) = target_node_id {
                    self.relation_targets.insert(*target);
                }
                if let Some(field) = field_system_id {
                    self.field_ids.insert(field.clone());
                }
                if matches!(relation_type, RelationType::LinksTo | RelationType::LinkedFrom) {
                    self.references_content = true;
                }
            }
            // `and`/`or`/`not` fingerprints are the union of their children.
            Filter::And(children) | Filter::Or(children) | Filter::Not(children) => {
                for child in children {
                    self.absorb_filter(child);
                }
            }
        }
    }

    fn intersects(&self, change: &ChangeSet) -> bool {
        // A node entering or leaving the live set can flip membership for a
        // query with no predicate touching that node at all — a no-filter
        // `QueryDefinition::default()`, a `has_field{negate: true}`, a
        // `not{...}` — none of which register anything in `supertag_ids`,
        // `field_ids`, or `relation_targets`. There is no fingerprint shape
        // that safely rules these out, so a node add/remove is always a
        // candidate regardless of what the fingerprint does or doesn't
        // reference (testable property 7: the candidate set must be a
        // superset of subscriptions with a non-empty diff).
        if change.touches_existence {
            return true;
        }
        if change.touches_content && self.references_content {
            return true;
        }
        if change.touches_hierarchy && !self.supertag_ids.is_empty() {
            return true;
        }
        if self.uses_temporal && (change.touches_content || !change.affected_node_ids.is_empty()) {
            return true;
        }
        if !self.supertag_ids.is_disjoint(&change.affected_supertag_ids) {
            return true;
        }
        if !self.field_ids.is_disjoint(&change.affected_field_ids) {
            return true;
        }
        if !self.relation_targets.is_disjoint(&change.affected_node_ids) {
            return true;
        }
        false
    }
}

/// Per-mutation change set derived from a single `MutationEvent`.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub affected_supertag_ids: HashSet<String>,
    pub affected_field_ids: HashSet<String>,
    pub affected_node_ids: HashSet<NodeId>,
    pub touches_content: bool,
    pub touches_hierarchy: bool,
    /// A node was created or deleted (as opposed to merely mutated) — see
    /// `Fingerprint::intersects`.
    pub touches_existence: bool,
}

impl ChangeSet {
    pub fn from_event(event: &MutationEvent) -> Self {
        let mut cs = ChangeSet { affected_node_ids: [event.node_id()].into_iter().collect(), ..Default::default() };
        match event {
            MutationEvent::NodeCreated { supertag_system_id, .. } => {
                cs.touches_hierarchy = true;
                cs.touches_existence = true;
                if let Some(s) = supertag_system_id {
                    cs.affected_supertag_ids.insert(s.clone());
                }
            }
            MutationEvent::NodeUpdated { .. } => {
                cs.touches_content = true;
            }
            MutationEvent::NodeDeleted { .. } => {
                cs.touches_hierarchy = true;
                cs.touches_content = true;
                cs.touches_existence = true;
            }
            MutationEvent::PropertySet { field_system_id, .. } | MutationEvent::PropertyCleared { field_system_id, .. } => {
                cs.affected_field_ids.insert(field_system_id.clone());
            }
            MutationEvent::SupertagAdded { supertag_system_id, .. } | MutationEvent::SupertagRemoved { supertag_system_id, .. } => {
                cs.touches_hierarchy = true;
                cs.affected_supertag_ids.insert(supertag_system_id.clone());
            }
        }
        cs
    }
}

/// Decide whether `fingerprint` is a re-evaluation candidate for `change`,
/// honoring the brute-force override (spec §4.5: "every subscription is a
/// candidate" when disabled).
pub fn is_candidate(fingerprint: &Fingerprint, change: &ChangeSet, smart_invalidation_enabled: bool) -> bool {
    if !smart_invalidation_enabled {
        return true;
    }
    fingerprint.intersects(change)
}

//! The query evaluator (spec §4.3): candidate set -> filter -> assemble ->
//! sort -> limit. A pure function of `(store, definition)`; no evaluator
//! state survives between calls. Grounded on `core/src/selection/filter.rs`'s
//! `evaluate_predicate`/`evaluate_expr` exhaustive match, restructured over
//! the closed `Filter` sum type defined in this module's parent.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::Utc;

use crate::error::EvaluationError;
use crate::ids::NodeId;
use crate::model::AssembledNode;
use crate::store::GraphStore;
use crate::value::{self, Value};

use super::{EvalResult, Filter, PropertyOp, QueryDefinition, RelationType, SortField, TemporalField, TemporalOp};

/// Evaluate a query definition against a store. Implements spec §4.3's
/// algorithm: candidate set, sequential filters with early exit, total
/// count captured before sort/limit, assembly with inheritance, sort,
/// limit.
pub async fn evaluate(store: &dyn GraphStore, def: &QueryDefinition) -> Result<EvalResult, EvaluationError> {
    let all_ids = store.list_live_node_ids().await?;
    let mut candidates: HashSet<NodeId> = all_ids.into_iter().collect();

    for filter in &def.filters {
        if candidates.is_empty() {
            break;
        }
        candidates = apply_filter(store, filter, &candidates).await?;
    }

    let total_count = candidates.len();

    let mut nodes = Vec::with_capacity(candidates.len());
    for id in candidates {
        if let Some(assembled) = store.assemble_inherited(id).await? {
            nodes.push(assembled);
        }
    }

    if let Some(sort) = &def.sort {
        sort_nodes(&mut nodes, sort);
    } else {
        // Deterministic default order: creation order via node id (ULIDs
        // are monotonically sortable).
        nodes.sort_by_key(|n| n.id);
    }

    if nodes.len() > def.limit {
        nodes.truncate(def.limit);
    }

    Ok(EvalResult { nodes, total_count, evaluated_at: Utc::now() })
}

/// Apply one filter to a candidate set, returning the subset that matches.
async fn apply_filter(store: &dyn GraphStore, filter: &Filter, candidates: &HashSet<NodeId>) -> Result<HashSet<NodeId>, EvaluationError> {
    match filter {
        Filter::Supertag { id, include_inherited } => apply_supertag(store, id, *include_inherited, candidates).await,
        Filter::Property { field_system_id, op, value } => apply_property(store, field_system_id, op, value.as_ref(), candidates).await,
        Filter::Content { query, case_sensitive } => apply_content(store, query, *case_sensitive, candidates).await,
        Filter::HasField { field_system_id, negate } => apply_has_field(store, field_system_id, *negate, candidates).await,
        Filter::Temporal { field, op, days, date } => apply_temporal(store, *field, *op, *days, *date, candidates).await,
        Filter::Relation { relation_type, target_node_id, field_system_id } => {
            apply_relation(store, *relation_type, target_node_id.as_ref(), field_system_id.as_deref(), candidates).await
        }
        Filter::And(filters) => {
            if filters.is_empty() {
                // Empty and/or returns the input (spec §4.3 edge case).
                return Ok(candidates.clone());
            }
            let mut current = candidates.clone();
            for f in filters {
                if current.is_empty() {
                    break;
                }
                current = Box::pin(apply_filter(store, f, &current)).await?;
            }
            Ok(current)
        }
        Filter::Or(filters) => {
            if filters.is_empty() {
                return Ok(candidates.clone());
            }
            let mut result = HashSet::new();
            for f in filters {
                let matched = Box::pin(apply_filter(store, f, candidates)).await?;
                result.extend(matched);
            }
            Ok(result)
        }
        Filter::Not(filters) => {
            // `not` with no sub-filters is empty (spec §4.3 edge case),
            // regardless of the candidate set. Otherwise the complement of
            // the conjunction of its sub-filters (implicit AND group).
            if filters.is_empty() {
                return Ok(HashSet::new());
            }
            let mut matched = candidates.clone();
            for f in filters {
                if matched.is_empty() {
                    break;
                }
                matched = Box::pin(apply_filter(store, f, &matched)).await?;
            }
            Ok(candidates.difference(&matched).copied().collect())
        }
    }
}

async fn apply_supertag(store: &dyn GraphStore, id: &str, include_inherited: bool, candidates: &HashSet<NodeId>) -> Result<HashSet<NodeId>, EvaluationError> {
    let mut target_ids: HashSet<String> = HashSet::new();
    target_ids.insert(id.to_string());
    if include_inherited {
        for descendant in store.supertag_descendants(id).await? {
            target_ids.insert(descendant);
        }
    }

    let mut out = HashSet::new();
    for &node_id in candidates {
        if let Some(assembled) = store.assemble(node_id).await? {
            if assembled.supertags.iter().any(|s| target_ids.contains(&s.system_id)) {
                out.insert(node_id);
            }
        }
    }
    Ok(out)
}

async fn apply_property(
    store: &dyn GraphStore,
    field_system_id: &str,
    op: &PropertyOp,
    value: Option<&Value>,
    candidates: &HashSet<NodeId>,
) -> Result<HashSet<NodeId>, EvaluationError> {
    // Unknown field identifier -> empty result for most filters (no field
    // node to resolve against). We treat "unknown" as "never seen on any
    // candidate assembly" rather than a separate registry lookup, since
    // fields are themselves graph nodes the evaluator has no privileged
    // index into beyond assembly.
    let mut out = HashSet::new();
    for &node_id in candidates {
        let Some(assembled) = store.assemble(node_id).await? else { continue };
        if property_matches(&assembled, field_system_id, op, value) {
            out.insert(node_id);
        }
    }
    Ok(out)
}

fn property_matches(assembled: &AssembledNode, field_system_id: &str, op: &PropertyOp, value: Option<&Value>) -> bool {
    let values = assembled.values(field_system_id);

    match op {
        PropertyOp::IsEmpty => return values.is_empty(),
        PropertyOp::IsNotEmpty => return !values.is_empty(),
        _ => {}
    }

    let Some(rhs) = value else { return false };

    match op {
        PropertyOp::Eq => values.iter().any(|v| value_eq_case_insensitive(v, rhs)),
        PropertyOp::Neq => !values.is_empty() && values.iter().all(|v| !value_eq_case_insensitive(v, rhs)),
        PropertyOp::Gt => values.iter().any(|v| value::compare(v, rhs, |o| o == Ordering::Greater)),
        PropertyOp::Gte => values.iter().any(|v| value::compare(v, rhs, |o| o != Ordering::Less)),
        PropertyOp::Lt => values.iter().any(|v| value::compare(v, rhs, |o| o == Ordering::Less)),
        PropertyOp::Lte => values.iter().any(|v| value::compare(v, rhs, |o| o != Ordering::Greater)),
        PropertyOp::Contains => string_op(&values, rhs, |hay, needle| hay.contains(needle)),
        PropertyOp::StartsWith => string_op(&values, rhs, |hay, needle| hay.starts_with(needle)),
        PropertyOp::EndsWith => string_op(&values, rhs, |hay, needle| hay.ends_with(needle)),
        PropertyOp::IsEmpty | PropertyOp::IsNotEmpty => unreachable!("handled above"),
    }
}

fn value_eq_case_insensitive(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.to_lowercase() == y.to_lowercase(),
        _ => a == b,
    }
}

/// String-only ops; type mismatch (non-string operand) is `false`, not an
/// error (spec §4.3 edge case). Matches if ANY value in a multi-valued
/// property satisfies the predicate, case-insensitively.
fn string_op(values: &[Value], rhs: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    let Some(needle) = rhs.as_str() else { return false };
    let needle = needle.to_lowercase();
    values.iter().any(|v| v.as_str().map(|hay| f(&hay.to_lowercase(), &needle)).unwrap_or(false))
}

async fn apply_content(store: &dyn GraphStore, query: &str, case_sensitive: bool, candidates: &HashSet<NodeId>) -> Result<HashSet<NodeId>, EvaluationError> {
    if query.is_empty() {
        // Empty query matches all candidates (spec §4.3 edge case).
        return Ok(candidates.clone());
    }
    let needle = if case_sensitive { query.to_string() } else { query.to_lowercase() };

    let mut out = HashSet::new();
    for &node_id in candidates {
        let Some(node) = store.get_node(node_id).await? else { continue };
        let haystack = node.content.unwrap_or_default();
        let haystack = if case_sensitive { haystack } else { haystack.to_lowercase() };
        if haystack.contains(&needle) {
            out.insert(node_id);
        }
    }
    Ok(out)
}

async fn apply_has_field(store: &dyn GraphStore, field_system_id: &str, negate: bool, candidates: &HashSet<NodeId>) -> Result<HashSet<NodeId>, EvaluationError> {
    let mut out = HashSet::new();
    for &node_id in candidates {
        let Some(assembled) = store.assemble(node_id).await? else { continue };
        let present = assembled.has_field(field_system_id);
        if present != negate {
            out.insert(node_id);
        }
    }
    Ok(out)
}

async fn apply_temporal(
    store: &dyn GraphStore,
    field: TemporalField,
    op: TemporalOp,
    days: Option<i64>,
    date: Option<chrono::DateTime<Utc>>,
    candidates: &HashSet<NodeId>,
) -> Result<HashSet<NodeId>, EvaluationError> {
    let mut out = HashSet::new();
    for &node_id in candidates {
        let Some(node) = store.get_node(node_id).await? else { continue };
        let ts = match field {
            TemporalField::CreatedAt => node.created_at,
            TemporalField::UpdatedAt => node.updated_at,
        };
        let matches = match op {
            // Inclusive lower bound.
            TemporalOp::Within => {
                let cutoff = Utc::now() - chrono::Duration::days(days.unwrap_or(0));
                ts >= cutoff
            }
            // Strict upper bound.
            TemporalOp::Before => date.map(|d| ts < d).unwrap_or(false),
            // Inclusive lower bound.
            TemporalOp::After => date.map(|d| ts >= d).unwrap_or(false),
        };
        if matches {
            out.insert(node_id);
        }
    }
    Ok(out)
}

async fn apply_relation(
    store: &dyn GraphStore,
    relation_type: RelationType,
    target_node_id: Option<&NodeId>,
    field_system_id: Option<&str>,
    candidates: &HashSet<NodeId>,
) -> Result<HashSet<NodeId>, EvaluationError> {
    match relation_type {
        RelationType::ChildOf | RelationType::OwnedBy => {
            let mut out = HashSet::new();
            for &node_id in candidates {
                let Some(node) = store.get_node(node_id).await? else { continue };
                let matches = match (node.owner_id, target_node_id) {
                    (Some(owner), Some(target)) => owner == *target,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if matches {
                    out.insert(node_id);
                }
            }
            Ok(out)
        }
        RelationType::LinksTo => {
            let mut out = HashSet::new();
            for &node_id in candidates {
                let Some(assembled) = store.assemble(node_id).await? else { continue };
                let refs: Vec<Value> = match field_system_id {
                    Some(fid) => assembled.values(fid),
                    None => assembled.fields_by_system_id.values().flatten().map(|e| e.value.clone()).collect(),
                };
                let matches = refs.iter().any(|v| match target_node_id {
                    Some(target) => matches_node_ref(v, target),
                    // No explicit target: any reference-shaped value counts.
                    None => v.looks_like_node_id(),
                });
                if matches {
                    out.insert(node_id);
                }
            }
            Ok(out)
        }
        RelationType::LinkedFrom => {
            // The inverse of `linksTo`: requires a concrete target whose
            // properties are scanned for a reference back to each candidate.
            let Some(target) = target_node_id else { return Ok(HashSet::new()) };
            let Some(assembled) = store.assemble(*target).await? else { return Ok(HashSet::new()) };
            let refs: Vec<Value> = match field_system_id {
                Some(fid) => assembled.values(fid),
                None => assembled.fields_by_system_id.values().flatten().map(|e| e.value.clone()).collect(),
            };
            let mut out = HashSet::new();
            for &node_id in candidates {
                if refs.iter().any(|v| matches_node_ref(v, &node_id)) {
                    out.insert(node_id);
                }
            }
            Ok(out)
        }
    }
}

fn matches_node_ref(value: &Value, target: &NodeId) -> bool {
    match value {
        Value::NodeRef(id) => id == target,
        Value::String(s) => s == &target.to_string(),
        Value::List(items) => items.iter().any(|v| matches_node_ref(v, target)),
        _ => false,
    }
}

fn sort_nodes(nodes: &mut [AssembledNode], sort: &super::SortSpec) {
    let reverse = matches!(sort.direction, super::SortDirection::Desc);
    nodes.sort_by(|a, b| match &sort.field {
        SortField::Content => compare_missing_last(a.content.as_deref(), b.content.as_deref(), str_cmp, reverse),
        SortField::CreatedAt => a.created_at.cmp(&b.created_at).pipe(reverse),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at).pipe(reverse),
        SortField::SystemId => compare_missing_last(a.system_id.as_deref(), b.system_id.as_deref(), str_cmp, reverse),
        SortField::Property(key) => compare_missing_last(a.value(key).as_ref(), b.value(key).as_ref(), value_cmp, reverse),
    });
}

trait Pipe {
    fn pipe(self, reverse: bool) -> Self;
}

impl Pipe for Ordering {
    fn pipe(self, reverse: bool) -> Self { if reverse { self.reverse() } else { self } }
}

/// Locale-aware string comparison. We approximate locale sensitivity with a
/// case-insensitive, then case-sensitive tiebreak, since a full ICU
/// collation table is out of scope.
fn str_cmp(a: &str, b: &str) -> Ordering { a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)) }

fn value_cmp(a: &Value, b: &Value) -> Ordering { a.partial_cmp(b).unwrap_or(Ordering::Equal) }

/// Missing values sort last regardless of direction (spec §4.3 edge case):
/// only the present/present comparison is subject to `reverse`.
fn compare_missing_last<T>(a: Option<T>, b: Option<T>, cmp: impl Fn(T, T) -> Ordering, reverse: bool) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp(a, b).pipe(reverse),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

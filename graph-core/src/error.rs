//! Error taxonomy for the reactive knowledge-graph core.
//!
//! Mirrors the split the teacher codebase uses (a closed `thiserror` enum
//! per component boundary) but collapses it to the handful of kinds spec'd
//! in the error-handling design: `ValidationError` and `StoreError` are
//! returned to callers from mutation APIs; `EvaluationError`,
//! `SubscriptionError` (callback-adjacent failures), `AutomationActionError`
//! and `WebhookError` are logged and isolated rather than propagated, per
//! the reactive-dispatch isolation rule.

use thiserror::Error;

use crate::ids::NodeId;

/// Returned by write APIs for structural violations. No event is emitted
/// when a mutation fails with this error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node is soft-deleted: {0}")]
    NodeDeleted(NodeId),

    #[error("system id already in use: {0}")]
    DuplicateSystemId(String),

    #[error("invalid system id: {0}")]
    InvalidSystemId(String),

    #[error("invalid property value: {0}")]
    InvalidValue(String),
}

/// Returned by the store for I/O failures in the underlying physical store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Surfaced from mutation and retrieval APIs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Evaluator failures. These never propagate to a subscription caller —
/// the cycle is logged and the subscription's `last_results` is left
/// untouched (spec §7: "subscription remains registered").
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("unknown field in filter: {0}")]
    UnknownField(String),

    #[error("malformed filter: {0}")]
    MalformedFilter(String),

    #[error("store error during evaluation: {0}")]
    Store(String),
}

impl From<StoreError> for EvaluationError {
    fn from(e: StoreError) -> Self { EvaluationError::Store(e.to_string()) }
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription not found")]
    NotFound,

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A single automation action failed. The chain continues; depth is not
/// reset (spec §7).
#[derive(Debug, Error)]
pub enum AutomationActionError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("automation cycle depth exceeded: {0}")]
    CycleLimitExceeded(u32),
}

/// Outbound webhook delivery failures. These drive the retry/backoff state
/// machine rather than bubbling up to a caller.
#[derive(Debug, Error, Clone)]
pub enum WebhookError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {reason}")]
    Http { status: u16, reason: String },
}

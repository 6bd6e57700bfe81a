//! Shared test harness: an in-memory `Engine` plus a recording mock
//! `Fetch`, following the teacher's `core/tests/common.rs` convention of
//! a small shared module imported by each integration test file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use graph_core::event::EventBus;
use graph_core::store::InMemoryGraphStore;
use graph_core::webhook::{Fetch, FetchResponse};
use graph_core::{Engine, EngineConfig};
use serde_json::Value as Json;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Json>,
}

/// A `Fetch` impl that records every call and returns pre-programmed
/// responses (or errors) in sequence, falling back to `200 OK` once
/// exhausted. Tests that need transient-then-success behavior push a
/// `Err` followed by an `Ok` onto `responses`.
pub struct MockFetch {
    pub requests: Mutex<Vec<RecordedRequest>>,
    pub responses: Mutex<Vec<Result<FetchResponse, graph_core::error::WebhookError>>>,
}

impl MockFetch {
    pub fn new() -> Arc<Self> { Arc::new(Self { requests: Mutex::new(Vec::new()), responses: Mutex::new(Vec::new()) }) }

    /// Queue `n` transient failures before the (implicit) success.
    pub fn fail_times(self: &Arc<Self>, n: usize) {
        let mut responses = self.responses.lock().unwrap();
        for _ in 0..n {
            responses.push(Err(graph_core::error::WebhookError::Transport("connection reset".to_string())));
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> { self.requests.lock().unwrap().clone() }
}

#[async_trait]
impl Fetch for MockFetch {
    async fn fetch(&self, method: &str, url: &str, headers: &HashMap<String, String>, body: Option<&Json>) -> Result<FetchResponse, graph_core::error::WebhookError> {
        self.requests.lock().unwrap().push(RecordedRequest { method: method.to_string(), url: url.to_string(), headers: headers.clone(), body: body.cloned() });
        let queued = self.responses.lock().unwrap().pop();
        match queued {
            Some(result) => result,
            None => Ok(FetchResponse { status: 200, reason: "OK".to_string() }),
        }
    }
}

/// Build a fresh, bootstrapped engine over `InMemoryGraphStore` with a
/// `MockFetch` the caller can inspect. Mirrors `Engine::build`'s
/// explicit-builder form (spec §9).
pub async fn test_engine() -> (Arc<Engine>, Arc<MockFetch>) {
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(InMemoryGraphStore::new(bus.clone()));
    let fetch = MockFetch::new();
    let engine = Engine::build_with_bus(store, bus, EngineConfig::default(), fetch.clone());
    engine.initialize().await.unwrap();
    (engine, fetch)
}

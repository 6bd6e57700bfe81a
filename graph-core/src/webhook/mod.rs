//! At-least-once webhook delivery queue (spec §4.9).
//!
//! No teacher precedent exists for outbound HTTP delivery; grounded on the
//! `reqwest` usage patterns in the wider example pack (`dpc-rostra`'s
//! bot scrapers, `TheCowboyAI-cim-infrastructure`'s optional `netbox`
//! feature) for the dependency choice, and on this crate's own
//! retry/backoff idiom (`thiserror`-typed failures, `tracing` for
//! observability) for the rest.

pub mod template;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as Json};

use crate::automation::HttpMethod;
use crate::error::{StoreError, WebhookError};
use crate::ids::NodeId;
use crate::model::AssembledNode;
use crate::store::GraphStore;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: i64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WebhookAction {
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body: Option<Json>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub automation_id: u64,
    pub action: WebhookAction,
    pub context: Json,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Outbound fetch as an injectable dependency (spec §4.9); tests provide a
/// mock implementation.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, method: &str, url: &str, headers: &HashMap<String, String>, body: Option<&Json>) -> Result<FetchResponse, WebhookError>;
}

pub struct FetchResponse {
    pub status: u16,
    pub reason: String,
}

/// Production fetch backed by `reqwest` (rustls-tls, json feature).
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl Default for ReqwestFetch {
    fn default() -> Self { Self { client: reqwest::Client::new() } }
}

#[async_trait]
impl Fetch for ReqwestFetch {
    async fn fetch(&self, method: &str, url: &str, headers: &HashMap<String, String>, body: Option<&Json>) -> Result<FetchResponse, WebhookError> {
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| WebhookError::Transport(e.to_string()))?;
        let mut request = self.client.request(method, url);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| WebhookError::Transport(e.to_string()))?;
        let status = response.status();
        Ok(FetchResponse { status: status.as_u16(), reason: status.canonical_reason().unwrap_or("unknown").to_string() })
    }
}

struct JobState {
    jobs: HashMap<u64, Job>,
    next_id: u64,
}

/// Queue owner: enqueues jobs, interpolates templates at delivery time,
/// retries with exponential backoff, and serializes concurrent ticks via a
/// processing guard so `process_queue` is safely re-entrant (spec §4.9,
/// §5).
pub struct WebhookQueue {
    state: Mutex<JobState>,
    fetch: Arc<dyn Fetch>,
    processing: AtomicBool,
    max_attempts: u32,
    base_delay_ms: i64,
    max_delay_ms: i64,
    tick_counter: AtomicU64,
}

impl WebhookQueue {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self {
            state: Mutex::new(JobState { jobs: HashMap::new(), next_id: 1 }),
            fetch,
            processing: AtomicBool::new(false),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            tick_counter: AtomicU64::new(0),
        }
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, base_delay_ms: i64, max_delay_ms: i64) -> Self {
        self.max_attempts = max_attempts;
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub async fn enqueue(&self, automation_id: u64, url: String, method: HttpMethod, headers: HashMap<String, String>, body: Option<Json>, context: Json) -> u64 {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.jobs.insert(
            id,
            Job {
                id,
                automation_id,
                action: WebhookAction { url, method, headers, body },
                context,
                attempts: 0,
                max_attempts: self.max_attempts,
                status: JobStatus::Pending,
                last_error: None,
                next_retry_at: None,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn get_job(&self, id: u64) -> Option<Job> { self.state.lock().unwrap().jobs.get(&id).cloned() }

    pub fn get_pending_jobs(&self) -> Vec<Job> { self.state.lock().unwrap().jobs.values().filter(|j| j.status == JobStatus::Pending).cloned().collect() }

    pub fn clear(&self) { self.state.lock().unwrap().jobs.clear(); }

    pub fn tick_count(&self) -> u64 { self.tick_counter.load(AtomicOrdering::SeqCst) }

    /// Process all due pending jobs once. Re-entrant safe: a concurrent
    /// call observes the guard already held and returns immediately.
    pub async fn process_queue(&self) -> usize {
        if self.processing.swap(true, AtomicOrdering::SeqCst) {
            return 0;
        }
        self.tick_counter.fetch_add(1, AtomicOrdering::SeqCst);

        let due_ids: Vec<u64> = {
            let state = self.state.lock().unwrap();
            let now = Utc::now();
            let mut ids: Vec<u64> = state
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Pending && j.next_retry_at.map(|t| t <= now).unwrap_or(true))
                .map(|j| j.id)
                .collect();
            // Webhook job execution preserves enqueue order within a
            // retry pass (spec §5).
            ids.sort_unstable();
            ids
        };

        let mut processed = 0;
        for id in &due_ids {
            self.deliver_one(*id).await;
            processed += 1;
        }

        self.processing.store(false, AtomicOrdering::SeqCst);
        processed
    }

    async fn deliver_one(&self, id: u64) {
        let job = { self.state.lock().unwrap().jobs.get(&id).cloned() };
        let Some(job) = job else { return };

        let url = template::interpolate_str(&job.action.url, &job.context);
        let mut headers: HashMap<String, String> =
            job.action.headers.iter().map(|(k, v)| (k.clone(), template::interpolate_str(v, &job.context))).collect();
        let body = job.action.body.as_ref().map(|b| template::interpolate_json(b, &job.context));

        let method = job.action.method.as_str();
        if body.is_some() && !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }

        let outcome = self.fetch.fetch(method, &url, &headers, body.as_ref()).await;

        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(&id) else { return };
        job.attempts += 1;

        let failure = match outcome {
            Ok(resp) if (200..300).contains(&resp.status) => None,
            Ok(resp) => Some(format!("HTTP {}: {}", resp.status, resp.reason)),
            Err(WebhookError::Http { status, reason }) => Some(format!("HTTP {status}: {reason}")),
            Err(WebhookError::Transport(msg)) => Some(msg),
        };

        match failure {
            None => {
                job.status = JobStatus::Completed;
                job.last_error = None;
                job.next_retry_at = None;
            }
            Some(err) => {
                job.last_error = Some(err);
                if job.attempts < job.max_attempts {
                    let delay_ms = (self.base_delay_ms * 2i64.pow(job.attempts.saturating_sub(1))).min(self.max_delay_ms);
                    job.status = JobStatus::Pending;
                    job.next_retry_at = Some(Utc::now() + chrono::Duration::milliseconds(delay_ms));
                } else {
                    job.status = JobStatus::Failed;
                    job.next_retry_at = None;
                }
            }
        }
    }
}

/// Build the `{node, automation, timestamp}` interpolation context for an
/// automation-triggered webhook (spec §4.9, §6). `computed_field` contexts
/// are assembled directly by the computed-field aggregator, which has no
/// node to resolve.
pub async fn build_node_context(store: &dyn GraphStore, node_id: NodeId, automation_id: u64, automation_name: &str) -> Result<Json, StoreError> {
    let assembled = store.assemble(node_id).await?;
    let node_json = assembled.as_ref().map(node_to_json).unwrap_or(Json::Null);
    Ok(json!({
        "node": node_json,
        "automation": {"id": automation_id, "name": automation_name},
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

fn node_to_json(node: &AssembledNode) -> Json {
    let mut fields = serde_json::Map::new();
    for (key, entries) in &node.fields_by_system_id {
        if let Some(first) = entries.first() {
            fields.insert(key.clone(), first.value.to_json());
        }
    }
    for (key, entries) in &node.fields_by_name {
        if let Some(first) = entries.first() {
            fields.entry(key.clone()).or_insert_with(|| first.value.to_json());
        }
    }
    json!({
        "id": node.id.to_string(),
        "content": node.content,
        "systemId": node.system_id,
        "fields": Json::Object(fields),
    })
}

//! In-memory [`EntityApi`] with canned responses for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chemfetch_core::{Asset, JsonMap, Payload};
use chemfetch_storage::FetchError;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{EntityApi, ListKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Search,
    Detail,
    Relation,
    List(ListKind),
    Asset,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub endpoint: Endpoint,
    pub key: String,
    pub cursor: Option<String>,
    pub at: Instant,
}

/// Unknown keys answer like a 404. Failures are reported as HTTP 503.
#[derive(Debug, Default)]
pub struct ScriptedApi {
    search: HashMap<String, Payload>,
    detail: HashMap<String, Payload>,
    relation: HashMap<String, Payload>,
    pages: HashMap<(ListKind, String), Vec<Vec<JsonValue>>>,
    page_payloads: HashMap<(ListKind, String), Payload>,
    assets: HashMap<String, Asset>,
    failures: HashSet<(Endpoint, String)>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

fn object(value: JsonValue) -> Payload {
    match value {
        JsonValue::Object(map) => Payload::Structured(map),
        other => Payload::RawText(other.to_string()),
    }
}

fn cursor_key(id: &str, cursor: &str) -> String {
    format!("{id}#{cursor}")
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candidates(mut self, name: &str, candidates: Vec<JsonValue>) -> Self {
        self.search
            .insert(name.to_string(), object(json!({ "candidates": candidates })));
        self
    }

    pub fn with_search_payload(mut self, name: &str, payload: Payload) -> Self {
        self.search.insert(name.to_string(), payload);
        self
    }

    pub fn with_detail(self, id: &str, detail: JsonValue) -> Self {
        self.with_detail_payload(id, object(detail))
    }

    pub fn with_detail_payload(mut self, id: &str, payload: Payload) -> Self {
        self.detail.insert(id.to_string(), payload);
        self
    }

    pub fn with_relation(mut self, id: &str, relation: JsonValue) -> Self {
        self.relation.insert(id.to_string(), object(relation));
        self
    }

    /// Serves `pages` in order. Page `n` (1-based) links to the next one with
    /// the cursor `page-{n+1}`; the last page carries no cursor.
    pub fn with_list_pages(
        mut self,
        kind: ListKind,
        id: &str,
        pages: Vec<Vec<JsonValue>>,
    ) -> Self {
        self.pages.insert((kind, id.to_string()), pages);
        self
    }

    /// Serves `payload` verbatim for one page request, taking precedence over
    /// [`ScriptedApi::with_list_pages`].
    pub fn with_list_page_payload(
        mut self,
        kind: ListKind,
        id: &str,
        cursor: Option<&str>,
        payload: Payload,
    ) -> Self {
        self.page_payloads
            .insert((kind, cursor_key(id, cursor.unwrap_or_default())), payload);
        self
    }

    pub fn with_asset(mut self, id: &str, asset: Asset) -> Self {
        self.assets.insert(id.to_string(), asset);
        self
    }

    /// Fails every call to `endpoint` for `key` (a name for search, an id otherwise).
    pub fn failing(mut self, endpoint: Endpoint, key: &str) -> Self {
        self.failures.insert((endpoint, key.to_string()));
        self
    }

    pub fn failing_on_cursor(mut self, kind: ListKind, id: &str, cursor: &str) -> Self {
        self.failures
            .insert((Endpoint::List(kind), cursor_key(id, cursor)));
        self
    }

    /// Delay applied to every call while it counts as in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }

    async fn enter(&self, endpoint: Endpoint, key: &str, cursor: Option<&str>) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests.lock().await.push(RecordedRequest {
            endpoint,
            key: key.to_string(),
            cursor: cursor.map(str::to_string),
            at: Instant::now(),
        });
        InFlight(&self.in_flight)
    }

    async fn respond<T>(
        &self,
        endpoint: Endpoint,
        key: &str,
        cursor: Option<&str>,
        answer: impl FnOnce() -> T,
    ) -> Result<T, FetchError> {
        let _guard = self.enter(endpoint, key, cursor).await;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let failed = self.failures.contains(&(endpoint, key.to_string()))
            || cursor.is_some_and(|c| self.failures.contains(&(endpoint, cursor_key(key, c))));
        if failed {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: format!("scripted://{endpoint:?}/{key}"),
            });
        }
        Ok(answer())
    }

    fn page(&self, kind: ListKind, id: &str, cursor: Option<&str>) -> Payload {
        let scripted = (kind, cursor_key(id, cursor.unwrap_or_default()));
        if let Some(payload) = self.page_payloads.get(&scripted) {
            return payload.clone();
        }
        let Some(pages) = self.pages.get(&(kind, id.to_string())) else {
            return Payload::Absent;
        };
        let index = match cursor {
            None => 0,
            Some(c) => match c.strip_prefix("page-").and_then(|n| n.parse::<usize>().ok()) {
                Some(n) if n >= 1 => n - 1,
                _ => return Payload::Absent,
            },
        };
        let Some(items) = pages.get(index) else {
            return Payload::Absent;
        };
        let mut page = JsonMap::new();
        page.insert("items".into(), JsonValue::Array(items.clone()));
        if index + 1 < pages.len() {
            page.insert("nextCursor".into(), JsonValue::String(format!("page-{}", index + 2)));
        }
        Payload::Structured(page)
    }
}

#[async_trait]
impl EntityApi for ScriptedApi {
    async fn search(&self, name: &str) -> Result<Payload, FetchError> {
        self.respond(Endpoint::Search, name, None, || {
            self.search.get(name).cloned().unwrap_or_default()
        })
        .await
    }

    async fn detail(&self, id: &str) -> Result<Payload, FetchError> {
        self.respond(Endpoint::Detail, id, None, || {
            self.detail.get(id).cloned().unwrap_or_default()
        })
        .await
    }

    async fn relation(&self, id: &str) -> Result<Payload, FetchError> {
        self.respond(Endpoint::Relation, id, None, || {
            self.relation.get(id).cloned().unwrap_or_default()
        })
        .await
    }

    async fn list_page(
        &self,
        kind: ListKind,
        id: &str,
        cursor: Option<&str>,
    ) -> Result<Payload, FetchError> {
        self.respond(Endpoint::List(kind), id, cursor, || self.page(kind, id, cursor))
            .await
    }

    async fn asset(&self, id: &str) -> Result<Option<Asset>, FetchError> {
        self.respond(Endpoint::Asset, id, None, || self.assets.get(id).cloned())
            .await
    }
}

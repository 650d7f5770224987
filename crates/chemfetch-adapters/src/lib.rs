//! Endpoint contracts, identifier resolution and per-entity aggregation.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chemfetch_core::{
    normalize_name, Asset, Candidate, EnrichmentRecord, ErrorKind, JsonMap,
    NameCase, Payload, RecordError, ResolvedEntity, Stage,
};
use chemfetch_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

mod scripted;

pub use scripted::{Endpoint, RecordedRequest, ScriptedApi};

pub const CRATE_NAME: &str = "chemfetch-adapters";

pub const PREFERRED_NAME_SCORE: i64 = 100;
pub const SYNONYM_SCORE: i64 = 80;

/// The two depaginated lists gathered per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    Activities,
    Mechanisms,
}

impl ListKind {
    pub fn query_value(&self) -> &'static str {
        match self {
            ListKind::Activities => "activity",
            ListKind::Mechanisms => "mechanism",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            ListKind::Activities => Stage::Activities,
            ListKind::Mechanisms => Stage::Mechanisms,
        }
    }
}

/// Remote lookups needed to resolve and enrich one entity. Every call is
/// independent; a 404 surfaces as [`Payload::Absent`] or `None`, never as an
/// error.
#[async_trait]
pub trait EntityApi: Send + Sync {
    async fn search(&self, name: &str) -> Result<Payload, FetchError>;

    async fn detail(&self, id: &str) -> Result<Payload, FetchError>;

    async fn relation(&self, id: &str) -> Result<Payload, FetchError>;

    async fn list_page(
        &self,
        kind: ListKind,
        id: &str,
        cursor: Option<&str>,
    ) -> Result<Payload, FetchError>;

    async fn asset(&self, id: &str) -> Result<Option<Asset>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub page_size: usize,
    pub asset_accept: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.ebi.ac.uk/chembl/api/data".to_string(),
            page_size: 1000,
            asset_accept: "image/svg+xml".to_string(),
        }
    }
}

/// [`EntityApi`] over HTTP:
///
/// - `GET {base}/search?q=<name>`
/// - `GET {base}/detail/<id>`
/// - `GET {base}/relation?id=<id>`
/// - `GET {base}/list?id=<id>&kind=<kind>&limit=<n>&cursor=<token>`
/// - `GET {base}/asset/<id>`
#[derive(Debug)]
pub struct HttpEntityApi {
    http: HttpFetcher,
    base: Url,
    page_size: usize,
    asset_accept: String,
}

impl HttpEntityApi {
    pub fn new(http: HttpFetcher, config: &ApiConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("parsing base url {}", config.base_url))?;
        if base.cannot_be_a_base() {
            bail!("base url {} cannot carry path segments", config.base_url);
        }
        Ok(Self {
            http,
            base,
            page_size: config.page_size.max(1),
            asset_accept: config.asset_accept.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> String {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.to_string()
    }
}

#[async_trait]
impl EntityApi for HttpEntityApi {
    async fn search(&self, name: &str) -> Result<Payload, FetchError> {
        self.http
            .fetch_json(&self.endpoint(&["search"]), &[("q", name.to_string())])
            .await
    }

    async fn detail(&self, id: &str) -> Result<Payload, FetchError> {
        self.http.fetch_json(&self.endpoint(&["detail", id]), &[]).await
    }

    async fn relation(&self, id: &str) -> Result<Payload, FetchError> {
        self.http
            .fetch_json(&self.endpoint(&["relation"]), &[("id", id.to_string())])
            .await
    }

    async fn list_page(
        &self,
        kind: ListKind,
        id: &str,
        cursor: Option<&str>,
    ) -> Result<Payload, FetchError> {
        let mut query = vec![
            ("id", id.to_string()),
            ("kind", kind.query_value().to_string()),
            ("limit", self.page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        self.http.fetch_json(&self.endpoint(&["list"]), &query).await
    }

    async fn asset(&self, id: &str) -> Result<Option<Asset>, FetchError> {
        self.http
            .fetch_asset(&self.endpoint(&["asset", id]), &self.asset_accept)
            .await
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no search candidates for {name:?}")]
    NotFound { name: String },
    #[error("search response for {name:?} was not a JSON object")]
    Malformed { name: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::NotFound { .. } => ErrorKind::NotFound,
            ResolveError::Malformed { .. } => ErrorKind::MalformedResponse,
            ResolveError::Fetch(err) => err.kind(),
        }
    }

    pub fn to_record_error(&self) -> RecordError {
        RecordError::new(self.kind(), Stage::Resolve, self.to_string())
    }
}

fn json_string(value: Option<&JsonValue>) -> Option<String> {
    value
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Reads one entry of the search response's `candidates` array.
pub fn candidate_from_json(value: &JsonValue) -> Candidate {
    Candidate {
        id: json_string(value.get("id")),
        preferred_name: value
            .get("preferredName")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        synonyms: value
            .get("synonyms")
            .and_then(JsonValue::as_array)
            .map(|syns| {
                syns.iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        external_score: value
            .get("score")
            .and_then(JsonValue::as_f64)
            .filter(|s| s.is_finite()),
    }
}

pub fn candidates_from_payload(payload: &JsonMap) -> Vec<Candidate> {
    payload
        .get("candidates")
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().map(candidate_from_json).collect())
        .unwrap_or_default()
}

/// `+100` for a preferred-name match, `+80` per matching synonym, plus the
/// floored external score. A missing preferred name compares as "".
pub fn score_candidate(candidate: &Candidate, target_key: &str) -> i64 {
    let preferred = candidate
        .preferred_name
        .as_deref()
        .map(|n| normalize_name(n, NameCase::Lower))
        .unwrap_or_default();
    let mut score = if preferred == target_key {
        PREFERRED_NAME_SCORE
    } else {
        0
    };
    let synonym_hits = candidate
        .synonyms
        .iter()
        .filter(|syn| normalize_name(syn, NameCase::Lower) == target_key)
        .count() as i64;
    score += synonym_hits * SYNONYM_SCORE;
    if let Some(external) = candidate.external_score {
        score += external.floor() as i64;
    }
    score
}

/// Picks the canonical id among `candidates` for `raw_name`.
///
/// The highest score wins and ties keep the earlier candidate. When the winner
/// carries no id, the first candidate with an id is used instead.
pub fn select_canonical_id(candidates: &[Candidate], raw_name: &str) -> Option<String> {
    let target_key = normalize_name(raw_name, NameCase::Lower);
    let mut best: Option<(&Candidate, i64)> = None;
    for candidate in candidates {
        let score = score_candidate(candidate, &target_key);
        debug!(id = ?candidate.id, score, "scored candidate");
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((candidate, score));
        }
    }

    let (winner, _) = best?;
    winner
        .id
        .clone()
        .or_else(|| candidates.iter().find_map(|c| c.id.clone()))
}

pub async fn resolve_identifier(
    api: &dyn EntityApi,
    raw_name: &str,
) -> Result<ResolvedEntity, ResolveError> {
    let not_found = || ResolveError::NotFound {
        name: raw_name.to_string(),
    };
    let response = match api.search(raw_name).await? {
        Payload::Structured(map) => map,
        Payload::Absent => return Err(not_found()),
        Payload::RawText(_) => {
            return Err(ResolveError::Malformed {
                name: raw_name.to_string(),
            })
        }
    };

    let candidates = candidates_from_payload(&response);
    let canonical_id = select_canonical_id(&candidates, raw_name).ok_or_else(not_found)?;
    info!(name = raw_name, canonical_id = %canonical_id, candidates = candidates.len(), "resolved");
    Ok(ResolvedEntity::resolved(raw_name, canonical_id))
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Minimum pause between consecutive page requests of one list.
    pub page_delay: Duration,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOutcome {
    pub items: Vec<JsonMap>,
    pub requests: usize,
    pub error: Option<RecordError>,
}

fn page_items(page: &JsonMap) -> impl Iterator<Item = JsonMap> + '_ {
    page.get("items")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.as_object().cloned())
}

fn next_cursor(page: &JsonMap) -> Option<String> {
    json_string(page.get("nextCursor"))
}

/// Follows `nextCursor` until a page carries none or a cursor comes back.
/// An absent, malformed or failed page ends the walk and keeps what was
/// already collected.
pub async fn collect_list(
    api: &dyn EntityApi,
    kind: ListKind,
    id: &str,
    options: &AggregateOptions,
) -> ListOutcome {
    let mut outcome = ListOutcome::default();
    let mut cursor: Option<String> = None;
    let mut seen_cursors = HashSet::new();

    loop {
        outcome.requests += 1;
        let page = match api.list_page(kind, id, cursor.as_deref()).await {
            Ok(Payload::Structured(page)) => page,
            Ok(Payload::Absent) => break,
            Ok(Payload::RawText(_)) => {
                outcome.error = Some(RecordError::new(
                    ErrorKind::MalformedResponse,
                    kind.stage(),
                    format!("{} page {} was not JSON", kind.query_value(), outcome.requests),
                ));
                break;
            }
            Err(err) => {
                warn!(id, kind = kind.query_value(), error = %err, "list page failed");
                outcome.error = Some(RecordError::new(err.kind(), kind.stage(), err.to_string()));
                break;
            }
        };

        outcome.items.extend(page_items(&page));
        match next_cursor(&page) {
            None => break,
            Some(next) if !seen_cursors.insert(next.clone()) => {
                warn!(id, cursor = %next, "server repeated cursor; stopping");
                break;
            }
            Some(next) => {
                cursor = Some(next);
                tokio::time::sleep(options.page_delay).await;
            }
        }
    }

    outcome
}

fn single_payload(
    result: Result<Payload, FetchError>,
    stage: Stage,
    errors: &mut Vec<RecordError>,
) -> Payload {
    match result {
        Ok(Payload::RawText(text)) => {
            errors.push(RecordError::new(
                ErrorKind::MalformedResponse,
                stage,
                "expected a JSON object",
            ));
            Payload::RawText(text)
        }
        Ok(payload) => payload,
        Err(err) => {
            errors.push(RecordError::new(err.kind(), stage, err.to_string()));
            Payload::Absent
        }
    }
}

/// Runs detail, relation, both lists and the asset lookup in that order for
/// one resolved id. Individual failures degrade to empty values and are
/// recorded on the returned record.
pub async fn aggregate(
    api: &dyn EntityApi,
    entity: &ResolvedEntity,
    options: &AggregateOptions,
) -> EnrichmentRecord {
    let Some(id) = entity.canonical_id.as_deref() else {
        return EnrichmentRecord::unresolved(
            entity.raw_name.clone(),
            RecordError::new(ErrorKind::NotFound, Stage::Resolve, "entity was not resolved"),
        );
    };
    let mut errors = Vec::new();

    let detail = single_payload(api.detail(id).await, Stage::Detail, &mut errors);
    let relation = single_payload(api.relation(id).await, Stage::Relation, &mut errors);

    let activities = collect_list(api, ListKind::Activities, id, options).await;
    errors.extend(activities.error);
    let mechanisms = collect_list(api, ListKind::Mechanisms, id, options).await;
    errors.extend(mechanisms.error);

    let asset = match api.asset(id).await {
        Ok(asset) => asset,
        Err(err) => {
            errors.push(RecordError::new(err.kind(), Stage::Asset, err.to_string()));
            None
        }
    };

    debug!(
        id,
        activities = activities.items.len(),
        mechanisms = mechanisms.items.len(),
        errors = errors.len(),
        "aggregated"
    );
    EnrichmentRecord {
        raw_name: entity.raw_name.clone(),
        canonical_id: Some(id.to_string()),
        detail,
        relation,
        activities: activities.items,
        mechanisms: mechanisms.items,
        asset,
        errors,
    }
}

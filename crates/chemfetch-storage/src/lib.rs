//! HTTP fetch utilities and idempotent asset storage for chemfetch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chemfetch_core::{Asset, ErrorKind, Payload};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chemfetch-storage";

pub const JSON_MEDIA_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub enum PersistOutcome {
    Written(PathBuf),
    AlreadyPresent(PathBuf),
    NoPayload,
}

impl PersistOutcome {
    pub fn path(&self) -> Option<&Path> {
        match self {
            PersistOutcome::Written(path) | PersistOutcome::AlreadyPresent(path) => Some(path),
            PersistOutcome::NoPayload => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PersistError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::WriteError
    }

    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        PersistError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Stores one asset file per canonical id under a root directory.
///
/// The existence check and the write are not atomic with respect to other
/// processes sharing the directory; the rename only guarantees readers never
/// see a partially written file.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension_for(content_type: &str) -> &'static str {
        let media = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match media.as_str() {
            "image/svg+xml" => "svg",
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "application/json" => "json",
            m if m.starts_with("text/") => "txt",
            _ => "bin",
        }
    }

    pub fn file_stem(canonical_id: &str) -> String {
        canonical_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn asset_path(&self, canonical_id: &str, content_type: &str) -> PathBuf {
        self.root.join(format!(
            "{}.{}",
            Self::file_stem(canonical_id),
            Self::extension_for(content_type)
        ))
    }

    pub async fn persist(
        &self,
        canonical_id: &str,
        asset: Option<&Asset>,
    ) -> Result<PersistOutcome, PersistError> {
        let Some(asset) = asset else {
            return Ok(PersistOutcome::NoPayload);
        };
        let path = self.asset_path(canonical_id, &asset.content_type);

        if fs::try_exists(&path)
            .await
            .map_err(|e| PersistError::io("checking", &path, e))?
        {
            debug!(path = %path.display(), "asset already present");
            return Ok(PersistOutcome::AlreadyPresent(path));
        }
        if asset.bytes.is_empty() {
            return Ok(PersistOutcome::NoPayload);
        }

        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| PersistError::io("creating directory", &parent, e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), asset.bytes.len()));
        if let Err(err) = write_file(&temp_path, &asset.bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(PersistError::io("renaming into", &path, err));
        }
        Ok(PersistOutcome::Written(path))
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| PersistError::io("creating", path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| PersistError::io("writing", path, e))?;
    file.flush()
        .await
        .map_err(|e| PersistError::io("flushing", path, e))?;
    Ok(())
}

/// Opt-in retries for 5xx, 429, connect failures and timeouts. The default
/// performs none.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub first_pause: Duration,
    pub pause_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            first_pause: Duration::from_millis(250),
            pause_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause before the zero-based `retry`: doubles from `first_pause`, never
    /// above `pause_cap`.
    pub fn pause_before(&self, retry: usize) -> Duration {
        (0..retry)
            .fold(self.first_pause, |pause, _| pause.saturating_mul(2))
            .min(self.pause_cap)
    }
}

fn transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NetworkError
    }
}

/// Successful (non-404) response body with its declared media type.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Turns a JSON endpoint's body into a [`Payload`]. A blank body is `Absent`,
/// objects become `Structured`, and anything else, including unparseable
/// JSON, is kept as text.
pub fn classify_json_body(content_type: &str, body: &[u8]) -> Payload {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Payload::Absent;
    }
    if content_type.to_ascii_lowercase().contains("json") {
        if let Ok(JsonValue::Object(map)) = serde_json::from_slice::<JsonValue>(body) {
            return Payload::Structured(map);
        }
    }
    Payload::RawText(String::from_utf8_lossy(body).into_owned())
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    /// GET a JSON endpoint. A 404 is reported as [`Payload::Absent`].
    pub async fn fetch_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Payload, FetchError> {
        Ok(match self.fetch_bytes(url, query, JSON_MEDIA_TYPE).await? {
            Some(fetched) => classify_json_body(&fetched.content_type, &fetched.body),
            None => Payload::Absent,
        })
    }

    /// GET a binary or text asset. A 404 or an empty body yields `None`.
    pub async fn fetch_asset(&self, url: &str, accept: &str) -> Result<Option<Asset>, FetchError> {
        let Some(fetched) = self.fetch_bytes(url, &[], accept).await? else {
            return Ok(None);
        };
        if fetched.body.is_empty() {
            return Ok(None);
        }
        let content_type = if fetched.content_type.is_empty() {
            accept.to_string()
        } else {
            fetched.content_type
        };
        Ok(Some(Asset::new(content_type, fetched.body)))
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
        accept: &str,
    ) -> Result<Option<FetchedBody>, FetchError> {
        let span = info_span!("http_fetch", url, accept);
        self.fetch_with_retries(url, query, accept)
            .instrument(span)
            .await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
        accept: &str,
    ) -> Result<Option<FetchedBody>, FetchError> {
        let mut retries = 0;
        let resp = loop {
            let sent = self
                .client
                .get(url)
                .query(query)
                .header(ACCEPT, accept)
                .send()
                .await;
            let transient = match &sent {
                Ok(resp) => transient_status(resp.status()),
                Err(err) => transient_error(err),
            };
            if !transient || retries >= self.retry.max_retries {
                break sent.map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;
            }
            let pause = self.retry.pause_before(retries);
            warn!(retries, pause_ms = pause.as_millis() as u64, "transient failure, retrying");
            tokio::time::sleep(pause).await;
            retries += 1;
        };

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!("not found");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = resp.bytes().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        Ok(Some(FetchedBody {
            status,
            content_type,
            body: body.to_vec(),
        }))
    }
}

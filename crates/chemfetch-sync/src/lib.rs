//! Pipeline configuration, bounded fetch orchestration and run outputs.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chemfetch_adapters::{
    aggregate, resolve_identifier, AggregateOptions, ApiConfig, EntityApi, HttpEntityApi,
};
use chemfetch_core::{EnrichmentRecord, ErrorKind, RecordError, Stage, TargetNames};
use chemfetch_storage::{AssetStore, HttpClientConfig, HttpFetcher, PersistOutcome, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod report;

pub const CRATE_NAME: &str = "chemfetch-sync";

pub const CONFIG_FILE_NAME: &str = "chemfetch.yaml";

/// Immutable settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_url: String,
    pub concurrency: usize,
    pub page_size: usize,
    pub page_delay: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub max_retries: usize,
    pub asset_accept: String,
    pub assets_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Re-sort outcomes by input position instead of completion order.
    pub input_order: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let api = ApiConfig::default();
        Self {
            base_url: api.base_url,
            concurrency: 10,
            page_size: api.page_size,
            page_delay: AggregateOptions::default().page_delay,
            http_timeout: Duration::from_secs(20),
            user_agent: "chemfetch/0.1".to_string(),
            max_retries: 0,
            asset_accept: api.asset_accept,
            assets_dir: PathBuf::from("structures"),
            output_dir: PathBuf::from("output"),
            input_order: false,
        }
    }
}

/// Optional overrides read from `chemfetch.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    base_url: Option<String>,
    concurrency: Option<usize>,
    page_size: Option<usize>,
    page_delay_ms: Option<u64>,
    http_timeout_secs: Option<u64>,
    user_agent: Option<String>,
    max_retries: Option<usize>,
    asset_accept: Option<String>,
    assets_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    input_order: Option<bool>,
}

impl PipelineConfig {
    /// Defaults, then the YAML file (the given path, or `chemfetch.yaml` in the
    /// working directory when present), then environment variables.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        let default_path = PathBuf::from(CONFIG_FILE_NAME);
        let path = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None if default_path.exists() => Some(default_path),
            None => None,
        };
        if let Some(path) = path {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: ConfigFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.apply_file(file);
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.base_url {
            self.base_url = v;
        }
        if let Some(v) = file.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = file.page_size {
            self.page_size = v;
        }
        if let Some(v) = file.page_delay_ms {
            self.page_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = file.asset_accept {
            self.asset_accept = v;
        }
        if let Some(v) = file.assets_dir {
            self.assets_dir = v;
        }
        if let Some(v) = file.output_dir {
            self.output_dir = v;
        }
        if let Some(v) = file.input_order {
            self.input_order = v;
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = lookup("CHEMFETCH_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = number("CHEMFETCH_CONCURRENCY") {
            self.concurrency = v as usize;
        }
        if let Some(v) = number("CHEMFETCH_PAGE_SIZE") {
            self.page_size = v as usize;
        }
        if let Some(v) = number("CHEMFETCH_PAGE_DELAY_MS") {
            self.page_delay = Duration::from_millis(v);
        }
        if let Some(v) = number("CHEMFETCH_HTTP_TIMEOUT_SECS") {
            self.http_timeout = Duration::from_secs(v);
        }
        if let Some(v) = lookup("CHEMFETCH_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = number("CHEMFETCH_MAX_RETRIES") {
            self.max_retries = v as usize;
        }
        if let Some(v) = lookup("CHEMFETCH_ASSETS_DIR") {
            self.assets_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CHEMFETCH_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.base_url.clone(),
            page_size: self.page_size,
            asset_accept: self.asset_accept.clone(),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }

    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            page_delay: self.page_delay,
        }
    }
}

/// Reads one name per line, dropping blank lines and exact repeats.
pub fn load_names(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(unique_names(text.lines()))
}

pub fn unique_names<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    lines
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn retain_targets(names: Vec<String>, targets: &TargetNames) -> Vec<String> {
    names.into_iter().filter(|name| targets.contains(name)).collect()
}

/// Result of one orchestrator unit. `index` is the name's input position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityOutcome {
    pub index: usize,
    pub record: EnrichmentRecord,
    pub asset_path: Option<PathBuf>,
    #[serde(default)]
    pub asset_written: bool,
}

impl EntityOutcome {
    fn failed(index: usize, raw_name: &str, error: RecordError) -> Self {
        Self {
            index,
            record: EnrichmentRecord::unresolved(raw_name, error),
            asset_path: None,
            asset_written: false,
        }
    }
}

pub fn sort_by_input(outcomes: &mut [EntityOutcome]) {
    outcomes.sort_by_key(|outcome| outcome.index);
}

#[derive(Clone)]
struct UnitContext {
    api: Arc<dyn EntityApi>,
    assets: AssetStore,
    options: AggregateOptions,
}

async fn run_stages(ctx: UnitContext, index: usize, raw_name: String) -> EntityOutcome {
    let entity = match resolve_identifier(ctx.api.as_ref(), &raw_name).await {
        Ok(entity) => entity,
        Err(err) => {
            warn!(error = %err, "resolution failed");
            return EntityOutcome::failed(index, &raw_name, err.to_record_error());
        }
    };

    let record = aggregate(ctx.api.as_ref(), &entity, &ctx.options).await;
    let Some(canonical_id) = record.canonical_id.clone() else {
        return EntityOutcome {
            index,
            record,
            asset_path: None,
            asset_written: false,
        };
    };

    match ctx.assets.persist(&canonical_id, record.asset.as_ref()).await {
        Ok(persisted) => EntityOutcome {
            index,
            asset_written: matches!(persisted, PersistOutcome::Written(_)),
            asset_path: persisted.path().map(Path::to_path_buf),
            record,
        },
        Err(err) => {
            warn!(error = %err, "asset write failed");
            EntityOutcome {
                index,
                record: record.with_error(RecordError::new(
                    err.kind(),
                    Stage::Persist,
                    err.to_string(),
                )),
                asset_path: None,
                asset_written: false,
            }
        }
    }
}

/// Runs resolve → aggregate → persist for many names with at most
/// `concurrency` units in flight.
pub struct FetchOrchestrator {
    ctx: UnitContext,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl FetchOrchestrator {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        let api = HttpEntityApi::new(http, &config.api_config())?;
        Ok(Self::with_api(config, Arc::new(api)))
    }

    pub fn with_api(config: &PipelineConfig, api: Arc<dyn EntityApi>) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            ctx: UnitContext {
                api,
                assets: AssetStore::new(config.assets_dir.clone()),
                options: config.aggregate_options(),
            },
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// One outcome per input name, in completion order.
    pub async fn run(&self, names: &[String]) -> Vec<EntityOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        for (index, name) in names.iter().enumerate() {
            let ctx = self.ctx.clone();
            let permits = self.permits.clone();
            let tx = tx.clone();
            let raw_name = name.clone();
            let span = info_span!("entity", index, name = %name);

            tokio::spawn(
                async move {
                    let outcome = match permits.acquire_owned().await {
                        Ok(_permit) => {
                            // Stages run in their own task so a panic is contained
                            // while the permit is still held here.
                            let stages = tokio::spawn(
                                run_stages(ctx, index, raw_name.clone()).in_current_span(),
                            );
                            match stages.await {
                                Ok(outcome) => outcome,
                                Err(err) => EntityOutcome::failed(
                                    index,
                                    &raw_name,
                                    RecordError::new(
                                        ErrorKind::Internal,
                                        Stage::Unit,
                                        format!("unit aborted: {err}"),
                                    ),
                                ),
                            }
                        }
                        Err(err) => EntityOutcome::failed(
                            index,
                            &raw_name,
                            RecordError::new(ErrorKind::Internal, Stage::Unit, err.to_string()),
                        ),
                    };
                    let _ = tx.send(outcome);
                }
                .instrument(span),
            );
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(names.len());
        while let Some(outcome) = rx.recv().await {
            info!(
                done = outcomes.len() + 1,
                total = names.len(),
                name = %outcome.record.raw_name,
                canonical_id = ?outcome.record.canonical_id,
                "entity finished"
            );
            outcomes.push(outcome);
        }

        if outcomes.len() < names.len() {
            let seen: HashSet<usize> = outcomes.iter().map(|o| o.index).collect();
            for (index, name) in names.iter().enumerate() {
                if !seen.contains(&index) {
                    outcomes.push(EntityOutcome::failed(
                        index,
                        name,
                        RecordError::new(
                            ErrorKind::Internal,
                            Stage::Unit,
                            "unit produced no result",
                        ),
                    ));
                }
            }
        }
        outcomes
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub resolved: usize,
    pub not_found: usize,
    pub with_errors: usize,
    pub assets_written: usize,
    pub errors_by_kind: BTreeMap<String, usize>,
    pub output_dir: String,
}

impl RunSummary {
    pub fn from_outcomes(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcomes: &[EntityOutcome],
        output_dir: &Path,
    ) -> Self {
        let mut errors_by_kind = BTreeMap::new();
        for error in outcomes.iter().flat_map(|o| &o.record.errors) {
            *errors_by_kind.entry(error.kind.as_str().to_string()).or_default() += 1;
        }
        Self {
            run_id,
            started_at,
            finished_at,
            total: outcomes.len(),
            resolved: outcomes.iter().filter(|o| o.record.is_resolved()).count(),
            not_found: outcomes
                .iter()
                .filter(|o| o.record.error().is_some_and(|e| e.kind == ErrorKind::NotFound))
                .count(),
            with_errors: outcomes.iter().filter(|o| o.record.error().is_some()).count(),
            assets_written: outcomes.iter().filter(|o| o.asset_written).count(),
            errors_by_kind,
            output_dir: output_dir.display().to_string(),
        }
    }
}

pub struct SyncPipeline {
    config: PipelineConfig,
    orchestrator: FetchOrchestrator,
}

impl SyncPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let orchestrator = FetchOrchestrator::new(&config)?;
        Ok(Self {
            config,
            orchestrator,
        })
    }

    pub fn with_api(config: PipelineConfig, api: Arc<dyn EntityApi>) -> Self {
        let orchestrator = FetchOrchestrator::with_api(&config, api);
        Self {
            config,
            orchestrator,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every name through the pipeline and writes the run outputs.
    /// Only setup and output failures are returned as errors.
    pub async fn run_once(&self, names: &[String]) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        for dir in [&self.config.output_dir, &self.config.assets_dir] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        info!(
            %run_id,
            names = names.len(),
            concurrency = self.orchestrator.concurrency(),
            "run started"
        );

        let mut outcomes = self.orchestrator.run(names).await;
        if self.config.input_order {
            sort_by_input(&mut outcomes);
        }

        let finished_at = Utc::now();
        let summary = RunSummary::from_outcomes(
            run_id,
            started_at,
            finished_at,
            &outcomes,
            &self.config.output_dir,
        );
        report::write_run_outputs(&self.config.output_dir, &outcomes, &summary).await?;
        info!(
            %run_id,
            total = summary.total,
            resolved = summary.resolved,
            with_errors = summary.with_errors,
            "run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chemfetch_adapters::{Endpoint, ListKind, ScriptedApi};
    use chemfetch_core::Asset;
    use serde_json::json;
    use tempfile::tempdir;

    fn config_in(dir: &Path, concurrency: usize) -> PipelineConfig {
        PipelineConfig {
            concurrency,
            page_delay: Duration::from_millis(1),
            assets_dir: dir.join("structures"),
            output_dir: dir.join("output"),
            ..Default::default()
        }
    }

    fn aspirin_candidate() -> serde_json::Value {
        json!({"id": "CHEMBL25", "preferredName": "ASPIRIN"})
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("Drug {i}")).collect()
    }

    fn scripted_for(names: &[String]) -> ScriptedApi {
        names.iter().enumerate().fold(ScriptedApi::new(), |api, (i, name)| {
            let id = format!("X{i}");
            api.with_candidates(name, vec![json!({"id": id, "preferredName": name})])
                .with_detail(&id, json!({"pref_name": name.to_uppercase()}))
        })
    }

    #[tokio::test]
    async fn concurrency_bound_holds() {
        for cap in [1usize, 3, 10] {
            let dir = tempdir().expect("tempdir");
            let inputs = names(24);
            let api = Arc::new(scripted_for(&inputs).with_latency(Duration::from_millis(5)));
            let config = config_in(dir.path(), cap);
            let orchestrator = FetchOrchestrator::with_api(&config, api.clone());

            let outcomes = orchestrator.run(&inputs).await;

            assert_eq!(outcomes.len(), inputs.len());
            assert_eq!(
                api.peak_in_flight(),
                cap,
                "cap {cap} not reached or exceeded"
            );
        }
    }

    #[tokio::test]
    async fn failing_detail_is_isolated_to_its_entity() {
        let dir = tempdir().expect("tempdir");
        let inputs = names(6);
        let api = Arc::new(scripted_for(&inputs).failing(Endpoint::Detail, "X2"));
        let orchestrator = FetchOrchestrator::with_api(&config_in(dir.path(), 3), api);

        let mut outcomes = orchestrator.run(&inputs).await;
        sort_by_input(&mut outcomes);

        assert_eq!(outcomes.len(), 6);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.index, i);
            assert_eq!(outcome.record.canonical_id.as_deref(), Some(format!("X{i}").as_str()));
            if i == 2 {
                let error = outcome.record.error().expect("error annotated");
                assert_eq!((error.kind, error.stage), (ErrorKind::NetworkError, Stage::Detail));
                assert!(outcome.record.detail.is_absent());
            } else {
                assert!(outcome.record.errors.is_empty(), "entity {i} affected");
                assert!(outcome.record.detail.as_structured().is_some());
            }
        }
    }

    #[tokio::test]
    async fn unresolved_names_still_produce_a_record() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(ScriptedApi::new().with_candidates("Ghost", vec![]));
        let orchestrator = FetchOrchestrator::with_api(&config_in(dir.path(), 2), api);
        let inputs = vec!["Ghost".to_string(), "Nowhere".to_string()];

        let outcomes = orchestrator.run(&inputs).await;

        assert_eq!(outcomes.len(), 2);
        for outcome in &outcomes {
            assert_eq!(outcome.record.canonical_id, None);
            assert!(outcome.record.activities.is_empty());
            assert!(outcome.record.mechanisms.is_empty());
            assert_eq!(outcome.record.error().map(|e| e.kind), Some(ErrorKind::NotFound));
        }
    }

    #[tokio::test]
    async fn assets_are_persisted_once_per_id() {
        let dir = tempdir().expect("tempdir");
        let api = Arc::new(
            ScriptedApi::new()
                .with_candidates("Aspirin", vec![aspirin_candidate()])
                .with_candidates("acetylsalicylic acid", vec![aspirin_candidate()])
                .with_list_pages(ListKind::Activities, "CHEMBL25", vec![vec![json!({"a": 1})]])
                .with_asset("CHEMBL25", Asset::new("image/svg+xml", b"<svg/>".to_vec())),
        );
        let orchestrator = FetchOrchestrator::with_api(&config_in(dir.path(), 1), api);
        let inputs = vec!["Aspirin".to_string(), "acetylsalicylic acid".to_string()];

        let outcomes = orchestrator.run(&inputs).await;

        let written = outcomes.iter().filter(|o| o.asset_written).count();
        assert_eq!(written, 1);
        let expected = dir.path().join("structures").join("CHEMBL25.svg");
        assert!(outcomes.iter().all(|o| o.asset_path.as_deref() == Some(expected.as_path())));
        assert!(outcomes.iter().all(|o| o.record.errors.is_empty()));
    }

    #[tokio::test]
    async fn write_failure_is_annotated_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let mut config = config_in(dir.path(), 1);
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"file").expect("blocker");
        config.assets_dir = blocker;
        let api = Arc::new(
            ScriptedApi::new()
                .with_candidates("Aspirin", vec![aspirin_candidate()])
                .with_asset("CHEMBL25", Asset::new("image/svg+xml", b"<svg/>".to_vec())),
        );

        let outcomes = FetchOrchestrator::with_api(&config, api)
            .run(&["Aspirin".to_string()])
            .await;

        let error = outcomes[0].record.error().expect("write error");
        assert_eq!((error.kind, error.stage), (ErrorKind::WriteError, Stage::Persist));
        assert_eq!(outcomes[0].record.canonical_id.as_deref(), Some("CHEMBL25"));
    }

    #[tokio::test]
    async fn run_once_writes_outputs_in_input_order() {
        let dir = tempdir().expect("tempdir");
        let inputs = names(5);
        let mut config = config_in(dir.path(), 4);
        config.input_order = true;
        let pipeline = SyncPipeline::with_api(config, Arc::new(scripted_for(&inputs)));

        let summary = pipeline.run_once(&inputs).await.expect("run");

        assert_eq!(summary.total, 5);
        assert_eq!(summary.resolved, 5);
        assert_eq!(summary.with_errors, 0);
        let results_path = dir.path().join("output").join(report::RESULTS_JSON);
        let results = report::load_results(results_path).expect("results");
        let indices: Vec<usize> = results.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn env_overrides_defaults_and_ignores_garbage() {
        let mut config = PipelineConfig::default();
        config.apply_env(|key| match key {
            "CHEMFETCH_CONCURRENCY" => Some("3".into()),
            "CHEMFETCH_PAGE_DELAY_MS" => Some("not-a-number".into()),
            "CHEMFETCH_BASE_URL" => Some("http://localhost:9/api".into()),
            _ => None,
        });
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.page_delay, Duration::from_millis(500));
        assert_eq!(config.base_url, "http://localhost:9/api");
        assert_eq!(config.http_config().retry.max_retries, 0);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("chemfetch.yaml");
        let yaml = "concurrency: 4\npage_delay_ms: 250\nassets_dir: svg\n";
        std::fs::write(&path, yaml).expect("write");

        let mut config = PipelineConfig::default();
        let text = std::fs::read_to_string(&path).expect("read");
        let file: ConfigFile = serde_yaml::from_str(&text).expect("parse");
        config.apply_file(file);

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.page_delay, Duration::from_millis(250));
        assert_eq!(config.assets_dir, PathBuf::from("svg"));
        assert_eq!(config.page_size, 1000);

        let bad = serde_yaml::from_str::<ConfigFile>("concurrenc: 4\n");
        assert!(bad.is_err());
    }

    #[test]
    fn name_lists_are_deduplicated_and_filtered() {
        let names = unique_names(["Aspirin", "", "  Metformin ", "Aspirin", "aspirin"]);
        assert_eq!(names, vec!["Aspirin", "Metformin", "aspirin"]);

        let targets: TargetNames = ["ASPIRIN"].into_iter().collect();
        assert_eq!(retain_targets(names, &targets), vec!["Aspirin", "aspirin"]);
    }
}

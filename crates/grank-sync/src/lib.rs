//! Sync pipeline: source registry, per-source runs, scheduling, daemon mode.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use grank_adapters::{adapter_for_source, normalize_batch, FetchOptions};
use grank_core::{GameSnapshot, RankContext};
use grank_storage::{ArchiveStore, CatalogStore, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grank-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Api,
    #[default]
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub mode: FetchMode,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default = "default_rank_type")]
    pub rank_type: String,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_page_count")]
    pub page_count: u32,
}

fn default_rank_type() -> String {
    "hot".to_string()
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    10
}

fn default_page_count() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_path: PathBuf,
    pub sync_cron: String,
    pub skip_when_fresh: bool,
    pub http_timeout_secs: u64,
    pub archive_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/grank.db".to_string()),
            sources_path: std::env::var("GRANK_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            sync_cron: std::env::var("GRANK_SYNC_CRON")
                .unwrap_or_else(|_| "50 23 * * *".to_string()),
            skip_when_fresh: std::env::var("GRANK_SKIP_WHEN_FRESH")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            http_timeout_secs: std::env::var("GRANK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            archive_dir: std::env::var("GRANK_ARCHIVE_DIR").ok().map(PathBuf::from),
            workspace_root: std::env::var("GRANK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Lifecycle of one source within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Fetching,
    Persisting,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceOutcome {
    pub success: bool,
    pub skipped: bool,
    pub state: RunState,
    /// Raw entries the adapter returned.
    pub fetched: usize,
    /// Snapshots that made it into the store.
    pub count: usize,
    pub saved_ids: Vec<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: BTreeMap<String, SourceOutcome>,
}

impl RunSummary {
    pub fn total_saved(&self) -> usize {
        self.sources.values().map(|outcome| outcome.count).sum()
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|(_, outcome)| !outcome.success)
            .map(|(source_id, _)| source_id.as_str())
            .collect()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: CatalogStore,
    http: HttpFetcher,
    archive: Option<ArchiveStore>,
    // Serializes the eager startup run against cron firings.
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store = CatalogStore::open(&config.database_url)
            .await
            .with_context(|| format!("opening catalog store at {}", config.database_url))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        })?;
        let archive = config.archive_dir.clone().map(ArchiveStore::new);
        Ok(Self {
            config,
            store,
            http,
            archive,
            run_lock: Mutex::new(()),
        })
    }

    /// Swap the HTTP fetcher, mainly so tests can drop the pacing delays.
    pub fn with_fetcher(mut self, http: HttpFetcher) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One full pass over the enabled sources. Source failures land in the
    /// summary; only registry or setup problems fail the run itself.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let today = started_at.date_naive();

        let registry = self.load_source_registry().await?;
        let enabled: Vec<SourceConfig> = registry
            .sources
            .into_iter()
            .filter(|source| source.enabled)
            .collect();
        info!(%run_id, sources = enabled.len(), "sync run started");

        let mut sources = BTreeMap::new();
        for source in &enabled {
            let outcome = self.run_source(source, today).await;
            if let Some(error) = &outcome.error {
                warn!(source_id = %source.source_id, error = %error, "source finished with failure");
            }
            sources.insert(source.source_id.clone(), outcome);
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources,
        };
        info!(
            %run_id,
            saved = summary.total_saved(),
            failed = summary.failed_sources().len(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_source(&self, source: &SourceConfig, today: NaiveDate) -> SourceOutcome {
        let mut outcome = SourceOutcome::default();

        let Some(adapter) = adapter_for_source(&source.source_id) else {
            outcome.state = RunState::Failed;
            outcome.error = Some(format!("no adapter registered for {}", source.source_id));
            return outcome;
        };

        if self.config.skip_when_fresh {
            match self
                .store
                .has_rankings_for(adapter.platform(), &source.rank_type, today)
                .await
            {
                Ok(true) => {
                    debug!(
                        source_id = %source.source_id,
                        rank_type = %source.rank_type,
                        "today's rankings already recorded; skipping"
                    );
                    outcome.success = true;
                    outcome.skipped = true;
                    outcome.state = RunState::Done;
                    return outcome;
                }
                Ok(false) => {}
                Err(err) => {
                    outcome.state = RunState::Failed;
                    outcome.error = Some(err.to_string());
                    return outcome;
                }
            }
        }

        outcome.state = RunState::Fetching;
        let options = self.fetch_options_for(source);
        let entries = match adapter.fetch(&self.http, &options).await {
            Ok(entries) => entries,
            Err(err) => {
                outcome.state = RunState::Failed;
                outcome.error = Some(err.to_string());
                return outcome;
            }
        };
        outcome.fetched = entries.len();

        let snapshots = normalize_batch(&entries);
        if let Some(archive) = &self.archive {
            if let Err(err) = self
                .archive_batch(archive, &source.source_id, today, &snapshots)
                .await
            {
                warn!(source_id = %source.source_id, error = %err, "archiving batch failed");
            }
        }

        outcome.state = RunState::Persisting;
        let ctx = RankContext::new(source.rank_type.clone(), today);
        for snapshot in &snapshots {
            match self.store.apply_snapshot(snapshot, &ctx).await {
                Ok(applied) => {
                    outcome.saved_ids.push(applied.ranking_id);
                    outcome.count += 1;
                }
                Err(err) if err.is_fatal() => {
                    outcome.state = RunState::Failed;
                    outcome.error = Some(err.to_string());
                    return outcome;
                }
                Err(err) => {
                    warn!(
                        source_id = %source.source_id,
                        platform_id = %snapshot.platform_id,
                        error = %err,
                        "snapshot rejected; continuing with the rest of the batch"
                    );
                }
            }
        }

        outcome.state = RunState::Done;
        outcome.success = true;
        outcome
    }

    async fn archive_batch(
        &self,
        archive: &ArchiveStore,
        source_id: &str,
        day: NaiveDate,
        snapshots: &[GameSnapshot],
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshots).context("serializing batch for archive")?;
        let stored = archive.store_batch(source_id, day, &bytes).await?;
        debug!(
            source_id,
            path = %stored.relative_path.display(),
            deduplicated = stored.deduplicated,
            "batch archived"
        );
        Ok(())
    }

    /// Daily job plus whatever fired it; the caller starts the scheduler.
    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        saved = summary.total_saved(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.resolve_path(&self.config.sources_path);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn fetch_options_for(&self, source: &SourceConfig) -> FetchOptions {
        FetchOptions {
            use_network: source.mode == FetchMode::Api,
            fixture_path: source
                .fixture_path
                .as_ref()
                .map(|path| self.resolve_path(path)),
            rank_type: source.rank_type.clone(),
            page: source.page,
            page_size: source.page_size,
            page_count: source.page_count,
        }
    }

    fn resolve_path(&self, path: &PathBuf) -> PathBuf {
        if path.is_absolute() {
            path.clone()
        } else {
            self.config.workspace_root.join(path)
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config).await?;
    let summary = pipeline.run_once().await?;
    pipeline.close().await;
    Ok(summary)
}

/// Eager run at startup, then the cron job, until Ctrl-C.
pub async fn run_daemon(config: SyncConfig) -> Result<()> {
    let pipeline = Arc::new(SyncPipeline::new(config).await?);

    match pipeline.run_once().await {
        Ok(summary) => info!(
            run_id = %summary.run_id,
            saved = summary.total_saved(),
            "startup sync finished"
        ),
        Err(err) => error!(error = %err, "startup sync failed"),
    }

    let mut sched = pipeline.build_scheduler().await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %pipeline.config.sync_cron, "scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    sched.shutdown().await.context("stopping scheduler")?;
    pipeline.close().await;
    Ok(())
}

pub async fn run_daemon_from_env() -> Result<()> {
    run_daemon(SyncConfig::from_env()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use grank_storage::PacingPolicy;
    use std::path::Path;

    fn chart_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "data": { "list": [
                {
                    "type": "app",
                    "app": {
                        "id": 233903,
                        "title": "明日方舟",
                        "stat": { "fans_count": 12, "hits_total": 34 },
                        "tags": [ { "id": 557, "value": "策略", "uri": "/tag/557" } ]
                    }
                },
                {
                    "type": "app",
                    "app": { "id": 168332, "title": "原神" }
                },
                { "type": "ad", "ad": { "id": 1 } }
            ]}
        }))
        .expect("chart body")
    }

    fn write_taptap_source(root: &Path, extra_sources: &str) {
        std::fs::create_dir_all(root.join("fixtures/taptap")).expect("fixture dir");
        std::fs::write(root.join("fixtures/taptap/chart.json"), chart_body()).expect("fixture");
        let registry = format!(
            r#"sources:
  - source_id: taptap
    display_name: TapTap
    enabled: true
    mode: fixture
    fixture_path: fixtures/taptap/chart.json
{extra_sources}"#
        );
        std::fs::write(root.join("sources.yaml"), registry).expect("sources.yaml");
    }

    fn test_config(root: &Path) -> SyncConfig {
        SyncConfig {
            database_url: "sqlite::memory:".to_string(),
            sources_path: PathBuf::from("sources.yaml"),
            sync_cron: "50 23 * * *".to_string(),
            skip_when_fresh: false,
            http_timeout_secs: 1,
            archive_dir: None,
            workspace_root: root.to_path_buf(),
        }
    }

    async fn test_pipeline(config: SyncConfig) -> SyncPipeline {
        SyncPipeline::new(config)
            .await
            .expect("pipeline")
            .with_fetcher(
                HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(1),
                    pacing: PacingPolicy::immediate(),
                })
                .expect("fetcher"),
            )
    }

    #[test]
    fn registry_defaults_fill_the_optional_fields() {
        let registry: SourceRegistry = serde_yaml::from_str(
            "sources:\n  - source_id: taptap\n    display_name: TapTap\n    enabled: true\n",
        )
        .expect("parse");

        let source = &registry.sources[0];
        assert_eq!(source.mode, FetchMode::Fixture);
        assert!(source.fixture_path.is_none());
        assert_eq!(source.rank_type, "hot");
        assert_eq!(source.page, 1);
        assert_eq!(source.page_size, 10);
        assert_eq!(source.page_count, 1);
    }

    #[tokio::test]
    async fn one_failing_source_leaves_the_others_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_taptap_source(
            dir.path(),
            r#"  - source_id: steam
    display_name: Steam
    enabled: true
    mode: fixture
    fixture_path: fixtures/steam/missing.json
  - source_id: itch
    display_name: Itch
    enabled: true
"#,
        );

        let pipeline = test_pipeline(test_config(dir.path())).await;
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.sources.len(), 3);

        let taptap = &summary.sources["taptap"];
        assert!(taptap.success);
        assert_eq!(taptap.state, RunState::Done);
        assert_eq!(taptap.fetched, 2);
        assert_eq!(taptap.count, 2);
        assert_eq!(taptap.saved_ids.len(), 2);

        let steam = &summary.sources["steam"];
        assert!(!steam.success);
        assert_eq!(steam.state, RunState::Failed);
        assert!(steam.error.is_some());

        let itch = &summary.sources["itch"];
        assert!(!itch.success);
        assert!(itch
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("no adapter registered"));

        assert_eq!(summary.total_saved(), 2);
        assert_eq!(summary.failed_sources(), vec!["itch", "steam"]);
    }

    #[tokio::test]
    async fn rerunning_a_day_saves_the_same_ranking_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_taptap_source(dir.path(), "");
        let pipeline = test_pipeline(test_config(dir.path())).await;

        let first = pipeline.run_once().await.expect("first run");
        let second = pipeline.run_once().await.expect("second run");
        assert_eq!(
            first.sources["taptap"].saved_ids,
            second.sources["taptap"].saved_ids
        );
    }

    #[tokio::test]
    async fn skip_when_fresh_short_circuits_the_second_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_taptap_source(dir.path(), "");
        let mut config = test_config(dir.path());
        config.skip_when_fresh = true;
        let pipeline = test_pipeline(config).await;

        let first = pipeline.run_once().await.expect("first run");
        assert!(!first.sources["taptap"].skipped);
        assert_eq!(first.sources["taptap"].count, 2);

        let second = pipeline.run_once().await.expect("second run");
        let outcome = &second.sources["taptap"];
        assert!(outcome.success);
        assert!(outcome.skipped);
        assert_eq!(outcome.state, RunState::Done);
        assert_eq!(outcome.fetched, 0);
        assert_eq!(outcome.count, 0);
    }

    #[tokio::test]
    async fn garbage_fixtures_succeed_with_an_empty_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_taptap_source(dir.path(), "");
        std::fs::write(dir.path().join("fixtures/taptap/chart.json"), b"not json")
            .expect("overwrite fixture");

        let pipeline = test_pipeline(test_config(dir.path())).await;
        let summary = pipeline.run_once().await.expect("run");

        let outcome = &summary.sources["taptap"];
        assert!(outcome.success);
        assert_eq!(outcome.state, RunState::Done);
        assert_eq!(outcome.fetched, 0);
        assert_eq!(outcome.count, 0);
    }

    #[tokio::test]
    async fn archived_batches_land_under_source_and_date() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_taptap_source(dir.path(), "");
        let mut config = test_config(dir.path());
        config.archive_dir = Some(dir.path().join("archive"));
        let pipeline = test_pipeline(config).await;

        pipeline.run_once().await.expect("run");

        let day_dir = dir
            .path()
            .join("archive/taptap")
            .join(Utc::now().date_naive().to_string());
        let entries: Vec<_> = std::fs::read_dir(&day_dir)
            .expect("archive day dir")
            .filter_map(|entry| entry.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].path().extension().and_then(|ext| ext.to_str()),
            Some("json")
        );
    }
}

//! Pipeline orchestration: config, fetch fan-out, sync cadence and state.

pub mod dedup;
pub mod normalize;
pub mod store;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pulse_adapters::{adapter_for, fetch_source_records, FetchOutcome};
use pulse_core::{RawRecord, Source};
use pulse_storage::{
    BackoffPolicy, DirectHttpStrategy, FetchStrategy, HttpClientConfig, HttpFetcher,
    JsonStateStore, RenderApiConfig, RenderApiStrategy, RunStateStore, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dedup::{DedupConfig, DedupEngine, DedupHistory, DropReason};
use crate::normalize::Normalizer;
use crate::store::{EventStore, MemoryEventStore, PgEventStore, StoreError, UpsertResult};

pub const CRATE_NAME: &str = "pulse-sync";

/// Fatal before any fetch happens; everything downstream is absorbed and
/// reported instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid sync mode {0}: expected a non-negative integer")]
    InvalidSyncMode(i64),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// How many invocations to buffer before committing to the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Never,
    EveryRun,
    EveryNth(u64),
    Always,
}

impl SyncMode {
    pub fn from_raw(raw: i64) -> Result<Self, ConfigError> {
        match raw {
            0 => Ok(SyncMode::Never),
            1 => Ok(SyncMode::EveryRun),
            2..=4 => Ok(SyncMode::EveryNth(raw as u64)),
            n if n >= 5 => Ok(SyncMode::Always),
            n => Err(ConfigError::InvalidSyncMode(n)),
        }
    }

    pub fn should_commit(&self, run_counter: u64) -> bool {
        match self {
            SyncMode::Never => false,
            SyncMode::EveryRun | SyncMode::Always => true,
            SyncMode::EveryNth(n) => run_counter % n == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub state_path: PathBuf,
    pub sources_path: PathBuf,
    pub reports_dir: PathBuf,
    pub sync_mode: SyncMode,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub fetch_timeout: Duration,
    pub run_deadline: Duration,
    pub retention_days: i64,
    pub title_threshold: f64,
    pub location_threshold: f64,
    pub user_agent: String,
    pub requests_per_second: Option<u32>,
    pub render_providers: Vec<RenderApiConfig>,
    pub sync_cron: String,
    pub force_sync: bool,
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

const RENDER_PROVIDERS: &[(&str, &str, &str, &str)] = &[
    ("render-a", "PULSE_RENDER_A_KEY", "PULSE_RENDER_A_URL", "https://api.scraperapi.com/"),
    ("render-b", "PULSE_RENDER_B_KEY", "PULSE_RENDER_B_URL", "https://app.zenrows.com/v1/"),
];

fn render_providers_from_env() -> Vec<RenderApiConfig> {
    RENDER_PROVIDERS
        .iter()
        .filter_map(|(name, key_var, url_var, default_url)| {
            let api_key = std::env::var(key_var).ok().filter(|v| !v.trim().is_empty())?;
            let endpoint = std::env::var(url_var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default_url.to_string());
            Some(RenderApiConfig {
                name: name.to_string(),
                endpoint,
                api_key,
            })
        })
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let sync_mode = SyncMode::from_raw(env_parse::<i64>("PULSE_SYNC_MODE")?.unwrap_or(1))?;
        Ok(Self {
            database_url: std::env::var("PULSE_DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            state_path: env_path("PULSE_STATE_PATH", "./state/pulse_state.json"),
            sources_path: env_path("PULSE_SOURCES_PATH", "./sources.yaml"),
            reports_dir: env_path("PULSE_REPORTS_DIR", "./reports"),
            sync_mode,
            batch_size: env_parse("PULSE_BATCH_SIZE")?.unwrap_or(100),
            max_concurrency: env_parse("PULSE_MAX_CONCURRENCY")?.unwrap_or(4),
            fetch_timeout: Duration::from_secs(
                env_parse::<u64>("PULSE_FETCH_TIMEOUT_SECS")?.unwrap_or(30),
            ),
            run_deadline: Duration::from_secs(
                env_parse::<u64>("PULSE_RUN_DEADLINE_SECS")?.unwrap_or(300),
            ),
            retention_days: env_parse("PULSE_RETENTION_DAYS")?.unwrap_or(30),
            title_threshold: env_parse("PULSE_TITLE_THRESHOLD")?.unwrap_or(0.85),
            location_threshold: env_parse("PULSE_LOCATION_THRESHOLD")?.unwrap_or(0.70),
            user_agent: std::env::var("PULSE_USER_AGENT")
                .unwrap_or_else(|_| "pulse-bot/0.1".to_string()),
            requests_per_second: env_parse("PULSE_REQUESTS_PER_SECOND")?,
            render_providers: render_providers_from_env(),
            sync_cron: std::env::var("PULSE_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
            force_sync: false,
        })
    }
}

/// Enabled sources and localities, read once per invocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub priority: Vec<Source>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub source: Source,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub localities: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry yaml")
    }

    pub fn enabled_tasks(&self) -> Vec<(Source, String)> {
        self.sources
            .iter()
            .filter(|entry| entry.enabled)
            .flat_map(|entry| {
                entry
                    .localities
                    .iter()
                    .map(|locality| (entry.source, locality.clone()))
            })
            .collect()
    }

    pub fn source_priority(&self) -> Vec<Source> {
        if self.priority.is_empty() {
            Source::default_priority()
        } else {
            self.priority.clone()
        }
    }
}

/// Primary fetch first, then each configured render provider, in order.
pub fn build_strategy_chain(config: &SyncConfig) -> Result<Vec<Arc<dyn FetchStrategy>>> {
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: config.fetch_timeout,
        user_agent: Some(config.user_agent.clone()),
        token_bucket: config.requests_per_second.map(|rps| TokenBucketConfig {
            capacity: rps.max(1),
            refill_every: Duration::from_secs(1),
        }),
        ..Default::default()
    })?);

    let mut chain: Vec<Arc<dyn FetchStrategy>> =
        vec![Arc::new(DirectHttpStrategy::new(http.clone()))];
    for provider in &config.render_providers {
        chain.push(Arc::new(RenderApiStrategy::new(http.clone(), provider.clone())));
    }
    Ok(chain)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDecision {
    Commit,
    Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Validating,
    Deduplicating,
    DecidingSync,
    Syncing,
    Skipped,
    Done,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Validating => "validating",
            Stage::Deduplicating => "deduplicating",
            Stage::DecidingSync => "deciding_sync",
            Stage::Syncing => "syncing",
            Stage::Skipped => "skipped",
            Stage::Done => "done",
        }
    }
}

fn enter_stage(stage: Stage) {
    debug!(stage = stage.name(), "pipeline stage");
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub synced_hashes: Vec<String>,
    pub errors: Vec<String>,
}

/// Commits a deduplicated batch in bounded chunks. A chunk failure is
/// retried once with backoff, then skipped; remaining chunks still run.
pub struct SyncManager {
    store: Arc<dyn EventStore>,
    batch_size: usize,
    backoff: BackoffPolicy,
}

impl SyncManager {
    pub fn new(store: Arc<dyn EventStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            backoff: BackoffPolicy::default(),
        }
    }

    async fn upsert_with_retry(
        &self,
        chunk: &[pulse_core::CanonicalEvent],
    ) -> Result<UpsertResult, StoreError> {
        match self.store.upsert_batch(chunk).await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!(error = %err, size = chunk.len(), "batch upsert failed; retrying once");
                tokio::time::sleep(self.backoff.delay_for_attempt(0)).await;
                self.store.upsert_batch(chunk).await
            }
        }
    }

    pub async fn sync_batch(&self, events: &[pulse_core::CanonicalEvent]) -> SyncReport {
        let mut report = SyncReport::default();
        for chunk in events.chunks(self.batch_size) {
            report.attempted += chunk.len();
            match self.upsert_with_retry(chunk).await {
                Ok(result) => {
                    report.succeeded += result.succeeded;
                    report.failed += result.failed;
                    let failed: HashSet<&str> =
                        result.errors.iter().map(|e| e.event_hash.as_str()).collect();
                    for event in chunk {
                        if !failed.contains(event.event_hash.as_str()) {
                            report.synced_hashes.push(event.event_hash.clone());
                        }
                    }
                    for err in result.errors {
                        report
                            .errors
                            .push(format!("{}: {}", err.event_hash, err.message));
                    }
                }
                Err(err) => {
                    warn!(error = %err, size = chunk.len(), "batch upsert failed after retry; deferred to next run");
                    report.failed += chunk.len();
                    report.errors.push(err.to_string());
                }
            }
        }
        report
    }
}

/// Structured per-run accounting, logged and written to the reports dir.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_counter: u64,
    pub decision: SyncDecision,
    pub sources: Vec<FetchOutcome>,
    pub aborted_tasks: usize,
    pub fetched_records: usize,
    pub validation_dropped: usize,
    pub url_dropped: usize,
    pub hash_dropped: usize,
    pub fuzzy_dropped: usize,
    pub batch_after_dedup: usize,
    pub sync_attempted: usize,
    pub synced: usize,
    pub sync_failed: usize,
    pub pending_buffered: usize,
    pub history_entries: usize,
    pub elapsed_ms: u64,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    strategies: Vec<Arc<dyn FetchStrategy>>,
    state_store: Arc<dyn RunStateStore>,
    event_store: Arc<dyn EventStore>,
    normalizer: Normalizer,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        state_store: Arc<dyn RunStateStore>,
        event_store: Arc<dyn EventStore>,
    ) -> Result<Self> {
        let strategies = build_strategy_chain(&config)?;
        Ok(Self {
            config,
            registry,
            strategies,
            state_store,
            event_store,
            normalizer: Normalizer::default(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let (records, outcomes, aborted) = self.fetch_all().await;
        self.process(records, outcomes, aborted).await
    }

    /// Fans (source, locality) tasks out over a bounded worker pool. The
    /// run-level deadline aborts unfinished tasks but whatever is already
    /// fetched still flows through the rest of the pipeline.
    async fn fetch_all(&self) -> (Vec<RawRecord>, Vec<FetchOutcome>, usize) {
        let tasks = self.registry.enabled_tasks();
        let deadline = tokio::time::Instant::now() + self.config.run_deadline;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (source, locality) in tasks {
            let strategies = self.strategies.clone();
            let semaphore = semaphore.clone();
            let attempt_timeout = self.config.fetch_timeout;
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let adapter = adapter_for(source);
                fetch_source_records(adapter.as_ref(), &strategies, &locality, attempt_timeout)
                    .await
            });
        }

        let mut records = Vec::new();
        let mut outcomes = Vec::new();
        let mut aborted = 0usize;
        loop {
            match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((task_records, outcome)))) => {
                    records.extend(task_records);
                    outcomes.push(outcome);
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "fetch task failed to join");
                }
                Err(_) => {
                    aborted = join_set.len();
                    warn!(aborted, "run deadline reached; aborting remaining fetch tasks");
                    join_set.abort_all();
                    break;
                }
            }
        }
        (records, outcomes, aborted)
    }

    /// Normalize → dedup → cadence decision → sync, bracketed by one state
    /// load and one state save. Single-threaded on purpose: dedup needs the
    /// whole batch at once.
    pub async fn process(
        &self,
        raw_records: Vec<RawRecord>,
        sources: Vec<FetchOutcome>,
        aborted_tasks: usize,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let run_id = Uuid::new_v4();
        enter_stage(Stage::Idle);

        let mut state = self.state_store.load().await.context("loading run state")?;
        let run_counter = state.run_counter + 1;

        let mut history = DedupHistory::from_entries(std::mem::take(&mut state.entries));
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        let pruned = history.prune_older_than(cutoff);
        if pruned > 0 {
            debug!(pruned, "pruned stale dedup history entries");
        }

        enter_stage(Stage::Validating);
        let fetched_records = raw_records.len();
        let mut events = Vec::new();
        let mut validation_dropped = 0usize;
        for raw in &raw_records {
            match self.normalizer.normalize(raw) {
                Ok(event) => events.push(event),
                Err(reason) => {
                    validation_dropped += 1;
                    debug!(source = %raw.source, locality = %raw.locality, reason = %reason, "record dropped during validation");
                }
            }
        }

        // buffered events from skipped runs lead the batch, so
        // first-kept-wins favors the earlier sighting
        enter_stage(Stage::Deduplicating);
        let mut batch = std::mem::take(&mut state.pending);
        batch.extend(events);
        let engine = DedupEngine::new(DedupConfig {
            title_threshold: self.config.title_threshold,
            location_threshold: self.config.location_threshold,
            source_priority: self.registry.source_priority(),
        });
        let outcome = engine.deduplicate(batch, &mut history);
        let (mut kept, dropped) = (outcome.kept, outcome.dropped);

        let mut url_dropped = 0usize;
        let mut hash_dropped = 0usize;
        let mut fuzzy_dropped = 0usize;
        for (event, reason) in &dropped {
            match reason {
                DropReason::DuplicateLink { .. } => url_dropped += 1,
                DropReason::DuplicateHash { .. } => hash_dropped += 1,
                DropReason::FuzzyContent { .. } => fuzzy_dropped += 1,
            }
            debug!(link = %event.link, reason = ?reason, "record dropped as duplicate");
        }
        let batch_after_dedup = kept.len();

        enter_stage(Stage::DecidingSync);
        let commit = self.config.force_sync || self.config.sync_mode.should_commit(run_counter);
        let decision = if commit {
            SyncDecision::Commit
        } else {
            SyncDecision::Buffer
        };

        let report = if commit {
            enter_stage(Stage::Syncing);
            let manager = SyncManager::new(self.event_store.clone(), self.config.batch_size);
            let report = manager.sync_batch(&kept).await;

            // history only learns hashes the store confirmed; everything
            // else stays buffered for the next run
            let synced: HashSet<&str> =
                report.synced_hashes.iter().map(String::as_str).collect();
            let now = Utc::now();
            for event in kept.iter().filter(|e| synced.contains(e.event_hash.as_str())) {
                history.record(event, now);
            }
            kept.retain(|e| !synced.contains(e.event_hash.as_str()));
            report
        } else {
            enter_stage(Stage::Skipped);
            SyncReport::default()
        };

        let history_entries = history.len();
        state.run_counter = run_counter;
        state.entries = history.into_entries();
        state.pending = kept;
        let pending_buffered = state.pending.len();
        self.state_store
            .save(&state)
            .await
            .context("saving run state")?;

        enter_stage(Stage::Done);
        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            run_counter,
            decision,
            sources,
            aborted_tasks,
            fetched_records,
            validation_dropped,
            url_dropped,
            hash_dropped,
            fuzzy_dropped,
            batch_after_dedup,
            sync_attempted: report.attempted,
            synced: report.synced_hashes.len(),
            sync_failed: report.failed,
            pending_buffered,
            history_entries,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        if let Err(err) = self.write_run_report(&summary).await {
            warn!(error = %err, "failed to write run report");
        }
        info!(
            run_id = %summary.run_id,
            run_counter = summary.run_counter,
            decision = ?summary.decision,
            fetched = summary.fetched_records,
            validation_dropped = summary.validation_dropped,
            url_dropped = summary.url_dropped,
            hash_dropped = summary.hash_dropped,
            fuzzy_dropped = summary.fuzzy_dropped,
            synced = summary.synced,
            sync_failed = summary.sync_failed,
            pending = summary.pending_buffered,
            "run complete"
        );
        Ok(summary)
    }

    async fn write_run_report(&self, summary: &RunSummary) -> Result<()> {
        let dir = &self.config.reports_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{}.json", summary.run_id));
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Wires the file state store and the configured event store (Postgres when
/// a database URL is set, in-memory otherwise).
pub async fn build_pipeline(config: SyncConfig, registry: SourceRegistry) -> Result<SyncPipeline> {
    let state_store: Arc<dyn RunStateStore> =
        Arc::new(JsonStateStore::new(config.state_path.clone()));
    let event_store: Arc<dyn EventStore> = match &config.database_url {
        Some(url) => {
            let store = PgEventStore::connect(url)
                .await
                .context("connecting to event store")?;
            store
                .ensure_schema()
                .await
                .context("ensuring event store schema")?;
            Arc::new(store)
        }
        None => {
            warn!("PULSE_DATABASE_URL unset; using in-memory event store (events are not persisted)");
            Arc::new(MemoryEventStore::new())
        }
    };
    SyncPipeline::new(config, registry, state_store, event_store)
}

pub async fn run_once_from_env(force_sync: bool) -> Result<RunSummary> {
    let mut config = SyncConfig::from_env()?;
    config.force_sync = config.force_sync || force_sync;
    let registry = SourceRegistry::load(&config.sources_path)?;
    let pipeline = build_pipeline(config, registry).await?;
    pipeline.run_once().await
}

/// Cron-driven runs for `watch` mode.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    synced = summary.synced,
                    pending = summary.pending_buffered,
                    "scheduled run complete"
                ),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_mode_parsing_covers_the_whole_range() {
        assert_eq!(SyncMode::from_raw(0).expect("0"), SyncMode::Never);
        assert_eq!(SyncMode::from_raw(1).expect("1"), SyncMode::EveryRun);
        assert_eq!(SyncMode::from_raw(3).expect("3"), SyncMode::EveryNth(3));
        assert_eq!(SyncMode::from_raw(4).expect("4"), SyncMode::EveryNth(4));
        assert_eq!(SyncMode::from_raw(5).expect("5"), SyncMode::Always);
        assert_eq!(SyncMode::from_raw(99).expect("99"), SyncMode::Always);
        assert!(matches!(
            SyncMode::from_raw(-1),
            Err(ConfigError::InvalidSyncMode(-1))
        ));
    }

    #[test]
    fn cadence_commits_every_nth_invocation() {
        let mode = SyncMode::EveryNth(3);
        assert!(!mode.should_commit(1));
        assert!(!mode.should_commit(2));
        assert!(mode.should_commit(3));
        assert!(!mode.should_commit(4));
        assert!(mode.should_commit(6));

        assert!(!SyncMode::Never.should_commit(3));
        assert!(SyncMode::EveryRun.should_commit(1));
        assert!(SyncMode::Always.should_commit(7));
    }

    #[test]
    fn registry_parses_sources_localities_and_priority() {
        let yaml = r#"
sources:
  - source: eventbrite
    localities: ["los-angeles", "new-york"]
  - source: ra_co
    enabled: false
    localities: ["us/losangeles"]
  - source: luma
    localities: ["la"]
priority: [luma, eventbrite]
"#;
        let registry = SourceRegistry::from_yaml_str(yaml).expect("parse");
        let tasks = registry.enabled_tasks();
        assert_eq!(
            tasks,
            vec![
                (Source::Eventbrite, "los-angeles".to_string()),
                (Source::Eventbrite, "new-york".to_string()),
                (Source::Luma, "la".to_string()),
            ]
        );
        assert_eq!(registry.source_priority(), vec![Source::Luma, Source::Eventbrite]);

        let bare = SourceRegistry::from_yaml_str("sources: []").expect("parse");
        assert_eq!(bare.source_priority(), Source::default_priority());
    }
}

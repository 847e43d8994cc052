//! HTTP fetch plumbing, fallback fetch strategies and persistent run state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use pulse_core::{CanonicalEvent, DedupHistoryEntry};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Coarse request pacing shared by every strategy behind one fetcher.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

/// Shared HTTP client with per-source concurrency limits, optional token
/// bucket pacing and transient-failure retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET a page body as text, retrying transient failures with backoff.
    pub async fn fetch_text(&self, source: &str, url: &str) -> Result<String, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(body);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(source, url, status = status.as_u16(), attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Failure taxonomy for a single fetch attempt, reported in run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Timeout,
    Blocked,
    Http(u16),
    Transport,
    Empty,
    ParseEmpty,
}

pub fn classify_failure(err: &FetchError) -> FailureClass {
    match err {
        FetchError::Request(e) if e.is_timeout() => FailureClass::Timeout,
        FetchError::Request(_) => FailureClass::Transport,
        FetchError::HttpStatus { status, .. } => match status {
            401 | 403 | 429 => FailureClass::Blocked,
            s => FailureClass::Http(*s),
        },
        FetchError::InvalidUrl(_) => FailureClass::Transport,
    }
}

const BLOCK_MARKERS: &[&str] = &[
    "captcha",
    "cf-chl",
    "just a moment",
    "access denied",
    "datadome",
    "are you a robot",
    "verify you are human",
    "enable javascript and cookies to continue",
];

/// Heuristic scan for anti-bot challenge pages that come back with a 200.
pub fn looks_blocked(html: &str) -> bool {
    let lower = html.to_lowercase();
    BLOCK_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// One way of turning a URL into rendered HTML. Strategies are tried in a
/// fixed order by the fallback-chain driver; each attempt stands alone.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt(&self, source: &str, url: &str) -> Result<String, FetchError>;
}

/// Primary strategy: plain HTTP fetch through the shared client.
pub struct DirectHttpStrategy {
    http: Arc<HttpFetcher>,
}

impl DirectHttpStrategy {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl FetchStrategy for DirectHttpStrategy {
    fn name(&self) -> &str {
        "direct"
    }

    async fn attempt(&self, source: &str, url: &str) -> Result<String, FetchError> {
        self.http.fetch_text(source, url).await
    }
}

/// One remote browser-rendering provider. Providers without an API key are
/// never constructed, so the chain silently shortens.
#[derive(Debug, Clone, Deserialize)]
pub struct RenderApiConfig {
    pub name: String,
    pub endpoint: String,
    pub api_key: String,
}

pub struct RenderApiStrategy {
    http: Arc<HttpFetcher>,
    config: RenderApiConfig,
}

impl RenderApiStrategy {
    pub fn new(http: Arc<HttpFetcher>, config: RenderApiConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl FetchStrategy for RenderApiStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn attempt(&self, source: &str, url: &str) -> Result<String, FetchError> {
        let request_url = Url::parse_with_params(
            &self.config.endpoint,
            &[("api_key", self.config.api_key.as_str()), ("url", url)],
        )
        .map_err(|e| FetchError::InvalidUrl(format!("{}: {e}", self.config.endpoint)))?;

        self.http.fetch_text(source, request_url.as_str()).await
    }
}

/// Persistent cross-run pipeline state: the dedup history, the invocation
/// counter and the pending (buffered, not yet synced) batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_counter: u64,
    #[serde(default)]
    pub entries: Vec<DedupHistoryEntry>,
    #[serde(default)]
    pub pending: Vec<CanonicalEvent>,
}

/// Load-at-start / save-at-end lifecycle around each pipeline run. The
/// pipeline assumes a single writer; concurrent runs must be serialized
/// externally.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<RunState>;
    async fn save(&self, state: &RunState) -> anyhow::Result<()>;
}

/// JSON file implementation with atomic temp-file-then-rename writes, so a
/// crash mid-save never corrupts the previous state.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RunStateStore for JsonStateStore {
    async fn load(&self) -> anyhow::Result<RunState> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking state file {}", self.path.display()))?
        {
            return Ok(RunState::default());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading state file {}", self.path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing state file {}", self.path.display()))
    }

    async fn save(&self, state: &RunState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(state).context("serializing run state")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating state directory {}", parent.display()))?;
            }
        }

        let temp_path = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming state file {} -> {}",
                        temp_path.display(),
                        self.path.display()
                    )
                })
            }
        }
    }
}

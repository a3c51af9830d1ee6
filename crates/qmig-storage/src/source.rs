use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use qmig_core::EntityType;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::retry::{RetryDisposition, RetryPolicy};

/// One page of raw items. `remaining` counts items after this page.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePage {
    pub items: Vec<JsonValue>,
    pub remaining: i64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("no source endpoint configured for {0}")]
    NotConfigured(EntityType),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Unavailable(_) => RetryDisposition::Retryable,
            FetchError::Decode { .. } | FetchError::NotConfigured(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// Rate limiting and transient server failures are retried; every other status is fatal.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::INTERNAL_SERVER_ERROR {
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

/// Reader for one page of one entity type.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_page(
        &self,
        entity: EntityType,
        cursor: u64,
        limit: u32,
    ) -> Result<SourcePage, FetchError>;
}

/// Spaces calls so that consecutive acquisitions are at least `interval` apart,
/// no matter how many tasks share the limiter.
#[derive(Debug)]
pub struct MinIntervalLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl MinIntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&self) {
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceEndpoint {
    pub type_name: String,
    pub constraints: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub endpoints: HashMap<EntityType, SourceEndpoint>,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/1.1".to_string(),
            token: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 4,
            endpoints: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    response: EnvelopeBody,
}

#[derive(Debug, Deserialize)]
struct EnvelopeBody {
    #[serde(default)]
    results: Vec<JsonValue>,
    #[serde(default)]
    remaining: i64,
}

/// Single-attempt client for the paginated `GET /obj/<type>` data API.
#[derive(Debug)]
pub struct HttpRecordSource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    global_limit: Arc<Semaphore>,
    endpoints: HashMap<EntityType, SourceEndpoint>,
}

impl HttpRecordSource {
    pub fn new(config: HttpSourceConfig) -> anyhow::Result<Self> {
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
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            endpoints: config.endpoints,
        })
    }

    fn url_for(&self, endpoint: &SourceEndpoint) -> String {
        format!("{}/obj/{}", self.base_url, endpoint.type_name)
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn fetch_page(
        &self,
        entity: EntityType,
        cursor: u64,
        limit: u32,
    ) -> Result<SourcePage, FetchError> {
        let endpoint = self
            .endpoints
            .get(&entity)
            .ok_or(FetchError::NotConfigured(entity))?;
        let url = self.url_for(endpoint);

        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Unavailable("http client shut down".to_string()))?;

        let mut query = vec![("limit", limit.to_string()), ("cursor", cursor.to_string())];
        if let Some(constraints) = &endpoint.constraints {
            query.push(("constraints", constraints.to_string()));
        }

        let mut request = self.client.get(&url).query(&query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body = resp.bytes().await?;
        let envelope: Envelope = serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
            url: url.clone(),
            message: e.to_string(),
        })?;
        Ok(SourcePage {
            items: envelope.response.results,
            remaining: envelope.response.remaining,
        })
    }
}

#[derive(Debug, Error)]
pub enum PaginatorError {
    #[error("fetching {entity} at cursor {cursor} exhausted {attempts} attempts: {source}")]
    FetchExhausted {
        entity: EntityType,
        cursor: u64,
        attempts: u32,
        #[source]
        source: FetchError,
    },
    #[error("fetching {entity} at cursor {cursor} failed: {source}")]
    Fatal {
        entity: EntityType,
        cursor: u64,
        #[source]
        source: FetchError,
    },
}

/// Rate-limited, retrying reader over a [`RecordSource`].
#[derive(Clone)]
pub struct SourcePaginator {
    source: Arc<dyn RecordSource>,
    limiter: Arc<MinIntervalLimiter>,
    retry: RetryPolicy,
    page_size: u32,
}

impl SourcePaginator {
    pub fn new(
        source: Arc<dyn RecordSource>,
        limiter: Arc<MinIntervalLimiter>,
        retry: RetryPolicy,
        page_size: u32,
    ) -> Self {
        Self {
            source,
            limiter,
            retry,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetches one page. Every attempt, retries included, waits on the shared limiter.
    pub async fn fetch_page(
        &self,
        entity: EntityType,
        cursor: u64,
    ) -> Result<SourcePage, PaginatorError> {
        let span = info_span!("source_page", %entity, cursor);
        let source = Arc::clone(&self.source);
        let limiter = Arc::clone(&self.limiter);
        let page_size = self.page_size;

        self.retry
            .run(
                |_attempt| {
                    let source = Arc::clone(&source);
                    let limiter = Arc::clone(&limiter);
                    async move {
                        limiter.acquire().await;
                        source.fetch_page(entity, cursor, page_size).await
                    }
                },
                FetchError::disposition,
            )
            .instrument(span)
            .await
            .map_err(|retried| {
                if retried.exhausted {
                    PaginatorError::FetchExhausted {
                        entity,
                        cursor,
                        attempts: retried.attempts,
                        source: retried.error,
                    }
                } else {
                    PaginatorError::Fatal {
                        entity,
                        cursor,
                        source: retried.error,
                    }
                }
            })
    }

    /// Lazy page sequence starting at cursor 0.
    pub fn iterate_all(&self, entity: EntityType) -> PageCursor {
        PageCursor {
            paginator: self.clone(),
            entity,
            cursor: 0,
            done: false,
        }
    }

    /// Reads pages until exhausted or `cap` items have been collected.
    pub async fn fetch_all(
        &self,
        entity: EntityType,
        cap: Option<usize>,
    ) -> Result<Vec<JsonValue>, PaginatorError> {
        let mut pages = self.iterate_all(entity);
        let mut items = Vec::new();
        while let Some(page) = pages.next_page().await? {
            items.extend(page);
            if let Some(cap) = cap {
                if items.len() >= cap {
                    items.truncate(cap);
                    break;
                }
            }
        }
        debug!(%entity, count = items.len(), "fetched all pages");
        Ok(items)
    }
}

/// Cursor over the pages of one entity type. Ends once the source reports nothing remaining.
pub struct PageCursor {
    paginator: SourcePaginator,
    entity: EntityType,
    cursor: u64,
    done: bool,
}

impl PageCursor {
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<JsonValue>>, PaginatorError> {
        if self.done {
            return Ok(None);
        }
        let page = self.paginator.fetch_page(self.entity, self.cursor).await?;
        self.cursor += page.items.len() as u64;
        // An empty page cannot advance the cursor.
        if page.remaining <= 0 || page.items.is_empty() {
            self.done = true;
        }
        if page.items.is_empty() {
            return Ok(None);
        }
        Ok(Some(page.items))
    }
}

//! Shared feed downloader: bounded timeout, capped retries, global and per-source limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.9, */*;q=0.5";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

impl FetchError {
    /// Timeouts, refused connections, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                .unwrap_or(false),
            FetchError::TooLarge { .. } => false,
        }
    }
}

/// Exponential delay between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub max_body_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 1,
            max_body_bytes: 8 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// One client shared by interactive searches and the scheduler, so both
/// respect the same connection limits.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Arc<Semaphore>,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_source_limit: usize,
    max_body_bytes: usize,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            global: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source: Mutex::new(HashMap::new()),
            per_source_limit: config.per_source_concurrency.max(1),
            max_body_bytes: config.max_body_bytes,
            retry: config.retry,
        })
    }

    async fn source_gate(&self, source: &str) -> Arc<Semaphore> {
        let mut gates = self.per_source.lock().await;
        Arc::clone(
            gates
                .entry(source.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit))),
        )
    }

    /// GETs `url`, retrying transient failures. Non-2xx after the last retry is an error.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source, url);
        async {
            // The semaphores are never closed; a failed acquire just runs unthrottled.
            let _global = self.global.acquire().await.ok();
            let gate = self.source_gate(source).await;
            let _source = gate.acquire().await.ok();

            let mut retry = 0;
            loop {
                match self.attempt(url).await {
                    Err(err) if err.is_retryable() && retry < self.retry.max_retries => {
                        let delay = self.retry.delay_before_retry(retry);
                        debug!(error = %err, retry, ?delay, "transient fetch failure");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    outcome => return outcome,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(FetchError::TooLarge {
                url: final_url,
                limit: self.max_body_bytes,
            });
        }

        let body = response.bytes().await?;
        if body.len() > self.max_body_bytes {
            return Err(FetchError::TooLarge {
                url: final_url,
                limit: self.max_body_bytes,
            });
        }
        Ok(FetchedResponse {
            status: status.as_u16(),
            final_url,
            body: body.to_vec(),
        })
    }
}

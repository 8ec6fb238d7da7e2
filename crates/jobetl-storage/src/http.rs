//! Retrying HTTP fetcher with exponential backoff and a request-interval bucket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

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
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
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
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
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

impl TokenBucketConfig {
    /// One request per `interval`.
    pub fn min_interval(interval: Duration) -> Option<Self> {
        if interval.is_zero() {
            None
        } else {
            Some(Self {
                capacity: 1,
                refill_every: interval,
            })
        }
    }
}

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
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query` and `headers`, retrying retryable failures.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, query, headers)
            .instrument(span)
            .await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let resp_result = self
                .client
                .get(url)
                .query(query)
                .headers(headers.clone())
                .send()
                .await;
            let can_retry = attempt < self.backoff.max_retries;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retryable status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "retryable request error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

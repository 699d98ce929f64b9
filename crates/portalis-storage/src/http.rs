//! GET-with-retry primitive shared by every source connector.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, RETRY_AFTER,
};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub const DEFAULT_USER_AGENT: &str = "Portalis/1.0";
const DEFAULT_RETRY_AFTER: Duration = Duration::from_millis(1000);

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
    /// Deadline for a single attempt, body included.
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-call overrides. Unset fields use the fetcher's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
    pub etag: Option<String>,
    pub if_modified_since: Option<String>,
    pub timeout: Option<Duration>,
    pub retries: Option<usize>,
}

impl FetchOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn if_modified_since(mut self, value: impl Into<String>) -> Self {
        self.if_modified_since = Some(value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse<T> {
    pub status: u16,
    /// `None` on 304.
    pub data: Option<T>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl<T> HttpResponse<T> {
    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("tls verification failed for {url}: {message}")]
    Tls { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::HttpStatus { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Tls { .. } | Self::Decode { .. } | Self::InvalidUrl(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        match tls_failure(&err) {
            Some(message) => Self::Tls {
                url: url.to_string(),
                message,
            },
            None => Self::Request(err),
        }
    }
}

/// Certificate problems surface deep in the connector's error chain.
fn tls_failure(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut current = Some(err);
    while let Some(e) = current {
        let text = e.to_string();
        let lower = text.to_ascii_lowercase();
        if lower.contains("certificate") || lower.contains("unknownissuer") {
            return Some(text);
        }
        current = e.source();
    }
    None
}

fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

enum Attempt {
    Complete(HttpResponse<Vec<u8>>),
    RateLimited(Duration),
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn default_retries(&self) -> usize {
        self.backoff.max_retries
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        opts: &FetchOptions,
    ) -> Result<HttpResponse<T>, FetchError> {
        let raw = self.fetch(url, opts, "application/json").await?;
        let data = raw
            .data
            .map(|body| serde_json::from_slice::<T>(&body))
            .transpose()
            .map_err(|e| FetchError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(HttpResponse {
            status: raw.status,
            data,
            etag: raw.etag,
            last_modified: raw.last_modified,
        })
    }

    pub async fn fetch_text(
        &self,
        url: &str,
        opts: &FetchOptions,
    ) -> Result<HttpResponse<String>, FetchError> {
        let raw = self.fetch(url, opts, "*/*").await?;
        Ok(HttpResponse {
            status: raw.status,
            data: raw
                .data
                .map(|body| String::from_utf8_lossy(&body).into_owned()),
            etag: raw.etag,
            last_modified: raw.last_modified,
        })
    }

    async fn fetch(
        &self,
        url: &str,
        opts: &FetchOptions,
        accept: &'static str,
    ) -> Result<HttpResponse<Vec<u8>>, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let headers = request_headers(opts, accept);
        let timeout = opts.timeout.unwrap_or(self.timeout);
        let retries = opts.retries.unwrap_or(self.backoff.max_retries);

        // The semaphore is never closed.
        let _permit = self.limit.acquire().await.ok();

        let span = info_span!("http_fetch", url = %parsed);
        async move {
            let mut attempt = 0usize;
            loop {
                let result =
                    match tokio::time::timeout(timeout, self.attempt(parsed.clone(), headers.clone()))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Timeout {
                            url: url.to_string(),
                            timeout_ms: millis(timeout),
                        }),
                    };

                let err = match result {
                    Ok(Attempt::Complete(response)) => {
                        debug!(status = response.status, attempt = attempt + 1, "fetched");
                        return Ok(response);
                    }
                    Ok(Attempt::RateLimited(wait)) => {
                        let wait = wait.min(timeout);
                        if attempt >= retries {
                            return Err(FetchError::HttpStatus {
                                status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                                url: url.to_string(),
                            });
                        }
                        warn!(
                            attempt = attempt + 1,
                            wait_ms = millis(wait),
                            "rate limited, waiting before retry"
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    Err(err) => err,
                };

                if !err.is_retryable() || attempt >= retries {
                    return Err(err);
                }
                warn!(
                    attempt = attempt + 1,
                    max_attempts = retries + 1,
                    error = %err,
                    "http request failed, retrying"
                );
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: Url, headers: HeaderMap) -> Result<Attempt, FetchError> {
        let url_text = url.to_string();
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&url_text, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(Attempt::RateLimited(retry_after(response.headers())));
        }

        let etag = header_string(response.headers(), ETAG);
        let last_modified = header_string(response.headers(), LAST_MODIFIED);

        if status == StatusCode::NOT_MODIFIED {
            return Ok(Attempt::Complete(HttpResponse {
                status: status.as_u16(),
                data: None,
                etag,
                last_modified,
            }));
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(&url_text, e))?;
        Ok(Attempt::Complete(HttpResponse {
            status: status.as_u16(),
            data: Some(body.to_vec()),
            etag,
            last_modified,
        }))
    }
}

fn request_headers(opts: &FetchOptions, accept: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(accept));

    for (name, value) in &opts.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping invalid request header"),
        }
    }

    if let Some(value) = opts.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(IF_NONE_MATCH, value);
    }
    if let Some(value) = opts
        .if_modified_since
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(IF_MODIFIED_SINCE, value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_reads_seconds_or_defaults() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(retry_after(&headers), Duration::from_secs(3));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn oversized_durations_saturate_when_logged() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn status_classification_follows_retry_policy() {
        let status = |status| FetchError::HttpStatus {
            status,
            url: "https://example.test".into(),
        };
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(408).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(401).is_retryable());

        let tls = FetchError::Tls {
            url: "https://example.test".into(),
            message: "invalid peer certificate".into(),
        };
        assert!(!tls.is_retryable());
        assert!(tls.is_tls());
        assert!(FetchError::Timeout {
            url: String::new(),
            timeout_ms: 10
        }
        .is_retryable());
    }

    #[derive(Debug)]
    struct Layer {
        message: &'static str,
        inner: Option<Box<Layer>>,
    }

    impl fmt::Display for Layer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl StdError for Layer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.inner.as_deref().map(|e| e as &(dyn StdError + 'static))
        }
    }

    #[test]
    fn tls_failures_are_found_anywhere_in_the_chain() {
        let err = Layer {
            message: "error sending request",
            inner: Some(Box::new(Layer {
                message: "client error (Connect)",
                inner: Some(Box::new(Layer {
                    message: "invalid peer certificate: UnknownIssuer",
                    inner: None,
                })),
            })),
        };
        assert_eq!(
            tls_failure(&err).as_deref(),
            Some("invalid peer certificate: UnknownIssuer")
        );

        let plain = Layer {
            message: "connection refused",
            inner: None,
        };
        assert!(tls_failure(&plain).is_none());
    }

    #[test]
    fn conditional_headers_are_attached() {
        let opts = FetchOptions::default()
            .header("X-API-Key", "secret")
            .header("bad header", "x")
            .etag("\"abc\"")
            .if_modified_since("Wed, 21 Oct 2015 07:28:00 GMT");
        let headers = request_headers(&opts, "application/json");
        assert_eq!(headers.get(IF_NONE_MATCH).unwrap(), "\"abc\"");
        assert_eq!(headers.get("x-api-key").unwrap(), "secret");
        assert!(headers.get(IF_MODIFIED_SINCE).is_some());
        assert_eq!(headers.len(), 4);
    }

    #[tokio::test]
    async fn invalid_urls_fail_without_a_request() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let err = fetcher
            .fetch_json::<serde_json::Value>("not a url", &FetchOptions::default())
            .await
            .expect_err("invalid url");
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}

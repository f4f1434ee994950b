//! # Retrying Transport
//!
//! Every downstream HTTP call goes through [`RetryingTransport`].
//!
//! ## Attempt Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  buffer body ──► attempt k ──► response / error                         │
//! │                     ▲              │                                    │
//! │                     │              ├── 2xx, 4xx (≠429), 501 ─► return   │
//! │                     │              ├── non-transient error ──► return   │
//! │                     │              │                                    │
//! │                     │              ├── 429/500/502/503/504 ─┐           │
//! │                     │              └── transient error ─────┤           │
//! │                     │                                       ▼           │
//! │                     │                           drain body, k > max?    │
//! │                     │                            │ no          │ yes    │
//! │                     │                            ▼             ▼        │
//! │                     └──── sleep(backoff) ◄── select!    RetriesExhausted│
//! │                                                  │      (+ last resp.)  │
//! │                                         cancelled ─► Cancelled          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backoff
//! Wait before retry *k* is `min(max_delay, base_delay * factor^(k-1))`:
//! ```text
//! base 500ms, factor 2, max 30s:   500ms, 1s, 2s, 4s, ... 30s, 30s
//! ```

use std::error::Error as _;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ResponseSnapshot, SyncError, SyncResult};

// =============================================================================
// Retry Configuration
// =============================================================================

/// Retry budget and backoff curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn no_retry() -> Self {
        RetryConfig {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Deterministic exponential backoff (no jitter, no elapsed-time cap).
    pub fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier: self.factor,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Statuses worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Network errors worth another attempt: timeouts, connection-level I/O
/// failures, refused TCP connects and temporary resolver failures.
///
/// A name that does not resolve at all fails on the first attempt.
pub fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return true;
    }
    if let Some(detail) = dns_failure(err) {
        return is_temporary_dns_failure(&detail);
    }
    if err.is_connect() {
        return true;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(
                io.kind(),
                ConnectionReset
                    | ConnectionAborted
                    | ConnectionRefused
                    | BrokenPipe
                    | TimedOut
                    | UnexpectedEof
                    | Interrupted
            ) {
                return true;
            }
        }
        source = cause.source();
    }

    false
}

/// Resolver errors surface as a `dns error` link in the source chain; the
/// resolver's own message follows it.
fn dns_failure(err: &reqwest::Error) -> Option<String> {
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }

    let joined = chain.join(": ").to_lowercase();
    joined.contains("dns error").then_some(joined)
}

/// EAI_AGAIN and resolver timeouts, as glibc, musl and hickory word them.
fn is_temporary_dns_failure(detail: &str) -> bool {
    const TEMPORARY: [&str; 4] = [
        "temporary failure in name resolution",
        "try again",
        "timed out",
        "timeout",
    ];
    let detail = detail.to_lowercase();
    TEMPORARY.iter().any(|marker| detail.contains(marker))
}

// =============================================================================
// Replayable Request
// =============================================================================

/// A request with its body buffered so every attempt sends identical bytes.
struct ReplayableRequest {
    template: Request,
    body: Option<Bytes>,
}

impl ReplayableRequest {
    fn new(mut request: Request) -> SyncResult<Self> {
        let body = match request.body_mut().take() {
            Some(body) => Some(body.as_bytes().map(Bytes::copy_from_slice).ok_or_else(|| {
                SyncError::InvalidConfig("streaming request bodies cannot be retried".into())
            })?),
            None => None,
        };

        Ok(ReplayableRequest { template: request, body })
    }

    fn build(&self) -> Request {
        let mut request = Request::new(self.template.method().clone(), self.template.url().clone());
        *request.headers_mut() = self.template.headers().clone();
        *request.timeout_mut() = self.template.timeout().copied();
        *request.version_mut() = self.template.version();
        if let Some(body) = &self.body {
            *request.body_mut() = Some(body.clone().into());
        }
        request
    }
}

// =============================================================================
// Transport
// =============================================================================

/// HTTP client wrapper that retries transient failures with backoff.
#[derive(Debug, Clone)]
pub struct RetryingTransport {
    client: Client,
    retry: RetryConfig,
}

impl RetryingTransport {
    pub fn new(client: Client, retry: RetryConfig) -> Self {
        RetryingTransport { client, retry }
    }

    /// Builds a client with a per-attempt timeout.
    pub fn with_timeout(timeout: Duration, retry: RetryConfig) -> SyncResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::new(client, retry))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Executes with this transport's own retry configuration.
    pub async fn send(&self, request: Request, cancel: &CancellationToken) -> SyncResult<Response> {
        self.execute(request, &self.retry, cancel).await
    }

    /// Executes a request, retrying per `retry`.
    ///
    /// Non-retryable responses (including 4xx) are returned as `Ok`,
    /// unmodified; interpreting the status is the caller's job.
    pub async fn execute(
        &self,
        request: Request,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> SyncResult<Response> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let replayable = ReplayableRequest::new(request)?;
        let method = replayable.template.method().clone();
        let url = replayable.template.url().clone();
        let mut backoff = retry.create_backoff();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let exhausted = attempts > retry.max_retries;

            let (status, last_error, snapshot) = match self.client.execute(replayable.build()).await {
                Ok(response) if !is_retryable_status(response.status()) => {
                    debug!(%method, %url, status = response.status().as_u16(), attempts, "Request complete");
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    // Drain the failed body so the connection can be reused.
                    let body = response.bytes().await.unwrap_or_default();
                    let snapshot = exhausted.then(|| ResponseSnapshot {
                        status,
                        headers,
                        body,
                    });
                    (Some(status.as_u16()), format!("status {}", status), snapshot)
                }
                Err(err) if !is_transient(&err) => return Err(SyncError::Http(err)),
                Err(err) => (None, err.to_string(), None),
            };

            if exhausted {
                warn!(%method, %url, attempts, ?status, error = %last_error, "Retry budget exhausted");
                return Err(SyncError::RetriesExhausted {
                    attempts,
                    status,
                    last_error,
                    response: snapshot,
                });
            }

            let delay = backoff.next_backoff().unwrap_or(retry.max_delay);
            warn!(
                %method,
                %url,
                attempt = attempts,
                ?status,
                error = %last_error,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%method, %url, "Cancelled during backoff");
                    return Err(SyncError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// Base URL plus basic-auth credential of one downstream server.
#[derive(Debug, Clone)]
pub struct Endpoint {
    base: Url,
    username: String,
    api_key: String,
}

impl Endpoint {
    pub fn new(
        base: &str,
        username: impl Into<String>,
        api_key: impl Into<String>,
    ) -> SyncResult<Self> {
        let base = Url::parse(base)?;
        if base.cannot_be_a_base() {
            return Err(SyncError::InvalidUrl(format!("not a base URL: {}", base)));
        }

        Ok(Endpoint {
            base,
            username: username.into(),
            api_key: api_key.into(),
        })
    }

    /// Appends path segments to the base URL, percent-encoding each one.
    pub fn url(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Starts an authenticated request.
    pub fn request(&self, client: &Client, method: Method, url: Url) -> RequestBuilder {
        client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.api_key))
    }
}

/// Reads the body of a 2xx response, or turns anything else into
/// `SyncError::Protocol`.
pub async fn success_body(response: Response) -> SyncResult<Bytes> {
    let status = response.status();
    let body = response.bytes().await?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(SyncError::protocol(status, &body))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

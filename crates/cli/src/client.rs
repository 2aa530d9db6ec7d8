//! REST client for the monitoring platform
//!
//! Every request is authenticated and retried with jittered exponential
//! backoff. Client errors that cannot succeed on a retry fail immediately.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::{Auth, Config};

/// Errors returned by [`RestClient`]
#[derive(Debug, Error)]
pub enum RestError {
    #[error("invalid request path {path}: {source}")]
    InvalidPath {
        path: String,
        source: url::ParseError,
    },

    #[error("request failed ({status}): {body}")]
    Status { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl RestError {
    /// Whether repeating the request could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RestError::InvalidPath { .. } => false,
            RestError::Status { status, .. } => !matches!(
                *status,
                StatusCode::BAD_REQUEST
                    | StatusCode::UNAUTHORIZED
                    | StatusCode::FORBIDDEN
                    | StatusCode::NOT_FOUND
            ),
            RestError::Transport(e) => !e.is_builder(),
        }
    }
}

/// Backoff schedule for failed requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the delay added as random jitter
    pub jitter: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            jitter: 0.05,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let base = self
            .initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff));

        let max_jitter_ms = (base.as_millis() as f64 * self.jitter) as u64;
        base + Duration::from_millis(rand_jitter(max_jitter_ms))
    }
}

fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }

    // Sub-second clock noise is enough to spread retries apart
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;

    now % (max_ms + 1)
}

/// Authenticated HTTP client bound to one platform instance
pub struct RestClient {
    client: Client,
    base_url: Url,
    auth: Auth,
    retry: RetryPolicy,
}

impl RestClient {
    /// Create a client from the CLI configuration
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Self::with_base_url(
            &config.base_url(),
            config.auth()?,
            config.insecure,
            config.request_timeout(),
        )?;
        Ok(client.with_retry(RetryPolicy {
            max_retries: config.max_retries,
            ..Default::default()
        }))
    }

    /// `timeout` bounds each attempt unless a request sets its own
    pub fn with_base_url(
        base_url: &str,
        auth: Auth,
        insecure: bool,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid platform URL")?;

        Ok(Self {
            client,
            base_url,
            auth,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve a path relative to the platform root
    pub fn url(&self, path: &str) -> Result<Url, RestError> {
        self.base_url
            .join(path)
            .map_err(|source| RestError::InvalidPath {
                path: path.to_string(),
                source,
            })
    }

    /// Send a request, retrying per the retry policy.
    ///
    /// `build` is called once per attempt.
    pub async fn send<F>(&self, build: F) -> Result<Response, RestError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let request = self.authorize(build(&self.client));
            let err = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %response.url(), status = %response.status(), attempt, "Request succeeded");
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    RestError::Status { status, body }
                }
                Err(e) => RestError::Transport(e),
            };

            if attempt >= self.retry.max_retries || !err.is_retryable() {
                return Err(err);
            }

            let delay = self.retry.backoff(attempt);
            attempt += 1;
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic { user, password } => request.basic_auth(user, Some(password)),
        }
    }
}

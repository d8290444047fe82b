//! Self-regulating egress HTTP client.
//!
//! The client half of the rate-limit cooperation loop: it reads the server's
//! `Retry-After`, `X-RateLimit-Retry-After-Ms`, `X-Backpressure` and
//! `RateLimit-Remaining` headers, remembers them, and regulates its own call
//! rate by queueing until the advertised deadline or rejecting locally,
//! depending on the configured strategy.

use crate::{logging, utils, Error, Result};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tokio::time::Instant;

/// How the client reacts when the server says it is rate limited.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStrategy {
    /// Sleep until the advertised deadline, then retry.
    Queue,
    /// Raise immediately and let the caller decide.
    Reject,
}

impl Default for ClientStrategy {
    fn default() -> ClientStrategy {
        ClientStrategy::Queue
    }
}

/// Errors surfaced by the [`AdaptiveClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("rate limited, retry after {retry_after:.2}s (backpressure {backpressure:.2})")]
    RateLimited {
        retry_after: f64,
        backpressure: f64,
    },
    #[error("max retries ({attempts}) exceeded, last Retry-After: {last_retry_after:.2}s")]
    MaxRetriesExceeded {
        attempts: u32,
        last_retry_after: f64,
    },
    #[error("HTTP error {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Configuration of an [`AdaptiveClient`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdaptiveClientConfig {
    pub strategy: ClientStrategy,
    /// Retry budget for the `queue` strategy.
    pub max_retries: u32,
    /// Each successive wait is multiplied by this.
    pub backoff_multiplier: f64,
    /// Cap on any single wait, in seconds.
    pub max_wait_secs: f64,
    /// Slow down proactively once the last-seen backpressure crosses the
    /// threshold, before the server has to reject anything.
    pub respect_backpressure: bool,
    pub backpressure_threshold: f64,
}

impl Default for AdaptiveClientConfig {
    fn default() -> Self {
        AdaptiveClientConfig {
            strategy: ClientStrategy::default(),
            max_retries: 3,
            backoff_multiplier: 1.0,
            max_wait_secs: 60.0,
            respect_backpressure: true,
            backpressure_threshold: 0.8,
        }
    }
}

impl AdaptiveClientConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::msg("zero max_retries"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::msg("backoff_multiplier must be >= 1"));
        }
        if self.max_wait_secs <= 0.0 {
            return Err(Error::msg("non-positive max_wait_secs"));
        }
        if !(0.0..=1.0).contains(&self.backpressure_threshold) {
            return Err(Error::msg("backpressure_threshold outside [0, 1]"));
        }
        Ok(())
    }
}

impl fmt::Display for AdaptiveClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

#[derive(Debug, Default)]
struct RateLimitState {
    retry_after_deadline: Option<Instant>,
    backpressure: f64,
    remaining_tokens: Option<i64>,
}

impl RateLimitState {
    fn retry_after_secs(&self, now: Instant) -> f64 {
        self.retry_after_deadline.map_or(0.0, |deadline| {
            deadline.saturating_duration_since(now).as_secs_f64()
        })
    }

    /// Absorb the rate-limit headers of any response. Returns the advertised
    /// wait in seconds when `response` is a 429.
    fn update_from_response(&mut self, response: &Response, now: Instant) -> f64 {
        if let Some(bp) = header_f64(response, "X-Backpressure") {
            self.backpressure = bp;
        }
        if let Some(remaining) = header_f64(response, "RateLimit-Remaining") {
            self.remaining_tokens = Some(remaining as i64);
        }
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return 0.0;
        }

        let mut wait_secs = header_f64(response, "Retry-After").unwrap_or(1.0);
        // The millisecond header is preferred when present.
        if let Some(ms) = header_f64(response, "X-RateLimit-Retry-After-Ms") {
            wait_secs = ms / 1000.0;
        }
        self.retry_after_deadline = Some(now + utils::secs_f64(wait_secs));
        wait_secs
    }
}

fn header_f64(response: &Response, name: &str) -> Option<f64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
}

/// HTTP client that cooperates with server rate limiting.
pub struct AdaptiveClient {
    client_name: String,
    base_url: String,
    http: reqwest::Client,
    config: AdaptiveClientConfig,
    state: Mutex<RateLimitState>,
}

impl AdaptiveClient {
    pub fn new(
        client_name: impl Into<String>,
        base_url: impl Into<String>,
        config: AdaptiveClientConfig,
    ) -> Result<Self> {
        config.is_valid()?;
        let client_name = client_name.into();
        let base_url = base_url.into();
        logging::info!(
            "[AdaptiveClient] creating {}: base_url={}, strategy={:?}, max_retries={}",
            client_name,
            base_url,
            config.strategy,
            config.max_retries
        );
        Ok(AdaptiveClient {
            http: reqwest::Client::builder()
                .build()
                .map_err(|e| Error::msg(e.to_string()))?,
            client_name,
            base_url,
            config,
            state: Mutex::new(RateLimitState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.client_name
    }

    /// Last backpressure score advertised by the server.
    pub fn backpressure(&self) -> f64 {
        self.state.lock().unwrap().backpressure
    }

    /// Last `RateLimit-Remaining` advertised by the server.
    pub fn remaining_tokens(&self) -> Option<i64> {
        self.state.lock().unwrap().remaining_tokens
    }

    pub fn is_rate_limited(&self) -> bool {
        self.state.lock().unwrap().retry_after_secs(utils::now()) > 0.0
    }

    fn proactive_slowdown_secs(&self) -> f64 {
        if !self.config.respect_backpressure {
            return 0.0;
        }
        let backpressure = self.backpressure();
        if backpressure >= self.config.backpressure_threshold {
            (backpressure * self.config.max_wait_secs).min(self.config.max_wait_secs)
        } else {
            0.0
        }
    }

    /// Send `method path` with an optional JSON body, honoring local
    /// rate-limit state and retrying 429s per the configured strategy.
    pub async fn send_request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> std::result::Result<serde_json::Value, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempts: u32 = 0;

        loop {
            // Proactive slowdown when the server advertises stress.
            let slowdown = self.proactive_slowdown_secs();
            if slowdown > 0.0 {
                logging::debug!(
                    "[AdaptiveClient] {} backpressure slowdown {:.2}s",
                    self.client_name,
                    slowdown
                );
                utils::sleep_secs_f64(slowdown).await;
            }

            // Honor a previously advertised deadline.
            let remaining = self.state.lock().unwrap().retry_after_secs(utils::now());
            if remaining > 0.0 {
                match self.config.strategy {
                    ClientStrategy::Reject => {
                        return Err(ClientError::RateLimited {
                            retry_after: remaining,
                            backpressure: self.backpressure(),
                        });
                    }
                    ClientStrategy::Queue => {
                        let wait = remaining.min(self.config.max_wait_secs);
                        logging::info!(
                            "[AdaptiveClient] {} waiting {:.2}s (rate limited)",
                            self.client_name,
                            wait
                        );
                        utils::sleep_secs_f64(wait).await;
                    }
                }
            }

            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = &body {
                request = request.json(body);
            }
            let response = request.send().await?;

            let now = utils::now();
            let wait_secs = self
                .state
                .lock()
                .unwrap()
                .update_from_response(&response, now);

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if self.config.strategy == ClientStrategy::Reject {
                    return Err(ClientError::RateLimited {
                        retry_after: wait_secs,
                        backpressure: self.backpressure(),
                    });
                }
                attempts += 1;
                if attempts > self.config.max_retries {
                    return Err(ClientError::MaxRetriesExceeded {
                        attempts: attempts - 1,
                        last_retry_after: wait_secs,
                    });
                }
                let wait = (wait_secs
                    * self.config.backoff_multiplier.powi(attempts as i32 - 1))
                .min(self.config.max_wait_secs);
                logging::info!(
                    "[AdaptiveClient] {} got 429, retry {}/{} after {:.2}s",
                    self.client_name,
                    attempts,
                    self.config.max_retries,
                    wait
                );
                utils::sleep_secs_f64(wait).await;
                continue;
            }

            if response.status().is_success() {
                // Back in good standing.
                self.state.lock().unwrap().retry_after_deadline = None;
                return response.json().await.map_err(ClientError::from);
            }

            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
    }

    pub async fn get(&self, path: &str) -> std::result::Result<serde_json::Value, ClientError> {
        self.send_request(Method::GET, path, None).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ClientError> {
        self.send_request(Method::POST, path, Some(body)).await
    }

    pub async fn health_check(&self) -> std::result::Result<serde_json::Value, ClientError> {
        self.get("/health").await
    }
}

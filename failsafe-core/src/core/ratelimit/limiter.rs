use super::{RetryAfterStrategy, TokenBucket};
use crate::base::{
    global_registry, FailsafeError, Pattern, PatternBase, PatternKind, RetryAdvice,
};
use crate::stat::{BackpressureConfig, BackpressureTracker};
use crate::{logging, utils, Error, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Cap on the per-client sub-bucket map. An unbounded mapping of client-id to
/// sub-bucket is a memory DoS vector; least-recently-seen clients are evicted
/// once the cap is reached and start from a full bucket when they return.
pub const DEFAULT_MAX_TRACKED_CLIENTS: usize = 10_000;

/// Configuration of a [`TokenBucketLimiter`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// How many executions are permitted per `per_time_secs`.
    pub max_executions: f64,
    /// The time span, in seconds, over which `max_executions` applies.
    pub per_time_secs: f64,
    /// Maximum burst capacity in tokens. Defaults to `max_executions`.
    pub bucket_size: Option<f64>,
    pub retry_after_strategy: RetryAfterStrategy,
    /// Track a sub-bucket per client id. The global bucket is always debited
    /// as well; both buckets must admit a call.
    pub enable_per_client_tracking: bool,
    /// LRU cap on the client map when tracking is enabled.
    pub max_tracked_clients: usize,
    pub backpressure: BackpressureConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_executions: 100.0,
            per_time_secs: 60.0,
            bucket_size: None,
            retry_after_strategy: RetryAfterStrategy::default(),
            enable_per_client_tracking: false,
            max_tracked_clients: DEFAULT_MAX_TRACKED_CLIENTS,
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.max_executions <= 0.0 {
            return Err(Error::msg("non-positive max_executions"));
        }
        if self.per_time_secs <= 0.0 {
            return Err(Error::msg("non-positive per_time_secs"));
        }
        if let Some(bucket_size) = self.bucket_size {
            if bucket_size < 1.0 {
                return Err(Error::msg("bucket_size must be >= 1"));
            }
        }
        if self.enable_per_client_tracking && self.max_tracked_clients == 0 {
            return Err(Error::msg("zero max_tracked_clients"));
        }
        self.backpressure.is_valid()
    }

    pub fn effective_bucket_size(&self) -> f64 {
        self.bucket_size.unwrap_or(self.max_executions)
    }

    fn build_bucket(&self, now: tokio::time::Instant) -> TokenBucket {
        TokenBucket::new(
            self.max_executions,
            self.per_time_secs,
            self.effective_bucket_size(),
            now,
        )
    }
}

impl fmt::Display for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

/// Data emitted alongside an admitted call, ready to become response headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllowedInfo {
    /// `RateLimit-Limit`: the configured rate.
    pub limit: u64,
    /// `RateLimit-Remaining`: the minimum of global and per-client remaining
    /// tokens, floored.
    pub remaining: u64,
    /// `X-Backpressure`: current stress score.
    pub backpressure: f64,
}

/// Outcome of [`TokenBucketLimiter::try_acquire`]. A rejection is a normal
/// return, not an error; the caller decides whether to surface it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquisition {
    Allowed(AllowedInfo),
    Rejected(RetryAdvice),
}

impl Acquisition {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Acquisition::Allowed(_))
    }

    pub fn advice(&self) -> Option<RetryAdvice> {
        match self {
            Acquisition::Rejected(advice) => Some(*advice),
            Acquisition::Allowed(_) => None,
        }
    }

    pub fn retry_after(&self) -> Duration {
        self.advice().map(|a| a.retry_after).unwrap_or(Duration::ZERO)
    }

    /// The HTTP headers this outcome maps to (§ external interfaces).
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Acquisition::Allowed(info) => vec![
                ("RateLimit-Limit", info.limit.to_string()),
                ("RateLimit-Remaining", info.remaining.to_string()),
                ("X-Backpressure", format!("{:.2}", info.backpressure)),
            ],
            Acquisition::Rejected(advice) => vec![
                ("Retry-After", advice.retry_after_header().to_string()),
                (
                    "X-RateLimit-Retry-After-Ms",
                    advice.retry_after_ms().to_string(),
                ),
                ("X-Backpressure", format!("{:.2}", advice.backpressure)),
            ],
        }
    }
}

struct LimiterState {
    global: TokenBucket,
    clients: Option<LruCache<String, TokenBucket>>,
}

/// Token-bucket rate limiter with latency-driven `Retry-After` advice.
///
/// On admission one token is debited (from the global bucket and, when
/// per-client tracking is on, the caller's sub-bucket); the caller must
/// eventually report the operation latency through
/// [`record_latency`](Self::record_latency) so the backpressure score tracks
/// reality. Tokens are consumed at admission and never refunded.
pub struct TokenBucketLimiter {
    base: PatternBase,
    config: RwLock<RateLimitConfig>,
    state: Mutex<LimiterState>,
    backpressure: BackpressureTracker,
}

impl TokenBucketLimiter {
    /// Build and register with the process-wide registry. Fails when the
    /// config is invalid or the `(ratelimit, name)` identity is taken.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Result<Arc<Self>> {
        let this = Self::detached(name, config)?;
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    /// Build without registering. Useful for tests and embedded use.
    pub fn detached(name: impl Into<String>, config: RateLimitConfig) -> Result<Arc<Self>> {
        config.is_valid()?;
        let now = utils::now();
        let clients = config.enable_per_client_tracking.then(|| {
            LruCache::new(NonZeroUsize::new(config.max_tracked_clients).unwrap())
        });
        Ok(Arc::new(TokenBucketLimiter {
            base: PatternBase::new(PatternKind::RateLimit, name),
            state: Mutex::new(LimiterState {
                global: config.build_bucket(now),
                clients,
            }),
            backpressure: BackpressureTracker::new(config.backpressure),
            config: RwLock::new(config),
        }))
    }

    /// Try to debit one token for `client_id` (and always the global bucket).
    pub fn try_acquire(&self, client_id: Option<&str>) -> Acquisition {
        let config = self.config.read().unwrap();
        let backpressure = self.backpressure.score();

        if !self.base.is_enabled() {
            // Pass-through: no debit, report current capacity.
            let state = self.state.lock().unwrap();
            return Acquisition::Allowed(AllowedInfo {
                limit: config.max_executions as u64,
                remaining: state.global.tokens().floor() as u64,
                backpressure,
            });
        }

        let now = utils::now();
        let mut state = self.state.lock().unwrap();
        state.global.refill(now);

        let track_client = state.clients.is_some() && client_id.is_some();
        if track_client {
            let key = client_id.unwrap();
            let clients = state.clients.as_mut().unwrap();
            if clients.get(key).is_none() {
                clients.put(key.to_owned(), config.build_bucket(now));
            }
            clients.get_mut(key).unwrap().refill(now);
        }

        let global_ok = state.global.tokens() >= 1.0;
        let client_ok = !track_client
            || state.clients.as_mut().unwrap().get(client_id.unwrap()).unwrap().tokens() >= 1.0;

        if global_ok && client_ok {
            state.global.try_take();
            let mut remaining = state.global.tokens();
            if track_client {
                let sub = state.clients.as_mut().unwrap().get_mut(client_id.unwrap()).unwrap();
                sub.try_take();
                remaining = remaining.min(sub.tokens());
            }
            drop(state);

            self.base.emit("requests");
            #[cfg(feature = "exporter")]
            crate::exporter::set_tokens_gauge(self.base.name(), remaining);
            Acquisition::Allowed(AllowedInfo {
                limit: config.max_executions as u64,
                remaining: remaining.floor() as u64,
                backpressure,
            })
        } else {
            // Advise on the most constrained bucket.
            let mut retry_after_secs: f64 = 0.0;
            if !global_ok {
                retry_after_secs = config.retry_after_strategy.retry_after_secs(
                    &state.global,
                    &config.backpressure,
                    backpressure,
                );
            }
            if !client_ok {
                let sub = state.clients.as_mut().unwrap().get(client_id.unwrap()).unwrap();
                retry_after_secs = retry_after_secs.max(
                    config.retry_after_strategy.retry_after_secs(
                        sub,
                        &config.backpressure,
                        backpressure,
                    ),
                );
            }
            drop(state);

            self.base.emit("throttled");
            self.base.emit("rejections");
            logging::debug!(
                "[RateLimit] {} rejected client {:?}, retry after {:.3}s",
                self.base.name(),
                client_id,
                retry_after_secs
            );
            Acquisition::Rejected(RetryAdvice::new(
                utils::secs_f64(retry_after_secs),
                backpressure,
            ))
        }
    }

    /// Report a completed operation's latency in seconds.
    pub fn record_latency(&self, latency_secs: f64) {
        self.backpressure.record_latency(latency_secs);
        #[cfg(feature = "exporter")]
        crate::exporter::set_backpressure_gauge(self.base.name(), self.backpressure.score());
    }

    /// Current stress score in `[0, 1]`.
    pub fn backpressure_score(&self) -> f64 {
        self.backpressure.score()
    }

    /// Remaining tokens in the global bucket after a lazy refill.
    pub fn current_tokens(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.global.refill(utils::now());
        state.global.tokens()
    }

    pub fn tracked_clients(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .clients
            .as_ref()
            .map_or(0, |clients| clients.len())
    }

    /// Guard `f`: acquire, run, report the measured latency.
    pub async fn execute<T, E, F, Fut>(
        &self,
        client_id: Option<&str>,
        f: F,
    ) -> std::result::Result<T, FailsafeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        match self.try_acquire(client_id) {
            Acquisition::Rejected(advice) => Err(FailsafeError::RateLimitExceeded(advice)),
            Acquisition::Allowed(_) => {
                let started = utils::now();
                let result = f().await;
                self.record_latency(started.elapsed().as_secs_f64());
                result.map_err(FailsafeError::Inner)
            }
        }
    }
}

impl Pattern for TokenBucketLimiter {
    fn kind(&self) -> PatternKind {
        self.base.kind()
    }

    fn name(&self) -> &str {
        self.base.name()
    }

    fn is_enabled(&self) -> bool {
        self.base.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.base.set_enabled(enabled);
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&*self.config.read().unwrap()).unwrap()
    }

    /// Whitelisted fields: `max_executions`, `per_time_secs`, `bucket_size`.
    /// Updating any of them rebuilds the buckets from full capacity.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()> {
        let mut candidate = self.config.read().unwrap().clone();
        let mut touched = false;
        if let Some(v) = patch.get("max_executions").and_then(|v| v.as_f64()) {
            candidate.max_executions = v;
            touched = true;
        }
        if let Some(v) = patch.get("per_time_secs").and_then(|v| v.as_f64()) {
            candidate.per_time_secs = v;
            touched = true;
        }
        if let Some(v) = patch.get("bucket_size").and_then(|v| v.as_f64()) {
            candidate.bucket_size = Some(v);
            touched = true;
        }
        if !touched {
            return Ok(());
        }
        candidate.is_valid()?;

        let mut config = self.config.write().unwrap();
        let mut state = self.state.lock().unwrap();
        let now = utils::now();
        state.global = candidate.build_bucket(now);
        if let Some(clients) = state.clients.as_mut() {
            clients.clear();
        }
        logging::info!(
            "[RateLimit] {} reconfigured: {} per {}s, burst {}",
            self.base.name(),
            candidate.max_executions,
            candidate.per_time_secs,
            candidate.effective_bucket_size()
        );
        *config = candidate;
        Ok(())
    }

    fn reset(&self) {
        let now = utils::now();
        let mut state = self.state.lock().unwrap();
        state.global.restore_full(now);
        if let Some(clients) = state.clients.as_mut() {
            clients.clear();
        }
        self.backpressure.reset();
    }
}

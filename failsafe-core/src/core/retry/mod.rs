//! Attempt loop with exponential backoff and full jitter.

use crate::base::{global_registry, FailsafeError, Pattern, PatternBase, PatternKind};
use crate::{logging, utils, Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Configuration of a [`Retry`] guard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Initial backoff in seconds.
    pub delay_secs: f64,
    /// Backoff multiplier applied per attempt.
    pub backoff: f64,
    /// Cap on a single backoff, before jitter.
    pub max_delay_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 3,
            delay_secs: 0.1,
            backoff: 2.0,
            max_delay_secs: 10.0,
        }
    }
}

impl RetryConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(Error::msg("zero attempts"));
        }
        if self.delay_secs < 0.0 {
            return Err(Error::msg("negative delay_secs"));
        }
        if self.backoff < 1.0 {
            return Err(Error::msg("backoff multiplier must be >= 1"));
        }
        if self.max_delay_secs < 0.0 {
            return Err(Error::msg("negative max_delay_secs"));
        }
        Ok(())
    }

    /// Backoff between attempt `k` and `k + 1`, jittered:
    /// `min(max_delay, delay * backoff^k) * Uniform(0.5, 1.5)`.
    fn backoff_secs(&self, completed_attempts: u32) -> f64 {
        let exp = self.delay_secs * self.backoff.powi(completed_attempts as i32 - 1);
        let capped = exp.min(self.max_delay_secs);
        capped * rand::thread_rng().gen_range(0.5..1.5)
    }
}

impl fmt::Display for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

/// Retries an async operation with exponential backoff. Non-retryable errors
/// are never swallowed; an exhausted budget surfaces `AttemptsExceeded`
/// wrapping the final cause.
pub struct Retry {
    base: PatternBase,
    config: RwLock<RetryConfig>,
}

impl Retry {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Arc<Self>> {
        let this = Self::detached(name, config)?;
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    pub fn detached(name: impl Into<String>, config: RetryConfig) -> Result<Arc<Self>> {
        config.is_valid()?;
        Ok(Arc::new(Retry {
            base: PatternBase::new(PatternKind::Retry, name),
            config: RwLock::new(config),
        }))
    }

    /// Run `f` up to `attempts` times, treating every error as retryable.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, FailsafeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_if(|_| true, f).await
    }

    /// Run `f` up to `attempts` times, retrying only errors `is_retryable`
    /// accepts. The first non-retryable error propagates untouched.
    pub async fn execute_if<T, E, P, F, Fut>(
        &self,
        is_retryable: P,
        mut f: F,
    ) -> std::result::Result<T, FailsafeError<E>>
    where
        P: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        let config = *self.config.read().unwrap();
        if !self.base.is_enabled() {
            return f().await.map_err(FailsafeError::Inner);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.base.emit("attempts");
            match f().await {
                Ok(value) => {
                    self.base.emit("successes");
                    return Ok(value);
                }
                Err(e) if !is_retryable(&e) => {
                    self.base.emit("failures");
                    return Err(FailsafeError::Inner(e));
                }
                Err(e) => {
                    if attempt >= config.attempts {
                        self.base.emit("failures");
                        self.base.emit("attempts_exceeded");
                        logging::warn!(
                            "[Retry] {} exhausted {} attempts, last error: {}",
                            self.base.name(),
                            attempt,
                            e
                        );
                        return Err(FailsafeError::AttemptsExceeded {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    let backoff = config.backoff_secs(attempt);
                    self.base.emit("retries");
                    logging::debug!(
                        "[Retry] {} attempt {}/{} failed ({}), backing off {:.3}s",
                        self.base.name(),
                        attempt,
                        config.attempts,
                        e,
                        backoff
                    );
                    utils::sleep_secs_f64(backoff).await;
                }
            }
        }
    }
}

impl Pattern for Retry {
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

    /// Whitelisted fields: `attempts`, `delay_secs`, `backoff`, `max_delay_secs`.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()> {
        let mut candidate = *self.config.read().unwrap();
        if let Some(v) = patch.get("attempts").and_then(|v| v.as_u64()) {
            candidate.attempts = v as u32;
        }
        if let Some(v) = patch.get("delay_secs").and_then(|v| v.as_f64()) {
            candidate.delay_secs = v;
        }
        if let Some(v) = patch.get("backoff").and_then(|v| v.as_f64()) {
            candidate.backoff = v;
        }
        if let Some(v) = patch.get("max_delay_secs").and_then(|v| v.as_f64()) {
            candidate.max_delay_secs = v;
        }
        candidate.is_valid()?;
        *self.config.write().unwrap() = candidate;
        Ok(())
    }

    fn reset(&self) {
        // Stateless between calls.
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn retry(config: RetryConfig) -> Arc<Retry> {
        Retry::detached("retry_under_test", config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_first_attempt() {
        let r = retry(RetryConfig::default());
        let calls = AtomicU32::new(0);
        let out: std::result::Result<u32, FailsafeError<&str>> = r
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds() {
        let r = retry(RetryConfig {
            attempts: 3,
            delay_secs: 0.1,
            backoff: 2.0,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);
        let started = utils::now();
        let out: std::result::Result<u32, FailsafeError<&str>> = r
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // full-jitter bounds: [0.05, 0.15] + [0.1, 0.3]
        let slept = started.elapsed().as_secs_f64();
        assert!(slept >= 0.15 && slept <= 0.45, "slept = {}", slept);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_surfaces_last_error() {
        let r = retry(RetryConfig {
            attempts: 3,
            delay_secs: 0.01,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);
        let out: std::result::Result<(), FailsafeError<&str>> = r
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("persistent") }
            })
            .await;
        assert!(matches!(
            out,
            Err(FailsafeError::AttemptsExceeded {
                attempts: 3,
                last: "persistent"
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_aborts_immediately() {
        let r = retry(RetryConfig {
            attempts: 5,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);
        let out: std::result::Result<(), FailsafeError<&str>> = r
            .execute_if(
                |e| *e != "fatal",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal") }
                },
            )
            .await;
        assert!(matches!(out, Err(FailsafeError::Inner("fatal"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_respects_max_delay_cap() {
        let r = retry(RetryConfig {
            attempts: 4,
            delay_secs: 1.0,
            backoff: 10.0,
            max_delay_secs: 2.0,
        });
        let started = utils::now();
        let _: std::result::Result<(), FailsafeError<&str>> =
            r.execute(|| async { Err("always") }).await;
        // waits: [0.5,1.5] + [1.0,3.0] + [1.0,3.0] <= 7.5
        let slept = started.elapsed().as_secs_f64();
        assert!(slept <= 7.5, "slept = {}", slept);
        assert!(slept >= 2.5, "slept = {}", slept);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_retry_runs_exactly_once() {
        let r = retry(RetryConfig {
            attempts: 5,
            ..Default::default()
        });
        r.set_enabled(false);
        let calls = AtomicU32::new(0);
        let out: std::result::Result<(), FailsafeError<&str>> = r
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            })
            .await;
        assert!(matches!(out, Err(FailsafeError::Inner("boom"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleep_advances_with_paused_clock() {
        // guards against a regression to blocking sleeps
        let r = retry(RetryConfig {
            attempts: 2,
            delay_secs: 5.0,
            ..Default::default()
        });
        let started = utils::now();
        let _: std::result::Result<(), FailsafeError<&str>> =
            r.execute(|| async { Err("slow") }).await;
        assert!(started.elapsed() >= Duration::from_millis(2500));
    }
}

//! Deadline-bounded execution.

use crate::base::{global_registry, FailsafeError, Pattern, PatternBase, PatternKind};
use crate::{logging, utils, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Configuration of a [`Timeout`] guard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub seconds: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig { seconds: 30.0 }
    }
}

impl TimeoutConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.seconds <= 0.0 {
            return Err(Error::msg("non-positive timeout seconds"));
        }
        Ok(())
    }
}

impl fmt::Display for TimeoutConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

/// Bounds one operation to a wall-clock budget. On expiry the operation's
/// future is dropped (cooperative cancellation) and the caller observes
/// `Timeout`. This guard never retries.
pub struct Timeout {
    base: PatternBase,
    config: RwLock<TimeoutConfig>,
}

impl Timeout {
    pub fn new(name: impl Into<String>, config: TimeoutConfig) -> Result<Arc<Self>> {
        let this = Self::detached(name, config)?;
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    pub fn detached(name: impl Into<String>, config: TimeoutConfig) -> Result<Arc<Self>> {
        config.is_valid()?;
        Ok(Arc::new(Timeout {
            base: PatternBase::new(PatternKind::Timeout, name),
            config: RwLock::new(config),
        }))
    }

    pub async fn execute<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, FailsafeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if !self.base.is_enabled() {
            return f().await.map_err(FailsafeError::Inner);
        }
        let budget = utils::secs_f64(self.config.read().unwrap().seconds);
        match tokio::time::timeout(budget, f()).await {
            Ok(result) => result.map_err(FailsafeError::Inner),
            Err(_) => {
                self.base.emit("timeouts");
                logging::warn!(
                    "[Timeout] {} expired after {:?}",
                    self.base.name(),
                    budget
                );
                Err(FailsafeError::Timeout(budget))
            }
        }
    }
}

impl Pattern for Timeout {
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

    /// Whitelisted field: `seconds`.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()> {
        let mut candidate = *self.config.read().unwrap();
        if let Some(v) = patch.get("seconds").and_then(|v| v.as_f64()) {
            candidate.seconds = v;
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
    use std::time::Duration;

    fn timeout_guard(seconds: f64) -> Arc<Timeout> {
        Timeout::detached("timeout_under_test", TimeoutConfig { seconds }).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn fast_operation_passes() {
        let guard = timeout_guard(1.0);
        let out: std::result::Result<u32, FailsafeError<&str>> =
            guard.execute(|| async { Ok(5) }).await;
        assert_eq!(out.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out() {
        let guard = timeout_guard(0.05);
        let out: std::result::Result<u32, FailsafeError<&str>> = guard
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(5)
            })
            .await;
        assert!(matches!(out, Err(FailsafeError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn inner_error_propagates_untouched() {
        let guard = timeout_guard(1.0);
        let out: std::result::Result<u32, FailsafeError<&str>> =
            guard.execute(|| async { Err("boom") }).await;
        assert!(matches!(out, Err(FailsafeError::Inner("boom"))));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_timeout_never_expires() {
        let guard = timeout_guard(0.01);
        guard.set_enabled(false);
        let out: std::result::Result<u32, FailsafeError<&str>> = guard
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(9)
            })
            .await;
        assert_eq!(out.unwrap(), 9);
    }
}

//! Trip-and-hold failure gate.
//!
//! Counts consecutive failures; once the threshold is reached the gate stays
//! tripped until an explicit reset, or until the optional auto-reset period
//! elapses. Unlike the circuit breaker there is no probing phase.

use crate::base::{
    global_registry, FailsafeError, Pattern, PatternBase, PatternKind, Rejection,
};
use crate::{logging, utils, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tokio::time::Instant;

/// Configuration of a [`FailFast`] guard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FailFastConfig {
    /// Consecutive failures that trip the gate.
    pub failure_threshold: u32,
    /// Seconds after which a trip clears on its own. `None` means the gate
    /// holds until an explicit reset.
    pub auto_reset_secs: Option<f64>,
}

impl Default for FailFastConfig {
    fn default() -> Self {
        FailFastConfig {
            failure_threshold: 5,
            auto_reset_secs: None,
        }
    }
}

impl FailFastConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::msg("zero failure_threshold"));
        }
        if let Some(secs) = self.auto_reset_secs {
            if secs <= 0.0 {
                return Err(Error::msg("non-positive auto_reset_secs"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for FailFastConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

#[derive(Debug, Default)]
struct FailFastState {
    tripped: bool,
    failures: u32,
    tripped_at: Option<Instant>,
}

pub struct FailFast {
    base: PatternBase,
    config: RwLock<FailFastConfig>,
    state: Mutex<FailFastState>,
}

impl FailFast {
    pub fn new(name: impl Into<String>, config: FailFastConfig) -> Result<Arc<Self>> {
        let this = Self::detached(name, config)?;
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    pub fn detached(name: impl Into<String>, config: FailFastConfig) -> Result<Arc<Self>> {
        config.is_valid()?;
        Ok(Arc::new(FailFast {
            base: PatternBase::new(PatternKind::FailFast, name),
            config: RwLock::new(config),
            state: Mutex::new(FailFastState::default()),
        }))
    }

    pub fn is_tripped(&self) -> bool {
        let config = *self.config.read().unwrap();
        let mut state = self.state.lock().unwrap();
        self.clear_if_reset_due(&config, &mut state);
        state.tripped
    }

    fn clear_if_reset_due(&self, config: &FailFastConfig, state: &mut FailFastState) {
        if !state.tripped {
            return;
        }
        if let (Some(reset_secs), Some(tripped_at)) = (config.auto_reset_secs, state.tripped_at) {
            if utils::now().saturating_duration_since(tripped_at) >= utils::secs_f64(reset_secs) {
                logging::info!("[FailFast] {} auto-reset", self.base.name());
                state.tripped = false;
                state.failures = 0;
                state.tripped_at = None;
            }
        }
    }

    pub fn try_pass(&self) -> std::result::Result<(), Rejection> {
        if !self.base.is_enabled() {
            return Ok(());
        }
        let config = *self.config.read().unwrap();
        let mut state = self.state.lock().unwrap();
        self.clear_if_reset_due(&config, &mut state);
        if state.tripped {
            drop(state);
            self.base.emit("rejections");
            Err(FailsafeError::FailFastOpen)
        } else {
            Ok(())
        }
    }

    pub fn record_success(&self) {
        if !self.base.is_enabled() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if !state.tripped {
            state.failures = 0;
        }
    }

    pub fn record_failure(&self) {
        if !self.base.is_enabled() {
            return;
        }
        let config = *self.config.read().unwrap();
        let mut state = self.state.lock().unwrap();
        if state.tripped {
            return;
        }
        state.failures += 1;
        if state.failures >= config.failure_threshold {
            state.tripped = true;
            state.tripped_at = Some(utils::now());
            logging::warn!(
                "[FailFast] {} tripped after {} consecutive failures",
                self.base.name(),
                state.failures
            );
        }
    }

    pub async fn execute<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, FailsafeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.try_pass().map_err(Rejection::widen)?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(FailsafeError::Inner(e))
            }
        }
    }
}

impl Pattern for FailFast {
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

    /// Whitelisted fields: `failure_threshold`, `auto_reset_secs`.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()> {
        let mut candidate = *self.config.read().unwrap();
        if let Some(v) = patch.get("failure_threshold").and_then(|v| v.as_u64()) {
            candidate.failure_threshold = v as u32;
        }
        if let Some(v) = patch.get("auto_reset_secs") {
            candidate.auto_reset_secs = v.as_f64();
        }
        candidate.is_valid()?;
        *self.config.write().unwrap() = candidate;
        Ok(())
    }

    /// Clear the trip bit and the failure counter.
    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.tripped = false;
        state.failures = 0;
        state.tripped_at = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn failfast(config: FailFastConfig) -> Arc<FailFast> {
        FailFast::detached("failfast_under_test", config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn trips_at_threshold_and_holds() {
        let ff = failfast(FailFastConfig {
            failure_threshold: 2,
            auto_reset_secs: None,
        });
        ff.record_failure();
        assert!(ff.try_pass().is_ok());
        ff.record_failure();
        assert!(matches!(ff.try_pass(), Err(FailsafeError::FailFastOpen)));

        // holds indefinitely without auto-reset
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(ff.try_pass().is_err());

        Pattern::reset(&*ff);
        assert!(ff.try_pass().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_partial_failure_streak() {
        let ff = failfast(FailFastConfig {
            failure_threshold: 2,
            auto_reset_secs: None,
        });
        ff.record_failure();
        ff.record_success();
        ff.record_failure();
        assert!(ff.try_pass().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_reset_clears_the_trip() {
        let ff = failfast(FailFastConfig {
            failure_threshold: 1,
            auto_reset_secs: Some(5.0),
        });
        ff.record_failure();
        assert!(ff.is_tripped());
        tokio::time::advance(Duration::from_millis(4999)).await;
        assert!(ff.try_pass().is_err());
        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(ff.try_pass().is_ok());
        assert!(!ff.is_tripped());
    }

    #[tokio::test(start_paused = true)]
    async fn execute_counts_failures() {
        let ff = failfast(FailFastConfig {
            failure_threshold: 1,
            auto_reset_secs: None,
        });
        let failed: std::result::Result<(), FailsafeError<&str>> =
            ff.execute(|| async { Err("boom") }).await;
        assert!(matches!(failed, Err(FailsafeError::Inner("boom"))));
        let rejected: std::result::Result<(), FailsafeError<&str>> =
            ff.execute(|| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(FailsafeError::FailFastOpen)));
    }
}

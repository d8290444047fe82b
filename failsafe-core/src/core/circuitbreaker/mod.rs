//!  Circuit Breaker State Machine:
//!
//! ```text
//!                               trip on consecutive failures
//!
//!             +-----------------------------------------------------------------------+
//!             |                                                                       |
//!             |                                                                       v
//!     +----------------+                   +----------------+      probe      +----------------+
//!     |                |                   |                |<----------------|                |
//!     |                |  probes succeed   |                |                 |                |
//!     |    Working     |<------------------|   Recovering   |                 |    Failing     |
//!     |                |                   |                |   probe failed  |                |
//!     |                |                   |                +---------------->|                |
//!     +----------------+                   +----------------+                 +----------------+
//! ```

use crate::base::{
    global_registry, FailsafeError, Pattern, PatternBase, PatternKind, Rejection,
};
use crate::{logging, utils, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// States of the circuit breaker state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Normal operation; failures are counted.
    Working,
    /// Tripped; every call is rejected until the recovery timeout elapses.
    Failing,
    /// A bounded number of probe calls test whether the dependency recovered.
    Recovering,
}

impl Default for State {
    fn default() -> State {
        State::Working
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// `StateChangeListener` observes every transition of one breaker.
pub trait StateChangeListener: Send + Sync {
    fn on_transition(&self, from: State, to: State);
}

/// Configuration of a [`CircuitBreaker`] (consecutive-failures variant).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Working` that trip the breaker.
    pub failure_threshold: u32,
    /// Seconds to stay `Failing` before probing.
    pub recovery_timeout_secs: f64,
    /// Probe permits issued in `Recovering`; the same number of successes
    /// closes the breaker.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            half_open_requests: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::msg("zero failure_threshold"));
        }
        if self.recovery_timeout_secs <= 0.0 {
            return Err(Error::msg("non-positive recovery_timeout_secs"));
        }
        if self.half_open_requests == 0 {
            return Err(Error::msg("zero half_open_requests"));
        }
        Ok(())
    }
}

impl fmt::Display for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_permits_issued: u32,
    half_open_successes: u32,
}

impl BreakerState {
    fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.half_open_permits_issued = 0;
        self.half_open_successes = 0;
    }
}

/// Consecutive-failures circuit breaker.
///
/// Callers take a permit through [`try_pass`](Self::try_pass), run the
/// operation, then report the outcome with [`record_success`](Self::record_success)
/// or [`record_failure`](Self::record_failure). [`execute`](Self::execute)
/// bundles the three steps.
pub struct CircuitBreaker {
    base: PatternBase,
    config: RwLock<CircuitBreakerConfig>,
    state: Mutex<BreakerState>,
    listeners: RwLock<Vec<Arc<dyn StateChangeListener>>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Arc<Self>> {
        let this = Self::detached(name, config)?;
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    pub fn detached(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Arc<Self>> {
        config.is_valid()?;
        Ok(Arc::new(CircuitBreaker {
            base: PatternBase::new(PatternKind::CircuitBreaker, name),
            config: RwLock::new(config),
            state: Mutex::new(BreakerState::default()),
            listeners: RwLock::new(Vec::new()),
        }))
    }

    pub fn add_state_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn current_state(&self) -> State {
        self.state.lock().unwrap().state
    }

    fn transition(&self, state: &mut BreakerState, to: State) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        logging::info!(
            "[CircuitBreaker] {}: {} -> {}",
            self.base.name(),
            from,
            to
        );
        crate::base::publish(
            crate::base::MetricEvent::counter(self.base.kind(), self.base.name(), "state_changes")
                .with_attribute("from", from.to_string())
                .with_attribute("to", to.to_string()),
        );
        #[cfg(feature = "exporter")]
        crate::exporter::add_state_change_counter(
            self.base.name(),
            &from.to_string(),
            &to.to_string(),
        );
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.iter() {
            listener.on_transition(from, to);
        }
    }

    /// Request a permit. Rejected while `Failing` before the recovery timeout
    /// and while `Recovering` once all probe permits are out.
    pub fn try_pass(&self) -> std::result::Result<(), Rejection> {
        if !self.base.is_enabled() {
            return Ok(());
        }
        let config = *self.config.read().unwrap();
        let mut state = self.state.lock().unwrap();
        match state.state {
            State::Working => Ok(()),
            State::Failing => {
                let recovery_due = state.opened_at.map_or(true, |opened_at| {
                    utils::now().saturating_duration_since(opened_at)
                        >= utils::secs_f64(config.recovery_timeout_secs)
                });
                if recovery_due {
                    state.reset_counters();
                    state.half_open_permits_issued = 1;
                    self.transition(&mut state, State::Recovering);
                    Ok(())
                } else {
                    drop(state);
                    self.base.emit("rejections");
                    Err(FailsafeError::CircuitBreakerOpen)
                }
            }
            State::Recovering => {
                if state.half_open_permits_issued < config.half_open_requests {
                    state.half_open_permits_issued += 1;
                    Ok(())
                } else {
                    drop(state);
                    self.base.emit("rejections");
                    Err(FailsafeError::CircuitBreakerOpen)
                }
            }
        }
    }

    /// Report a successful completion of a permitted call.
    pub fn record_success(&self) {
        if !self.base.is_enabled() {
            return;
        }
        let config = *self.config.read().unwrap();
        let mut state = self.state.lock().unwrap();
        match state.state {
            State::Working => {
                state.consecutive_failures = 0;
            }
            State::Recovering => {
                state.half_open_successes += 1;
                if state.half_open_successes >= config.half_open_requests {
                    state.reset_counters();
                    state.opened_at = None;
                    self.transition(&mut state, State::Working);
                }
            }
            // A late completion from before the trip; it proves nothing.
            State::Failing => {}
        }
    }

    /// Report a failed completion of a permitted call.
    pub fn record_failure(&self) {
        if !self.base.is_enabled() {
            return;
        }
        let config = *self.config.read().unwrap();
        let mut state = self.state.lock().unwrap();
        match state.state {
            State::Working => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= config.failure_threshold {
                    state.reset_counters();
                    state.opened_at = Some(utils::now());
                    self.transition(&mut state, State::Failing);
                }
            }
            State::Recovering => {
                state.reset_counters();
                state.opened_at = Some(utils::now());
                self.transition(&mut state, State::Failing);
            }
            State::Failing => {}
        }
    }

    /// Guard `f` with the breaker: gate, run, report the outcome.
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

impl Pattern for CircuitBreaker {
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

    /// Whitelisted fields: `failure_threshold`, `recovery_timeout_secs`.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()> {
        let mut candidate = *self.config.read().unwrap();
        if let Some(v) = patch.get("failure_threshold").and_then(|v| v.as_u64()) {
            candidate.failure_threshold = v as u32;
        }
        if let Some(v) = patch.get("recovery_timeout_secs").and_then(|v| v.as_f64()) {
            candidate.recovery_timeout_secs = v;
        }
        candidate.is_valid()?;
        *self.config.write().unwrap() = candidate;
        Ok(())
    }

    /// Force the breaker back to `Working` with clean counters.
    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.reset_counters();
        state.opened_at = None;
        self.transition(&mut state, State::Working);
    }
}

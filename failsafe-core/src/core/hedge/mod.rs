//! Stagger-launched racing of idempotent operations.
//!
//! Attempt 1 launches immediately; while nothing has completed, one more
//! attempt launches every `delay_secs`, up to `attempts`. The first success
//! wins and every other in-flight attempt is aborted. Intended for idempotent
//! reads: the tail latency of one slow replica is hidden by its siblings.

use crate::base::{global_registry, FailsafeError, Pattern, PatternBase, PatternKind};
use crate::{logging, utils, Error, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Configuration of a [`Hedge`] guard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HedgeConfig {
    /// Maximum parallel copies, including the first.
    pub attempts: u32,
    /// Stagger between launches, in seconds.
    pub delay_secs: f64,
    /// Total wall-clock budget across all attempts, in seconds.
    pub timeout_secs: f64,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        HedgeConfig {
            attempts: 2,
            delay_secs: 0.05,
            timeout_secs: 10.0,
        }
    }
}

impl HedgeConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.attempts < 2 {
            return Err(Error::msg("hedge attempts must be >= 2"));
        }
        if self.delay_secs < 0.0 {
            return Err(Error::msg("negative delay_secs"));
        }
        if self.timeout_secs <= 0.0 {
            return Err(Error::msg("non-positive timeout_secs"));
        }
        Ok(())
    }
}

impl fmt::Display for HedgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

/// Guard that races staggered copies of an operation and returns the first
/// success.
pub struct Hedge {
    base: PatternBase,
    config: RwLock<HedgeConfig>,
}

impl Hedge {
    pub fn new(name: impl Into<String>, config: HedgeConfig) -> Result<Arc<Self>> {
        let this = Self::detached(name, config)?;
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    pub fn detached(name: impl Into<String>, config: HedgeConfig) -> Result<Arc<Self>> {
        config.is_valid()?;
        Ok(Arc::new(Hedge {
            base: PatternBase::new(PatternKind::Hedge, name),
            config: RwLock::new(config),
        }))
    }

    /// Race staggered copies of `f`; first success wins, losers are aborted.
    ///
    /// If every launched attempt fails while launches remain, the next one
    /// starts immediately instead of waiting out the stagger. When all
    /// attempts fail the last error is surfaced; when the overall budget
    /// expires first, `HedgeTimeout` is.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, FailsafeError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        if !self.base.is_enabled() {
            return f().await.map_err(FailsafeError::Inner);
        }
        let config = *self.config.read().unwrap();
        let budget = utils::secs_f64(config.timeout_secs);

        let mut in_flight = FuturesUnordered::new();
        let mut handles = Vec::with_capacity(config.attempts as usize);
        let launch = |in_flight: &mut FuturesUnordered<_>, handles: &mut Vec<_>| {
            let handle = tokio::spawn(f());
            handles.push(handle.abort_handle());
            in_flight.push(handle);
        };
        launch(&mut in_flight, &mut handles);
        let mut launched: u32 = 1;
        let mut last_error: Option<E> = None;

        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        let outcome = loop {
            let stagger = utils::sleep_secs_f64(config.delay_secs);
            tokio::pin!(stagger);

            tokio::select! {
                biased;

                _ = &mut deadline => {
                    self.base.emit("timeouts");
                    logging::warn!(
                        "[Hedge] {} budget of {:?} expired after {} attempts",
                        self.base.name(),
                        budget,
                        launched
                    );
                    break Err(FailsafeError::HedgeTimeout(budget));
                }

                joined = in_flight.next(), if !in_flight.is_empty() => {
                    match joined {
                        Some(Ok(Ok(value))) => {
                            self.base.emit("wins");
                            break Ok(value);
                        }
                        Some(Ok(Err(e))) => {
                            self.base.emit("failures");
                            last_error = Some(e);
                        }
                        // an aborted or panicked attempt counts as a failure
                        Some(Err(_)) => {
                            self.base.emit("failures");
                        }
                        None => {}
                    }
                    if in_flight.is_empty() {
                        if launched < config.attempts {
                            launch(&mut in_flight, &mut handles);
                            launched += 1;
                            self.base.emit("hedged_attempts");
                        } else {
                            break match last_error {
                                Some(e) => Err(FailsafeError::Inner(e)),
                                None => Err(FailsafeError::HedgeTimeout(budget)),
                            };
                        }
                    }
                }

                _ = &mut stagger, if launched < config.attempts => {
                    launch(&mut in_flight, &mut handles);
                    launched += 1;
                    self.base.emit("hedged_attempts");
                }
            }
        };

        for handle in handles {
            handle.abort();
        }
        outcome
    }
}

impl Pattern for Hedge {
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

    /// Whitelisted fields: `attempts`, `delay_secs`, `timeout_secs`.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()> {
        let mut candidate = *self.config.read().unwrap();
        if let Some(v) = patch.get("attempts").and_then(|v| v.as_u64()) {
            candidate.attempts = v as u32;
        }
        if let Some(v) = patch.get("delay_secs").and_then(|v| v.as_f64()) {
            candidate.delay_secs = v;
        }
        if let Some(v) = patch.get("timeout_secs").and_then(|v| v.as_f64()) {
            candidate.timeout_secs = v;
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

    fn hedge(config: HedgeConfig) -> Arc<Hedge> {
        Hedge::detached("hedge_under_test", config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn fast_first_attempt_wins_without_hedging() {
        let h = hedge(HedgeConfig {
            attempts: 3,
            delay_secs: 1.0,
            timeout_secs: 10.0,
        });
        let launches = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&launches);
        let out: std::result::Result<u32, FailsafeError<&str>> = h
            .execute(move || {
                counted.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;
        assert_eq!(out.unwrap(), 1);
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_first_attempt_is_beaten_by_hedge() {
        let h = hedge(HedgeConfig {
            attempts: 2,
            delay_secs: 0.1,
            timeout_secs: 10.0,
        });
        let launches = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&launches);
        let out: std::result::Result<u32, FailsafeError<&str>> = h
            .execute(move || {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        // the straggler
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    } else {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(2)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn all_attempts_failing_surfaces_last_error() {
        let h = hedge(HedgeConfig {
            attempts: 3,
            delay_secs: 0.01,
            timeout_secs: 10.0,
        });
        let launches = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&launches);
        let out: std::result::Result<u32, FailsafeError<String>> = h
            .execute(move || {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("attempt {} failed", n)) }
            })
            .await;
        match out {
            Err(FailsafeError::Inner(msg)) => assert!(msg.ends_with("failed")),
            other => panic!("expected inner error, got {:?}", other),
        }
        assert_eq!(launches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_budget_expiry_raises_hedge_timeout() {
        let h = hedge(HedgeConfig {
            attempts: 2,
            delay_secs: 0.1,
            timeout_secs: 0.5,
        });
        let out: std::result::Result<u32, FailsafeError<&str>> = h
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(out, Err(FailsafeError::HedgeTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_hedge_runs_single_attempt() {
        let h = hedge(HedgeConfig {
            attempts: 3,
            delay_secs: 0.0,
            timeout_secs: 0.01,
        });
        h.set_enabled(false);
        let out: std::result::Result<u32, FailsafeError<&str>> = h
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(3)
            })
            .await;
        // no budget is enforced when the guard is off
        assert_eq!(out.unwrap(), 3);
    }
}

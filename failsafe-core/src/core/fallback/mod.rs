//! Alternate-path execution on failure.

use crate::base::{global_registry, FailsafeError, Pattern, PatternBase, PatternKind};
use crate::{logging, Result};
use std::future::Future;
use std::sync::Arc;

/// Runs a primary operation and, on any failure, a fallback path. The
/// fallback's own failure propagates untouched.
pub struct Fallback {
    base: PatternBase,
}

impl Fallback {
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        let this = Self::detached(name);
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    pub fn detached(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Fallback {
            base: PatternBase::new(PatternKind::Fallback, name),
        })
    }

    /// Run `primary`; on failure, run `alternate` with the error.
    pub async fn execute<T, E, F, Fut, A, AFut>(
        &self,
        primary: F,
        alternate: A,
    ) -> std::result::Result<T, FailsafeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        A: FnOnce(E) -> AFut,
        AFut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        match primary().await {
            Ok(value) => Ok(value),
            Err(e) if self.base.is_enabled() => {
                self.base.emit("fallbacks");
                logging::debug!(
                    "[Fallback] {} primary failed ({}), running alternate",
                    self.base.name(),
                    e
                );
                alternate(e).await.map_err(FailsafeError::Inner)
            }
            Err(e) => Err(FailsafeError::Inner(e)),
        }
    }
}

impl Pattern for Fallback {
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
        serde_json::json!({})
    }

    fn apply_config(&self, _patch: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn reset(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn primary_success_skips_alternate() {
        let fb = Fallback::detached("fallback_primary_ok");
        let out: std::result::Result<u32, FailsafeError<&str>> = fb
            .execute(
                || async { Ok(1) },
                |_| async { panic!("alternate must not run") },
            )
            .await;
        assert_eq!(out.unwrap(), 1);
    }

    #[tokio::test]
    async fn failure_routes_to_alternate() {
        let fb = Fallback::detached("fallback_routes");
        let out: std::result::Result<u32, FailsafeError<&str>> = fb
            .execute(|| async { Err("primary down") }, |_| async { Ok(99) })
            .await;
        assert_eq!(out.unwrap(), 99);
    }

    #[tokio::test]
    async fn alternate_failure_propagates() {
        let fb = Fallback::detached("fallback_alternate_fails");
        let out: std::result::Result<u32, FailsafeError<&str>> = fb
            .execute(
                || async { Err("primary down") },
                |_| async { Err("alternate down") },
            )
            .await;
        assert!(matches!(out, Err(FailsafeError::Inner("alternate down"))));
    }

    #[tokio::test]
    async fn disabled_fallback_propagates_primary_error() {
        let fb = Fallback::detached("fallback_disabled");
        fb.set_enabled(false);
        let out: std::result::Result<u32, FailsafeError<&str>> = fb
            .execute(|| async { Err("primary down") }, |_| async { Ok(99) })
            .await;
        assert!(matches!(out, Err(FailsafeError::Inner("primary down"))));
    }
}

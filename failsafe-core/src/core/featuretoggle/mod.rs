//! Feature gating as a guard.
//!
//! Two independent bits: the feature flag itself, and the pattern's gate bit.
//! A disabled *pattern* passes everything through (no protection at all); a
//! disabled *feature* rejects guarded calls with `FeatureDisabled` so callers
//! can route to an alternative.

use crate::base::{
    global_registry, FailsafeError, Pattern, PatternBase, PatternKind, Rejection,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeatureToggleConfig {
    /// Initial state of the feature flag.
    pub feature_enabled: bool,
}

impl Default for FeatureToggleConfig {
    fn default() -> Self {
        FeatureToggleConfig {
            feature_enabled: true,
        }
    }
}

impl fmt::Display for FeatureToggleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

pub struct FeatureToggle {
    base: PatternBase,
    feature_enabled: AtomicBool,
}

impl FeatureToggle {
    pub fn new(name: impl Into<String>, config: FeatureToggleConfig) -> Result<Arc<Self>> {
        let this = Self::detached(name, config);
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    pub fn detached(name: impl Into<String>, config: FeatureToggleConfig) -> Arc<Self> {
        Arc::new(FeatureToggle {
            base: PatternBase::new(PatternKind::FeatureToggle, name),
            feature_enabled: AtomicBool::new(config.feature_enabled),
        })
    }

    pub fn feature_enabled(&self) -> bool {
        self.feature_enabled.load(Ordering::Relaxed)
    }

    pub fn set_feature_enabled(&self, enabled: bool) {
        self.feature_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn try_pass(&self) -> std::result::Result<(), Rejection> {
        if !self.base.is_enabled() {
            return Ok(());
        }
        if self.feature_enabled() {
            Ok(())
        } else {
            self.base.emit("rejections");
            Err(FailsafeError::FeatureDisabled)
        }
    }

    pub async fn execute<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, FailsafeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.try_pass().map_err(Rejection::widen)?;
        f().await.map_err(FailsafeError::Inner)
    }
}

impl Pattern for FeatureToggle {
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
        serde_json::json!({ "feature_enabled": self.feature_enabled() })
    }

    /// Whitelisted field: `feature_enabled`.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()> {
        if let Some(v) = patch.get("feature_enabled") {
            let enabled = v
                .as_bool()
                .ok_or_else(|| Error::msg("feature_enabled must be a boolean"))?;
            self.set_feature_enabled(enabled);
        }
        Ok(())
    }

    fn reset(&self) {}
}

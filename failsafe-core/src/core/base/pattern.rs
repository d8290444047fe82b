use super::PatternKind;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// `Pattern` is the introspection surface every resilience component exposes
/// to the registry and the control plane: identity, the enable gate bit,
/// configuration reads, whitelisted configuration updates and a state reset.
pub trait Pattern: Send + Sync {
    fn kind(&self) -> PatternKind;
    fn name(&self) -> &str;

    /// The gate bit checked on entry. Disabled means pass-through: no
    /// protection, no rejection, functional state untouched.
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);

    /// Current configuration (control plane `GET /config/{kind}/{name}`).
    fn config_json(&self) -> serde_json::Value;

    /// Apply a whitelisted subset of parameters. Unknown keys are ignored;
    /// invalid values are rejected without touching the pattern.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()>;

    /// Reset pattern-specific mutable state (counters, windows, trip bits).
    fn reset(&self);

    fn summary(&self) -> PatternSummary {
        PatternSummary {
            kind: self.kind(),
            name: self.name().to_owned(),
            enabled: self.is_enabled(),
        }
    }
}

/// The `(kind, name, enabled)` triple reported by `GET /patterns`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternSummary {
    pub kind: PatternKind,
    pub name: String,
    pub enabled: bool,
}

/// `PatternBase` carries the identity and gate bit shared by every pattern.
#[derive(Debug)]
pub struct PatternBase {
    kind: PatternKind,
    name: String,
    enabled: AtomicBool,
}

impl PatternBase {
    pub fn new(kind: PatternKind, name: impl Into<String>) -> Self {
        PatternBase {
            kind,
            name: name.into(),
            enabled: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn emit(&self, metric: &'static str) {
        super::event::emit(self.kind, &self.name, metric);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gate_bit_toggles() {
        let base = PatternBase::new(PatternKind::Timeout, "gate_bit");
        assert!(base.is_enabled());
        base.set_enabled(false);
        assert!(!base.is_enabled());
        base.set_enabled(true);
        assert!(base.is_enabled());
    }
}

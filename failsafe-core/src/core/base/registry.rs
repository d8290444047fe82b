use super::{Pattern, PatternKind, PatternSummary};
use crate::{logging, Error, Result};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref GLOBAL_REGISTRY: Arc<Registry> = Arc::new(Registry::new());
}

/// The process-wide default registry. Patterns built with the regular
/// constructors register here; the control plane should be handed this value
/// (or a dedicated [`Registry`]) as an explicit dependency.
pub fn global_registry() -> Arc<Registry> {
    Arc::clone(&GLOBAL_REGISTRY)
}

/// `Registry` indexes every live pattern by `(kind, name)` for introspection
/// and runtime updates. Reads vastly outnumber writes: listing and lookups
/// take the shared lock, register/deregister the exclusive one.
#[derive(Default)]
pub struct Registry {
    patterns: RwLock<HashMap<(PatternKind, String), Arc<dyn Pattern>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a pattern. The `(kind, name)` pair must be unique within the
    /// registry; duplicates are rejected.
    pub fn register(&self, pattern: Arc<dyn Pattern>) -> Result<()> {
        let key = (pattern.kind(), pattern.name().to_owned());
        let mut patterns = self.patterns.write().unwrap();
        if patterns.contains_key(&key) {
            return Err(Error::msg(format!(
                "pattern {}:{} already registered",
                key.0, key.1
            )));
        }
        logging::info!("[Registry] Registered pattern {}:{}", key.0, key.1);
        patterns.insert(key, pattern);
        Ok(())
    }

    pub fn deregister(&self, kind: PatternKind, name: &str) -> Option<Arc<dyn Pattern>> {
        self.patterns
            .write()
            .unwrap()
            .remove(&(kind, name.to_owned()))
    }

    pub fn get(&self, kind: PatternKind, name: &str) -> Option<Arc<dyn Pattern>> {
        self.patterns
            .read()
            .unwrap()
            .get(&(kind, name.to_owned()))
            .map(Arc::clone)
    }

    /// Summaries of every live pattern, ordered by `(kind, name)`.
    pub fn list(&self) -> Vec<PatternSummary> {
        let patterns = self.patterns.read().unwrap();
        let mut summaries: Vec<PatternSummary> =
            patterns.values().map(|p| p.summary()).collect();
        summaries.sort_by(|a, b| {
            a.kind
                .as_str()
                .cmp(b.kind.as_str())
                .then_with(|| a.name.cmp(&b.name))
        });
        summaries
    }

    pub fn len(&self) -> usize {
        self.patterns.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

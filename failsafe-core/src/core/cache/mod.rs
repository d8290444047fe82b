//! TTL-expiring, capacity-bounded LRU cache with single-flight builds.
//!
//! Concurrent misses for the same key collapse into one in-flight computation;
//! every waiter observes the winner's value or its error. This guarantees
//! at most one build per key per TTL window.

use crate::base::{global_registry, Pattern, PatternBase, PatternKind};
use crate::{logging, utils, Error, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;

/// Stable hash of an operation's inputs, usable as a cache key.
pub fn hash_key<A: Hash>(args: &A) -> u64 {
    let mut hasher = DefaultHasher::new();
    args.hash(&mut hasher);
    hasher.finish()
}

/// Configuration of a [`Cache`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries; the least-recently-used one is evicted.
    pub max_size: usize,
    /// Entry time-to-live in seconds.
    pub ttl_secs: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size: 1024,
            ttl_secs: 60.0,
        }
    }
}

impl CacheConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::msg("zero max_size"));
        }
        if self.ttl_secs <= 0.0 {
            return Err(Error::msg("non-positive ttl_secs"));
        }
        Ok(())
    }
}

impl fmt::Display for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

type BuildOutcome<V> = std::result::Result<V, String>;
type PendingMap<K, V> = HashMap<K, watch::Receiver<Option<BuildOutcome<V>>>>;

/// Broadcasts a cancellation to waiters if the winner is dropped mid-build.
struct BuildGuard<'a, K: Hash + Eq, V> {
    key: Option<&'a K>,
    pending: &'a Mutex<PendingMap<K, V>>,
}

impl<K: Hash + Eq, V> Drop for BuildGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            // Dropping the sender wakes waiters with a closed channel.
            self.pending.lock().unwrap().remove(key);
        }
    }
}

pub struct Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    base: PatternBase,
    config: RwLock<CacheConfig>,
    store: Mutex<LruCache<K, CacheEntry<V>>>,
    pending: Mutex<PendingMap<K, V>>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Result<Arc<Self>> {
        let this = Self::detached(name, config)?;
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    pub fn detached(name: impl Into<String>, config: CacheConfig) -> Result<Arc<Self>> {
        config.is_valid()?;
        Ok(Arc::new(Cache {
            base: PatternBase::new(PatternKind::Cache, name),
            store: Mutex::new(LruCache::new(NonZeroUsize::new(config.max_size).unwrap())),
            pending: Mutex::new(HashMap::new()),
            config: RwLock::new(config),
        }))
    }

    /// Fresh-entry lookup; promotes a hit to most-recently-used.
    pub fn get(&self, key: &K) -> Option<V> {
        let ttl = utils::secs_f64(self.config.read().unwrap().ttl_secs);
        let mut store = self.store.lock().unwrap();
        let fresh = match store.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => Some(entry.value.clone()),
            Some(_) => None,
            None => return None,
        };
        match fresh {
            Some(value) => {
                self.base.emit("hits");
                Some(value)
            }
            None => {
                store.pop(key);
                None
            }
        }
    }

    /// Insert `value`, evicting the least-recently-used entry at capacity.
    pub fn insert(&self, key: K, value: V) {
        let mut store = self.store.lock().unwrap();
        if store.len() == store.cap().get() && !store.contains(&key) {
            self.base.emit("evictions");
        }
        store.put(
            key,
            CacheEntry {
                value,
                inserted_at: utils::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serve `key` from cache or compute it with `f`, collapsing concurrent
    /// misses for the same key into a single build.
    pub async fn get_or_compute<F, Fut>(&self, key: K, f: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if !self.base.is_enabled() {
            return f().await;
        }

        let mut build = Some(f);
        loop {
            if let Some(value) = self.get(&key) {
                return Ok(value);
            }

            // Join an in-flight build or claim the key.
            enum Claim<V> {
                Joined(watch::Receiver<Option<BuildOutcome<V>>>),
                Claimed(watch::Sender<Option<BuildOutcome<V>>>),
            }

            let claim = {
                let mut pending = self.pending.lock().unwrap();
                let existing = pending.get(&key).cloned();
                match existing {
                    Some(rx) => Claim::Joined(rx),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        pending.insert(key.clone(), rx);
                        Claim::Claimed(tx)
                    }
                }
            };

            let joined_rx = match claim {
                Claim::Joined(rx) => rx,
                Claim::Claimed(tx) => {
                    return self.build(&key, tx, build.take().unwrap()).await;
                }
            };

            let mut rx = joined_rx;
            let wait_result = rx
                .wait_for(|outcome| outcome.is_some())
                .await
                .map(|outcome| outcome.clone());
            match wait_result {
                Ok(outcome) => match outcome.as_ref().unwrap() {
                    Ok(value) => {
                        self.base.emit("hits");
                        return Ok(value.clone());
                    }
                    Err(msg) => return Err(Error::msg(msg.clone())),
                },
                // The winner was cancelled mid-build; clean up its claim if it
                // is still there, then race for the key again.
                Err(_) => {
                    let mut pending = self.pending.lock().unwrap();
                    if pending.get(&key).map_or(false, |stale| stale.has_changed().is_err()) {
                        pending.remove(&key);
                    }
                }
            }
        }
    }

    async fn build<F, Fut>(
        &self,
        key: &K,
        tx: watch::Sender<Option<BuildOutcome<V>>>,
        f: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut guard = BuildGuard {
            key: Some(key),
            pending: &self.pending,
        };
        self.base.emit("misses");

        let result = f().await;

        match result {
            Ok(value) => {
                // Populate the store before releasing the claim so a caller
                // arriving in between sees a hit, not a second build.
                self.insert(key.clone(), value.clone());
                guard.key = None;
                self.pending.lock().unwrap().remove(key);
                let _ = tx.send(Some(Ok(value.clone())));
                Ok(value)
            }
            Err(e) => {
                guard.key = None;
                self.pending.lock().unwrap().remove(key);
                logging::debug!(
                    "[Cache] {} build failed, broadcasting to waiters: {}",
                    self.base.name(),
                    e
                );
                let _ = tx.send(Some(Err(e.to_string())));
                Err(e)
            }
        }
    }
}

impl<K, V> Pattern for Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
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

    /// Whitelisted fields: `max_size`, `ttl_secs`.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()> {
        let mut candidate = *self.config.read().unwrap();
        if let Some(v) = patch.get("max_size").and_then(|v| v.as_u64()) {
            candidate.max_size = v as usize;
        }
        if let Some(v) = patch.get("ttl_secs").and_then(|v| v.as_f64()) {
            candidate.ttl_secs = v;
        }
        candidate.is_valid()?;
        let mut config = self.config.write().unwrap();
        self.store
            .lock()
            .unwrap()
            .resize(NonZeroUsize::new(candidate.max_size).unwrap());
        *config = candidate;
        Ok(())
    }

    /// Drop every cached entry.
    fn reset(&self) {
        self.store.lock().unwrap().clear();
    }
}

//! Bounded concurrency with a bounded wait queue.
//!
//! Admission: a free slot is taken immediately; otherwise the caller suspends
//! in a FIFO queue, provided the queue has room. A full queue fails fast with
//! `BulkheadFull`. Releases hand the freed slot to the queue head, preserving
//! arrival order.

use crate::base::{
    global_registry, FailsafeError, Pattern, PatternBase, PatternKind, Rejection,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration of a [`Bulkhead`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Calls allowed to run concurrently.
    pub max_concurrent: usize,
    /// Callers allowed to wait for a slot; 0 disables queueing.
    pub max_queued: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        BulkheadConfig {
            max_concurrent: 10,
            max_queued: 10,
        }
    }
}

impl BulkheadConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::msg("zero max_concurrent"));
        }
        Ok(())
    }
}

impl fmt::Display for BulkheadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

/// A held execution slot; dropping it releases the slot and wakes the queue
/// head. Guards release on every exit path, success or failure.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Decrements the waiter count even when the waiting caller is cancelled
/// mid-queue, so an abandoned wait never consumes queue capacity.
struct QueueSlot<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Semaphore-based concurrency limiter with a bounded FIFO wait queue.
pub struct Bulkhead {
    base: PatternBase,
    config: RwLock<BulkheadConfig>,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Arc<Self>> {
        let this = Self::detached(name, config)?;
        global_registry().register(Arc::clone(&this) as Arc<dyn Pattern>)?;
        Ok(this)
    }

    pub fn detached(name: impl Into<String>, config: BulkheadConfig) -> Result<Arc<Self>> {
        config.is_valid()?;
        Ok(Arc::new(Bulkhead {
            base: PatternBase::new(PatternKind::Bulkhead, name),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config: RwLock::new(config),
            queued: AtomicUsize::new(0),
        }))
    }

    /// Acquire an execution slot, suspending in FIFO order when all slots are
    /// busy. Fails with `BulkheadFull` when the wait queue is full too.
    pub async fn acquire(&self) -> std::result::Result<BulkheadPermit, Rejection> {
        if !self.base.is_enabled() {
            return Ok(BulkheadPermit { _permit: None });
        }

        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(BulkheadPermit {
                _permit: Some(permit),
            });
        }

        // No free slot: reserve a queue position or fail fast.
        let max_queued = self.config.read().unwrap().max_queued;
        let reserved = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < max_queued).then(|| queued + 1)
            });
        if reserved.is_err() {
            self.base.emit("rejections");
            return Err(FailsafeError::BulkheadFull);
        }
        let _slot = QueueSlot {
            queued: &self.queued,
        };

        // The tokio semaphore queues acquirers fairly, so waiters resume in
        // arrival order. Dropping this future removes it from the queue.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("bulkhead semaphore never closes");
        Ok(BulkheadPermit {
            _permit: Some(permit),
        })
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self) -> usize {
        let max_concurrent = self.config.read().unwrap().max_concurrent;
        max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Callers currently suspended in the wait queue.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Guard `f` with the bulkhead; the slot is released on every exit path.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, FailsafeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let _permit = self.acquire().await.map_err(Rejection::widen)?;
        f().await.map_err(FailsafeError::Inner)
    }
}

impl Pattern for Bulkhead {
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

    /// Only `max_queued` may change at runtime; resizing `max_concurrent`
    /// under live permits would corrupt the slot accounting.
    fn apply_config(&self, patch: &serde_json::Value) -> Result<()> {
        if patch.get("max_concurrent").is_some() {
            return Err(Error::msg(
                "max_concurrent cannot be changed on a live bulkhead",
            ));
        }
        if let Some(v) = patch.get("max_queued").and_then(|v| v.as_u64()) {
            self.config.write().unwrap().max_queued = v as usize;
        }
        Ok(())
    }

    fn reset(&self) {
        // Slots and queue positions drain naturally; nothing to clear.
    }
}

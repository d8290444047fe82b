#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # failsafe-rs
//!
//! failsafe wraps individual asynchronous operations with composable protective
//! behaviors (**rate limiting**, **circuit breaking**, **bulkheads**,
//! **retries**, **timeouts**, **hedging**, **fallbacks** and **caching**) and
//! emits telemetry for every decision it takes.
//!
//! Each pattern is a named, long-lived object exposing a guard around an
//! operation. Guards compose by stacking: the outermost guard sees every call,
//! inner guards only see calls that passed the outer ones. Every live pattern
//! registers itself under `(kind, name)` in a process-wide [`Registry`] so the
//! control plane can inspect it, update its configuration, read its metrics and
//! flip it on or off at runtime.
//!
//! ## Add Dependency
//!
//! ```toml
//! [dependencies]
//! failsafe-core = { version = "0.1.0" }
//! ```
//!
//! Optional feature list:
//! - exporter: Export metric statistics to Prometheus.
//! - client: The adaptive egress HTTP client that cooperates with server
//!   backpressure signals (`Retry-After`, `X-Backpressure`).
//! - logger_env: Use `env_logger` to initialize logging.
//!
//! ## Guarding an operation
//!
//! ```rust,no_run
//! use failsafe_core::ratelimit::{RateLimitConfig, TokenBucketLimiter};
//!
//! # async fn handle() -> failsafe_core::Result<()> {
//! let limiter = TokenBucketLimiter::new(
//!     "checkout",
//!     RateLimitConfig {
//!         max_executions: 100.0,
//!         per_time_secs: 60.0,
//!         ..Default::default()
//!     },
//! )?;
//!
//! match limiter.try_acquire(Some("tenant-42")) {
//!     acq if acq.is_allowed() => {
//!         // run the request, then report its latency
//!         limiter.record_latency(0.012);
//!     }
//!     acq => {
//!         // rejected: surface acq.retry_after() to the caller
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## General Configurations and Initialization
//!
//! - `init_default()`: load configuration from environment variables, use
//!   defaults for everything undefined.
//! - `init_with_config_file(path)`: load configuration from a YAML file keyed
//!   `{kind} -> {name} -> parameters`.
//! - `init_with_config(entity)`: use a hand-crafted [`config::ConfigEntity`].

// This module is not intended to be part of the public API. In general, any
// `doc(hidden)` code is not part of the crate's public and stable API.
#[macro_use]
#[doc(hidden)]
pub mod macros;

/// Core implementations: the resilience patterns, the statistic structures
/// backing the backpressure calculator, the metric event bus and the
/// process-wide pattern registry.
pub mod core;
/// Adapters for different logging crates.
pub mod logging;
cfg_exporter! {
    /// Metric exporter implementations. Currently, only Prometheus is supported.
    pub mod exporter;
}
/// Utility functions: monotonic time helpers built on the tokio clock.
pub mod utils;

pub use crate::core::*;

pub type Result<T> = anyhow::Result<T>;
pub type Error = anyhow::Error;

use crate::config::ConfigEntity;

/// Initialize failsafe from environment variables, falling back to defaults.
pub fn init_default() -> Result<()> {
    config::init_config_from_env()
}

/// Initialize failsafe with the configuration loaded from a YAML file.
pub fn init_with_config_file(config_path: &str) -> Result<()> {
    config::init_config_with_yaml(config_path)
}

/// Initialize failsafe with a hand-crafted configuration entity.
pub fn init_with_config(entity: ConfigEntity) -> Result<()> {
    config::init_config_with_entity(entity)
}

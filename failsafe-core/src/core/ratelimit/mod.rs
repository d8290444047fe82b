//! Adaptive token-bucket rate limiting.
//!
//! The limiter debits a global bucket (and, when per-client tracking is on, a
//! per-client sub-bucket) on every admission. Rejections carry `Retry-After`
//! advice computed by a pluggable strategy; the `backpressure` strategy folds
//! in a latency-derived stress score so clients back off harder exactly when
//! the service is struggling.

pub mod bucket;
pub mod limiter;
pub mod retry_after;

pub use bucket::*;
pub use limiter::*;
pub use retry_after::*;

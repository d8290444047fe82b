//! This crate provides the [failsafe-core](https://docs.rs/failsafe-core)
//! middleware for [axum](https://docs.rs/axum):
//!
//! - [`RateLimitLayer`] guards routes with a named token-bucket limiter,
//!   emits the `RateLimit-*` / `X-Backpressure` / `X-Client-Id` response
//!   headers and answers rejected calls with a `429` carrying `Retry-After`.
//! - [`rejection_response`] maps the guard error taxonomy onto HTTP statuses
//!   for handlers that run guards themselves.
//! - [`control_plane`] builds the runtime-management router (health, pattern
//!   discovery, config reads/updates, metrics, enable/disable), taking the
//!   registry and collector as explicit dependencies.

mod control;
mod layer;
mod response;

pub use control::{control_plane, ControlPlane};
pub use layer::{default_client_id, ClientIdExtractor, RateLimitLayer, RateLimitService};
pub use response::{rejection_response, too_many_requests};

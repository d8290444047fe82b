use crate::response::too_many_requests;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use failsafe_core::ratelimit::{Acquisition, TokenBucketLimiter};
use failsafe_core::utils;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Extracts the client identity used for per-client sub-buckets and the
/// `X-Client-Id` response header.
pub type ClientIdExtractor = fn(&Request<Body>) -> Option<String>;

/// Default client identity: `X-Client-Id` header, then the first
/// `X-Forwarded-For` hop. Callers that want the peer address should install
/// their own extractor reading `ConnectInfo` from the request extensions.
pub fn default_client_id(req: &Request<Body>) -> Option<String> {
    if let Some(id) = req.headers().get("X-Client-Id").and_then(|v| v.to_str().ok()) {
        return Some(id.to_owned());
    }
    req.headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|forwarded| forwarded.split(',').next())
        .map(|hop| hop.trim().to_owned())
}

/// Tower middleware guarding a service with a [`TokenBucketLimiter`].
///
/// Admitted requests run the inner service, get the `RateLimit-*`,
/// `X-Backpressure` and `X-Client-Id` headers stamped on the response, and
/// report their latency back to the limiter. Rejected requests are answered
/// with `429` without touching the inner service.
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<TokenBucketLimiter>,
    extractor: ClientIdExtractor,
}

impl<S: Clone> Clone for RateLimitService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            extractor: self.extractor,
        }
    }
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    #[allow(clippy::type_complexity)]
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let client_id = (self.extractor)(&req);
        match self.limiter.try_acquire(client_id.as_deref()) {
            Acquisition::Rejected(advice) => {
                let response = too_many_requests(&advice, client_id.as_deref());
                Box::pin(async move { Ok(response) })
            }
            acquisition @ Acquisition::Allowed(_) => {
                let limiter = Arc::clone(&self.limiter);
                let started = utils::now();
                let fut = self.inner.call(req);
                Box::pin(async move {
                    let mut response = fut.await?;
                    limiter.record_latency(started.elapsed().as_secs_f64());
                    let headers = response.headers_mut();
                    for (name, value) in acquisition.headers() {
                        if let Ok(value) = value.parse() {
                            headers.insert(name, value);
                        }
                    }
                    if let Ok(value) = client_id.as_deref().unwrap_or("unknown").parse() {
                        headers.insert("X-Client-Id", value);
                    }
                    Ok(response)
                })
            }
        }
    }
}

/// The [`tower::Layer`] wrapper for [`RateLimitService`].
pub struct RateLimitLayer {
    limiter: Arc<TokenBucketLimiter>,
    extractor: ClientIdExtractor,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<TokenBucketLimiter>) -> Self {
        RateLimitLayer {
            limiter,
            extractor: default_client_id,
        }
    }

    pub fn with_extractor(mut self, extractor: ClientIdExtractor) -> Self {
        self.extractor = extractor;
        self
    }
}

impl Clone for RateLimitLayer {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            extractor: self.extractor,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            extractor: self.extractor,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use failsafe_core::ratelimit::{RateLimitConfig, RetryAfterStrategy};
    use tower::util::ServiceExt;

    fn guarded_app(limiter: Arc<TokenBucketLimiter>) -> Router {
        Router::new()
            .route("/", get(|| async { "hello" }))
            .layer(RateLimitLayer::new(limiter))
    }

    fn limiter(max_executions: f64, bucket_size: f64) -> Arc<TokenBucketLimiter> {
        TokenBucketLimiter::detached(
            "layer_under_test",
            RateLimitConfig {
                max_executions,
                per_time_secs: 1.0,
                bucket_size: Some(bucket_size),
                retry_after_strategy: RetryAfterStrategy::Fixed,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn admitted_request_gets_rate_limit_headers() {
        let app = guarded_app(limiter(10.0, 10.0));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["RateLimit-Limit"], "10");
        assert_eq!(response.headers()["RateLimit-Remaining"], "9");
        assert_eq!(response.headers()["X-Client-Id"], "unknown");
        assert!(response.headers().contains_key("X-Backpressure"));
    }

    #[tokio::test]
    async fn exhausted_bucket_returns_429_with_advice() {
        let lim = limiter(2.0, 1.0);
        let app = guarded_app(Arc::clone(&lim));
        let ok = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let rejected = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(rejected.headers().contains_key("Retry-After"));
        assert!(rejected.headers().contains_key("X-RateLimit-Retry-After-Ms"));

        let body = hyper::body::to_bytes(rejected.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "rate_limit_exceeded");
        assert!(json["retry_after_ms"].as_u64().is_some());
    }

    #[tokio::test]
    async fn client_id_header_feeds_the_extractor() {
        let lim = TokenBucketLimiter::detached(
            "layer_per_client",
            RateLimitConfig {
                max_executions: 100.0,
                per_time_secs: 1.0,
                enable_per_client_tracking: true,
                ..Default::default()
            },
        )
        .unwrap();
        let app = guarded_app(Arc::clone(&lim));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Client-Id", "tenant-9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["X-Client-Id"], "tenant-9");
        assert_eq!(lim.tracked_clients(), 1);
    }
}

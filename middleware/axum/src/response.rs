use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use failsafe_core::base::{FailsafeError, RetryAdvice};
use std::fmt;

/// Build the `429 Too Many Requests` response for a rate-limit rejection:
/// advice headers plus the JSON body clients parse to cooperate.
pub fn too_many_requests(advice: &RetryAdvice, client_id: Option<&str>) -> Response {
    let retry_after_seconds = advice.retry_after.as_secs_f64();
    let client_id = client_id.unwrap_or("unknown");
    let body = serde_json::json!({
        "error": "rate_limit_exceeded",
        "message": format!("Rate limit exceeded. Retry after {}ms", advice.retry_after_ms()),
        "retry_after_seconds": retry_after_seconds,
        "retry_after_ms": advice.retry_after_ms(),
        "client_id": client_id,
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        "Retry-After",
        header_value(advice.retry_after_header().to_string()),
    );
    headers.insert(
        "X-RateLimit-Retry-After-Ms",
        header_value(advice.retry_after_ms().to_string()),
    );
    headers.insert(
        "X-Backpressure",
        header_value(format!("{:.2}", advice.backpressure)),
    );
    headers.insert("X-Client-Id", header_value(client_id.to_owned()));
    response
}

/// Map a guard error onto its HTTP response: `429` for rate limiting, `503`
/// for breaker/bulkhead/fail-fast/exhausted retries, `504` for deadline
/// expiry, `403` for a disabled feature and `500` for the operation's own
/// error.
pub fn rejection_response<E: fmt::Display>(
    err: &FailsafeError<E>,
    client_id: Option<&str>,
) -> Response {
    let (status, error) = match err {
        FailsafeError::RateLimitExceeded(advice) => {
            return too_many_requests(advice, client_id);
        }
        FailsafeError::CircuitBreakerOpen => (StatusCode::SERVICE_UNAVAILABLE, "circuit_breaker_open"),
        FailsafeError::BulkheadFull => (StatusCode::SERVICE_UNAVAILABLE, "bulkhead_full"),
        FailsafeError::AttemptsExceeded { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        FailsafeError::FailFastOpen => (StatusCode::SERVICE_UNAVAILABLE, "failfast_open"),
        FailsafeError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        FailsafeError::HedgeTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "hedge_timeout"),
        FailsafeError::FeatureDisabled => (StatusCode::FORBIDDEN, "feature_disabled"),
        FailsafeError::Inner(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    let body = serde_json::json!({
        "error": error,
        "message": err.to_string(),
    });
    (status, Json(body)).into_response()
}

fn header_value(value: String) -> HeaderValue {
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use failsafe_core::base::{MetricsCollector, Pattern, PatternKind, Registry};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

/// Dependencies of the control-plane endpoints. The registry and collector
/// are injected rather than reached for globally, so tests and embedders can
/// scope them.
#[derive(Clone)]
pub struct ControlPlane {
    pub registry: Arc<Registry>,
    pub collector: Arc<MetricsCollector>,
}

/// Build the control-plane router. Mount it under the configured prefix:
///
/// ```rust,no_run
/// use axum::Router;
/// use failsafe_axum::control_plane;
/// use failsafe_core::base::{global_collector, global_registry};
///
/// let app: Router = Router::new().nest(
///     &failsafe_core::config::control_plane_prefix(),
///     control_plane(global_registry(), global_collector()),
/// );
/// ```
pub fn control_plane(registry: Arc<Registry>, collector: Arc<MetricsCollector>) -> Router {
    let state = ControlPlane {
        registry,
        collector,
    };
    Router::new()
        .route("/health", get(health))
        .route("/liveness", get(liveness))
        .route("/patterns", get(list_patterns))
        .route("/config", get(all_configs))
        .route("/config/:kind/:name", get(get_config).put(update_config))
        .route("/metrics", get(all_metrics))
        .route("/metrics/:kind/:name", get(get_metrics).delete(reset_metrics))
        .route("/control/:kind/:name/enable", post(enable_pattern))
        .route("/control/:kind/:name/disable", post(disable_pattern))
        .with_state(state)
}

fn not_found(kind: &str, name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "pattern_not_found",
            "message": format!("pattern {}:{} not found", kind, name),
        })),
    )
        .into_response()
}

fn lookup(
    state: &ControlPlane,
    kind: &str,
    name: &str,
) -> Result<Arc<dyn Pattern>, Response> {
    let parsed = PatternKind::from_str(kind).map_err(|_| not_found(kind, name))?;
    state
        .registry
        .get(parsed, name)
        .ok_or_else(|| not_found(kind, name))
}

async fn health(State(state): State<ControlPlane>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "patterns_active": state.registry.len(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

async fn list_patterns(State(state): State<ControlPlane>) -> Json<serde_json::Value> {
    Json(json!({ "patterns": state.registry.list() }))
}

async fn all_configs(State(state): State<ControlPlane>) -> Json<serde_json::Value> {
    let mut configs = serde_json::Map::new();
    for summary in state.registry.list() {
        if let Some(pattern) = state.registry.get(summary.kind, &summary.name) {
            configs.insert(
                format!("{}:{}", summary.kind, summary.name),
                pattern.config_json(),
            );
        }
    }
    Json(json!({ "configs": configs }))
}

async fn get_config(
    State(state): State<ControlPlane>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    match lookup(&state, &kind, &name) {
        Ok(pattern) => Json(json!({
            "kind": kind,
            "name": name,
            "enabled": pattern.is_enabled(),
            "config": pattern.config_json(),
        }))
        .into_response(),
        Err(response) => response,
    }
}

async fn update_config(
    State(state): State<ControlPlane>,
    Path((kind, name)): Path<(String, String)>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    match lookup(&state, &kind, &name) {
        Ok(pattern) => match pattern.apply_config(&patch) {
            Ok(()) => Json(json!({
                "kind": kind,
                "name": name,
                "status": "updated",
                "config": pattern.config_json(),
            }))
            .into_response(),
            Err(e) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_config",
                    "message": e.to_string(),
                })),
            )
                .into_response(),
        },
        Err(response) => response,
    }
}

async fn all_metrics(State(state): State<ControlPlane>) -> Json<serde_json::Value> {
    Json(json!({ "metrics": state.collector.snapshot_all() }))
}

async fn get_metrics(
    State(state): State<ControlPlane>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let parsed = match PatternKind::from_str(&kind) {
        Ok(parsed) => parsed,
        Err(_) => return not_found(&kind, &name),
    };
    match state.collector.snapshot(parsed, &name) {
        Some(metrics) => Json(json!({
            "kind": kind,
            "name": name,
            "metrics": metrics,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "metrics_not_found",
                "message": format!("no metrics recorded for {}:{}", kind, name),
            })),
        )
            .into_response(),
    }
}

async fn reset_metrics(
    State(state): State<ControlPlane>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let parsed = match PatternKind::from_str(&kind) {
        Ok(parsed) => parsed,
        Err(_) => return not_found(&kind, &name),
    };
    state.collector.reset(parsed, &name);
    Json(json!({ "kind": kind, "name": name, "status": "reset" })).into_response()
}

async fn enable_pattern(
    State(state): State<ControlPlane>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    set_enabled(&state, &kind, &name, true)
}

async fn disable_pattern(
    State(state): State<ControlPlane>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    set_enabled(&state, &kind, &name, false)
}

fn set_enabled(state: &ControlPlane, kind: &str, name: &str, enabled: bool) -> Response {
    match lookup(state, kind, name) {
        Ok(pattern) => {
            pattern.set_enabled(enabled);
            Json(json!({
                "kind": kind,
                "name": name,
                "status": if enabled { "enabled" } else { "disabled" },
            }))
            .into_response()
        }
        Err(response) => response,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use failsafe_core::base::{MetricEvent, MetricListener};
    use failsafe_core::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
    use failsafe_core::ratelimit::{RateLimitConfig, TokenBucketLimiter};
    use tower::util::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn test_setup() -> (Router, Arc<Registry>, Arc<MetricsCollector>) {
        let registry = Arc::new(Registry::new());
        let collector = Arc::new(MetricsCollector::default());
        let app = control_plane(Arc::clone(&registry), Arc::clone(&collector));
        (app, registry, collector)
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_active_patterns() {
        let (app, registry, _) = test_setup();
        registry
            .register(
                CircuitBreaker::detached("cp_health", CircuitBreakerConfig::default()).unwrap(),
            )
            .unwrap();

        let response = app.oneshot(request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["patterns_active"], 1);
    }

    #[tokio::test]
    async fn liveness_pings() {
        let (app, _, _) = test_setup();
        let response = app.oneshot(request("GET", "/liveness")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "alive");
    }

    #[tokio::test]
    async fn patterns_lists_kind_name_enabled() {
        let (app, registry, _) = test_setup();
        let breaker =
            CircuitBreaker::detached("cp_list", CircuitBreakerConfig::default()).unwrap();
        breaker.set_enabled(false);
        registry.register(breaker).unwrap();

        let json = body_json(app.oneshot(request("GET", "/patterns")).await.unwrap()).await;
        assert_eq!(json["patterns"][0]["kind"], "circuitbreaker");
        assert_eq!(json["patterns"][0]["name"], "cp_list");
        assert_eq!(json["patterns"][0]["enabled"], false);
    }

    #[tokio::test]
    async fn config_read_update_cycle() {
        let (app, registry, _) = test_setup();
        registry
            .register(
                TokenBucketLimiter::detached(
                    "cp_config",
                    RateLimitConfig {
                        max_executions: 10.0,
                        ..Default::default()
                    },
                )
                .unwrap(),
            )
            .unwrap();

        let read = body_json(
            app.clone()
                .oneshot(request("GET", "/config/ratelimit/cp_config"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(read["config"]["max_executions"], 10.0);

        let updated = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/config/ratelimit/cp_config",
                json!({"max_executions": 50.0}),
            ))
            .await
            .unwrap();
        assert_eq!(updated.status(), StatusCode::OK);
        let updated = body_json(updated).await;
        assert_eq!(updated["status"], "updated");
        assert_eq!(updated["config"]["max_executions"], 50.0);

        let invalid = app
            .oneshot(json_request(
                "PUT",
                "/config/ratelimit/cp_config",
                json!({"max_executions": -5.0}),
            ))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_pattern_is_404() {
        let (app, _, _) = test_setup();
        let response = app
            .clone()
            .oneshot(request("GET", "/config/ratelimit/ghost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request("GET", "/config/nonsense/ghost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_read_and_reset() {
        let (app, _, collector) = test_setup();
        collector.on_event(&MetricEvent::counter(
            PatternKind::RateLimit,
            "cp_metrics",
            "requests",
        ));

        let json = body_json(
            app.clone()
                .oneshot(request("GET", "/metrics/ratelimit/cp_metrics"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(json["metrics"]["requests"], 1);

        let reset = app
            .clone()
            .oneshot(request("DELETE", "/metrics/ratelimit/cp_metrics"))
            .await
            .unwrap();
        assert_eq!(body_json(reset).await["status"], "reset");

        let gone = app
            .oneshot(request("GET", "/metrics/ratelimit/cp_metrics"))
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn enable_disable_only_touches_the_gate_bit() {
        let (app, registry, _) = test_setup();
        let limiter = TokenBucketLimiter::detached(
            "cp_toggle",
            RateLimitConfig {
                max_executions: 1.0,
                per_time_secs: 3600.0,
                ..Default::default()
            },
        )
        .unwrap();
        registry.register(Arc::clone(&limiter) as Arc<dyn Pattern>).unwrap();

        // drain the single token, then disable: calls pass through
        assert!(limiter.try_acquire(None).is_allowed());
        assert!(!limiter.try_acquire(None).is_allowed());

        let disabled = app
            .clone()
            .oneshot(request("POST", "/control/ratelimit/cp_toggle/disable"))
            .await
            .unwrap();
        assert_eq!(body_json(disabled).await["status"], "disabled");
        assert!(limiter.try_acquire(None).is_allowed());

        let enabled = app
            .oneshot(request("POST", "/control/ratelimit/cp_toggle/enable"))
            .await
            .unwrap();
        assert_eq!(body_json(enabled).await["status"], "enabled");
        // functional state unchanged by the toggle: still out of tokens
        assert!(!limiter.try_acquire(None).is_allowed());
    }
}

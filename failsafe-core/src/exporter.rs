//! Prometheus export of the metric event stream.

use crate::base::{register_metric_listener, MetricEvent, MetricListener};
use crate::config;
use lazy_static::lazy_static;
use prometheus_exporter::{
    prometheus::{default_registry, opts, CounterVec, GaugeVec, Registry},
    Builder,
};
use std::sync::{Arc, Once};
use sysinfo::{System, SystemExt};

lazy_static! {
    static ref HOST_NAME: String =
        System::new().host_name().unwrap_or_else(|| "<unknown>".to_owned());
    static ref PROCESS_NAME: String = std::env::args().collect::<Vec<String>>()[0].clone();
    static ref PID_STRING: String = format!("{}", std::process::id());
    // crate::core::base::event
    static ref PATTERN_EVENT_COUNTER: CounterVec = CounterVec::new(
        opts!(
            "failsafe_pattern_events_total",
            "Total pattern metric events by kind, name and metric"
        ),
        &["host", "process", "pid", "kind", "name", "metric"]
    )
    .unwrap();
    // crate::core::circuitbreaker
    static ref STATE_CHANGE_COUNTER: CounterVec = CounterVec::new(
        opts!(
            "failsafe_circuit_breaker_state_changed_total",
            "Circuit breaker total state change count"
        ),
        &["host", "process", "pid", "name", "from_state", "to_state"]
    )
    .unwrap();
    // crate::core::ratelimit
    static ref TOKENS_GAUGE: GaugeVec = GaugeVec::new(
        opts!(
            "failsafe_ratelimit_tokens",
            "Remaining tokens after the most recent admission"
        ),
        &["host", "process", "pid", "name"]
    )
    .unwrap();
    static ref BACKPRESSURE_GAUGE: GaugeVec = GaugeVec::new(
        opts!(
            "failsafe_backpressure_score",
            "Current latency-derived backpressure score"
        ),
        &["host", "process", "pid", "name"]
    )
    .unwrap();
    static ref GAUGE_METRICS: Vec<GaugeVec> =
        vec![TOKENS_GAUGE.clone(), BACKPRESSURE_GAUGE.clone()];
    static ref COUNTER_METRICS: Vec<CounterVec> =
        vec![PATTERN_EVENT_COUNTER.clone(), STATE_CHANGE_COUNTER.clone()];
    static ref INIT_ONCE: Once = Once::new();
}

pub fn set_tokens_gauge(name: &str, tokens: f64) {
    TOKENS_GAUGE
        .with_label_values(&[&HOST_NAME, &PROCESS_NAME, &PID_STRING, name])
        .set(tokens);
}

pub fn set_backpressure_gauge(name: &str, score: f64) {
    BACKPRESSURE_GAUGE
        .with_label_values(&[&HOST_NAME, &PROCESS_NAME, &PID_STRING, name])
        .set(score);
}

pub fn add_state_change_counter(name: &str, from: &str, to: &str) {
    STATE_CHANGE_COUNTER
        .with_label_values(&[&HOST_NAME, &PROCESS_NAME, &PID_STRING, name, from, to])
        .inc_by(1.0);
}

/// Bridges the in-process metric event bus onto Prometheus counters.
struct PrometheusListener;

impl MetricListener for PrometheusListener {
    fn on_event(&self, event: &MetricEvent) {
        PATTERN_EVENT_COUNTER
            .with_label_values(&[
                &HOST_NAME,
                &PROCESS_NAME,
                &PID_STRING,
                event.kind.as_str(),
                &event.name,
                event.metric,
            ])
            .inc_by(event.value as f64);
    }
}

fn register_failsafe_metrics(registry: Option<Box<Registry>>) {
    let r = match registry {
        Some(ref r) => r,
        None => default_registry(),
    };
    for item in &*GAUGE_METRICS {
        r.register(Box::new(item.clone())).unwrap();
    }
    for item in &*COUNTER_METRICS {
        r.register(Box::new(item.clone())).unwrap();
    }
}

pub fn reset_failsafe_metrics() {
    for item in &*GAUGE_METRICS {
        item.reset();
    }
    for item in &*COUNTER_METRICS {
        item.reset();
    }
}

/// Register the Prometheus listener and start the scrape endpoint configured
/// under `exporter.addr` / `exporter.metrics_path`.
pub fn init() {
    INIT_ONCE.call_once(move || {
        // currently, the `prometheus_exporter` crate only supports the global registry
        register_failsafe_metrics(None);
        register_metric_listener(Arc::new(PrometheusListener));
        let binding = config::exporter_addr().parse().unwrap();
        let metrics_path = config::exporter_metrics_path();
        let mut builder = Builder::new(binding);
        builder.with_endpoint(&metrics_path).unwrap();
        builder.start().unwrap();
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::PatternKind;

    #[test]
    fn listener_counts_bus_events() {
        let listener = PrometheusListener;
        listener.on_event(&MetricEvent::counter(
            PatternKind::RateLimit,
            "exporter_counts",
            "requests",
        ));
        let count = PATTERN_EVENT_COUNTER
            .with_label_values(&[
                &HOST_NAME,
                &PROCESS_NAME,
                &PID_STRING,
                "ratelimit",
                "exporter_counts",
                "requests",
            ])
            .get();
        assert!(count >= 1.0);
    }

    #[test]
    fn gauges_track_latest_value() {
        set_tokens_gauge("exporter_gauges", 12.0);
        set_backpressure_gauge("exporter_gauges", 0.4);
        let tokens = TOKENS_GAUGE
            .with_label_values(&[&HOST_NAME, &PROCESS_NAME, &PID_STRING, "exporter_gauges"])
            .get();
        assert_eq!(tokens, 12.0);
    }
}

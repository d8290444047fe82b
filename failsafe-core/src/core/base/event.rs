use super::PatternKind;
use lazy_static::lazy_static;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// A named counter event published by a pattern. `value` is the increment
/// (almost always 1); `attributes` carry low-cardinality context such as a
/// circuit breaker's `from`/`to` states.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub kind: PatternKind,
    pub name: String,
    pub metric: &'static str,
    pub value: u64,
    pub attributes: HashMap<&'static str, String>,
}

impl MetricEvent {
    pub fn counter(kind: PatternKind, name: &str, metric: &'static str) -> Self {
        MetricEvent {
            kind,
            name: name.to_owned(),
            metric,
            value: 1,
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &'static str, value: String) -> Self {
        self.attributes.insert(key, value);
        self
    }
}

/// `MetricListener` receives every metric event published in the process.
/// Exporters subscribe at startup via [`register_metric_listener`].
pub trait MetricListener: Send + Sync {
    fn on_event(&self, event: &MetricEvent);
}

lazy_static! {
    static ref GLOBAL_COLLECTOR: Arc<MetricsCollector> = Arc::new(MetricsCollector::default());
    static ref METRIC_LISTENERS: RwLock<Vec<Arc<dyn MetricListener>>> =
        RwLock::new(vec![Arc::clone(&GLOBAL_COLLECTOR) as Arc<dyn MetricListener>]);
}

pub fn register_metric_listener(listener: Arc<dyn MetricListener>) {
    METRIC_LISTENERS.write().unwrap().push(listener);
}

/// The in-process aggregate every control-plane `/metrics` read is served from.
pub fn global_collector() -> Arc<MetricsCollector> {
    Arc::clone(&GLOBAL_COLLECTOR)
}

pub fn publish(event: MetricEvent) {
    let listeners = METRIC_LISTENERS.read().unwrap();
    for listener in listeners.iter() {
        listener.on_event(&event);
    }
}

#[inline]
pub(crate) fn emit(kind: PatternKind, name: &str, metric: &'static str) {
    publish(MetricEvent::counter(kind, name, metric));
}

/// `MetricsCollector` aggregates counter events per `(kind, name)`. It backs
/// the control-plane metrics endpoints and can be reset per pattern.
#[derive(Default)]
pub struct MetricsCollector {
    metrics: RwLock<HashMap<(PatternKind, String), BTreeMap<&'static str, u64>>>,
}

impl MetricListener for MetricsCollector {
    fn on_event(&self, event: &MetricEvent) {
        let mut metrics = self.metrics.write().unwrap();
        let per_pattern = metrics
            .entry((event.kind, event.name.clone()))
            .or_default();
        *per_pattern.entry(event.metric).or_insert(0) += event.value;
    }
}

impl MetricsCollector {
    pub fn snapshot(&self, kind: PatternKind, name: &str) -> Option<BTreeMap<&'static str, u64>> {
        self.metrics
            .read()
            .unwrap()
            .get(&(kind, name.to_owned()))
            .cloned()
    }

    /// All aggregates keyed `"{kind}:{name}"`.
    pub fn snapshot_all(&self) -> BTreeMap<String, BTreeMap<&'static str, u64>> {
        self.metrics
            .read()
            .unwrap()
            .iter()
            .map(|((kind, name), counters)| (format!("{}:{}", kind, name), counters.clone()))
            .collect()
    }

    pub fn reset(&self, kind: PatternKind, name: &str) {
        self.metrics
            .write()
            .unwrap()
            .remove(&(kind, name.to_owned()));
    }
}

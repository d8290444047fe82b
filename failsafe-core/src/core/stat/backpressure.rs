use super::LatencyWindow;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

// EMA weights for the drifting P95 baseline.
const BASELINE_KEEP: f64 = 0.95;
const BASELINE_BLEND: f64 = 0.05;

/// Parameters of the backpressure calculator.
///
/// The score combines two independent signals:
/// - *P95 violation*: the fraction of recent samples above the (slowly
///   drifting) healthy-P95 baseline. Keeps the service from normalizing
///   degraded latency.
/// - *Latency gradient*: how far the recent mean exceeds the bare-minimum
///   processing time. A leading indicator of queue buildup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Number of recent latencies kept for scoring.
    pub window_size: usize,
    /// Below this sample count the score is 0 (cold start).
    pub min_samples: usize,
    /// Healthy P95 SLO in seconds; drifts toward the measured P95 via EMA.
    pub p95_baseline: f64,
    /// Bare-minimum processing time in seconds.
    pub min_latency: f64,
    /// Base retry delay in seconds for the `backpressure` strategy.
    pub min_retry_delay: f64,
    /// Maximum additional penalty in seconds at full stress.
    pub max_retry_penalty: f64,
    /// Excess-ratio divisor: how quickly the gradient component saturates.
    pub gradient_sensitivity: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            window_size: 100,
            min_samples: 1,
            p95_baseline: 0.2,
            min_latency: 0.05,
            min_retry_delay: 1.0,
            max_retry_penalty: 15.0,
            gradient_sensitivity: 2.0,
        }
    }
}

impl BackpressureConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::msg("zero backpressure window size"));
        }
        if self.min_samples == 0 {
            return Err(Error::msg("zero min_samples"));
        }
        if self.p95_baseline <= 0.0 {
            return Err(Error::msg("non-positive p95_baseline"));
        }
        if self.min_latency <= 0.0 {
            return Err(Error::msg("non-positive min_latency"));
        }
        if self.min_retry_delay < 0.0 || self.max_retry_penalty < 0.0 {
            return Err(Error::msg("negative retry delay parameter"));
        }
        if self.gradient_sensitivity <= 0.0 {
            return Err(Error::msg("non-positive gradient_sensitivity"));
        }
        Ok(())
    }
}

impl fmt::Display for BackpressureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

#[derive(Debug)]
struct TrackerState {
    window: LatencyWindow,
    baseline: f64,
    samples_since_adapt: usize,
}

/// `BackpressureTracker` scores system stress in `[0, 1]` from a sliding
/// window of completion latencies.
#[derive(Debug)]
pub struct BackpressureTracker {
    config: BackpressureConfig,
    state: Mutex<TrackerState>,
}

impl BackpressureTracker {
    pub fn new(config: BackpressureConfig) -> Self {
        BackpressureTracker {
            state: Mutex::new(TrackerState {
                window: LatencyWindow::new(config.window_size),
                baseline: config.p95_baseline,
                samples_since_adapt: 0,
            }),
            config,
        }
    }

    /// Record one completed-operation latency.
    ///
    /// Every `window_size` samples, once the window is full, the baseline
    /// drifts toward the measured P95: `b <- 0.95*b + 0.05*p95`. The slow
    /// blend keeps the baseline frozen during short stress episodes while
    /// tracking genuine long-term shifts of the service's latency profile.
    pub fn record_latency(&self, latency_secs: f64) {
        let mut state = self.state.lock().unwrap();
        state.window.push(latency_secs);
        state.samples_since_adapt += 1;
        if state.samples_since_adapt >= self.config.window_size && state.window.is_full() {
            if let Some(p95) = state.window.quantile(0.95) {
                state.baseline = BASELINE_KEEP * state.baseline + BASELINE_BLEND * p95;
            }
            state.samples_since_adapt = 0;
        }
    }

    /// Current stress score in `[0, 1]`; 0 while below `min_samples`.
    pub fn score(&self) -> f64 {
        let state = self.state.lock().unwrap();
        if state.window.len() < self.config.min_samples {
            return 0.0;
        }
        let p95_component =
            state.window.count_over(state.baseline) as f64 / state.window.len() as f64;
        let gradient_component = match state.window.mean() {
            Some(mean) => ((mean - self.config.min_latency)
                / (self.config.min_latency * self.config.gradient_sensitivity))
                .clamp(0.0, 1.0),
            None => 0.0,
        };
        p95_component.max(gradient_component).clamp(0.0, 1.0)
    }

    /// The current (possibly drifted) P95 baseline.
    pub fn baseline(&self) -> f64 {
        self.state.lock().unwrap().baseline
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().unwrap().window.len()
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Drop every sample and restore the configured baseline.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.window.clear();
        state.baseline = self.config.p95_baseline;
        state.samples_since_adapt = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tracker(config: BackpressureConfig) -> BackpressureTracker {
        config.is_valid().unwrap();
        BackpressureTracker::new(config)
    }

    #[test]
    fn cold_start_scores_zero() {
        let t = tracker(BackpressureConfig {
            min_samples: 5,
            ..Default::default()
        });
        for _ in 0..4 {
            t.record_latency(10.0);
        }
        assert_eq!(t.score(), 0.0);
        t.record_latency(10.0);
        assert!(t.score() > 0.0);
    }

    #[test]
    fn saturated_window_scores_one() {
        let t = tracker(BackpressureConfig {
            p95_baseline: 0.1,
            ..Default::default()
        });
        for _ in 0..100 {
            t.record_latency(0.2);
        }
        assert_eq!(t.score(), 1.0);
    }

    #[test]
    fn healthy_latencies_score_zero() {
        let t = tracker(BackpressureConfig::default());
        for _ in 0..100 {
            t.record_latency(0.03);
        }
        // below both the baseline and the minimum latency
        assert_eq!(t.score(), 0.0);
    }

    #[test]
    fn gradient_component_rises_with_mean() {
        let t = tracker(BackpressureConfig {
            p95_baseline: 10.0, // keep the P95 component quiet
            min_latency: 0.05,
            gradient_sensitivity: 2.0,
            ..Default::default()
        });
        for _ in 0..10 {
            t.record_latency(0.1);
        }
        // excess ratio = (0.1 - 0.05) / 0.05 = 1.0, divided by sensitivity 2.0
        let score = t.score();
        assert!((score - 0.5).abs() < 1e-9, "score = {}", score);
    }

    #[test]
    fn baseline_drifts_by_ema_once_per_window() {
        let config = BackpressureConfig {
            window_size: 10,
            p95_baseline: 0.1,
            ..Default::default()
        };
        let t = tracker(config);
        for _ in 0..10 {
            t.record_latency(0.3);
        }
        let drifted = t.baseline();
        assert!((drifted - (0.95 * 0.1 + 0.05 * 0.3)).abs() < 1e-9);
        // no further drift until another full window elapses
        t.record_latency(0.3);
        assert_eq!(t.baseline(), drifted);
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let t = tracker(BackpressureConfig {
            min_latency: 0.001,
            ..Default::default()
        });
        for _ in 0..100 {
            t.record_latency(100.0);
        }
        assert_eq!(t.score(), 1.0);
        t.reset();
        assert_eq!(t.score(), 0.0);
        assert_eq!(t.sample_count(), 0);
    }
}

use std::collections::VecDeque;

/// `LatencyWindow` is a fixed-size FIFO of the most recent completed-operation
/// latencies (in seconds). Once full, each push evicts the oldest sample.
#[derive(Debug)]
pub struct LatencyWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        LatencyWindow {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Record one latency. Non-positive samples are dropped; a latency of zero
    /// carries no signal and negative values are clock artifacts.
    pub fn push(&mut self, latency_secs: f64) {
        if latency_secs <= 0.0 || !latency_secs.is_finite() {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_secs);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().cloned().fold(None, |acc, l| {
            Some(acc.map_or(l, |m: f64| m.max(l)))
        })
    }

    /// Nearest-rank quantile, `q` in `(0, 1]`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().cloned().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = (q * sorted.len() as f64).ceil() as usize;
        let idx = rank.clamp(1, sorted.len()) - 1;
        Some(sorted[idx])
    }

    /// Count of samples strictly above `threshold`.
    pub fn count_over(&self, threshold: f64) -> usize {
        self.samples.iter().filter(|&&l| l > threshold).count()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

use super::TokenBucket;
use crate::stat::BackpressureConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Strategy for computing the `Retry-After` advice attached to a rejection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryAfterStrategy {
    /// Wait exactly until the next full token: `(1 - tokens) / refill_rate`.
    /// Predictable and efficient, but lets every rejected client retry at the
    /// same instant and allows the bucket to be drained to empty.
    Fixed,
    /// Scale the wait with how empty the bucket is:
    /// `min_retry_delay + max_retry_penalty * (1 - tokens/bucket_size)`.
    /// Slows clients down progressively before the bucket is depleted.
    Utilization,
    /// Fold the latency-derived stress score into the wait:
    /// `max(min_retry_delay, base + max_retry_penalty * b) * jitter`
    /// with `jitter ~ Uniform(0.8, 1.2)`. The jitter spreads retries out so a
    /// synchronized herd cannot form.
    Backpressure,
}

impl Default for RetryAfterStrategy {
    fn default() -> RetryAfterStrategy {
        RetryAfterStrategy::Backpressure
    }
}

impl RetryAfterStrategy {
    /// Seconds a rejected caller should wait. `bucket` is the bucket that
    /// refused the debit, already refilled to the rejection instant.
    pub(crate) fn retry_after_secs(
        &self,
        bucket: &TokenBucket,
        params: &BackpressureConfig,
        backpressure: f64,
    ) -> f64 {
        match self {
            RetryAfterStrategy::Fixed => bucket.time_until_next_token(),
            RetryAfterStrategy::Utilization => {
                let fill = (bucket.tokens() / bucket.bucket_size()).clamp(0.0, 1.0);
                params.min_retry_delay + params.max_retry_penalty * (1.0 - fill)
            }
            RetryAfterStrategy::Backpressure => {
                let base = bucket.time_until_next_token();
                let penalty = params.max_retry_penalty * backpressure;
                let jitter = rand::thread_rng().gen_range(0.8..1.2);
                (base + penalty).max(params.min_retry_delay) * jitter
            }
        }
    }
}

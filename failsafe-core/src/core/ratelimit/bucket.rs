use tokio::time::Instant;

/// `TokenBucket` holds the token-bucket arithmetic for one bucket: the global
/// one or a per-client sub-bucket. It carries no lock of its own; all buckets
/// of a limiter live under the limiter's single state lock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    bucket_size: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket replenishing `max_executions` tokens every
    /// `per_time_secs` seconds, holding at most `bucket_size` tokens.
    pub fn new(max_executions: f64, per_time_secs: f64, bucket_size: f64, now: Instant) -> Self {
        TokenBucket {
            bucket_size,
            refill_rate: max_executions / per_time_secs,
            tokens: bucket_size,
            last_refill: now,
        }
    }

    /// Lazily replenish tokens for the time elapsed since the last refill.
    /// Idempotent: refilling twice at the same instant leaves the same state.
    pub fn refill(&mut self, now: Instant) {
        let delta = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = self.bucket_size.min(self.tokens + delta * self.refill_rate);
        self.last_refill = now;
    }

    /// Debit one token if available. Call [`refill`](Self::refill) first.
    pub fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    #[inline]
    pub fn bucket_size(&self) -> f64 {
        self.bucket_size
    }

    #[inline]
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Seconds until the bucket holds one full token again.
    pub fn time_until_next_token(&self) -> f64 {
        if self.tokens >= 1.0 {
            0.0
        } else {
            (1.0 - self.tokens) / self.refill_rate
        }
    }

    /// Restore the bucket to full, e.g. after a control-plane reset.
    pub fn restore_full(&mut self, now: Instant) {
        self.tokens = self.bucket_size;
        self.last_refill = now;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn burst_drains_then_refills() {
        let mut bucket = TokenBucket::new(2.0, 1.0, 2.0, utils::now());
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
        assert!((bucket.time_until_next_token() - 0.5).abs() < 1e-9);

        tokio::time::advance(Duration::from_millis(500)).await;
        bucket.refill(utils::now());
        assert!((bucket.tokens() - 1.0).abs() < 1e-9);
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_idempotent_at_same_instant() {
        let mut bucket = TokenBucket::new(10.0, 1.0, 5.0, utils::now());
        bucket.try_take();
        tokio::time::advance(Duration::from_millis(100)).await;
        let now = utils::now();
        bucket.refill(now);
        let tokens_once = bucket.tokens();
        bucket.refill(now);
        assert_eq!(bucket.tokens(), tokens_once);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_never_exceed_bucket_size() {
        let mut bucket = TokenBucket::new(100.0, 1.0, 3.0, utils::now());
        tokio::time::advance(Duration::from_secs(60)).await;
        bucket.refill(utils::now());
        assert_eq!(bucket.tokens(), 3.0);
    }
}

use std::time::Duration;
use tokio::time::Instant;

/// Current reading of the monotonic clock.
///
/// Built on the tokio clock rather than `std::time::Instant`: under
/// `tokio::time::pause()` the returned instants only advance with the test
/// clock, so every time-dependent pattern is deterministic in tests.
#[inline]
pub fn now() -> Instant {
    Instant::now()
}

#[inline]
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[inline]
pub async fn sleep_secs_f64(secs: f64) {
    if secs > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }
}

/// Convert fractional seconds to a `Duration`, clamping negatives to zero.
#[inline]
pub fn secs_f64(secs: f64) -> Duration {
    if secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negative_seconds_clamp_to_zero() {
        assert_eq!(secs_f64(-1.5), Duration::ZERO);
        assert_eq!(secs_f64(0.25), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn paused_clock_is_monotonic() {
        let before = now();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(now() - before, Duration::from_secs(3));
    }
}

use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

/// Advice attached to a rate-limit rejection: when the caller should retry and
/// how stressed the service currently is.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryAdvice {
    pub retry_after: Duration,
    /// Backpressure score in `[0, 1]` at rejection time.
    pub backpressure: f64,
}

impl RetryAdvice {
    pub fn new(retry_after: Duration, backpressure: f64) -> Self {
        RetryAdvice {
            retry_after,
            backpressure,
        }
    }

    /// `Retry-After` header value: whole seconds, rounded up (RFC 7231).
    pub fn retry_after_header(&self) -> u64 {
        self.retry_after.as_secs_f64().ceil() as u64
    }

    /// `X-RateLimit-Retry-After-Ms` header value.
    pub fn retry_after_ms(&self) -> u64 {
        self.retry_after.as_secs_f64().mul_add(1000.0, 0.5) as u64
    }
}

/// `FailsafeError` is the guard-level error taxonomy. Each guard surfaces only
/// its own variant or transparently propagates the guarded operation's error
/// through `Inner`.
#[derive(Debug, Clone, PartialEq)]
pub enum FailsafeError<E> {
    /// The token bucket rejected the call. Carries retry advice for the caller.
    RateLimitExceeded(RetryAdvice),
    /// The circuit breaker is `Failing` (or denied a probe while `Recovering`).
    CircuitBreakerOpen,
    /// Concurrency limit reached and the wait queue is full.
    BulkheadFull,
    /// The retry budget is exhausted; carries the final underlying error.
    AttemptsExceeded { attempts: u32, last: E },
    /// The guarded operation exceeded its deadline.
    Timeout(Duration),
    /// No hedged attempt completed within the overall budget.
    HedgeTimeout(Duration),
    /// The fail-fast guard is tripped.
    FailFastOpen,
    /// The feature toggle routes this call away.
    FeatureDisabled,
    /// The guarded operation itself failed.
    Inner(E),
}

impl<E> FailsafeError<E> {
    /// True when the error was raised by a guard rather than the operation.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            FailsafeError::Inner(_) | FailsafeError::AttemptsExceeded { .. }
        )
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            FailsafeError::Inner(e) | FailsafeError::AttemptsExceeded { last: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// A rejection raised by a gate check that never touches user code, e.g.
/// `CircuitBreaker::try_pass` or `Bulkhead::acquire`.
pub type Rejection = FailsafeError<Infallible>;

impl Rejection {
    /// Re-type a gate rejection so it can flow through a guard that is generic
    /// over the operation's error type.
    pub fn widen<E>(self) -> FailsafeError<E> {
        match self {
            FailsafeError::RateLimitExceeded(advice) => FailsafeError::RateLimitExceeded(advice),
            FailsafeError::CircuitBreakerOpen => FailsafeError::CircuitBreakerOpen,
            FailsafeError::BulkheadFull => FailsafeError::BulkheadFull,
            FailsafeError::Timeout(d) => FailsafeError::Timeout(d),
            FailsafeError::HedgeTimeout(d) => FailsafeError::HedgeTimeout(d),
            FailsafeError::FailFastOpen => FailsafeError::FailFastOpen,
            FailsafeError::FeatureDisabled => FailsafeError::FeatureDisabled,
            FailsafeError::AttemptsExceeded { last, .. } | FailsafeError::Inner(last) => {
                match last {}
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for FailsafeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailsafeError::RateLimitExceeded(advice) => write!(
                f,
                "rate limit exceeded, retry after {}ms",
                advice.retry_after_ms()
            ),
            FailsafeError::CircuitBreakerOpen => write!(f, "circuit breaker open"),
            FailsafeError::BulkheadFull => write!(f, "concurrency limit reached"),
            FailsafeError::AttemptsExceeded { attempts, last } => {
                write!(f, "all {} attempts failed, last error: {}", attempts, last)
            }
            FailsafeError::Timeout(elapsed) => {
                write!(f, "operation timed out after {:?}", elapsed)
            }
            FailsafeError::HedgeTimeout(budget) => {
                write!(f, "no hedged attempt completed within {:?}", budget)
            }
            FailsafeError::FailFastOpen => write!(f, "fail-fast open"),
            FailsafeError::FeatureDisabled => write!(f, "feature disabled"),
            FailsafeError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for FailsafeError<E> {}

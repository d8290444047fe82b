use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `PatternKind` identifies the protective behavior a pattern implements.
/// Together with the instance name it forms the process-wide identity
/// `(kind, name)` used by the registry and the control plane.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    RateLimit,
    CircuitBreaker,
    Bulkhead,
    Retry,
    Timeout,
    Hedge,
    Fallback,
    FailFast,
    FeatureToggle,
    Cache,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::RateLimit => "ratelimit",
            PatternKind::CircuitBreaker => "circuitbreaker",
            PatternKind::Bulkhead => "bulkhead",
            PatternKind::Retry => "retry",
            PatternKind::Timeout => "timeout",
            PatternKind::Hedge => "hedge",
            PatternKind::Fallback => "fallback",
            PatternKind::FailFast => "failfast",
            PatternKind::FeatureToggle => "featuretoggle",
            PatternKind::Cache => "cache",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ratelimit" => Ok(PatternKind::RateLimit),
            "circuitbreaker" => Ok(PatternKind::CircuitBreaker),
            "bulkhead" => Ok(PatternKind::Bulkhead),
            "retry" => Ok(PatternKind::Retry),
            "timeout" => Ok(PatternKind::Timeout),
            "hedge" => Ok(PatternKind::Hedge),
            "fallback" => Ok(PatternKind::Fallback),
            "failfast" => Ok(PatternKind::FailFast),
            "featuretoggle" => Ok(PatternKind::FeatureToggle),
            "cache" => Ok(PatternKind::Cache),
            other => Err(crate::Error::msg(format!("unknown pattern kind: {}", other))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for kind in [
            PatternKind::RateLimit,
            PatternKind::CircuitBreaker,
            PatternKind::Bulkhead,
            PatternKind::Retry,
            PatternKind::Timeout,
            PatternKind::Hedge,
            PatternKind::Fallback,
            PatternKind::FailFast,
            PatternKind::FeatureToggle,
            PatternKind::Cache,
        ] {
            assert_eq!(kind.as_str().parse::<PatternKind>().unwrap(), kind);
        }
        assert!("nope".parse::<PatternKind>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PatternKind::CircuitBreaker).unwrap(),
            "\"circuitbreaker\""
        );
    }
}

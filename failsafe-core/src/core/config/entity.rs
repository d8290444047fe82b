use super::constant::*;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppConfig {
    // app_name represents the name of the current running service.
    pub app_name: String,
    // URL prefix under which the control plane endpoints are mounted.
    pub control_plane_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            app_name: DEFAULT_APP_NAME.into(),
            control_plane_prefix: DEFAULT_CONTROL_PLANE_PREFIX.into(),
        }
    }
}

// ExporterConfig represents exporter settings
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExporterConfig {
    pub addr: String,
    pub metrics_path: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        ExporterConfig {
            addr: EXPORTER_ADDR.into(),
            metrics_path: EXPORTER_METRICS_PATH.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: DEFAULT_LOG_LEVEL.into(),
        }
    }
}

/// Per-pattern parameter maps keyed `{kind} -> {name} -> parameters`.
///
/// The parameter payload mirrors the constructor config of the pattern kind;
/// unknown keys are ignored when the payload is applied. A `default` entry per
/// kind applies to every instance without an exact-name entry.
pub type PatternConfigMap = HashMap<String, HashMap<String, serde_json::Value>>;

// FailsafeConfig represents the general configuration of failsafe.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct FailsafeConfig {
    pub app: AppConfig,
    pub log: LogConfig,
    pub exporter: ExporterConfig,
    pub patterns: PatternConfigMap,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConfigEntity {
    pub version: String,
    pub config: FailsafeConfig,
}

impl Default for ConfigEntity {
    fn default() -> Self {
        ConfigEntity {
            version: FAILSAFE_VERSION.into(),
            config: FailsafeConfig::default(),
        }
    }
}

impl ConfigEntity {
    pub fn new() -> Self {
        ConfigEntity::default()
    }

    pub fn check(&self) -> Result<()> {
        if self.version.is_empty() {
            return Err(Error::msg("empty version"));
        }
        if self.config.app.app_name.is_empty() {
            return Err(Error::msg("empty app name"));
        }
        if !self.config.app.control_plane_prefix.starts_with('/') {
            return Err(Error::msg("control plane prefix must start with '/'"));
        }
        Ok(())
    }
}

impl fmt::Display for ConfigEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_pass_check() {
        let entity = ConfigEntity::new();
        assert!(entity.check().is_ok());
        assert_eq!(entity.config.app.control_plane_prefix, "/failsafe");
    }

    #[test]
    fn invalid_prefix_rejected() {
        let mut entity = ConfigEntity::new();
        entity.config.app.control_plane_prefix = "failsafe".into();
        assert!(entity.check().is_err());
    }

    #[test]
    fn pattern_map_round_trips_from_yaml() {
        let yaml = r#"
version: "0.1.0"
config:
  app:
    app_name: orders
  patterns:
    ratelimit:
      default:
        max_executions: 100
        per_time_secs: 60
      checkout:
        max_executions: 10
        per_time_secs: 1
        retry_after_strategy: backpressure
"#;
        let entity: ConfigEntity = serde_yaml::from_str(yaml).unwrap();
        assert!(entity.check().is_ok());
        let checkout = &entity.config.patterns["ratelimit"]["checkout"];
        assert_eq!(checkout["max_executions"], 10);
        assert_eq!(checkout["retry_after_strategy"], "backpressure");
    }
}

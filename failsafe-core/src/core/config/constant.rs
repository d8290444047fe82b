pub const FAILSAFE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_APP_NAME: &str = "unknown_service";

// config file resolution
pub const CONFIG_FILENAME: &str = "failsafe.yaml";
pub const CONF_FILE_PATH_ENV_KEY: &str = "FAILSAFE_CONFIG_FILE";
pub const APP_NAME_ENV_KEY: &str = "FAILSAFE_APP_NAME";

pub const DEFAULT_LOG_LEVEL: &str = "info";

// exporter defaults
pub const EXPORTER_ADDR: &str = "127.0.0.1:9091";
pub const EXPORTER_METRICS_PATH: &str = "metrics";

pub const DEFAULT_CONTROL_PLANE_PREFIX: &str = "/failsafe";

/// Fallback name for pattern configuration lookup: `patterns.{kind}.default`
/// applies to every instance of a kind without an exact-name entry.
pub const DEFAULT_PATTERN_CONFIG_KEY: &str = "default";

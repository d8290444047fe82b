use super::{constant::*, ConfigEntity};
use crate::{logging, utils, Error, Result};
use lazy_static::lazy_static;
use std::env;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;
use std::sync::RwLock;

lazy_static! {
    static ref GLOBAL_CONFIG: RwLock<ConfigEntity> = RwLock::new(ConfigEntity::new());
}

pub fn reset_global_config(entity: ConfigEntity) {
    *GLOBAL_CONFIG.write().unwrap() = entity;
}

/// Load configuration from environment variables only, keeping defaults for
/// everything undefined. Resolves the config file path from
/// `FAILSAFE_CONFIG_FILE` if present.
pub fn init_config_from_env() -> Result<()> {
    let config_path = env::var(CONF_FILE_PATH_ENV_KEY).unwrap_or_else(|_| CONFIG_FILENAME.into());
    init_config_with_yaml(&config_path)
}

// init_config_with_yaml loads general configuration from the YAML file under the provided path.
pub fn init_config_with_yaml(config_path: &str) -> Result<()> {
    // Priority: system environment > YAML file > default config
    load_global_config_from_yaml_file(config_path)?;
    override_items_from_system_env()?;
    #[cfg(feature = "logger_env")]
    logging::logger_init();
    Ok(())
}

pub fn init_config_with_entity(entity: ConfigEntity) -> Result<()> {
    entity.check()?;
    reset_global_config(entity);
    override_items_from_system_env()?;
    #[cfg(feature = "logger_env")]
    logging::logger_init();
    Ok(())
}

fn load_global_config_from_yaml_file(path_str: &str) -> Result<()> {
    let path = Path::new(path_str);
    if path_str == CONFIG_FILENAME && !path.exists() {
        // The default file is optional; keep the default config.
        return Ok(());
    }
    if !path.exists() {
        return Err(Error::msg("failsafe YAML configuration file does not exist"));
    }
    let mut file = File::open(path)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    let entity: ConfigEntity = serde_yaml::from_str(&content)?;
    entity.check()?;
    logging::info!("[Config] Resolving failsafe config from file, file {}", path_str);
    reset_global_config(entity);
    Ok(())
}

fn override_items_from_system_env() -> Result<()> {
    if let Ok(app_name) = env::var(APP_NAME_ENV_KEY) {
        if !utils::is_blank(&app_name) {
            let mut cfg = GLOBAL_CONFIG.write().unwrap();
            cfg.config.app.app_name = app_name;
            cfg.check()?;
        }
    }
    Ok(())
}

#[inline]
pub fn app_name() -> String {
    GLOBAL_CONFIG.read().unwrap().config.app.app_name.clone()
}

#[inline]
pub fn control_plane_prefix() -> String {
    GLOBAL_CONFIG
        .read()
        .unwrap()
        .config
        .app
        .control_plane_prefix
        .clone()
}

#[inline]
pub fn exporter_addr() -> String {
    GLOBAL_CONFIG.read().unwrap().config.exporter.addr.clone()
}

#[inline]
pub fn exporter_metrics_path() -> String {
    GLOBAL_CONFIG
        .read()
        .unwrap()
        .config
        .exporter
        .metrics_path
        .clone()
}

/// Resolve the configured parameter payload for `(kind, name)`.
///
/// Lookup order: exact name, then the kind's `default` entry. Returns `None`
/// when neither is configured; constructors then rely on their own defaults.
pub fn pattern_config(kind: &str, name: &str) -> Option<serde_json::Value> {
    let cfg = GLOBAL_CONFIG.read().unwrap();
    let per_kind = cfg.config.patterns.get(kind)?;
    per_kind
        .get(name)
        .or_else(|| per_kind.get(DEFAULT_PATTERN_CONFIG_KEY))
        .cloned()
}

/// Deserialize the configured payload for `(kind, name)` into a pattern
/// config type. Missing fields take the type's defaults; unknown keys are
/// ignored; a malformed payload is logged and replaced by the defaults.
pub fn resolve_pattern_config<T>(kind: &str, name: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match pattern_config(kind, name) {
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            logging::warn!(
                "[Config] Ignoring malformed config for {}:{}, reason: {}",
                kind,
                name,
                e
            );
            T::default()
        }),
        None => T::default(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn pattern_lookup_prefers_exact_name() {
        let mut entity = ConfigEntity::new();
        let mut per_kind = HashMap::new();
        per_kind.insert(
            "default".to_owned(),
            serde_json::json!({"max_executions": 100.0}),
        );
        per_kind.insert(
            "checkout".to_owned(),
            serde_json::json!({"max_executions": 10.0}),
        );
        entity
            .config
            .patterns
            .insert("ratelimit".to_owned(), per_kind);
        reset_global_config(entity);

        let exact = pattern_config("ratelimit", "checkout").unwrap();
        assert_eq!(exact["max_executions"], 10.0);
        let fallback = pattern_config("ratelimit", "search").unwrap();
        assert_eq!(fallback["max_executions"], 100.0);
        assert!(pattern_config("retry", "search").is_none());

        let resolved: crate::ratelimit::RateLimitConfig =
            resolve_pattern_config("ratelimit", "checkout");
        assert_eq!(resolved.max_executions, 10.0);
        // unspecified fields keep their defaults
        assert_eq!(resolved.per_time_secs, 60.0);
        let unconfigured: crate::retry::RetryConfig = resolve_pattern_config("retry", "search");
        assert_eq!(unconfigured.attempts, 3);

        reset_global_config(ConfigEntity::new());
    }
}

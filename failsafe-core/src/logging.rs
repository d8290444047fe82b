use cfg_if::cfg_if;
pub use log::{debug, error, info, trace, warn};

cfg_if! {
    if #[cfg(feature = "logger_env")] {
        use crate::config::constant::DEFAULT_LOG_LEVEL;
        pub fn logger_init() {
            let _ = env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or(DEFAULT_LOG_LEVEL),
            )
            .is_test(cfg!(test))
            .try_init();
        }
    } else {
        pub fn logger_init() {}
    }
}

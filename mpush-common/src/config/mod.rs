//! Configuration for mpush.
//!
//! - `deploy.toml` project file ([`DeployConfig`])
//! - `MPUSH_*` environment overrides ([`EnvParser`])
//! - Source tracking for every resolved value ([`Sourced`])

pub mod env;
pub mod model;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use model::{
    CONFIG_FILE_NAME, CliOverrides, ConfigError, ConfigOrigin, DEFAULT_CONFIG, DeployConfig,
    DeploySection, DeviceSection, Settings, TransferSection,
};
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock, PoisonError};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

//! The `deploy.toml` project file and the resolved run settings.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::env::{EnvError, EnvParser};
use super::source::Sourced;
use crate::errors::ErrorCode;
use crate::plan::{MIN_MAX_CHUNK_SOURCE, PlanOptions};
use crate::retry::RetryPolicy;
use crate::session::{SessionConfig, Timeouts};

/// Default config file name.
pub const CONFIG_FILE_NAME: &str = "deploy.toml";

/// Contents written by `mpush init`.
pub const DEFAULT_CONFIG: &str = r#"# mpush project configuration

[device]
port = "/dev/ttyACM0"
baud = 115200

[deploy]
# Glob patterns, relative to the directory holding this file.
files = ["**/*.py"]
# Matches are cross-compiled with mpy-cross and uploaded as .mpy.
compile = []
# Remote directory the files are placed under.
target_root = "/"
# Wipe target_root before writing.
clean = false

[transfer]
# Upper bound on the generated source of one chunk write, in bytes.
max_chunk_source = 2048
command_timeout_ms = 5000
write_timeout_per_kib_ms = 1000
delete_timeout_ms = 30000
banner_timeout_ms = 2000
raw_entry_attempts = 3
retries = 2
raw_paste = true
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("refusing to overwrite existing {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid environment: {}", join(.0))]
    Env(Vec<EnvError>),

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

fn join(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::ConfigNotFound,
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::AlreadyExists { .. } | Self::Write { .. } => ErrorCode::ConfigWriteError,
            Self::Env(_) => ErrorCode::ConfigEnvError,
            Self::Invalid(_) => ErrorCode::ConfigValidationError,
        }
    }
}

/// Parsed `deploy.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeployConfig {
    pub device: DeviceSection,
    pub deploy: DeploySection,
    pub transfer: TransferSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSection {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
        }
    }
}

fn default_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud() -> u32 {
    115_200
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploySection {
    #[serde(default = "default_files")]
    pub files: Vec<String>,
    #[serde(default)]
    pub compile: Vec<String>,
    #[serde(default = "default_target_root")]
    pub target_root: String,
    #[serde(default)]
    pub clean: bool,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            files: default_files(),
            compile: Vec::new(),
            target_root: default_target_root(),
            clean: false,
        }
    }
}

fn default_files() -> Vec<String> {
    vec!["**/*.py".to_string()]
}

fn default_target_root() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferSection {
    #[serde(default = "default_max_chunk_source")]
    pub max_chunk_source: usize,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_write_timeout_per_kib_ms")]
    pub write_timeout_per_kib_ms: u64,
    #[serde(default = "default_delete_timeout_ms")]
    pub delete_timeout_ms: u64,
    #[serde(default = "default_banner_timeout_ms")]
    pub banner_timeout_ms: u64,
    #[serde(default = "default_raw_entry_attempts")]
    pub raw_entry_attempts: u32,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_true")]
    pub raw_paste: bool,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            max_chunk_source: default_max_chunk_source(),
            command_timeout_ms: default_command_timeout_ms(),
            write_timeout_per_kib_ms: default_write_timeout_per_kib_ms(),
            delete_timeout_ms: default_delete_timeout_ms(),
            banner_timeout_ms: default_banner_timeout_ms(),
            raw_entry_attempts: default_raw_entry_attempts(),
            retries: default_retries(),
            raw_paste: true,
        }
    }
}

fn default_max_chunk_source() -> usize {
    crate::plan::DEFAULT_MAX_CHUNK_SOURCE
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_per_kib_ms() -> u64 {
    1_000
}

fn default_delete_timeout_ms() -> u64 {
    30_000
}

fn default_banner_timeout_ms() -> u64 {
    2_000
}

fn default_raw_entry_attempts() -> u32 {
    3
}

fn default_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

impl DeployConfig {
    /// Read and parse `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_origin(path).map(|(config, _)| config)
    }

    /// Like [`DeployConfig::load`], also recording which keys the file set.
    pub fn load_with_origin(path: &Path) -> Result<(Self, ConfigOrigin), ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse_with_origin(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        Self::parse_with_origin(text, path).map(|(config, _)| config)
    }

    pub fn parse_with_origin(text: &str, path: &Path) -> Result<(Self, ConfigOrigin), ConfigError> {
        let parse_error = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let config: Self = toml::from_str(text).map_err(parse_error)?;
        let table: toml::Table = toml::from_str(text).map_err(parse_error)?;
        let keys = table
            .iter()
            .filter_map(|(section, value)| Some((section, value.as_table()?)))
            .flat_map(|(section, entries)| entries.keys().map(move |key| format!("{section}.{key}")))
            .collect();
        Ok((
            config,
            ConfigOrigin {
                path: path.to_path_buf(),
                keys,
            },
        ))
    }

    /// Write [`DEFAULT_CONFIG`] to `path`; never overwrites.
    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    ConfigError::AlreadyExists {
                        path: path.to_path_buf(),
                    }
                } else {
                    ConfigError::Write {
                        path: path.to_path_buf(),
                        source,
                    }
                }
            })?;
        file.write_all(DEFAULT_CONFIG.as_bytes())
            .map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Values given on the command line; they beat every other layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<String>,
    pub baud: Option<u32>,
}

/// The file a [`DeployConfig`] came from and the `section.key` names it set.
///
/// Keys the file left out were filled by serde defaults and are reported as
/// defaults, not as file values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOrigin {
    pub path: PathBuf,
    keys: BTreeSet<String>,
}

impl ConfigOrigin {
    /// Whether the file set `key` (e.g. `transfer.retries`).
    pub fn sets(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

/// Effective settings for one run: defaults < file < environment < CLI.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: Sourced<String>,
    pub baud: Sourced<u32>,
    pub max_chunk_source: Sourced<usize>,
    pub retries: Sourced<u32>,
    pub command_timeout_ms: Sourced<u64>,
    pub raw_paste: Sourced<bool>,
    pub deploy: DeploySection,
    pub transfer: TransferSection,
}

impl Settings {
    /// Layer environment and CLI values over `config` and validate the result.
    ///
    /// `origin` describes the file `config` was read from, if any.
    pub fn resolve(
        config: DeployConfig,
        origin: Option<&ConfigOrigin>,
        cli: CliOverrides,
    ) -> Result<Self, ConfigError> {
        let t = &config.transfer;
        let mut env = EnvParser::new();

        let port = env
            .get_string("PORT", &config.device.port)
            .or_layer(layered(origin, "device.port", config.device.port.clone()))
            .override_cli(cli.port);
        let baud = env
            .get_u32_range("BAUD", config.device.baud, 300, 4_000_000)
            .or_layer(layered(origin, "device.baud", config.device.baud))
            .override_cli(cli.baud);
        let max_chunk_source = env
            .get_u64_range("CHUNK_SOURCE", t.max_chunk_source as u64, 0, 1 << 20)
            .map(|n| n as usize)
            .or_layer(layered(origin, "transfer.max_chunk_source", t.max_chunk_source));
        let retries = env
            .get_u32_range("RETRIES", t.retries, 0, 100)
            .or_layer(layered(origin, "transfer.retries", t.retries));
        let command_timeout_ms = env
            .get_u64_range("COMMAND_TIMEOUT_MS", t.command_timeout_ms, 0, 3_600_000)
            .or_layer(layered(origin, "transfer.command_timeout_ms", t.command_timeout_ms));
        let raw_paste = env
            .get_bool("RAW_PASTE", t.raw_paste)
            .or_layer(layered(origin, "transfer.raw_paste", t.raw_paste));

        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }

        let settings = Self {
            port,
            baud,
            max_chunk_source,
            retries,
            command_timeout_ms,
            raw_paste,
            deploy: config.deploy,
            transfer: config.transfer,
        };
        settings.validate()?;
        settings.log_sources();
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.max_chunk_source.value < MIN_MAX_CHUNK_SOURCE {
            problems.push(format!(
                "max_chunk_source must be at least {MIN_MAX_CHUNK_SOURCE}, got {}",
                self.max_chunk_source.value
            ));
        }
        if self.transfer.raw_entry_attempts == 0 {
            problems.push("raw_entry_attempts must be at least 1".to_string());
        }
        let t = &self.transfer;
        for (name, value) in [
            ("command_timeout_ms", self.command_timeout_ms.value),
            ("write_timeout_per_kib_ms", t.write_timeout_per_kib_ms),
            ("delete_timeout_ms", t.delete_timeout_ms),
            ("banner_timeout_ms", t.banner_timeout_ms),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than zero"));
            }
        }
        if !self.deploy.target_root.starts_with('/') {
            problems.push(format!(
                "target_root must be an absolute remote path, got {:?}",
                self.deploy.target_root
            ));
        }
        if self.port.value.trim().is_empty() {
            problems.push("device port must not be empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    fn log_sources(&self) {
        debug!(port = %self.port, baud = %self.baud, "device settings");
        debug!(
            max_chunk_source = %self.max_chunk_source,
            retries = %self.retries,
            command_timeout_ms = %self.command_timeout_ms,
            raw_paste = %self.raw_paste,
            "transfer settings"
        );
    }

    pub fn session_config(&self) -> SessionConfig {
        let t = &self.transfer;
        SessionConfig {
            timeouts: Timeouts {
                banner: Duration::from_millis(t.banner_timeout_ms),
                command: Duration::from_millis(self.command_timeout_ms.value),
                write_per_kib: Duration::from_millis(t.write_timeout_per_kib_ms),
                delete: Duration::from_millis(t.delete_timeout_ms),
            },
            raw_entry_attempts: t.raw_entry_attempts,
            raw_paste: self.raw_paste.value,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retries.value,
            ..RetryPolicy::default()
        }
    }

    /// Plan options; `clean` wipes `target_root` first.
    pub fn plan_options(&self, clean: bool) -> PlanOptions {
        PlanOptions {
            max_chunk_source: self.max_chunk_source.value,
            clean_root: clean.then(|| self.deploy.target_root.clone()),
        }
    }
}

fn layered<T>(origin: Option<&ConfigOrigin>, key: &str, value: T) -> Sourced<T> {
    match origin {
        Some(origin) if origin.sets(key) => Sourced::from_file(value, &origin.path),
        _ => Sourced::default_value(value),
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use crate::config::env_test_lock;

    const VARS: [&str; 6] = [
        "MPUSH_PORT",
        "MPUSH_BAUD",
        "MPUSH_CHUNK_SOURCE",
        "MPUSH_RETRIES",
        "MPUSH_COMMAND_TIMEOUT_MS",
        "MPUSH_RAW_PASTE",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: env-mutating tests are serialized via env_test_lock
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_default_config_text_matches_defaults() {
        let parsed = DeployConfig::parse(DEFAULT_CONFIG, Path::new("deploy.toml")).unwrap();
        assert_eq!(parsed, DeployConfig::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed = DeployConfig::parse(
            "[device]\nport = \"/dev/ttyUSB1\"\n[transfer]\nretries = 5\n",
            Path::new("deploy.toml"),
        )
        .unwrap();
        assert_eq!(parsed.device.port, "/dev/ttyUSB1");
        assert_eq!(parsed.device.baud, 115_200);
        assert_eq!(parsed.transfer.retries, 5);
        assert_eq!(parsed.transfer.max_chunk_source, 2048);
        assert_eq!(parsed.deploy.files, vec!["**/*.py".to_string()]);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = DeployConfig::parse("[transfer]\nchunk = 3\n", Path::new("deploy.toml")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigParseError);
    }

    #[test]
    fn test_write_default_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        DeployConfig::write_default(&path).unwrap();
        assert_eq!(DeployConfig::load(&path).unwrap(), DeployConfig::default());

        let err = DeployConfig::write_default(&path).unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyExists { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DeployConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigNotFound);
    }

    #[test]
    fn test_resolve_layers_env_and_cli() {
        let _guard = env_test_lock();
        clear_env();
        // SAFETY: serialized via env_test_lock
        unsafe {
            std::env::set_var("MPUSH_RETRIES", "4");
            std::env::set_var("MPUSH_PORT", "/dev/ttyUSB0");
        }

        let (config, origin) = DeployConfig::parse_with_origin(
            "[device]\nbaud = 230400\n",
            Path::new("deploy.toml"),
        )
        .unwrap();
        let settings = Settings::resolve(
            config,
            Some(&origin),
            CliOverrides {
                port: Some("/dev/cu.usbmodem1".into()),
                baud: None,
            },
        )
        .unwrap();
        clear_env();

        assert_eq!(settings.retries.value, 4);
        assert_eq!(settings.retries.source, ConfigSource::Environment);
        assert_eq!(settings.port.value, "/dev/cu.usbmodem1");
        assert_eq!(settings.port.source, ConfigSource::Cli);
        assert_eq!(settings.baud.value, 230_400);
        assert_eq!(
            settings.baud.source,
            ConfigSource::File(PathBuf::from("deploy.toml"))
        );
        assert_eq!(settings.retry_policy().max_retries, 4);
    }

    #[test]
    fn test_keys_left_out_of_the_file_report_as_defaults() {
        let _guard = env_test_lock();
        clear_env();
        let (config, origin) = DeployConfig::parse_with_origin(
            "[transfer]\nretries = 5\n",
            Path::new("proj/deploy.toml"),
        )
        .unwrap();
        assert!(origin.sets("transfer.retries"));
        assert!(!origin.sets("transfer.raw_paste"));
        assert!(!origin.sets("device.port"));

        let settings = Settings::resolve(config, Some(&origin), CliOverrides::default()).unwrap();
        assert_eq!(
            settings.retries.source,
            ConfigSource::File(PathBuf::from("proj/deploy.toml"))
        );
        assert_eq!(settings.raw_paste.source, ConfigSource::Default);
        assert_eq!(settings.port.source, ConfigSource::Default);
        assert_eq!(settings.port.value, "/dev/ttyACM0");
    }

    #[test]
    fn test_resolve_reports_env_errors_together() {
        let _guard = env_test_lock();
        clear_env();
        // SAFETY: serialized via env_test_lock
        unsafe {
            std::env::set_var("MPUSH_BAUD", "fast");
            std::env::set_var("MPUSH_RAW_PASTE", "sometimes");
        }
        let err = Settings::resolve(DeployConfig::default(), None, CliOverrides::default()).unwrap_err();
        clear_env();

        match err {
            ConfigError::Env(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected env errors, got {other}"),
        }
    }

    #[test]
    fn test_validation() {
        let _guard = env_test_lock();
        clear_env();
        let mut config = DeployConfig::default();
        config.transfer.max_chunk_source = 100;
        config.transfer.raw_entry_attempts = 0;
        config.transfer.delete_timeout_ms = 0;
        config.deploy.target_root = "app".into();

        let err = Settings::resolve(config, None, CliOverrides::default()).unwrap_err();
        match err {
            ConfigError::Invalid(problems) => assert_eq!(problems.len(), 4, "{problems:?}"),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_session_config_and_plan_options() {
        let _guard = env_test_lock();
        clear_env();
        let settings = Settings::resolve(DeployConfig::default(), None, CliOverrides::default()).unwrap();

        let session = settings.session_config();
        assert_eq!(session.timeouts.command, Duration::from_secs(5));
        assert_eq!(session.timeouts.banner, Duration::from_secs(2));
        assert_eq!(session.raw_entry_attempts, 3);
        assert!(session.raw_paste);

        assert_eq!(settings.plan_options(false).clean_root, None);
        assert_eq!(settings.plan_options(true).clean_root.as_deref(), Some("/"));
    }
}

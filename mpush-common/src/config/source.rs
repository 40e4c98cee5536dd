//! Tracking where each configuration value came from.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// Layer a configuration value was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// The project's deploy.toml.
    File(PathBuf),
    /// An `MPUSH_*` environment variable.
    Environment,
    /// A command-line flag.
    Cli,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::Environment => write!(f, "environment"),
            Self::Cli => write!(f, "command line"),
        }
    }
}

/// A value together with its [`ConfigSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable name when `source` is [`ConfigSource::Environment`].
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            env_var: None,
        }
    }

    pub fn from_file(value: T, path: impl Into<PathBuf>) -> Self {
        Self {
            value,
            source: ConfigSource::File(path.into()),
            env_var: None,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(var.into()),
        }
    }

    pub fn from_cli(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Cli,
            env_var: None,
        }
    }

    pub fn is_env(&self) -> bool {
        self.source == ConfigSource::Environment
    }

    /// Keep `self` if it came from the environment, otherwise use `fallback`.
    pub fn or_layer(self, fallback: Sourced<T>) -> Sourced<T> {
        if self.is_env() { self } else { fallback }
    }

    /// Replace with a command-line value when one was given.
    pub fn override_cli(self, cli: Option<T>) -> Sourced<T> {
        match cli {
            Some(value) => Sourced::from_cli(value),
            None => self,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
            env_var: self.env_var,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Sourced<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "{} (from {})", self.value, var),
            None => write!(f, "{} (from {})", self.value, self.source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layering_precedence() {
        let file = Sourced::from_file(115_200u32, "deploy.toml");
        let env_unset = Sourced::default_value(9600u32);
        let layered = env_unset.or_layer(file.clone());
        assert_eq!(layered, file);

        let env_set = Sourced::from_env(57_600u32, "MPUSH_BAUD");
        let layered = env_set.or_layer(file);
        assert_eq!(layered.value, 57_600);
        assert_eq!(layered.env_var.as_deref(), Some("MPUSH_BAUD"));

        let cli = layered.override_cli(Some(921_600));
        assert_eq!(cli.source, ConfigSource::Cli);
        assert_eq!(cli.value, 921_600);
    }

    #[test]
    fn test_display_names_origin() {
        assert_eq!(
            Sourced::from_env("/dev/ttyUSB0", "MPUSH_PORT").to_string(),
            "/dev/ttyUSB0 (from MPUSH_PORT)"
        );
        assert_eq!(
            Sourced::from_file(3u32, "deploy.toml").to_string(),
            "3 (from file deploy.toml)"
        );
        assert_eq!(Sourced::default_value(true).to_string(), "true (from default)");
    }
}

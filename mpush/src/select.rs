//! Local file selection: glob patterns from `[deploy]` mapped to remote paths.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};
use mpush_common::config::DeploySection;
use mpush_common::{DeploySource, ErrorCode};
use thiserror::Error;
use tracing::debug;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("invalid file pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("no files under {} match {patterns:?}", root.display())]
    NoFiles { root: PathBuf, patterns: Vec<String> },

    #[error("cannot read {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SelectError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidPattern { .. } => ErrorCode::InvalidGlobPattern,
            Self::NoFiles { .. } => ErrorCode::NoFilesSelected,
            Self::Walk { .. } => ErrorCode::LocalReadFailed,
        }
    }
}

/// Expand `deploy.files` under `root`, sorted by relative path.
///
/// Files also matching a `deploy.compile` pattern are flagged for
/// cross-compilation and get a `.mpy` remote name.
pub fn select_sources(root: &Path, deploy: &DeploySection) -> Result<Vec<DeploySource>, SelectError> {
    let compile = deploy
        .compile
        .iter()
        .map(|p| compile_pattern(p))
        .collect::<Result<Vec<_>, _>>()?;

    let escaped_root = Pattern::escape(&root.to_string_lossy());
    let mut found = BTreeMap::new();
    for pattern in &deploy.files {
        let full = format!("{}/{}", escaped_root.trim_end_matches('/'), pattern);
        let paths = glob::glob_with(&full, MATCH_OPTIONS).map_err(|e| SelectError::InvalidPattern {
            pattern: pattern.clone(),
            message: e.msg.to_string(),
        })?;
        for entry in paths {
            let path = entry.map_err(|e| SelectError::Walk {
                path: e.path().to_path_buf(),
                source: e.into_error(),
            })?;
            if !path.is_file() {
                continue;
            }
            // glob may normalize a leading `./` away.
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            found.entry(relative).or_insert(path);
        }
    }

    if found.is_empty() {
        return Err(SelectError::NoFiles {
            root: root.to_path_buf(),
            patterns: deploy.files.clone(),
        });
    }

    let sources = found
        .into_iter()
        .map(|(relative, local_path)| {
            let compiled = compile
                .iter()
                .any(|p| p.matches_path_with(&relative, MATCH_OPTIONS));
            let remote_name = if compiled {
                relative.with_extension("mpy")
            } else {
                relative
            };
            let remote_path = remote_join(&deploy.target_root, &remote_name);
            debug!(local = %local_path.display(), remote = %remote_path, compiled, "selected");
            DeploySource {
                local_path,
                remote_path,
                compile: compiled,
            }
        })
        .collect();
    Ok(sources)
}

fn compile_pattern(pattern: &str) -> Result<Pattern, SelectError> {
    Pattern::new(pattern).map_err(|e| SelectError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.msg.to_string(),
    })
}

/// `target_root` + relative local path, always `/`-separated.
pub fn remote_join(target_root: &str, relative: &Path) -> String {
    let mut remote = target_root.trim_end_matches('/').to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            remote.push('/');
            remote.push_str(&part.to_string_lossy());
        }
    }
    remote
}

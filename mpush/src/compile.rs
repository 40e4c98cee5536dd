//! Turn selected sources into payloads, cross-compiling with `mpy-cross`.

use std::path::{Path, PathBuf};

use mpush_common::{DeployError, DeploySource, ErrorCode, FilePayload};
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Overrides the cross-compiler binary.
pub const MPY_CROSS_ENV: &str = "MPUSH_MPY_CROSS";
const DEFAULT_MPY_CROSS: &str = "mpy-cross";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("cross-compiler '{program}' not found (install mpy-cross or set {MPY_CROSS_ENV})")]
    Missing { program: String },

    #[error("{program} failed on {}: {stderr}", source_path.display())]
    Failed {
        program: String,
        source_path: PathBuf,
        stderr: String,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create scratch directory for {program}: {source}")]
    Scratch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Read(#[from] DeployError),
}

impl CompileError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Missing { .. } => ErrorCode::CompilerMissing,
            Self::Failed { .. } | Self::Spawn { .. } | Self::Scratch { .. } => {
                ErrorCode::CompileFailed
            }
            Self::Read(err) => err.code(),
        }
    }
}

pub fn mpy_cross_program() -> String {
    std::env::var(MPY_CROSS_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MPY_CROSS.to_string())
}

/// Load every source, compiling those flagged for it.
///
/// Compiler output lands in one scratch directory that is removed when the
/// batch finishes, whether or not it succeeded.
pub async fn prepare_payloads(
    sources: &[DeploySource],
    program: &str,
) -> Result<Vec<FilePayload>, CompileError> {
    let mut scratch: Option<TempDir> = None;
    let mut payloads = Vec::with_capacity(sources.len());
    let mut compiled = 0usize;
    for (index, source) in sources.iter().enumerate() {
        let payload = if source.compile {
            let dir = match &mut scratch {
                Some(dir) => dir,
                slot => slot.insert(scratch_dir(program)?),
            };
            let output_path = dir.path().join(format!("{index}.mpy"));
            let data = cross_compile(program, &source.local_path, &output_path).await?;
            compiled += 1;
            FilePayload::new(&source.local_path, source.remote_path.clone(), data)
        } else {
            FilePayload::load(&source.local_path, source.remote_path.clone()).await?
        };
        payloads.push(payload);
    }
    if compiled > 0 {
        info!(compiled, program, "cross-compiled sources");
    }
    Ok(payloads)
}

fn scratch_dir(program: &str) -> Result<TempDir, CompileError> {
    tempfile::Builder::new()
        .prefix("mpush-")
        .tempdir()
        .map_err(|source| CompileError::Scratch {
            program: program.to_string(),
            source,
        })
}

async fn cross_compile(
    program: &str,
    source: &Path,
    output_path: &Path,
) -> Result<Vec<u8>, CompileError> {
    debug!(source = %source.display(), output = %output_path.display(), "mpy-cross");

    let output = Command::new(program)
        .arg("-o")
        .arg(output_path)
        .arg(source)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CompileError::Missing {
                    program: program.to_string(),
                }
            } else {
                CompileError::Spawn {
                    program: program.to_string(),
                    source: err,
                }
            }
        })?;

    if !output.status.success() {
        return Err(CompileError::Failed {
            program: program.to_string(),
            source_path: source.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let data = tokio::fs::read(output_path)
        .await
        .map_err(|err| DeployError::LocalRead {
            path: output_path.display().to_string(),
            source: err,
        })?;
    Ok(data)
}

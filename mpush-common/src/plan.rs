//! Transfer planning: turns the local deployment set into an ordered list of
//! remote operations.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codegen::{RemoteCommand, WriteMode, escaped_len, remote_parent};
use crate::error::DeployError;
use crate::errors::ErrorCode;

/// Default bound on the generated source of one chunk write, in bytes.
pub const DEFAULT_MAX_CHUNK_SOURCE: usize = 2048;

/// Smallest accepted source bound; below this the write template itself
/// leaves too little room for data.
pub const MIN_MAX_CHUNK_SOURCE: usize = 512;

/// One file selected for deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySource {
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Cross-compile before upload.
    pub compile: bool,
}

/// Final bytes for one remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub data: Vec<u8>,
}

impl FilePayload {
    pub fn new(local_path: impl Into<PathBuf>, remote_path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            data,
        }
    }

    /// Read `local_path` from disk.
    pub async fn load(local_path: &Path, remote_path: impl Into<String>) -> Result<Self, DeployError> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|source| DeployError::LocalRead {
                path: local_path.display().to_string(),
                source,
            })?;
        Ok(Self::new(local_path, remote_path, data))
    }
}

/// A slice of a file's content sent as one write command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub offset: u64,
    pub len: usize,
    /// File size on the device once this chunk is written.
    pub expected_len_after: u64,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// One remote operation of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanStep {
    /// Recursive delete of the deploy root (clean mode only).
    Wipe { root: String },
    Mkdir { path: String },
    WriteChunk {
        path: String,
        mode: WriteMode,
        chunk_count: usize,
        chunk: Chunk,
    },
    /// Compare the remote file size with the local payload.
    Verify { path: String, expected_size: u64 },
}

impl PlanStep {
    pub fn command(&self) -> RemoteCommand {
        match self {
            Self::Wipe { root } => RemoteCommand::recursive_delete(root),
            Self::Mkdir { path } => RemoteCommand::mkdir(path),
            Self::WriteChunk {
                path, mode, chunk, ..
            } => RemoteCommand::write_chunk(path, *mode, &chunk.data),
            Self::Verify { path, .. } => RemoteCommand::write_finalize(path),
        }
    }

    /// Remote path the step operates on.
    pub fn path(&self) -> &str {
        match self {
            Self::Wipe { root } => root,
            Self::Mkdir { path } | Self::WriteChunk { path, .. } | Self::Verify { path, .. } => path,
        }
    }

    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            Self::WriteChunk { chunk, .. } => Some(chunk.index),
            _ => None,
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wipe { root } => write!(f, "wipe {root}"),
            Self::Mkdir { path } => write!(f, "mkdir {path}"),
            Self::WriteChunk {
                path,
                chunk_count,
                chunk,
                ..
            } => write!(
                f,
                "write {path} chunk {}/{chunk_count} ({} bytes at {})",
                chunk.index + 1,
                chunk.len,
                chunk.offset
            ),
            Self::Verify {
                path,
                expected_size,
            } => write!(f, "verify {path} ({expected_size} bytes)"),
        }
    }
}

/// Knobs for [`TransferPlan::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOptions {
    /// Upper bound on the rendered source of one chunk write.
    pub max_chunk_source: usize,
    /// Wipe this remote directory before writing.
    pub clean_root: Option<String>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            max_chunk_source: DEFAULT_MAX_CHUNK_SOURCE,
            clean_root: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("remote path {path:?} must be absolute and name a file")]
    InvalidRemotePath { path: String },

    #[error("{path} is targeted by more than one local file")]
    DuplicateTarget { path: String },

    #[error(
        "chunk source budget of {budget} bytes cannot hold the write template for {path} ({overhead} bytes)"
    )]
    ChunkBudget {
        path: String,
        budget: usize,
        overhead: usize,
    },
}

impl PlanError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRemotePath { .. } => ErrorCode::PlanInvalidRemotePath,
            Self::DuplicateTarget { .. } => ErrorCode::PlanDuplicateTarget,
            Self::ChunkBudget { .. } => ErrorCode::PlanChunkBudget,
        }
    }
}

/// Ordered remote operations for one deployment run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferPlan {
    pub steps: Vec<PlanStep>,
    pub file_count: usize,
    pub total_bytes: u64,
}

impl TransferPlan {
    /// Plan the upload of `payloads` in the given order.
    ///
    /// Directories come first (one per unique parent), then each file as a
    /// truncating first chunk, appending later chunks, and a verify step.
    pub fn build(payloads: &[FilePayload], options: &PlanOptions) -> Result<Self, PlanError> {
        let mut steps = Vec::new();
        if let Some(root) = &options.clean_root {
            steps.push(PlanStep::Wipe { root: root.clone() });
        }

        let mut targets = HashSet::new();
        let mut dirs = BTreeSet::new();
        for payload in payloads {
            let path = payload.remote_path.as_str();
            if !path.starts_with('/') || path.ends_with('/') {
                return Err(PlanError::InvalidRemotePath {
                    path: path.to_string(),
                });
            }
            if !targets.insert(path) {
                return Err(PlanError::DuplicateTarget {
                    path: path.to_string(),
                });
            }
            if let Some(parent) = remote_parent(path) {
                dirs.insert(parent.to_string());
            }
        }
        steps.extend(dirs.into_iter().map(|path| PlanStep::Mkdir { path }));

        let mut total_bytes = 0u64;
        for payload in payloads {
            let chunks = split_chunks(&payload.remote_path, &payload.data, options.max_chunk_source)?;
            let chunk_count = chunks.len();
            for chunk in chunks {
                let mode = if chunk.index == 0 {
                    WriteMode::Truncate
                } else {
                    WriteMode::Append
                };
                steps.push(PlanStep::WriteChunk {
                    path: payload.remote_path.clone(),
                    mode,
                    chunk_count,
                    chunk,
                });
            }
            steps.push(PlanStep::Verify {
                path: payload.remote_path.clone(),
                expected_size: payload.data.len() as u64,
            });
            total_bytes += payload.data.len() as u64;
        }

        Ok(Self {
            steps,
            file_count: payloads.len(),
            total_bytes,
        })
    }

    /// Plan consisting of a single recursive delete of `root`.
    pub fn wipe(root: impl Into<String>) -> Self {
        Self {
            steps: vec![PlanStep::Wipe { root: root.into() }],
            file_count: 0,
            total_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Split `data` greedily so each chunk's rendered write command stays within
/// `max_source` bytes. An empty file still gets one (empty) chunk so the
/// remote file is created.
pub fn split_chunks(path: &str, data: &[u8], max_source: usize) -> Result<Vec<Chunk>, PlanError> {
    let overhead = RemoteCommand::write_chunk(path, WriteMode::Truncate, &[])
        .source()
        .len();
    // Room for at least one worst-case escaped byte.
    if overhead + escaped_len(0) > max_source {
        return Err(PlanError::ChunkBudget {
            path: path.to_string(),
            budget: max_source,
            overhead,
        });
    }
    let budget = max_source - overhead;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < data.len() || chunks.is_empty() {
        let mut used = 0;
        let mut end = start;
        while end < data.len() && used + escaped_len(data[end]) <= budget {
            used += escaped_len(data[end]);
            end += 1;
        }
        chunks.push(Chunk {
            index: chunks.len(),
            offset: start as u64,
            len: end - start,
            expected_len_after: end as u64,
            data: data[start..end].to_vec(),
        });
        start = end;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(remote: &str, data: &[u8]) -> FilePayload {
        FilePayload::new(remote.trim_start_matches('/'), remote, data.to_vec())
    }

    #[test]
    fn test_directories_before_files() {
        let plan = TransferPlan::build(
            &[payload("/main.py", b"print(1)\n"), payload("/lib/a.py", b"x = 1\n")],
            &PlanOptions::default(),
        )
        .unwrap();

        let ops: Vec<String> = plan.steps.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            ops,
            vec![
                "mkdir /lib",
                "write /main.py chunk 1/1 (9 bytes at 0)",
                "verify /main.py (9 bytes)",
                "write /lib/a.py chunk 1/1 (6 bytes at 0)",
                "verify /lib/a.py (6 bytes)",
            ]
        );
        assert_eq!(plan.file_count, 2);
        assert_eq!(plan.total_bytes, 15);
    }

    #[test]
    fn test_one_mkdir_per_unique_directory() {
        let plan = TransferPlan::build(
            &[
                payload("/lib/a.py", b"a"),
                payload("/lib/b.py", b"b"),
                payload("/lib/sub/c.py", b"c"),
            ],
            &PlanOptions::default(),
        )
        .unwrap();
        let mkdirs: Vec<&str> = plan
            .steps
            .iter()
            .filter(|s| matches!(s, PlanStep::Mkdir { .. }))
            .map(PlanStep::path)
            .collect();
        assert_eq!(mkdirs, vec!["/lib", "/lib/sub"]);
    }

    #[test]
    fn test_clean_mode_wipes_first() {
        let options = PlanOptions {
            clean_root: Some("/".into()),
            ..PlanOptions::default()
        };
        let plan = TransferPlan::build(&[payload("/main.py", b"x")], &options).unwrap();
        assert_eq!(plan.steps[0], PlanStep::Wipe { root: "/".into() });
    }

    #[test]
    fn test_chunks_cover_file_in_order() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let chunks = split_chunks("/blob.bin", &data, 512).unwrap();
        assert!(chunks.len() > 1);

        let mut joined = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.offset, joined.len() as u64);
            assert!(!chunk.data.is_empty());
            joined.extend_from_slice(&chunk.data);
            assert_eq!(chunk.expected_len_after, joined.len() as u64);
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn test_rendered_chunk_within_budget() {
        let data: Vec<u8> = b"quote ' backslash \\ nul \0 newline \n"
            .iter()
            .copied()
            .cycle()
            .take(3000)
            .collect();
        for chunk in split_chunks("/lib/data.bin", &data, 400).unwrap() {
            let cmd = RemoteCommand::write_chunk("/lib/data.bin", WriteMode::Append, &chunk.data);
            assert!(cmd.source().len() <= 400, "{} > 400", cmd.source().len());
        }
    }

    #[test]
    fn test_empty_file_gets_one_chunk() {
        let chunks = split_chunks("/empty.py", b"", DEFAULT_MAX_CHUNK_SOURCE).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len, 0);
        assert_eq!(chunks[0].expected_len_after, 0);
    }

    #[test]
    fn test_first_chunk_truncates_rest_append() {
        let data = vec![b'a'; 4000];
        let plan = TransferPlan::build(&[payload("/big.py", &data)], &PlanOptions::default()).unwrap();
        let modes: Vec<WriteMode> = plan
            .steps
            .iter()
            .filter_map(|s| match s {
                PlanStep::WriteChunk { mode, .. } => Some(*mode),
                _ => None,
            })
            .collect();
        assert!(modes.len() >= 2);
        assert_eq!(modes[0], WriteMode::Truncate);
        assert!(modes[1..].iter().all(|m| *m == WriteMode::Append));
    }

    #[test]
    fn test_budget_too_small_rejected() {
        let err = split_chunks("/main.py", b"abc", 48).unwrap_err();
        assert!(matches!(err, PlanError::ChunkBudget { budget: 48, .. }));

        // One worst-case escaped byte past the template is the smallest usable budget.
        let overhead = RemoteCommand::write_chunk("/main.py", WriteMode::Truncate, &[])
            .source()
            .len();
        let floor = overhead + escaped_len(0);
        assert!(split_chunks("/main.py", b"abc", floor - 1).is_err());
        let chunks = split_chunks("/main.py", b"abc", floor).unwrap();
        assert!(chunks.iter().all(|c| c.len >= 1));
    }

    #[test]
    fn test_invalid_and_duplicate_targets_rejected() {
        let err = TransferPlan::build(&[payload("main.py", b"x")], &PlanOptions::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PlanInvalidRemotePath);

        let err = TransferPlan::build(
            &[payload("/main.py", b"x"), payload("/main.py", b"y")],
            &PlanOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::DuplicateTarget {
                path: "/main.py".into()
            }
        );
    }

    #[test]
    fn test_plan_serializes_without_payload_bytes() {
        let plan = TransferPlan::build(&[payload("/main.py", b"secret")], &PlanOptions::default()).unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        let write = &json["steps"][0];
        assert_eq!(write["op"], "write_chunk");
        assert_eq!(write["mode"], "truncate");
        assert_eq!(write["chunk"]["len"], 6);
        assert!(write["chunk"].get("data").is_none());
        assert_eq!(json["steps"][1]["op"], "verify");
    }
}

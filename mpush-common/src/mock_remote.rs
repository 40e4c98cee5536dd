//! In-memory stand-in for the device filesystem.
//!
//! [`SimulatedRemote`] implements [`RemoteExecutor`] by interpreting the
//! [`CommandKind`] of each command the way the generated routines behave on
//! the device, including their printed output. Faults can be injected per
//! command index (zero-based, counting every executed command).

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::codegen::{CommandKind, RemoteCommand, WriteMode, remote_parent};
use crate::deploy::{CancelToken, RemoteExecutor};
use crate::error::DeployError;
use crate::session::{Outcome, SessionResult};

/// Filesystem-level effect observed on the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Mkdir(String),
    Write { path: String, mode: WriteMode, len: usize },
    Stat(String),
    Remove(String),
    Rmdir(String),
    Exec,
}

#[derive(Debug, Clone)]
enum Fault {
    RemoteError(String),
    Timeout,
    LinkLost,
    /// Report success without storing the data.
    DropWrite,
    Cancel(CancelToken),
}

/// Simulated remote filesystem.
#[derive(Debug, Clone)]
pub struct SimulatedRemote {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    ops: Vec<RemoteOp>,
    commands: Vec<CommandKind>,
    faults: HashMap<usize, Fault>,
}

impl Default for SimulatedRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRemote {
    /// Empty filesystem containing only `/`.
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::from(["/".to_string()]),
            ops: Vec::new(),
            commands: Vec::new(),
            faults: HashMap::new(),
        }
    }

    /// Pre-populate a file, creating its parents.
    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        if let Some(parent) = remote_parent(path) {
            let _ = self.make_dirs(parent, false);
        }
        self.files.insert(path.to_string(), data.to_vec());
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        let _ = self.make_dirs(path, false);
        self
    }

    /// Command `index` raises `traceback` without touching the filesystem.
    pub fn fail_at(mut self, index: usize, traceback: &str) -> Self {
        self.faults
            .insert(index, Fault::RemoteError(traceback.to_string()));
        self
    }

    /// Command `index` never answers.
    pub fn time_out_at(mut self, index: usize) -> Self {
        self.faults.insert(index, Fault::Timeout);
        self
    }

    /// The link is gone at command `index`.
    pub fn lose_link_at(mut self, index: usize) -> Self {
        self.faults.insert(index, Fault::LinkLost);
        self
    }

    /// Command `index`, a chunk write, reports success but stores nothing.
    pub fn drop_write_at(mut self, index: usize) -> Self {
        self.faults.insert(index, Fault::DropWrite);
        self
    }

    /// Cancel `token` once command `index` has completed.
    pub fn cancel_after(mut self, index: usize, token: CancelToken) -> Self {
        self.faults.insert(index, Fault::Cancel(token));
        self
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn files(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.has_dir(path) || self.files.contains_key(path)
    }

    pub fn ops(&self) -> &[RemoteOp] {
        &self.ops
    }

    /// Every command received, including faulted ones.
    pub fn commands(&self) -> &[CommandKind] {
        &self.commands
    }

    fn make_dirs(&mut self, path: &str, record: bool) -> Result<(), String> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if self.files.contains_key(&current) {
                return Err(os_error(17, "EEXIST"));
            }
            if self.dirs.insert(current.clone()) && record {
                self.ops.push(RemoteOp::Mkdir(current.clone()));
            }
        }
        Ok(())
    }

    fn write(&mut self, path: &str, mode: WriteMode, data: &[u8], store: bool) -> Result<String, String> {
        if let Some(parent) = remote_parent(path) {
            self.make_dirs(parent, true)?;
        }
        if self.dirs.contains(path) {
            return Err(os_error(21, "EISDIR"));
        }
        if store {
            let file = self.files.entry(path.to_string()).or_default();
            if mode == WriteMode::Truncate {
                file.clear();
            }
            file.extend_from_slice(data);
            self.ops.push(RemoteOp::Write {
                path: path.to_string(),
                mode,
                len: data.len(),
            });
        }
        Ok(format!("{}\r\n", data.len()))
    }

    fn stat_size(&mut self, path: &str) -> Result<String, String> {
        self.ops.push(RemoteOp::Stat(path.to_string()));
        match self.files.get(path) {
            Some(data) => Ok(format!("{}\r\n", data.len())),
            None if self.dirs.contains(path) => Ok("0\r\n".to_string()),
            None => Err(os_error(2, "ENOENT")),
        }
    }

    fn remove_tree(&mut self, root: &str) -> Result<String, String> {
        if self.files.contains_key(root) {
            return Err(os_error(20, "ENOTDIR"));
        }
        if !self.dirs.contains(root) {
            return Ok(String::new());
        }
        let mut out = String::new();
        self.remove_dir(root, &mut out);
        Ok(out)
    }

    fn remove_dir(&mut self, dir: &str, out: &mut String) {
        let (files, subdirs) = self.children(dir);
        for file in files {
            self.files.remove(&file);
            out.push_str(&format!("- {file}\r\n"));
            self.ops.push(RemoteOp::Remove(file));
        }
        for sub in subdirs {
            self.remove_dir(&sub, out);
        }
        if dir != "/" {
            self.dirs.remove(dir);
            out.push_str(&format!("- {dir}\r\n"));
            self.ops.push(RemoteOp::Rmdir(dir.to_string()));
        }
    }

    fn children(&self, dir: &str) -> (Vec<String>, Vec<String>) {
        let is_child = |path: &str| remote_parent(path).unwrap_or("/") == dir && path != "/";
        let files = self.files.keys().filter(|p| is_child(p.as_str())).cloned().collect();
        let dirs = self.dirs.iter().filter(|p| is_child(p.as_str())).cloned().collect();
        (files, dirs)
    }

    fn apply(&mut self, kind: &CommandKind, store: bool) -> Result<String, String> {
        match kind {
            CommandKind::Mkdir { path } => self.make_dirs(path, true).map(|()| String::new()),
            CommandKind::WriteChunk { path, mode, data } => self.write(path, *mode, data, store),
            CommandKind::WriteFinalize { path } => self.stat_size(path),
            CommandKind::RecursiveDelete { root } => self.remove_tree(root),
            CommandKind::Script { .. } => {
                self.ops.push(RemoteOp::Exec);
                Ok(String::new())
            }
        }
    }
}

fn os_error(errno: u32, name: &str) -> String {
    format!("Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nOSError: [Errno {errno}] {name}\r\n")
}

impl RemoteExecutor for SimulatedRemote {
    async fn execute(&mut self, command: &RemoteCommand) -> Result<SessionResult, DeployError> {
        let index = self.commands.len();
        self.commands.push(command.kind().clone());

        let mut store = true;
        let mut cancel = None;
        match self.faults.get(&index).cloned() {
            Some(Fault::RemoteError(traceback)) => {
                return Ok(SessionResult {
                    outcome: Outcome::RemoteError(traceback),
                    output: String::new(),
                });
            }
            Some(Fault::Timeout) => {
                return Err(DeployError::LinkUnusable {
                    reason: format!("{command}: no response"),
                });
            }
            Some(Fault::LinkLost) => {
                return Err(crate::transport::TransportError::Closed.into());
            }
            Some(Fault::DropWrite) => store = false,
            Some(Fault::Cancel(token)) => cancel = Some(token),
            None => {}
        }

        let result = match self.apply(command.kind(), store) {
            Ok(output) => SessionResult {
                outcome: Outcome::Ok,
                output,
            },
            Err(traceback) => SessionResult {
                outcome: Outcome::RemoteError(traceback),
                output: String::new(),
            },
        };
        if let Some(token) = cancel {
            token.cancel();
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(remote: &mut SimulatedRemote, command: RemoteCommand) -> SessionResult {
        remote.execute(&command).await.unwrap()
    }

    #[tokio::test]
    async fn test_mkdir_is_idempotent() {
        let mut remote = SimulatedRemote::new();
        let first = run(&mut remote, RemoteCommand::mkdir("/lib/sub")).await;
        let second = run(&mut remote, RemoteCommand::mkdir("/lib/sub")).await;

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(remote.has_dir("/lib") && remote.has_dir("/lib/sub"));
        assert_eq!(
            remote.ops(),
            &[
                RemoteOp::Mkdir("/lib".into()),
                RemoteOp::Mkdir("/lib/sub".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_mkdir_over_file_fails() {
        let mut remote = SimulatedRemote::new().with_file("/lib", b"oops");
        let result = run(&mut remote, RemoteCommand::mkdir("/lib/sub")).await;
        assert!(matches!(result.outcome, Outcome::RemoteError(ref tb) if tb.contains("EEXIST")));
    }

    #[tokio::test]
    async fn test_write_prints_count_and_appends() {
        let mut remote = SimulatedRemote::new();
        let a = run(&mut remote, RemoteCommand::write_chunk("/d/f", WriteMode::Truncate, b"abc")).await;
        let b = run(&mut remote, RemoteCommand::write_chunk("/d/f", WriteMode::Append, b"de")).await;

        assert_eq!(a.output, "3\r\n");
        assert_eq!(b.output, "2\r\n");
        assert_eq!(remote.file("/d/f"), Some(&b"abcde"[..]));
        let size = run(&mut remote, RemoteCommand::write_finalize("/d/f")).await;
        assert_eq!(size.output.trim(), "5");
    }

    #[tokio::test]
    async fn test_stat_missing_file_raises() {
        let mut remote = SimulatedRemote::new();
        let result = run(&mut remote, RemoteCommand::write_finalize("/nope.py")).await;
        assert!(matches!(result.outcome, Outcome::RemoteError(ref tb) if tb.contains("ENOENT")));
    }

    #[tokio::test]
    async fn test_delete_missing_root_is_quiet() {
        let mut remote = SimulatedRemote::new();
        let result = run(&mut remote, RemoteCommand::recursive_delete("/app")).await;
        assert!(result.is_ok());
        assert!(result.output.is_empty());
    }

    #[tokio::test]
    async fn test_delete_slash_keeps_root() {
        let mut remote = SimulatedRemote::new()
            .with_file("/main.py", b"x")
            .with_file("/lib/a.py", b"y");
        let result = run(&mut remote, RemoteCommand::recursive_delete("/")).await;

        assert!(result.is_ok());
        assert!(remote.files().is_empty());
        assert!(remote.has_dir("/"));
        assert!(!remote.has_dir("/lib"));
    }

    #[tokio::test]
    async fn test_drop_write_reports_success_without_storing() {
        let mut remote = SimulatedRemote::new().drop_write_at(0);
        let result = run(&mut remote, RemoteCommand::write_chunk("/f", WriteMode::Truncate, b"abc")).await;
        assert_eq!(result.output, "3\r\n");
        assert_eq!(remote.file("/f"), None);
    }
}

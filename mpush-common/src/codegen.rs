//! Remote code generation.
//!
//! Every remote operation is a small MicroPython snippet rendered from a fixed
//! template. Parameters never reach the template through string formatting of
//! raw values: paths and payloads are turned into interpreter literals by
//! [`py_str_literal`] and [`py_bytes_literal`] first, so no parameter value can
//! close a literal early or inject code.

use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;

use crate::session::Timeouts;

/// Open mode for a chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Create or truncate, then write (first chunk of a file).
    Truncate,
    /// Append to the existing file (every later chunk).
    Append,
}

impl WriteMode {
    pub const fn as_py_mode(self) -> &'static str {
        match self {
            Self::Truncate => "wb",
            Self::Append => "ab",
        }
    }
}

/// Template kind plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Mkdir { path: String },
    WriteChunk { path: String, mode: WriteMode, data: Vec<u8> },
    WriteFinalize { path: String },
    RecursiveDelete { root: String },
    /// Caller-supplied source, sent unchanged.
    Script { source: String },
}

impl CommandKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Mkdir { .. } => "mkdir",
            Self::WriteChunk { .. } => "write_chunk",
            Self::WriteFinalize { .. } => "write_finalize",
            Self::RecursiveDelete { .. } => "recursive_delete",
            Self::Script { .. } => "script",
        }
    }
}

/// Immutable remote command: the template parameters and the rendered source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    kind: CommandKind,
    source: String,
}

// Idempotent `mkdir -p`: walks the path parent-first and only creates missing
// components.
const MKDIR_ROUTINE: &str = "\
import os
def _mk(p):
    q = ''
    for s in p.split('/'):
        if not s:
            continue
        q += '/' + s
        try:
            os.stat(q)
        except OSError:
            os.mkdir(q)
";

// Files of a directory go first, then its subdirectories, then the directory
// itself. Every removal is printed so a caller can tell deletion has begun.
const RMTREE_ROUTINE: &str = "\
import os
def _rm(d):
    es = list(os.ilistdir(d))
    for e in es:
        if e[1] != 0x4000:
            p = d.rstrip('/') + '/' + e[0]
            os.remove(p)
            print('-', p)
    for e in es:
        if e[1] == 0x4000:
            _rm(d.rstrip('/') + '/' + e[0])
    if d != '/':
        os.rmdir(d)
        print('-', d)
";

impl RemoteCommand {
    /// Create `path` and every missing parent.
    pub fn mkdir(path: &str) -> Self {
        let mut source = String::from(MKDIR_ROUTINE);
        let _ = writeln!(source, "_mk({})", py_str_literal(path));
        Self {
            kind: CommandKind::Mkdir {
                path: path.to_string(),
            },
            source,
        }
    }

    /// Write one chunk of `path`, creating its parent directories first.
    /// The snippet prints the number of bytes written.
    pub fn write_chunk(path: &str, mode: WriteMode, data: &[u8]) -> Self {
        let mut source = String::new();
        if let Some(parent) = remote_parent(path) {
            source.push_str(MKDIR_ROUTINE);
            let _ = writeln!(source, "_mk({})", py_str_literal(parent));
        }
        let _ = writeln!(
            source,
            "with open({}, '{}') as f:",
            py_str_literal(path),
            mode.as_py_mode()
        );
        let _ = writeln!(source, "    print(f.write({}))", py_bytes_literal(data));
        Self {
            kind: CommandKind::WriteChunk {
                path: path.to_string(),
                mode,
                data: data.to_vec(),
            },
            source,
        }
    }

    /// Print the size of `path` as the device sees it.
    pub fn write_finalize(path: &str) -> Self {
        let source = format!("import os\nprint(os.stat({})[6])\n", py_str_literal(path));
        Self {
            kind: CommandKind::WriteFinalize {
                path: path.to_string(),
            },
            source,
        }
    }

    /// Delete `root` and everything below it. A missing root is not an error.
    /// The filesystem root `/` is emptied but cannot itself be removed.
    pub fn recursive_delete(root: &str) -> Self {
        let mut source = String::from(RMTREE_ROUTINE);
        let literal = py_str_literal(root);
        let _ = writeln!(source, "try:\n    os.stat({literal})\nexcept OSError:\n    pass");
        let _ = writeln!(source, "else:\n    _rm({literal})");
        Self {
            kind: CommandKind::RecursiveDelete {
                root: root.to_string(),
            },
            source,
        }
    }

    pub fn script(source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            kind: CommandKind::Script {
                source: source.clone(),
            },
            source,
        }
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether re-running this command after it partially ran could mask an
    /// error.
    pub fn is_destructive(&self) -> bool {
        matches!(self.kind, CommandKind::RecursiveDelete { .. })
    }

    /// Execution bound for this command. Writes scale with payload size.
    pub fn timeout(&self, timeouts: &Timeouts) -> Duration {
        match &self.kind {
            CommandKind::WriteChunk { data, .. } => {
                let kib = data.len().div_ceil(1024).max(1) as u32;
                timeouts.command + timeouts.write_per_kib * kib
            }
            CommandKind::RecursiveDelete { .. } => timeouts.delete,
            _ => timeouts.command,
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CommandKind::Mkdir { path } => write!(f, "mkdir {path}"),
            CommandKind::WriteChunk { path, mode, data } => {
                write!(f, "write {path} ({} bytes, {})", data.len(), mode.as_py_mode())
            }
            CommandKind::WriteFinalize { path } => write!(f, "verify {path}"),
            CommandKind::RecursiveDelete { root } => write!(f, "rmtree {root}"),
            CommandKind::Script { source } => write!(f, "exec ({} bytes)", source.len()),
        }
    }
}

/// Parent directory of a remote path, or `None` for top-level entries.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let parent = &trimmed[..idx];
    if parent.is_empty() { None } else { Some(parent) }
}

/// Render `value` as a single-quoted Python `str` literal.
///
/// Quote, backslash, and every ASCII control character are escaped; other
/// characters pass through as UTF-8, which the device's parser accepts.
pub fn py_str_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Render `data` as a single-quoted Python `bytes` literal.
pub fn py_bytes_literal(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &b in data {
        push_escaped_byte(&mut out, b);
    }
    out.push('\'');
    out
}

/// Length of `b` once escaped inside a bytes literal.
pub const fn escaped_len(b: u8) -> usize {
    match b {
        b'\\' | b'\'' | b'\n' | b'\r' | b'\t' => 2,
        0x20..=0x7e => 1,
        _ => 4,
    }
}

fn push_escaped_byte(out: &mut String, b: u8) {
    match b {
        b'\\' => out.push_str("\\\\"),
        b'\'' => out.push_str("\\'"),
        b'\n' => out.push_str("\\n"),
        b'\r' => out.push_str("\\r"),
        b'\t' => out.push_str("\\t"),
        0x20..=0x7e => out.push(b as char),
        _ => {
            let _ = write!(out, "\\x{b:02x}");
        }
    }
}

//! Error catalog for mpush.
//!
//! Every failure the CLI can report has a stable code (`MPU-E001` through
//! `MPU-E599`), a message, and remediation steps.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                              |
//! |------------|-------------|------------------------------------------|
//! | E001-E099  | Config      | Configuration and file selection         |
//! | E100-E199  | Link        | Serial link and REPL protocol            |
//! | E200-E299  | Remote      | Failures reported by the device          |
//! | E300-E399  | Transfer    | Planning, local files, cross-compilation |
//! | E500-E599  | Internal    | Internal/unexpected errors               |
//!
//! # Example
//!
//! ```rust
//! use mpush_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::LinkUnusable.entry();
//! println!("{}", entry.format_full());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

const REPL_DOCS: &str =
    "https://docs.micropython.org/en/latest/reference/repl.html#raw-mode-and-raw-paste-mode";
const MPY_DOCS: &str = "https://docs.micropython.org/en/latest/reference/mpyfiles.html";

/// Error code enumeration covering all mpush error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Configuration file could not be written
    ConfigWriteError,
    /// File patterns matched nothing
    NoFilesSelected,
    /// A file pattern is not a valid glob
    InvalidGlobPattern,

    // =========================================================================
    // Link Errors (E100-E199)
    // =========================================================================
    /// Serial port could not be opened
    LinkOpenFailed,
    /// No response within the command timeout
    LinkTimeout,
    /// Link could not be brought back to a known state
    LinkUnusable,
    /// Unexpected bytes where a protocol marker was expected
    LinkProtocolViolation,
    /// Device closed the link
    LinkClosed,
    /// I/O error on the link
    LinkIoError,

    // =========================================================================
    // Remote Errors (E200-E299)
    // =========================================================================
    /// The interpreter raised an exception
    RemoteException,
    /// Remote size disagrees with the local payload
    RemoteSizeMismatch,
    /// A recursive delete timed out after it started
    RemoteDeleteInterrupted,

    // =========================================================================
    // Transfer Errors (E300-E399)
    // =========================================================================
    /// Remote target path is not absolute
    PlanInvalidRemotePath,
    /// Two local files map to the same remote path
    PlanDuplicateTarget,
    /// Chunk source budget too small for the write template
    PlanChunkBudget,
    /// A local file could not be read
    LocalReadFailed,
    /// Cross-compiler not found
    CompilerMissing,
    /// Cross-compiler reported an error
    CompileFailed,
    /// Run cancelled by the user
    RunCancelled,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Unexpected internal error
    InternalError,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,
            Self::ConfigWriteError => 6,
            Self::NoFilesSelected => 7,
            Self::InvalidGlobPattern => 8,

            Self::LinkOpenFailed => 100,
            Self::LinkTimeout => 101,
            Self::LinkUnusable => 102,
            Self::LinkProtocolViolation => 103,
            Self::LinkClosed => 104,
            Self::LinkIoError => 105,

            Self::RemoteException => 200,
            Self::RemoteSizeMismatch => 201,
            Self::RemoteDeleteInterrupted => 202,

            Self::PlanInvalidRemotePath => 300,
            Self::PlanDuplicateTarget => 301,
            Self::PlanChunkBudget => 302,
            Self::LocalReadFailed => 303,
            Self::CompilerMissing => 304,
            Self::CompileFailed => 305,
            Self::RunCancelled => 306,

            Self::InternalError => 500,
        }
    }

    /// Returns the formatted error code string (e.g., "MPU-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("MPU-E{:03}", self.code_number())
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Link,
            200..=299 => ErrorCategory::Remote,
            300..=399 => ErrorCategory::Transfer,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            doc_url: self.doc_url().map(String::from),
        }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has an invalid value",
            Self::ConfigWriteError => "Failed to write configuration file",
            Self::NoFilesSelected => "No files matched the deploy patterns",
            Self::InvalidGlobPattern => "Invalid file pattern",

            Self::LinkOpenFailed => "Failed to open serial port",
            Self::LinkTimeout => "Device did not respond in time",
            Self::LinkUnusable => "Serial link is unusable",
            Self::LinkProtocolViolation => "Unexpected response from the REPL",
            Self::LinkClosed => "Device closed the serial link",
            Self::LinkIoError => "I/O error on the serial link",

            Self::RemoteException => "Device raised an exception",
            Self::RemoteSizeMismatch => "Remote file size does not match",
            Self::RemoteDeleteInterrupted => "Recursive delete timed out part way",

            Self::PlanInvalidRemotePath => "Remote path must be absolute",
            Self::PlanDuplicateTarget => "Several files map to one remote path",
            Self::PlanChunkBudget => "Chunk size too small for the write template",
            Self::LocalReadFailed => "Failed to read local file",
            Self::CompilerMissing => "Cross-compiler not found",
            Self::CompileFailed => "Cross-compilation failed",
            Self::RunCancelled => "Run cancelled",

            Self::InternalError => "Internal error",
        }
    }

    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Run 'mpush init' to create a default deploy.toml",
                "Pass the config path with -c/--config",
            ],
            Self::ConfigReadError => &[
                "Check file permissions on the config file",
                "Make sure the path is a file, not a directory",
            ],
            Self::ConfigParseError => &[
                "Check the TOML syntax near the reported line",
                "Compare with the file written by 'mpush init'",
            ],
            Self::ConfigValidationError => &[
                "transfer.max_chunk_source must be at least 512",
                "Timeouts and raw_entry_attempts must be greater than zero",
            ],
            Self::ConfigEnvError => &[
                "Check MPUSH_* environment variables for typos",
                "Unset the variable to fall back to the config file",
            ],
            Self::ConfigWriteError => &[
                "Check that the target directory exists and is writable",
            ],
            Self::NoFilesSelected => &[
                "Check deploy.files patterns in deploy.toml",
                "Patterns are relative to the search root (--root)",
            ],
            Self::InvalidGlobPattern => &["Fix the pattern syntax in deploy.files or deploy.compile"],

            Self::LinkOpenFailed => &[
                "Check that the board is plugged in and the device path is correct",
                "Close other programs holding the port (serial monitors, IDEs)",
                "On Linux, make sure your user is in the dialout group",
            ],
            Self::LinkTimeout => &[
                "Increase transfer.command_timeout_ms",
                "Check the USB cable and baud rate",
            ],
            Self::LinkUnusable => &[
                "Press the board's reset button and retry",
                "Make sure no program on the board blocks Ctrl-C (e.g. a tight loop in boot.py)",
                "Check the baud rate with --baud",
            ],
            Self::LinkProtocolViolation => &[
                "Another program may be writing to the port; close it",
                "Retry with transfer.raw_paste = false",
            ],
            Self::LinkClosed => &[
                "The board may have reset or been unplugged",
                "Reconnect and retry",
            ],
            Self::LinkIoError => &["Reconnect the board and retry"],

            Self::RemoteException => &[
                "Read the traceback above for the failing call",
                "OSError 28 (ENOSPC) means the device filesystem is full; try --clean",
            ],
            Self::RemoteSizeMismatch => &[
                "The device may have reset during the write; redeploy",
                "Lower transfer.max_chunk_source",
            ],
            Self::RemoteDeleteInterrupted => &[
                "The tree is partially deleted; run 'mpush wipe' again",
                "Increase transfer.delete_timeout_ms for large trees",
            ],

            Self::PlanInvalidRemotePath => &["Set deploy.target_root to an absolute path such as '/'"],
            Self::PlanDuplicateTarget => &[
                "A .py and its compiled .mpy may both map to the same file; narrow the patterns",
            ],
            Self::PlanChunkBudget => &["Raise transfer.max_chunk_source"],
            Self::LocalReadFailed => &["Check that the file exists and is readable"],
            Self::CompilerMissing => &[
                "Install mpy-cross (pip install mpy-cross) and make sure it is on PATH",
                "Or remove the file from deploy.compile",
            ],
            Self::CompileFailed => &["Fix the syntax error reported by mpy-cross"],
            Self::RunCancelled => &["Files written before cancellation remain on the device"],

            Self::InternalError => &["Re-run with -vvv and report the log"],
        }
    }

    #[must_use]
    pub const fn doc_url(&self) -> Option<&'static str> {
        match self {
            Self::LinkTimeout
            | Self::LinkUnusable
            | Self::LinkProtocolViolation => Some(REPL_DOCS),
            Self::CompilerMissing | Self::CompileFailed => Some(MPY_DOCS),
            _ => None,
        }
    }

    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::ConfigWriteError,
            Self::NoFilesSelected,
            Self::InvalidGlobPattern,
            Self::LinkOpenFailed,
            Self::LinkTimeout,
            Self::LinkUnusable,
            Self::LinkProtocolViolation,
            Self::LinkClosed,
            Self::LinkIoError,
            Self::RemoteException,
            Self::RemoteSizeMismatch,
            Self::RemoteDeleteInterrupted,
            Self::PlanInvalidRemotePath,
            Self::PlanDuplicateTarget,
            Self::PlanChunkBudget,
            Self::LocalReadFailed,
            Self::CompilerMissing,
            Self::CompileFailed,
            Self::RunCancelled,
            Self::InternalError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Link,
    Remote,
    Transfer,
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Link => "Link",
            Self::Remote => "Remote",
            Self::Transfer => "Transfer",
            Self::Internal => "Internal",
        }
    }

    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Config => "Configuration file, environment and file selection issues",
            Self::Link => "Serial link and REPL protocol issues",
            Self::Remote => "Failures reported by the device",
            Self::Transfer => "Transfer planning, local files and cross-compilation",
            Self::Internal => "Internal errors that may indicate bugs",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "MPU-E001")
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
    pub doc_url: Option<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("Remediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        if let Some(url) = &self.doc_url {
            output.push_str(&format!("\nFor more information: {}\n", url));
        }

        output
    }

    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            assert!(
                seen.insert(code.code_number()),
                "Duplicate error code number for {:?}",
                code
            );
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.code_string(), "MPU-E001");
        assert_eq!(ErrorCode::LinkOpenFailed.code_string(), "MPU-E100");
        assert_eq!(ErrorCode::RemoteException.code_string(), "MPU-E200");
        assert_eq!(ErrorCode::PlanInvalidRemotePath.code_string(), "MPU-E300");
        assert_eq!(ErrorCode::InternalError.code_string(), "MPU-E500");
    }

    #[test]
    fn test_category_ranges() {
        for code in ErrorCode::all() {
            let num = code.code_number();
            let expected = match num {
                1..=99 => ErrorCategory::Config,
                100..=199 => ErrorCategory::Link,
                200..=299 => ErrorCategory::Remote,
                300..=399 => ErrorCategory::Transfer,
                _ => ErrorCategory::Internal,
            };
            assert_eq!(code.category(), expected, "{:?}", code);
        }
    }

    #[test]
    fn test_all_errors_have_message_and_remediation() {
        for code in ErrorCode::all() {
            assert!(!code.message().is_empty(), "{:?} has empty message", code);
            assert!(!code.remediation().is_empty(), "{:?} has no remediation", code);
        }
    }

    #[test]
    fn test_error_entry_serialization() {
        let entry = ErrorCode::LinkUnusable.entry();
        let json = serde_json::to_string(&entry).expect("serialization failed");
        assert!(json.contains("MPU-E102"));
        assert!(json.contains("\"link\""));

        let parsed: ErrorEntry = serde_json::from_str(&json).expect("deserialization failed");
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::RemoteSizeMismatch).unwrap();
        assert_eq!(json, "\"REMOTE_SIZE_MISMATCH\"");
    }

    #[test]
    fn test_format_full_and_brief() {
        let entry = ErrorCode::ConfigNotFound.entry();
        let full = entry.format_full();
        assert!(full.contains("[MPU-E001] Configuration file not found"));
        assert!(full.contains("Remediation steps:"));
        assert!(full.contains("mpush init"));
        assert_eq!(entry.format_brief(), "[MPU-E001] Configuration file not found");

        let full = ErrorCode::LinkUnusable.entry().format_full();
        assert!(full.contains("For more information: https://docs.micropython.org/"));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ErrorCode::LinkClosed.to_string(),
            "MPU-E104: Device closed the serial link"
        );
        assert_eq!(ErrorCategory::Remote.to_string(), "Remote");
    }
}

//! Failure taxonomy for a deployment run.

use std::time::Duration;

use thiserror::Error;

use crate::errors::ErrorCode;
use crate::retry::RetryableError;
use crate::transport::TransportError;

/// Errors that abort a plan step.
#[derive(Debug, Error)]
pub enum DeployError {
    /// No response within the bound.
    #[error("{operation}: no response within {}ms", .after.as_millis())]
    LinkTimeout {
        operation: String,
        after: Duration,
        /// False once a destructive command has visibly started running.
        retry_safe: bool,
    },

    /// The link could not be brought back to a known state.
    #[error("link unusable: {reason}")]
    LinkUnusable { reason: String },

    /// The interpreter reported a traceback.
    #[error("{operation} raised on the device:\n{traceback}")]
    RemoteException { operation: String, traceback: String },

    /// Post-write verification disagrees with the local payload.
    #[error("size mismatch for {path}: expected {expected} bytes, device reports {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: String,
    },

    /// A known marker was expected but something else arrived.
    #[error("protocol violation: expected {expected}, got {got:?}")]
    ProtocolViolation { expected: String, got: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to read {path}: {source}")]
    LocalRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("deployment cancelled")]
    Cancelled,
}

impl DeployError {
    pub(crate) fn protocol(expected: impl Into<String>, got: &[u8]) -> Self {
        Self::ProtocolViolation {
            expected: expected.into(),
            got: String::from_utf8_lossy(got).into_owned(),
        }
    }

    /// Whether this error means the link itself, not a single step, is gone.
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, Self::LinkUnusable { .. } | Self::Transport(_))
    }

    /// Catalog code for diagnostics.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LinkTimeout { retry_safe: false, .. } => ErrorCode::RemoteDeleteInterrupted,
            Self::LinkTimeout { .. } => ErrorCode::LinkTimeout,
            Self::LinkUnusable { .. } => ErrorCode::LinkUnusable,
            Self::RemoteException { .. } => ErrorCode::RemoteException,
            Self::SizeMismatch { .. } => ErrorCode::RemoteSizeMismatch,
            Self::ProtocolViolation { .. } => ErrorCode::LinkProtocolViolation,
            Self::Transport(TransportError::Closed) => ErrorCode::LinkClosed,
            Self::Transport(TransportError::Io(_)) => ErrorCode::LinkIoError,
            Self::LocalRead { .. } => ErrorCode::LocalReadFailed,
            Self::Cancelled => ErrorCode::RunCancelled,
        }
    }
}

impl RetryableError for DeployError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::LinkTimeout { retry_safe: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_safe_timeouts_are_retryable() {
        let safe = DeployError::LinkTimeout {
            operation: "mkdir /lib".into(),
            after: Duration::from_secs(5),
            retry_safe: true,
        };
        let started_delete = DeployError::LinkTimeout {
            operation: "rmtree /".into(),
            after: Duration::from_secs(30),
            retry_safe: false,
        };
        assert!(safe.is_retryable());
        assert!(!started_delete.is_retryable());
        assert!(
            !DeployError::RemoteException {
                operation: "mkdir /lib".into(),
                traceback: "OSError: 28".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = DeployError::SizeMismatch {
            path: "/main.py".into(),
            expected: 120,
            actual: "64".into(),
        };
        assert_eq!(
            err.to_string(),
            "size mismatch for /main.py: expected 120 bytes, device reports 64"
        );

        let err = DeployError::LinkTimeout {
            operation: "verify /main.py".into(),
            after: Duration::from_millis(1500),
            retry_safe: true,
        };
        assert_eq!(err.to_string(), "verify /main.py: no response within 1500ms");
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            DeployError::Transport(TransportError::Closed).code(),
            ErrorCode::LinkClosed
        );
        assert_eq!(DeployError::Cancelled.code(), ErrorCode::RunCancelled);
        assert!(DeployError::LinkUnusable { reason: "x".into() }.is_link_fatal());
        assert!(!DeployError::Cancelled.is_link_fatal());
    }
}

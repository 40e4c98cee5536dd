//! Library side of mpush: pushes files to a MicroPython board over its raw REPL.
//!
//! The layers, bottom up:
//! - [`transport`]: byte I/O with deadlines
//! - [`session`]: the raw REPL state machine
//! - [`codegen`]: Python source for each remote filesystem operation
//! - [`plan`] and [`deploy`]: ordered steps and their execution
//! - [`retry`]: timeout recovery around a session

pub mod codegen;
pub mod config;
pub mod control;
pub mod deploy;
pub mod error;
pub mod errors;
pub mod logging;
pub mod mock_device;
pub mod mock_remote;
pub mod plan;
pub mod retry;
pub mod session;
pub mod transport;

pub use codegen::{CommandKind, RemoteCommand, WriteMode};
pub use config::{CliOverrides, ConfigError, DeployConfig, Settings};
pub use deploy::{CancelToken, DeployReport, Deployer, FailedStep, RemoteExecutor, RunOutcome};
pub use error::DeployError;
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging, verbosity_level};
pub use mock_device::{MockDevice, MockReply};
pub use mock_remote::SimulatedRemote;
pub use plan::{DeploySource, FilePayload, PlanOptions, PlanStep, TransferPlan};
pub use retry::{RetryController, RetryPolicy, run_with_retry};
pub use session::{Mode, Outcome, ReplSession, SessionConfig, SessionResult, Timeouts};
pub use transport::{StreamTransport, Transport, TransportError};

//! Plan execution.
//!
//! The deployer walks a [`TransferPlan`] strictly in order, one command in
//! flight at a time, and stops at the first failure. Files already written stay
//! on the device; the report names the exact step that failed.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codegen::RemoteCommand;
use crate::error::DeployError;
use crate::plan::{PlanStep, TransferPlan};
use crate::session::{Outcome, SessionResult};

/// Anything that can run a [`RemoteCommand`] and classify the result.
///
/// Implementations report a hard timeout as an error; a returned
/// [`SessionResult`] is `Ok` or `RemoteError`.
pub trait RemoteExecutor: Send {
    fn execute(
        &mut self,
        command: &RemoteCommand,
    ) -> impl Future<Output = Result<SessionResult, DeployError>> + Send;
}

/// Cooperative cancellation flag, checked before every plan step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The step a run stopped at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStep {
    /// Zero-based position in the plan.
    pub index: usize,
    pub description: String,
    pub path: String,
    pub chunk_index: Option<usize>,
    /// Catalog code, e.g. `MPU-E201`.
    pub code: String,
    pub error: String,
}

impl FailedStep {
    fn new(index: usize, step: &PlanStep, err: &DeployError) -> Self {
        Self {
            index,
            description: step.to_string(),
            path: step.path().to_string(),
            chunk_index: step.chunk_index(),
            code: err.code().code_string(),
            error: err.to_string(),
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialFailure { step: FailedStep },
    LinkUnusable { step: FailedStep },
    Cancelled { next_step: usize },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::PartialFailure { .. } => 1,
            Self::LinkUnusable { .. } => 2,
            Self::Cancelled { .. } => 130,
        }
    }

    pub fn failed_step(&self) -> Option<&FailedStep> {
        match self {
            Self::PartialFailure { step } | Self::LinkUnusable { step } => Some(step),
            _ => None,
        }
    }
}

/// Summary of one deployment run.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps_total: usize,
    pub steps_completed: usize,
    /// Files whose size verification passed.
    pub files_written: usize,
    pub bytes_written: u64,
    pub outcome: RunOutcome,
}

impl DeployReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// Executes transfer plans against a [`RemoteExecutor`].
pub struct Deployer<E> {
    executor: E,
    cancel: CancelToken,
}

impl<E: RemoteExecutor> Deployer<E> {
    pub fn new(executor: E, cancel: CancelToken) -> Self {
        Self { executor, cancel }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn into_executor(self) -> E {
        self.executor
    }

    /// Run every step of `plan` in order, stopping at the first failure or
    /// cancellation.
    pub async fn run(&mut self, plan: &TransferPlan) -> DeployReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = plan.steps.len();
        info!(%run_id, steps = total, files = plan.file_count, bytes = plan.total_bytes, "deployment started");

        let mut steps_completed = 0;
        let mut files_written = 0;
        let mut bytes_written = 0u64;
        let mut outcome = RunOutcome::Success;

        for (index, step) in plan.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(next_step = index, "deployment cancelled");
                outcome = RunOutcome::Cancelled { next_step: index };
                break;
            }
            debug!(step = index + 1, total, %step, "running step");
            match self.run_step(step).await {
                Ok(()) => {
                    steps_completed += 1;
                    match step {
                        PlanStep::WriteChunk { chunk, .. } => bytes_written += chunk.len as u64,
                        PlanStep::Verify { path, .. } => {
                            files_written += 1;
                            info!(path = %path, "file written");
                        }
                        _ => {}
                    }
                }
                Err(DeployError::Cancelled) => {
                    outcome = RunOutcome::Cancelled { next_step: index };
                    break;
                }
                Err(err) => {
                    let failed = FailedStep::new(index, step, &err);
                    warn!(
                        step = index + 1,
                        path = %failed.path,
                        chunk = ?failed.chunk_index,
                        code = %failed.code,
                        error = %err,
                        "step failed, aborting deployment"
                    );
                    outcome = if err.is_link_fatal() {
                        RunOutcome::LinkUnusable { step: failed }
                    } else {
                        RunOutcome::PartialFailure { step: failed }
                    };
                    break;
                }
            }
        }

        let report = DeployReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            steps_total: total,
            steps_completed,
            files_written,
            bytes_written,
            outcome,
        };
        info!(
            %run_id,
            status = report.exit_code(),
            steps_completed,
            files_written,
            "deployment finished"
        );
        report
    }

    async fn run_step(&mut self, step: &PlanStep) -> Result<(), DeployError> {
        let command = step.command();
        let result = self.executor.execute(&command).await?;
        let output = match result.outcome {
            Outcome::Ok => result.output,
            Outcome::RemoteError(traceback) => {
                return Err(DeployError::RemoteException {
                    operation: command.to_string(),
                    traceback,
                });
            }
            Outcome::Timeout => {
                return Err(DeployError::LinkUnusable {
                    reason: format!("{command}: timed out"),
                });
            }
        };

        match step {
            PlanStep::WriteChunk { path, chunk, .. } => {
                check_reported_size(path, chunk.len as u64, &output)
            }
            PlanStep::Verify {
                path,
                expected_size,
            } => check_reported_size(path, *expected_size, &output),
            PlanStep::Wipe { .. } | PlanStep::Mkdir { .. } => Ok(()),
        }
    }
}

fn check_reported_size(path: &str, expected: u64, output: &str) -> Result<(), DeployError> {
    let reported = output.trim();
    match reported.parse::<u64>() {
        Ok(actual) if actual == expected => Ok(()),
        _ => Err(DeployError::SizeMismatch {
            path: path.to_string(),
            expected,
            actual: reported.to_string(),
        }),
    }
}

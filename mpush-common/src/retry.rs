//! Retry and recovery around the REPL session.
//!
//! A timed-out command is retried after a forced resync (interrupt, leave raw
//! mode, re-enter raw mode) and resubmitted unchanged. Remote exceptions are
//! deterministic and never retried. A desynchronised session
//! (`ProtocolViolation`) gets one forced resync per controller.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::codegen::RemoteCommand;
use crate::deploy::RemoteExecutor;
use crate::error::DeployError;
use crate::session::{Outcome, ReplSession, SessionResult};
use crate::transport::Transport;

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether resubmitting the same operation is safe and may succeed.
    fn is_retryable(&self) -> bool;
}

/// How often and how patiently a failed operation is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay between retries (exponential backoff).
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied to delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_retries` and no waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_secs = self.base_delay.as_secs_f64();
        let max_secs = self.max_delay.as_secs_f64().max(0.0);

        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1)) as f64;
        let mut delay = (base_secs * multiplier).min(max_secs);

        if self.jitter > 0.0 && delay > 0.0 {
            let jitter = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
            delay = (delay * (1.0 + jitter)).max(0.0);
        }

        Duration::from_secs_f64(delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Run an async operation, retrying retryable errors with backoff.
pub async fn run_with_retry<F, Fut, T, E>(
    operation: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// [`RemoteExecutor`] over a live session with timeout retry and resync.
pub struct RetryController<T> {
    session: ReplSession<T>,
    policy: RetryPolicy,
    resync_spent: bool,
    retries: u32,
}

impl<T: Transport> RetryController<T> {
    pub fn new(session: ReplSession<T>, policy: RetryPolicy) -> Self {
        Self {
            session,
            policy,
            resync_spent: false,
            retries: 0,
        }
    }

    pub fn session(&self) -> &ReplSession<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ReplSession<T> {
        &mut self.session
    }

    pub fn into_session(self) -> ReplSession<T> {
        self.session
    }

    /// Timeout retries performed so far across all commands.
    pub fn retries_performed(&self) -> u32 {
        self.retries
    }

    /// Submit `command`, retrying timeouts up to the policy bound.
    ///
    /// Returns the session result for `Ok` and `RemoteError` outcomes; a
    /// timeout never escapes as a result.
    pub async fn run(&mut self, command: &RemoteCommand) -> Result<SessionResult, DeployError> {
        let timeout = command.timeout(&self.session.config().timeouts);
        let mut retry = 0;
        loop {
            let result = match self.session.exec(command.source(), timeout).await {
                Ok(result) => result,
                Err(err @ DeployError::ProtocolViolation { .. }) if !self.resync_spent => {
                    self.resync_spent = true;
                    warn!(command = %command, error = %err, "session desynchronised, forcing resync");
                    self.session.resync().await?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if result.outcome != Outcome::Timeout {
                return Ok(result);
            }

            // Output from a destructive command means it already started
            // changing the remote tree.
            let started = command.is_destructive() && !result.output.trim().is_empty();
            let err = DeployError::LinkTimeout {
                operation: command.to_string(),
                after: timeout,
                retry_safe: !started,
            };
            if !err.is_retryable() {
                warn!(command = %command, "destructive command timed out after it started; not retrying");
                return Err(err);
            }
            if retry >= self.policy.max_retries {
                return Err(DeployError::LinkUnusable {
                    reason: format!(
                        "{command}: no response after {} attempts",
                        retry + 1
                    ),
                });
            }

            retry += 1;
            self.retries += 1;
            let delay = self.policy.backoff_delay(retry);
            warn!(
                command = %command,
                retry,
                max_retries = self.policy.max_retries,
                timeout_ms = timeout.as_millis() as u64,
                "command timed out, resyncing"
            );
            sleep(delay).await;
            self.session.resync().await?;
            debug!(command = %command, retry, "resubmitting");
        }
    }

    /// Leave raw mode and hand back the transport.
    pub async fn release(self) -> T {
        if self.retries > 0 {
            info!(retries = self.retries, "session needed timeout retries");
        }
        self.session.release().await
    }
}

impl<T: Transport> RemoteExecutor for RetryController<T> {
    async fn execute(&mut self, command: &RemoteCommand) -> Result<SessionResult, DeployError> {
        self.run(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Retryable,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Retryable => write!(f, "retryable"),
                TestError::Fatal => write!(f, "fatal"),
            }
        }
    }

    impl RetryableError for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Retryable)
        }
    }

    #[tokio::test]
    async fn test_run_with_retry_succeeds_after_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = run_with_retry("open port", &RetryPolicy::immediate(2), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Retryable)
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_with_retry_stops_on_fatal() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32, TestError> =
            run_with_retry("open port", &RetryPolicy::immediate(5), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Fatal)
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_with_retry_bounded_by_max_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<u32, TestError> =
            run_with_retry("open port", &RetryPolicy::immediate(2), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Retryable)
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_delay_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter: 0.0,
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(300));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_delay_jitter_within_bounds() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.5,
        };
        for _ in 0..32 {
            let ms = policy.backoff_delay(1).as_secs_f64() * 1000.0;
            assert!((50.0..=150.0).contains(&ms), "delay {ms} out of range");
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(RetryPolicy::immediate(0).max_attempts(), 1);
    }
}

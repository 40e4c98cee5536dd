//! REPL session state machine.
//!
//! Drives the device's interactive interpreter as a request/response channel:
//! raw mode is entered once, every command is submitted through raw paste
//! (or plain raw mode when paste is unavailable), and results are classified
//! purely from the control-byte delimiters the interpreter emits around stdout
//! and tracebacks. Prompt text is never pattern-matched for classification.
//!
//! ```text
//! NORMAL --enter_raw--> ENTERING_RAW --banner--> RAW
//! RAW --paste request--> ENTERING_PASTE --R\x01--> RAW_PASTE
//! RAW | RAW_PASTE --EOT--> EXECUTING --\x04..\x04--> RAW
//!                                    --deadline--> ERROR
//! any --exit_raw--> NORMAL
//! ```

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control;
use crate::error::DeployError;
use crate::transport::{ReadOutcome, Transport};

// Plain raw mode has no flow control; pace writes so the device's input
// buffer keeps up.
const RAW_WRITE_CHUNK: usize = 256;
const RAW_WRITE_PAUSE: Duration = Duration::from_millis(10);

/// Timeouts applied by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Wait for banners, acknowledgements and prompts.
    pub banner: Duration,
    /// Default per-command execution bound.
    pub command: Duration,
    /// Extra execution time per KiB of chunk payload.
    pub write_per_kib: Duration,
    /// Bound for a recursive delete.
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            banner: Duration::from_secs(2),
            command: Duration::from_secs(5),
            write_per_kib: Duration::from_secs(1),
            delete: Duration::from_secs(30),
        }
    }
}

/// Session tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub timeouts: Timeouts,
    /// How many times the raw-entry sequence is sent before giving up.
    pub raw_entry_attempts: u32,
    /// Try raw paste before plain raw submission.
    pub raw_paste: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            raw_entry_attempts: 3,
            raw_paste: true,
        }
    }
}

/// Interpreter mode as tracked by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    EnteringRaw,
    Raw,
    EnteringPaste,
    RawPaste,
    Executing,
    Error,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::EnteringRaw => "entering_raw",
            Self::Raw => "raw",
            Self::EnteringPaste => "entering_paste",
            Self::RawPaste => "raw_paste",
            Self::Executing => "executing",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Classification of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    RemoteError(String),
    Timeout,
}

/// Outcome of one submission plus whatever stdout was captured.
#[must_use = "a session result carries the remote error or timeout and must be inspected"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub outcome: Outcome,
    pub output: String,
}

impl SessionResult {
    pub fn is_ok(&self) -> bool {
        self.outcome == Outcome::Ok
    }
}

enum Submission {
    Sent,
    TimedOut(Vec<u8>),
}

/// Exclusive owner of the transport for the length of a run.
pub struct ReplSession<T> {
    transport: T,
    mode: Mode,
    config: SessionConfig,
    paste_support: Option<bool>,
    last_error: Option<String>,
}

impl<T: Transport> ReplSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            mode: Mode::Normal,
            config,
            paste_support: None,
            last_error: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// `None` until the first paste attempt.
    pub fn paste_supported(&self) -> Option<bool> {
        self.paste_support
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            debug!(from = %self.mode, to = %mode, "session mode");
            self.mode = mode;
        }
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
        self.set_mode(Mode::Error);
    }

    /// Interrupt whatever runs on the device and switch to raw mode.
    ///
    /// The entry sequence is repeated up to `raw_entry_attempts` times.
    pub async fn enter_raw(&mut self) -> Result<(), DeployError> {
        if self.mode == Mode::Raw {
            return Ok(());
        }
        let attempts = self.config.raw_entry_attempts.max(1);
        for attempt in 1..=attempts {
            self.set_mode(Mode::EnteringRaw);
            self.transport.write(control::INTERRUPT).await?;
            self.transport.flush_input().await?;
            self.transport.write(control::RAW_ENTER).await?;
            match self
                .transport
                .read_until(control::RAW_BANNER, Some(self.config.timeouts.banner))
                .await?
            {
                ReadOutcome::Complete(_) => {
                    self.set_mode(Mode::Raw);
                    return Ok(());
                }
                ReadOutcome::TimedOut(partial) => {
                    warn!(
                        attempt,
                        attempts,
                        received = partial.len(),
                        "no raw REPL banner"
                    );
                }
            }
        }
        let reason = format!("no raw REPL banner after {attempts} attempts");
        self.fail(reason.clone());
        Err(DeployError::LinkUnusable { reason })
    }

    /// Leave raw mode. Best effort: failures are logged, never returned.
    pub async fn exit_raw(&mut self) {
        if let Err(err) = self.transport.write(control::RAW_EXIT).await {
            warn!(error = %err, "failed to send raw-mode exit");
        } else {
            match self
                .transport
                .read_until(control::FRIENDLY_PROMPT, Some(self.config.timeouts.banner))
                .await
            {
                Ok(ReadOutcome::Complete(_)) => {}
                Ok(ReadOutcome::TimedOut(_)) => debug!("no friendly prompt after raw-mode exit"),
                Err(err) => warn!(error = %err, "link error during raw-mode exit"),
            }
        }
        self.set_mode(Mode::Normal);
    }

    /// Force the session back to a known state: interrupt, leave raw mode,
    /// discard stale input, and enter raw mode again.
    pub async fn resync(&mut self) -> Result<(), DeployError> {
        info!(mode = %self.mode, "resynchronising REPL session");
        self.transport.write(control::INTERRUPT).await?;
        self.transport.flush_input().await?;
        self.exit_raw().await;
        self.transport.flush_input().await?;
        self.enter_raw().await
    }

    /// Submit `source` and classify what the interpreter prints back.
    pub async fn exec(
        &mut self,
        source: &str,
        timeout: Duration,
    ) -> Result<SessionResult, DeployError> {
        if self.mode != Mode::Raw {
            self.enter_raw().await?;
        }
        self.transport.flush_input().await?;

        let payload = source.as_bytes();
        let pasted = if self.config.raw_paste && self.paste_support != Some(false) {
            self.submit_paste(payload, timeout).await?
        } else {
            None
        };
        let submission = match pasted {
            Some(submission) => submission,
            None => self.submit_raw(payload).await?,
        };
        match submission {
            Submission::Sent => self.collect(timeout).await,
            Submission::TimedOut(partial) => Ok(self.timed_out(partial, timeout)),
        }
    }

    /// `Ok(None)` when the device has no raw paste; nothing was submitted.
    async fn submit_paste(
        &mut self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<Submission>, DeployError> {
        self.set_mode(Mode::EnteringPaste);
        self.transport.write(control::PASTE_ENTER).await?;
        let banner = Some(self.config.timeouts.banner);
        let reply = self.transport.read_exact(2, banner).await?;
        match reply {
            ReadOutcome::Complete(ref bytes) if bytes == control::PASTE_SUPPORTED => {}
            other => {
                if other.bytes() == control::PASTE_UNSUPPORTED {
                    info!("device understands raw paste but does not support it");
                } else {
                    info!(reply = ?String::from_utf8_lossy(other.bytes()), "device does not support raw paste");
                }
                self.paste_support = Some(false);
                self.transport.flush_input().await?;
                self.set_mode(Mode::Raw);
                return Ok(None);
            }
        }

        let window = match self.transport.read_exact(2, banner).await? {
            ReadOutcome::Complete(bytes) => u16::from_le_bytes([bytes[0], bytes[1]]) as usize,
            ReadOutcome::TimedOut(partial) => {
                self.fail("raw paste window size missing");
                return Err(DeployError::protocol("raw paste window size", &partial));
            }
        };
        if window == 0 {
            self.fail("raw paste window of zero bytes");
            return Err(DeployError::protocol("non-zero raw paste window", &[0, 0]));
        }
        self.paste_support = Some(true);
        self.set_mode(Mode::RawPaste);

        let mut remaining = window;
        let mut offset = 0;
        while offset < payload.len() {
            // Flow control that already arrived comes first; an abort must not
            // be mistaken for the end-of-data acknowledgement.
            self.drain_paste_flow(window, &mut remaining).await?;
            if remaining == 0 {
                match self.transport.read_exact(1, Some(timeout)).await? {
                    ReadOutcome::Complete(b) => {
                        self.paste_flow_byte(b[0], window, &mut remaining).await?;
                    }
                    ReadOutcome::TimedOut(partial) => {
                        return Ok(Some(Submission::TimedOut(partial)));
                    }
                }
                continue;
            }
            let n = remaining.min(payload.len() - offset);
            self.transport.write(&payload[offset..offset + n]).await?;
            offset += n;
            remaining -= n;
        }
        self.drain_paste_flow(window, &mut remaining).await?;

        self.transport.write(control::EXECUTE).await?;
        match self
            .transport
            .read_until(&[control::EOT], Some(timeout))
            .await?
        {
            ReadOutcome::Complete(_) => Ok(Some(Submission::Sent)),
            ReadOutcome::TimedOut(partial) => Ok(Some(Submission::TimedOut(partial))),
        }
    }

    /// Consume flow-control bytes that are already waiting, without blocking.
    async fn drain_paste_flow(
        &mut self,
        window: usize,
        remaining: &mut usize,
    ) -> Result<(), DeployError> {
        while let ReadOutcome::Complete(b) = self.transport.read_exact(1, Some(Duration::ZERO)).await? {
            self.paste_flow_byte(b[0], window, remaining).await?;
        }
        Ok(())
    }

    async fn paste_flow_byte(
        &mut self,
        byte: u8,
        window: usize,
        remaining: &mut usize,
    ) -> Result<(), DeployError> {
        match byte {
            control::PASTE_WINDOW_INC => {
                *remaining += window;
                Ok(())
            }
            control::PASTE_ABORT => {
                self.transport.write(control::EXECUTE).await?;
                self.fail("device aborted raw paste input");
                Err(DeployError::protocol("raw paste flow control", &[byte]))
            }
            other => {
                self.fail("unexpected raw paste flow-control byte");
                Err(DeployError::protocol("raw paste flow control", &[other]))
            }
        }
    }

    async fn submit_raw(&mut self, payload: &[u8]) -> Result<Submission, DeployError> {
        for (i, piece) in payload.chunks(RAW_WRITE_CHUNK).enumerate() {
            if i > 0 {
                tokio::time::sleep(RAW_WRITE_PAUSE).await;
            }
            self.transport.write(piece).await?;
        }
        self.transport.write(control::EXECUTE).await?;
        match self
            .transport
            .read_exact(control::RAW_ACK.len(), Some(self.config.timeouts.banner))
            .await?
        {
            ReadOutcome::Complete(ref ack) if ack == control::RAW_ACK => Ok(Submission::Sent),
            ReadOutcome::Complete(other) => {
                self.fail("raw submission not acknowledged");
                Err(DeployError::protocol("OK", &other))
            }
            ReadOutcome::TimedOut(partial) => Ok(Submission::TimedOut(partial)),
        }
    }

    async fn collect(&mut self, timeout: Duration) -> Result<SessionResult, DeployError> {
        self.set_mode(Mode::Executing);
        let deadline = Instant::now() + timeout;

        let stdout = match self
            .transport
            .read_until(control::RESULT_MARKER, Some(remaining(deadline)))
            .await?
        {
            ReadOutcome::Complete(bytes) => bytes,
            ReadOutcome::TimedOut(partial) => return Ok(self.timed_out(partial, timeout)),
        };
        let traceback = match self
            .transport
            .read_until(control::EXCEPTION_MARKER, Some(remaining(deadline)))
            .await?
        {
            ReadOutcome::Complete(bytes) => bytes,
            ReadOutcome::TimedOut(partial) => {
                let mut seen = stdout;
                seen.extend_from_slice(&partial);
                return Ok(self.timed_out(seen, timeout));
            }
        };
        if let ReadOutcome::TimedOut(_) = self
            .transport
            .read_until(control::RAW_PROMPT, Some(self.config.timeouts.banner))
            .await?
        {
            warn!("no raw prompt after command result");
        }
        self.set_mode(Mode::Raw);

        let output = segment_text(&stdout, control::RESULT_MARKER);
        let traceback = segment_text(&traceback, control::EXCEPTION_MARKER);
        if traceback.trim().is_empty() {
            Ok(SessionResult {
                outcome: Outcome::Ok,
                output,
            })
        } else {
            self.last_error = Some(traceback.clone());
            Ok(SessionResult {
                outcome: Outcome::RemoteError(traceback),
                output,
            })
        }
    }

    fn timed_out(&mut self, partial: Vec<u8>, timeout: Duration) -> SessionResult {
        self.fail(format!("no result within {}ms", timeout.as_millis()));
        SessionResult {
            outcome: Outcome::Timeout,
            output: String::from_utf8_lossy(&partial).into_owned(),
        }
    }

    /// Send Ctrl-C to stop the running program.
    pub async fn interrupt(&mut self) -> Result<(), DeployError> {
        self.transport.write(&[control::ETX]).await?;
        Ok(())
    }

    /// Interrupt, leave raw mode and soft-reboot the interpreter.
    pub async fn soft_reset(&mut self) -> Result<(), DeployError> {
        info!("soft reset");
        self.transport.write(control::SOFT_RESET).await?;
        let banner = Some(self.config.timeouts.banner);
        match self
            .transport
            .read_until(control::SOFT_REBOOT_NOTICE, banner)
            .await?
        {
            ReadOutcome::Complete(_) => {
                if let ReadOutcome::TimedOut(_) = self
                    .transport
                    .read_until(control::FRIENDLY_PROMPT, banner)
                    .await?
                {
                    debug!("no friendly prompt after soft reboot");
                }
            }
            ReadOutcome::TimedOut(_) => warn!("no soft reboot notice after soft reset"),
        }
        self.set_mode(Mode::Normal);
        Ok(())
    }

    /// Reboot the board. The link usually drops, which is not an error here.
    pub async fn hard_reset(&mut self) -> Result<(), DeployError> {
        info!("hard reset");
        let timeout = self.config.timeouts.banner;
        match self.exec("import machine\nmachine.reset()\n", timeout).await {
            Ok(result) => debug!(outcome = ?result.outcome, "reset command returned"),
            Err(err) => debug!(error = %err, "link dropped during reset"),
        }
        self.set_mode(Mode::Normal);
        Ok(())
    }

    /// Return the interpreter to friendly mode and hand back the transport.
    pub async fn release(mut self) -> T {
        self.exit_raw().await;
        self.transport
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn segment_text(bytes: &[u8], marker: &[u8]) -> String {
    let body = bytes.strip_suffix(marker).unwrap_or(bytes);
    String::from_utf8_lossy(body).into_owned()
}

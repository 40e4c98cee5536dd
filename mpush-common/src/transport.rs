//! Duplex byte transport underneath the REPL session.
//!
//! The transport knows nothing about the interpreter: it writes bytes, reads
//! until a marker shows up or a deadline passes, and discards stale input.

use std::future::Future;
use std::time::Duration;

use memchr::memmem;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::trace;

/// Default bound for reads that do not pass their own timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Quiet period after which `flush_input` considers the line drained.
const DRAIN_QUIET: Duration = Duration::from_millis(15);

const READ_BUF_SIZE: usize = 512;

/// Errors raised by the byte channel itself.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("link closed by the device")]
    Closed,
}

/// Result of a bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The marker (or the requested byte count) arrived. For `read_until` the
    /// bytes include the marker.
    Complete(Vec<u8>),
    /// The deadline passed first; carries whatever was received meanwhile.
    TimedOut(Vec<u8>),
}

impl ReadOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Complete(bytes) | Self::TimedOut(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Complete(bytes) | Self::TimedOut(bytes) => bytes,
        }
    }
}

/// Byte channel contract used by [`crate::session::ReplSession`].
///
/// Reads take an optional timeout; `None` uses the bound configured with
/// [`Transport::set_timeout`].
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn read_until(
        &mut self,
        marker: &[u8],
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<ReadOutcome, TransportError>> + Send;

    fn read_exact(
        &mut self,
        len: usize,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<ReadOutcome, TransportError>> + Send;

    /// Discard everything received but not yet consumed.
    fn flush_input(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn set_timeout(&mut self, timeout: Duration);

    fn timeout(&self) -> Duration;
}

/// [`Transport`] over any tokio byte stream (serial port, duplex pipe, socket).
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    pending: Vec<u8>,
    read_timeout: Duration,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Pull one read's worth of bytes into `pending`, or report the deadline.
    async fn fill(&mut self, deadline: Instant) -> Result<bool, TransportError> {
        let mut buf = [0u8; READ_BUF_SIZE];
        match timeout_at(deadline, self.stream.read(&mut buf)).await {
            Err(_) => Ok(false),
            Ok(Ok(0)) => Err(TransportError::Closed),
            Ok(Ok(n)) => {
                trace!(bytes = n, "link rx");
                self.pending.extend_from_slice(&buf[..n]);
                Ok(true)
            }
            Ok(Err(err)) => Err(err.into()),
        }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!(bytes = bytes.len(), "link tx");
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_until(
        &mut self,
        marker: &[u8],
        timeout: Option<Duration>,
    ) -> Result<ReadOutcome, TransportError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.read_timeout);
        let mut searched: usize = 0;
        loop {
            let window_start = searched.saturating_sub(marker.len().saturating_sub(1));
            if let Some(pos) = memmem::find(&self.pending[window_start..], marker) {
                let end = window_start + pos + marker.len();
                let rest = self.pending.split_off(end);
                let found = std::mem::replace(&mut self.pending, rest);
                return Ok(ReadOutcome::Complete(found));
            }
            searched = self.pending.len();
            if !self.fill(deadline).await? {
                return Ok(ReadOutcome::TimedOut(std::mem::take(&mut self.pending)));
            }
        }
    }

    async fn read_exact(
        &mut self,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<ReadOutcome, TransportError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.read_timeout);
        while self.pending.len() < len {
            if !self.fill(deadline).await? {
                return Ok(ReadOutcome::TimedOut(std::mem::take(&mut self.pending)));
            }
        }
        let rest = self.pending.split_off(len);
        Ok(ReadOutcome::Complete(std::mem::replace(
            &mut self.pending,
            rest,
        )))
    }

    async fn flush_input(&mut self) -> Result<(), TransportError> {
        let mut discarded = std::mem::take(&mut self.pending).len();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match timeout(DRAIN_QUIET, self.stream.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => discarded += n,
                Ok(Err(err)) => return Err(err.into()),
            }
        }
        if discarded > 0 {
            trace!(bytes = discarded, "discarded stale input");
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.read_timeout
    }
}

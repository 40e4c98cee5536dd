//! Serial port binding for the REPL transport.

use std::time::Duration;

use mpush_common::retry::RetryableError;
use mpush_common::{ErrorCode, RetryPolicy, StreamTransport, run_with_retry};
use thiserror::Error;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

/// Inter-read timeout for the serial transport; session deadlines sit on top.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
#[error("cannot open {port}: {source}")]
pub struct PortError {
    pub port: String,
    #[source]
    pub source: tokio_serial::Error,
}

impl PortError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::LinkOpenFailed
    }
}

impl RetryableError for PortError {
    // A board that just reset re-enumerates; busy or missing is worth another try.
    fn is_retryable(&self) -> bool {
        matches!(
            self.source.kind,
            tokio_serial::ErrorKind::NoDevice | tokio_serial::ErrorKind::Io(_)
        )
    }
}

/// Open `port` at `baud`, retrying transient failures under `policy`.
pub async fn open(
    port: &str,
    baud: u32,
    policy: &RetryPolicy,
) -> Result<StreamTransport<SerialStream>, PortError> {
    let stream = run_with_retry("open serial port", policy, || async {
        tokio_serial::new(port, baud)
            .open_native_async()
            .map_err(|source| PortError {
                port: port.to_string(),
                source,
            })
    })
    .await?;
    info!(port, baud, "serial port open");
    Ok(StreamTransport::new(stream).with_timeout(READ_TIMEOUT))
}

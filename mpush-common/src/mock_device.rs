//! Simulated MicroPython board for tests.
//!
//! The device runs as a tokio task on one end of an in-memory duplex pipe and
//! speaks the raw REPL control-byte protocol: friendly and raw modes, raw
//! paste with flow control, result framing, interrupts and soft reboot. What
//! a submitted script "does" is decided by queued [`MockReply`] values or a
//! reply closure; the device never interprets the source.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::task::JoinHandle;

use crate::control::{ENQ, EOT, ETX, RAW_BANNER, SOH, STX};
use crate::transport::StreamTransport;

const PIPE_CAPACITY: usize = 64 * 1024;

const FRIENDLY_BANNER: &[u8] = b"\r\nMicroPython v1.22.2 on 2024-02-22; mock board with simulated port\r\n\
Type \"help()\" for more information.\r\n>>> ";

const INTERRUPTED: &[u8] =
    b"\x04Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nKeyboardInterrupt: \r\n\x04>";

/// What the device does with one submitted script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Print this stdout and finish cleanly.
    Ok(String),
    /// Finish with this traceback.
    Error(String),
    /// Acknowledge the submission, then run until interrupted.
    Hang,
    /// Print this stdout, then run until interrupted.
    HangAfter(String),
    /// Send these bytes instead of the submission acknowledgement.
    Garbage(Vec<u8>),
}

impl MockReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::Ok(stdout.into())
    }

    pub fn error(traceback: impl Into<String>) -> Self {
        Self::Error(traceback.into())
    }
}

type ReplyFn = Box<dyn FnMut(&str) -> MockReply + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PasteSupport {
    Supported(u16),
    /// Understands the request, answers `R\x00`.
    Refused,
    /// Predates raw paste: the request is plain input.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Friendly,
    Raw,
    PasteRequest { seen_a: bool },
    Paste { since_grant: usize },
    PasteAborted,
    Running,
}

#[derive(Debug, Default)]
struct DeviceLog {
    scripts: Vec<String>,
    raw_entry_requests: usize,
    soft_resets: usize,
    paste_submissions: usize,
    raw_mode: bool,
}

/// Handle to a running simulated device.
///
/// Dropping the handle stops the device task.
pub struct MockDevice {
    log: Arc<Mutex<DeviceLog>>,
    task: JoinHandle<()>,
}

impl MockDevice {
    pub fn builder() -> MockDeviceBuilder {
        MockDeviceBuilder::default()
    }

    fn log(&self) -> MutexGuard<'_, DeviceLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scripts the device executed, in order.
    pub fn scripts(&self) -> Vec<String> {
        self.log().scripts.clone()
    }

    pub fn exec_count(&self) -> usize {
        self.log().scripts.len()
    }

    /// Raw-entry requests received, including ignored ones.
    pub fn raw_entry_requests(&self) -> usize {
        self.log().raw_entry_requests
    }

    pub fn soft_resets(&self) -> usize {
        self.log().soft_resets
    }

    /// Scripts that arrived through raw paste.
    pub fn paste_submissions(&self) -> usize {
        self.log().paste_submissions
    }

    pub fn in_raw_mode(&self) -> bool {
        self.log().raw_mode
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDevice")
            .field("log", &*self.log())
            .finish()
    }
}

/// When the device aborts raw-paste input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PasteAbort {
    Never,
    /// On the first data byte.
    OnData,
    /// Right behind the window grant, before any data.
    OnGrant,
}

pub struct MockDeviceBuilder {
    paste: PasteSupport,
    abort_paste: PasteAbort,
    ignore_raw_entries: usize,
    silent: bool,
    replies: VecDeque<MockReply>,
    handler: Option<ReplyFn>,
}

impl Default for MockDeviceBuilder {
    fn default() -> Self {
        Self {
            paste: PasteSupport::Supported(128),
            abort_paste: PasteAbort::Never,
            ignore_raw_entries: 0,
            silent: false,
            replies: VecDeque::new(),
            handler: None,
        }
    }
}

impl MockDeviceBuilder {
    /// Raw-paste window size announced to the host.
    pub fn paste_window(mut self, window: u16) -> Self {
        self.paste = PasteSupport::Supported(window);
        self
    }

    /// Answer raw-paste requests with `R\x00`.
    pub fn refuse_raw_paste(mut self) -> Self {
        self.paste = PasteSupport::Refused;
        self
    }

    /// Firmware without raw paste: the request bytes are ordinary input.
    pub fn legacy_firmware(mut self) -> Self {
        self.paste = PasteSupport::Unknown;
        self
    }

    /// Abort raw-paste input as soon as data arrives.
    pub fn abort_paste(mut self) -> Self {
        self.abort_paste = PasteAbort::OnData;
        self
    }

    /// Send the abort together with the window grant, so it is already
    /// waiting when the host starts writing.
    pub fn abort_paste_on_grant(mut self) -> Self {
        self.abort_paste = PasteAbort::OnGrant;
        self
    }

    /// Ignore the first `count` raw-entry requests.
    pub fn ignore_raw_entries(mut self, count: usize) -> Self {
        self.ignore_raw_entries = count;
        self
    }

    /// Never answer anything.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Queue a reply; queued replies are used before the reply closure.
    pub fn reply(mut self, reply: MockReply) -> Self {
        self.replies.push_back(reply);
        self
    }

    pub fn reply_with<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&str) -> MockReply + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Start the device and return the host end as a transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> (StreamTransport<DuplexStream>, MockDevice) {
        let (host, device_end) = duplex(PIPE_CAPACITY);
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let device = Device {
            state: State::Friendly,
            buffer: Vec::new(),
            paste: self.paste,
            abort_paste: self.abort_paste,
            ignore_raw_entries: self.ignore_raw_entries,
            silent: self.silent,
            replies: self.replies,
            handler: self.handler,
            log: log.clone(),
        };
        let task = tokio::spawn(device.run(device_end));
        (StreamTransport::new(host), MockDevice { log, task })
    }
}

struct Device {
    state: State,
    buffer: Vec<u8>,
    paste: PasteSupport,
    abort_paste: PasteAbort,
    ignore_raw_entries: usize,
    silent: bool,
    replies: VecDeque<MockReply>,
    handler: Option<ReplyFn>,
    log: Arc<Mutex<DeviceLog>>,
}

impl Device {
    async fn run(mut self, mut stream: DuplexStream) {
        let mut buf = [0u8; 1024];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                let out = self.on_byte(byte);
                if !out.is_empty() && stream.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    }

    fn log(&self) -> MutexGuard<'_, DeviceLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_byte(&mut self, byte: u8) -> Vec<u8> {
        if self.silent {
            if byte == SOH {
                self.log().raw_entry_requests += 1;
            }
            return Vec::new();
        }
        match self.state {
            State::Friendly => self.friendly(byte),
            State::Raw => self.raw(byte),
            State::PasteRequest { seen_a } => self.paste_request(byte, seen_a),
            State::Paste { since_grant } => self.paste(byte, since_grant),
            State::PasteAborted => {
                if byte == EOT {
                    self.state = State::Raw;
                }
                Vec::new()
            }
            State::Running => {
                if byte == ETX {
                    self.state = State::Raw;
                    self.buffer.clear();
                    INTERRUPTED.to_vec()
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn set_raw(&mut self, raw: bool) {
        self.state = if raw { State::Raw } else { State::Friendly };
        self.log().raw_mode = raw;
    }

    fn raw_entry(&mut self) -> Vec<u8> {
        self.log().raw_entry_requests += 1;
        if self.ignore_raw_entries > 0 {
            self.ignore_raw_entries -= 1;
            return Vec::new();
        }
        self.buffer.clear();
        self.set_raw(true);
        RAW_BANNER.to_vec()
    }

    fn soft_reboot(&mut self) -> Vec<u8> {
        self.log().soft_resets += 1;
        let mut out = b"MPY: soft reboot\r\n".to_vec();
        if self.state == State::Raw {
            out.extend_from_slice(RAW_BANNER);
        } else {
            out.extend_from_slice(FRIENDLY_BANNER);
        }
        out
    }

    fn friendly(&mut self, byte: u8) -> Vec<u8> {
        match byte {
            SOH => self.raw_entry(),
            STX => FRIENDLY_BANNER.to_vec(),
            ETX => b"\r\n>>> ".to_vec(),
            EOT => self.soft_reboot(),
            _ => Vec::new(),
        }
    }

    fn raw(&mut self, byte: u8) -> Vec<u8> {
        match byte {
            SOH => self.raw_entry(),
            STX => {
                self.set_raw(false);
                FRIENDLY_BANNER.to_vec()
            }
            ETX => {
                self.buffer.clear();
                Vec::new()
            }
            EOT if self.buffer.is_empty() => {
                let mut out = b"OK".to_vec();
                out.extend(self.soft_reboot());
                out
            }
            EOT => {
                let source = std::mem::take(&mut self.buffer);
                self.execute(source, b"OK")
            }
            ENQ => {
                self.state = State::PasteRequest { seen_a: false };
                Vec::new()
            }
            b => {
                self.buffer.push(b);
                Vec::new()
            }
        }
    }

    fn paste_request(&mut self, byte: u8, seen_a: bool) -> Vec<u8> {
        match (seen_a, byte) {
            (false, b'A') => {
                self.state = State::PasteRequest { seen_a: true };
                Vec::new()
            }
            (true, SOH) => match self.paste {
                PasteSupport::Supported(window) => {
                    let [lo, hi] = window.to_le_bytes();
                    if self.abort_paste == PasteAbort::OnGrant {
                        self.state = State::PasteAborted;
                        return vec![b'R', 0x01, lo, hi, EOT];
                    }
                    self.state = State::Paste { since_grant: 0 };
                    vec![b'R', 0x01, lo, hi]
                }
                PasteSupport::Refused => {
                    self.state = State::Raw;
                    b"R\x00".to_vec()
                }
                PasteSupport::Unknown => {
                    self.state = State::Raw;
                    self.raw_entry()
                }
            },
            _ => {
                self.state = State::Raw;
                self.buffer.push(ENQ);
                if seen_a {
                    self.buffer.push(b'A');
                }
                self.raw(byte)
            }
        }
    }

    fn paste(&mut self, byte: u8, since_grant: usize) -> Vec<u8> {
        if byte == EOT {
            self.state = State::Raw;
            self.log().paste_submissions += 1;
            let source = std::mem::take(&mut self.buffer);
            return self.execute(source, &[EOT]);
        }
        if self.abort_paste == PasteAbort::OnData {
            self.state = State::PasteAborted;
            self.buffer.clear();
            return vec![EOT];
        }
        self.buffer.push(byte);
        let window = match self.paste {
            PasteSupport::Supported(window) => usize::from(window.max(1)),
            _ => usize::MAX,
        };
        if since_grant + 1 >= window {
            self.state = State::Paste { since_grant: 0 };
            vec![SOH]
        } else {
            self.state = State::Paste {
                since_grant: since_grant + 1,
            };
            Vec::new()
        }
    }

    fn next_reply(&mut self, source: &str) -> MockReply {
        if let Some(reply) = self.replies.pop_front() {
            return reply;
        }
        match self.handler.as_mut() {
            Some(handler) => handler(source),
            None => MockReply::Ok(String::new()),
        }
    }

    /// Run one submitted script; `ack` is what the device sends on accepting it.
    fn execute(&mut self, source: Vec<u8>, ack: &[u8]) -> Vec<u8> {
        let source = String::from_utf8_lossy(&source).into_owned();
        let reply = self.next_reply(&source);
        self.log().scripts.push(source);

        let mut out = ack.to_vec();
        match reply {
            MockReply::Ok(stdout) => {
                out.extend_from_slice(stdout.as_bytes());
                out.extend_from_slice(&[EOT, EOT, b'>']);
            }
            MockReply::Error(traceback) => {
                out.push(EOT);
                out.extend_from_slice(traceback.as_bytes());
                out.extend_from_slice(&[EOT, b'>']);
            }
            MockReply::Hang => self.state = State::Running,
            MockReply::HangAfter(stdout) => {
                out.extend_from_slice(stdout.as_bytes());
                self.state = State::Running;
            }
            MockReply::Garbage(bytes) => out = bytes,
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ReadOutcome, Transport};
    use std::time::Duration;

    const WAIT: Option<Duration> = Some(Duration::from_millis(200));

    #[tokio::test]
    async fn test_raw_entry_prints_banner() {
        let (mut host, device) = MockDevice::builder().spawn();
        host.write(b"\r\x01").await.unwrap();
        let outcome = host.read_until(RAW_BANNER, WAIT).await.unwrap();
        assert!(outcome.is_complete());
        assert!(device.in_raw_mode());
        assert_eq!(device.raw_entry_requests(), 1);
    }

    #[tokio::test]
    async fn test_raw_submission_frames_result() {
        let (mut host, device) = MockDevice::builder()
            .reply(MockReply::ok("hi\r\n"))
            .spawn();
        host.write(b"\x01").await.unwrap();
        host.read_until(RAW_BANNER, WAIT).await.unwrap();

        host.write(b"print('hi')\x04").await.unwrap();
        let outcome = host.read_until(b">", WAIT).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Complete(b"OKhi\r\n\x04\x04>".to_vec()));
        assert_eq!(device.scripts(), vec!["print('hi')".to_string()]);
    }

    #[tokio::test]
    async fn test_paste_grants_windows() {
        let (mut host, device) = MockDevice::builder().paste_window(4).spawn();
        host.write(b"\x01").await.unwrap();
        host.read_until(RAW_BANNER, WAIT).await.unwrap();

        host.write(b"\x05A\x01").await.unwrap();
        let reply = host.read_exact(4, WAIT).await.unwrap();
        assert_eq!(reply.bytes(), &[b'R', 0x01, 4, 0]);

        host.write(b"abcd").await.unwrap();
        let grant = host.read_exact(1, WAIT).await.unwrap();
        assert_eq!(grant.bytes(), &[SOH]);

        host.write(b"e\x04").await.unwrap();
        let result = host.read_until(b">", WAIT).await.unwrap();
        assert_eq!(result.bytes(), b"\x04\x04\x04>");
        assert_eq!(device.paste_submissions(), 1);
        assert_eq!(device.scripts(), vec!["abcde".to_string()]);
    }

    #[tokio::test]
    async fn test_interrupt_stops_hanging_script() {
        let (mut host, _device) = MockDevice::builder().reply(MockReply::Hang).spawn();
        host.write(b"\x01").await.unwrap();
        host.read_until(RAW_BANNER, WAIT).await.unwrap();
        host.write(b"while True: pass\x04").await.unwrap();
        assert_eq!(host.read_exact(2, WAIT).await.unwrap().bytes(), b"OK");

        host.write(&[ETX]).await.unwrap();
        let outcome = host.read_until(b"\x04>", WAIT).await.unwrap();
        assert!(String::from_utf8_lossy(outcome.bytes()).contains("KeyboardInterrupt"));
    }
}

//! Control-byte sequences of the MicroPython raw REPL protocol.
//!
//! These values are fixed by the interpreter and must be reproduced bit for
//! bit. Nothing here is negotiated at runtime.

/// Ctrl-A: enter raw REPL from the friendly REPL.
pub const SOH: u8 = 0x01;
/// Ctrl-B: leave raw REPL back to the friendly REPL.
pub const STX: u8 = 0x02;
/// Ctrl-C: interrupt the running program.
pub const ETX: u8 = 0x03;
/// Ctrl-D: execute submitted code / end of output segment / soft reboot.
pub const EOT: u8 = 0x04;
/// Ctrl-E: first byte of the raw-paste request.
pub const ENQ: u8 = 0x05;

/// Interrupt whatever is running, twice, after terminating the current line.
pub const INTERRUPT: &[u8] = b"\r\x03\x03";

/// Raw-mode entry request.
pub const RAW_ENTER: &[u8] = b"\r\x01";

/// Banner printed by the device once raw mode is active.
pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";

/// Raw-mode exit request.
pub const RAW_EXIT: &[u8] = &[STX];

/// Prompt of the friendly (interactive) REPL.
pub const FRIENDLY_PROMPT: &[u8] = b">>> ";

/// Raw-paste entry request: `ENQ 'A' SOH`.
pub const PASTE_ENTER: &[u8] = b"\x05A\x01";

/// Device reply when raw paste is supported; followed by a u16 LE window size.
pub const PASTE_SUPPORTED: &[u8] = b"R\x01";

/// Device reply when raw paste is understood but unsupported.
pub const PASTE_UNSUPPORTED: &[u8] = b"R\x00";

/// Flow-control byte granting one more window during raw paste.
pub const PASTE_WINDOW_INC: u8 = SOH;

/// Flow-control byte with which the device aborts raw-paste input.
pub const PASTE_ABORT: u8 = EOT;

/// Trigger that executes the submitted code.
pub const EXECUTE: &[u8] = &[EOT];

/// Acknowledgement of a plain raw-mode submission.
pub const RAW_ACK: &[u8] = b"OK";

/// Terminates the stdout segment of an execution result.
pub const RESULT_MARKER: &[u8] = &[EOT];

/// Terminates the traceback segment of an execution result.
pub const EXCEPTION_MARKER: &[u8] = &[EOT];

/// Raw REPL prompt printed after each execution.
pub const RAW_PROMPT: &[u8] = b">";

/// Soft reset: interrupt, leave raw mode, then Ctrl-D in the friendly REPL.
pub const SOFT_RESET: &[u8] = &[ETX, STX, EOT];

/// Printed by the interpreter as it soft-reboots.
pub const SOFT_REBOOT_NOTICE: &[u8] = b"soft reboot";

//! Stable error codes for diagnostics.
//!
//! See [`catalog`] for the code ranges.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

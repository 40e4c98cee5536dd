//! Shared helpers for the integration tests.

#![allow(dead_code)]

pub mod logging;

use std::time::Duration;

use mpush_common::plan::PlanStep;
use mpush_common::{
    FilePayload, MockDevice, MockReply, PlanOptions, SessionConfig, Timeouts, TransferPlan,
};

pub use logging::init_test_logging;

/// Session settings scaled down so failure paths finish in milliseconds.
pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        timeouts: Timeouts {
            banner: Duration::from_millis(100),
            command: Duration::from_millis(150),
            write_per_kib: Duration::from_millis(50),
            delete: Duration::from_millis(150),
        },
        raw_entry_attempts: 3,
        raw_paste: true,
    }
}

pub fn payload(remote: &str, data: &[u8]) -> FilePayload {
    FilePayload::new(remote.trim_start_matches('/'), remote, data.to_vec())
}

pub fn plan(files: &[(&str, &[u8])], options: &PlanOptions) -> TransferPlan {
    let payloads: Vec<_> = files.iter().map(|(remote, data)| payload(remote, data)).collect();
    TransferPlan::build(&payloads, options).expect("plan builds")
}

/// What a healthy board prints for each step of `plan`.
pub fn healthy_replies(plan: &TransferPlan) -> Vec<MockReply> {
    plan.steps
        .iter()
        .map(|step| match step {
            PlanStep::WriteChunk { chunk, .. } => MockReply::ok(format!("{}\r\n", chunk.len)),
            PlanStep::Verify { expected_size, .. } => MockReply::ok(format!("{expected_size}\r\n")),
            PlanStep::Wipe { .. } | PlanStep::Mkdir { .. } => MockReply::ok(""),
        })
        .collect()
}

/// Device builder with `replies` queued in order.
pub fn device_with(replies: Vec<MockReply>) -> mpush_common::mock_device::MockDeviceBuilder {
    replies
        .into_iter()
        .fold(MockDevice::builder(), |builder, reply| builder.reply(reply))
}

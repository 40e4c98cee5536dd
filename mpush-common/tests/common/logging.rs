use tracing_subscriber::{EnvFilter, fmt};

/// Route `tracing` output through the test harness; `RUST_LOG` refines it.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mpush_common=debug"));
    let _ = fmt().with_test_writer().with_env_filter(filter).try_init();
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}

//! Helpers for wiring this crate's tracing output up to a subscriber.

use tracing_subscriber::EnvFilter;

/// Install a console subscriber honoring `RUST_LOG`, for tests and for
/// binaries embedding the manager that have no subscriber of their own.
/// Safe to call more than once; later calls are no-ops.
pub fn init_console_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

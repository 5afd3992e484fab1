//! Tracing and logging setup shared by processes embedding the runtime.

/// Initialize process-wide tracing with settings from the environment.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

pub mod tracing;

pub use tracing::{init_for_tests, init_with, LogFormat, TracingConfig, TracingConfigError};

//! Process-wide tracing/logging setup shared by spindle binaries.

pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat};

/// Initialize process-wide observability with the defaults
/// (`info`, JSON lines), honouring `RUST_LOG` and `SPINDLE_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogConfig::from_env());
}

/// Like [`init`], with explicit settings.
pub fn init_with(config: &LogConfig) {
    tracing::init(config);
}

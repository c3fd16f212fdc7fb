//! Tracing/logging setup shared by binaries, tests and benches.

pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};

/// Initialize process-wide tracing with defaults (JSON, `RUST_LOG`, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&TracingConfig::default());
}

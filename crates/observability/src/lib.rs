//! Tracing and logging setup shared by the API and worker binaries.

/// Initialize process-wide tracing for `service`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(service: &str) {
    tracing::init(service);
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::LogFormat;

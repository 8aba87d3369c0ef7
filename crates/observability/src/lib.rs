//! Tracing and logging setup shared by every costwise binary.

/// Initialize process-wide tracing with settings read from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogSettings::from_env());
}

/// Tracing configuration (filters, output format).
pub mod tracing;

//! Tracing/logging initialization.
//!
//! Workers and the API log through `tracing` with structured fields
//! (`job.id`, `tenant_id`, `worker_id`). This module only decides where those
//! records go and how they are rendered.

use tracing_subscriber::EnvFilter;

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line (production default).
    Json,
    /// Human-readable, multi-field lines for local development.
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Settings applied when the global subscriber is installed.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is not set.
    pub default_filter: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogSettings {
    /// Read `LOG_FORMAT` (`json` | `pretty`); anything else keeps JSON.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(format) = std::env::var("LOG_FORMAT").ok().as_deref().and_then(LogFormat::parse) {
            settings.format = format;
        }
        settings
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(settings: LogSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match settings.format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

//! Telemetry: structured logging for the job execution engine.
//!
//! Metrics and distributed tracing exporters are external collaborators
//! (see `spec.md` §1) — this module owns only the logging subsystem that
//! every other component writes through via `tracing`.

pub mod logging;

pub use logging::{
    init_logging, LogEventBuilder, LogFormat, LoggingConfig, RedactionConfig, RedactionPattern,
    SensitiveFieldRedactor,
};

use serde::Deserialize;

/// Top-level telemetry configuration, embedded in [`crate::config::Config`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Initialize the telemetry stack. Call once at process start.
pub fn init_telemetry(config: &TelemetryConfig, environment: &str) -> anyhow::Result<()> {
    init_logging(&config.logging, environment)
}

//! Structured error handling for the job execution engine.
//!
//! - A stable, machine-readable [`ErrorCode`] per `spec.md` §7's error kinds.
//! - User-friendly messages vs detailed internal messages.
//! - Error logging via `tracing`, with severity-based dispatch.
//! - Metrics counter recording on error paths (the exporter itself is an
//!   external collaborator; the core only emits the counter).

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

/// A specialized Result type for Nuvom operations.
pub type Result<T> = std::result::Result<T, NuvomError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes, one per error kind in `spec.md` §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Runner could not find the target task by name. Fails the job permanently.
    TaskNotRegistered,
    /// Per-job deadline exceeded; outcome depends on `timeout_policy`.
    Timeout,
    /// The task body raised; subject to the job's retry policy.
    UserException,
    /// Queue or result backend is unreachable.
    BackendUnavailable,
    /// A file-queue entry could not be decoded and was quarantined.
    DecodeCorruption,
    /// A `before_job`/`after_job`/`on_error` hook raised.
    HookFailure,
    /// A capability provider failed to load.
    PluginLoadFailure,
    /// A capability provider's major API version doesn't match the core's.
    VersionMismatch,
    /// Invalid cron expression, non-positive interval, bad timezone, or missing `run_at`.
    ScheduleMisconfigured,
    /// Registry lookup found no matching provider.
    NotFound,
    /// Registry lookup matched more than one provider and none was named.
    Ambiguous,
    /// Registration under a name that already exists, without `override`.
    Duplicate,
    /// A provider spec could not be imported/resolved.
    SpecImportFailed,
    /// A resolved symbol doesn't satisfy the plugin contract.
    ProtocolViolation,
    /// Malformed configuration, manifest, or declaration file.
    Configuration,
    /// Catch-all for unexpected internal failures.
    Internal,
}

impl ErrorCode {
    /// Whether this error class is inherently retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::UserException | ErrorCode::BackendUnavailable
        )
    }

    /// Coarse category, useful for metrics dimensioning.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::TaskNotRegistered | ErrorCode::UserException | ErrorCode::Timeout => {
                "job"
            }
            ErrorCode::BackendUnavailable | ErrorCode::DecodeCorruption => "backend",
            ErrorCode::HookFailure => "hook",
            ErrorCode::PluginLoadFailure
            | ErrorCode::VersionMismatch
            | ErrorCode::NotFound
            | ErrorCode::Ambiguous
            | ErrorCode::Duplicate
            | ErrorCode::SpecImportFailed
            | ErrorCode::ProtocolViolation => "registry",
            ErrorCode::ScheduleMisconfigured => "scheduler",
            ErrorCode::Configuration => "config",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Severity, used to pick the tracing macro in [`NuvomError::log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::HookFailure | ErrorCode::DecodeCorruption => ErrorSeverity::Low,
            ErrorCode::UserException
            | ErrorCode::Timeout
            | ErrorCode::TaskNotRegistered
            | ErrorCode::ScheduleMisconfigured
            | ErrorCode::PluginLoadFailure
            | ErrorCode::VersionMismatch
            | ErrorCode::NotFound
            | ErrorCode::Ambiguous
            | ErrorCode::Duplicate => ErrorSeverity::Medium,
            ErrorCode::BackendUnavailable | ErrorCode::SpecImportFailed
            | ErrorCode::ProtocolViolation | ErrorCode::Configuration => ErrorSeverity::High,
            ErrorCode::Internal => ErrorSeverity::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured, serializable failure detail for a job's terminal error record
/// (`spec.md` §3's `error? {type, message, traceback}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorDetail {
    pub r#type: String,
    pub message: String,
    pub traceback: Option<String>,
}

/// Extra, optional context attached to a [`NuvomError`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default)]
    pub context: HashMap<String, String>,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NuvomError
// ═══════════════════════════════════════════════════════════════════════════════

/// The engine's single structured error type.
#[derive(Debug, Error)]
pub struct NuvomError {
    pub code: ErrorCode,
    pub user_message: Cow<'static, str>,
    pub internal_message: Option<String>,
    pub details: ErrorDetails,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for NuvomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.user_message)
    }
}

impl NuvomError {
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_internal_message(mut self, msg: impl Into<String>) -> Self {
        self.internal_message = Some(msg.into());
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(self.code)
    }

    /// Log this error at a level appropriate to its severity, and record a
    /// metrics counter dimensioned by code category. The Prometheus exporter
    /// that scrapes this counter is an external collaborator (`spec.md` §1).
    pub fn log(&self) {
        counter!("nuvom_errors_total", "category" => self.code.category()).increment(1);
        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(code = ?self.code, internal = ?self.internal_message, "{}", self.user_message)
            }
            ErrorSeverity::Medium => {
                warn!(code = ?self.code, "{}", self.user_message)
            }
            ErrorSeverity::Low => {
                debug!(code = ?self.code, "{}", self.user_message)
            }
        }
    }

    // Convenience constructors for the kinds named in `spec.md` §7.

    pub fn task_not_registered(name: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotRegistered,
            format!("task '{name}' is not registered"),
        )
        .with_details(ErrorDetails::new().with_entity("task", name))
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        Self::new(ErrorCode::Timeout, "job execution timed out")
            .with_internal_message(format!("deadline of {timeout_secs}s exceeded"))
    }

    pub fn user_exception(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UserException, "task raised an exception")
            .with_internal_message(message.into())
    }

    pub fn backend_unavailable(backend: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::BackendUnavailable,
            format!("{backend} backend unavailable"),
        )
        .with_internal_message(reason.into())
    }

    pub fn decode_corruption(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(ErrorCode::DecodeCorruption, "queue entry failed to decode")
            .with_details(ErrorDetails::new().with_context("path", path))
    }

    pub fn hook_failure(hook: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::HookFailure, format!("{hook} hook failed"))
            .with_internal_message(reason.into())
    }

    pub fn plugin_load_failure(spec: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::PluginLoadFailure,
            format!("failed to load plugin '{spec}'"),
        )
        .with_internal_message(reason.into())
    }

    pub fn version_mismatch(name: &str, plugin_version: &str, core_version: &str) -> Self {
        Self::new(
            ErrorCode::VersionMismatch,
            format!("plugin '{name}' api_version {plugin_version} incompatible with core {core_version}"),
        )
    }

    pub fn spec_import_failed(spec: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::SpecImportFailed, format!("could not resolve provider spec '{spec}'"))
            .with_internal_message(reason.into())
    }

    pub fn protocol_violation(name: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ProtocolViolation,
            format!("plugin '{name}' does not satisfy the plugin contract"),
        )
        .with_internal_message(reason.into())
    }

    pub fn schedule_misconfigured(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ScheduleMisconfigured, reason.into())
    }

    pub fn not_found(capability: &str, name: Option<&str>) -> Self {
        let msg = match name {
            Some(n) => format!("no {capability} provider named '{n}'"),
            None => format!("no {capability} provider registered"),
        };
        Self::new(ErrorCode::NotFound, msg)
    }

    pub fn ambiguous(capability: &str) -> Self {
        Self::new(
            ErrorCode::Ambiguous,
            format!("multiple {capability} providers registered; specify one"),
        )
    }

    pub fn duplicate(capability: &str, name: &str) -> Self {
        Self::new(
            ErrorCode::Duplicate,
            format!("{capability} provider '{name}' already registered"),
        )
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Configuration, reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, "internal error").with_internal_message(reason.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From<> conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<std::io::Error> for NuvomError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorCode::BackendUnavailable, "filesystem operation failed").with_source(e)
    }
}

impl From<serde_json::Error> for NuvomError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorCode::DecodeCorruption, "serialization error").with_source(e)
    }
}

impl From<rmp_serde::encode::Error> for NuvomError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::new(ErrorCode::Internal, "encode error").with_source(e)
    }
}

impl From<rmp_serde::decode::Error> for NuvomError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::new(ErrorCode::DecodeCorruption, "decode error").with_source(e)
    }
}

impl From<sqlx::Error> for NuvomError {
    fn from(e: sqlx::Error) -> Self {
        Self::new(ErrorCode::BackendUnavailable, "sqlite backend error").with_source(e)
    }
}

impl From<config::ConfigError> for NuvomError {
    fn from(e: config::ConfigError) -> Self {
        Self::new(ErrorCode::Configuration, "configuration error").with_source(e)
    }
}

impl From<cron::error::Error> for NuvomError {
    fn from(e: cron::error::Error) -> Self {
        Self::new(ErrorCode::ScheduleMisconfigured, "invalid cron expression").with_source(e)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Context extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for attaching context to a `Result`.
pub trait ErrorContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<NuvomError>,
{
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let mut err: NuvomError = e.into();
            err.internal_message = Some(msg.into());
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Critical);
    }

    #[test]
    fn task_not_registered_carries_entity() {
        let err = NuvomError::task_not_registered("add");
        assert_eq!(err.code, ErrorCode::TaskNotRegistered);
        assert_eq!(err.details.entity_id.as_deref(), Some("add"));
    }

    #[test]
    fn retryable_classification() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::UserException.is_retryable());
        assert!(!ErrorCode::TaskNotRegistered.is_retryable());
        assert!(!ErrorCode::Duplicate.is_retryable());
    }

    #[test]
    fn display_includes_code() {
        let err = NuvomError::internal("boom");
        let s = err.to_string();
        assert!(s.contains("Internal"));
    }
}

//! Error handling for Apex Jobs.
//!
//! This module provides:
//! - A single crate error type with a stable, machine-readable code
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! Only setup-time failures travel as [`ApexError`]: construction, scheduling
//! rejection, context restoration, invalid lifecycle calls and interrupted
//! waits. Failures raised by a job payload are captured on its status as a
//! [`crate::jobs::JobError`] instead.
//!
//! # Usage
//!
//! ```rust,ignore
//! use apex_jobs::error::{ApexError, ErrorContext, Result};
//!
//! fn load_snapshot(raw: &str) -> Result<serde_json::Value> {
//!     let value = serde_json::from_str(raw).context("Failed to parse context snapshot")?;
//!     Ok(value)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Apex Jobs operations.
pub type Result<T> = std::result::Result<T, ApexError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Construction Errors (1000-1099)
    JobTypeNotFound,
    InvalidRequest,
    RequestConversionFailed,

    // Scheduling Errors (1100-1199)
    JobAlreadyExists,
    ExecutorShutdown,
    JobNotFound,

    // Lifecycle Errors (1200-1299)
    InvalidStateTransition,
    Interrupted,
    ContextRestoreFailed,

    // Persistence Errors (2000-2099)
    StoreError,
    RecordNotFound,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobTypeNotFound => 1000,
            Self::InvalidRequest => 1001,
            Self::RequestConversionFailed => 1002,

            Self::JobAlreadyExists => 1100,
            Self::ExecutorShutdown => 1101,
            Self::JobNotFound => 1102,

            Self::InvalidStateTransition => 1200,
            Self::Interrupted => 1201,
            Self::ContextRestoreFailed => 1202,

            Self::StoreError => 2000,
            Self::RecordNotFound => 2001,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "construction",
            1100..=1199 => "scheduling",
            1200..=1299 => "lifecycle",
            2000..=2099 => "persistence",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (unknown job type, duplicate id)
    Low,
    /// Operational issues (shutdown, interrupted waits)
    Medium,
    /// System errors (store failures, broken snapshots)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobTypeNotFound
            | ErrorCode::InvalidRequest
            | ErrorCode::RequestConversionFailed
            | ErrorCode::JobAlreadyExists
            | ErrorCode::JobNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::InvalidStateTransition => Self::Low,

            ErrorCode::ExecutorShutdown | ErrorCode::Interrupted => Self::Medium,

            ErrorCode::ContextRestoreFailed
            | ErrorCode::StoreError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::InternalError | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job id, job type, group path)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Apex Jobs.
#[derive(Error, Debug)]
pub struct ApexError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ApexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ApexError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "apex_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ApexError::internal(message.into()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ApexError::new(ErrorCode::RecordNotFound, message.into()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for ApexError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<anyhow::Error> for ApexError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ApexError>() {
            Ok(apex_error) => apex_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for ApexError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (
                ErrorCode::ConfigurationError,
                "Configuration error occurred",
            ),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl ApexError {
    // ─────────────────────────────────────────────────────────────────────────
    // Construction Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// No factory is registered for this job type.
    pub fn job_type_not_found(job_type: impl Into<String>) -> Self {
        let job_type = job_type.into();
        Self::new(
            ErrorCode::JobTypeNotFound,
            format!("No job registered for type: {}", job_type),
        )
        .with_details(ErrorDetails::new().with_entity("job_type", &job_type))
    }

    /// The request could not be adapted to what the job expects.
    pub fn request_conversion_failed(job_type: impl Into<String>, reason: impl Into<String>) -> Self {
        let job_type = job_type.into();
        Self::with_internal(
            ErrorCode::RequestConversionFailed,
            format!("Request is not compatible with job type {}", job_type),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("job_type", &job_type))
    }

    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// A live job already holds this id.
    pub fn job_already_exists(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(
            ErrorCode::JobAlreadyExists,
            format!("A job with id {} is already running", id),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job", &id)
                .with_suggestion("Wait for the running job to finish or use another id"),
        )
    }

    /// The executor no longer accepts jobs.
    pub fn executor_shutdown() -> Self {
        Self::new(
            ErrorCode::ExecutorShutdown,
            "Job executor has been shut down",
        )
    }

    /// Create a job not found error.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", &id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create an invalid state transition error.
    pub fn invalid_state_transition(from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid job state transition: {:?} -> {:?}", from, to),
        )
        .with_context("from_state", format!("{:?}", from))
        .with_context("to_state", format!("{:?}", to))
    }

    /// A blocking wait was interrupted.
    pub fn interrupted(what: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::Interrupted,
            format!("Interrupted while waiting for {}", what.into()),
        )
    }

    /// The execution context snapshot could not be restored.
    pub fn context_restore_failed(reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ContextRestoreFailed,
            "Failed to restore execution context",
            reason,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence / Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a status store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::StoreError, "Job status store failure", message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::JobTypeNotFound.category(), "construction");
        assert_eq!(ErrorCode::JobAlreadyExists.category(), "scheduling");
        assert_eq!(ErrorCode::Interrupted.category(), "lifecycle");
        assert_eq!(ErrorCode::StoreError.category(), "persistence");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_job_already_exists() {
        let error = ApexError::job_already_exists("install/app");
        assert_eq!(error.code(), ErrorCode::JobAlreadyExists);
        assert_eq!(error.details().entity_id.as_deref(), Some("install/app"));
        assert!(error.user_message().contains("install/app"));
    }

    #[test]
    fn test_error_context() {
        let error = ApexError::invalid_request("Missing property")
            .with_context("property", "namespace");

        assert!(error.details().context.contains_key("property"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::JobTypeNotFound),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::ExecutorShutdown),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StoreError),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InternalError),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.context("no such job").unwrap_err();
        assert_eq!(error.code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_error_display() {
        let error = ApexError::with_internal(
            ErrorCode::ContextRestoreFailed,
            "Failed to restore execution context",
            "snapshot is not an object",
        );

        let display = format!("{}", error);
        assert!(display.contains("ContextRestoreFailed"));
        assert!(display.contains("Failed to restore execution context"));
        assert!(display.contains("snapshot is not an object"));
    }
}

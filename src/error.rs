//! Error types for the processing core.
//!
//! [`PipelineError`] is the single error type threading through every
//! component (C1-C9). Each variant carries a [`category()`](PipelineError::category)
//! and an [`is_retryable()`](PipelineError::is_retryable) so the retry
//! executor (C3) and the orchestrator (C9) can make decisions without
//! string-matching.

use crate::logging::{log_error, log_warn};
use thiserror::Error;

/// High-level routing category for a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Normal business outcome, not a failure (e.g. duplicate hash).
    BusinessLogic,
    /// External collaborator failure (LLM provider, vector store, DB).
    External,
    /// Internal invariant breach; should alert.
    Internal,
    /// Caller/config mistake; not retryable.
    Client,
    /// Should be retried with backoff.
    Transient,
}

/// Convenience alias used throughout the crate.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors produced by the processing core.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The input path could not be read.
    #[error("failed to read file {path}: {message}")]
    Io { path: String, message: String },

    /// The input file contained zero bytes.
    #[error("file {path} is empty")]
    EmptyFile { path: String },

    /// A row with this `sha256_hex` already exists and is live.
    #[error("duplicate content hash: existing document id {doc_id}")]
    DuplicateHash { doc_id: i64 },

    /// Config or schema validation failed.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Transient failure from an external collaborator (429/5xx/timeout/network).
    #[error("transient failure calling {source_name}: {message}")]
    Transient {
        source_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Permanent failure from an external collaborator (4xx/auth/bad request).
    #[error("permanent failure calling {source_name}: {message}")]
    Permanent { source_name: String, message: String },

    /// The LLM client's circuit breaker is open; fail fast.
    #[error("circuit breaker open for {source_name}")]
    CircuitOpen { source_name: String },

    /// A compensating-transaction scope could not fully clean up.
    #[error("compensation needed: {message}")]
    CompensationNeeded { message: String },

    /// Operation was cancelled via deadline or explicit cancellation.
    #[error("operation cancelled: {message}")]
    Cancelled { message: String },

    /// An invariant the system relies on was violated.
    #[error("internal invariant violated: {message}")]
    Internal { message: String },

    /// The durable store reported an error unrelated to uniqueness.
    #[error("document store error: {message}")]
    Store { message: String },
}

impl PipelineError {
    /// Routing category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io { .. } => ErrorCategory::Client,
            Self::EmptyFile { .. } => ErrorCategory::Client,
            Self::DuplicateHash { .. } => ErrorCategory::BusinessLogic,
            Self::Validation { .. } => ErrorCategory::Client,
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Permanent { .. } => ErrorCategory::Client,
            Self::CircuitOpen { .. } => ErrorCategory::External,
            Self::CompensationNeeded { .. } => ErrorCategory::Internal,
            Self::Cancelled { .. } => ErrorCategory::Client,
            Self::Internal { .. } => ErrorCategory::Internal,
            Self::Store { .. } => ErrorCategory::External,
        }
    }

    /// Whether the retry executor (C3) should retry this error.
    ///
    /// Per `spec.md` §4.3: rate-limit, connection/DNS, timeout and 5xx are
    /// retryable; 4xx, validation, and circuit-open signals are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Truncates an error message to the 1000-char cap `spec.md` §7 requires
    /// for a failed document's `error_message` field.
    pub fn truncated_message(&self) -> String {
        let full = self.to_string();
        if full.len() <= 1000 {
            full
        } else {
            let mut truncated: String = full.chars().take(1000).collect();
            truncated.push('\u{2026}');
            truncated
        }
    }

    pub fn io(path: impl Into<String>, message: impl Into<String>) -> Self {
        let path = path.into();
        let message = message.into();
        log_error!(path = %path, message = %message, "file read failed");
        Self::Io { path, message }
    }

    pub fn empty_file(path: impl Into<String>) -> Self {
        let path = path.into();
        log_warn!(path = %path, "empty file rejected");
        Self::EmptyFile { path }
    }

    pub fn duplicate_hash(doc_id: i64) -> Self {
        Self::DuplicateHash { doc_id }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(message = %message, "validation failed");
        Self::Validation { message }
    }

    pub fn transient(
        source_name: impl Into<String>,
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let source_name = source_name.into();
        let message = message.into();
        log_warn!(source = %source_name, message = %message, "transient failure");
        Self::Transient {
            source_name,
            message,
            source,
        }
    }

    pub fn permanent(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        let source_name = source_name.into();
        let message = message.into();
        log_error!(source = %source_name, message = %message, "permanent failure");
        Self::Permanent {
            source_name,
            message,
        }
    }

    pub fn circuit_open(source_name: impl Into<String>) -> Self {
        let source_name = source_name.into();
        log_warn!(source = %source_name, "circuit breaker open, failing fast");
        Self::CircuitOpen { source_name }
    }

    pub fn compensation_needed(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(message = %message, "compensation needed");
        Self::CompensationNeeded { message }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(message = %message, "internal invariant violated");
        Self::Internal { message }
    }

    pub fn store(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(message = %message, "document store error");
        Self::Store { message }
    }
}

//! Error types for the runtime orchestration layer.
//!
//! Every provider reports failures through [`Error`]. The variants map onto a
//! small retry taxonomy ([`ErrorKind`]) that the fallback orchestrator uses to
//! decide whether a backend failure is worth trying elsewhere.

use crate::runtime::BackendType;
use std::time::Duration;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Spawn,
    Execution,
    ResourceExhausted,
    Timeout,
    NotFound,
    Configuration,
    Internal,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may succeed on retry.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Spawn | Self::ResourceExhausted | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spawn => "spawn",
            Self::Execution => "execution",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in the runtime orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Runtime could not be created.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Backend quota or capacity exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Runtime, snapshot or file not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Runtime is in the wrong state for the operation.
    #[error("runtime '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Command could not be executed (infra-level exec failure included).
    #[error("execution failed in runtime '{runtime}': {reason}")]
    Execution { runtime: String, reason: String },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A constructor is already registered for this backend.
    #[error("provider already registered for backend '{0}'")]
    ProviderAlreadyRegistered(BackendType),

    /// No constructor is registered for this backend.
    #[error("no provider registered for backend '{0}'")]
    ProviderNotRegistered(BackendType),

    // =========================================================================
    // External System Errors
    // =========================================================================
    /// Cluster API call failed.
    #[error("cluster API error during {operation}: {reason}")]
    Cluster { operation: String, reason: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Security Errors
    // =========================================================================
    /// Archive entry escapes its destination directory.
    #[error("path traversal detected: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn(_) | Self::Cluster { .. } => ErrorKind::Spawn,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } | Self::Execution { .. } | Self::PathTraversal { .. } => {
                ErrorKind::Execution
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Configuration(_)
            | Self::ProviderAlreadyRegistered(_)
            | Self::ProviderNotRegistered(_)
            | Self::Serialization(_) => ErrorKind::Configuration,
            Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failed operation may succeed if retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub(crate) fn execution(runtime: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::Execution {
            runtime: runtime.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub(crate) fn cluster(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Cluster {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

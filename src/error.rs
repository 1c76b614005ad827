//! Error types for the orchestrator
//!
//! Fatal errors abort the current component and surface a non-zero exit;
//! warnings are accumulated by the components themselves (see
//! [`crate::recovery`]) and never travel through this type.

use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::runtime::RuntimeError;

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Main error type for warden operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A prerequisite was missing before any mutation happened.
    ///
    /// Never triggers rollback: by definition nothing has changed yet.
    #[error("prerequisite check failed: {0}")]
    Prerequisite(String),

    /// Secret backend returned a typed failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Container runtime command failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// One service's credential could read another service's secret
    #[error("isolation violation: credential for '{service}' can read secrets of '{target}'")]
    Isolation {
        /// Service whose credential performed the read
        service: String,
        /// Service whose secret was readable
        target: String,
    },

    /// Generated credential failed its own authentication test
    #[error("authentication test failed for '{service}': {message}")]
    Authentication {
        /// Service whose credential was rejected
        service: String,
        /// What the backend said
        message: String,
    },

    /// PKI authority rejected a certificate request
    #[error("certificate issuance failed for '{service}': {message}")]
    Issuance {
        /// Service the certificate was requested for
        service: String,
        /// What the authority said
        message: String,
    },

    /// A bounded wait elapsed without the condition becoming true
    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// How long we waited
        elapsed: Duration,
    },

    /// Certificate file could not be parsed
    #[error("certificate parse error: {0}")]
    CertParse(String),

    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem error with context about what was being touched
    #[error("{context}: {source}")]
    Io {
        /// What was being done when the error occurred
        context: String,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Several independent operations failed within one fan-out step
    #[error("{} failures: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Create a prerequisite error with the given message
    pub fn prerequisite(msg: impl Into<String>) -> Self {
        Self::Prerequisite(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Wrap an I/O error with context about the path or operation involved
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True if this error occurred before any mutation and therefore must
    /// not trigger rollback.
    pub fn is_prerequisite(&self) -> bool {
        matches!(self, Self::Prerequisite(_))
    }
}

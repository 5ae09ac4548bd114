//! Engine error model.
//!
//! Every failure maps to a stable [`ErrorCategory`] and a retry hint so callers can
//! decide between showing a page-level error, a form error or a retry button.

use std::fmt;

use agency_portal_core::PortalError;
use serde::{Deserialize, Serialize};

/// Error categories for grouping and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// A tenant backend could not be reached or answered with a failure.
    Transport,
    /// Input rejected before any backend call.
    Validation,
    /// The backend refused the operation for this user.
    Authorization,
    /// Session persistence failed.
    Storage,
    /// Unexpected state.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Validation => write!(f, "validation"),
            Self::Authorization => write!(f, "authorization"),
            Self::Storage => write!(f, "storage"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Failure reported by a [`crate::source::TenantDataSource`] for one tenant call.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("fetch failed for tenant {tenant}: {message}")]
    Transport { tenant: String, message: String },
    #[error("fetch for tenant {tenant} timed out after {timeout_ms}ms")]
    Timeout { tenant: String, timeout_ms: u64 },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not authorized for tenant {tenant}: {message}")]
    Authorization { tenant: String, message: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Attribute a source failure to `tenant`.
    #[must_use]
    pub fn from_source(tenant: &str, err: SourceError) -> Self {
        match err {
            SourceError::Unavailable(message) => {
                Self::Transport { tenant: tenant.to_string(), message }
            }
            SourceError::Unauthorized(message) => {
                Self::Authorization { tenant: tenant.to_string(), message }
            }
            SourceError::NotFound(message) | SourceError::Rejected(message) => {
                Self::Validation(format!("tenant {tenant}: {message}"))
            }
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => ErrorCategory::Transport,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Authorization { .. } => ErrorCategory::Authorization,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transport | ErrorCategory::Storage)
    }

    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            category: self.category(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

impl From<PortalError> for EngineError {
    fn from(err: PortalError) -> Self {
        match err {
            PortalError::Validation(message) => Self::Validation(message),
            PortalError::UnknownTenant(tenant) => Self::Validation(format!("unknown tenant: {tenant}")),
            PortalError::Storage(message) => Self::Storage(message),
        }
    }
}

/// Serializable error view carried in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

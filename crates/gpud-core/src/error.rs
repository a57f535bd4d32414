//! Error taxonomy for the component runtime.
//!
//! Mirrors the kinds laid out for the registry and plugin runner: lookups
//! fail with [`GpudError::NotFound`], duplicate registration with
//! [`GpudError::AlreadyExists`], malformed specs with
//! [`GpudError::Validation`], and the plugin manager's two non-fatal
//! "try again later" cases are split so callers can tell them apart.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GpudError>;

#[derive(Debug, Error)]
pub enum GpudError {
    #[error("component not found: {0}")]
    NotFound(String),

    #[error("component already exists: {0}")]
    AlreadyExists(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("fatal error: {0}")]
    Fatal(String),
}

/// The plugin manager's two rate-limiting outcomes. Both are non-fatal and
/// callers are expected to distinguish them (the QPS bucket is exhausted vs.
/// the minimum retry interval for this script hasn't elapsed yet).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("QPS limit exceeded")]
    QpsLimitExceeded,

    #[error("minimum retry interval has not elapsed")]
    MinimumRetryInterval,
}

impl GpudError {
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    #[must_use]
    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists(name.into())
    }

    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

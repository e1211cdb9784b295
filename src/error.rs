use thiserror::Error;

/// Errors produced by the release and propagation engine.
///
/// Every variant is a typed outcome for the caller; nothing here is retried
/// by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A document, version, release or key does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate document within a scope, or a second active gray release.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed content for the declared format, or an invalid gray rule.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or invalid signature, unknown access key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Capability not granted, key expired or inactive, IP not allow-listed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A release transition attempted from the wrong status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Storage or serialization failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

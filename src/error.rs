//! Error types for therein-engine

use thiserror::Error;

/// Main error type for feed mutations and the realtime layer
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("Not authorized to {action}")]
    Forbidden { action: &'static str },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Concurrent write conflict: {message}")]
    Conflict { message: String },

    #[error("Transport failure: {message}")]
    Transport { message: String },
}

impl FeedError {
    /// HTTP-equivalent status for callers that surface mutations over a
    /// request/response edge:
    /// - 401: missing/bad credential
    /// - 404: target entity missing
    /// - 403: authorization check failed
    /// - 400: content constraints violated
    /// - 409: unresolved concurrent-write conflict (retryable)
    /// - 502: send to a dead channel
    pub fn status(&self) -> u16 {
        match self {
            Self::AuthRequired | Self::AuthFailed { .. } => 401,
            Self::NotFound { .. } => 404,
            Self::Forbidden { .. } => 403,
            Self::ValidationFailed { .. } => 400,
            Self::Conflict { .. } => 409,
            Self::Transport { .. } => 502,
        }
    }

    /// Only storage-level conflicts are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result type alias for therein-engine operations
pub type Result<T> = std::result::Result<T, FeedError>;

//! Error types for the upload controller and receiver

use thiserror::Error;

use crate::token::TokenError;

/// Main error type for upload orchestration
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object is already gone
    #[error("not found: {0}")]
    NotFound(String),

    /// Object exists but is owned by someone else
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Work queue key that is not `namespace/name`
    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    /// Token sealing or opening failed
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP listener failed
    #[error("server error: {0}")]
    Server(String),

    /// Watch caches did not finish their initial list in time
    #[error("cache sync error: {0}")]
    CacheSync(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a server error with the given message
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for a local not-found or an API 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// True for an ownership conflict or an API 409
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Whether re-queueing the key can make progress
    ///
    /// Configuration, key, and token errors fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::InvalidKey(_) | Error::Token(_))
    }
}

//! Error types for vaulthalla

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Policy: {0}")]
    Policy(String),

    #[error("Preflight space check failed: {0}")]
    PreflightSpace(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failure: {0}")]
    AuthFailure(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Error::AlreadyExists(msg.into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Error::Policy(msg.into())
    }

    pub fn preflight(msg: impl Into<String>) -> Self {
        Error::PreflightSpace(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::AuthFailure(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Stable kind string surfaced to clients. Details stay in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::Unauthorized(_) => "unauthorized",
            Error::Policy(_) => "policy",
            Error::PreflightSpace(_) => "preflight_space",
            Error::Network(_) => "network",
            Error::AuthFailure(_) => "auth_failure",
            Error::Corruption(_) => "corruption",
            Error::Cancelled => "cancelled",
            Error::Serialization(_) => "internal",
            Error::Io(_) => "internal",
            Error::Internal(_) => "internal",
        }
    }

    /// Transfers retry only on transport failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

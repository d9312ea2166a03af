//! Domain error taxonomy shared by the HTTP handlers and the thread/search
//! operations.
//!
//! Realtime operations deliberately do not use this type: `join` and `send`
//! fail closed and silently so a non-participant can never distinguish
//! "thread missing" from "not yours" (see `realtime`). Only `connect` is
//! allowed to surface an explicit failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    /// Malformed input, e.g. opening a chat with yourself.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authenticated but not allowed to touch this resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation, e.g. a second thread for an item.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or invalid credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for DomainError {
    fn from(e: sqlx::Error) -> Self {
        DomainError::Internal(e.into())
    }
}

impl DomainError {
    /// Machine-readable code used in the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::InvalidRequest(_) => "bad_request",
            DomainError::Forbidden(_) => "forbidden",
            DomainError::NotFound(_) => "not_found",
            DomainError::Conflict(_) => "conflict",
            DomainError::Unauthenticated(_) => "unauthenticated",
            DomainError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;

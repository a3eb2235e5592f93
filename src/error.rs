use thiserror::Error;

use crate::validation::ValidationError;

/// Errors surfaced by [`crate::service::UserService`].
///
/// Internal failures carry no detail; the cause is logged where it happens.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("Service unavailable")]
    Unavailable,
    #[error("Credentials do not match")]
    Authentication,
    #[error("Token expired")]
    Expired,
    #[error("Internal error")]
    Internal,
}

impl ServiceError {
    /// Whether the caller may retry the same request after backing off.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ServiceError::Unavailable)
    }
}

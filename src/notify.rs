use thiserror::Error;

use crate::storage::models::{EmailToken, User};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Outbound messages to account owners.
pub trait Notifier: Send + Sync {
    /// Ask the owner of `user` to confirm `token.email`.
    fn verify_email(&self, user: &User, token: &EmailToken) -> Result<(), NotifyError>;
}

/// Notifier that only writes the request to the log. The token itself is
/// never logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn verify_email(&self, user: &User, token: &EmailToken) -> Result<(), NotifyError> {
        tracing::info!(
            identity = %user.identity,
            email = %token.email,
            expires_at = %token.expires_at,
            "Email verification requested"
        );
        Ok(())
    }
}

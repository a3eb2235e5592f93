//! Bearer token lifecycle: mint, persist and verify.
//!
//! A token is bound to one signing secret through its header `kid`. Verifying
//! looks that secret up again, so deleting a secret invalidates every token it
//! signed. Expiration is always `now + ttl` at mint time and cannot be chosen
//! by the caller.

pub mod generator;
pub mod jwt;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use thiserror::Error;

use crate::clock::Clock;
use crate::identity::Identity;
use crate::secrets::{SecretError, SecretStore};
use crate::storage::models::{Permission, Secret, TokenRecord};
use crate::storage::{Store, StoreError};

pub use generator::{generate_email_token, generate_hex, generate_token_id};
pub use jwt::{algorithm_for, Body, FormatError, KeyRef, Token, TOKEN_TYPE};

#[derive(Debug, Error)]
pub enum MintError {
    #[error("Cannot mint a token for permission {0:?}")]
    NoPermission(Permission),
    #[error("Token expiration out of range")]
    ExpirationOutOfRange,
    #[error("Failed to encode token: {0}")]
    Encode(#[from] JwtError),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Token signed with {token} cannot be persisted against secret {secret}")]
    SecretMismatch { token: String, secret: String },
    #[error("Token expiration out of range")]
    ExpirationOutOfRange,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Malformed token: {0}")]
    Malformed(#[from] FormatError),
    #[error("Unknown secret: {0}")]
    UnknownSecret(String),
    #[error("Signature mismatch")]
    SignatureMismatch,
    #[error("Token expired")]
    Expired,
    #[error("Token revoked")]
    Revoked,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What a verified token proves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub expires_at: DateTime<Utc>,
    pub identity: Identity,
    pub jti: String,
    pub key_id: String,
    pub permission: Permission,
}

pub struct TokenLifecycle<S> {
    clock: Arc<dyn Clock>,
    secrets: Arc<SecretStore<S>>,
    store: Arc<S>,
    ttl: Duration,
}

impl<S: Store> TokenLifecycle<S> {
    pub fn new(
        store: Arc<S>,
        secrets: Arc<SecretStore<S>>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            clock,
            secrets,
            store,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Build and sign a token for `identity` with `secret`.
    pub fn mint(
        &self,
        identity: Identity,
        permission: Permission,
        secret: &Secret,
    ) -> Result<Token, MintError> {
        if permission == Permission::NoPermission {
            return Err(MintError::NoPermission(permission));
        }

        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.ttl)
            .ok_or(MintError::ExpirationOutOfRange)?;

        let body = Body {
            sub: identity,
            permission,
            exp: expires_at.timestamp(),
            jti: generate_token_id(),
        };

        let token = Token::sign(&secret.key_id, body, &secret.key)?;
        tracing::debug!(
            identity = %identity,
            key_id = %secret.key_id,
            jti = %token.body().jti,
            "Minted token"
        );
        Ok(token)
    }

    /// Record the token so it can be revoked by identity or secret deletion.
    pub fn persist(&self, token: &Token, secret: &Secret) -> Result<(), PersistenceError> {
        if token.key_id() != secret.key_id {
            return Err(PersistenceError::SecretMismatch {
                token: token.key_id().to_string(),
                secret: secret.key_id.clone(),
            });
        }

        let body = token.body();
        let record = TokenRecord {
            created_at: self.clock.now(),
            expires_at: DateTime::from_timestamp(body.exp, 0)
                .ok_or(PersistenceError::ExpirationOutOfRange)?,
            identity: body.sub,
            jti: body.jti.clone(),
            key_id: secret.key_id.clone(),
        };
        self.store.insert_token(&record)?;
        Ok(())
    }

    /// Check a presented token.
    ///
    /// Failures are reported in this order: malformed, unknown secret,
    /// signature mismatch, expired, revoked. An expired token is rejected even
    /// when its signature is valid.
    pub fn verify(&self, presented: &str) -> Result<Claims, VerifyError> {
        let key = KeyRef::read(presented)?;
        let key_id = key.key_id.clone();

        let secret = match self.secrets.secret_by_key(&key_id) {
            Ok(secret) => secret,
            Err(SecretError::Store(err)) => return Err(VerifyError::Store(err)),
            Err(_) => return Err(VerifyError::UnknownSecret(key_id)),
        };

        // The signature is checked before `exp`
        let token = Token::verify(presented, key, &secret.key).map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature => VerifyError::SignatureMismatch,
            ErrorKind::ExpiredSignature => VerifyError::Expired,
            _ => VerifyError::Malformed(e.into()),
        })?;

        // `Validation` reads the system clock; the injected clock decides too
        let body = token.body();
        if self.clock.now().timestamp() >= body.exp {
            return Err(VerifyError::Expired);
        }

        if self.store.get_token(&body.jti)?.is_none() {
            return Err(VerifyError::Revoked);
        }

        Ok(Claims {
            expires_at: DateTime::from_timestamp(body.exp, 0).ok_or(VerifyError::Expired)?,
            identity: body.sub,
            jti: body.jti.clone(),
            key_id: key_id.clone(),
            permission: body.permission,
        })
    }
}

impl<S> std::fmt::Debug for TokenLifecycle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLifecycle")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

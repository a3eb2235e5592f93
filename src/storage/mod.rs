//! Persistence for users, secrets and token records.
//!
//! The service talks to storage through the [`Store`] trait. [`Database`] is
//! the redb-backed implementation.

pub mod db;
pub mod models;
mod secrets;
mod tables;
mod tokens;
mod users;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use db::{Database, DatabaseError};
pub use tables::*;
pub(crate) use users::normalize_email;

use crate::identity::Identity;
use models::{EmailToken, PurgeStats, Secret, TokenRecord, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Store unreachable: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Conflict(what) => StoreError::Conflict(what),
            DatabaseError::NotFound(what) => StoreError::NotFound(what),
            other => StoreError::Database(other),
        }
    }
}

/// Backing store used by the service.
///
/// Absent records are reported as `None`/`false`; `Err` is reserved for
/// conflicts and transport or storage failures.
pub trait Store: Send + Sync + 'static {
    /// Reachability probe, run before each request is admitted.
    fn ping(&self) -> Result<(), StoreError>;

    fn insert_user(&self, user: &User) -> Result<(), StoreError>;
    fn get_user(&self, identity: &Identity) -> Result<Option<User>, StoreError>;
    fn update_user(&self, user: &User) -> Result<bool, StoreError>;
    /// Deletes the user and cascades to its token records and email tokens.
    fn delete_user(&self, identity: &Identity) -> Result<bool, StoreError>;

    fn put_email_token(&self, token: &EmailToken) -> Result<(), StoreError>;

    fn insert_secret(&self, secret: &Secret) -> Result<(), StoreError>;
    /// Insert `secret` and mark it active atomically; returns the demoted key id.
    fn insert_active_secret(&self, secret: &Secret) -> Result<Option<String>, StoreError>;
    fn get_secret(&self, key_id: &str) -> Result<Option<Secret>, StoreError>;
    fn get_active_secret(&self) -> Result<Option<Secret>, StoreError>;
    /// Deletes the secret and cascades to the token records signed with it.
    fn delete_secret(&self, key_id: &str) -> Result<bool, StoreError>;

    /// Fails with `NotFound("secret")` when the signing secret named by the
    /// record no longer exists.
    fn insert_token(&self, record: &TokenRecord) -> Result<(), StoreError>;
    fn get_token(&self, jti: &str) -> Result<Option<TokenRecord>, StoreError>;
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<PurgeStats, StoreError>;
}

impl Store for Database {
    fn ping(&self) -> Result<(), StoreError> {
        Database::ping(self).map_err(|e| StoreError::Unreachable(e.to_string()))
    }

    fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        Ok(Database::insert_user(self, user)?)
    }

    fn get_user(&self, identity: &Identity) -> Result<Option<User>, StoreError> {
        Ok(Database::get_user(self, identity)?)
    }

    fn update_user(&self, user: &User) -> Result<bool, StoreError> {
        Ok(Database::update_user(self, user)?)
    }

    fn delete_user(&self, identity: &Identity) -> Result<bool, StoreError> {
        Ok(Database::delete_user(self, identity)?)
    }

    fn put_email_token(&self, token: &EmailToken) -> Result<(), StoreError> {
        Ok(Database::put_email_token(self, token)?)
    }

    fn insert_secret(&self, secret: &Secret) -> Result<(), StoreError> {
        Ok(Database::insert_secret(self, secret)?)
    }

    fn insert_active_secret(&self, secret: &Secret) -> Result<Option<String>, StoreError> {
        Ok(Database::insert_active_secret(self, secret)?)
    }

    fn get_secret(&self, key_id: &str) -> Result<Option<Secret>, StoreError> {
        Ok(Database::get_secret(self, key_id)?)
    }

    fn get_active_secret(&self) -> Result<Option<Secret>, StoreError> {
        Ok(Database::get_active_secret(self)?)
    }

    fn delete_secret(&self, key_id: &str) -> Result<bool, StoreError> {
        Ok(Database::delete_secret(self, key_id)?)
    }

    fn insert_token(&self, record: &TokenRecord) -> Result<(), StoreError> {
        Ok(Database::insert_token(self, record)?)
    }

    fn get_token(&self, jti: &str) -> Result<Option<TokenRecord>, StoreError> {
        Ok(Database::get_token(self, jti)?)
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<PurgeStats, StoreError> {
        Ok(Database::delete_expired(self, now)?)
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::Identity;

/// Permission level carried by accounts and tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    NoPermission,
    UserRegistration,
    #[default]
    User,
    Admin,
}

/// A user account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub created_at: DateTime<Utc>,
    pub email: String,
    pub first_name: String,
    pub identity: Identity,
    /// Whether the email address has been confirmed
    pub is_verified: bool,
    pub last_name: String,
    pub organization: String,
    /// argon2id PHC string, never the plaintext
    pub password_hash: String,
    pub permission: Permission,
    pub updated_at: DateTime<Utc>,
}

/// A token signing secret
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secret {
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
    /// HMAC key material
    pub key: Vec<u8>,
    /// Public reference carried in token headers
    #[zeroize(skip)]
    pub key_id: String,
}

impl Secret {
    pub fn new(key_id: impl Into<String>, key: Vec<u8>, created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            key,
            key_id: key_id.into(),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("created_at", &self.created_at)
            .field("key", &"<redacted>")
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// What is kept about an issued token. The signature itself is not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub identity: Identity,
    /// Token id (the body's `jti`)
    pub jti: String,
    /// Key id of the signing secret
    pub key_id: String,
}

/// A pending email verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailToken {
    pub created_at: DateTime<Utc>,
    pub email: String,
    pub expires_at: DateTime<Utc>,
    pub identity: Identity,
    pub token: String,
}

/// Statistics from an expiration sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    pub email_tokens: u64,
    pub tokens: u64,
}

//! Compact bearer token encoding on top of `jsonwebtoken`.
//!
//! Header `{alg, typ: "JWT", kid}`, body `{sub, permission, exp, jti}`, HMAC
//! signature. The header is read unverified first so the caller can pick the
//! secret named by `kid`.

use std::fmt;

use jsonwebtoken::errors::Error as JwtError;
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Identity;
use crate::storage::models::Permission;

pub const TOKEN_TYPE: &str = "JWT";

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("token has no key id")]
    MissingKeyId,
    #[error("unsupported algorithm {0:?}")]
    Algorithm(Algorithm),
    #[error("unsupported token type {0:?}")]
    Type(Option<String>),
    #[error(transparent)]
    Jwt(#[from] JwtError),
}

/// Admin tokens get the wider MAC.
pub fn algorithm_for(permission: Permission) -> Algorithm {
    match permission {
        Permission::Admin => Algorithm::HS512,
        _ => Algorithm::HS256,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub sub: Identity,
    pub permission: Permission,
    /// Expiration, Unix seconds
    pub exp: i64,
    pub jti: String,
}

/// Unverified header fields that select the verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRef {
    pub algorithm: Algorithm,
    pub key_id: String,
}

impl KeyRef {
    pub fn read(text: &str) -> Result<Self, FormatError> {
        let header = decode_header(text)?;
        if header.typ.as_deref() != Some(TOKEN_TYPE) {
            return Err(FormatError::Type(header.typ));
        }
        if !matches!(header.alg, Algorithm::HS256 | Algorithm::HS512) {
            return Err(FormatError::Algorithm(header.alg));
        }
        let key_id = header.kid.ok_or(FormatError::MissingKeyId)?;
        Ok(Self {
            algorithm: header.alg,
            key_id,
        })
    }
}

/// A signed token plus its decoded parts.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    body: Body,
    encoded: String,
    key: KeyRef,
}

impl Token {
    /// Sign `body` with `key`, naming the secret `key_id` in the header.
    pub fn sign(key_id: &str, body: Body, key: &[u8]) -> Result<Self, JwtError> {
        let algorithm = algorithm_for(body.permission);
        let mut header = Header::new(algorithm);
        header.kid = Some(key_id.to_string());

        let encoded = encode(&header, &body, &EncodingKey::from_secret(key))?;
        Ok(Self {
            body,
            encoded,
            key: KeyRef {
                algorithm,
                key_id: key_id.to_string(),
            },
        })
    }

    /// Check the signature of `text` with `secret`, then its expiry against
    /// the system clock.
    pub fn verify(text: &str, key: KeyRef, secret: &[u8]) -> Result<Self, JwtError> {
        let mut validation = Validation::new(key.algorithm);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<Body>(text, &DecodingKey::from_secret(secret), &validation)?;
        Ok(Self {
            body: data.claims,
            encoded: text.to_string(),
            key,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.key.algorithm
    }

    pub fn key_id(&self) -> &str {
        &self.key.key_id
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("key", &self.key)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

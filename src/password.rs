use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

const SALT_LENGTH: usize = argon2::password_hash::Salt::RECOMMENDED_LENGTH;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("Invalid argon2 parameters: {0}")]
    Params(String),
    #[error("Password hashing failed: {0}")]
    Hash(String),
}

impl From<argon2::password_hash::Error> for PasswordError {
    fn from(err: argon2::password_hash::Error) -> Self {
        PasswordError::Hash(err.to_string())
    }
}

/// Argon2id password hashing with a fresh salt per hash.
#[derive(Debug, Clone)]
pub struct Passwords {
    argon2: Argon2<'static>,
}

impl Passwords {
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self, PasswordError> {
        let params: Params = ParamsBuilder::new()
            .m_cost(memory_kib)
            .t_cost(iterations)
            .p_cost(1)
            .build()
            .map_err(|e| PasswordError::Params(e.to_string()))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::default(), params),
        })
    }

    /// Hash `password` into a PHC string.
    pub fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        let salt = SaltString::encode_b64(&salt)?;
        Ok(self
            .argon2
            .hash_password(password.as_bytes(), &salt)?
            .to_string())
    }

    /// Check `password` against a stored PHC string. A hash that does not
    /// parse is an error, a wrong password is `Ok(false)`.
    pub fn verify(&self, password: &str, password_hash: &str) -> Result<bool, PasswordError> {
        let parsed = PasswordHash::new(password_hash)?;
        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passwords() -> Passwords {
        Passwords::new(1024, 1).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let passwords = passwords();
        let hash = passwords.hash("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(passwords.verify("correct horse", &hash).unwrap());
        assert!(!passwords.verify("battery staple", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let passwords = passwords();
        assert_ne!(
            passwords.hash("same").unwrap(),
            passwords.hash("same").unwrap()
        );
    }

    #[test]
    fn test_unparseable_hash_is_error() {
        assert!(passwords().verify("x", "not-a-phc-string").is_err());
    }

    #[test]
    fn test_rejects_bad_params() {
        assert!(matches!(Passwords::new(0, 0), Err(PasswordError::Params(_))));
    }
}

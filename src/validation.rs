//! Shape checks on caller-supplied account fields.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::identity::{self, InvalidIdentifier};

pub const MAX_NAME_LENGTH: usize = 32;
pub const MAX_PASSWORD_LENGTH: usize = 128;

static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\s\p{Zs}]{2,}").expect("multi-space regex should compile")
});

/// ASCII letters, optionally joined by one of `' . -` or whitespace, each
/// followed by a letter or whitespace.
static NAME_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[[:alpha:]]+((['.\s-][[:alpha:]\s])?[[:alpha:]]*)*$")
        .expect("name regex should compile")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid identity: {0}")]
    Identity(#[from] InvalidIdentifier),
    #[error("Invalid first name")]
    FirstName,
    #[error("Invalid last name")]
    LastName,
    #[error("Invalid email")]
    Email,
    #[error("Invalid password")]
    Password,
    #[error("Invalid organization")]
    Organization,
    #[error("Nothing to update")]
    EmptyUpdate,
    #[error("Malformed token")]
    Token,
}

/// Field-level rules applied before any lock is taken.
pub trait UserValidator: Send + Sync {
    fn first_name(&self, name: &str) -> Result<(), ValidationError>;
    fn last_name(&self, name: &str) -> Result<(), ValidationError>;
    fn email(&self, email: &str) -> Result<(), ValidationError>;
    fn password(&self, password: &str) -> Result<(), ValidationError>;
    fn organization(&self, organization: &str) -> Result<(), ValidationError>;

    fn identity(&self, text: &str) -> Result<(), ValidationError> {
        Ok(identity::validate(text)?)
    }
}

/// Default rules: names are ASCII letters joined by single `' . -` or spaces
/// (runs of whitespace count as one), emails
/// have one `@` and a dotted domain, passwords carry no surrounding whitespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicValidator;

impl BasicValidator {
    fn valid_name(name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let name = MULTI_SPACE.replace_all(name, " ");
        name.len() <= MAX_NAME_LENGTH && NAME_CHARS.is_match(&name)
    }
}

impl UserValidator for BasicValidator {
    fn first_name(&self, name: &str) -> Result<(), ValidationError> {
        Self::valid_name(name)
            .then_some(())
            .ok_or(ValidationError::FirstName)
    }

    fn last_name(&self, name: &str) -> Result<(), ValidationError> {
        Self::valid_name(name)
            .then_some(())
            .ok_or(ValidationError::LastName)
    }

    fn email(&self, email: &str) -> Result<(), ValidationError> {
        if email.len() > 320 || email.trim() != email || email.contains(char::is_whitespace) {
            return Err(ValidationError::Email);
        }
        let Some((local, domain)) = email.split_once('@') else {
            return Err(ValidationError::Email);
        };
        let domain_ok = !domain.contains('@')
            && domain.contains('.')
            && domain.split('.').all(|label| !label.is_empty());
        if local.is_empty() || !domain_ok {
            return Err(ValidationError::Email);
        }
        Ok(())
    }

    fn password(&self, password: &str) -> Result<(), ValidationError> {
        if password.is_empty()
            || password.len() > MAX_PASSWORD_LENGTH
            || password.trim() != password
        {
            return Err(ValidationError::Password);
        }
        Ok(())
    }

    fn organization(&self, organization: &str) -> Result<(), ValidationError> {
        if organization.trim().is_empty() {
            return Err(ValidationError::Organization);
        }
        Ok(())
    }
}

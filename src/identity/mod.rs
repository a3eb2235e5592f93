//! Account identities.
//!
//! An [`Identity`] is a 128-bit value made of a 48-bit millisecond timestamp
//! followed by an 80-bit random component. Its canonical text form is 26
//! lower-case Crockford base32 characters, so sorting the text sorts by
//! creation time.

mod generator;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use ulid::Ulid;

pub use generator::{GenerationError, IdGenerator};

/// Length of the canonical text form.
pub const ENCODED_LEN: usize = ulid::ULID_LEN;

const ALPHABET: &str = "0123456789abcdefghjkmnpqrstvwxyz";
const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;
const MAX_TIMESTAMP_MS: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidIdentifier {
    #[error("identifier is empty")]
    Empty,
    #[error("identifier must be {ENCODED_LEN} characters, got {0}")]
    Length(usize),
    #[error("invalid character {0:?} in identifier")]
    Character(char),
    #[error("identifier overflows 128 bits")]
    Overflow,
    #[error("identifier is not in canonical form")]
    NotCanonical,
}

/// Opaque, time-ordered account key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Ulid);

impl Identity {
    pub(crate) fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        debug_assert!(timestamp_ms <= MAX_TIMESTAMP_MS);
        Self(Ulid::from_parts(timestamp_ms, random & RANDOM_MASK))
    }

    /// Milliseconds since the Unix epoch at which this identity was generated.
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    pub fn random(&self) -> u128 {
        self.0.random()
    }

    /// Parse and validate the canonical text form.
    ///
    /// Decoding is case-insensitive, but anything that does not re-encode to
    /// exactly the input (for example upper-case text) is rejected.
    pub fn parse(text: &str) -> Result<Self, InvalidIdentifier> {
        let id = decode(text)?;
        if id.to_string() != text {
            return Err(InvalidIdentifier::NotCanonical);
        }
        Ok(id)
    }
}

/// Check that `text` is a canonical identity.
pub fn validate(text: &str) -> Result<(), InvalidIdentifier> {
    Identity::parse(text).map(|_| ())
}

fn decode(text: &str) -> Result<Identity, InvalidIdentifier> {
    if text.is_empty() {
        return Err(InvalidIdentifier::Empty);
    }
    let len = text.chars().count();
    if len != ENCODED_LEN {
        return Err(InvalidIdentifier::Length(len));
    }
    if let Some(c) = text
        .chars()
        .find(|c| !ALPHABET.contains(c.to_ascii_lowercase()))
    {
        return Err(InvalidIdentifier::Character(c));
    }
    // 26 * 5 = 130 bits, so the leading character only carries three.
    if text.as_bytes()[0] > b'7' {
        return Err(InvalidIdentifier::Overflow);
    }

    Ulid::from_string(text)
        .map(Identity)
        .map_err(|_| InvalidIdentifier::NotCanonical)
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string().to_ascii_lowercase())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

impl FromStr for Identity {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Identity::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_fixed_width_lowercase() {
        let id = Identity::from_parts(1_546_300_800_000, 0xdead_beef);
        let text = id.to_string();
        assert_eq!(text.len(), ENCODED_LEN);
        assert_eq!(text, text.to_lowercase());
        assert_eq!(Identity::parse(&text).unwrap(), id);
    }

    #[test]
    fn test_extremes_round_trip() {
        let zero = Identity(Ulid(0));
        assert_eq!(zero.to_string(), "00000000000000000000000000");
        let max = Identity(Ulid(u128::MAX));
        assert_eq!(max.to_string(), "7zzzzzzzzzzzzzzzzzzzzzzzzz");
        assert_eq!(Identity::parse("7zzzzzzzzzzzzzzzzzzzzzzzzz").unwrap(), max);
    }

    #[test]
    fn test_parts() {
        let id = Identity::from_parts(42, 7);
        assert_eq!(id.timestamp_ms(), 42);
        assert_eq!(id.random(), 7);
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert_eq!(validate(""), Err(InvalidIdentifier::Empty));
    }

    #[test]
    fn test_validate_rejects_wrong_length() {
        assert_eq!(
            validate("01d1nba01gnzbrkbfrrvgrz2m"),
            Err(InvalidIdentifier::Length(25))
        );
        assert_eq!(validate("0000xsnjg0mq"), Err(InvalidIdentifier::Length(12)));
    }

    #[test]
    fn test_validate_rejects_out_of_alphabet() {
        // 'u', 'i', 'l' and 'o' are excluded from Crockford base32
        assert_eq!(
            validate("01d1nba01gnzbrkbfrrvgrz2mu"),
            Err(InvalidIdentifier::Character('u'))
        );
        assert_eq!(
            validate("01d1nba01gnzbrkbfrrvgrz2m!"),
            Err(InvalidIdentifier::Character('!'))
        );
    }

    #[test]
    fn test_validate_rejects_overflow() {
        assert_eq!(
            validate("80000000000000000000000000"),
            Err(InvalidIdentifier::Overflow)
        );
    }

    #[test]
    fn test_validate_rejects_uppercase() {
        let text = Identity::from_parts(1_000, 99).to_string().to_uppercase();
        assert_eq!(validate(&text), Err(InvalidIdentifier::NotCanonical));
    }

    #[test]
    fn test_serde_uses_text_form() {
        let id = Identity::from_parts(1_700_000_000_000, 12345);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<Identity>("\"not-an-id\"").is_err());
    }
}

//! Structured correlation identifiers.
//!
//! Every key carries a correlation identifier that is also stored on the
//! remote panel (as the client "email"). The canonical text form is
//! `u<user_id>-<nonce>`:
//!
//! - `user_id` is a positive decimal integer without leading zeros
//! - `nonce` is 1 to 32 characters of `[a-z0-9]`
//!
//! Anything else does not decode, which is how orphans that were not issued
//! by this system are recognised and left alone.

use std::fmt;
use std::str::FromStr;

const PREFIX: char = 'u';
const SEPARATOR: char = '-';
const MAX_NONCE_LEN: usize = 32;
const GENERATED_NONCE_LEN: usize = 8;

/// Decoded correlation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId {
    user_id: i64,
    nonce: String,
}

/// Why a string is not a correlation identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("missing 'u' prefix")]
    MissingPrefix,

    #[error("missing '-' separator")]
    MissingSeparator,

    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("invalid nonce: {0:?}")]
    InvalidNonce(String),
}

impl CorrelationId {
    /// Build an identifier from parts, validating both.
    pub fn new(user_id: i64, nonce: impl Into<String>) -> Result<Self, CorrelationError> {
        if user_id <= 0 {
            return Err(CorrelationError::InvalidUserId(user_id.to_string()));
        }
        let nonce = nonce.into();
        if !valid_nonce(&nonce) {
            return Err(CorrelationError::InvalidNonce(nonce));
        }
        Ok(Self { user_id, nonce })
    }

    /// Fresh identifier for a key issued to `user_id`.
    pub fn generate(user_id: i64) -> Result<Self, CorrelationError> {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self::new(user_id, &simple[..GENERATED_NONCE_LEN])
    }

    pub const fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }
}

fn valid_nonce(nonce: &str) -> bool {
    !nonce.is_empty()
        && nonce.len() <= MAX_NONCE_LEN
        && nonce
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}{SEPARATOR}{}", self.user_id, self.nonce)
    }
}

impl FromStr for CorrelationId {
    type Err = CorrelationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or(CorrelationError::MissingPrefix)?;
        let (user, nonce) = rest
            .split_once(SEPARATOR)
            .ok_or(CorrelationError::MissingSeparator)?;

        let canonical_digits = !user.is_empty()
            && user.bytes().all(|b| b.is_ascii_digit())
            && !user.starts_with('0');
        if !canonical_digits {
            return Err(CorrelationError::InvalidUserId(user.to_string()));
        }
        let user_id = user
            .parse::<i64>()
            .map_err(|_| CorrelationError::InvalidUserId(user.to_string()))?;

        Self::new(user_id, nonce)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn display_is_canonical() {
        let id = CorrelationId::new(5_858_391_454, "k3x9").unwrap();
        assert_eq!(id.to_string(), "u5858391454-k3x9");
    }

    #[test]
    fn parses_canonical_form() {
        let id: CorrelationId = "u42-abc123".parse().unwrap();
        assert_eq!(id.user_id(), 42);
        assert_eq!(id.nonce(), "abc123");
    }

    #[test]
    fn generated_ids_decode_to_their_user() {
        let id = CorrelationId::generate(77).unwrap();
        assert_eq!(id.nonce().len(), GENERATED_NONCE_LEN);
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_ne!(CorrelationId::generate(77).unwrap(), id);
    }

    #[test]
    fn rejects_foreign_identifiers() {
        let cases = [
            ("alice@example.com", CorrelationError::MissingPrefix),
            ("u42", CorrelationError::MissingSeparator),
            ("u-abc", CorrelationError::InvalidUserId(String::new())),
            ("u042-abc", CorrelationError::InvalidUserId("042".into())),
            ("u4x2-abc", CorrelationError::InvalidUserId("4x2".into())),
            ("u0-abc", CorrelationError::InvalidUserId("0".into())),
            ("u42-", CorrelationError::InvalidNonce(String::new())),
            ("u42-ABC", CorrelationError::InvalidNonce("ABC".into())),
            ("u42-a-b", CorrelationError::InvalidNonce("a-b".into())),
        ];
        for (input, expected) in cases {
            assert_eq!(
                input.parse::<CorrelationId>().unwrap_err(),
                expected,
                "{input}"
            );
        }
    }

    #[test]
    fn rejects_overlong_nonce_and_overflowing_user() {
        let long = format!("u1-{}", "a".repeat(MAX_NONCE_LEN + 1));
        assert!(matches!(
            long.parse::<CorrelationId>(),
            Err(CorrelationError::InvalidNonce(_))
        ));
        assert!(matches!(
            "u99999999999999999999-a".parse::<CorrelationId>(),
            Err(CorrelationError::InvalidUserId(_))
        ));
    }
}

use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::fmt;

const MAX_NAME_LEN: usize = 128;
const MAX_TOKEN_LEN: usize = 512;

fn validate_simple_name(
    value: &str,
    kind: &str,
    max_len: usize,
    allowed: fn(char) -> bool,
) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId(format!("{kind} must not be empty")));
    }
    if trimmed.len() > max_len {
        return Err(Error::InvalidId(format!("{kind} length must be <= {max_len}")));
    }
    if !trimmed.chars().all(allowed) {
        return Err(Error::InvalidId(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn is_allowed_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-' | '.')
}

// Session tokens come from signed cookies, so the base64 alphabet is allowed.
fn is_allowed_token_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '+' | '/' | '=' | '%')
}

macro_rules! define_id_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr, $max_len:expr, $allowed:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
        #[derive(serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a validated identifier.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                validate_simple_name(value.as_ref(), $kind, $max_len, $allowed).map(Self)
            }

            /// Creates an identifier from a trusted string without validation.
            pub fn from_string(value: String) -> Self {
                Self(value)
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from_string(value)
            }
        }
    };
}

define_id_type!(
    /// Back-office user identifier.
    UserId,
    "user id",
    MAX_NAME_LEN,
    is_allowed_name_char
);
define_id_type!(
    /// Opaque session token carried by the session cookie.
    SessionToken,
    "session token",
    MAX_TOKEN_LEN,
    is_allowed_token_char
);
define_id_type!(
    /// Community (tenant) identifier, e.g. a territorial community code.
    CommunityId,
    "community id",
    MAX_NAME_LEN,
    is_allowed_name_char
);
define_id_type!(
    /// Name of a task handled by the remote worker pool.
    TaskName,
    "task name",
    MAX_NAME_LEN,
    is_allowed_name_char
);
define_id_type!(
    /// Request/reply correlation identifier.
    CorrelationId,
    "correlation id",
    MAX_NAME_LEN,
    is_allowed_name_char
);

impl CorrelationId {
    /// Generates a fresh random correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_accepts_base64_alphabet() {
        let token = SessionToken::try_from("s%3Aab+c/d=.sig").expect("token");
        assert_eq!(token.as_str(), "s%3Aab+c/d=.sig");
    }

    #[test]
    fn community_id_rejects_whitespace_inside() {
        let err = CommunityId::try_from("kyiv city").expect_err("must reject");
        assert!(err.to_string().contains("community id"));
    }

    #[test]
    fn generated_correlation_ids_are_unique_and_valid() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
        assert!(CorrelationId::new(a.as_str()).is_ok());
    }
}

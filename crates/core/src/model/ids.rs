use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when an identifier fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} must not be empty")]
pub struct IdError {
    kind: &'static str,
}

fn validated(kind: &'static str, raw: impl Into<String>) -> Result<String, IdError> {
    let raw = raw.into();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IdError { kind });
    }
    if trimmed.len() == raw.len() {
        Ok(raw)
    } else {
        Ok(trimmed.to_owned())
    }
}

/// Identifier of an authenticated user.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Creates a new `UserId`
    ///
    /// # Errors
    ///
    /// Returns `IdError` if the value is blank.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        validated("UserId", id).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a document (text or PDF) a student is working on.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates a new `DocumentId`
    ///
    /// # Errors
    ///
    /// Returns `IdError` if the value is blank.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        validated("DocumentId", id).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque per-context token asserting ownership of a user's active session.
///
/// Generated once per browser context and never mutated afterwards.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionToken(String);

impl SessionToken {
    const SUFFIX_LEN: usize = 9;

    /// Generates a fresh token of the form `session_<millis>_<random>`.
    #[must_use]
    pub fn generate(now_millis: i64) -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(Self::SUFFIX_LEN)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        Self(format!("session_{now_millis}_{suffix}"))
    }

    /// Wraps an existing token read back from storage.
    ///
    /// # Errors
    ///
    /// Returns `IdError` if the value is blank.
    pub fn from_persisted(raw: impl Into<String>) -> Result<Self, IdError> {
        validated("SessionToken", raw).map(Self)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ─── Conversions ───────────────────────────────────────────────────────────────

macro_rules! string_id_impls {
    ($ty:ident, $ctor:ident) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::$ctor(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::$ctor(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id_impls!(UserId, new);
string_id_impls!(DocumentId, new);
string_id_impls!(SessionToken, from_persisted);

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_ids_are_rejected() {
        assert!(UserId::new("   ").is_err());
        assert!(DocumentId::new("").is_err());
        assert!("".parse::<SessionToken>().is_err());
    }

    #[test]
    fn ids_are_trimmed() {
        let id = DocumentId::new("  lesson-1 ").unwrap();
        assert_eq!(id.as_str(), "lesson-1");
        assert_eq!(id.to_string(), "lesson-1");
    }

    #[test]
    fn generated_tokens_carry_timestamp_and_differ() {
        let a = SessionToken::generate(1_700_000_000_000);
        let b = SessionToken::generate(1_700_000_000_000);
        assert!(a.as_str().starts_with("session_1700000000000_"));
        assert_eq!(a.as_str().len(), "session_1700000000000_".len() + 9);
        assert_ne!(a, b);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = UserId::new("student-7").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"student-7\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<UserId>("\"\"").is_err());
    }
}

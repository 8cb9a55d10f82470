//! Content-derived identifiers.
//!
//! Projects are keyed by a fixed-width hash over their owner and display name,
//! so registering the same project twice yields the same key. The same hash
//! format is used for architecture fingerprints and submitter-derived
//! deduplication keys.
//!
//! # Example
//!
//! ```rust
//! use vitals_core::id::ProjectId;
//!
//! let id = ProjectId::derive("dev@example.com", "widget");
//! assert_eq!(id.as_str().len(), 32);
//! assert_eq!(ProjectId::parse(&id.as_str().to_lowercase()).unwrap(), id);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Number of hex characters in a content hash.
pub const HASH_LEN: usize = 32;

/// Hashes `input` into a 32-character upper-case hex string.
///
/// SHA-256 truncated to 128 bits; collisions are not handled.
#[must_use]
pub fn content_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode_upper(&digest[..HASH_LEN / 2])
}

/// Validates and normalises a hash string of the fixed width.
///
/// Hex digits are accepted in either case and returned upper-case.
///
/// # Errors
///
/// Returns [`Error::InvalidId`] if the value has the wrong length or
/// contains non-hex characters.
pub fn parse_hash(what: &str, value: &str) -> Result<String> {
    if value.len() != HASH_LEN {
        return Err(Error::InvalidId {
            message: format!(
                "invalid {what} '{value}': expected {HASH_LEN} hex characters, got {}",
                value.len()
            ),
        });
    }
    if !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidId {
            message: format!("invalid {what} '{value}': contains non-hex characters"),
        });
    }
    Ok(value.to_ascii_uppercase())
}

/// Identifier of a registered project.
///
/// Derived from `(owner, name)`; always [`HASH_LEN`] upper-case hex chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    /// Derives the identifier for a project owned by `owner` named `name`.
    #[must_use]
    pub fn derive(owner: &str, name: &str) -> Self {
        Self(content_hash(&format!("Owner={owner}|Project={name}")))
    }

    /// Parses an identifier received from outside (webhook path, task payload).
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a well-formed hash.
    pub fn parse(value: &str) -> Result<Self> {
        parse_hash("project id", value).map(Self)
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_stable_and_fixed_width() {
        let a = ProjectId::derive("dev@example.com", "widget");
        let b = ProjectId::derive("dev@example.com", "widget");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), HASH_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn derive_separates_owner_and_name() {
        let a = ProjectId::derive("dev@example.com", "widget");
        let b = ProjectId::derive("other@example.com", "widget");
        let c = ProjectId::derive("dev@example.com", "gadget");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parse_normalises_case() {
        let id = ProjectId::derive("dev@example.com", "widget");
        let parsed = ProjectId::parse(&id.as_str().to_lowercase()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_bad_values() {
        assert!(ProjectId::parse("").is_err());
        assert!(ProjectId::parse("ABC").is_err());
        assert!(ProjectId::parse(&"G".repeat(HASH_LEN)).is_err());
        assert!(ProjectId::parse(&"A".repeat(HASH_LEN + 1)).is_err());
    }
}

//! Core type definitions for Berth
//!
//! Identifiers, content digests and descriptors shared by every store.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum length of a namespace or object identifier
pub const MAX_IDENTIFIER_LENGTH: usize = 76;

/// Timestamp type used by every record
pub type Timestamp = DateTime<Utc>;

/// Current time truncated to what the store persists
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Encode a timestamp the way it is persisted (RFC 3339, nanoseconds, UTC)
#[must_use]
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a persisted or label-provided RFC 3339 timestamp
pub fn parse_timestamp(value: &str) -> Result<Timestamp> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::invalid_argument(format!("invalid timestamp {value:?}: {e}")))
}

/// Validate a namespace or object identifier.
///
/// Identifiers are one or more alphanumeric components separated by a
/// single `.`, `_` or `-`, at most [`MAX_IDENTIFIER_LENGTH`] characters.
pub fn validate_identifier(s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::invalid_argument("identifier must not be empty"));
    }
    if s.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::invalid_argument(format!(
            "identifier {s:?} greater than maximum length ({MAX_IDENTIFIER_LENGTH} characters)"
        )));
    }

    let mut prev_sep = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            prev_sep = false;
        } else if matches!(c, '.' | '_' | '-') && !prev_sep {
            prev_sep = true;
        } else {
            return Err(Error::invalid_argument(format!(
                "identifier {s:?} must match [A-Za-z0-9]+(?:[._-][A-Za-z0-9]+)*"
            )));
        }
    }
    if prev_sep {
        return Err(Error::invalid_argument(format!(
            "identifier {s:?} must end with an alphanumeric character"
        )));
    }
    Ok(())
}

/// Content digest in `algorithm:encoded` form
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        Self::validate(&s)?;
        Ok(Self(s))
    }

    /// SHA-256 digest of the given bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(data))))
    }

    /// Algorithm part (`sha256`, `sha512`)
    #[must_use]
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map_or("", |(a, _)| a)
    }

    /// Hex-encoded part
    #[must_use]
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, e)| e)
    }

    /// Get the digest as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the digest of `data` matches this digest
    #[must_use]
    pub fn verifies(&self, data: &[u8]) -> bool {
        let actual = match self.algorithm() {
            "sha256" => hex::encode(Sha256::digest(data)),
            "sha512" => hex::encode(Sha512::digest(data)),
            _ => return false,
        };
        actual == self.encoded()
    }

    fn validate(s: &str) -> Result<()> {
        let (alg, encoded) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid_argument(format!("invalid digest {s:?}: missing algorithm")))?;
        let expected = match alg {
            "sha256" => 64,
            "sha512" => 128,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid digest {s:?}: unsupported algorithm {alg:?}"
                )));
            }
        };
        if encoded.len() != expected
            || !encoded.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::invalid_argument(format!(
                "invalid digest {s:?}: bad {alg} encoding"
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

impl std::str::FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Platform a descriptor targets
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

/// Content descriptor: a typed, sized pointer to a blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Create a descriptor without platform or annotations
    #[must_use]
    pub fn new(media_type: impl Into<String>, digest: Digest, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_valid() {
        assert!(validate_identifier("default").is_ok());
        assert!(validate_identifier("k8s.io").is_ok());
        assert!(validate_identifier("a-b_c.d0").is_ok());
    }

    #[test]
    fn test_identifier_invalid() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("-lead").is_err());
        assert!(validate_identifier("trail.").is_err());
        assert!(validate_identifier("dou..ble").is_err());
        assert!(validate_identifier("sp ace").is_err());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH + 1)).is_err());
        assert!(
            validate_identifier("bad/slash")
                .unwrap_err()
                .is_invalid_argument()
        );
    }

    #[test]
    fn test_digest_from_bytes() {
        let d = Digest::from_bytes(b"hello");
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(
            d.encoded(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(d.verifies(b"hello"));
        assert!(!d.verifies(b"world"));
        assert_eq!(Digest::parse(d.to_string()).unwrap(), d);
    }

    #[test]
    fn test_digest_invalid() {
        assert!(Digest::parse("nope").is_err());
        assert!(Digest::parse("md5:abcd").is_err());
        assert!(Digest::parse("sha256:1234").is_err());
        assert!(Digest::parse(format!("sha256:{}", "G".repeat(64))).is_err());
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = now();
        let parsed = parse_timestamp(&format_timestamp(&ts)).unwrap();
        assert_eq!(parsed, ts);
        assert!(parse_timestamp("yesterday").is_err());
    }
}

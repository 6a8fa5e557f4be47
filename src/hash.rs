//! Page hash canonicalization and validation.
//!
//! Every cache access, coalescer lookup and upload form key goes through
//! this module so that keys are canonicalized everywhere: only
//! lowercase 32-hex-character MD5 digests ever reach the backend.

use once_cell::sync::Lazy;
use regex::Regex;

static HASH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-f0-9]{32}$").unwrap());

/// A validated, lowercase 32-hex-character page hash.
///
/// Constructing one is the only way to get a value this module's
/// consumers treat as a cache key; there is no way to build an
/// unvalidated instance outside this module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageHash(String);

impl PageHash {
    /// Parse a hash after lowercasing it, rejecting anything that does
    /// not match `[a-f0-9]{32}`.
    pub fn parse(raw: &str) -> Result<Self, InvalidHash> {
        let lowered = raw.to_ascii_lowercase();
        if HASH_RE.is_match(&lowered) {
            Ok(Self(lowered))
        } else {
            Err(InvalidHash(raw.to_string()))
        }
    }

    /// Compute the hash of raw bytes directly (used by the upload
    /// pipeline's step 8 mismatch check).
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = md5::compute(bytes);
        Self(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PageHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<PageHash> for String {
    fn from(h: PageHash) -> String {
        h.0
    }
}

/// A string failed the `[a-f0-9]{32}` hash format check.
#[derive(Debug, thiserror::Error)]
#[error("not a valid hash: {0:?}")]
pub struct InvalidHash(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_before_validating() {
        let h = PageHash::parse(&"A".repeat(32)).unwrap();
        assert_eq!(h.as_str(), "a".repeat(32));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(PageHash::parse("abc").is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!(PageHash::parse(&"z".repeat(32)).is_err());
    }

    #[test]
    fn of_bytes_matches_known_digest() {
        // md5("1") = c4ca4238a0b923820dcc509a6f75849b
        let h = PageHash::of_bytes(b"1");
        assert_eq!(h.as_str(), "c4ca4238a0b923820dcc509a6f75849b");
    }

    proptest::proptest! {
        /// Any mixed-case 32-hex string parses and canonicalizes to its
        /// lowercase form, regardless of how the caller cased it.
        #[test]
        fn parse_always_lowercases(hex in "[a-fA-F0-9]{32}") {
            let parsed = PageHash::parse(&hex).unwrap();
            proptest::prop_assert_eq!(parsed.as_str(), hex.to_ascii_lowercase());
        }

        /// Anything that isn't exactly 32 lowercase-or-uppercase hex
        /// digits is rejected.
        #[test]
        fn parse_rejects_wrong_shape(s in "[^a-fA-F0-9]{1,40}") {
            proptest::prop_assert!(PageHash::parse(&s).is_err());
        }

        /// `of_bytes` always produces something `parse` accepts —
        /// MD5 digests are always 32 lowercase hex characters.
        #[test]
        fn of_bytes_output_is_always_parseable(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let h = PageHash::of_bytes(&bytes);
            proptest::prop_assert!(PageHash::parse(h.as_str()).is_ok());
        }
    }
}

//! Content Digests
//!
//! SHA-256 fingerprints of blob content and the streaming accumulator that
//! produces them chunk by chunk.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Length of a SHA-256 digest in bytes
pub const DIGEST_LEN: usize = 32;

// ============================================================================
// Content Digest
// ============================================================================

/// SHA-256 of a blob's raw bytes; the content store's key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; DIGEST_LEN]);

impl ContentDigest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering (64 chars)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Digest of a complete in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        let mut accumulator = Accumulator::new();
        accumulator.update(data);
        accumulator.finalize()
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

/// Error parsing a hex digest
#[derive(Debug, thiserror::Error)]
pub enum DigestParseError {
    #[error("Invalid hex digest: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Digest must be {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

impl FromStr for ContentDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s)?;
        let bytes: [u8; DIGEST_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| DigestParseError::WrongLength {
                expected: DIGEST_LEN,
                actual: raw.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Accumulator
// ============================================================================

/// Running digest and byte count over an ordered chunk sequence
#[derive(Clone, Default)]
pub struct Accumulator {
    hasher: Sha256,
    bytes: u64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk; chunks must arrive in stream order
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> ContentDigest {
        ContentDigest(self.hasher.finalize().into())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // SHA-256 of the empty string
    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_empty_digest() {
        assert_eq!(Accumulator::new().finalize().to_hex(), EMPTY);
        assert_eq!(ContentDigest::of(b"").to_hex(), EMPTY);
    }

    #[test]
    fn test_chunking_does_not_change_digest() {
        let mut accumulator = Accumulator::new();
        accumulator.update(b"Hello, ");
        accumulator.update(b"");
        accumulator.update(b"World!");

        assert_eq!(accumulator.bytes(), 13);
        assert_eq!(accumulator.finalize(), ContentDigest::of(b"Hello, World!"));
    }

    #[test]
    fn test_hex_parse() {
        let digest = ContentDigest::of(b"abc");
        let parsed: ContentDigest = digest.to_hex().parse().unwrap();
        assert_eq!(parsed, digest);

        assert!(matches!(
            "abcd".parse::<ContentDigest>(),
            Err(DigestParseError::WrongLength { actual: 2, .. })
        ));
        assert!("zz".parse::<ContentDigest>().is_err());
    }

    #[test]
    fn test_serializes_as_hex_string() {
        let json = serde_json::to_string(&ContentDigest::of(b"")).unwrap();
        assert_eq!(json, format!("\"{}\"", EMPTY));
    }
}

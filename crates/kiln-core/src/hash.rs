//! Content hashing for deduplication and change detection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// A 256-bit blake3 digest of some bytes.
///
/// Two assets with the same `ContentHash` are assumed to have identical
/// content. Hashes always describe final bytes, never a description of how
/// the bytes were produced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hashes a byte slice.
    pub fn of(data: &[u8]) -> Self {
        ContentHash(*blake3::hash(data).as_bytes())
    }

    /// Hashes a sequence of byte slices as one stream.
    ///
    /// Each part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]`
    /// produce different hashes.
    pub fn of_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        ContentHash(*hasher.finalize().as_bytes())
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex representation (64 chars).
    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    /// Parses a 64-char hex string.
    pub fn from_hex(raw: &str) -> Result<Self, CoreError> {
        blake3::Hash::from_hex(raw)
            .map(|h| ContentHash(*h.as_bytes()))
            .map_err(|_| CoreError::InvalidHash {
                raw: raw.to_string(),
            })
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        ContentHash(*hash.as_bytes())
    }
}

impl FromStr for ContentHash {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentHash::from_hex(s)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}..)", &self.to_hex()[..12])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ContentHash::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

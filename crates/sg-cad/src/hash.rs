//! Content Hashing
//!
//! Every node of the construction graph is addressed by a content hash: a digest
//! of its operation tag, its literal constants and the hashes (or values) of
//! everything it consumes. The build cache is keyed by this hash, never by node
//! identity, which is what lets cached geometry survive a re-parse of the script.

use std::fmt;

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Domain separator mixed into every digest
const HASH_DOMAIN: &[u8] = b"sg-cad/content/v1";

/// 256-bit content digest of a graph node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Wrap raw digest bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering (used for cache file names)
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Parse a lowercase or uppercase hex rendering
    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex)
            .ok()
            .map(|h| Self(*h.as_bytes()))
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental builder for a [`ContentHash`]
///
/// Every write is length- or width-prefixed so that adjacent fields can never
/// run into each other and produce the same byte stream.
pub struct HashBuilder {
    hasher: blake3::Hasher,
}

impl HashBuilder {
    /// Start a digest for the given operation tag
    pub fn new(tag: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(HASH_DOMAIN);
        let mut builder = Self { hasher };
        builder.write_str(tag);
        builder
    }

    /// Mix in a string
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_u64(value.len() as u64);
        self.hasher.update(value.as_bytes());
        self
    }

    /// Mix in an unsigned integer
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    /// Mix in a small unsigned integer
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    /// Mix in a boolean flag
    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.hasher.update(&[u8::from(value)]);
        self
    }

    /// Mix in a double
    ///
    /// `-0.0` and `0.0` hash alike, and every NaN hashes to the same value.
    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        let canonical = if value == 0.0 {
            0.0f64
        } else if value.is_nan() {
            f64::NAN
        } else {
            value
        };
        self.hasher.update(&canonical.to_bits().to_le_bytes());
        self
    }

    /// Mix in a vector, component by component
    pub fn write_vec3(&mut self, value: DVec3) -> &mut Self {
        self.write_f64(value.x).write_f64(value.y).write_f64(value.z)
    }

    /// Mix in another digest
    pub fn write_hash(&mut self, value: &ContentHash) -> &mut Self {
        self.hasher.update(value.as_bytes());
        self
    }

    /// Finalize the digest
    pub fn finish(&self) -> ContentHash {
        ContentHash(*self.hasher.finalize().as_bytes())
    }
}

/// Digest of a scalar value, used when a feature consumes a parameter by value
pub fn scalar_value_hash(value: f64) -> ContentHash {
    HashBuilder::new("value/scalar").write_f64(value).finish()
}

/// Digest of a vector value, used when a feature consumes a parameter by value
pub fn vector_value_hash(value: DVec3) -> ContentHash {
    HashBuilder::new("value/vector").write_vec3(value).finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = HashBuilder::new("Box").write_f64(1.5).finish();
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex), Some(hash));
        assert_eq!(ContentHash::from_hex("not hex"), None);
    }

    #[test]
    fn test_signed_zero_is_canonical() {
        assert_eq!(scalar_value_hash(0.0), scalar_value_hash(-0.0));
        assert_ne!(scalar_value_hash(0.0), scalar_value_hash(1e-300));
    }

    #[test]
    fn test_fields_do_not_run_together() {
        let a = HashBuilder::new("t").write_str("ab").write_str("c").finish();
        let b = HashBuilder::new("t").write_str("a").write_str("bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tag_participates() {
        let a = HashBuilder::new("Sphere").write_f64(1.0).finish();
        let b = HashBuilder::new("Cylinder").write_f64(1.0).finish();
        assert_ne!(a, b);
    }
}

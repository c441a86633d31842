use std::any::Any;
use std::fmt::Write;
use std::sync::Arc;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A type-erased, thread-safe value produced by a task.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used for fingerprinting.
///
/// In `deriva`, this serves two purposes:
/// 1. It is the unit of every provenance fingerprint, deciding whether a cached
///    artifact is still valid for the current code and inputs.
/// 2. It content-addresses serialized values, so downstream fingerprints can
///    depend on *what* a dependency produced rather than *how*.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            // Writing into a String cannot fail.
            let _ = write!(&mut acc, "{byte:02x}");
        }

        acc
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != 64 || !text.is_ascii() {
            return None;
        }

        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
        }

        Some(Hash32(bytes))
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Hash32::from_hex(&text).ok_or_else(|| D::Error::custom("expected 64 hex digits"))
    }
}

/// Adapter feeding anything implementing [`std::hash::Hash`] into BLAKE3.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hash;

    #[test]
    fn test_hex_roundtrip() {
        let hash = Hash32::hash(b"deriva");
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert_eq!(Hash32::from_hex(&hex), Some(hash));
        assert_eq!(Hash32::from_hex("zz"), None);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = Hash32::hash(b"value");
        let json = serde_json::to_string(&hash).unwrap();

        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        assert_eq!(serde_json::from_str::<Hash32>(&json).unwrap(), hash);
    }

    #[test]
    fn test_hasher_is_deterministic() {
        let digest = |value: &(&str, u32)| {
            let mut hasher = Blake3Hasher::default();
            value.hash(&mut hasher);
            Hash32::from(hasher)
        };

        assert_eq!(digest(&("a", 1)), digest(&("a", 1)));
        assert_ne!(digest(&("a", 1)), digest(&("a", 2)));
    }
}

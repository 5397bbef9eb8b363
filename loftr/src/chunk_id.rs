use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Content id of a chunk, the keyed hash of its plaintext.
///
/// Primary key in both the repository and the chunk cache.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId([u8; 32]);

impl ChunkId {
    pub const LEN: usize = 32;

    /// The all-zero id, reserved for the manifest.
    pub const fn zero() -> Self {
        Self([0u8; Self::LEN])
    }
    /// Create an id from a slice. Panics if the slice is not 32 bytes.
    pub fn from_slice(s: &[u8]) -> Self {
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(s);
        Self(id)
    }
    /// Returns the id as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
    /// Returns a new vec containing the id.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
    /// Parse an id from its hex representation.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != Self::LEN * 2 {
            return None;
        }
        let mut id = [0u8; Self::LEN];
        for (index, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[index * 2..index * 2 + 2], 16).ok()?;
        }
        Some(Self(id))
    }
}

impl From<[u8; ChunkId::LEN]> for ChunkId {
    fn from(v: [u8; ChunkId::LEN]) -> Self {
        Self(v)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for ChunkId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0[..])
    }
}

struct ChunkIdVisitor;

impl<'de> Visitor<'de> for ChunkIdVisitor {
    type Value = ChunkId;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{} bytes", ChunkId::LEN)
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.len() != ChunkId::LEN {
            return Err(E::invalid_length(v.len(), &self));
        }
        Ok(ChunkId::from_slice(v))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        self.visit_bytes(&v)
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(ChunkIdVisitor)
    }
}

//! Core chain identifiers shared across the engine.

use bytes::Bytes;
use std::fmt;

/// Width of a block hash in bytes.
pub const HASH_LENGTH: usize = 32;

/// A fixed-width block identifier.
///
/// Equality and hashing are bytewise. The all-zero hash is a sentinel
/// meaning "no origin known".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; HASH_LENGTH]);

impl Hash {
    /// The zero hash sentinel.
    pub const ZERO: Hash = Hash([0u8; HASH_LENGTH]);

    /// Create a hash from raw bytes.
    pub fn new(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Check whether this is the zero sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Leading bytes are enough to tell hashes apart in logs.
        write!(f, "Hash({}…)", hex::encode(&self.0[..4]))
    }
}

/// A block as seen by the synchronization engine.
///
/// The engine only interprets the hash (identity), the parent hash, and the
/// block number; the body is carried through untouched for the consumer.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block identity.
    pub hash: Hash,
    /// Hash of the parent block.
    pub parent: Hash,
    /// Monotonic chain position.
    pub number: u64,
    /// Opaque payload.
    pub body: Bytes,
}

impl Block {
    /// Create a block without a body.
    pub fn new(hash: Hash, parent: Hash, number: u64) -> Self {
        Self {
            hash,
            parent,
            number,
            body: Bytes::new(),
        }
    }

    /// Create a block carrying an opaque body.
    pub fn with_body(hash: Hash, parent: Hash, number: u64, body: Bytes) -> Self {
        Self {
            hash,
            parent,
            number,
            body,
        }
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Block {}

//! Digest types.
//!
//! Two fixed-width digests coexist on the wire:
//!
//! - [`Digest`]: the 16-byte batch digest, MD5 over the concatenated request
//!   hashes followed by the little-endian timestamp. This is the legacy wire
//!   algorithm and must be computed identically on every replica, otherwise
//!   batch digests stop comparing equal across the cluster.
//! - [`Hash`]: a 32-byte Keccak-256 digest used for transaction hashes,
//!   execution-state digests, and every signature input.

use borsh::{BorshDeserialize, BorshSerialize};
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Keccak256};

/// Error decoding a hex string into a digest.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HexError {
    /// Input length does not match the digest width.
    #[error("expected {expected} hex chars, got {got}")]
    WrongLength { expected: usize, got: usize },
    /// Input contains a non-hex character.
    #[error("invalid hex character {0:?}")]
    InvalidChar(char),
}

fn decode_hex(s: &str, out: &mut [u8]) -> Result<(), HexError> {
    if s.len() != out.len() * 2 {
        return Err(HexError::WrongLength {
            expected: out.len() * 2,
            got: s.len(),
        });
    }
    for (i, byte) in out.iter_mut().enumerate() {
        let chunk = &s[i * 2..i * 2 + 2];
        *byte = u8::from_str_radix(chunk, 16).map_err(|_| {
            HexError::InvalidChar(chunk.chars().find(|c| !c.is_ascii_hexdigit()).unwrap_or('?'))
        })?;
    }
    Ok(())
}

/// 16-byte batch digest (MD5 of request hash list and timestamp).
///
/// The all-zero digest denotes the null batch.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct Digest(pub [u8; 16]);

impl Digest {
    /// The empty (null batch) digest.
    pub const EMPTY: Digest = Digest([0u8; 16]);

    /// Compute the batch digest over a request hash list and a timestamp.
    ///
    /// The timestamp is appended little-endian, and only when positive,
    /// matching the wire algorithm of the original protocol. Reordering the
    /// hash list changes the digest.
    pub fn of_batch(request_hashes: &[Hash], timestamp: i64) -> Digest {
        let mut hasher = Md5::new();
        for hash in request_hashes {
            hasher.update(hash.as_bytes());
        }
        if timestamp > 0 {
            hasher.update((timestamp as u64).to_le_bytes());
        }
        Digest(hasher.finalize().into())
    }

    /// Whether this is the null-batch digest.
    pub fn is_empty(&self) -> bool {
        *self == Digest::EMPTY
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Digest, HexError> {
        let mut out = [0u8; 16];
        decode_hex(s, &mut out)?;
        Ok(Digest(out))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// 32-byte Keccak-256 hash.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero hash.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Keccak-256 of the given bytes.
    pub fn digest(bytes: &[u8]) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(bytes);
        Hash(hasher.finalize().into())
    }

    /// Build from raw bytes of any length by hashing them.
    pub fn from_bytes(bytes: &[u8]) -> Hash {
        Hash::digest(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Hash, HexError> {
        let mut out = [0u8; 32];
        decode_hex(s, &mut out)?;
        Ok(Hash(out))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_digest_is_deterministic() {
        let hashes = vec![Hash::digest(b"a"), Hash::digest(b"b")];
        let d1 = Digest::of_batch(&hashes, 42);
        let d2 = Digest::of_batch(&hashes, 42);
        assert_eq!(d1, d2);
    }

    #[test]
    fn batch_digest_is_order_sensitive() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        assert_ne!(
            Digest::of_batch(&[a, b], 42),
            Digest::of_batch(&[b, a], 42)
        );
    }

    #[test]
    fn batch_digest_depends_on_timestamp() {
        let hashes = vec![Hash::digest(b"a")];
        assert_ne!(
            Digest::of_batch(&hashes, 1),
            Digest::of_batch(&hashes, 2)
        );
    }

    #[test]
    fn non_positive_timestamp_is_ignored() {
        let hashes = vec![Hash::digest(b"a")];
        assert_eq!(
            Digest::of_batch(&hashes, 0),
            Digest::of_batch(&hashes, -5)
        );
    }

    #[test]
    fn hex_round_trip() {
        let d = Digest::of_batch(&[Hash::digest(b"x")], 7);
        assert_eq!(Digest::from_hex(&d.to_string()).unwrap(), d);

        let h = Hash::digest(b"y");
        assert_eq!(Hash::from_hex(&h.to_string()).unwrap(), h);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(matches!(
            Digest::from_hex("abc"),
            Err(HexError::WrongLength { .. })
        ));
        assert!(matches!(
            Hash::from_hex(&"zz".repeat(32)),
            Err(HexError::InvalidChar(_))
        ));
    }
}

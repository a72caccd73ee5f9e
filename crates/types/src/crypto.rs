//! Signing keys and signatures.
//!
//! Thin wrappers over ed25519. The consensus core never touches key material
//! directly; it signs and verifies through the `CryptoService` capability,
//! for which [`KeyPair`] plus a public-key table is the stock implementation.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signer as _, Verifier as _};

/// Errors from signing or verification.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Signature bytes are malformed.
    #[error("malformed signature")]
    MalformedSignature,
    /// Signature does not verify against the author's public key.
    #[error("signature verification failed")]
    VerificationFailed,
    /// The author is not in the current validator set.
    #[error("unknown author {0}")]
    UnknownAuthor(u64),
}

/// An ed25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// Verify `signature` over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_slice(&signature.0)
            .map_err(|_| CryptoError::MalformedSignature)?;
        self.0
            .verify(msg, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }

    /// Raw key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

/// A detached signature.
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    /// Whether the signature is empty (unsigned placeholder).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An ed25519 keypair.
#[derive(Clone)]
pub struct KeyPair {
    signing: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a fresh keypair.
    pub fn generate() -> KeyPair {
        let mut rng = rand::rngs::OsRng;
        KeyPair {
            signing: ed25519_dalek::SigningKey::generate(&mut rng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Test helper.
    pub fn from_seed(seed: [u8; 32]) -> KeyPair {
        KeyPair {
            signing: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// Sign a message.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.signing.sign(msg).to_vec())
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key().to_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello");
        assert!(kp.public_key().verify(b"hello", &sig).is_ok());
        assert!(matches!(
            kp.public_key().verify(b"other", &sig),
            Err(CryptoError::VerificationFailed)
        ));
    }

    #[test]
    fn seed_is_deterministic() {
        let a = KeyPair::from_seed([7u8; 32]);
        let b = KeyPair::from_seed([7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }
}

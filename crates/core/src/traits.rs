//! Capability traits injected into the state machine at construction.

use crate::{Action, Event};
use rbft_messages::QuorumCheckpoint;
use rbft_types::{
    CryptoError, Epoch, EpochInfo, Height, KeyPair, PublicKey, ReplicaId, Signature, Transaction,
};
use std::collections::BTreeMap;

/// Errors from the persistent consensus store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying store failure. Fatal: consensus log durability is a
    /// prerequisite for every observable state transition.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Narrow persistent key-value surface for the consensus log.
///
/// Keys are flat strings; the core uses prefixes for watermark, view, QPC
/// sets, batches, checkpoints, and epoch proofs. A write must be durable
/// before the resulting state transition is considered observable.
pub trait Storage: Send + Sync {
    /// Store `value` under `key`.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Fetch the value under `key`.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Remove `key`.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All key/value pairs whose key starts with `prefix`.
    fn iterate(&self, prefix: &str) -> BTreeMap<String, Vec<u8>>;

    /// Remove every key starting with `prefix`.
    fn destroy(&self, prefix: &str) -> Result<(), StorageError>;
}

/// Signing and verification keyed per replica.
pub trait CryptoService: Send + Sync {
    /// Sign a message hash with this replica's key.
    fn sign(&self, msg: &[u8]) -> Result<Signature, CryptoError>;

    /// Verify `signature` over `msg` against `author`'s key.
    fn verify(
        &self,
        author: ReplicaId,
        signature: &Signature,
        msg: &[u8],
    ) -> Result<(), CryptoError>;
}

/// Stock [`CryptoService`]: an ed25519 keypair plus the cluster's public-key
/// table.
pub struct KeyedCrypto {
    keypair: KeyPair,
    public_keys: BTreeMap<ReplicaId, PublicKey>,
}

impl KeyedCrypto {
    /// Build from this replica's keypair and the cluster key table.
    pub fn new(keypair: KeyPair, public_keys: BTreeMap<ReplicaId, PublicKey>) -> KeyedCrypto {
        KeyedCrypto {
            keypair,
            public_keys,
        }
    }
}

impl CryptoService for KeyedCrypto {
    fn sign(&self, msg: &[u8]) -> Result<Signature, CryptoError> {
        Ok(self.keypair.sign(msg))
    }

    fn verify(
        &self,
        author: ReplicaId,
        signature: &Signature,
        msg: &[u8],
    ) -> Result<(), CryptoError> {
        let key = self
            .public_keys
            .get(&author)
            .ok_or(CryptoError::UnknownAuthor(author.0))?;
        key.verify(msg, signature)
    }
}

/// The ledger-side epoch service.
///
/// Both the core and the execution service hold the same handle, so the
/// configuration-batch predicate and epoch descriptors agree between them.
pub trait EpochService: Send + Sync {
    /// Re-read the current epoch after an epoch transition completed on the
    /// ledger; returns the new epoch descriptor.
    fn reconfiguration(&self) -> EpochInfo;

    /// The epoch descriptor currently in force on the ledger.
    fn current_epoch_info(&self) -> EpochInfo;

    /// The descriptor of a past epoch, if retained.
    fn epoch_info(&self, epoch: Epoch) -> Option<EpochInfo>;

    /// Whether the block at `height` is a configuration block.
    fn is_config_block(&self, height: Height) -> bool;

    /// The quorum checkpoint that sealed `epoch`, if retained.
    fn checkpoint_of_epoch(&self, epoch: Epoch) -> Option<QuorumCheckpoint>;
}

/// The replica state machine: events in, actions out.
pub trait StateMachine {
    /// Transaction type ordered by this machine.
    type Tx: Transaction;

    /// Process one event, returning the actions it produced.
    fn handle(&mut self, event: Event<Self::Tx>) -> Vec<Action<Self::Tx>>;
}

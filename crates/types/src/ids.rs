//! Identifier types.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// View number. Selects the primary within an epoch, monotone within it.
pub type View = u64;

/// Sequence number assigned to a batch by the primary.
pub type SeqNo = u64;

/// Epoch number. A contiguous range of sequences governed by one validator set.
pub type Epoch = u64;

/// Block height reported by the execution layer. Equal to the batch sequence
/// number for every executed batch.
pub type Height = u64;

/// Replica identifier, 1-based within the validator set of an epoch.
#[derive(
    Debug,
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
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Get the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        ReplicaId(id)
    }
}

/// The three-tuple that uniquely keys a certificate within an epoch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct MsgId {
    /// View.
    pub v: View,
    /// Sequence number.
    pub n: SeqNo,
    /// Batch digest.
    pub d: crate::Digest,
}

impl MsgId {
    /// Construct a certificate key.
    pub fn new(v: View, n: SeqNo, d: crate::Digest) -> MsgId {
        MsgId { v, n, d }
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v={}/n={}/d={}", self.v, self.n, self.d)
    }
}

//! Network messages for the consensus protocol.
//!
//! The message taxonomy is a closed tagged union: every remote input to the
//! core is one [`ConsensusMessage`] variant, carried inside an [`Envelope`]
//! stamping the sender, its epoch, and a trace context. Dispatch over the
//! union is exhaustive by construction.
//!
//! Wire encoding is borsh, which is deterministic; signature inputs are the
//! Keccak-256 of the borsh serialization of the signed payload.

mod consensus;
mod trace_context;

pub use consensus::{
    Checkpoint, Commit, ConsensusMessage, Envelope, EpochChangeProof, EpochChangeRequest,
    ExecuteState, FetchBatchRequest, FetchBatchResponse, FetchCheckpoint, FetchMissingRequest,
    FetchMissingResponse, FetchPqcRequest, FetchPqcResponse, FetchView, HashBatch, NewView,
    NullRequest, PrePrepare, Prepare, QuorumCheckpoint, QuorumViewChange, RebroadcastRequestSet,
    RecoveryResponse, SignedCheckpoint, SyncState, SyncStateResponse, VcBasis, VcPq, ViewChange,
    WireBatch, Xset,
};
pub use trace_context::TraceContext;

use borsh::BorshSerialize;
use rbft_types::Hash;

/// Keccak-256 over the borsh serialization of a signable payload.
///
/// Borsh has a total, canonical encoding for these types, so the hash is
/// identical across replicas for identical logical values.
pub fn signing_hash<T: BorshSerialize>(value: &T) -> Hash {
    let bytes = borsh::to_vec(value).expect("borsh serialization of signable payload");
    Hash::digest(&bytes)
}

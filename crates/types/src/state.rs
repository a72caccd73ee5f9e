//! Execution-service state snapshots and the externally visible node status.

use crate::{Digest, Epoch, EpochInfo, Hash, Height, ReplicaId, View};
use borsh::{BorshDeserialize, BorshSerialize};

/// The (height, digest) pair identifying an execution state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct MetaState {
    /// Executed height.
    pub height: Height,
    /// Execution state digest at that height.
    pub digest: Hash,
}

/// State reported by the execution service, with the batch digest of the
/// block at `meta_state.height` and the epoch the executor observed.
#[derive(Debug, Clone, Default)]
pub struct ServiceState {
    /// Executed (height, digest).
    pub meta_state: MetaState,
    /// Digest of the batch ordered at this height.
    pub batch_digest: Digest,
    /// Epoch the execution layer is in. Zero means unchanged.
    pub epoch: Epoch,
}

/// Lifecycle status reported through `status()`.
///
/// At most one primary status is reported; `Normal` only when no abnormal
/// bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    /// Normal three-phase operation.
    Normal,
    /// Processing a configuration batch.
    InConfChange,
    /// View change in progress.
    InViewChange,
    /// Recovery in progress.
    InRecovery,
    /// State transfer in progress.
    StateTransferring,
    /// Request pool is full.
    PoolFull,
    /// Not yet started, or restarted and not yet recovered.
    Pending,
    /// Stopped; no consensus messages are processed.
    Stopped,
    /// Fatal: the cluster produced irreconcilable checkpoints.
    Inconsistent,
}

/// A snapshot of the replica's externally observable state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    /// This replica's id.
    pub id: ReplicaId,
    /// Current view.
    pub view: View,
    /// Low watermark.
    pub h: Height,
    /// Epoch configuration in force.
    pub epoch_info: EpochInfo,
    /// Lifecycle status.
    pub status: StatusType,
}

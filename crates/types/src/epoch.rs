//! Epoch configuration.
//!
//! An epoch is a contiguous range `[start_block, start_block + epoch_period)`
//! with a fixed validator set and consensus parameters. Epoch transition is
//! driven by configuration batches and stable checkpoints carrying
//! `need_update_epoch`.

use crate::{Epoch, Height, ReplicaId};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// Default checkpoint period (K).
pub const DEFAULT_CHECKPOINT_PERIOD: u64 = 10;

/// Default high-watermark multiplier; log size L = K * multiplier.
pub const DEFAULT_HIGH_WATERMARK_MULTIPLIER: u64 = 4;

/// How the primary for a view is elected.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum ProposerElectionType {
    /// Primary rotates round-robin by view over the validator set.
    #[default]
    RoundRobin,
    /// Weighted-random-function rotation: the view is advanced by one on
    /// every stable checkpoint, rotating the proposer each window.
    Wrf,
}

/// A member of the validator set.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct ValidatorInfo {
    /// Replica id, 1-based within the epoch.
    pub id: ReplicaId,
    /// Addressing identity used by `unicast_by_hostname`.
    pub hostname: String,
    /// Staking account of the replica; reported to the executor as the
    /// proposer account of the batches it ordered.
    pub account_address: String,
}

/// Consensus parameters fixed for the duration of an epoch.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct ConsensusParams {
    /// Checkpoint period K: a checkpoint is taken every K executed blocks.
    pub checkpoint_period: u64,
    /// High-watermark multiplier: log size L = K * multiplier.
    pub high_watermark_multiplier: u64,
    /// Proposer election discipline.
    pub proposer_election_type: ProposerElectionType,
    /// Whether the primary may generate empty batches on a timer when the
    /// mempool is empty.
    pub enable_timed_gen_empty_block: bool,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            checkpoint_period: DEFAULT_CHECKPOINT_PERIOD,
            high_watermark_multiplier: DEFAULT_HIGH_WATERMARK_MULTIPLIER,
            proposer_election_type: ProposerElectionType::RoundRobin,
            enable_timed_gen_empty_block: false,
        }
    }
}

/// Epoch descriptor: validator set plus consensus parameters for a range of
/// sequence numbers.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct EpochInfo {
    /// Epoch number, monotone across the chain lifetime.
    pub epoch: Epoch,
    /// First block of the epoch.
    pub start_block: Height,
    /// Number of blocks governed by this epoch.
    pub epoch_period: u64,
    /// Validator set of the epoch, ordered; replica ids are 1-based indexes
    /// into this order.
    pub validator_set: Vec<ValidatorInfo>,
    /// Consensus parameters.
    pub consensus_params: ConsensusParams,
}

impl EpochInfo {
    /// Number of replicas N.
    pub fn n(&self) -> usize {
        self.validator_set.len()
    }

    /// Maximum tolerated Byzantine replicas F = (N - 1) / 3.
    pub fn f(&self) -> usize {
        (self.n().saturating_sub(1)) / 3
    }

    /// The last sequence number this epoch may order.
    pub fn last_block(&self) -> Height {
        self.start_block + self.epoch_period - 1
    }

    /// Look up a validator by replica id.
    pub fn validator(&self, id: ReplicaId) -> Option<&ValidatorInfo> {
        self.validator_set.iter().find(|v| v.id == id)
    }

    /// Whether the given replica id belongs to this epoch's validator set.
    pub fn contains(&self, id: ReplicaId) -> bool {
        self.validator(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch_with(n: u64) -> EpochInfo {
        EpochInfo {
            epoch: 1,
            start_block: 1,
            epoch_period: 1000,
            validator_set: (1..=n)
                .map(|i| ValidatorInfo {
                    id: ReplicaId(i),
                    hostname: format!("node{i}"),
                    account_address: format!("0x{i:02x}"),
                })
                .collect(),
            consensus_params: ConsensusParams::default(),
        }
    }

    #[test]
    fn f_from_n() {
        assert_eq!(epoch_with(4).f(), 1);
        assert_eq!(epoch_with(7).f(), 2);
        assert_eq!(epoch_with(10).f(), 3);
    }

    #[test]
    fn last_block() {
        let e = epoch_with(4);
        assert_eq!(e.last_block(), 1000);
    }
}

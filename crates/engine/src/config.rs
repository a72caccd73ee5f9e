//! Engine configuration and the chain configuration derived from the epoch.

use rbft_types::{
    EpochInfo, Hash, Height, ProposerElectionType, ReplicaId, SeqNo, View,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static configuration to start a replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// This replica's id.
    pub self_id: ReplicaId,
    /// Epoch in force at genesis; superseded by the epoch service once the
    /// ledger has advanced.
    pub genesis_epoch: EpochInfo,
    /// Latest height the application had applied when the replica started.
    pub applied: Height,
    /// Execution digest at `applied`.
    pub applied_digest: Hash,
    /// Max transactions per relayed request set.
    pub set_size: usize,
    /// Whether to accept remote request sets while the pool is full.
    pub flow_control: bool,

    /// Max wait before the primary cuts a non-full batch.
    pub batch_timeout: Duration,
    /// Max wait before the primary cuts an empty batch (timed empty blocks).
    pub no_tx_batch_timeout: Duration,
    /// Max wait for consensus on one batch before suspecting the primary.
    pub request_timeout: Duration,
    /// Max wait for the primary's null request before a view change.
    pub null_request_timeout: Duration,
    /// Wait for a view-change quorum before falling back to recovery.
    pub vc_resend_timeout: Duration,
    /// Interval for clearing out-of-date view-change messages.
    pub clean_vc_timeout: Duration,
    /// Max wait for the new-view message during a view change.
    pub new_view_timeout: Duration,
    /// Collection window for sync-state responses.
    pub sync_state_timeout: Duration,
    /// Interval between idle sync-state probes.
    pub sync_state_restart_timeout: Duration,
    /// Retry interval for fetching a config checkpoint.
    pub fetch_checkpoint_timeout: Duration,
    /// Retry interval for fetching an agreed new view.
    pub fetch_view_timeout: Duration,
    /// Grace period for a stuck watermark window.
    pub high_watermark_timeout: Duration,
    /// Interval for rebroadcasting out-of-date requests.
    pub check_pool_timeout: Duration,
    /// Interval for evicting timed-out requests.
    pub check_pool_remove_timeout: Duration,
}

impl EngineConfig {
    /// Defaults for tests and local clusters.
    pub fn new(self_id: ReplicaId, genesis_epoch: EpochInfo) -> EngineConfig {
        EngineConfig {
            self_id,
            genesis_epoch,
            applied: 0,
            applied_digest: Hash::ZERO,
            set_size: 25,
            flow_control: false,
            batch_timeout: Duration::from_millis(500),
            no_tx_batch_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(6),
            null_request_timeout: Duration::from_secs(9),
            vc_resend_timeout: Duration::from_secs(10),
            clean_vc_timeout: Duration::from_secs(60),
            new_view_timeout: Duration::from_secs(8),
            sync_state_timeout: Duration::from_secs(1),
            sync_state_restart_timeout: Duration::from_secs(10),
            fetch_checkpoint_timeout: Duration::from_secs(5),
            fetch_view_timeout: Duration::from_secs(1),
            high_watermark_timeout: Duration::from_secs(4),
            check_pool_timeout: Duration::from_secs(60),
            check_pool_remove_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Live chain position: the epoch in force plus the replica's view and
/// watermark window, with derived quorum sizes.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Epoch configuration in force.
    pub epoch_info: EpochInfo,
    /// Current view.
    pub view: View,
    /// Low watermark: last stable checkpoint sequence.
    pub h: Height,
    /// Log size L = checkpoint_period * high_watermark_multiplier.
    pub l: u64,
    /// Replica count.
    pub n: usize,
    /// Max tolerated Byzantine replicas.
    pub f: usize,
    /// Primary of the current view.
    pub primary_id: ReplicaId,
    /// This replica.
    pub self_id: ReplicaId,
    /// Execution digest of the last stable checkpoint.
    pub last_checkpoint_digest: Hash,
}

impl ChainConfig {
    /// Build from an epoch descriptor.
    pub fn new(self_id: ReplicaId, epoch_info: EpochInfo) -> ChainConfig {
        let mut chain = ChainConfig {
            epoch_info,
            view: 0,
            h: 0,
            l: 0,
            n: 0,
            f: 0,
            primary_id: ReplicaId(0),
            self_id,
            last_checkpoint_digest: Hash::ZERO,
        };
        chain.update_derived();
        chain
    }

    /// Recompute N, F, L, and the primary after the epoch or view changed.
    pub fn update_derived(&mut self) {
        self.n = self.epoch_info.n();
        self.f = self.epoch_info.f();
        let params = &self.epoch_info.consensus_params;
        self.l = params.checkpoint_period * params.high_watermark_multiplier;
        self.primary_id = self.elect_primary(self.view);
    }

    /// Primary of a view: round-robin over the validator set order. The WRF
    /// variant reuses the same rotation; it differs only in when the view
    /// advances.
    pub fn elect_primary(&self, view: View) -> ReplicaId {
        let set = &self.epoch_info.validator_set;
        if set.is_empty() {
            return ReplicaId(0);
        }
        set[(view as usize) % set.len()].id
    }

    /// Install a new view and recompute the primary.
    pub fn set_view(&mut self, view: View) {
        self.view = view;
        self.primary_id = self.elect_primary(view);
    }

    /// Current epoch number.
    pub fn epoch(&self) -> u64 {
        self.epoch_info.epoch
    }

    /// Checkpoint period K.
    pub fn checkpoint_period(&self) -> u64 {
        self.epoch_info.consensus_params.checkpoint_period
    }

    /// Whether the WRF proposer rotation is in force.
    pub fn is_wrf(&self) -> bool {
        self.epoch_info.consensus_params.proposer_election_type == ProposerElectionType::Wrf
    }

    /// Whether `id` is the primary of the current view.
    pub fn is_primary(&self, id: ReplicaId) -> bool {
        self.primary_id == id
    }

    /// Whether this replica is the primary of the current view.
    pub fn self_is_primary(&self) -> bool {
        self.is_primary(self.self_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Quorums
    // ═══════════════════════════════════════════════════════════════════════

    /// Common-case quorum ⌈(N+F+1)/2⌉; equals 2F+1 when N = 3F+1. Every two
    /// such quorums intersect in at least F+1 replicas.
    pub fn common_case_quorum(&self) -> usize {
        (self.n + self.f + 2) / 2
    }

    /// F+1: any set of this size contains at least one correct replica.
    pub fn one_correct_quorum(&self) -> usize {
        self.f + 1
    }

    /// N−F: the number of replicas guaranteed to be correct.
    pub fn all_correct_quorum(&self) -> usize {
        self.n - self.f
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Watermark window
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether a sequence is above the low watermark.
    pub fn in_w(&self, n: SeqNo) -> bool {
        n > self.h
    }

    /// Whether a view equals the current view.
    pub fn in_v(&self, v: View) -> bool {
        self.view == v
    }

    /// Whether (v, n) is in the current view and above the watermark.
    pub fn in_wv(&self, v: View, n: SeqNo) -> bool {
        self.in_v(v) && self.in_w(n)
    }

    /// Whether the primary may assign `n`: inside the watermark window and
    /// not past the epoch's last block.
    pub fn send_in_w(&self, n: SeqNo) -> bool {
        n > self.h && n <= self.h + self.l && n <= self.epoch_info.last_block()
    }

    /// Whether `n` is beyond the high watermark or the epoch end.
    pub fn beyond_range(&self, n: SeqNo) -> bool {
        n > self.h + self.l || n > self.epoch_info.last_block()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbft_types::{ConsensusParams, ValidatorInfo};

    fn chain(n: u64) -> ChainConfig {
        let epoch = EpochInfo {
            epoch: 1,
            start_block: 1,
            epoch_period: 100_000,
            validator_set: (1..=n)
                .map(|i| ValidatorInfo {
                    id: ReplicaId(i),
                    hostname: format!("node{i}"),
                    account_address: format!("0x{i:02x}"),
                })
                .collect(),
            consensus_params: ConsensusParams::default(),
        };
        ChainConfig::new(ReplicaId(1), epoch)
    }

    #[test]
    fn quorum_sizes() {
        let c = chain(4);
        assert_eq!(c.f, 1);
        assert_eq!(c.common_case_quorum(), 3);
        assert_eq!(c.one_correct_quorum(), 2);
        assert_eq!(c.all_correct_quorum(), 3);

        let c = chain(7);
        assert_eq!(c.f, 2);
        assert_eq!(c.common_case_quorum(), 5);
    }

    #[test]
    fn primary_rotates_with_view() {
        let mut c = chain(4);
        assert_eq!(c.primary_id, ReplicaId(1));
        c.set_view(1);
        assert_eq!(c.primary_id, ReplicaId(2));
        c.set_view(4);
        assert_eq!(c.primary_id, ReplicaId(1));
    }

    #[test]
    fn watermark_window() {
        let mut c = chain(4);
        c.h = 10;
        assert!(!c.in_w(10));
        assert!(c.in_w(11));
        assert!(c.send_in_w(11));
        assert!(c.send_in_w(10 + c.l));
        assert!(!c.send_in_w(11 + c.l));
        assert!(c.beyond_range(11 + c.l));
    }
}

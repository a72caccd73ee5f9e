//! Epoch management: configuration batches, epoch quorum proofs, and
//! catch-up of replicas left behind by an epoch change.

use crate::replica::Replica;
use crate::status::StatusBit;
use rbft_core::{Action, Event, TimerId};
use rbft_mempool::RequestPool;
use rbft_messages::{
    ConsensusMessage, Envelope, EpochChangeProof, EpochChangeRequest, FetchCheckpoint,
    QuorumCheckpoint,
};
use rbft_types::{Epoch, MetaState, ReplicaId, SeqNo, Transaction};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Epoch bookkeeping.
#[derive(Debug, Default)]
pub struct EpochManager {
    /// Peers observed in a higher epoch, with the epoch they claimed.
    pub check_out_of_epoch: HashMap<ReplicaId, Epoch>,
    /// Configuration batch awaiting stable-checkpoint verification; set
    /// after a config batch executes, cleared when its checkpoint is stable.
    pub config_batch_to_check: Option<MetaState>,
    /// Sequence of the config batch submitted for execution, zero if none.
    pub config_batch_to_execute: SeqNo,
    /// Verified epoch-change proofs by epoch.
    pub epoch_proof_cache: BTreeMap<Epoch, QuorumCheckpoint>,
}

impl EpochManager {
    pub(crate) fn new() -> EpochManager {
        EpochManager::default()
    }
}

impl<T: Transaction, P: RequestPool<T>> Replica<T, P> {
    // ═══════════════════════════════════════════════════════════════════════
    // Epoch filter
    // ═══════════════════════════════════════════════════════════════════════

    /// A message arrived from a different epoch. Epoch catch-up messages
    /// are handled; anything else from a higher epoch is tracked as
    /// evidence that this replica missed an epoch change.
    pub(crate) fn check_epoch(&mut self, envelope: &Envelope) -> Vec<Action<T>> {
        match &envelope.msg {
            ConsensusMessage::EpochChangeRequest(req) => {
                self.recv_epoch_change_request(req.clone())
            }
            ConsensusMessage::EpochChangeProof(proof) => {
                self.recv_epoch_change_proof(proof.clone())
            }
            _ => {
                if envelope.epoch > self.chain.epoch() {
                    self.check_if_out_of_epoch(envelope.from, envelope.epoch)
                } else {
                    debug!(
                        epoch = envelope.epoch,
                        msg = envelope.msg.type_name(),
                        "message from an expired epoch, dropping"
                    );
                    Vec::new()
                }
            }
        }
    }

    fn check_if_out_of_epoch(&mut self, from: ReplicaId, epoch: Epoch) -> Vec<Action<T>> {
        self.epoch_mgr.check_out_of_epoch.insert(from, epoch);
        debug!(
            from = %from,
            their_epoch = epoch,
            our_epoch = self.chain.epoch(),
            observed = self.epoch_mgr.check_out_of_epoch.len(),
            "peer in a higher epoch"
        );
        if self.epoch_mgr.check_out_of_epoch.len() < self.chain.one_correct_quorum() {
            return Vec::new();
        }
        let target = self
            .epoch_mgr
            .check_out_of_epoch
            .values()
            .copied()
            .max()
            .unwrap_or(epoch);
        self.epoch_mgr.check_out_of_epoch.clear();
        info!(target, "f+1 peers in a higher epoch, requesting proofs");
        vec![self.peers.broadcast(
            self.chain.epoch(),
            ConsensusMessage::EpochChangeRequest(EpochChangeRequest {
                replica_id: self.chain.self_id,
                start_epoch: self.chain.epoch(),
                target_epoch: target,
            }),
        )]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Epoch change proofs
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn recv_epoch_change_request(
        &mut self,
        req: EpochChangeRequest,
    ) -> Vec<Action<T>> {
        debug!(
            from = %req.replica_id,
            start = req.start_epoch,
            target = req.target_epoch,
            "received epoch change request"
        );
        if req.target_epoch <= req.start_epoch {
            warn!(from = %req.replica_id, "bad epoch change request range");
            return Vec::new();
        }

        let mut epoch_changes = Vec::new();
        let mut more = 0;
        for epoch in req.start_epoch..req.target_epoch {
            match self
                .epoch_mgr
                .epoch_proof_cache
                .get(&epoch)
                .cloned()
                .or_else(|| self.epoch_service.checkpoint_of_epoch(epoch))
            {
                Some(quorum) => epoch_changes.push(quorum),
                None => {
                    more = req.target_epoch - epoch;
                    break;
                }
            }
        }
        if epoch_changes.is_empty() {
            debug!(from = %req.replica_id, "no epoch proofs to serve");
            return Vec::new();
        }
        vec![self.peers.unicast(
            self.chain.epoch(),
            ConsensusMessage::EpochChangeProof(EpochChangeProof {
                author: self.chain.self_id,
                epoch_changes,
                more,
            }),
            req.replica_id,
        )]
    }

    pub(crate) fn recv_epoch_change_proof(&mut self, proof: EpochChangeProof) -> Vec<Action<T>> {
        let Some(last) = proof.last() else {
            debug!(from = %proof.author, "empty epoch change proof");
            return Vec::new();
        };
        let target_epoch = last.checkpoint.next_epoch();
        if target_epoch <= self.chain.epoch() {
            debug!(target_epoch, "epoch change proof is not ahead of us");
            return Vec::new();
        }

        // Each quorum checkpoint must carry enough valid signatures over
        // its canonical hash.
        for quorum in &proof.epoch_changes {
            let hash = quorum.checkpoint.hash();
            let valid = quorum
                .signatures
                .iter()
                .filter(|(author, signature)| {
                    self.crypto.verify(**author, signature, hash.as_bytes()).is_ok()
                })
                .count();
            if valid < self.chain.common_case_quorum() {
                warn!(
                    from = %proof.author,
                    epoch = quorum.checkpoint.epoch,
                    valid,
                    "epoch change proof lacks a quorum of valid signatures"
                );
                return Vec::new();
            }
        }

        info!(
            from = %proof.author,
            target_epoch,
            height = last.checkpoint.height(),
            "verified epoch change proof"
        );
        vec![Action::EnqueueInternal {
            event: Box::new(Event::EpochSync {
                proof: Box::new(proof),
            }),
        }]
    }

    /// Block consensus and state-transfer to the proof's last checkpoint.
    pub(crate) fn on_epoch_sync(&mut self, proof: EpochChangeProof) -> Vec<Action<T>> {
        let Some(last) = proof.last() else {
            return Vec::new();
        };
        for quorum in &proof.epoch_changes {
            self.epoch_mgr
                .epoch_proof_cache
                .insert(quorum.checkpoint.epoch, quorum.clone());
        }
        info!(
            height = last.checkpoint.height(),
            epoch = last.checkpoint.next_epoch(),
            "syncing to epoch change height"
        );
        self.status.on(StatusBit::InEpochSyncing);
        let target = MetaState {
            height: last.checkpoint.height(),
            digest: last.checkpoint.digest(),
        };
        let checkpoint_set = last.signed_checkpoints();
        self.update_high_state_target(target, checkpoint_set, proof.epoch_changes.clone());
        self.try_state_transfer()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Config checkpoint fetch
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn on_fetch_checkpoint_timer(&mut self) -> Vec<Action<T>> {
        self.fetch_checkpoint()
    }

    fn fetch_checkpoint(&mut self) -> Vec<Action<T>> {
        let Some(meta) = self.epoch_mgr.config_batch_to_check else {
            debug!("no config batch awaiting a stable checkpoint");
            return Vec::new();
        };
        debug!(seq_no = meta.height, "fetching config checkpoint");
        let mut actions = vec![self.peers.broadcast(
            self.chain.epoch(),
            ConsensusMessage::FetchCheckpoint(FetchCheckpoint {
                replica_host: self.peers.hostname.clone(),
                seq_no: meta.height,
            }),
        )];
        actions.push(self.start_timer(
            TimerId::FetchCheckpoint,
            self.config.fetch_checkpoint_timeout,
            Event::FetchCheckpointTimer,
        ));
        actions
    }

    pub(crate) fn recv_fetch_checkpoint(&mut self, fetch: FetchCheckpoint) -> Vec<Action<T>> {
        if !self.peers.contains_hostname(&fetch.replica_host) {
            return Vec::new();
        }
        // Serve the requested height, or our watermark if the requester is
        // clearly behind.
        let signed = self
            .store
            .local_checkpoints
            .get(&fetch.seq_no)
            .or_else(|| self.store.local_checkpoints.get(&self.chain.h))
            .cloned();
        let Some(signed) = signed else {
            warn!(
                h = self.chain.h,
                "no checkpoint at the low watermark, this replica may be behind"
            );
            return Vec::new();
        };
        vec![self.peers.unicast_by_hostname(
            self.chain.epoch(),
            ConsensusMessage::SignedCheckpoint(signed),
            fetch.replica_host,
        )]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Epoch transition
    // ═══════════════════════════════════════════════════════════════════════

    /// Adopt the ledger's new epoch: new validator set, view zero, fresh
    /// view-change state.
    pub(crate) fn turn_into_epoch(&mut self, actions: &mut Vec<Action<T>>) {
        let epoch_info = self.epoch_service.reconfiguration();
        self.chain.epoch_info = epoch_info;
        self.chain.update_derived();
        self.peers.update_routing(&self.chain.epoch_info);

        self.set_view(0);
        actions.extend(self.persist_view_attestation());

        self.vc_mgr.view_change_store.clear();
        self.epoch_mgr.check_out_of_epoch.clear();
        self.recovery_mgr.sync_rsp_store.clear();

        info!(
            epoch = self.chain.epoch(),
            n = self.chain.n,
            view = self.chain.view,
            height = self.exec.last_exec(),
            "turned into a new epoch"
        );
    }

    /// Reconcile with the ledger's current epoch. Returns whether the epoch
    /// changed; the watermark is pulled up to the epoch's start.
    pub(crate) fn sync_epoch(&mut self, actions: &mut Vec<Action<T>>) -> bool {
        let current = self.epoch_service.current_epoch_info();
        let changed = current.epoch != self.chain.epoch();
        if changed {
            info!(
                from = self.chain.epoch(),
                to = current.epoch,
                start_block = current.start_block,
                "epoch changed on the ledger"
            );
            let start = current.start_block;
            self.turn_into_epoch(actions);
            actions.extend(self.move_watermarks(start.saturating_sub(1), true));
        } else {
            debug!(epoch = self.chain.epoch(), "epoch unchanged");
        }
        changed
    }
}

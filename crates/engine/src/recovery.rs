//! Recovery and sync-state: the bootstrap path after start or detected lag.
//!
//! Recovery reuses the view-change machinery to converge on (view, H); the
//! sync-state probe compares the whole network's position, and fetch-PQC
//! replays missed certificate messages through the normal-case handlers.

use crate::replica::Replica;
use crate::status::StatusBit;
use rbft_core::{Action, Event, FilterEvent, TimerId};
use rbft_mempool::RequestPool;
use rbft_messages::{
    Checkpoint, ConsensusMessage, ExecuteState, FetchPqcRequest, FetchPqcResponse, Prepare,
    SignedCheckpoint, SyncState, SyncStateResponse,
};
use rbft_types::{Hash, Height, MetaState, ReplicaId, Transaction, View};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Sync-state response bookkeeping.
#[derive(Debug, Default)]
pub struct RecoveryManager {
    /// Responses by author for the probe in flight.
    pub sync_rsp_store: HashMap<ReplicaId, SyncStateResponse>,
}

impl RecoveryManager {
    pub(crate) fn new() -> RecoveryManager {
        RecoveryManager::default()
    }
}

impl<T: Transaction, P: RequestPool<T>> Replica<T, P> {
    // ═══════════════════════════════════════════════════════════════════════
    // Recovery
    // ═══════════════════════════════════════════════════════════════════════

    /// Start recovery: converge on the cluster's (view, H) by probing the
    /// whole network. The view itself only advances through genuine view
    /// changes; recovery adopts whatever the quorum already agreed on.
    pub(crate) fn init_recovery(&mut self) -> Vec<Action<T>> {
        debug!(view = self.chain.view, "initiating recovery");
        self.status.on(StatusBit::InRecovery);
        self.restart_sync_state()
    }

    /// Leave recovery and resume: report, catch up PQC, and re-arm the
    /// heartbeat.
    pub(crate) fn finish_recovery(&mut self) -> Vec<Action<T>> {
        self.status.off(StatusBit::InRecovery);
        self.maybe_set_normal();
        let msg = format!(
            "replica {} finished recovery, primary={}, epoch={}/n={}/view={}/h={}/last_exec={}",
            self.chain.self_id,
            self.chain.primary_id,
            self.chain.epoch(),
            self.chain.n,
            self.chain.view,
            self.chain.h,
            self.exec.last_exec()
        );
        info!("{msg}");
        let mut actions = vec![Action::SendFilterEvent {
            event: FilterEvent::FinishRecovery(msg),
        }];
        actions.extend(self.fetch_recovery_pqc());
        actions.push(self.null_request_timer_reset());
        // The primary may have pooled transactions while converging.
        if self.is_normal() && self.chain.self_is_primary() {
            actions.extend(self.primary_resubmit_transactions());
        }
        actions
    }

    /// Ask peers for certificate messages in `(h, h+L]` missed while
    /// lagging; replies are injected through the normal-case handlers.
    pub(crate) fn fetch_recovery_pqc(&mut self) -> Vec<Action<T>> {
        debug!(h = self.chain.h, "fetching recovery PQC");
        vec![self.peers.broadcast(
            self.chain.epoch(),
            ConsensusMessage::FetchPqcRequest(FetchPqcRequest {
                replica_id: self.chain.self_id,
                h: self.chain.h,
            }),
        )]
    }

    pub(crate) fn recv_fetch_pqc_request(&mut self, req: FetchPqcRequest) -> Vec<Action<T>> {
        debug!(from = %req.replica_id, h = req.h, "received fetch-PQC request");
        if !self.peers.contains(req.replica_id) {
            warn!(from = %req.replica_id, "fetch-PQC from unknown replica");
            return Vec::new();
        }

        let mut response = FetchPqcResponse {
            replica_id: self.chain.self_id,
            ..Default::default()
        };
        let upper = req.h + self.chain.l;
        for (id, cert) in &self.store.cert_store {
            if id.n <= req.h || id.n > upper || id.v != self.chain.view {
                continue;
            }
            if let Some(pp) = &cert.pre_prepare {
                response.pre_prepares.push(pp.clone());
            }
            if cert.sent_prepare {
                response.prepares.push(Prepare {
                    view: id.v,
                    seq_no: id.n,
                    batch_digest: id.d,
                    replica_id: self.chain.self_id,
                });
            }
            if cert.sent_commit {
                response.commits.push(rbft_messages::Commit {
                    view: id.v,
                    seq_no: id.n,
                    batch_digest: id.d,
                    replica_id: self.chain.self_id,
                });
            }
        }
        if response.pre_prepares.is_empty()
            && response.prepares.is_empty()
            && response.commits.is_empty()
        {
            debug!(from = %req.replica_id, "nothing to return for fetch-PQC");
            return Vec::new();
        }
        vec![self.peers.unicast(
            self.chain.epoch(),
            ConsensusMessage::FetchPqcResponse(response),
            req.replica_id,
        )]
    }

    pub(crate) fn recv_fetch_pqc_response(&mut self, resp: FetchPqcResponse) -> Vec<Action<T>> {
        debug!(
            from = %resp.replica_id,
            pre_prepares = resp.pre_prepares.len(),
            prepares = resp.prepares.len(),
            commits = resp.commits.len(),
            "received fetch-PQC response"
        );
        let mut actions = Vec::new();
        for pp in resp.pre_prepares {
            actions.extend(self.recv_pre_prepare(pp));
        }
        for prepare in resp.prepares {
            actions.extend(self.recv_prepare(prepare));
        }
        for commit in resp.commits {
            actions.extend(self.recv_commit(commit));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync state
    // ═══════════════════════════════════════════════════════════════════════

    /// Begin a sync-state probe unless one is already in flight.
    pub(crate) fn try_sync_state(&mut self) -> Vec<Action<T>> {
        if self.status.is(StatusBit::InSyncState) {
            return Vec::new();
        }
        if !self.is_normal() {
            debug!("abnormal, not probing cluster state");
            return Vec::new();
        }
        self.restart_sync_state()
    }

    pub(crate) fn restart_sync_state(&mut self) -> Vec<Action<T>> {
        debug!("broadcasting sync-state probe");
        self.status.on(StatusBit::InSyncState);
        self.recovery_mgr.sync_rsp_store.clear();
        let mut actions = vec![self.peers.broadcast(
            self.chain.epoch(),
            ConsensusMessage::SyncState(SyncState {
                replica_id: self.chain.self_id,
            }),
        )];
        actions.push(self.start_timer(
            TimerId::SyncStateResponse,
            self.config.sync_state_timeout,
            Event::SyncStateResponseTimer,
        ));
        actions.push(self.start_timer(
            TimerId::SyncStateRestart,
            self.config.sync_state_restart_timeout,
            Event::SyncStateRestartTimer,
        ));
        actions
    }

    /// Leave the sync-state phase and cancel its collection window.
    pub(crate) fn exit_sync_state(&mut self) -> Vec<Action<T>> {
        if !self.status.is(StatusBit::InSyncState) {
            return Vec::new();
        }
        self.status.off(StatusBit::InSyncState);
        vec![self.stop_timer(TimerId::SyncStateResponse)]
    }

    pub(crate) fn on_sync_state_response_timer(&mut self) -> Vec<Action<T>> {
        info!("sync-state response window expired");
        let mut actions = self.exit_sync_state();
        if self.status.is(StatusBit::InRecovery) {
            // The probe never reached quorum; keep trying.
            actions.extend(self.restart_sync_state());
            return actions;
        }
        if !self.is_normal() {
            debug!("abnormal, not recovering after sync-state expiry");
            return actions;
        }
        actions.extend(self.init_recovery());
        actions
    }

    pub(crate) fn on_sync_state_restart_timer(&mut self) -> Vec<Action<T>> {
        debug!("sync-state restart timer expired");
        let mut actions = self.exit_sync_state();
        if !self.is_normal() {
            return actions;
        }
        actions.extend(self.restart_sync_state());
        actions
    }

    /// The checkpoint this replica stands on, for sync-state responses.
    fn current_position(&mut self) -> Result<SignedCheckpoint, String> {
        if let Some(signed) = self.store.latest_local_checkpoint() {
            return Ok(signed.clone());
        }
        // Fresh replica: attest the applied state from configuration.
        let checkpoint = Checkpoint {
            epoch: self.chain.epoch(),
            execute_state: ExecuteState {
                height: self.config.applied,
                digest: self.config.applied_digest,
                batch_digest: Default::default(),
            },
            need_update_epoch: false,
            view_change: None,
        };
        let signature = self
            .crypto
            .sign(checkpoint.hash().as_bytes())
            .map_err(|err| format!("sign checkpoint: {err}"))?;
        Ok(SignedCheckpoint {
            author: self.chain.self_id,
            checkpoint,
            signature,
        })
    }

    pub(crate) fn recv_sync_state(&mut self, req: SyncState) -> Vec<Action<T>> {
        debug!(from = %req.replica_id, "received sync-state probe");
        if !self.peers.contains(req.replica_id) {
            return Vec::new();
        }
        let signed = match self.current_position() {
            Ok(signed) => signed,
            Err(reason) => return vec![self.stop_namespace(&reason)],
        };
        vec![self.peers.unicast(
            self.chain.epoch(),
            ConsensusMessage::SyncStateResponse(SyncStateResponse {
                replica_id: self.chain.self_id,
                view: self.chain.view,
                signed_checkpoint: signed,
            }),
            req.replica_id,
        )]
    }

    pub(crate) fn recv_sync_state_response(&mut self, resp: SyncStateResponse) -> Vec<Action<T>> {
        if !self.status.is(StatusBit::InSyncState) {
            debug!(from = %resp.replica_id, "sync-state response outside probe, ignoring");
            return Vec::new();
        }
        if resp.signed_checkpoint.author != resp.replica_id {
            warn!(from = %resp.replica_id, "sync-state response author mismatch");
            return Vec::new();
        }
        if !self.verify_signed_checkpoint(&resp.signed_checkpoint) {
            warn!(from = %resp.replica_id, "sync-state response signature invalid");
            return Vec::new();
        }
        debug!(
            from = %resp.replica_id,
            view = resp.view,
            height = resp.signed_checkpoint.checkpoint.height(),
            "received sync-state response"
        );
        self.recovery_mgr
            .sync_rsp_store
            .insert(resp.replica_id, resp);
        self.compare_whole_states()
    }

    /// Find a quorum of identical (view, height, digest) responses and
    /// reconcile our position against it.
    fn compare_whole_states(&mut self) -> Vec<Action<T>> {
        let mut groups: HashMap<(View, Height, Hash), Vec<SignedCheckpoint>> = HashMap::new();
        let mut quorum: Option<(View, Height, Hash)> = None;
        for resp in self.recovery_mgr.sync_rsp_store.values() {
            let key = (
                resp.view,
                resp.signed_checkpoint.checkpoint.height(),
                resp.signed_checkpoint.checkpoint.digest(),
            );
            let entry = groups.entry(key).or_default();
            entry.push(resp.signed_checkpoint.clone());
            if entry.len() >= self.chain.common_case_quorum() {
                quorum = Some(key);
                break;
            }
        }
        let Some(key @ (view, height, digest)) = quorum else {
            return Vec::new();
        };
        let matching = groups.remove(&key).unwrap_or_default();
        debug!(view, height, "found quorum sync state");

        // View divergence: fetch the agreed new-view attestation from the
        // quorum view's primary and adopt it.
        if self.chain.view != view {
            info!(
                quorum_view = view,
                view = self.chain.view,
                "view differs from quorum, fetching agreed view"
            );
            let mut actions = self.exit_sync_state();
            actions.extend(self.try_fetch_view_from(view));
            return actions;
        }

        let mut actions = self.exit_sync_state();

        let (self_height, self_digest) = self
            .store
            .latest_local_checkpoint()
            .map(|signed| (signed.checkpoint.height(), signed.checkpoint.digest()))
            .unwrap_or((self.config.applied, self.config.applied_digest));

        if self_height != height {
            info!(
                self_height,
                quorum_height = height,
                "height differs from quorum"
            );
            if height > self_height {
                // Behind: transfer to the quorum target.
                let target = MetaState { height, digest };
                self.update_high_state_target(target, matching, Vec::new());
                actions.extend(self.try_state_transfer());
            } else if self.chain.self_is_primary() {
                // Ahead as the would-be primary: step aside.
                warn!("primary ahead of quorum, sending view change");
                actions.extend(self.send_view_change(false));
            } else {
                // Ahead as a backup: the quorum will catch up; keep the
                // periodic probe running.
                debug!("ahead of quorum, waiting for the cluster");
            }
            return actions;
        }

        if self_digest != digest {
            // Same height, different digest: unrecoverable locally.
            warn!(
                height,
                self_digest = %self_digest,
                quorum = %digest,
                "digest differs from quorum at same height, transferring state"
            );
            let target = MetaState { height, digest };
            self.update_high_state_target(target, matching, Vec::new());
            actions.extend(self.try_state_transfer());
            return actions;
        }

        info!(height, view, "sync state finished, replica consistent with quorum");
        actions.push(Action::SendFilterEvent {
            event: FilterEvent::StableCheckpoint(matching),
        });
        if self.status.is(StatusBit::InRecovery) && !self.status.is(StatusBit::InViewChange) {
            actions.extend(self.finish_recovery());
        }
        actions
    }
}

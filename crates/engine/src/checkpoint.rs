//! Checkpointing, watermark advancement, and state transfer.

use crate::replica::Replica;
use crate::status::StatusBit;
use crate::store::StateUpdateTarget;
use rbft_core::{Action, Event, FilterEvent, TimerId};
use rbft_mempool::RequestPool;
use rbft_messages::{
    Checkpoint, ConsensusMessage, ExecuteState, NewView, QuorumCheckpoint, SignedCheckpoint,
    VcBasis, ViewChange,
};
use rbft_types::{Digest, MetaState, ServiceState, Transaction};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

impl<T: Transaction, P: RequestPool<T>> Replica<T, P> {
    // ═══════════════════════════════════════════════════════════════════════
    // Local checkpoint generation
    // ═══════════════════════════════════════════════════════════════════════

    /// The execution service reached a checkpoint or configuration height.
    pub(crate) fn recv_checkpoint_block_executed(&mut self, state: ServiceState) -> Vec<Action<T>> {
        let height = state.meta_state.height;
        if self.epoch_mgr.config_batch_to_execute == height && height != 0 {
            self.epoch_mgr.config_batch_to_execute = 0;
            if height != self.exec.last_exec() {
                error!(height, last_exec = self.exec.last_exec(), "config checkpoint out of order");
                return Vec::new();
            }
            debug!(height, "generating checkpoint for config batch");
            self.epoch_mgr.config_batch_to_check = Some(state.meta_state);
            self.checkpoint(state, true)
        } else if height % self.chain.checkpoint_period() == 0 {
            if height != self.exec.last_exec() {
                error!(height, last_exec = self.exec.last_exec(), "checkpoint out of order");
                return Vec::new();
            }
            debug!(height, "generating checkpoint");
            self.checkpoint(state, false)
        } else {
            debug!(height, "executed height is not a checkpoint boundary");
            Vec::new()
        }
    }

    fn checkpoint(&mut self, state: ServiceState, is_config: bool) -> Vec<Action<T>> {
        let height = state.meta_state.height;
        let digest = state.meta_state.digest;
        info!(
            view = self.chain.view,
            height,
            digest = %digest,
            is_config,
            "sending checkpoint"
        );

        let signed = match self.generate_signed_checkpoint(&state, is_config) {
            Ok(signed) => signed,
            Err(reason) => return vec![self.stop_namespace(&reason)],
        };

        self.store.save_checkpoint(height, signed.clone());
        let mut actions = self.persist_checkpoint(height, &signed);

        if is_config {
            // Keep fetching until the config checkpoint is known stable.
            actions.push(self.start_timer(
                TimerId::FetchCheckpoint,
                self.config.fetch_checkpoint_timeout,
                Event::FetchCheckpointTimer,
            ));
        } else if self.exec.last_exec() == self.chain.h + self.chain.l {
            warn!("checkpoint equal to high watermark, checkpoint procedure may be stuck");
            actions.extend(
                self.soft_start_high_watermark_timer("checkpoint equal to high watermark"),
            );
        }

        actions.push(self.peers.broadcast(
            self.chain.epoch(),
            ConsensusMessage::SignedCheckpoint(signed.clone()),
        ));
        actions.extend(self.recv_checkpoint(signed, true));
        actions
    }

    fn generate_signed_checkpoint(
        &mut self,
        state: &ServiceState,
        is_config: bool,
    ) -> Result<SignedCheckpoint, String> {
        let mut checkpoint = Checkpoint {
            epoch: self.chain.epoch(),
            execute_state: ExecuteState {
                height: state.meta_state.height,
                digest: state.meta_state.digest,
                batch_digest: state.batch_digest,
            },
            need_update_epoch: is_config,
            view_change: None,
        };
        if is_config {
            info!(next_epoch = checkpoint.epoch + 1, "generated a config checkpoint");
        }

        if self.chain.is_wrf() {
            // WRF rotation carries a recovery view change holding only the
            // C-set, so a restarted replica learns the rotated view.
            let cset: Vec<SignedCheckpoint> = self
                .store
                .local_checkpoints
                .values()
                .map(|signed| {
                    let mut signed = signed.clone();
                    signed.checkpoint.view_change = None;
                    signed
                })
                .collect();
            let basis = VcBasis {
                view: self.chain.view + 1,
                h: self.chain.h,
                replica_id: self.chain.self_id,
                pset: Vec::new(),
                qset: Vec::new(),
                cset,
            };
            let signature = self
                .crypto
                .sign(basis.signing_hash().as_bytes())
                .map_err(|err| format!("sign view change: {err}"))?;
            checkpoint.view_change = Some(Box::new(ViewChange {
                basis,
                signature,
                timestamp: self.now_ns,
                recovery: true,
            }));
        }

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

    pub(crate) fn verify_signed_checkpoint(&self, signed: &SignedCheckpoint) -> bool {
        self.crypto
            .verify(
                signed.author,
                &signed.signature,
                signed.checkpoint.hash().as_bytes(),
            )
            .is_ok()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoint reception and aggregation
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn recv_checkpoint(
        &mut self,
        signed: SignedCheckpoint,
        local: bool,
    ) -> Vec<Action<T>> {
        if signed.checkpoint.epoch < self.chain.epoch() {
            debug!(
                epoch = signed.checkpoint.epoch,
                "checkpoint from an expired epoch, ignoring"
            );
            return Vec::new();
        }
        let height = signed.checkpoint.height();
        let digest = signed.checkpoint.digest();
        debug!(author = %signed.author, height, digest = %digest, "received checkpoint");

        if !local && !self.verify_signed_checkpoint(&signed) {
            error!(author = %signed.author, "checkpoint signature invalid");
            return Vec::new();
        }

        if self.weak_checkpoint_set_out_of_range(&signed) {
            if self.status.is(StatusBit::StateTransferring) {
                debug!("already state transferring");
                return Vec::new();
            }
            debug!("trying state transfer after finding a high target");
            let mut actions = self.init_recovery();
            actions.extend(self.try_state_transfer());
            return actions;
        }

        let (legal, matching, fatal) = self.compare_checkpoint_with_weak_set(signed.clone());
        if let Some(fatal_actions) = fatal {
            return fatal_actions;
        }
        if !legal {
            debug!(author = %signed.author, height, "illegal checkpoint, ignoring");
            return Vec::new();
        }
        debug!(count = matching.len(), height, "matching checkpoints");

        if matching.len() < self.chain.common_case_quorum() {
            return Vec::new();
        }

        if !self.store.local_checkpoints.contains_key(&height) {
            debug!(
                height,
                "checkpoint quorum found before reaching the height ourselves"
            );
            let target = MetaState { height, digest };
            self.update_high_state_target(target, matching, Vec::new());
            return Vec::new();
        }

        if signed.checkpoint.need_update_epoch {
            self.finish_config_checkpoint(height, matching)
        } else {
            self.finish_normal_checkpoint(height, digest, matching)
        }
    }

    /// Track checkpoints beyond the window; F+1 distinct authors above the
    /// window mean this replica has fallen behind.
    fn weak_checkpoint_set_out_of_range(&mut self, signed: &SignedCheckpoint) -> bool {
        let high = self.chain.h + self.chain.l;
        let height = signed.checkpoint.height();

        if height < high {
            self.store.higher_checkpoints.remove(&signed.author);
            return false;
        }
        self.store
            .higher_checkpoints
            .insert(signed.author, signed.clone());
        debug!(author = %signed.author, height, "checkpoint above the watermark window");

        if self.store.higher_checkpoints.len() < self.chain.one_correct_quorum() {
            return false;
        }

        // Group the out-of-range checkpoints by (height, digest) and pick
        // the highest weak cert.
        let mut records: HashMap<MetaState, Vec<SignedCheckpoint>> = HashMap::new();
        let mut highest: Option<MetaState> = None;
        self.store
            .higher_checkpoints
            .retain(|_, cp| cp.checkpoint.height() > high);
        for cp in self.store.higher_checkpoints.values() {
            let meta = MetaState {
                height: cp.checkpoint.height(),
                digest: cp.checkpoint.digest(),
            };
            let entry = records.entry(meta).or_default();
            entry.push(cp.clone());
            if entry.len() >= self.chain.one_correct_quorum()
                && highest.map(|m| meta.height > m.height).unwrap_or(true)
            {
                highest = Some(meta);
            }
        }

        let Some(meta) = highest else {
            return false;
        };
        let set = records.remove(&meta).unwrap_or_default();
        debug!(
            target = meta.height,
            high,
            "f+1 checkpoints above the watermark window"
        );

        if self.exec.last_exec() >= meta.height {
            info!(
                last_exec = self.exec.last_exec(),
                target = meta.height,
                "already executed past the weak cert"
            );
            // Only the watermark is stuck; give the checkpoint procedure a
            // grace period before suspecting the primary.
            return false;
        }

        self.update_high_state_target(meta, set, Vec::new());
        true
    }

    /// Insert the checkpoint and group the store by digest at its height.
    /// Returns (legal, matching set, fatal actions when the cluster is
    /// irreconcilable).
    fn compare_checkpoint_with_weak_set(
        &mut self,
        signed: SignedCheckpoint,
    ) -> (bool, Vec<SignedCheckpoint>, Option<Vec<Action<T>>>) {
        let height = signed.checkpoint.height();
        let hash = signed.checkpoint.hash();

        if !self.chain.in_w(height) {
            if height != self.chain.h && !self.status.is(StatusBit::SkipInProgress) {
                // Perfectly normal after raising the watermark on 2F+1: the
                // remaining F acknowledgements arrive below it.
                warn!(height, h = self.chain.h, "checkpoint below low watermark");
            } else {
                debug!(height, h = self.chain.h, "checkpoint below low watermark");
            }
            return (false, Vec::new(), None);
        }

        if self
            .store
            .checkpoint_store
            .insert((signed.author, height), signed.clone())
            .is_some()
        {
            warn!(author = %signed.author, height, "duplicate checkpoint, updating storage");
        }

        let mut diff_values: HashMap<rbft_types::Hash, Vec<SignedCheckpoint>> = HashMap::new();
        let mut correct_hashes = Vec::new();
        for ((_, seq), cp) in &self.store.checkpoint_store {
            if *seq != height {
                continue;
            }
            let entry = diff_values.entry(cp.checkpoint.hash()).or_default();
            entry.push(cp.clone());
            if entry.len() == self.chain.one_correct_quorum() {
                correct_hashes.push(cp.checkpoint.hash());
            }
        }

        // More than F+1 distinct values at one height: no stable cert can
        // ever form. Halt.
        if diff_values.len() > self.chain.one_correct_quorum() {
            error!(
                height,
                values = diff_values.len(),
                "irreconcilable checkpoints at one height"
            );
            self.status.on(StatusBit::Inconsistent);
            let mut actions = self.set_abnormal();
            actions.push(self.stop_namespace("inconsistent checkpoints"));
            return (false, Vec::new(), Some(actions));
        }

        if correct_hashes.is_empty() {
            debug!(height, "no weak cert for checkpoint yet");
            return (true, Vec::new(), None);
        }

        if correct_hashes.len() > 1 {
            error!(height, "multiple weak certs for one checkpoint height");
            self.status.on(StatusBit::Inconsistent);
            let mut actions = self.set_abnormal();
            actions.push(self.stop_namespace("multiple weak checkpoint certs"));
            return (false, Vec::new(), Some(actions));
        }

        let correct = diff_values.remove(&correct_hashes[0]).unwrap_or_default();
        let correct_digest = correct[0].checkpoint.digest();

        // A local checkpoint disagreeing with the weak cert means this
        // replica's state is corrupted; transfer to the cert.
        if let Some(local) = self.store.local_checkpoints.get(&height) {
            if local.checkpoint.digest() != correct_digest {
                error!(
                    height,
                    local = %local.checkpoint.digest(),
                    agreed = %correct_digest,
                    "local checkpoint disagrees with weak cert"
                );
                let target = MetaState {
                    height,
                    digest: correct_digest,
                };
                self.update_high_state_target(target, correct, Vec::new());
                let actions = self.try_state_transfer();
                return (false, Vec::new(), Some(actions));
            }
        }

        let matching = correct
            .iter()
            .filter(|cp| cp.checkpoint.hash() == hash)
            .cloned()
            .collect();
        (true, matching, None)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stable checkpoints
    // ═══════════════════════════════════════════════════════════════════════

    fn finish_config_checkpoint(
        &mut self,
        height: u64,
        matching: Vec<SignedCheckpoint>,
    ) -> Vec<Action<T>> {
        if !self.status.is(StatusBit::InConfChange) {
            warn!(height, "config checkpoint stable but not in config change");
            return Vec::new();
        }
        let mut actions = vec![self.stop_timer(TimerId::FetchCheckpoint)];
        info!(height, "config checkpoint quorum found");

        actions.extend(self.sync_config_checkpoint(height, &matching));
        self.sync_epoch(&mut actions);

        self.status.off(StatusBit::InConfChange);
        self.maybe_set_normal();
        let finish = format!(
            "replica {} finished config change, epoch={}/n={}/view={}/h={}/last_exec={}",
            self.chain.self_id,
            self.chain.epoch(),
            self.chain.n,
            self.chain.view,
            self.chain.h,
            self.exec.last_exec()
        );
        info!("{finish}");
        actions.push(Action::SendFilterEvent {
            event: FilterEvent::FinishConfigChange(finish),
        });

        // Reconcile the view under the new validator set.
        debug!("initiating recovery after epoch change");
        actions.push(Action::EnqueueInternal {
            event: Box::new(Event::RecoveryInit {
                prev_view: self.chain.view,
            }),
        });
        actions
    }

    fn finish_normal_checkpoint(
        &mut self,
        height: u64,
        digest: rbft_types::Hash,
        matching: Vec<SignedCheckpoint>,
    ) -> Vec<Action<T>> {
        let mut actions = vec![
            self.stop_timer(TimerId::FetchCheckpoint),
            self.stop_high_watermark_timer(),
        ];
        info!(height, digest = %digest, "normal checkpoint quorum found");

        actions.extend(self.move_watermarks(height, false));
        self.chain.last_checkpoint_digest = digest;

        if self.chain.is_wrf() {
            // WRF: every stable checkpoint rotates the proposer.
            let new_view = self.chain.view + 1;
            self.set_view(new_view);
            let mut nv = NewView {
                view: new_view,
                replica_id: self.chain.self_id,
                xset: Default::default(),
                auto_term_update: true,
                signature: Default::default(),
                from_id: Some(self.chain.self_id),
            };
            match self.crypto.sign(nv.signing_hash().as_bytes()) {
                Ok(signature) => {
                    nv.signature = signature;
                    actions.extend(self.persist_new_view(&nv));
                }
                Err(err) => {
                    warn!(error = %err, "signing new-view attestation failed");
                    return actions;
                }
            }
            // A backup becoming primary must adopt the checkpoint sequence.
            self.batch_mgr.set_seq_no(height);
        }

        info!(
            h = self.chain.h,
            view = self.chain.view,
            primary = %self.chain.primary_id,
            "stable checkpoint processed"
        );
        actions.push(self.null_request_timer_reset());
        if self.chain.self_is_primary() {
            actions.push(self.restart_batch_timer());
            if !self.pool.has_pending_requests()
                && self.chain.epoch_info.consensus_params.enable_timed_gen_empty_block
            {
                actions.push(self.start_no_tx_batch_timer());
            }
        }
        actions.push(Action::SendFilterEvent {
            event: FilterEvent::StableCheckpoint(matching),
        });

        // The primary may have batches blocked on the high watermark.
        if self.is_normal() && self.chain.self_is_primary() {
            actions.extend(self.primary_resubmit_transactions());
        }
        actions
    }

    /// Persist the quorum proof of a config checkpoint and emit the stable
    /// checkpoint filter event.
    pub(crate) fn sync_config_checkpoint(
        &mut self,
        height: u64,
        matching: &[SignedCheckpoint],
    ) -> Vec<Action<T>> {
        let mut actions = vec![Action::SendFilterEvent {
            event: FilterEvent::StableCheckpoint(matching.to_vec()),
        }];
        self.epoch_mgr.config_batch_to_check = None;
        if let Some(first) = matching.first() {
            let quorum = QuorumCheckpoint {
                checkpoint: first.checkpoint.clone(),
                signatures: matching
                    .iter()
                    .map(|cp| (cp.author, cp.signature.clone()))
                    .collect(),
            };
            actions.extend(self.persist_epoch_quorum_checkpoint(&quorum));
            info!(height, epoch = first.checkpoint.epoch, "persisted stable config checkpoint");
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Watermarks
    // ═══════════════════════════════════════════════════════════════════════

    /// Advance the low watermark to `n`, garbage-collecting everything at or
    /// below it.
    pub(crate) fn move_watermarks(&mut self, n: u64, new_epoch: bool) -> Vec<Action<T>> {
        if self.chain.h > n {
            error!(h = self.chain.h, n, "refusing to move watermark backwards");
            return Vec::new();
        }
        let h = n;
        let mut actions = Vec::new();

        let stale: Vec<_> = self
            .store
            .cert_store
            .keys()
            .filter(|id| id.n <= h)
            .copied()
            .collect();
        for id in stale {
            debug!(%id, "cleaning certificate below watermark");
            self.store.cert_store.remove(&id);
            self.store.outstanding_req_batches.remove(&id.d);
            self.store.committed_cert.remove(&id);
            self.store.seq_map.remove(&id.n);
            actions.extend(self.persist_del_qpc_set(&id));
        }

        // Retain the previous full checkpoint window of batches so lagging
        // replicas can still fetch their transactions.
        let period = self.chain.checkpoint_period();
        let pos = n / period * period;
        let target = pos.saturating_sub(period);
        let drop: Vec<Digest> = self
            .store
            .batch_store
            .iter()
            .filter(|(_, batch)| batch.seq_no <= target)
            .map(|(digest, _)| *digest)
            .collect();
        for digest in &drop {
            self.store.batch_store.remove(digest);
            actions.extend(self.persist_del_batch(digest));
        }
        self.pool.remove_batches(&drop);

        self.store.checkpoint_store.retain(|(_, seq), _| *seq > h);

        let old_checkpoints: Vec<u64> = self
            .store
            .local_checkpoints
            .keys()
            .filter(|seq| **seq < h)
            .copied()
            .collect();
        for seq in old_checkpoints {
            self.store.local_checkpoints.remove(&seq);
            actions.extend(self.persist_del_checkpoint(seq));
        }
        if new_epoch {
            // Re-sign retained checkpoints under the new epoch's key.
            let seqs: Vec<u64> = self.store.local_checkpoints.keys().copied().collect();
            for seq in seqs {
                let Some(signed) = self.store.local_checkpoints.get(&seq).cloned() else {
                    continue;
                };
                match self.crypto.sign(signed.checkpoint.hash().as_bytes()) {
                    Ok(signature) => {
                        let mut signed = signed;
                        signed.signature = signature;
                        self.store.local_checkpoints.insert(seq, signed);
                    }
                    Err(err) => {
                        return vec![self.stop_namespace(&format!("re-sign checkpoint: {err}"))];
                    }
                }
            }
        }

        self.vc_mgr.qlist.retain(|(seq, _), _| *seq > h);
        self.vc_mgr.plist.retain(|seq, _| *seq > h);
        self.store
            .missing_batches_in_fetching
            .retain(|_, id| id.n > h);
        self.store.clean_committed_cert_cache(h);

        self.chain.h = h;
        actions.extend(self.persist_h(h));
        info!(h, "low watermark updated");
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // State transfer
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn update_high_state_target(
        &mut self,
        target: MetaState,
        checkpoint_set: Vec<SignedCheckpoint>,
        epoch_changes: Vec<QuorumCheckpoint>,
    ) {
        if let Some(current) = &self.store.high_state_target {
            if current.meta_state.height >= target.height {
                info!(
                    target = target.height,
                    current = current.meta_state.height,
                    "not lowering state target"
                );
                return;
            }
        }
        info!(height = target.height, digest = %target.digest, "updating state target");
        self.store.high_state_target = Some(StateUpdateTarget {
            meta_state: target,
            checkpoint_set,
            epoch_changes,
        });
    }

    /// Enter state transfer toward the high target, if one is known.
    pub(crate) fn try_state_transfer(&mut self) -> Vec<Action<T>> {
        let mut actions = Vec::new();
        if !self.status.is(StatusBit::SkipInProgress) {
            debug!("out of sync, pending state transfer");
            self.status.on(StatusBit::SkipInProgress);
        }
        actions.extend(self.set_abnormal());

        if self.status.is(StatusBit::StateTransferring) {
            debug!("state transfer already in progress");
            return actions;
        }
        let Some(target) = self.store.high_state_target.clone() else {
            debug!("no state target yet, delaying transfer");
            return actions;
        };

        actions.push(self.stop_timer(TimerId::FetchCheckpoint));
        self.epoch_mgr.config_batch_to_check = None;
        self.status.off(StatusBit::InConfChange);
        actions.push(self.stop_high_watermark_timer());
        self.status.on(StatusBit::StateTransferring);

        // Certs at or below the target would only confuse the resumed log.
        let stale: Vec<_> = self
            .store
            .cert_store
            .keys()
            .filter(|id| id.n <= target.meta_state.height)
            .copied()
            .collect();
        for id in stale {
            self.store.cert_store.remove(&id);
            self.store.outstanding_req_batches.remove(&id.d);
            self.store.committed_cert.remove(&id);
            self.store.seq_map.remove(&id.n);
            actions.extend(self.persist_del_qpc_set(&id));
        }

        info!(height = target.meta_state.height, "starting state transfer");
        actions.push(Action::StateUpdate {
            target: target.meta_state,
            checkpoint_set: target.checkpoint_set,
            epoch_changes: target.epoch_changes,
        });
        actions
    }

    /// The execution service finished a state transfer.
    pub(crate) fn recv_state_updated(&mut self, state: ServiceState) -> Vec<Action<T>> {
        let seq_no = state.meta_state.height;
        let digest = state.meta_state.digest;
        let mut actions = Vec::new();

        let target_height = self
            .store
            .high_state_target
            .as_ref()
            .map(|target| target.meta_state.height);
        match target_height {
            None => {
                warn!("state updated without a state target");
            }
            Some(target) if seq_no < target => {
                warn!(
                    recovered = seq_no,
                    target,
                    "target moved during transfer, transferring again"
                );
                self.status.off(StatusBit::StateTransferring);
                self.exec.set_last_exec(seq_no);
                return self.try_state_transfer();
            }
            Some(target) if seq_no > target => {
                error!(
                    recovered = seq_no,
                    target,
                    "recovered beyond the state target"
                );
                return vec![self.stop_namespace("state update overshot target")];
            }
            Some(_) => {}
        }

        debug!(last_exec = self.exec.last_exec(), seq_no, "state transfer finished");

        // Keep batches above the target; everything else restarts from the
        // pool.
        let save: Vec<Digest> = self
            .store
            .batch_store
            .iter()
            .filter(|(_, batch)| batch.seq_no > seq_no)
            .map(|(digest, _)| *digest)
            .collect();
        self.pool.reset(&save);

        // A rewind may have dropped executed blocks; replay local certs.
        if seq_no < self.exec.last_exec() {
            debug!("resetting commit state after a rewind");
            self.store.committed_cert.clear();
            let ids: Vec<_> = self
                .store
                .cert_store
                .keys()
                .filter(|id| id.n > seq_no)
                .copied()
                .collect();
            for id in ids {
                if let Some(cert) = self.store.cert_store.get_mut(&id) {
                    cert.sent_execute = false;
                }
                if id.v == self.chain.view && self.committed(&id) {
                    let sent_commit = self
                        .store
                        .cert_store
                        .get(&id)
                        .map(|cert| cert.sent_commit)
                        .unwrap_or(false);
                    if sent_commit {
                        self.store.committed_cert.insert(id, id.d);
                    }
                }
            }
        }

        let finish = format!(
            "replica {} finished state update, height: {}",
            self.chain.self_id, seq_no
        );
        info!("{finish}");
        actions.push(Action::SendFilterEvent {
            event: FilterEvent::FinishStateUpdate(finish),
        });
        self.exec.set_last_exec(seq_no);
        self.batch_mgr.set_seq_no(seq_no);
        self.store.missing_batches_in_fetching.clear();
        self.status.off(StatusBit::SkipInProgress);
        self.status.off(StatusBit::StateTransferring);
        self.maybe_set_normal();

        let epoch_changed = state.epoch != 0 && state.epoch != self.chain.epoch();
        if epoch_changed {
            info!(from = self.chain.epoch(), to = state.epoch, "epoch changed by state transfer");
            self.turn_into_epoch(&mut actions);
            self.status.off(StatusBit::InEpochSyncing);
        }

        // Re-establish a local checkpoint at the recovered height using the
        // quorum's checkpoint, which may predate the new epoch's key.
        if epoch_changed || seq_no % self.chain.checkpoint_period() == 0 {
            let Some(target) = self.store.high_state_target.clone() else {
                return actions;
            };
            let Some(first) = target.checkpoint_set.first() else {
                warn!("empty checkpoint set on state target");
                actions.push(self.stop_namespace("empty checkpoint set after state update"));
                return actions;
            };
            match self.crypto.sign(first.checkpoint.hash().as_bytes()) {
                Ok(signature) => {
                    let signed = SignedCheckpoint {
                        author: self.chain.self_id,
                        checkpoint: first.checkpoint.clone(),
                        signature,
                    };
                    self.store.save_checkpoint(seq_no, signed.clone());
                    self.chain.last_checkpoint_digest = digest;
                    actions.extend(self.persist_checkpoint(seq_no, &signed));
                    actions.extend(self.move_watermarks(seq_no, epoch_changed));
                }
                Err(err) => {
                    actions.push(self.stop_namespace(&format!("sign checkpoint: {err}")));
                    return actions;
                }
            }
        }

        if epoch_changed {
            debug!("recovering view after epoch change");
            actions.push(Action::EnqueueInternal {
                event: Box::new(Event::RecoveryInit {
                    prev_view: self.chain.view,
                }),
            });
            return actions;
        }

        if self.status.is(StatusBit::InViewChange) {
            if self.chain.self_is_primary() {
                // View may not have changed; step into a fresh one.
                debug!("primary sends view change after state update");
                actions.extend(self.send_view_change(false));
                return actions;
            }
            if let Some(nv) = self.vc_mgr.new_view_store.get(&self.chain.view).cloned() {
                actions.extend(self.persist_new_view(&nv));
                info!(view = self.chain.view, "view persisted after state update");
                actions.push(Action::EnqueueInternal {
                    event: Box::new(Event::ViewChangeDone),
                });
                return actions;
            }
            debug!("no new view after state update, recovering");
            actions.push(Action::EnqueueInternal {
                event: Box::new(Event::RecoveryInit {
                    prev_view: self.chain.view,
                }),
            });
            return actions;
        }

        // Catch up any entries missed while lagging.
        if self.status.is(StatusBit::InRecovery) {
            actions.extend(self.finish_recovery());
        } else {
            actions.extend(self.fetch_recovery_pqc());
        }
        actions
    }

    /// Compare an initial checkpoint (from a new view) against local state;
    /// returns true when a state transfer was started.
    pub(crate) fn check_if_need_state_update(
        &mut self,
        initial: MetaState,
        checkpoint_set: Vec<SignedCheckpoint>,
        is_config: bool,
        actions: &mut Vec<Action<T>>,
    ) -> bool {
        if self.chain.h < initial.height {
            if let Some(local) = self.store.local_checkpoints.get(&initial.height).cloned() {
                if local.checkpoint.digest() == initial.digest {
                    // Reached the height locally but never saw the quorum.
                    if is_config {
                        info!(height = initial.height, "config checkpoint found during view change");
                        self.status.on(StatusBit::InConfChange);
                        actions.extend(self.sync_config_checkpoint(initial.height, &checkpoint_set));
                        self.status.off(StatusBit::InConfChange);
                    } else {
                        debug!(height = initial.height, "catching watermark to checkpoint");
                        actions.extend(self.move_watermarks(initial.height, false));
                    }
                    return false;
                }
                warn!(
                    height = initial.height,
                    local = %local.checkpoint.digest(),
                    quorum = %initial.digest,
                    "mismatched checkpoint, syncing chain"
                );
                self.update_high_state_target(initial, checkpoint_set, Vec::new());
                actions.extend(self.try_state_transfer());
                return true;
            }
        }

        if self.exec.last_exec() < initial.height {
            warn!(
                height = initial.height,
                last_exec = self.exec.last_exec(),
                "missing base checkpoint, transferring"
            );
            self.update_high_state_target(initial, checkpoint_set, Vec::new());
            actions.extend(self.try_state_transfer());
            return true;
        }
        false
    }
}

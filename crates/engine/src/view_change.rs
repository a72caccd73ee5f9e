//! View change and new-view construction.

use crate::replica::Replica;
use crate::status::StatusBit;
use borsh::BorshDeserialize;
use rbft_core::{Action, Event, TimerId};
use rbft_mempool::RequestPool;
use rbft_messages::{
    ConsensusMessage, FetchBatchRequest, FetchBatchResponse, FetchView, HashBatch, NewView,
    PrePrepare, QuorumViewChange, RecoveryResponse, SignedCheckpoint, VcBasis, VcPq, ViewChange,
    WireBatch, Xset,
};
use rbft_types::{
    Digest, Height, MetaState, MsgId, ReplicaId, RequestBatch, SeqNo, Transaction, View,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// View-change bookkeeping: collected view changes, new views, and the P/Q
/// lists carried across views.
#[derive(Debug)]
pub struct VcManager {
    /// View changes keyed by (target view, sender); one entry per sender
    /// per view.
    pub view_change_store: HashMap<(View, ReplicaId), ViewChange>,
    /// New-view messages by view.
    pub new_view_store: HashMap<View, NewView>,
    /// Pre-prepared entries carried into the next view change, keyed by
    /// (sequence, digest).
    pub qlist: HashMap<(SeqNo, Digest), VcPq>,
    /// Prepared entries carried into the next view change, keyed by
    /// sequence.
    pub plist: HashMap<SeqNo, VcPq>,
    /// New-view wait bound, doubled on every failed view change.
    pub last_new_view_timeout: Duration,
    /// Why the new-view timer is armed, for the expiry log.
    pub new_view_timer_reason: String,
    /// Sequence at which the view is rotated cyclically.
    pub view_change_seq_no: SeqNo,
}

impl VcManager {
    pub(crate) fn new(new_view_timeout: Duration) -> VcManager {
        VcManager {
            view_change_store: HashMap::new(),
            new_view_store: HashMap::new(),
            qlist: HashMap::new(),
            plist: HashMap::new(),
            last_new_view_timeout: new_view_timeout,
            new_view_timer_reason: String::new(),
            view_change_seq_no: 0,
        }
    }

    /// Set the cyclical rotation cap roughly one log ahead of execution.
    pub(crate) fn update_view_change_seq_no(&mut self, last_exec: SeqNo, k: u64, multiplier: u64) {
        if k == 0 {
            return;
        }
        self.view_change_seq_no = (last_exec / k + multiplier) * k;
    }
}

/// The agreed starting point of a new view.
struct XsetResult {
    initial: MetaState,
    checkpoint_set: Vec<SignedCheckpoint>,
    is_config: bool,
    xset: Xset,
}

impl<T: Transaction, P: RequestPool<T>> Replica<T, P> {
    pub(crate) fn set_view(&mut self, view: View) {
        self.chain.set_view(view);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending a view change
    // ═══════════════════════════════════════════════════════════════════════

    /// Move to the next view and broadcast a view change for it.
    pub(crate) fn send_view_change(&mut self, recovery: bool) -> Vec<Action<T>> {
        let target = self.chain.view + 1;
        self.send_view_change_to(target, recovery)
    }

    pub(crate) fn send_view_change_to(&mut self, target: View, recovery: bool) -> Vec<Action<T>> {
        if self.status.is(StatusBit::Pending) {
            return Vec::new();
        }
        info!(
            from = self.chain.view,
            to = target,
            recovery,
            "sending view change"
        );
        self.set_view(target);
        self.status.on(StatusBit::InViewChange);
        if recovery {
            self.status.on(StatusBit::InRecovery);
        }
        let mut actions = self.set_abnormal();
        actions.push(self.stop_timer(TimerId::NullRequest));
        actions.push(self.stop_batch_timer());
        actions.push(self.stop_no_tx_batch_timer());

        let basis = self.get_vc_basis(&mut actions);
        let signature = match self.crypto.sign(basis.signing_hash().as_bytes()) {
            Ok(signature) => signature,
            Err(err) => {
                actions.push(self.stop_namespace(&format!("sign view change: {err}")));
                return actions;
            }
        };
        let vc = ViewChange {
            basis,
            signature,
            timestamp: self.now_ns,
            recovery,
        };
        self.vc_mgr
            .view_change_store
            .insert((target, self.chain.self_id), vc.clone());

        actions.push(self.peers.broadcast(
            self.chain.epoch(),
            ConsensusMessage::ViewChange(vc),
        ));

        actions.push(self.start_timer(
            TimerId::VcResend,
            self.config.vc_resend_timeout,
            Event::VcResendTimer,
        ));
        actions.push(self.start_timer(
            TimerId::CleanVc,
            self.config.clean_vc_timeout,
            Event::CleanVcTimer,
        ));
        let timeout = self.vc_mgr.last_new_view_timeout;
        self.vc_mgr.last_new_view_timeout = timeout * 2;
        actions.push(self.restart_new_view_timer(
            timeout,
            format!("waiting for new view {target}"),
            Some(target),
        ));

        // Buffered view changes may already complete the quorum.
        actions.extend(self.check_view_change_quorum());
        actions
    }

    /// Build the signed basis: current P/Q lists plus local checkpoints.
    /// Certs from lower views are pruned into the committed-cert cache.
    fn get_vc_basis(&mut self, actions: &mut Vec<Action<T>>) -> VcBasis {
        actions.extend(self.persist_del_qp_list());

        self.vc_mgr.plist = self.calc_pset();
        self.vc_mgr.qlist = self.calc_qset();
        actions.extend(self.persist_qp_list());

        let stale: Vec<MsgId> = self
            .store
            .cert_store
            .keys()
            .filter(|id| id.v < self.chain.view)
            .copied()
            .collect();
        for id in stale {
            debug!(%id, "pruning cert from a lower view");
            if let Some(cert) = self.store.cert_store.remove(&id) {
                self.store.committed_cert_cache.insert(id, cert);
            }
            self.store.seq_map.remove(&id.n);
            actions.extend(self.persist_del_qpc_set(&id));
        }
        self.store.clean_committed_cert_cache(self.chain.h);

        let h = self.chain.h;
        let mut cset: Vec<SignedCheckpoint> = Vec::new();
        for (seq, signed) in &self.store.local_checkpoints {
            if *seq >= h {
                cset.push(signed.clone());
            }
        }
        let mut pset: Vec<VcPq> = self
            .vc_mgr
            .plist
            .values()
            .filter(|p| p.seq_no >= h)
            .copied()
            .collect();
        pset.sort_by_key(|p| p.seq_no);
        let mut qset: Vec<VcPq> = self
            .vc_mgr
            .qlist
            .values()
            .filter(|q| q.seq_no >= h)
            .copied()
            .collect();
        qset.sort_by_key(|q| (q.seq_no, q.batch_digest));

        VcBasis {
            view: self.chain.view,
            h,
            replica_id: self.chain.self_id,
            pset,
            qset,
            cset,
        }
    }

    /// Prepared entries: previous plist plus prepared certs, keeping the
    /// highest view per sequence.
    fn calc_pset(&self) -> HashMap<SeqNo, VcPq> {
        let mut pset = self.vc_mgr.plist.clone();
        for id in self.store.cert_store.keys() {
            if !self.prepared(id) {
                continue;
            }
            match pset.get(&id.n) {
                Some(p) if p.view > id.v => continue,
                _ => {}
            }
            pset.insert(
                id.n,
                VcPq {
                    seq_no: id.n,
                    batch_digest: id.d,
                    view: id.v,
                },
            );
        }
        pset
    }

    /// Pre-prepared entries: previous qlist plus pre-prepared certs, keeping
    /// the highest view per (digest, sequence).
    fn calc_qset(&self) -> HashMap<(SeqNo, Digest), VcPq> {
        let mut qset = self.vc_mgr.qlist.clone();
        for id in self.store.cert_store.keys() {
            if !self.pre_prepared(id) {
                continue;
            }
            let key = (id.n, id.d);
            match qset.get(&key) {
                Some(q) if q.view > id.v => continue,
                _ => {}
            }
            qset.insert(
                key,
                VcPq {
                    seq_no: id.n,
                    batch_digest: id.d,
                    view: id.v,
                },
            );
        }
        qset
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receiving view changes
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn recv_view_change(&mut self, mut vc: ViewChange, from: ReplicaId) -> Vec<Action<T>> {
        if vc.basis.replica_id != from {
            warn!(from = %from, claimed = %vc.basis.replica_id, "view change sender mismatch");
            return Vec::new();
        }
        debug!(
            from = %from,
            view = vc.basis.view,
            h = vc.basis.h,
            "received view change"
        );
        if self
            .crypto
            .verify(from, &vc.signature, vc.basis.signing_hash().as_bytes())
            .is_err()
        {
            warn!(from = %from, "view change signature invalid");
            return Vec::new();
        }
        if vc.basis.view < self.chain.view {
            debug!(view = vc.basis.view, current = self.chain.view, "stale view change");
            return Vec::new();
        }

        vc.timestamp = self.now_ns;
        self.vc_mgr
            .view_change_store
            .insert((vc.basis.view, from), vc);

        // F+1 distinct replicas asking for views above the current one mean
        // the cluster is moving on without us: join at the smallest.
        let mut senders: HashMap<ReplicaId, View> = HashMap::new();
        for (v, sender) in self.vc_mgr.view_change_store.keys() {
            if *v > self.chain.view {
                let entry = senders.entry(*sender).or_insert(*v);
                *entry = (*entry).min(*v);
            }
        }
        if senders.len() >= self.chain.one_correct_quorum() {
            let target = senders.values().copied().min().unwrap_or(self.chain.view + 1);
            info!(target, "f+1 view changes above current view, joining");
            return self.send_view_change_to(target, false);
        }

        self.check_view_change_quorum()
    }

    /// Emit the quorum follow-up once enough view changes arrived for the
    /// current target view.
    fn check_view_change_quorum(&mut self) -> Vec<Action<T>> {
        if !self.status.is(StatusBit::InViewChange) {
            return Vec::new();
        }
        let count = self
            .vc_mgr
            .view_change_store
            .keys()
            .filter(|(v, _)| *v == self.chain.view)
            .count();
        if count >= self.chain.common_case_quorum() {
            debug!(view = self.chain.view, count, "view change quorum reached");
            return vec![Action::EnqueueInternal {
                event: Box::new(Event::ViewChangeQuorum),
            }];
        }
        Vec::new()
    }

    pub(crate) fn on_view_change_quorum(&mut self) -> Vec<Action<T>> {
        if !self.status.is(StatusBit::InViewChange) {
            debug!("quorum event outside view change, ignoring");
            return Vec::new();
        }
        if self.chain.self_is_primary() {
            if self.status.is(StatusBit::SkipInProgress) {
                // A catching-up primary must not announce the view; peers
                // will time out and rotate past it.
                info!("primary is catching up, not sending new view");
                return Vec::new();
            }
            info!(view = self.chain.view, "view change quorum, sending new view");
            self.send_new_view()
        } else {
            info!(view = self.chain.view, "view change quorum, checking new view");
            self.check_new_view()
        }
    }

    pub(crate) fn recv_quorum_view_change(&mut self, qvc: QuorumViewChange) -> Vec<Action<T>> {
        debug!(
            from = %qvc.replica_id,
            view = qvc.view,
            count = qvc.view_changes.len(),
            "received quorum view change set"
        );
        let mut actions = Vec::new();
        for vc in qvc.view_changes {
            let from = vc.basis.replica_id;
            actions.extend(self.recv_view_change(vc, from));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // New view
    // ═══════════════════════════════════════════════════════════════════════

    fn send_new_view(&mut self) -> Vec<Action<T>> {
        let view = self.chain.view;
        if self.vc_mgr.new_view_store.contains_key(&view) {
            debug!(view, "new view already sent");
            return Vec::new();
        }
        let Some(result) = self.assemble_xset(view) else {
            debug!(view, "cannot assemble x-set yet, waiting for more view changes");
            return Vec::new();
        };

        let mut nv = NewView {
            view,
            replica_id: self.chain.self_id,
            xset: result.xset.clone(),
            auto_term_update: false,
            signature: Default::default(),
            from_id: None,
        };
        match self.crypto.sign(nv.signing_hash().as_bytes()) {
            Ok(signature) => nv.signature = signature,
            Err(err) => {
                return vec![self.stop_namespace(&format!("sign new view: {err}"))];
            }
        }
        self.vc_mgr.new_view_store.insert(view, nv.clone());

        // Ship the backing view-change set first so lagging replicas can
        // validate the x-set.
        let vcs: Vec<ViewChange> = self
            .vc_mgr
            .view_change_store
            .iter()
            .filter(|((v, _), _)| *v == view)
            .map(|(_, vc)| vc.clone())
            .collect();
        let mut actions = vec![
            self.peers.broadcast(
                self.chain.epoch(),
                ConsensusMessage::QuorumViewChange(QuorumViewChange {
                    replica_id: self.chain.self_id,
                    view,
                    view_changes: vcs,
                }),
            ),
            self.peers
                .broadcast(self.chain.epoch(), ConsensusMessage::NewView(nv)),
        ];
        actions.extend(self.check_new_view());
        actions
    }

    pub(crate) fn recv_new_view(&mut self, nv: NewView) -> Vec<Action<T>> {
        debug!(from = %nv.replica_id, view = nv.view, "received new view");

        if nv.view < self.chain.view {
            debug!(view = nv.view, "stale new view");
            return Vec::new();
        }
        let expected_primary = self.chain.elect_primary(nv.view);
        if !nv.auto_term_update && nv.replica_id != expected_primary {
            warn!(
                from = %nv.replica_id,
                expected = %expected_primary,
                "new view from a replica that is not the view's primary"
            );
            return Vec::new();
        }
        if self
            .crypto
            .verify(nv.signer(), &nv.signature, nv.signing_hash().as_bytes())
            .is_err()
        {
            warn!(from = %nv.replica_id, "new view signature invalid");
            return Vec::new();
        }

        self.vc_mgr.new_view_store.insert(nv.view, nv.clone());

        if !self.status.is(StatusBit::InViewChange) {
            // A recovering (or restarted) replica adopts a view the cluster
            // already agreed on, provided the view's primary signed it.
            let in_recovery = self.status.is(StatusBit::InRecovery);
            let ahead = nv.view > self.chain.view || (in_recovery && nv.view == self.chain.view);
            if ahead && !nv.auto_term_update {
                info!(view = nv.view, "adopting agreed view");
                self.set_view(nv.view);
                let mut actions = self.persist_new_view(&nv);
                actions.push(self.stop_timer(TimerId::FetchView));
                if in_recovery {
                    actions.extend(self.finish_recovery());
                }
                return actions;
            }
            return Vec::new();
        }
        if nv.view != self.chain.view {
            debug!(view = nv.view, current = self.chain.view, "new view for another target");
            return Vec::new();
        }
        self.check_new_view()
    }

    /// Validate the stored new view against the locally recomputed X-set,
    /// then fetch whatever batches it names that are unknown here.
    fn check_new_view(&mut self) -> Vec<Action<T>> {
        if !self.status.is(StatusBit::InViewChange) {
            debug!("not in view change, skipping new-view check");
            return Vec::new();
        }
        let view = self.chain.view;
        let Some(nv) = self.vc_mgr.new_view_store.get(&view).cloned() else {
            debug!(view, "no new view stored yet");
            return Vec::new();
        };
        let Some(result) = self.assemble_xset(view) else {
            debug!(view, "x-set not computable yet, waiting for view changes");
            return Vec::new();
        };
        if result.xset != nv.xset {
            warn!(view, "x-set mismatch against new view, recovering");
            return self.init_recovery();
        }

        let mut actions = Vec::new();
        if self.check_if_need_state_update(
            result.initial,
            result.checkpoint_set.clone(),
            result.is_config,
            &mut actions,
        ) {
            debug!("state transfer started during new-view check");
            return actions;
        }

        actions.extend(self.feed_missing_req_batches(&result.xset));
        if !self.store.missing_req_batches.is_empty() {
            debug!(
                missing = self.store.missing_req_batches.len(),
                "waiting for fetched batches before installing the view"
            );
            return actions;
        }
        actions.extend(self.process_new_view(&result.xset));
        actions
    }

    /// Install the new view: restore the pool, synthesize pre-prepares for
    /// the X-set, and resume from the prepare phase.
    fn process_new_view(&mut self, xset: &Xset) -> Vec<Action<T>> {
        let view = self.chain.view;
        let mut actions = Vec::new();
        info!(view, entries = xset.len(), "installing new view");

        self.store.clean_outstanding_and_committed();
        self.put_back_request_batches(xset, &mut actions);

        let primary = self.chain.primary_id;
        let mut max_n = self.chain.h;
        for (&n, &d) in xset {
            if n <= self.chain.h || n <= self.exec.last_exec() {
                continue;
            }
            max_n = max_n.max(n);

            let hash_batch = if d.is_empty() {
                HashBatch {
                    request_hashes: Vec::new(),
                    deduplicate_request_hashes: Vec::new(),
                    timestamp: 0,
                }
            } else {
                let Some(batch) = self.store.batch_store.get(&d) else {
                    warn!(digest = %d, "x-set batch vanished from the store");
                    continue;
                };
                HashBatch {
                    request_hashes: batch.request_hashes.clone(),
                    deduplicate_request_hashes: Vec::new(),
                    timestamp: batch.timestamp,
                }
            };
            let pp = PrePrepare {
                view,
                seq_no: n,
                batch_digest: d,
                hash_batch,
                replica_id: primary,
            };
            let id = MsgId::new(view, n, d);
            let is_config = self.epoch_service.is_config_block(n);
            let cert = self.store.get_cert(id);
            cert.pre_prepare = Some(pp.clone());
            cert.is_config = is_config;
            self.store.seq_map.insert(n, d);
            if !d.is_empty() {
                if let Some(batch) = self.store.batch_store.get(&d).cloned() {
                    self.store.outstanding_req_batches.insert(d, batch);
                }
            }
            actions.extend(self.persist_qset(&pp));
        }
        self.batch_mgr.set_seq_no(max_n.max(self.chain.h));

        if let Some(nv) = self.vc_mgr.new_view_store.get(&view).cloned() {
            actions.extend(self.persist_new_view(&nv));
        }

        // Backups resume from the prepare phase; the new primary's
        // pre-prepares stand as its own phase-one messages.
        if !self.chain.self_is_primary() {
            let ids: Vec<MsgId> = xset
                .iter()
                .filter(|(n, _)| **n > self.chain.h && **n > self.exec.last_exec())
                .map(|(n, d)| MsgId::new(view, *n, *d))
                .collect();
            for id in ids {
                actions.extend(self.find_next_prepare_batch(id));
            }
        }

        actions.push(Action::EnqueueInternal {
            event: Box::new(Event::ViewChangeDone),
        });
        actions
    }

    /// Finish the view change: clear stale state, report, and resume.
    pub(crate) fn on_view_change_done(&mut self) -> Vec<Action<T>> {
        let view = self.chain.view;
        self.vc_mgr.update_view_change_seq_no(
            self.exec.last_exec(),
            self.chain.checkpoint_period(),
            self.chain.epoch_info.consensus_params.high_watermark_multiplier,
        );
        self.vc_mgr.new_view_store.remove(&view);
        self.store.missing_batches_in_fetching.clear();
        self.store.missing_req_batches.clear();

        let mut actions = vec![
            self.stop_new_view_timer(),
            self.stop_timer(TimerId::FetchView),
            self.stop_timer(TimerId::VcResend),
            self.stop_timer(TimerId::CleanVc),
        ];
        actions.extend(self.start_timer_if_outstanding_requests());

        self.status.off(StatusBit::InViewChange);
        let finish = if self.status.is(StatusBit::InRecovery) {
            self.status.off(StatusBit::InRecovery);
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
            rbft_core::FilterEvent::FinishRecovery(msg)
        } else {
            let msg = format!(
                "replica {} finished view change, primary={}, epoch={}/n={}/view={}/h={}/last_exec={}",
                self.chain.self_id,
                self.chain.primary_id,
                self.chain.epoch(),
                self.chain.n,
                self.chain.view,
                self.chain.h,
                self.exec.last_exec()
            );
            info!("{msg}");
            rbft_core::FilterEvent::FinishViewChange(msg)
        };
        actions.push(Action::SendFilterEvent { event: finish });
        self.maybe_set_normal();

        self.vc_mgr
            .view_change_store
            .retain(|(v, _), _| *v > view);
        self.vc_mgr.new_view_store.retain(|v, _| *v >= view);

        // The ledger may have crossed an epoch while we converged.
        let mut epoch_actions = Vec::new();
        if self.sync_epoch(&mut epoch_actions) {
            actions.extend(epoch_actions);
            debug!("epoch changed during view change, recovering again");
            actions.push(Action::EnqueueInternal {
                event: Box::new(Event::RecoveryInit {
                    prev_view: self.chain.view,
                }),
            });
            return actions;
        }

        if self.chain.self_is_primary() {
            actions.extend(self.primary_resubmit_transactions());
            if self.chain.epoch_info.consensus_params.enable_timed_gen_empty_block
                && !self.pool.has_pending_requests()
                && !self.batch_mgr.no_tx_batch_timer_active
            {
                actions.push(self.start_no_tx_batch_timer());
            }
        } else {
            actions.extend(self.fetch_recovery_pqc());
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // X-set computation
    // ═══════════════════════════════════════════════════════════════════════

    /// Compute the agreed starting checkpoint and the batches surviving
    /// into `view` from the collected view-change set. `None` when the set
    /// is not yet decisive.
    fn assemble_xset(&self, view: View) -> Option<XsetResult> {
        let bases: Vec<&VcBasis> = self
            .vc_mgr
            .view_change_store
            .iter()
            .filter(|((v, _), _)| *v == view)
            .map(|(_, vc)| &vc.basis)
            .collect();
        if bases.len() < self.chain.common_case_quorum() {
            return None;
        }

        // Initial checkpoint: the highest height within 2F+1 logs that F+1
        // replicas attest with the same digest. Height zero (genesis) needs
        // no attestation.
        let mut candidate_heights: Vec<Height> = bases
            .iter()
            .flat_map(|b| b.cset.iter().map(|c| c.checkpoint.height()))
            .collect();
        candidate_heights.push(0);
        candidate_heights.sort_unstable();
        candidate_heights.dedup();

        let mut initial: Option<(MetaState, Vec<SignedCheckpoint>, bool)> = None;
        for &height in candidate_heights.iter().rev() {
            let within = bases.iter().filter(|b| b.h <= height).count();
            if within < self.chain.common_case_quorum() {
                continue;
            }
            if height == 0 {
                initial = Some((
                    MetaState {
                        height: 0,
                        digest: rbft_types::Hash::ZERO,
                    },
                    Vec::new(),
                    false,
                ));
                break;
            }
            // Group attestations at this height by digest.
            let mut by_digest: HashMap<rbft_types::Hash, Vec<SignedCheckpoint>> = HashMap::new();
            for basis in &bases {
                for signed in &basis.cset {
                    if signed.checkpoint.height() == height {
                        let entry = by_digest.entry(signed.checkpoint.digest()).or_default();
                        if !entry.iter().any(|e| e.author == signed.author) {
                            entry.push(signed.clone());
                        }
                    }
                }
            }
            if let Some((digest, set)) = by_digest
                .into_iter()
                .find(|(_, set)| set.len() >= self.chain.one_correct_quorum())
            {
                let is_config = set
                    .first()
                    .map(|s| s.checkpoint.need_update_epoch)
                    .unwrap_or(false);
                initial = Some((MetaState { height, digest }, set, is_config));
                break;
            }
        }
        let (initial, checkpoint_set, is_config) = initial?;

        // Survivors: per sequence above the checkpoint, a digest prepared
        // at the highest view with F+1 support survives; a sequence no
        // quorum prepared becomes a null batch.
        let max_prepared = bases
            .iter()
            .flat_map(|b| b.pset.iter().map(|p| p.seq_no))
            .max()
            .unwrap_or(initial.height);

        let mut xset = Xset::new();
        for n in (initial.height + 1)..=max_prepared {
            let within = bases.iter().filter(|b| b.h <= n - 1).count();
            if within < self.chain.common_case_quorum() {
                // The sequence is outside a quorum's logs; undecidable.
                return None;
            }
            let entries: Vec<&VcPq> = bases
                .iter()
                .flat_map(|b| b.pset.iter().filter(|p| p.seq_no == n))
                .collect();
            if entries.is_empty() {
                xset.insert(n, Digest::EMPTY);
                continue;
            }
            let best = entries
                .iter()
                .max_by_key(|p| p.view)
                .expect("entries not empty");
            let support = bases
                .iter()
                .filter(|b| {
                    b.pset
                        .iter()
                        .any(|p| p.seq_no == n && p.batch_digest == best.batch_digest)
                })
                .count();
            if support >= self.chain.one_correct_quorum() {
                xset.insert(n, best.batch_digest);
            } else {
                debug!(seq_no = n, "prepared entry lacks f+1 support, waiting");
                return None;
            }
        }

        Some(XsetResult {
            initial,
            checkpoint_set,
            is_config,
            xset,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Batch transfer during new-view assembly
    // ═══════════════════════════════════════════════════════════════════════

    fn feed_missing_req_batches(&mut self, xset: &Xset) -> Vec<Action<T>> {
        let mut actions = Vec::new();
        for (&n, &d) in xset {
            if n <= self.exec.last_exec() || d.is_empty() {
                continue;
            }
            if self.store.batch_store.contains_key(&d)
                || self.store.missing_req_batches.contains(&d)
            {
                continue;
            }
            debug!(seq_no = n, digest = %d, "fetching x-set batch");
            self.store.missing_req_batches.insert(d);
            actions.push(self.peers.broadcast(
                self.chain.epoch(),
                ConsensusMessage::FetchBatchRequest(FetchBatchRequest {
                    replica_id: self.chain.self_id,
                    batch_digest: d,
                }),
            ));
        }
        actions
    }

    pub(crate) fn recv_fetch_batch_request(&mut self, req: FetchBatchRequest) -> Vec<Action<T>> {
        let Some(batch) = self.store.batch_store.get(&req.batch_digest) else {
            debug!(digest = %req.batch_digest, "no batch to serve");
            return Vec::new();
        };
        let mut requests = Vec::with_capacity(batch.requests.len());
        for tx in &batch.requests {
            match borsh::to_vec(tx) {
                Ok(bytes) => requests.push(bytes),
                Err(err) => {
                    warn!(error = %err, "tx serialization failed");
                    return Vec::new();
                }
            }
        }
        let wire = WireBatch {
            request_hashes: batch.request_hashes.clone(),
            requests,
            local_flags: batch.local_flags.clone(),
            timestamp: batch.timestamp,
            seq_no: batch.seq_no,
            batch_hash: batch.batch_hash,
        };
        vec![self.peers.unicast(
            self.chain.epoch(),
            ConsensusMessage::FetchBatchResponse(FetchBatchResponse {
                replica_id: self.chain.self_id,
                batch_digest: req.batch_digest,
                batch: wire,
            }),
            req.replica_id,
        )]
    }

    pub(crate) fn recv_fetch_batch_response(&mut self, resp: FetchBatchResponse) -> Vec<Action<T>> {
        if !self.store.missing_req_batches.contains(&resp.batch_digest) {
            debug!(digest = %resp.batch_digest, "unsolicited batch response");
            return Vec::new();
        }
        let wire = resp.batch;
        if Digest::of_batch(&wire.request_hashes, wire.timestamp) != resp.batch_digest
            || wire.batch_hash != resp.batch_digest
        {
            warn!(from = %resp.replica_id, "fetched batch digest mismatch");
            return Vec::new();
        }
        if wire.requests.len() != wire.request_hashes.len() {
            warn!(from = %resp.replica_id, "fetched batch length mismatch");
            return Vec::new();
        }
        let mut requests = Vec::with_capacity(wire.requests.len());
        for (i, bytes) in wire.requests.iter().enumerate() {
            match T::try_from_slice(bytes) {
                Ok(tx) => {
                    if tx.tx_hash() != wire.request_hashes[i] {
                        warn!(from = %resp.replica_id, index = i, "fetched tx hash mismatch");
                        return Vec::new();
                    }
                    requests.push(tx);
                }
                Err(err) => {
                    warn!(error = %err, "bad tx bytes in batch response");
                    return Vec::new();
                }
            }
        }
        let batch = RequestBatch {
            request_hashes: wire.request_hashes,
            requests,
            local_flags: wire.local_flags,
            timestamp: wire.timestamp,
            seq_no: wire.seq_no,
            batch_hash: wire.batch_hash,
        };
        info!(digest = %resp.batch_digest, "x-set batch recovered");
        self.store.batch_store.insert(resp.batch_digest, batch.clone());
        self.store.missing_req_batches.remove(&resp.batch_digest);
        let mut actions = self.persist_batch(&batch);

        if self.store.missing_req_batches.is_empty() {
            actions.extend(self.check_new_view());
        }
        actions
    }

    /// Restore pool ordering for the new view: drop batches the stable
    /// checkpoint covered, un-batch the rest, and clear the primary's queue.
    fn put_back_request_batches(&mut self, xset: &Xset, actions: &mut Vec<Action<T>>) {
        let keep: Vec<Digest> = xset.values().copied().collect();
        let drop: Vec<Digest> = self
            .store
            .batch_store
            .iter()
            .filter(|(digest, batch)| {
                batch.seq_no <= self.chain.h
                    && batch.seq_no > self.config.applied
                    && !keep.contains(digest)
            })
            .map(|(digest, _)| *digest)
            .collect();
        for digest in &drop {
            debug!(digest = %digest, "dropping batch covered by the checkpoint");
            self.store.batch_store.remove(digest);
            actions.extend(self.persist_del_batch(digest));
        }
        self.pool.remove_batches(&drop);
        self.pool.restore_pool();
        self.batch_mgr.cache_batch.clear();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn on_new_view_timer(&mut self, demand: Option<View>) -> Vec<Action<T>> {
        if let Some(demand) = demand {
            if self.chain.view > demand {
                debug!(demand, view = self.chain.view, "stale new-view timer");
                return Vec::new();
            }
        } else if self.status.is(StatusBit::InViewChange) {
            debug!("new-view timer fired mid view change without a demand, ignoring");
            return Vec::new();
        }
        info!(
            reason = %self.vc_mgr.new_view_timer_reason,
            "new-view timer expired, sending view change"
        );
        self.send_view_change(false)
    }

    pub(crate) fn on_vc_resend_timer(&mut self) -> Vec<Action<T>> {
        if !self.status.is(StatusBit::InViewChange) {
            warn!("view change resend timer expired outside view change");
            return Vec::new();
        }
        info!("view change quorum never formed, falling back to recovery");
        // Undo the optimistic view increment before recovering.
        let view = self.chain.view.saturating_sub(1);
        self.set_view(view);
        self.init_recovery()
    }

    pub(crate) fn on_clean_vc_timer(&mut self) -> Vec<Action<T>> {
        let horizon = self.now_ns - self.config.clean_vc_timeout.as_nanos() as i64;
        let self_id = self.chain.self_id;
        let before = self.vc_mgr.view_change_store.len();
        self.vc_mgr
            .view_change_store
            .retain(|(_, from), vc| *from == self_id || vc.timestamp >= horizon);
        let dropped = before - self.vc_mgr.view_change_store.len();
        if dropped > 0 {
            debug!(dropped, "cleaned out-of-date view changes");
        }
        vec![self.start_timer(
            TimerId::CleanVc,
            self.config.clean_vc_timeout,
            Event::CleanVcTimer,
        )]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fetch view (restart catch-up)
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn on_fetch_view_timer(&mut self) -> Vec<Action<T>> {
        self.try_fetch_view()
    }

    /// Ask the current primary whether a new view was already agreed while
    /// this replica was away.
    pub(crate) fn try_fetch_view(&mut self) -> Vec<Action<T>> {
        self.try_fetch_view_from(self.chain.view)
    }

    /// Ask the primary of `view` for the new-view attestation installing it.
    pub(crate) fn try_fetch_view_from(&mut self, view: View) -> Vec<Action<T>> {
        let primary = self.chain.elect_primary(view);
        if primary == self.chain.self_id {
            return Vec::new();
        }
        debug!(view, to = %primary, "fetching agreed view");
        let mut actions = vec![self.peers.unicast(
            self.chain.epoch(),
            ConsensusMessage::FetchView(FetchView {
                replica_id: self.chain.self_id,
                view,
            }),
            primary,
        )];
        actions.push(self.start_timer(
            TimerId::FetchView,
            self.config.fetch_view_timeout,
            Event::FetchViewTimer,
        ));
        actions
    }

    pub(crate) fn recv_fetch_view(&mut self, req: FetchView) -> Vec<Action<T>> {
        let new_view = self
            .vc_mgr
            .new_view_store
            .get(&self.chain.view)
            .cloned()
            .or_else(|| self.load_persisted_new_view());
        debug!(
            to = %req.replica_id,
            view = self.chain.view,
            has_new_view = new_view.is_some(),
            "answering fetch view"
        );
        vec![self.peers.unicast(
            self.chain.epoch(),
            ConsensusMessage::RecoveryResponse(RecoveryResponse {
                replica_id: self.chain.self_id,
                view: self.chain.view,
                new_view,
            }),
            req.replica_id,
        )]
    }

    pub(crate) fn recv_recovery_response(&mut self, resp: RecoveryResponse) -> Vec<Action<T>> {
        debug!(from = %resp.replica_id, view = resp.view, "received recovery response");
        let Some(nv) = resp.new_view else {
            return Vec::new();
        };
        if nv.view < self.chain.view {
            return Vec::new();
        }
        self.recv_new_view(nv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_change_seq_no_rounds_to_checkpoint_period() {
        let mut mgr = VcManager::new(Duration::from_secs(8));
        mgr.update_view_change_seq_no(0, 10, 4);
        assert_eq!(mgr.view_change_seq_no, 40);
        mgr.update_view_change_seq_no(17, 10, 4);
        assert_eq!(mgr.view_change_seq_no, 50);
        mgr.update_view_change_seq_no(20, 10, 4);
        assert_eq!(mgr.view_change_seq_no, 60);
    }

    #[test]
    fn view_change_seq_no_ignores_zero_period() {
        let mut mgr = VcManager::new(Duration::from_secs(8));
        mgr.update_view_change_seq_no(5, 0, 4);
        assert_eq!(mgr.view_change_seq_no, 0);
    }
}

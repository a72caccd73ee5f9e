//! Normal-case protocol: batching, pre-prepare / prepare / commit, the
//! missing-transaction fetch sub-protocol, and the commit pipeline.

use crate::replica::Replica;
use crate::status::StatusBit;
use borsh::BorshDeserialize;
use rbft_core::{Action, Event, TimerId};
use rbft_mempool::{BatchResolution, RequestPool};
use rbft_messages::{
    Commit, ConsensusMessage, FetchMissingRequest, FetchMissingResponse, HashBatch, NullRequest,
    PrePrepare, Prepare, RebroadcastRequestSet,
};
use rbft_types::{Digest, Hash, Height, MsgId, RequestBatch, RequestSet, Transaction};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

impl<T: Transaction, P: RequestPool<T>> Replica<T, P> {
    // ═══════════════════════════════════════════════════════════════════════
    // Null request
    // ═══════════════════════════════════════════════════════════════════════

    /// Null-request timer expiry: the primary heartbeats, a backup suspects
    /// the primary.
    pub(crate) fn on_null_request_timer(&mut self) -> Vec<Action<T>> {
        if self.status.is(StatusBit::InViewChange) {
            debug!("null request timer expired in view change, ignoring");
            return Vec::new();
        }
        if !self.chain.self_is_primary() {
            warn!("null request timer expired, sending view change");
            return self.send_view_change(false);
        }
        info!("primary null request timer expired, sending null request");
        let mut actions = self.send_null_request();
        actions.extend(self.try_sync_state());
        actions
    }

    fn send_null_request(&mut self) -> Vec<Action<T>> {
        if self.status.is(StatusBit::InConfChange) {
            info!("not sending null request in config change");
            return Vec::new();
        }
        let msg = ConsensusMessage::NullRequest(NullRequest {
            replica_id: self.chain.self_id,
        });
        let mut actions = vec![self.peers.broadcast(self.chain.epoch(), msg)];
        actions.push(self.null_request_timer_reset());
        actions
    }

    pub(crate) fn recv_null_request(&mut self, msg: NullRequest) -> Vec<Action<T>> {
        if self.status.is(StatusBit::InViewChange) {
            info!(from = %msg.replica_id, "in view change, rejecting null request");
            return Vec::new();
        }
        if self.status.is(StatusBit::InConfChange) {
            info!(from = %msg.replica_id, "in config change, rejecting null request");
            return Vec::new();
        }
        if !self.chain.is_primary(msg.replica_id) {
            warn!(from = %msg.replica_id, "null request from non-primary");
            return Vec::new();
        }
        debug!(from = %msg.replica_id, "received null request from primary");
        let mut actions = self.try_sync_state();
        actions.push(self.null_request_timer_reset());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Request sets and batching
    // ═══════════════════════════════════════════════════════════════════════

    /// A transaction set arrived from the API layer or another replica.
    pub(crate) fn process_request_set(&mut self, set: RequestSet<T>) -> Vec<Action<T>> {
        // A full pool rejects relayed sets; local ones are kept so clients
        // on this replica are not starved by cluster load.
        if self.pool.is_full() && !set.local && !self.config.flow_control {
            debug!(count = set.requests.len(), "pool full, rejecting remote request set");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if !self.is_normal() || self.status.is(StatusBit::SkipInProgress) {
            // Abnormal: pool the transactions without batching them.
            let (_, completed) = self.pool.add_new_requests(set.requests, false, set.local);
            for digest in completed {
                self.store.missing_batches_in_fetching.remove(&digest);
            }
        } else if self.chain.self_is_primary() {
            if !self.batch_mgr.batch_timer_active {
                actions.push(self.start_batch_timer());
                actions.push(self.stop_no_tx_batch_timer());
            }
            let (batches, _) = self.pool.add_new_requests(set.requests, true, set.local);
            if !batches.is_empty() {
                actions.push(self.stop_batch_timer());
                self.batch_mgr.last_batch_time = self.now_ns;
                for batch in batches {
                    actions.extend(self.recv_request_batch(batch));
                }
            }
        } else {
            let (_, completed) = self.pool.add_new_requests(set.requests, false, set.local);
            for digest in completed {
                match self.store.missing_batches_in_fetching.remove(&digest) {
                    Some(id) => {
                        info!(digest = %digest, "missing batch completed, trying to prepare");
                        actions.extend(self.find_next_prepare_batch(id));
                    }
                    None => {
                        warn!(digest = %digest, "completed batch without a fetch record");
                    }
                }
            }
        }
        actions
    }

    /// A batch was cut by the pool; the primary orders it, a backup hands
    /// its transactions back to the pool.
    pub(crate) fn recv_request_batch(&mut self, mut batch: RequestBatch<T>) -> Vec<Action<T>> {
        debug!(digest = %batch.batch_hash, "received request batch");
        batch.seq_no = self.batch_mgr.seq_no() + 1;

        if self.chain.self_is_primary()
            && self.is_normal()
            && !self.status.is(StatusBit::InConfChange)
        {
            let mut actions = Vec::new();
            if self.epoch_service.is_config_block(batch.seq_no) {
                info!(seq_no = batch.seq_no, "generated a config batch, entering config change");
                self.status.on(StatusBit::InConfChange);
            }
            actions.push(self.restart_batch_timer());
            if !self.pool.has_pending_requests()
                && self.chain.epoch_info.consensus_params.enable_timed_gen_empty_block
            {
                actions.push(self.start_no_tx_batch_timer());
            }
            actions.push(self.stop_timer(TimerId::NullRequest));
            if !self.batch_mgr.cache_batch.is_empty() {
                self.batch_mgr.cache_batch.push(batch);
                actions.extend(self.maybe_send_pre_prepare(None, true));
                return actions;
            }
            actions.extend(self.maybe_send_pre_prepare(Some(batch), false));
            actions
        } else {
            debug!(digest = %batch.batch_hash, "not ordering batch, restoring to pool");
            if let Err(err) = self.pool.restore_one_batch(&batch.batch_hash) {
                debug!(error = %err, "restore batch failed");
            }
            Vec::new()
        }
    }

    /// Emit a pre-prepare for `batch`, or queue it until the watermark
    /// window opens. With `from_cache`, drain the queue instead.
    pub(crate) fn maybe_send_pre_prepare(
        &mut self,
        batch: Option<RequestBatch<T>>,
        from_cache: bool,
    ) -> Vec<Action<T>> {
        let mut actions = Vec::new();
        let mut pending: Vec<RequestBatch<T>> = Vec::new();
        if from_cache {
            pending.append(&mut self.batch_mgr.cache_batch);
        }
        if let Some(batch) = batch {
            pending.push(batch);
        }

        for mut batch in pending.drain(..) {
            let n = self.batch_mgr.seq_no() + 1;
            if !self.chain.send_in_w(n) {
                debug!(
                    seq_no = n,
                    h = self.chain.h,
                    "next seq outside sending window, caching batch"
                );
                self.batch_mgr.cache_batch.push(batch);
                continue;
            }
            batch.seq_no = n;
            actions.extend(self.send_pre_prepare(batch));
        }
        actions
    }

    fn send_pre_prepare(&mut self, batch: RequestBatch<T>) -> Vec<Action<T>> {
        let n = batch.seq_no;
        let digest = batch.batch_hash;
        debug!(
            view = self.chain.view,
            seq_no = n,
            digest = %digest,
            txs = batch.request_hashes.len(),
            "primary sending pre-prepare"
        );

        let pre_prepare = PrePrepare {
            view: self.chain.view,
            seq_no: n,
            batch_digest: digest,
            hash_batch: HashBatch {
                request_hashes: batch.request_hashes.clone(),
                deduplicate_request_hashes: Vec::new(),
                timestamp: batch.timestamp,
            },
            replica_id: self.chain.self_id,
        };

        let id = MsgId::new(self.chain.view, n, digest);
        let is_config = self.epoch_service.is_config_block(n);
        let cert = self.store.get_cert(id);
        cert.is_config = is_config;
        cert.pre_prepare = Some(pre_prepare.clone());

        let mut actions = Vec::new();
        actions.extend(self.persist_qset(&pre_prepare));
        self.store.seq_map.insert(n, digest);
        self.store.batch_store.insert(digest, batch.clone());
        self.store.outstanding_req_batches.insert(digest, batch.clone());
        actions.extend(self.persist_batch(&batch));

        actions.push(self.peers.broadcast(
            self.chain.epoch(),
            ConsensusMessage::PrePrepare(pre_prepare),
        ));
        self.batch_mgr.set_seq_no(n);
        actions.extend(self.exit_sync_state());
        actions
    }

    /// After a stable checkpoint opened the window, the primary re-emits
    /// queued batches and re-arms batching.
    pub(crate) fn primary_resubmit_transactions(&mut self) -> Vec<Action<T>> {
        let mut actions = Vec::new();
        if !self.batch_mgr.cache_batch.is_empty() {
            actions.extend(self.maybe_send_pre_prepare(None, true));
        }
        if self.pool.has_pending_requests() && !self.batch_mgr.batch_timer_active {
            actions.push(self.start_batch_timer());
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Batch timers
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn on_batch_timer(&mut self) -> Vec<Action<T>> {
        if !self.is_normal() {
            debug!("abnormal, not creating a batch");
            return vec![self.stop_batch_timer()];
        }
        if !self.chain.self_is_primary() {
            debug!("not primary, not creating a batch");
            return vec![self.stop_batch_timer()];
        }
        if self.status.is(StatusBit::InConfChange) {
            debug!("config batch in ordering, not creating batches");
            return vec![self.restart_batch_timer()];
        }
        let mut actions = Vec::new();
        if !self.batch_mgr.cache_batch.is_empty() {
            actions.push(self.restart_batch_timer());
            actions.extend(self.maybe_send_pre_prepare(None, true));
            return actions;
        }
        actions.push(self.stop_batch_timer());
        if self.pool.has_pending_requests() && self.in_primary_term() {
            let batches = self.pool.generate_request_batch();
            self.batch_mgr.last_batch_time = self.now_ns;
            for batch in batches {
                actions.extend(self.recv_request_batch(batch));
            }
        }
        actions
    }

    pub(crate) fn on_no_tx_batch_timer(&mut self) -> Vec<Action<T>> {
        if !self.is_normal() || !self.chain.self_is_primary() {
            return vec![self.stop_no_tx_batch_timer()];
        }
        if !self.chain.epoch_info.consensus_params.enable_timed_gen_empty_block {
            debug!("timed empty blocks disabled");
            return vec![self.stop_no_tx_batch_timer()];
        }
        if self.status.is(StatusBit::InConfChange) {
            return vec![self.start_no_tx_batch_timer()];
        }
        if !self.batch_mgr.cache_batch.is_empty() || self.pool.has_pending_requests() {
            warn!("pool not empty, not generating an empty batch");
            return vec![self.stop_no_tx_batch_timer()];
        }
        debug!("primary generating a timed empty batch");
        let mut actions = vec![self.stop_no_tx_batch_timer()];
        if self.in_primary_term() {
            // An empty batch has the null digest and no transactions.
            let batch = RequestBatch {
                request_hashes: Vec::new(),
                requests: Vec::new(),
                local_flags: Vec::new(),
                timestamp: self.now_ns,
                seq_no: 0,
                batch_hash: Digest::EMPTY,
            };
            actions.extend(self.recv_request_batch(batch));
        }
        actions
    }

    /// Whether the primary may still assign sequences in this term.
    fn in_primary_term(&self) -> bool {
        if self.chain.is_wrf() {
            self.batch_mgr.seq_no() < self.chain.h + self.chain.checkpoint_period()
        } else {
            self.batch_mgr.seq_no() < self.chain.epoch_info.last_block()
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pool hygiene timers
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn on_check_pool_timer(&mut self) -> Vec<Action<T>> {
        let mut actions = Vec::new();
        if self.is_normal() {
            actions.extend(self.process_out_of_date_requests());
        }
        actions.push(self.start_timer(
            TimerId::CheckPool,
            self.config.check_pool_timeout,
            Event::CheckPoolTimer,
        ));
        actions
    }

    pub(crate) fn on_check_pool_remove_timer(&mut self) -> Vec<Action<T>> {
        let removed = self.pool.remove_timeout_requests();
        if removed > 0 {
            warn!(removed, "removed timed-out transactions from pool");
        }
        vec![self.start_timer(
            TimerId::CheckPoolRemove,
            self.config.check_pool_remove_timeout,
            Event::CheckPoolRemoveTimer,
        )]
    }

    /// Re-broadcast locally originated transactions that outlived the
    /// tolerance, split by `set_size`.
    fn process_out_of_date_requests(&mut self) -> Vec<Action<T>> {
        let stale = self.pool.filter_out_of_date_requests();
        if stale.is_empty() {
            return Vec::new();
        }
        debug!(count = stale.len(), "rebroadcasting out-of-date requests");
        let mut actions = Vec::new();
        for chunk in stale.chunks(self.config.set_size.max(1)) {
            let mut requests = Vec::with_capacity(chunk.len());
            for tx in chunk {
                match borsh::to_vec(tx) {
                    Ok(bytes) => requests.push(bytes),
                    Err(err) => warn!(error = %err, "tx serialization failed"),
                }
            }
            let msg = ConsensusMessage::RebroadcastRequestSet(RebroadcastRequestSet {
                replica_id: self.chain.self_id,
                requests,
            });
            actions.push(self.peers.broadcast(self.chain.epoch(), msg));
        }
        actions
    }

    pub(crate) fn recv_rebroadcast_request_set(
        &mut self,
        msg: RebroadcastRequestSet,
    ) -> Vec<Action<T>> {
        let mut txs = Vec::with_capacity(msg.requests.len());
        for bytes in &msg.requests {
            match T::try_from_slice(bytes) {
                Ok(tx) => txs.push(tx),
                Err(err) => {
                    warn!(from = %msg.replica_id, error = %err, "bad tx in request set");
                    return Vec::new();
                }
            }
        }
        self.process_request_set(RequestSet {
            requests: txs,
            local: false,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pre-prepare
    // ═══════════════════════════════════════════════════════════════════════

    fn is_pre_prepare_legal(&self, pp: &PrePrepare) -> bool {
        if self.status.in_one(&[
            StatusBit::InViewChange,
            StatusBit::InRecovery,
            StatusBit::InConfChange,
        ]) {
            debug!(seq_no = pp.seq_no, "in abnormal phase, rejecting pre-prepare");
            return false;
        }
        if self.chain.self_is_primary() {
            warn!(from = %pp.replica_id, "primary received a pre-prepare, rejecting");
            return false;
        }
        if !self.chain.is_primary(pp.replica_id) {
            warn!(from = %pp.replica_id, "pre-prepare from non-primary, rejecting");
            return false;
        }
        if !self.chain.in_wv(pp.view, pp.seq_no) {
            debug!(
                view = pp.view,
                seq_no = pp.seq_no,
                "pre-prepare outside view/watermark"
            );
            return false;
        }
        if pp.seq_no <= self.exec.last_exec() {
            debug!(seq_no = pp.seq_no, last_exec = self.exec.last_exec(), "stale pre-prepare");
            return false;
        }
        true
    }

    pub(crate) fn recv_pre_prepare(&mut self, pp: PrePrepare) -> Vec<Action<T>> {
        debug!(
            from = %pp.replica_id,
            view = pp.view,
            seq_no = pp.seq_no,
            digest = %pp.batch_digest,
            "received pre-prepare"
        );
        if !self.is_pre_prepare_legal(&pp) {
            return Vec::new();
        }

        // A second digest at an observed sequence convicts the primary.
        if let Some(stored) = self.store.seq_map.get(&pp.seq_no) {
            if *stored != pp.batch_digest {
                warn!(
                    seq_no = pp.seq_no,
                    received = %pp.batch_digest,
                    stored = %stored,
                    "same seq with different digest, sending view change"
                );
                return self.send_view_change(false);
            }
        }

        let mut actions = Vec::new();
        if self.chain.beyond_range(pp.seq_no) {
            debug!(seq_no = pp.seq_no, "pre-prepare beyond high watermark");
            actions.extend(self.soft_start_high_watermark_timer("pre-prepare out of range"));
        }

        if pp.batch_digest.is_empty() {
            if !pp.hash_batch.request_hashes.is_empty() {
                warn!("empty digest with non-empty hash list, sending view change");
                return self.send_view_change(false);
            }
        } else {
            let computed =
                Digest::of_batch(&pp.hash_batch.request_hashes, pp.hash_batch.timestamp);
            if computed != pp.batch_digest {
                warn!(
                    computed = %computed,
                    claimed = %pp.batch_digest,
                    "batch digest mismatch, sending view change"
                );
                return self.send_view_change(false);
            }
        }

        if pp.seq_no > self.exec.last_exec() {
            actions.push(self.stop_timer(TimerId::NullRequest));
        }

        let id = MsgId::new(pp.view, pp.seq_no, pp.batch_digest);
        let cert = self.store.get_cert(id);
        cert.pre_prepare = Some(pp.clone());
        cert.is_config = self.epoch_service.is_config_block(pp.seq_no);
        self.store.seq_map.insert(pp.seq_no, pp.batch_digest);

        if !self.status.is(StatusBit::SkipInProgress) && pp.seq_no > self.exec.last_exec() {
            let reason = format!(
                "pre-prepare for view={}/seq_no={}",
                pp.view, pp.seq_no
            );
            actions.extend(self.soft_start_new_view_timer(
                self.config.request_timeout,
                reason,
                None,
            ));
            actions.extend(self.exit_sync_state());
        }

        actions.extend(self.persist_qset(&pp));

        let sent_prepare = self
            .store
            .cert_store
            .get(&id)
            .map(|cert| cert.sent_prepare)
            .unwrap_or(false);
        if !self.chain.self_is_primary() && !sent_prepare {
            actions.extend(self.find_next_prepare_batch(id));
        }
        actions
    }

    /// Resolve a cert's batch and send the prepare once everything it
    /// references is present locally.
    pub(crate) fn find_next_prepare_batch(&mut self, id: MsgId) -> Vec<Action<T>> {
        let Some(cert) = self.store.cert_store.get(&id) else {
            warn!(%id, "no cert when trying to prepare");
            return Vec::new();
        };
        if cert.sent_prepare {
            return Vec::new();
        }
        let Some(pp) = cert.pre_prepare.clone() else {
            warn!(%id, "no pre-prepare when trying to prepare");
            return Vec::new();
        };

        if id.d.is_empty() {
            // Null batch: nothing to resolve.
            return self.send_prepare(id);
        }

        match self.pool.get_requests_by_hash_list(
            id.d,
            pp.hash_batch.timestamp,
            id.n,
            &pp.hash_batch.request_hashes,
        ) {
            Ok(BatchResolution::Complete(batch)) => {
                self.store.batch_store.insert(id.d, batch.clone());
                self.store.outstanding_req_batches.insert(id.d, batch.clone());
                let mut actions = self.persist_batch(&batch);
                actions.extend(self.send_prepare(id));
                actions
            }
            Ok(BatchResolution::Missing(missing)) => self.fetch_missing_txs(&pp, missing),
            Err(err) => {
                warn!(%id, error = %err, "resolving batch failed");
                Vec::new()
            }
        }
    }

    fn send_prepare(&mut self, id: MsgId) -> Vec<Action<T>> {
        let cert = self.store.get_cert(id);
        cert.sent_prepare = true;
        debug!(view = id.v, seq_no = id.n, "sending prepare");

        let prepare = Prepare {
            view: id.v,
            seq_no: id.n,
            batch_digest: id.d,
            replica_id: self.chain.self_id,
        };
        let mut actions = vec![self
            .peers
            .broadcast(self.chain.epoch(), ConsensusMessage::Prepare(prepare))];
        actions.extend(self.recv_prepare(prepare));
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Prepare
    // ═══════════════════════════════════════════════════════════════════════

    fn is_prepare_legal(&self, prepare: &Prepare) -> bool {
        if self.chain.is_primary(prepare.replica_id) {
            warn!(from = %prepare.replica_id, "prepare from primary, rejecting");
            return false;
        }
        if !self.chain.in_wv(prepare.view, prepare.seq_no) {
            debug!(
                view = prepare.view,
                seq_no = prepare.seq_no,
                "prepare outside view/watermark"
            );
            return false;
        }
        true
    }

    pub(crate) fn recv_prepare(&mut self, prepare: Prepare) -> Vec<Action<T>> {
        debug!(
            from = %prepare.replica_id,
            view = prepare.view,
            seq_no = prepare.seq_no,
            "received prepare"
        );
        if !self.is_prepare_legal(&prepare) {
            return Vec::new();
        }

        let id = MsgId::new(prepare.view, prepare.seq_no, prepare.batch_digest);
        let cert = self.store.get_cert(id);
        if cert.prepares.contains(&prepare) {
            if prepare.seq_no <= self.exec.last_exec() {
                debug!(seq_no = prepare.seq_no, "duplicate prepare for executed seq");
            } else {
                info!(from = %prepare.replica_id, seq_no = prepare.seq_no, "ignoring duplicate prepare");
            }
            return Vec::new();
        }
        cert.prepares.insert(prepare);
        self.maybe_send_commit(id)
    }

    fn maybe_send_commit(&mut self, id: MsgId) -> Vec<Action<T>> {
        if self.status.is(StatusBit::SkipInProgress) {
            debug!("in state update, not sending commit");
            return Vec::new();
        }
        if !self.prepared(&id) {
            return Vec::new();
        }
        let Some(cert) = self.store.cert_store.get(&id) else {
            return Vec::new();
        };
        if !self.chain.self_is_primary() && !cert.sent_prepare {
            debug!(%id, "own prepare not sent, deferring commit");
            return Vec::new();
        }
        if cert.sent_commit {
            return Vec::new();
        }
        self.send_commit(id)
    }

    fn send_commit(&mut self, id: MsgId) -> Vec<Action<T>> {
        let cert = self.store.get_cert(id);
        cert.sent_commit = true;
        debug!(view = id.v, seq_no = id.n, "sending commit");

        let commit = Commit {
            view: id.v,
            seq_no: id.n,
            batch_digest: id.d,
            replica_id: self.chain.self_id,
        };
        let mut actions = self.persist_pset(&id);
        actions.push(self
            .peers
            .broadcast(self.chain.epoch(), ConsensusMessage::Commit(commit)));
        actions.extend(self.recv_commit(commit));
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commit
    // ═══════════════════════════════════════════════════════════════════════

    fn is_commit_legal(&self, commit: &Commit) -> bool {
        if !self.chain.in_wv(commit.view, commit.seq_no) {
            debug!(
                view = commit.view,
                seq_no = commit.seq_no,
                "commit outside view/watermark"
            );
            return false;
        }
        true
    }

    pub(crate) fn recv_commit(&mut self, commit: Commit) -> Vec<Action<T>> {
        debug!(
            from = %commit.replica_id,
            view = commit.view,
            seq_no = commit.seq_no,
            "received commit"
        );
        if !self.is_commit_legal(&commit) {
            return Vec::new();
        }

        let id = MsgId::new(commit.view, commit.seq_no, commit.batch_digest);
        let cert = self.store.get_cert(id);
        if cert.commits.contains(&commit) {
            if commit.seq_no <= self.exec.last_exec() {
                debug!(seq_no = commit.seq_no, "duplicate commit for executed seq");
                return Vec::new();
            }
            debug!(from = %commit.replica_id, "accepting duplicate commit above last exec");
        }
        cert.commits.insert(commit);

        if !self.committed(&id) {
            return Vec::new();
        }
        let cert = self.store.get_cert(id);
        if cert.sent_execute || !cert.sent_commit {
            debug!(seq_no = id.n, sent_execute = cert.sent_execute, "committed but not executable");
            return Vec::new();
        }
        self.store.committed_cert.insert(id, id.d);
        let mut actions = self.commit_pending_blocks();

        // Reset the new-view timeout after committing a block, and rotate
        // the view when the cyclical cap is reached.
        self.vc_mgr.last_new_view_timeout = self.config.new_view_timeout;
        if id.n == self.vc_mgr.view_change_seq_no {
            warn!(seq_no = id.n, "cycling view at view-change sequence cap");
            actions.extend(self.send_view_change(false));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commit pipeline
    // ═══════════════════════════════════════════════════════════════════════

    /// Execute committed batches strictly by sequence, stopping at a gap or
    /// at a configuration batch (which awaits its stable checkpoint).
    pub(crate) fn commit_pending_blocks(&mut self) -> Vec<Action<T>> {
        let mut actions = Vec::new();
        debug!(last_exec = self.exec.last_exec(), "attempting to commit pending blocks");

        loop {
            let Some(id) = self.find_next_commit_batch() else {
                break;
            };
            actions.extend(self.persist_cset(&id));
            actions.push(self.stop_new_view_timer());
            if self.chain.self_is_primary() && !self.batch_mgr.batch_timer_active {
                actions.push(self.restart_batch_timer());
            }

            let (is_config, timestamp, dedup, proposer) = {
                let cert = self.store.get_cert(id);
                let pp = cert.pre_prepare.as_ref();
                (
                    cert.is_config,
                    pp.map(|p| p.hash_batch.timestamp).unwrap_or(0),
                    pp.map(|p| p.hash_batch.deduplicate_request_hashes.clone())
                        .unwrap_or_default(),
                    pp.map(|p| p.replica_id),
                )
            };
            let proposer_account = proposer
                .map(|p| self.peers.account_of(p))
                .unwrap_or_default();

            if id.d.is_empty() {
                info!(
                    epoch = self.chain.epoch(),
                    view = id.v,
                    seq_no = id.n,
                    "executing null batch"
                );
                actions.push(Action::Execute {
                    txs: Vec::new(),
                    local_flags: Vec::new(),
                    seq_no: id.n,
                    timestamp: 0,
                    proposer_account,
                });
            } else {
                if is_config {
                    debug!(seq_no = id.n, "committing a config batch");
                    self.epoch_mgr.config_batch_to_execute = id.n;
                    self.status.on(StatusBit::InConfChange);
                }
                let (txs, local_flags) = self.filter_executable_txs(&id.d, &dedup);
                info!(
                    epoch = self.chain.epoch(),
                    view = id.v,
                    seq_no = id.n,
                    txs = txs.len(),
                    digest = %id.d,
                    "executing batch"
                );
                actions.push(Action::Execute {
                    txs,
                    local_flags,
                    seq_no: id.n,
                    timestamp,
                    proposer_account,
                });
            }

            self.store.outstanding_req_batches.remove(&id.d);
            self.store.get_cert(id).sent_execute = true;
            self.exec.set_last_exec(id.n);
            self.store.committed_cert.remove(&id);

            // A configuration batch stalls the pipeline until its
            // checkpoint is stable and the epoch transition completes.
            if is_config {
                break;
            }
        }
        actions.extend(self.start_timer_if_outstanding_requests());
        actions
    }

    fn find_next_commit_batch(&self) -> Option<MsgId> {
        for id in self.store.committed_cert.keys() {
            let Some(cert) = self.store.cert_store.get(id) else {
                continue;
            };
            if cert.pre_prepare.is_none() || cert.sent_execute {
                continue;
            }
            if id.n != self.exec.last_exec() + 1 {
                debug!(
                    expected = self.exec.last_exec() + 1,
                    got = id.n,
                    "not the next sequence to execute"
                );
                continue;
            }
            if self.status.is(StatusBit::SkipInProgress) {
                warn!("picking a state-transfer starting point, not executing");
                continue;
            }
            if !self.committed(id) {
                continue;
            }
            if !id.d.is_empty() && !self.store.batch_store.contains_key(&id.d) {
                warn!(digest = %id.d, "batch missing from batch store");
                continue;
            }
            return Some(*id);
        }
        None
    }

    /// Flatten a stored batch, dropping transactions named in the
    /// deduplication list.
    fn filter_executable_txs(&self, digest: &Digest, dedup: &[Hash]) -> (Vec<T>, Vec<bool>) {
        let Some(batch) = self.store.batch_store.get(digest) else {
            return (Vec::new(), Vec::new());
        };
        let mut txs = Vec::with_capacity(batch.requests.len());
        let mut local_flags = Vec::with_capacity(batch.requests.len());
        for (i, tx) in batch.requests.iter().enumerate() {
            let hash = tx.tx_hash();
            if dedup.contains(&hash) {
                info!(tx = %hash, "dropping duplicate transaction before execution");
                continue;
            }
            txs.push(tx.clone());
            local_flags.push(batch.local_flags.get(i).copied().unwrap_or(false));
        }
        (txs, local_flags)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Missing-transaction fetch
    // ═══════════════════════════════════════════════════════════════════════

    fn fetch_missing_txs(
        &mut self,
        pp: &PrePrepare,
        missing: BTreeMap<u64, Hash>,
    ) -> Vec<Action<T>> {
        // One outstanding fetch per batch digest.
        if self
            .store
            .missing_batches_in_fetching
            .contains_key(&pp.batch_digest)
        {
            return Vec::new();
        }
        debug!(
            view = pp.view,
            seq_no = pp.seq_no,
            digest = %pp.batch_digest,
            missing = missing.len(),
            "fetching missing transactions from primary"
        );
        self.store.missing_batches_in_fetching.insert(
            pp.batch_digest,
            MsgId::new(pp.view, pp.seq_no, pp.batch_digest),
        );
        let fetch = FetchMissingRequest {
            view: pp.view,
            seq_no: pp.seq_no,
            batch_digest: pp.batch_digest,
            missing_request_hashes: missing,
            replica_id: self.chain.self_id,
        };
        vec![self.peers.unicast(
            self.chain.epoch(),
            ConsensusMessage::FetchMissingRequest(fetch),
            pp.replica_id,
        )]
    }

    pub(crate) fn recv_fetch_missing_request(
        &mut self,
        fetch: FetchMissingRequest,
    ) -> Vec<Action<T>> {
        debug!(
            from = %fetch.replica_id,
            seq_no = fetch.seq_no,
            digest = %fetch.batch_digest,
            "received fetch-missing request"
        );

        let mut requests: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        if let Some(batch) = self.store.batch_store.get(&fetch.batch_digest) {
            let len = batch.request_hashes.len() as u64;
            for (&index, hash) in &fetch.missing_request_hashes {
                if index >= len || batch.request_hashes[index as usize] != *hash {
                    warn!(index, "mismatched request hash in fetch-missing request");
                    return Vec::new();
                }
                match borsh::to_vec(&batch.requests[index as usize]) {
                    Ok(bytes) => {
                        requests.insert(index, bytes);
                    }
                    Err(err) => {
                        warn!(error = %err, "tx serialization failed");
                        return Vec::new();
                    }
                }
            }
        } else {
            match self
                .pool
                .send_missing_requests(fetch.batch_digest, &fetch.missing_request_hashes)
            {
                Ok(txs) => {
                    for (index, tx) in txs {
                        match borsh::to_vec(&tx) {
                            Ok(bytes) => {
                                requests.insert(index, bytes);
                            }
                            Err(err) => {
                                warn!(error = %err, "tx serialization failed");
                                return Vec::new();
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(digest = %fetch.batch_digest, error = %err, "cannot serve fetch-missing");
                    return Vec::new();
                }
            }
        }

        let response = FetchMissingResponse {
            view: fetch.view,
            seq_no: fetch.seq_no,
            batch_digest: fetch.batch_digest,
            missing_request_hashes: fetch.missing_request_hashes,
            missing_requests: requests,
            replica_id: self.chain.self_id,
        };
        vec![self.peers.unicast(
            self.chain.epoch(),
            ConsensusMessage::FetchMissingResponse(response),
            fetch.replica_id,
        )]
    }

    pub(crate) fn recv_fetch_missing_response(
        &mut self,
        response: FetchMissingResponse,
    ) -> Vec<Action<T>> {
        if !self
            .store
            .missing_batches_in_fetching
            .contains_key(&response.batch_digest)
        {
            debug!(digest = %response.batch_digest, "ignoring unsolicited fetch-missing response");
            return Vec::new();
        }
        debug!(
            from = %response.replica_id,
            seq_no = response.seq_no,
            digest = %response.batch_digest,
            "received fetch-missing response"
        );

        if response.seq_no < self.exec.last_exec() {
            debug!(seq_no = response.seq_no, "response below last exec, ignoring");
            return Vec::new();
        }
        if response.missing_requests.len() != response.missing_request_hashes.len() {
            warn!("mismatched lengths in fetch-missing response");
            return Vec::new();
        }
        if !self.chain.in_v(response.view) {
            debug!(view = response.view, "response from another view, ignoring");
            return Vec::new();
        }
        if !self.chain.is_primary(response.replica_id) {
            warn!(from = %response.replica_id, "fetch-missing response from non-primary");
            return Vec::new();
        }

        let id = MsgId::new(response.view, response.seq_no, response.batch_digest);
        let Some(cert) = self.store.cert_store.get(&id) else {
            warn!(%id, "no cert for fetch-missing response");
            return Vec::new();
        };
        if cert.sent_commit {
            debug!(%id, "cert already committed, ignoring fetch-missing response");
            return Vec::new();
        }
        if cert.pre_prepare.is_none() {
            warn!(%id, "no pre-prepare for fetch-missing response");
            return Vec::new();
        }

        let mut txs = BTreeMap::new();
        for (index, bytes) in &response.missing_requests {
            match T::try_from_slice(bytes) {
                Ok(tx) => {
                    txs.insert(*index, tx);
                }
                Err(err) => {
                    warn!(error = %err, "bad tx bytes in fetch-missing response");
                    return Vec::new();
                }
            }
        }

        if let Err(err) = self.pool.receive_missing_requests(response.batch_digest, txs) {
            // The primary proposed a transaction whose content does not
            // match the hash it claimed; convict it.
            warn!(error = %err, "fetch-missing response inconsistent, sending view change");
            return self.send_view_change(false);
        }
        self.store
            .missing_batches_in_fetching
            .remove(&response.batch_digest);

        self.find_next_prepare_batch(id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // High-watermark timer
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn on_high_watermark_timer(&mut self, prev_h: Height) -> Vec<Action<T>> {
        if self.status.is(StatusBit::InViewChange) {
            debug!("in view change, ignoring high-watermark timer");
            return Vec::new();
        }
        if prev_h < self.chain.h {
            debug!(h = self.chain.h, "watermark already advanced, ignoring timer");
            return Vec::new();
        }
        info!(reason = %self.hw_timer_reason, "high-watermark timer expired, sending view change");
        self.send_view_change(false)
    }
}

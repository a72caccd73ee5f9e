//! The replica aggregate and its event dispatcher.
//!
//! One `Replica` owns every manager of the kernel and is the only mutator of
//! its state. Events are routed by service: core (three-phase, checkpoints,
//! missing transactions), view change, recovery, and epoch. Handlers return
//! actions; internal follow-up events are re-injected until a fixed point.

use crate::batch::BatchManager;
use crate::config::{ChainConfig, EngineConfig};
use crate::epoch::EpochManager;
use crate::exec::ExecTracker;
use crate::peers::PeerManager;
use crate::recovery::RecoveryManager;
use crate::status::{StatusBit, StatusFlags};
use crate::store::StoreManager;
use crate::view_change::VcManager;
use rbft_core::{
    Action, CryptoService, EpochService, Event, Inspect, InspectReply, InspectRequest,
    StateMachine, Storage, TimerId,
};
use rbft_messages::{ConsensusMessage, Envelope};
use rbft_mempool::RequestPool;
use rbft_types::{MsgId, NodeStatus, SeqNo, Transaction, View};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A full RBFT replica.
pub struct Replica<T: Transaction, P: RequestPool<T>> {
    pub(crate) config: EngineConfig,
    pub(crate) chain: ChainConfig,
    pub(crate) status: StatusFlags,
    pub(crate) peers: PeerManager,
    pub(crate) store: StoreManager<T>,
    pub(crate) batch_mgr: BatchManager<T>,
    pub(crate) exec: ExecTracker,
    pub(crate) vc_mgr: VcManager,
    pub(crate) recovery_mgr: RecoveryManager,
    pub(crate) epoch_mgr: EpochManager,
    pub(crate) pool: P,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) crypto: Arc<dyn CryptoService>,
    pub(crate) epoch_service: Arc<dyn EpochService>,
    /// Timers this replica believes are armed; soft starts skip armed ones.
    pub(crate) armed_timers: HashSet<TimerId>,
    /// Reason the high-watermark timer was armed, for the expiry log.
    pub(crate) hw_timer_reason: String,
    /// Logical now in nanoseconds, set by the runner before each event.
    pub(crate) now_ns: i64,
}

impl<T: Transaction, P: RequestPool<T>> Replica<T, P> {
    /// Build a replica from its configuration and capability handles. The
    /// in-memory state is reconstructed from `storage`; call [`Self::start`]
    /// to leave `Pending` and begin recovery.
    pub fn new(
        config: EngineConfig,
        pool: P,
        storage: Arc<dyn Storage>,
        crypto: Arc<dyn CryptoService>,
        epoch_service: Arc<dyn EpochService>,
    ) -> Self {
        let chain = ChainConfig::new(config.self_id, config.genesis_epoch.clone());
        let peers = PeerManager::new(config.self_id, &chain.epoch_info);
        let mut replica = Replica {
            exec: ExecTracker::new(config.applied),
            vc_mgr: VcManager::new(config.new_view_timeout),
            recovery_mgr: RecoveryManager::new(),
            epoch_mgr: EpochManager::new(),
            batch_mgr: BatchManager::new(),
            store: StoreManager::new(),
            status: StatusFlags::new(),
            chain,
            peers,
            pool,
            storage,
            crypto,
            epoch_service,
            armed_timers: HashSet::new(),
            hw_timer_reason: String::new(),
            now_ns: 0,
            config,
        };

        replica.status.on(StatusBit::Pending);
        if let Err(err) = replica.restore_state() {
            // A corrupt consensus log cannot be repaired here; refuse to
            // participate rather than equivocate.
            error!(error = %err, "restore state failed");
            replica.status.on(StatusBit::Stopped);
        }
        replica.vc_mgr.update_view_change_seq_no(
            replica.exec.last_exec(),
            replica.chain.checkpoint_period(),
            replica.chain.epoch_info.consensus_params.high_watermark_multiplier,
        );

        info!(
            id = %replica.chain.self_id,
            epoch = replica.chain.epoch(),
            view = replica.chain.view,
            h = replica.chain.h,
            last_exec = replica.exec.last_exec(),
            n = replica.chain.n,
            f = replica.chain.f,
            k = replica.chain.checkpoint_period(),
            l = replica.chain.l,
            "replica initialized"
        );
        replica
    }

    /// Set the replica's notion of now. The runner calls this before every
    /// event; tests drive it with a logical clock.
    pub fn set_time(&mut self, now_ns: i64) {
        self.now_ns = now_ns;
        self.pool.set_time(now_ns);
    }

    /// Leave `Pending`, replay buffered view changes, and trigger recovery.
    pub fn start(&mut self) -> Vec<Action<T>> {
        self.status.off(StatusBit::Pending);
        info!(id = %self.chain.self_id, "replica starting");

        // A config batch already checked stable needs no re-check.
        if let Some(meta) = self.epoch_mgr.config_batch_to_check {
            if let Some(local) = self.store.local_checkpoints.get(&self.chain.h) {
                if local.checkpoint.height() == meta.height
                    && local.checkpoint.digest() == meta.digest
                {
                    info!("config batch to check already stable, reset");
                    self.epoch_mgr.config_batch_to_check = None;
                }
            }
        }

        let mut actions = vec![
            self.start_timer(
                TimerId::CheckPool,
                self.config.check_pool_timeout,
                Event::CheckPoolTimer,
            ),
            self.start_timer(
                TimerId::CheckPoolRemove,
                self.config.check_pool_remove_timeout,
                Event::CheckPoolRemoveTimer,
            ),
        ];
        actions.push(Action::EnqueueInternal {
            event: Box::new(Event::RecoveryInit {
                prev_view: self.chain.view,
            }),
        });
        actions
    }

    /// Stop processing: reset status to pending and mark stopped.
    pub fn stop(&mut self) {
        self.init_status();
        self.status.on(StatusBit::Stopped);
        info!(id = %self.chain.self_id, "replica stopped");
    }

    /// The externally visible status snapshot.
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.chain.self_id,
            view: self.chain.view,
            h: self.chain.h,
            epoch_info: self.chain.epoch_info.clone(),
            status: self.status.report(self.pool.is_full()),
        }
    }

    /// Immutable access to the request pool.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// The last executed sequence.
    pub fn last_exec(&self) -> SeqNo {
        self.exec.last_exec()
    }

    /// Number of live certificates.
    pub fn cert_count(&self) -> usize {
        self.store.cert_store.len()
    }

    /// Whether any certificate exists at sequence `n`.
    pub fn has_cert_at(&self, n: SeqNo) -> bool {
        self.store.cert_store.keys().any(|id| id.n == n)
    }

    /// Whether a certificate exists for exactly (v, n, d).
    pub fn has_cert(&self, id: &MsgId) -> bool {
        self.store.cert_store.contains_key(id)
    }

    /// Number of batches retained in the batch store.
    pub fn batch_count(&self) -> usize {
        self.store.batch_store.len()
    }

    /// Heights of retained local checkpoints.
    pub fn local_checkpoint_heights(&self) -> Vec<SeqNo> {
        self.store.local_checkpoints.keys().copied().collect()
    }

    /// Process one event, synchronously draining internal follow-ups.
    /// Returns only externally visible actions.
    pub fn process(&mut self, event: Event<T>) -> Vec<Action<T>> {
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(event);
        while let Some(next) = queue.pop_front() {
            for action in self.handle(next) {
                match action {
                    Action::EnqueueInternal { event } => queue.push_back(*event),
                    other => out.push(other),
                }
            }
        }
        out
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Status helpers
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn init_status(&mut self) {
        self.status.reset();
        self.status.on(StatusBit::Pending);
    }

    pub(crate) fn set_normal(&mut self) {
        self.status.on(StatusBit::Normal);
    }

    /// Set normal unless an abnormal phase is still in progress.
    pub(crate) fn maybe_set_normal(&mut self) {
        if !self.status.in_one(&[
            StatusBit::InViewChange,
            StatusBit::Pending,
            StatusBit::SkipInProgress,
            StatusBit::StateTransferring,
        ]) {
            self.set_normal();
        } else {
            debug!("not set normal, still in abnormal phase");
        }
    }

    /// Leave normal operation; also exits sync state and stops batching.
    pub(crate) fn set_abnormal(&mut self) -> Vec<Action<T>> {
        let mut actions = Vec::new();
        actions.extend(self.exit_sync_state());
        if self.chain.self_is_primary() {
            actions.push(self.stop_batch_timer());
        }
        self.status.off(StatusBit::Normal);
        actions
    }

    pub(crate) fn is_normal(&self) -> bool {
        self.status.is_normal()
    }

    /// Fatal, operator-visible stop.
    pub(crate) fn stop_namespace(&mut self, reason: &str) -> Action<T> {
        error!(reason, "requesting namespace stop");
        self.status.on(StatusBit::Stopped);
        Action::StopNamespace {
            reason: reason.to_string(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timer helpers
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn start_timer(
        &mut self,
        id: TimerId,
        duration: Duration,
        event: Event<T>,
    ) -> Action<T> {
        self.armed_timers.insert(id);
        Action::StartTimer {
            id,
            duration: Some(duration),
            event: Box::new(event),
        }
    }

    /// Arm a timer only if it is not already armed.
    pub(crate) fn soft_start_timer(
        &mut self,
        id: TimerId,
        duration: Duration,
        event: Event<T>,
    ) -> Option<Action<T>> {
        if self.armed_timers.contains(&id) {
            return None;
        }
        Some(self.start_timer(id, duration, event))
    }

    pub(crate) fn stop_timer(&mut self, id: TimerId) -> Action<T> {
        self.armed_timers.remove(&id);
        Action::StopTimer { id }
    }

    /// Mark a fired timer as disarmed.
    pub(crate) fn timer_fired(&mut self, id: TimerId) {
        self.armed_timers.remove(&id);
    }

    pub(crate) fn stop_batch_timer(&mut self) -> Action<T> {
        self.batch_mgr.batch_timer_active = false;
        self.stop_timer(TimerId::Batch)
    }

    pub(crate) fn start_batch_timer(&mut self) -> Action<T> {
        self.batch_mgr.batch_timer_active = true;
        self.start_timer(TimerId::Batch, self.config.batch_timeout, Event::BatchTimer)
    }

    pub(crate) fn restart_batch_timer(&mut self) -> Action<T> {
        self.start_batch_timer()
    }

    pub(crate) fn stop_no_tx_batch_timer(&mut self) -> Action<T> {
        self.batch_mgr.no_tx_batch_timer_active = false;
        self.stop_timer(TimerId::NoTxBatch)
    }

    pub(crate) fn start_no_tx_batch_timer(&mut self) -> Action<T> {
        self.batch_mgr.no_tx_batch_timer_active = true;
        self.start_timer(
            TimerId::NoTxBatch,
            self.config.no_tx_batch_timeout,
            Event::NoTxBatchTimer,
        )
    }

    /// Reset the null-request heartbeat. Backups wait half again as long as
    /// the primary's send interval.
    pub(crate) fn null_request_timer_reset(&mut self) -> Action<T> {
        let mut timeout = self.config.null_request_timeout;
        if !self.chain.self_is_primary() {
            timeout = timeout * 3 / 2;
        }
        self.start_timer(TimerId::NullRequest, timeout, Event::NullRequestTimer)
    }

    pub(crate) fn soft_start_new_view_timer(
        &mut self,
        duration: Duration,
        reason: String,
        demand: Option<View>,
    ) -> Option<Action<T>> {
        let action = self.soft_start_timer(TimerId::NewView, duration, Event::NewViewTimer { demand })?;
        self.vc_mgr.new_view_timer_reason = reason;
        Some(action)
    }

    pub(crate) fn restart_new_view_timer(
        &mut self,
        duration: Duration,
        reason: String,
        demand: Option<View>,
    ) -> Action<T> {
        self.vc_mgr.new_view_timer_reason = reason;
        self.start_timer(TimerId::NewView, duration, Event::NewViewTimer { demand })
    }

    pub(crate) fn stop_new_view_timer(&mut self) -> Action<T> {
        self.stop_timer(TimerId::NewView)
    }

    pub(crate) fn soft_start_high_watermark_timer(&mut self, reason: &str) -> Option<Action<T>> {
        let prev_h = self.chain.h;
        let action = self.soft_start_timer(
            TimerId::HighWatermark,
            self.config.high_watermark_timeout,
            Event::HighWatermarkTimer { prev_h },
        )?;
        debug!(reason, "arming high-watermark timer");
        self.hw_timer_reason = reason.to_string();
        Some(action)
    }

    pub(crate) fn stop_high_watermark_timer(&mut self) -> Action<T> {
        self.stop_timer(TimerId::HighWatermark)
    }

    /// Arm the request timer if batches are outstanding, else reset the
    /// null-request heartbeat.
    pub(crate) fn start_timer_if_outstanding_requests(&mut self) -> Vec<Action<T>> {
        if self.status.is(StatusBit::SkipInProgress) {
            return Vec::new();
        }
        if !self.store.outstanding_req_batches.is_empty() {
            let reason = format!(
                "outstanding request batches num={}",
                self.store.outstanding_req_batches.len()
            );
            self.soft_start_new_view_timer(self.config.request_timeout, reason, None)
                .into_iter()
                .collect()
        } else {
            vec![self.null_request_timer_reset()]
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase predicates
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether a pre-prepare matching (v, n, d) is stored.
    pub(crate) fn pre_prepared(&self, id: &MsgId) -> bool {
        if let Some(cert) = self.store.cert_store.get(id) {
            if let Some(pp) = &cert.pre_prepare {
                return pp.view == id.v && pp.seq_no == id.n && pp.batch_digest == id.d;
            }
        }
        false
    }

    /// Prepared(v,n,d): pre-prepared plus common-case-quorum−1 prepares
    /// (the primary's pre-prepare stands in for its prepare).
    pub(crate) fn prepared(&self, id: &MsgId) -> bool {
        if !self.pre_prepared(id) {
            return false;
        }
        let count = self
            .store
            .cert_store
            .get(id)
            .map(|cert| cert.prepares.len())
            .unwrap_or(0);
        count >= self.chain.common_case_quorum() - 1
    }

    /// Committed(v,n,d): prepared plus a common-case quorum of commits.
    pub(crate) fn committed(&self, id: &MsgId) -> bool {
        if !self.prepared(id) {
            return false;
        }
        let count = self
            .store
            .cert_store
            .get(id)
            .map(|cert| cert.commits.len())
            .unwrap_or(0);
        count >= self.chain.common_case_quorum()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════════════

    fn on_consensus_message(&mut self, envelope: Envelope) -> Vec<Action<T>> {
        if self.status.is(StatusBit::Stopped) {
            debug!("stopped, rejecting consensus message");
            return Vec::new();
        }
        if self.status.is(StatusBit::Pending) {
            // Buffer view changes while pending so a restarted replica can
            // rejoin an in-progress view change quickly after start.
            if let ConsensusMessage::ViewChange(vc) = envelope.msg {
                if envelope.epoch != self.chain.epoch() {
                    warn!(epoch = envelope.epoch, "pending: vc from other epoch");
                    return Vec::new();
                }
                if !self.peers.contains(envelope.from) {
                    warn!(from = %envelope.from, "pending: vc from unknown node");
                    return Vec::new();
                }
                let mut vc = vc;
                vc.timestamp = self.now_ns;
                debug!(
                    from = %envelope.from,
                    view = vc.basis.view,
                    "pending: buffering view change"
                );
                self.vc_mgr
                    .view_change_store
                    .insert((vc.basis.view, vc.basis.replica_id), vc);
            } else {
                debug!("pending, rejecting consensus message");
            }
            return Vec::new();
        }

        if self.status.is(StatusBit::InEpochSyncing) {
            debug!("epoch syncing, rejecting consensus message");
            return Vec::new();
        }

        // Messages from another epoch route to the epoch manager.
        if envelope.epoch != self.chain.epoch() {
            return self.check_epoch(&envelope);
        }

        let from = envelope.from;
        match envelope.msg {
            // Core service.
            ConsensusMessage::NullRequest(msg) => self.recv_null_request(msg),
            ConsensusMessage::PrePrepare(msg) => self.recv_pre_prepare(msg),
            ConsensusMessage::Prepare(msg) => self.recv_prepare(msg),
            ConsensusMessage::Commit(msg) => self.recv_commit(msg),
            ConsensusMessage::FetchMissingRequest(msg) => self.recv_fetch_missing_request(msg),
            ConsensusMessage::FetchMissingResponse(msg) => self.recv_fetch_missing_response(msg),
            ConsensusMessage::SignedCheckpoint(msg) => self.recv_checkpoint(msg, false),
            // View-change service.
            ConsensusMessage::ViewChange(msg) => self.recv_view_change(msg, from),
            ConsensusMessage::QuorumViewChange(msg) => self.recv_quorum_view_change(msg),
            ConsensusMessage::NewView(msg) => self.recv_new_view(msg),
            ConsensusMessage::FetchBatchRequest(msg) => self.recv_fetch_batch_request(msg),
            ConsensusMessage::FetchBatchResponse(msg) => self.recv_fetch_batch_response(msg),
            ConsensusMessage::FetchView(msg) => self.recv_fetch_view(msg),
            ConsensusMessage::RecoveryResponse(msg) => self.recv_recovery_response(msg),
            // Recovery service.
            ConsensusMessage::FetchPqcRequest(msg) => self.recv_fetch_pqc_request(msg),
            ConsensusMessage::FetchPqcResponse(msg) => self.recv_fetch_pqc_response(msg),
            ConsensusMessage::SyncState(msg) => self.recv_sync_state(msg),
            ConsensusMessage::SyncStateResponse(msg) => self.recv_sync_state_response(msg),
            // Epoch service.
            ConsensusMessage::FetchCheckpoint(msg) => self.recv_fetch_checkpoint(msg),
            ConsensusMessage::EpochChangeRequest(msg) => self.recv_epoch_change_request(msg),
            ConsensusMessage::EpochChangeProof(msg) => self.recv_epoch_change_proof(msg),
            // Pool hygiene.
            ConsensusMessage::RebroadcastRequestSet(msg) => self.recv_rebroadcast_request_set(msg),
        }
    }

    fn handle_inspect(&mut self, req: InspectRequest<T>) -> Vec<Action<T>> {
        let reply = match req.query {
            Inspect::Status => InspectReply::Status(self.status()),
            Inspect::PendingTxCount => InspectReply::PendingTxCount(self.pool.pending_count()),
            Inspect::LowWatermark => InspectReply::LowWatermark(self.chain.h),
            Inspect::TxByHash(hash) => InspectReply::Tx(self.pool.get_pending_tx_by_hash(&hash)),
        };
        // The requester may have given up; a closed channel is fine.
        let _ = req.reply.send(reply);
        Vec::new()
    }
}

impl<T: Transaction, P: RequestPool<T>> StateMachine for Replica<T, P> {
    type Tx = T;

    fn handle(&mut self, event: Event<T>) -> Vec<Action<T>> {
        match event {
            // Core timers.
            Event::BatchTimer => {
                self.timer_fired(TimerId::Batch);
                self.on_batch_timer()
            }
            Event::NoTxBatchTimer => {
                self.timer_fired(TimerId::NoTxBatch);
                self.on_no_tx_batch_timer()
            }
            Event::NullRequestTimer => {
                self.timer_fired(TimerId::NullRequest);
                self.on_null_request_timer()
            }
            Event::CheckPoolTimer => {
                self.timer_fired(TimerId::CheckPool);
                self.on_check_pool_timer()
            }
            Event::CheckPoolRemoveTimer => {
                self.timer_fired(TimerId::CheckPoolRemove);
                self.on_check_pool_remove_timer()
            }
            Event::HighWatermarkTimer { prev_h } => {
                self.timer_fired(TimerId::HighWatermark);
                self.on_high_watermark_timer(prev_h)
            }
            // View-change timers.
            Event::NewViewTimer { demand } => {
                self.timer_fired(TimerId::NewView);
                self.on_new_view_timer(demand)
            }
            Event::VcResendTimer => {
                self.timer_fired(TimerId::VcResend);
                self.on_vc_resend_timer()
            }
            Event::CleanVcTimer => {
                self.timer_fired(TimerId::CleanVc);
                self.on_clean_vc_timer()
            }
            Event::FetchViewTimer => {
                self.timer_fired(TimerId::FetchView);
                self.on_fetch_view_timer()
            }
            // Recovery timers.
            Event::SyncStateResponseTimer => {
                self.timer_fired(TimerId::SyncStateResponse);
                self.on_sync_state_response_timer()
            }
            Event::SyncStateRestartTimer => {
                self.timer_fired(TimerId::SyncStateRestart);
                self.on_sync_state_restart_timer()
            }
            // Epoch timers.
            Event::FetchCheckpointTimer => {
                self.timer_fired(TimerId::FetchCheckpoint);
                self.on_fetch_checkpoint_timer()
            }
            // External inputs.
            Event::ConsensusMessage(envelope) => self.on_consensus_message(*envelope),
            Event::RequestSet(set) => self.process_request_set(set),
            Event::StateUpdated(state) => self.recv_state_updated(state),
            Event::CheckpointBlockExecuted(state) => self.recv_checkpoint_block_executed(state),
            Event::Inspect(req) => self.handle_inspect(req),
            // Internal follow-ups.
            Event::RecoveryInit { prev_view } => {
                if prev_view < self.chain.view {
                    debug!("recovery already initiated, ignoring init event");
                    return Vec::new();
                }
                self.init_recovery()
            }
            Event::ViewChangeQuorum => self.on_view_change_quorum(),
            Event::ViewChangeDone => self.on_view_change_done(),
            Event::EpochSync { proof } => self.on_epoch_sync(*proof),
        }
    }
}

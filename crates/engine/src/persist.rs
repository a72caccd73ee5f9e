//! Consensus-log persistence.
//!
//! Key layout (flat strings, borsh-encoded values):
//!
//! ```text
//! "h"                      → low watermark
//! "view"                   → current view (as an attested NewView)
//! "qpc.v{V}.n{N}.d{D}"     → pre-prepare plus sent prepare/commit markers
//! "batch.{digest}"         → batch bytes
//! "chkpt.{seq}"            → local signed checkpoint
//! "qlist.{n}.{d}"/"plist.{n}" → P/Q lists carried into view changes
//! "epoch.{epoch}"          → quorum checkpoint proof for that epoch
//! "epoch.index"            → latest persisted epoch index
//! ```
//!
//! A write is durable before the resulting state transition is considered
//! observable, so a write failure is fatal.

use crate::replica::Replica;
use borsh::{BorshDeserialize, BorshSerialize};
use rbft_core::Action;
use rbft_mempool::RequestPool;
use rbft_messages::{
    NewView, PrePrepare, QuorumCheckpoint, SignedCheckpoint, VcPq, WireBatch,
};
use rbft_types::{Digest, MsgId, RequestBatch, SeqNo, Transaction};
use tracing::{debug, error, info, warn};

/// Errors reconstructing the in-memory state from storage.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    /// A persisted record failed to decode.
    #[error("decode {key}: {source}")]
    Decode {
        /// Storage key of the corrupt record.
        key: String,
        /// Decoder error.
        source: std::io::Error,
    },
}

fn decode<V: BorshDeserialize>(key: &str, bytes: &[u8]) -> Result<V, RestoreError> {
    V::try_from_slice(bytes).map_err(|source| RestoreError::Decode {
        key: key.to_string(),
        source,
    })
}

/// The durable record of one certificate.
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
struct PersistedCert {
    pre_prepare: PrePrepare,
    sent_prepare: bool,
    sent_commit: bool,
}

fn qpc_key(id: &MsgId) -> String {
    format!("qpc.v{}.n{}.d{}", id.v, id.n, id.d)
}

impl<T: Transaction, P: RequestPool<T>> Replica<T, P> {
    fn put(&mut self, key: &str, value: Vec<u8>) -> Vec<Action<T>> {
        match self.storage.put(key, &value) {
            Ok(()) => Vec::new(),
            Err(err) => vec![self.stop_namespace(&format!("storage put {key}: {err}"))],
        }
    }

    fn del(&mut self, key: &str) -> Vec<Action<T>> {
        match self.storage.delete(key) {
            Ok(()) => Vec::new(),
            Err(err) => vec![self.stop_namespace(&format!("storage delete {key}: {err}"))],
        }
    }

    fn encode<V: BorshSerialize>(value: &V) -> Vec<u8> {
        borsh::to_vec(value).expect("borsh serialization of persisted value")
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Certificates
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn persist_qset(&mut self, pp: &PrePrepare) -> Vec<Action<T>> {
        let id = MsgId::new(pp.view, pp.seq_no, pp.batch_digest);
        let record = PersistedCert {
            pre_prepare: pp.clone(),
            sent_prepare: false,
            sent_commit: false,
        };
        self.put(&qpc_key(&id), Self::encode(&record))
    }

    pub(crate) fn persist_pset(&mut self, id: &MsgId) -> Vec<Action<T>> {
        self.update_persisted_cert(id, |record| record.sent_prepare = true)
    }

    pub(crate) fn persist_cset(&mut self, id: &MsgId) -> Vec<Action<T>> {
        self.update_persisted_cert(id, |record| record.sent_commit = true)
    }

    fn update_persisted_cert(
        &mut self,
        id: &MsgId,
        apply: impl FnOnce(&mut PersistedCert),
    ) -> Vec<Action<T>> {
        let key = qpc_key(id);
        let Some(bytes) = self.storage.get(&key) else {
            warn!(%id, "no persisted cert to update");
            return Vec::new();
        };
        match PersistedCert::try_from_slice(&bytes) {
            Ok(mut record) => {
                apply(&mut record);
                self.put(&key, Self::encode(&record))
            }
            Err(err) => {
                error!(%id, error = %err, "corrupt persisted cert");
                vec![self.stop_namespace("corrupt persisted cert")]
            }
        }
    }

    pub(crate) fn persist_del_qpc_set(&mut self, id: &MsgId) -> Vec<Action<T>> {
        self.del(&qpc_key(id))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Batches and checkpoints
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn persist_batch(&mut self, batch: &RequestBatch<T>) -> Vec<Action<T>> {
        let mut requests = Vec::with_capacity(batch.requests.len());
        for tx in &batch.requests {
            match borsh::to_vec(tx) {
                Ok(bytes) => requests.push(bytes),
                Err(err) => {
                    return vec![self.stop_namespace(&format!("tx serialization: {err}"))];
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
        self.put(&format!("batch.{}", batch.batch_hash), Self::encode(&wire))
    }

    pub(crate) fn persist_del_batch(&mut self, digest: &Digest) -> Vec<Action<T>> {
        self.del(&format!("batch.{digest}"))
    }

    pub(crate) fn persist_checkpoint(
        &mut self,
        seq: SeqNo,
        signed: &SignedCheckpoint,
    ) -> Vec<Action<T>> {
        self.put(&format!("chkpt.{seq}"), Self::encode(signed))
    }

    pub(crate) fn persist_del_checkpoint(&mut self, seq: SeqNo) -> Vec<Action<T>> {
        self.del(&format!("chkpt.{seq}"))
    }

    pub(crate) fn persist_h(&mut self, h: u64) -> Vec<Action<T>> {
        self.put("h", Self::encode(&h))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View and P/Q lists
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn persist_new_view(&mut self, nv: &NewView) -> Vec<Action<T>> {
        self.put("view", Self::encode(nv))
    }

    pub(crate) fn load_persisted_new_view(&self) -> Option<NewView> {
        let bytes = self.storage.get("view")?;
        NewView::try_from_slice(&bytes).ok()
    }

    /// Sign and persist a view attestation outside the view-change path
    /// (epoch turns reset the view to zero).
    pub(crate) fn persist_view_attestation(&mut self) -> Vec<Action<T>> {
        let mut nv = NewView {
            view: self.chain.view,
            replica_id: self.chain.self_id,
            xset: Default::default(),
            auto_term_update: true,
            signature: Default::default(),
            from_id: Some(self.chain.self_id),
        };
        match self.crypto.sign(nv.signing_hash().as_bytes()) {
            Ok(signature) => {
                nv.signature = signature;
                self.persist_new_view(&nv)
            }
            Err(err) => vec![self.stop_namespace(&format!("sign view attestation: {err}"))],
        }
    }

    pub(crate) fn persist_qp_list(&mut self) -> Vec<Action<T>> {
        let mut actions = Vec::new();
        let qlist: Vec<VcPq> = self.vc_mgr.qlist.values().copied().collect();
        for q in qlist {
            actions.extend(self.put(
                &format!("qlist.{}.{}", q.seq_no, q.batch_digest),
                Self::encode(&q),
            ));
        }
        let plist: Vec<VcPq> = self.vc_mgr.plist.values().copied().collect();
        for p in plist {
            actions.extend(self.put(&format!("plist.{}", p.seq_no), Self::encode(&p)));
        }
        actions
    }

    pub(crate) fn persist_del_qp_list(&mut self) -> Vec<Action<T>> {
        let mut actions = Vec::new();
        if let Err(err) = self.storage.destroy("qlist.") {
            actions.push(self.stop_namespace(&format!("storage destroy qlist: {err}")));
        }
        if let Err(err) = self.storage.destroy("plist.") {
            actions.push(self.stop_namespace(&format!("storage destroy plist: {err}")));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Epoch proofs
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn persist_epoch_quorum_checkpoint(
        &mut self,
        quorum: &QuorumCheckpoint,
    ) -> Vec<Action<T>> {
        let epoch = quorum.checkpoint.epoch;
        let mut actions = self.put(&format!("epoch.{epoch}"), Self::encode(quorum));
        actions.extend(self.put("epoch.index", Self::encode(&epoch)));
        self.epoch_mgr.epoch_proof_cache.insert(epoch, quorum.clone());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Restore
    // ═══════════════════════════════════════════════════════════════════════

    /// Rebuild the in-memory state from storage after a restart.
    pub(crate) fn restore_state(&mut self) -> Result<(), RestoreError> {
        // The ledger's epoch supersedes the genesis configuration.
        let current = self.epoch_service.current_epoch_info();
        self.chain.epoch_info = current;
        self.chain.update_derived();
        self.peers.update_routing(&self.chain.epoch_info);

        if let Some(bytes) = self.storage.get("h") {
            let h: u64 = decode("h", &bytes)?;
            self.chain.h = h;
        }

        if let Some(nv) = self.load_persisted_new_view() {
            debug!(view = nv.view, "restored view");
            self.set_view(nv.view);
        }

        let mut max_batch_seq = 0;
        for (key, bytes) in self.storage.iterate("batch.") {
            let wire: WireBatch = decode(&key, &bytes)?;
            let mut requests = Vec::with_capacity(wire.requests.len());
            for tx_bytes in &wire.requests {
                let tx: T = decode(&key, tx_bytes)?;
                requests.push(tx);
            }
            max_batch_seq = max_batch_seq.max(wire.seq_no);
            self.store.batch_store.insert(
                wire.batch_hash,
                RequestBatch {
                    request_hashes: wire.request_hashes,
                    requests,
                    local_flags: wire.local_flags,
                    timestamp: wire.timestamp,
                    seq_no: wire.seq_no,
                    batch_hash: wire.batch_hash,
                },
            );
        }

        for (key, bytes) in self.storage.iterate("qpc.") {
            let record: PersistedCert = decode(&key, &bytes)?;
            let pp = record.pre_prepare;
            let id = MsgId::new(pp.view, pp.seq_no, pp.batch_digest);
            if id.n <= self.chain.h {
                continue;
            }
            let is_config = self.epoch_service.is_config_block(id.n);
            let cert = self.store.get_cert(id);
            cert.pre_prepare = Some(pp);
            cert.sent_prepare = record.sent_prepare;
            cert.sent_commit = record.sent_commit;
            cert.is_config = is_config;
            self.store.seq_map.insert(id.n, id.d);
            if !id.d.is_empty() {
                if let Some(batch) = self.store.batch_store.get(&id.d).cloned() {
                    self.store.outstanding_req_batches.insert(id.d, batch);
                }
            }
        }

        for (key, bytes) in self.storage.iterate("chkpt.") {
            let signed: SignedCheckpoint = decode(&key, &bytes)?;
            let seq = signed.checkpoint.height();
            self.store.local_checkpoints.insert(seq, signed);
            self.chain.last_checkpoint_digest = self
                .store
                .local_checkpoints
                .get(&seq)
                .map(|s| s.checkpoint.digest())
                .unwrap_or_default();
        }

        for (key, bytes) in self.storage.iterate("qlist.") {
            let q: VcPq = decode(&key, &bytes)?;
            self.vc_mgr.qlist.insert((q.seq_no, q.batch_digest), q);
        }
        for (key, bytes) in self.storage.iterate("plist.") {
            let p: VcPq = decode(&key, &bytes)?;
            self.vc_mgr.plist.insert(p.seq_no, p);
        }

        for (key, bytes) in self.storage.iterate("epoch.") {
            if key == "epoch.index" {
                continue;
            }
            let quorum: QuorumCheckpoint = decode(&key, &bytes)?;
            self.epoch_mgr
                .epoch_proof_cache
                .insert(quorum.checkpoint.epoch, quorum);
        }

        self.exec
            .set_last_exec(self.exec.last_exec().max(self.chain.h));
        self.batch_mgr
            .set_seq_no(self.chain.h.max(max_batch_seq).max(self.exec.last_exec()));

        // The latest config batch may have executed without its checkpoint
        // stabilizing before the restart; re-check it.
        if let Some(latest) = self.store.latest_local_checkpoint() {
            if latest.checkpoint.need_update_epoch
                && latest.checkpoint.height() == self.exec.last_exec()
                && latest.checkpoint.height() > self.chain.h
            {
                info!(
                    height = latest.checkpoint.height(),
                    "latest config checkpoint may be non-stable, re-checking"
                );
                self.epoch_mgr.config_batch_to_check = Some(rbft_types::MetaState {
                    height: latest.checkpoint.height(),
                    digest: latest.checkpoint.digest(),
                });
            }
        }

        info!(
            h = self.chain.h,
            view = self.chain.view,
            batches = self.store.batch_store.len(),
            certs = self.store.cert_store.len(),
            checkpoints = self.store.local_checkpoints.len(),
            "state restored from storage"
        );
        Ok(())
    }
}

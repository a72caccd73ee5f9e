//! In-memory consensus log: certificates, batches, checkpoints, and the
//! state-transfer target.

use rbft_messages::{PrePrepare, QuorumCheckpoint, SignedCheckpoint, TraceContext};
use rbft_types::{Digest, MetaState, MsgId, ReplicaId, RequestBatch, SeqNo};
use std::collections::{BTreeMap, HashMap, HashSet};

/// The message set stored for one (view, sequence, digest) triple.
#[derive(Debug, Default, Clone)]
pub struct Certificate {
    /// At most one pre-prepare.
    pub pre_prepare: Option<PrePrepare>,
    /// Prepares sharing this cert's (v, n, d). The primary of v never
    /// stores a prepare it authored.
    pub prepares: HashSet<rbft_messages::Prepare>,
    /// Commits sharing this cert's (v, n, d).
    pub commits: HashSet<rbft_messages::Commit>,
    /// Whether this replica has sent its prepare.
    pub sent_prepare: bool,
    /// Whether this replica has sent its commit.
    pub sent_commit: bool,
    /// Whether the batch was submitted for execution.
    pub sent_execute: bool,
    /// Whether the batch is a configuration batch.
    pub is_config: bool,
    /// Trace context of the pre-prepare that created the cert.
    pub trace: TraceContext,
}

/// Target of a pending state transfer.
#[derive(Debug, Clone)]
pub struct StateUpdateTarget {
    /// Target (height, digest).
    pub meta_state: MetaState,
    /// Checkpoints proving the target.
    pub checkpoint_set: Vec<SignedCheckpoint>,
    /// Epoch-change proofs when the transfer crosses epochs.
    pub epoch_changes: Vec<QuorumCheckpoint>,
}

/// Exclusive owner of certificates, batches, and checkpoints.
#[derive(Debug)]
pub struct StoreManager<T> {
    /// Certificates by (v, n, d).
    pub cert_store: HashMap<MsgId, Certificate>,
    /// First digest observed per sequence in the current view; a second
    /// digest at the same sequence convicts the primary.
    pub seq_map: HashMap<SeqNo, Digest>,
    /// Certs that reached the committed predicate, awaiting execution.
    pub committed_cert: BTreeMap<MsgId, Digest>,
    /// Certs carried across a view change so committed entries can be
    /// replayed under the new view.
    pub committed_cert_cache: HashMap<MsgId, Certificate>,
    /// Batches by digest, retained roughly one checkpoint window past the
    /// low watermark.
    pub batch_store: HashMap<Digest, RequestBatch<T>>,
    /// Batches ordered but not yet executed; drives the request timer.
    pub outstanding_req_batches: HashMap<Digest, RequestBatch<T>>,
    /// Remote checkpoints by (author, sequence).
    pub checkpoint_store: HashMap<(ReplicaId, SeqNo), SignedCheckpoint>,
    /// This replica's own signed checkpoints by sequence.
    pub local_checkpoints: BTreeMap<SeqNo, SignedCheckpoint>,
    /// Last checkpoint seen above the window, per author.
    pub higher_checkpoints: HashMap<ReplicaId, SignedCheckpoint>,
    /// Outstanding missing-transaction fetches by batch digest.
    pub missing_batches_in_fetching: HashMap<Digest, MsgId>,
    /// Batch digests requested from the new primary during new-view
    /// assembly.
    pub missing_req_batches: HashSet<Digest>,
    /// Highest state-transfer target observed.
    pub high_state_target: Option<StateUpdateTarget>,
}

impl<T> Default for StoreManager<T> {
    fn default() -> Self {
        StoreManager {
            cert_store: HashMap::new(),
            seq_map: HashMap::new(),
            committed_cert: BTreeMap::new(),
            committed_cert_cache: HashMap::new(),
            batch_store: HashMap::new(),
            outstanding_req_batches: HashMap::new(),
            checkpoint_store: HashMap::new(),
            local_checkpoints: BTreeMap::new(),
            higher_checkpoints: HashMap::new(),
            missing_batches_in_fetching: HashMap::new(),
            missing_req_batches: HashSet::new(),
            high_state_target: None,
        }
    }
}

impl<T> StoreManager<T> {
    /// Empty store.
    pub fn new() -> StoreManager<T> {
        StoreManager::default()
    }

    /// Get or lazily create the certificate for `id`.
    pub fn get_cert(&mut self, id: MsgId) -> &mut Certificate {
        self.cert_store.entry(id).or_default()
    }

    /// Record a local checkpoint.
    pub fn save_checkpoint(&mut self, seq: SeqNo, checkpoint: SignedCheckpoint) {
        self.local_checkpoints.insert(seq, checkpoint);
    }

    /// The highest local checkpoint, if any.
    pub fn latest_local_checkpoint(&self) -> Option<&SignedCheckpoint> {
        self.local_checkpoints.values().next_back()
    }

    /// Drop committed-cert cache entries at or below the watermark.
    pub fn clean_committed_cert_cache(&mut self, h: SeqNo) {
        self.committed_cert_cache.retain(|id, _| id.n > h);
    }

    /// Clear outstanding batches and the committed index, keeping
    /// `batch_store` as the durable batch source.
    pub fn clean_outstanding_and_committed(&mut self) {
        self.outstanding_req_batches.clear();
        self.committed_cert.clear();
    }
}

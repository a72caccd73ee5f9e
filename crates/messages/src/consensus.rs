//! Consensus message payloads and the wire envelope.

use crate::{signing_hash, TraceContext};
use borsh::{BorshDeserialize, BorshSerialize};
use rbft_types::{Digest, Epoch, Hash, Height, ReplicaId, SeqNo, Signature, View};
use std::collections::BTreeMap;

/// The agreed batch digests per sequence installed at the start of a new
/// view. Ordered so its serialization is canonical.
pub type Xset = BTreeMap<SeqNo, Digest>;

/// Heartbeat sent by the primary when it has nothing to order.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NullRequest {
    /// Sending primary.
    pub replica_id: ReplicaId,
}

/// The hash-level view of a batch carried inside a pre-prepare.
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct HashBatch {
    /// Hashes of the batched transactions, in order.
    pub request_hashes: Vec<Hash>,
    /// Hashes of transactions that already appeared in an earlier view's
    /// batch during the same epoch; they are skipped at execution.
    pub deduplicate_request_hashes: Vec<Hash>,
    /// Batch creation timestamp (nanoseconds).
    pub timestamp: i64,
}

/// Phase one of the three-phase protocol, sent by the primary.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepare {
    /// View in which the batch is ordered.
    pub view: View,
    /// Sequence number assigned to the batch.
    pub seq_no: SeqNo,
    /// Digest over the hash batch.
    pub batch_digest: Digest,
    /// Request hashes and timestamp.
    pub hash_batch: HashBatch,
    /// The sending primary.
    pub replica_id: ReplicaId,
}

/// Phase two, sent by every backup that accepted the pre-prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    /// View of the cert.
    pub view: View,
    /// Sequence of the cert.
    pub seq_no: SeqNo,
    /// Digest of the cert.
    pub batch_digest: Digest,
    /// The sender.
    pub replica_id: ReplicaId,
}

/// Phase three, sent once the prepared predicate holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    /// View of the cert.
    pub view: View,
    /// Sequence of the cert.
    pub seq_no: SeqNo,
    /// Digest of the cert.
    pub batch_digest: Digest,
    /// The sender.
    pub replica_id: ReplicaId,
}

/// The execution state a checkpoint attests to.
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct ExecuteState {
    /// Executed height.
    pub height: Height,
    /// Execution state digest at that height.
    pub digest: Hash,
    /// Digest of the batch ordered at that height.
    pub batch_digest: Digest,
}

/// The body of a checkpoint attestation.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    /// Epoch the checkpoint was generated in.
    pub epoch: Epoch,
    /// Execution state it attests to.
    pub execute_state: ExecuteState,
    /// Whether this checkpoint finalizes a configuration batch and thus an
    /// epoch transition.
    pub need_update_epoch: bool,
    /// WRF-rotation attachment: a recovery view change carrying only the
    /// C-set. Informational for recovery; excluded from the canonical hash.
    pub view_change: Option<Box<ViewChange>>,
}

impl Checkpoint {
    /// Attested height.
    pub fn height(&self) -> Height {
        self.execute_state.height
    }

    /// Attested execution digest.
    pub fn digest(&self) -> Hash {
        self.execute_state.digest
    }

    /// The epoch that follows if this checkpoint finalizes an epoch change.
    pub fn next_epoch(&self) -> Epoch {
        if self.need_update_epoch {
            self.epoch + 1
        } else {
            self.epoch
        }
    }

    /// Canonical signing hash of the checkpoint.
    ///
    /// The `view_change` attachment is excluded so the same logical
    /// checkpoint hashes identically with and without the WRF attachment.
    pub fn hash(&self) -> Hash {
        #[derive(BorshSerialize)]
        struct Canonical<'a> {
            epoch: Epoch,
            execute_state: &'a ExecuteState,
            need_update_epoch: bool,
        }
        signing_hash(&Canonical {
            epoch: self.epoch,
            execute_state: &self.execute_state,
            need_update_epoch: self.need_update_epoch,
        })
    }
}

/// A checkpoint signed by its author.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedCheckpoint {
    /// The attesting replica.
    pub author: ReplicaId,
    /// The attestation body.
    pub checkpoint: Checkpoint,
    /// Signature over `checkpoint.hash()`.
    pub signature: Signature,
}

/// A checkpoint with a quorum of signatures, persisted per epoch as the
/// proof of the epoch transition.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QuorumCheckpoint {
    /// The agreed checkpoint body.
    pub checkpoint: Checkpoint,
    /// Signatures by author.
    pub signatures: BTreeMap<ReplicaId, Signature>,
}

impl QuorumCheckpoint {
    /// Expand into per-author signed checkpoints.
    pub fn signed_checkpoints(&self) -> Vec<SignedCheckpoint> {
        self.signatures
            .iter()
            .map(|(author, signature)| SignedCheckpoint {
                author: *author,
                checkpoint: self.checkpoint.clone(),
                signature: signature.clone(),
            })
            .collect()
    }
}

/// Request for the checkpoint at a given sequence, used while a replica is
/// waiting out a configuration-batch stabilization.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FetchCheckpoint {
    /// Requester's addressing identity.
    pub replica_host: String,
    /// Sequence of the wanted checkpoint.
    pub seq_no: SeqNo,
}

/// Request for transactions referenced by a pre-prepare but absent locally.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FetchMissingRequest {
    /// View of the pending cert.
    pub view: View,
    /// Sequence of the pending cert.
    pub seq_no: SeqNo,
    /// Digest of the pending cert.
    pub batch_digest: Digest,
    /// Missing hashes keyed by their index in the batch hash list.
    pub missing_request_hashes: BTreeMap<u64, Hash>,
    /// The requester.
    pub replica_id: ReplicaId,
}

/// Primary's answer to a [`FetchMissingRequest`].
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FetchMissingResponse {
    /// View of the pending cert.
    pub view: View,
    /// Sequence of the pending cert.
    pub seq_no: SeqNo,
    /// Digest of the pending cert.
    pub batch_digest: Digest,
    /// Echo of the requested hashes.
    pub missing_request_hashes: BTreeMap<u64, Hash>,
    /// Transaction bytes keyed by batch index.
    pub missing_requests: BTreeMap<u64, Vec<u8>>,
    /// The responding primary.
    pub replica_id: ReplicaId,
}

/// One prepared or pre-prepared entry carried in a view-change basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VcPq {
    /// Sequence of the entry.
    pub seq_no: SeqNo,
    /// Batch digest of the entry.
    pub batch_digest: Digest,
    /// Highest view in which the entry was observed.
    pub view: View,
}

/// The signed payload of a view change.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VcBasis {
    /// Target view.
    pub view: View,
    /// Sender's low watermark.
    pub h: Height,
    /// The sender.
    pub replica_id: ReplicaId,
    /// Prepared entries not below `h`, one per sequence.
    pub pset: Vec<VcPq>,
    /// Pre-prepared entries not below `h`, one per (digest, sequence).
    pub qset: Vec<VcPq>,
    /// Local signed checkpoints above `h`.
    pub cset: Vec<SignedCheckpoint>,
}

impl VcBasis {
    /// The hash signed by the sender.
    pub fn signing_hash(&self) -> Hash {
        signing_hash(self)
    }
}

/// A request to move the cluster to a higher view.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChange {
    /// The signed basis.
    pub basis: VcBasis,
    /// Signature over `basis.signing_hash()`.
    pub signature: Signature,
    /// Local receive timestamp (nanoseconds); not signed.
    pub timestamp: i64,
    /// Whether this view change was produced by the recovery path.
    pub recovery: bool,
}

/// New-view announcement by the primary of the target view.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewView {
    /// The installed view.
    pub view: View,
    /// Primary of the installed view.
    pub replica_id: ReplicaId,
    /// Batches surviving into the view, per sequence.
    pub xset: Xset,
    /// Set on the WRF rotation path, where the view advances without a
    /// view-change quorum.
    pub auto_term_update: bool,
    /// Signature over [`NewView::signing_hash`].
    pub signature: Signature,
    /// Actual signer when the attestation is relayed (WRF rotation);
    /// `replica_id` otherwise.
    pub from_id: Option<ReplicaId>,
}

impl NewView {
    /// The hash signed by the announcing replica.
    pub fn signing_hash(&self) -> Hash {
        #[derive(BorshSerialize)]
        struct Canonical<'a> {
            view: View,
            replica_id: ReplicaId,
            xset: &'a Xset,
            auto_term_update: bool,
        }
        signing_hash(&Canonical {
            view: self.view,
            replica_id: self.replica_id,
            xset: &self.xset,
            auto_term_update: self.auto_term_update,
        })
    }

    /// The replica whose signature must verify.
    pub fn signer(&self) -> ReplicaId {
        if self.auto_term_update {
            self.from_id.unwrap_or(self.replica_id)
        } else {
            self.replica_id
        }
    }
}

/// The view-change set backing a new view, broadcast by the new primary so
/// lagging replicas can validate the X-set.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QuorumViewChange {
    /// The sender.
    pub replica_id: ReplicaId,
    /// Target view of the set.
    pub view: View,
    /// The collected view changes.
    pub view_changes: Vec<ViewChange>,
}

/// A batch with serialized transactions, used when transferring batches
/// between replicas during new-view assembly.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WireBatch {
    /// Hashes of the batched transactions, in order.
    pub request_hashes: Vec<Hash>,
    /// Serialized transactions, aligned with `request_hashes`.
    pub requests: Vec<Vec<u8>>,
    /// Per-transaction local flags.
    pub local_flags: Vec<bool>,
    /// Batch creation timestamp.
    pub timestamp: i64,
    /// Sequence assigned to the batch.
    pub seq_no: SeqNo,
    /// Batch digest.
    pub batch_hash: Digest,
}

/// Request for a batch unknown to the replica but named in an X-set.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FetchBatchRequest {
    /// The requester.
    pub replica_id: ReplicaId,
    /// Digest of the wanted batch.
    pub batch_digest: Digest,
}

/// Answer to a [`FetchBatchRequest`].
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FetchBatchResponse {
    /// The responder.
    pub replica_id: ReplicaId,
    /// Digest of the carried batch.
    pub batch_digest: Digest,
    /// The batch.
    pub batch: WireBatch,
}

/// Request for an already-agreed new view, sent by a restarted replica.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FetchView {
    /// The requester.
    pub replica_id: ReplicaId,
    /// The view the requester believes is current.
    pub view: View,
}

/// Answer to a [`FetchView`]: the locally persisted new-view attestation.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RecoveryResponse {
    /// The responder.
    pub replica_id: ReplicaId,
    /// The responder's current view.
    pub view: View,
    /// The attestation installing that view, if persisted.
    pub new_view: Option<NewView>,
}

/// Request for pre-prepares/prepares/commits in `(h, h+L]`, sent after view
/// convergence to catch up entries missed while lagging.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FetchPqcRequest {
    /// The requester.
    pub replica_id: ReplicaId,
    /// Requester's low watermark.
    pub h: Height,
}

/// Answer to a [`FetchPqcRequest`]; entries are re-injected through the
/// normal-case handlers.
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct FetchPqcResponse {
    /// The responder.
    pub replica_id: ReplicaId,
    /// Pre-prepares above the requester's watermark.
    pub pre_prepares: Vec<PrePrepare>,
    /// Prepares above the requester's watermark.
    pub prepares: Vec<Prepare>,
    /// Commits above the requester's watermark.
    pub commits: Vec<Commit>,
}

/// Network-wide state probe.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SyncState {
    /// The probing replica.
    pub replica_id: ReplicaId,
}

/// Answer to a [`SyncState`] probe: the responder's view and its latest
/// signed checkpoint, which names the (height, digest) it stands on.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SyncStateResponse {
    /// The responder.
    pub replica_id: ReplicaId,
    /// Responder's current view.
    pub view: View,
    /// Responder's latest local signed checkpoint.
    pub signed_checkpoint: SignedCheckpoint,
}

/// Request for the epoch-change proofs from `start_epoch` (exclusive of the
/// requester's epoch) up to `target_epoch`.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EpochChangeRequest {
    /// The requester.
    pub replica_id: ReplicaId,
    /// The requester's epoch.
    pub start_epoch: Epoch,
    /// The epoch the requester wants to reach.
    pub target_epoch: Epoch,
}

/// A chain of quorum checkpoints proving successive epoch changes.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EpochChangeProof {
    /// The responder.
    pub author: ReplicaId,
    /// Quorum checkpoints, one per epoch change, in epoch order.
    pub epoch_changes: Vec<QuorumCheckpoint>,
    /// How many further epoch changes the responder knows beyond this proof.
    pub more: u64,
}

impl EpochChangeProof {
    /// The final checkpoint in the proof.
    pub fn last(&self) -> Option<&QuorumCheckpoint> {
        self.epoch_changes.last()
    }
}

/// Re-broadcast of locally originated transactions that outlived the
/// check-pool timer.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RebroadcastRequestSet {
    /// The sender.
    pub replica_id: ReplicaId,
    /// Serialized transactions.
    pub requests: Vec<Vec<u8>>,
}

/// The closed taxonomy of remote consensus messages.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    NullRequest(NullRequest),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    SignedCheckpoint(SignedCheckpoint),
    FetchCheckpoint(FetchCheckpoint),
    FetchMissingRequest(FetchMissingRequest),
    FetchMissingResponse(FetchMissingResponse),
    ViewChange(ViewChange),
    QuorumViewChange(QuorumViewChange),
    NewView(NewView),
    FetchView(FetchView),
    RecoveryResponse(RecoveryResponse),
    FetchBatchRequest(FetchBatchRequest),
    FetchBatchResponse(FetchBatchResponse),
    FetchPqcRequest(FetchPqcRequest),
    FetchPqcResponse(FetchPqcResponse),
    SyncState(SyncState),
    SyncStateResponse(SyncStateResponse),
    EpochChangeRequest(EpochChangeRequest),
    EpochChangeProof(EpochChangeProof),
    RebroadcastRequestSet(RebroadcastRequestSet),
}

impl ConsensusMessage {
    /// Message type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::NullRequest(_) => "NullRequest",
            ConsensusMessage::PrePrepare(_) => "PrePrepare",
            ConsensusMessage::Prepare(_) => "Prepare",
            ConsensusMessage::Commit(_) => "Commit",
            ConsensusMessage::SignedCheckpoint(_) => "SignedCheckpoint",
            ConsensusMessage::FetchCheckpoint(_) => "FetchCheckpoint",
            ConsensusMessage::FetchMissingRequest(_) => "FetchMissingRequest",
            ConsensusMessage::FetchMissingResponse(_) => "FetchMissingResponse",
            ConsensusMessage::ViewChange(_) => "ViewChange",
            ConsensusMessage::QuorumViewChange(_) => "QuorumViewChange",
            ConsensusMessage::NewView(_) => "NewView",
            ConsensusMessage::FetchView(_) => "FetchView",
            ConsensusMessage::RecoveryResponse(_) => "RecoveryResponse",
            ConsensusMessage::FetchBatchRequest(_) => "FetchBatchRequest",
            ConsensusMessage::FetchBatchResponse(_) => "FetchBatchResponse",
            ConsensusMessage::FetchPqcRequest(_) => "FetchPqcRequest",
            ConsensusMessage::FetchPqcResponse(_) => "FetchPqcResponse",
            ConsensusMessage::SyncState(_) => "SyncState",
            ConsensusMessage::SyncStateResponse(_) => "SyncStateResponse",
            ConsensusMessage::EpochChangeRequest(_) => "EpochChangeRequest",
            ConsensusMessage::EpochChangeProof(_) => "EpochChangeProof",
            ConsensusMessage::RebroadcastRequestSet(_) => "RebroadcastRequestSet",
        }
    }
}

/// The wire wrapper around every consensus message.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    /// Sender's epoch at send time.
    pub epoch: Epoch,
    /// The sending replica.
    pub from: ReplicaId,
    /// Distributed-tracing carrier.
    pub trace: TraceContext,
    /// The message.
    pub msg: ConsensusMessage,
}

impl Envelope {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("borsh serialization of wire envelope")
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> std::io::Result<Envelope> {
        Envelope::try_from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pre_prepare() -> PrePrepare {
        let hashes = vec![Hash::digest(b"tx1"), Hash::digest(b"tx2")];
        PrePrepare {
            view: 3,
            seq_no: 17,
            batch_digest: Digest::of_batch(&hashes, 1234),
            hash_batch: HashBatch {
                request_hashes: hashes,
                deduplicate_request_hashes: vec![],
                timestamp: 1234,
            },
            replica_id: ReplicaId(1),
        }
    }

    #[test]
    fn envelope_round_trip() {
        let env = Envelope {
            epoch: 5,
            from: ReplicaId(2),
            trace: TraceContext::default(),
            msg: ConsensusMessage::PrePrepare(sample_pre_prepare()),
        };
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn fetch_missing_round_trip_preserves_empty_maps() {
        let req = FetchMissingRequest {
            view: 0,
            seq_no: 2,
            batch_digest: Digest::EMPTY,
            missing_request_hashes: BTreeMap::new(),
            replica_id: ReplicaId(3),
        };
        let env = Envelope {
            epoch: 1,
            from: ReplicaId(3),
            trace: TraceContext::default(),
            msg: ConsensusMessage::FetchMissingRequest(req.clone()),
        };
        let decoded = Envelope::decode(&env.encode()).unwrap();
        match decoded.msg {
            ConsensusMessage::FetchMissingRequest(got) => {
                assert_eq!(got, req);
                assert!(got.missing_request_hashes.is_empty());
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn checkpoint_hash_ignores_attachment() {
        let base = Checkpoint {
            epoch: 2,
            execute_state: ExecuteState {
                height: 10,
                digest: Hash::digest(b"state"),
                batch_digest: Digest::EMPTY,
            },
            need_update_epoch: false,
            view_change: None,
        };
        let mut with_attachment = base.clone();
        with_attachment.view_change = Some(Box::new(ViewChange {
            basis: VcBasis {
                view: 4,
                h: 10,
                replica_id: ReplicaId(1),
                pset: vec![],
                qset: vec![],
                cset: vec![],
            },
            signature: Signature(vec![1, 2, 3]),
            timestamp: 0,
            recovery: true,
        }));
        assert_eq!(base.hash(), with_attachment.hash());
    }

    #[test]
    fn new_view_signing_hash_covers_xset() {
        let mut nv = NewView {
            view: 1,
            replica_id: ReplicaId(2),
            xset: Xset::new(),
            auto_term_update: false,
            signature: Signature::default(),
            from_id: None,
        };
        let empty = nv.signing_hash();
        nv.xset.insert(1, Digest::of_batch(&[Hash::digest(b"t")], 1));
        assert_ne!(empty, nv.signing_hash());
    }
}

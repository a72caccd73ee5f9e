//! Request batches.

use crate::{Digest, Hash, SeqNo};
use borsh::{BorshDeserialize, BorshSerialize};

/// A transaction orderable by this kernel.
///
/// The kernel is agnostic to transaction content; it only needs a stable
/// content hash and a deterministic encoding for the missing-transaction
/// fetch sub-protocol.
pub trait Transaction:
    BorshSerialize + BorshDeserialize + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Stable content hash of the transaction.
    fn tx_hash(&self) -> Hash;
}

/// A set of transactions posted into the core, either from the local API
/// layer or relayed from another replica.
#[derive(Debug, Clone)]
pub struct RequestSet<T> {
    /// The transactions.
    pub requests: Vec<T>,
    /// Whether the set originated on this replica.
    pub local: bool,
}

/// An ordered set of transactions assigned a single sequence number and
/// digest.
///
/// Created by the primary from the mempool; backups accept it verbatim after
/// reconstructing the transaction list from the request-hash list.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestBatch<T> {
    /// Hashes of the batched transactions, in order.
    pub request_hashes: Vec<Hash>,
    /// The batched transactions, aligned with `request_hashes`.
    pub requests: Vec<T>,
    /// Per-transaction flag: whether the tx was received locally.
    pub local_flags: Vec<bool>,
    /// Batch creation timestamp (nanoseconds).
    pub timestamp: i64,
    /// Sequence number assigned by the primary.
    pub seq_no: SeqNo,
    /// Digest over `request_hashes` and `timestamp`.
    pub batch_hash: Digest,
}

impl<T: Transaction> RequestBatch<T> {
    /// Recompute the digest from the batch contents.
    pub fn compute_digest(&self) -> Digest {
        Digest::of_batch(&self.request_hashes, self.timestamp)
    }

    /// Check the digest invariant `batch_hash == H(request_hashes, timestamp)`.
    pub fn digest_matches(&self) -> bool {
        self.batch_hash == self.compute_digest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
    struct TestTx(u64);

    impl Transaction for TestTx {
        fn tx_hash(&self) -> Hash {
            Hash::digest(&self.0.to_le_bytes())
        }
    }

    #[test]
    fn digest_invariant() {
        let txs = vec![TestTx(1), TestTx(2)];
        let hashes: Vec<Hash> = txs.iter().map(|t| t.tx_hash()).collect();
        let mut batch = RequestBatch {
            batch_hash: Digest::of_batch(&hashes, 99),
            request_hashes: hashes,
            requests: txs,
            local_flags: vec![true, false],
            timestamp: 99,
            seq_no: 1,
        };
        assert!(batch.digest_matches());

        batch.timestamp = 100;
        assert!(!batch.digest_matches());
    }
}

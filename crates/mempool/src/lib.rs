//! Request pool for the RBFT ordering kernel.
//!
//! The pool is ordering-agnostic: it stores transactions, cuts batches for
//! the primary, resolves a batch's hash list back into transactions for the
//! backups, and serves the missing-transaction fetch sub-protocol. The
//! consensus core owns the pool; all access is serialized through the core's
//! event loop.

mod pool;

pub use pool::{MemPool, MemPoolConfig};

use rbft_types::{Digest, Hash, RequestBatch, Transaction};
use std::collections::BTreeMap;

/// Errors surfaced by a request pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A batch digest is unknown to the pool.
    #[error("batch {0} not found in pool")]
    BatchNotFound(Digest),
    /// A transaction named by a batch is not in the pool.
    #[error("transaction {0} not found in pool")]
    TxNotFound(Hash),
    /// A fetched transaction does not hash to the value the batch claims.
    #[error("transaction at index {index} hashes to {got}, batch claims {want}")]
    HashMismatch {
        /// Index in the batch hash list.
        index: u64,
        /// Hash of the received transaction.
        got: Hash,
        /// Hash the batch claims at that index.
        want: Hash,
    },
}

/// Result of resolving a pre-prepare's hash list against the pool.
#[derive(Debug)]
pub enum BatchResolution<T> {
    /// All referenced transactions are available; the batch was constructed
    /// and its transactions marked batched.
    Complete(RequestBatch<T>),
    /// Some transactions are absent, keyed by their index in the hash list.
    Missing(BTreeMap<u64, Hash>),
}

/// The transaction pool surface consumed by the consensus core.
pub trait RequestPool<T: Transaction>: Send {
    /// Set the pool's notion of now (nanoseconds). Batches cut afterwards
    /// carry this timestamp.
    fn set_time(&mut self, now_ns: i64);

    /// Insert transactions. With `generate_batch` set (primary in normal
    /// operation), full batches may be cut and returned. The second return
    /// lists batch digests whose missing transactions became complete.
    fn add_new_requests(
        &mut self,
        txs: Vec<T>,
        generate_batch: bool,
        local: bool,
    ) -> (Vec<RequestBatch<T>>, Vec<Digest>);

    /// Cut a batch from whatever is pending, full or not. Used on batch
    /// timer expiry and for timed empty batches.
    fn generate_request_batch(&mut self) -> Vec<RequestBatch<T>>;

    /// Resolve a pre-prepare's hash list. On success the batch is recorded
    /// and its transactions are marked batched; absent transactions are
    /// recorded as missing for this digest.
    fn get_requests_by_hash_list(
        &mut self,
        batch_digest: Digest,
        timestamp: i64,
        seq_no: u64,
        hashes: &[Hash],
    ) -> Result<BatchResolution<T>, PoolError>;

    /// Primary side of fetch-missing: look up the requested transactions.
    fn send_missing_requests(
        &self,
        batch_digest: Digest,
        missing: &BTreeMap<u64, Hash>,
    ) -> Result<BTreeMap<u64, T>, PoolError>;

    /// Backup side of fetch-missing: install fetched transactions after
    /// verifying each hashes to the value the batch claims.
    fn receive_missing_requests(
        &mut self,
        batch_digest: Digest,
        txs: BTreeMap<u64, T>,
    ) -> Result<(), PoolError>;

    /// Put one batch's transactions back to pending (a backup saw the batch
    /// but consensus will not order it under this digest).
    fn restore_one_batch(&mut self, batch_digest: &Digest) -> Result<(), PoolError>;

    /// Drop batches (and their transactions) that fell behind a stable
    /// checkpoint.
    fn remove_batches(&mut self, digests: &[Digest]);

    /// Put every batched transaction back to pending, dropping batch
    /// bookkeeping. Used when a new view re-arranges ordering.
    fn restore_pool(&mut self);

    /// Drop everything except the named batches. Used after state transfer.
    fn reset(&mut self, save_batches: &[Digest]);

    /// Remove and return locally originated transactions that have waited
    /// longer than the rebroadcast tolerance.
    fn filter_out_of_date_requests(&mut self) -> Vec<T>;

    /// Evict transactions older than the removal tolerance; returns how
    /// many were dropped.
    fn remove_timeout_requests(&mut self) -> u64;

    /// Whether any non-batched transaction is pending.
    fn has_pending_requests(&self) -> bool;

    /// Whether the pool is at capacity.
    fn is_full(&self) -> bool;

    /// Number of transactions in the pool.
    fn pending_count(&self) -> u64;

    /// Look up a pooled transaction by hash.
    fn get_pending_tx_by_hash(&self, hash: &Hash) -> Option<T>;
}

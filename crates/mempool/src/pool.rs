//! In-memory request pool.

use crate::{BatchResolution, PoolError, RequestPool};
use rbft_types::{Digest, Hash, RequestBatch, Transaction};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Pool sizing and timing knobs.
#[derive(Debug, Clone)]
pub struct MemPoolConfig {
    /// Max transactions per generated batch.
    pub batch_size: usize,
    /// Max transactions held in the pool.
    pub pool_size: usize,
    /// Age after which a local transaction is rebroadcast (nanoseconds).
    pub tolerance_ns: i64,
    /// Age after which a transaction is evicted (nanoseconds).
    pub tolerance_remove_ns: i64,
}

impl Default for MemPoolConfig {
    fn default() -> Self {
        MemPoolConfig {
            batch_size: 500,
            pool_size: 50_000,
            tolerance_ns: 60 * 1_000_000_000,
            tolerance_remove_ns: 15 * 60 * 1_000_000_000,
        }
    }
}

#[derive(Debug)]
struct PoolEntry<T> {
    tx: T,
    local: bool,
    batched: bool,
    added_at_ns: i64,
}

#[derive(Debug)]
struct BatchMeta {
    hashes: Vec<Hash>,
    local_flags: Vec<bool>,
    timestamp: i64,
    seq_no: u64,
}

/// `HashMap`-backed [`RequestPool`]. Access is serialized by the core's
/// event loop, so plain maps suffice.
pub struct MemPool<T> {
    config: MemPoolConfig,
    entries: HashMap<Hash, PoolEntry<T>>,
    /// Insertion order of non-batched transactions.
    order: Vec<Hash>,
    /// Constructed batches by digest.
    batches: HashMap<Digest, BatchMeta>,
    /// Hash lists of batches waiting for fetched transactions.
    missing: HashMap<Digest, MissingBatch>,
    now_ns: i64,
}

#[derive(Debug)]
struct MissingBatch {
    hashes: Vec<Hash>,
    local_flags: Vec<bool>,
    timestamp: i64,
    seq_no: u64,
    absent: BTreeMap<u64, Hash>,
}

impl<T: Transaction> MemPool<T> {
    /// Create an empty pool.
    pub fn new(config: MemPoolConfig) -> MemPool<T> {
        MemPool {
            config,
            entries: HashMap::new(),
            order: Vec::new(),
            batches: HashMap::new(),
            missing: HashMap::new(),
            now_ns: 0,
        }
    }

    fn insert_entry(&mut self, tx: T, local: bool) -> bool {
        let hash = tx.tx_hash();
        if self.entries.contains_key(&hash) {
            return false;
        }
        self.entries.insert(
            hash,
            PoolEntry {
                tx,
                local,
                batched: false,
                added_at_ns: self.now_ns,
            },
        );
        self.order.push(hash);
        true
    }

    /// Cut one batch of up to `batch_size` pending transactions.
    fn cut_batch(&mut self) -> Option<RequestBatch<T>> {
        let mut hashes = Vec::new();
        for hash in &self.order {
            if let Some(entry) = self.entries.get(hash) {
                if !entry.batched {
                    hashes.push(*hash);
                    if hashes.len() == self.config.batch_size {
                        break;
                    }
                }
            }
        }
        if hashes.is_empty() {
            return None;
        }

        let timestamp = self.now_ns;
        let mut requests = Vec::with_capacity(hashes.len());
        let mut local_flags = Vec::with_capacity(hashes.len());
        for hash in &hashes {
            let entry = self.entries.get_mut(hash)?;
            entry.batched = true;
            requests.push(entry.tx.clone());
            local_flags.push(entry.local);
        }

        let batch_hash = Digest::of_batch(&hashes, timestamp);
        self.batches.insert(
            batch_hash,
            BatchMeta {
                hashes: hashes.clone(),
                local_flags: local_flags.clone(),
                timestamp,
                seq_no: 0,
            },
        );

        Some(RequestBatch {
            request_hashes: hashes,
            requests,
            local_flags,
            timestamp,
            seq_no: 0,
            batch_hash,
        })
    }

    fn compact_order(&mut self) {
        self.order.retain(|h| self.entries.contains_key(h));
    }

    /// Check whether a missing batch became complete; returns its digest if
    /// all transactions are now present.
    fn try_complete_missing(&mut self, digest: Digest) -> bool {
        let Some(record) = self.missing.get_mut(&digest) else {
            return false;
        };
        record
            .absent
            .retain(|_, hash| !self.entries.contains_key(hash));
        if !record.absent.is_empty() {
            return false;
        }
        let record = self.missing.remove(&digest).expect("record just observed");
        for hash in &record.hashes {
            if let Some(entry) = self.entries.get_mut(hash) {
                entry.batched = true;
            }
        }
        self.batches.insert(
            digest,
            BatchMeta {
                hashes: record.hashes,
                local_flags: record.local_flags,
                timestamp: record.timestamp,
                seq_no: record.seq_no,
            },
        );
        true
    }
}

impl<T: Transaction> RequestPool<T> for MemPool<T> {
    fn set_time(&mut self, now_ns: i64) {
        self.now_ns = now_ns;
    }

    fn add_new_requests(
        &mut self,
        txs: Vec<T>,
        generate_batch: bool,
        local: bool,
    ) -> (Vec<RequestBatch<T>>, Vec<Digest>) {
        let mut inserted = 0usize;
        for tx in txs {
            if self.entries.len() >= self.config.pool_size {
                warn!(pool_size = self.config.pool_size, "pool full, dropping tx");
                break;
            }
            if self.insert_entry(tx, local) {
                inserted += 1;
            }
        }
        debug!(inserted, pool = self.entries.len(), "added requests");

        // Any arrival may complete a batch waiting on fetched transactions.
        let waiting: Vec<Digest> = self.missing.keys().copied().collect();
        let mut completed = Vec::new();
        for digest in waiting {
            if self.try_complete_missing(digest) {
                completed.push(digest);
            }
        }

        let mut batches = Vec::new();
        if generate_batch {
            while self
                .entries
                .values()
                .filter(|entry| !entry.batched)
                .count()
                >= self.config.batch_size
            {
                match self.cut_batch() {
                    Some(batch) => batches.push(batch),
                    None => break,
                }
            }
        }
        (batches, completed)
    }

    fn generate_request_batch(&mut self) -> Vec<RequestBatch<T>> {
        match self.cut_batch() {
            Some(batch) => vec![batch],
            None => Vec::new(),
        }
    }

    fn get_requests_by_hash_list(
        &mut self,
        batch_digest: Digest,
        timestamp: i64,
        seq_no: u64,
        hashes: &[Hash],
    ) -> Result<BatchResolution<T>, PoolError> {
        // A batch resolved earlier (or filled in via fetch-missing) is
        // served from the batch store.
        if let Some(meta) = self.batches.get(&batch_digest) {
            let mut requests = Vec::with_capacity(meta.hashes.len());
            for hash in &meta.hashes {
                let entry = self
                    .entries
                    .get(hash)
                    .ok_or(PoolError::TxNotFound(*hash))?;
                requests.push(entry.tx.clone());
            }
            return Ok(BatchResolution::Complete(RequestBatch {
                request_hashes: meta.hashes.clone(),
                requests,
                local_flags: meta.local_flags.clone(),
                timestamp: meta.timestamp,
                seq_no: meta.seq_no,
                batch_hash: batch_digest,
            }));
        }

        let mut absent = BTreeMap::new();
        for (i, hash) in hashes.iter().enumerate() {
            if !self.entries.contains_key(hash) {
                absent.insert(i as u64, *hash);
            }
        }
        if !absent.is_empty() {
            let mut local_flags = Vec::with_capacity(hashes.len());
            for hash in hashes {
                local_flags.push(
                    self.entries
                        .get(hash)
                        .map(|entry| entry.local)
                        .unwrap_or(false),
                );
            }
            self.missing.insert(
                batch_digest,
                MissingBatch {
                    hashes: hashes.to_vec(),
                    local_flags,
                    timestamp,
                    seq_no,
                    absent: absent.clone(),
                },
            );
            return Ok(BatchResolution::Missing(absent));
        }

        let mut requests = Vec::with_capacity(hashes.len());
        let mut local_flags = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let entry = self
                .entries
                .get_mut(hash)
                .ok_or(PoolError::TxNotFound(*hash))?;
            entry.batched = true;
            requests.push(entry.tx.clone());
            local_flags.push(entry.local);
        }
        self.batches.insert(
            batch_digest,
            BatchMeta {
                hashes: hashes.to_vec(),
                local_flags: local_flags.clone(),
                timestamp,
                seq_no,
            },
        );
        Ok(BatchResolution::Complete(RequestBatch {
            request_hashes: hashes.to_vec(),
            requests,
            local_flags,
            timestamp,
            seq_no,
            batch_hash: batch_digest,
        }))
    }

    fn send_missing_requests(
        &self,
        batch_digest: Digest,
        missing: &BTreeMap<u64, Hash>,
    ) -> Result<BTreeMap<u64, T>, PoolError> {
        let meta = self
            .batches
            .get(&batch_digest)
            .ok_or(PoolError::BatchNotFound(batch_digest))?;
        let mut out = BTreeMap::new();
        for (&index, hash) in missing {
            let claimed = meta
                .hashes
                .get(index as usize)
                .ok_or(PoolError::TxNotFound(*hash))?;
            if claimed != hash {
                return Err(PoolError::HashMismatch {
                    index,
                    got: *hash,
                    want: *claimed,
                });
            }
            let entry = self
                .entries
                .get(hash)
                .ok_or(PoolError::TxNotFound(*hash))?;
            out.insert(index, entry.tx.clone());
        }
        Ok(out)
    }

    fn receive_missing_requests(
        &mut self,
        batch_digest: Digest,
        txs: BTreeMap<u64, T>,
    ) -> Result<(), PoolError> {
        let record = self
            .missing
            .get(&batch_digest)
            .ok_or(PoolError::BatchNotFound(batch_digest))?;
        // Every received transaction must hash to the value the batch
        // claims at its index; one mismatch convicts the sender.
        for (&index, tx) in &txs {
            let want = record
                .absent
                .get(&index)
                .copied()
                .ok_or(PoolError::TxNotFound(tx.tx_hash()))?;
            let got = tx.tx_hash();
            if got != want {
                return Err(PoolError::HashMismatch { index, got, want });
            }
        }
        for (_, tx) in txs {
            self.insert_entry(tx, false);
        }
        self.try_complete_missing(batch_digest);
        Ok(())
    }

    fn restore_one_batch(&mut self, batch_digest: &Digest) -> Result<(), PoolError> {
        let meta = self
            .batches
            .remove(batch_digest)
            .ok_or(PoolError::BatchNotFound(*batch_digest))?;
        for hash in &meta.hashes {
            if let Some(entry) = self.entries.get_mut(hash) {
                entry.batched = false;
            }
        }
        Ok(())
    }

    fn remove_batches(&mut self, digests: &[Digest]) {
        for digest in digests {
            if let Some(meta) = self.batches.remove(digest) {
                for hash in meta.hashes {
                    self.entries.remove(&hash);
                }
            }
            self.missing.remove(digest);
        }
        self.compact_order();
    }

    fn restore_pool(&mut self) {
        for entry in self.entries.values_mut() {
            entry.batched = false;
        }
        self.batches.clear();
        self.missing.clear();
    }

    fn reset(&mut self, save_batches: &[Digest]) {
        let keep: Vec<(Digest, BatchMeta)> = save_batches
            .iter()
            .filter_map(|d| self.batches.remove(d).map(|meta| (*d, meta)))
            .collect();
        let mut kept_entries = HashMap::new();
        for (digest, meta) in &keep {
            debug!(digest = %digest, "keeping batch across reset");
            for hash in &meta.hashes {
                if let Some(entry) = self.entries.remove(hash) {
                    kept_entries.insert(*hash, entry);
                }
            }
        }
        self.entries = kept_entries;
        self.batches.clear();
        self.missing.clear();
        for (digest, meta) in keep {
            self.batches.insert(digest, meta);
        }
        self.compact_order();
    }

    fn filter_out_of_date_requests(&mut self) -> Vec<T> {
        let cutoff = self.now_ns - self.config.tolerance_ns;
        let mut out = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.local && !entry.batched && entry.added_at_ns < cutoff {
                entry.added_at_ns = self.now_ns;
                out.push(entry.tx.clone());
            }
        }
        out
    }

    fn remove_timeout_requests(&mut self) -> u64 {
        let cutoff = self.now_ns - self.config.tolerance_remove_ns;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.batched || entry.added_at_ns >= cutoff);
        self.compact_order();
        (before - self.entries.len()) as u64
    }

    fn has_pending_requests(&self) -> bool {
        self.entries.values().any(|entry| !entry.batched)
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.config.pool_size
    }

    fn pending_count(&self) -> u64 {
        self.entries.len() as u64
    }

    fn get_pending_tx_by_hash(&self, hash: &Hash) -> Option<T> {
        self.entries.get(hash).map(|entry| entry.tx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use borsh::{BorshDeserialize, BorshSerialize};
    use tracing_test::traced_test;

    #[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
    struct TestTx(u64);

    impl Transaction for TestTx {
        fn tx_hash(&self) -> Hash {
            Hash::digest(&self.0.to_le_bytes())
        }
    }

    fn small_pool() -> MemPool<TestTx> {
        MemPool::new(MemPoolConfig {
            batch_size: 2,
            pool_size: 8,
            tolerance_ns: 100,
            tolerance_remove_ns: 1000,
        })
    }

    #[traced_test]
    #[test]
    fn batch_cut_when_full() {
        let mut pool = small_pool();
        pool.set_time(1);
        let (batches, _) = pool.add_new_requests(vec![TestTx(1)], true, true);
        assert!(batches.is_empty());
        let (batches, _) = pool.add_new_requests(vec![TestTx(2)], true, true);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].requests.len(), 2);
        assert!(batches[0].digest_matches());
        assert!(!pool.has_pending_requests());
    }

    #[traced_test]
    #[test]
    fn resolve_hash_list_complete_and_missing() {
        let mut pool = small_pool();
        pool.set_time(5);
        pool.add_new_requests(vec![TestTx(1)], false, false);

        let present = TestTx(1).tx_hash();
        let absent = TestTx(9).tx_hash();
        let digest = Digest::of_batch(&[present, absent], 5);

        match pool
            .get_requests_by_hash_list(digest, 5, 3, &[present, absent])
            .unwrap()
        {
            BatchResolution::Missing(m) => {
                assert_eq!(m.len(), 1);
                assert_eq!(m[&1], absent);
            }
            other => panic!("expected missing, got {:?}", other),
        }

        // Arrival of the absent tx completes the batch.
        let (_, completed) = pool.add_new_requests(vec![TestTx(9)], false, false);
        assert_eq!(completed, vec![digest]);

        match pool
            .get_requests_by_hash_list(digest, 5, 3, &[present, absent])
            .unwrap()
        {
            BatchResolution::Complete(batch) => {
                assert_eq!(batch.requests, vec![TestTx(1), TestTx(9)]);
                assert_eq!(batch.seq_no, 3);
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[traced_test]
    #[test]
    fn receive_missing_rejects_wrong_hash() {
        let mut pool = small_pool();
        pool.set_time(5);
        let absent = TestTx(9).tx_hash();
        let digest = Digest::of_batch(&[absent], 5);
        pool.get_requests_by_hash_list(digest, 5, 1, &[absent])
            .unwrap();

        let mut wrong = BTreeMap::new();
        wrong.insert(0u64, TestTx(8));
        assert!(matches!(
            pool.receive_missing_requests(digest, wrong),
            Err(PoolError::HashMismatch { .. })
        ));

        let mut right = BTreeMap::new();
        right.insert(0u64, TestTx(9));
        pool.receive_missing_requests(digest, right).unwrap();
        assert!(matches!(
            pool.get_requests_by_hash_list(digest, 5, 1, &[absent]),
            Ok(BatchResolution::Complete(_))
        ));
    }

    #[traced_test]
    #[test]
    fn restore_pool_unbatches_everything() {
        let mut pool = small_pool();
        pool.set_time(1);
        pool.add_new_requests(vec![TestTx(1), TestTx(2)], true, true);
        assert!(!pool.has_pending_requests());
        pool.restore_pool();
        assert!(pool.has_pending_requests());
        assert_eq!(pool.pending_count(), 2);
    }

    #[traced_test]
    #[test]
    fn remove_batches_drops_transactions() {
        let mut pool = small_pool();
        pool.set_time(1);
        let (batches, _) = pool.add_new_requests(vec![TestTx(1), TestTx(2)], true, true);
        let digest = batches[0].batch_hash;
        pool.remove_batches(&[digest]);
        assert_eq!(pool.pending_count(), 0);
    }

    #[traced_test]
    #[test]
    fn out_of_date_rebroadcast_and_eviction() {
        let mut pool = small_pool();
        pool.set_time(0);
        pool.add_new_requests(vec![TestTx(1)], false, true);
        pool.add_new_requests(vec![TestTx(2)], false, false);

        pool.set_time(200);
        let stale = pool.filter_out_of_date_requests();
        // Only the local transaction is rebroadcast.
        assert_eq!(stale, vec![TestTx(1)]);

        pool.set_time(1500);
        let removed = pool.remove_timeout_requests();
        assert_eq!(removed, 2);
        assert_eq!(pool.pending_count(), 0);
    }

    #[traced_test]
    #[test]
    fn pool_full_rejects() {
        let mut pool = small_pool();
        pool.set_time(1);
        let txs: Vec<TestTx> = (0..10).map(TestTx).collect();
        pool.add_new_requests(txs, false, false);
        assert!(pool.is_full());
        assert_eq!(pool.pending_count(), 8);
    }
}

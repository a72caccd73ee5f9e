//! Primary-side batch bookkeeping.

use rbft_types::{RequestBatch, SeqNo};

/// Tracks the primary's sequence assignment and batches waiting for the
/// watermark window to open.
#[derive(Debug)]
pub struct BatchManager<T> {
    /// Highest sequence this replica has assigned or adopted.
    seq_no: SeqNo,
    /// Batches generated while the window was closed, in arrival order.
    pub cache_batch: Vec<RequestBatch<T>>,
    /// Whether the batch timer is armed.
    pub batch_timer_active: bool,
    /// Whether the empty-batch timer is armed.
    pub no_tx_batch_timer_active: bool,
    /// Timestamp of the last generated batch (nanoseconds).
    pub last_batch_time: i64,
}

impl<T> Default for BatchManager<T> {
    fn default() -> Self {
        BatchManager {
            seq_no: 0,
            cache_batch: Vec::new(),
            batch_timer_active: false,
            no_tx_batch_timer_active: false,
            last_batch_time: 0,
        }
    }
}

impl<T> BatchManager<T> {
    /// Fresh manager.
    pub fn new() -> BatchManager<T> {
        BatchManager::default()
    }

    /// Current sequence.
    pub fn seq_no(&self) -> SeqNo {
        self.seq_no
    }

    /// Adopt a sequence (after sending a pre-prepare, a stable checkpoint
    /// in WRF mode, or a state transfer).
    pub fn set_seq_no(&mut self, seq: SeqNo) {
        self.seq_no = seq;
    }
}

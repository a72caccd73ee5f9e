//! Execution progress tracking.

use rbft_types::{Height, SeqNo};

/// Tracks the last sequence submitted for execution. Execution order is
/// strictly by sequence, gap-free.
#[derive(Debug, Default)]
pub struct ExecTracker {
    last_exec: SeqNo,
}

impl ExecTracker {
    /// Start from the application's applied height.
    pub fn new(applied: Height) -> ExecTracker {
        ExecTracker { last_exec: applied }
    }

    /// Last executed sequence.
    pub fn last_exec(&self) -> SeqNo {
        self.last_exec
    }

    /// Record an executed sequence.
    pub fn set_last_exec(&mut self, n: SeqNo) {
        self.last_exec = n;
    }
}

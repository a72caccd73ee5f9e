//! Replica lifecycle status register.
//!
//! A bit set capturing both the externally reported lifecycle (view change,
//! recovery, state transfer, config change, pending) and internal phases
//! (sync state, skip-in-progress, epoch syncing). The original register
//! splits atomic and plain bits for cross-thread reads; access here is
//! serialized by the event loop, so one plain set suffices.

use rbft_types::StatusType;

/// Individual status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusBit {
    /// Normal three-phase operation.
    Normal = 0,
    /// Ordering a configuration batch.
    InConfChange = 1,
    /// View change in progress.
    InViewChange = 2,
    /// Recovery in progress.
    InRecovery = 3,
    /// State transfer in progress.
    StateTransferring = 4,
    /// Not started, or restarted and not yet recovered.
    Pending = 5,
    /// Stopped for good.
    Stopped = 6,
    /// Fatal inconsistency observed.
    Inconsistent = 7,
    /// Sync-state probe outstanding.
    InSyncState = 8,
    /// Waiting for a state-transfer starting point.
    SkipInProgress = 9,
    /// Blocking consensus until an epoch sync completes.
    InEpochSyncing = 10,
    /// Request pool is at capacity.
    PoolFull = 11,
}

/// The status register.
#[derive(Debug, Default, Clone)]
pub struct StatusFlags {
    bits: u32,
}

impl StatusFlags {
    /// All bits cleared.
    pub fn new() -> StatusFlags {
        StatusFlags::default()
    }

    /// Clear every bit.
    pub fn reset(&mut self) {
        self.bits = 0;
    }

    /// Set a bit.
    pub fn on(&mut self, bit: StatusBit) {
        self.bits |= 1 << (bit as u32);
    }

    /// Clear a bit.
    pub fn off(&mut self, bit: StatusBit) {
        self.bits &= !(1 << (bit as u32));
    }

    /// Whether a bit is set.
    pub fn is(&self, bit: StatusBit) -> bool {
        self.bits & (1 << (bit as u32)) != 0
    }

    /// Whether any of the given bits is set.
    pub fn in_one(&self, bits: &[StatusBit]) -> bool {
        bits.iter().any(|b| self.is(*b))
    }

    /// Whether the replica is in normal operation.
    pub fn is_normal(&self) -> bool {
        self.is(StatusBit::Normal)
    }

    /// The single lifecycle status reported externally. Abnormal bits take
    /// precedence; `Normal` is reported only when none is set.
    pub fn report(&self, pool_full: bool) -> StatusType {
        if self.is(StatusBit::Inconsistent) {
            StatusType::Inconsistent
        } else if self.is(StatusBit::Stopped) {
            StatusType::Stopped
        } else if self.is(StatusBit::InConfChange) || self.is(StatusBit::InEpochSyncing) {
            StatusType::InConfChange
        } else if self.is(StatusBit::InRecovery) {
            StatusType::InRecovery
        } else if self.is(StatusBit::InViewChange) {
            StatusType::InViewChange
        } else if self.is(StatusBit::StateTransferring) {
            StatusType::StateTransferring
        } else if pool_full {
            StatusType::PoolFull
        } else if self.is(StatusBit::Pending) {
            StatusType::Pending
        } else {
            StatusType::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_query() {
        let mut st = StatusFlags::new();
        st.on(StatusBit::InViewChange);
        assert!(st.is(StatusBit::InViewChange));
        assert!(st.in_one(&[StatusBit::Pending, StatusBit::InViewChange]));
        st.off(StatusBit::InViewChange);
        assert!(!st.is(StatusBit::InViewChange));
    }

    #[test]
    fn report_precedence() {
        let mut st = StatusFlags::new();
        st.on(StatusBit::Normal);
        assert_eq!(st.report(false), StatusType::Normal);

        st.on(StatusBit::InViewChange);
        assert_eq!(st.report(false), StatusType::InViewChange);

        st.on(StatusBit::InRecovery);
        assert_eq!(st.report(false), StatusType::InRecovery);

        st.on(StatusBit::InConfChange);
        assert_eq!(st.report(false), StatusType::InConfChange);

        st.on(StatusBit::Stopped);
        assert_eq!(st.report(false), StatusType::Stopped);
    }

    #[test]
    fn pool_full_reported_when_otherwise_normal() {
        let mut st = StatusFlags::new();
        st.on(StatusBit::Normal);
        assert_eq!(st.report(true), StatusType::PoolFull);
    }
}

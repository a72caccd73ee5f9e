//! Event types for the deterministic state machine.

use rbft_messages::{Envelope, EpochChangeProof};
use rbft_types::{Height, NodeStatus, RequestSet, ServiceState, Transaction, View};

/// Priority levels for event ordering at the same instant.
///
/// Internal events (consequences of prior processing) are handled before new
/// external inputs, preserving causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Consequences of prior event processing, drained first.
    Internal = 0,
    /// Timer expirations scheduled by the replica itself.
    Timer = 1,
    /// Inputs from other replicas or the local service layers.
    External = 2,
}

/// Introspection queries served through the event queue so reads and writes
/// share one ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspect {
    /// Lifecycle and chain-position snapshot.
    Status,
    /// Number of transactions pending in the request pool.
    PendingTxCount,
    /// The current low watermark.
    LowWatermark,
    /// Look up a pooled transaction by hash.
    TxByHash(rbft_types::Hash),
}

/// Answer to an [`Inspect`] query.
#[derive(Debug, Clone)]
pub enum InspectReply<T> {
    /// Answer to [`Inspect::Status`].
    Status(NodeStatus),
    /// Answer to [`Inspect::PendingTxCount`].
    PendingTxCount(u64),
    /// Answer to [`Inspect::LowWatermark`].
    LowWatermark(Height),
    /// Answer to [`Inspect::TxByHash`].
    Tx(Option<T>),
}

/// An introspection request with its reply channel.
#[derive(Debug, Clone)]
pub struct InspectRequest<T> {
    /// The query.
    pub query: Inspect,
    /// Where to send the answer. Sends never block.
    pub reply: std::sync::mpsc::Sender<InspectReply<T>>,
}

/// All inputs the replica state machine can receive.
#[derive(Debug, Clone)]
pub enum Event<T> {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Primary batch timer expired.
    BatchTimer,
    /// Empty-batch timer expired.
    NoTxBatchTimer,
    /// Null-request heartbeat timer expired.
    NullRequestTimer,
    /// New-view timer expired; `demand` carries the view the timer was
    /// armed for, so stale expirations can be ignored.
    NewViewTimer {
        /// View demanded when the timer was armed.
        demand: Option<View>,
    },
    /// View-change resend timer expired.
    VcResendTimer,
    /// Out-of-date view-change cleanup timer expired.
    CleanVcTimer,
    /// Sync-state response collection window expired.
    SyncStateResponseTimer,
    /// Periodic sync-state restart timer expired.
    SyncStateRestartTimer,
    /// Fetch-checkpoint retry timer expired.
    FetchCheckpointTimer,
    /// Fetch-view retry timer expired.
    FetchViewTimer,
    /// High-watermark timer expired; carries the low watermark at arming
    /// time so an already-advanced watermark cancels the expiry.
    HighWatermarkTimer {
        /// Low watermark when the timer was armed.
        prev_h: Height,
    },
    /// Check-pool rebroadcast timer expired.
    CheckPoolTimer,
    /// Check-pool eviction timer expired.
    CheckPoolRemoveTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // External inputs
    // ═══════════════════════════════════════════════════════════════════════
    /// A consensus message arrived from the transport.
    ConsensusMessage(Box<Envelope>),
    /// A transaction set was posted from the API layer or relayed from
    /// another replica.
    RequestSet(RequestSet<T>),
    /// The execution service finished a state transfer.
    StateUpdated(ServiceState),
    /// The execution service executed a block at a checkpoint or
    /// configuration height.
    CheckpointBlockExecuted(ServiceState),
    /// An introspection query.
    Inspect(InspectRequest<T>),

    // ═══════════════════════════════════════════════════════════════════════
    // Internal follow-ups
    // ═══════════════════════════════════════════════════════════════════════
    /// Recovery should start (posted at startup and on epoch change);
    /// ignored if the view already advanced past `prev_view`.
    RecoveryInit {
        /// View when recovery was requested.
        prev_view: View,
    },
    /// A view-change quorum was reached for the current target view.
    ViewChangeQuorum,
    /// The new view is fully installed.
    ViewChangeDone,
    /// A verified epoch-change proof requires syncing to its checkpoint.
    EpochSync {
        /// The proof.
        proof: Box<EpochChangeProof>,
    },
}

impl<T: Transaction> Event<T> {
    /// Priority class of this event.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::RecoveryInit { .. }
            | Event::ViewChangeQuorum
            | Event::ViewChangeDone
            | Event::EpochSync { .. } => EventPriority::Internal,

            Event::BatchTimer
            | Event::NoTxBatchTimer
            | Event::NullRequestTimer
            | Event::NewViewTimer { .. }
            | Event::VcResendTimer
            | Event::CleanVcTimer
            | Event::SyncStateResponseTimer
            | Event::SyncStateRestartTimer
            | Event::FetchCheckpointTimer
            | Event::FetchViewTimer
            | Event::HighWatermarkTimer { .. }
            | Event::CheckPoolTimer
            | Event::CheckPoolRemoveTimer => EventPriority::Timer,

            Event::ConsensusMessage(_)
            | Event::RequestSet(_)
            | Event::StateUpdated(_)
            | Event::CheckpointBlockExecuted(_)
            | Event::Inspect(_) => EventPriority::External,
        }
    }

    /// Event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::BatchTimer => "BatchTimer",
            Event::NoTxBatchTimer => "NoTxBatchTimer",
            Event::NullRequestTimer => "NullRequestTimer",
            Event::NewViewTimer { .. } => "NewViewTimer",
            Event::VcResendTimer => "VcResendTimer",
            Event::CleanVcTimer => "CleanVcTimer",
            Event::SyncStateResponseTimer => "SyncStateResponseTimer",
            Event::SyncStateRestartTimer => "SyncStateRestartTimer",
            Event::FetchCheckpointTimer => "FetchCheckpointTimer",
            Event::FetchViewTimer => "FetchViewTimer",
            Event::HighWatermarkTimer { .. } => "HighWatermarkTimer",
            Event::CheckPoolTimer => "CheckPoolTimer",
            Event::CheckPoolRemoveTimer => "CheckPoolRemoveTimer",
            Event::ConsensusMessage(env) => env.msg.type_name(),
            Event::RequestSet(_) => "RequestSet",
            Event::StateUpdated(_) => "StateUpdated",
            Event::CheckpointBlockExecuted(_) => "CheckpointBlockExecuted",
            Event::Inspect(_) => "Inspect",
            Event::RecoveryInit { .. } => "RecoveryInit",
            Event::ViewChangeQuorum => "ViewChangeQuorum",
            Event::ViewChangeDone => "ViewChangeDone",
            Event::EpochSync { .. } => "EpochSync",
        }
    }

    /// Whether this is an internal follow-up event.
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }
}

//! Action types for the deterministic state machine.

use crate::{Event, TimerId};
use rbft_messages::{Envelope, QuorumCheckpoint, SignedCheckpoint};
use rbft_types::{MetaState, ReplicaId, SeqNo};
use std::time::Duration;

/// Events pushed to the application layer's filter channel.
#[derive(Debug, Clone)]
pub enum FilterEvent {
    /// A stable checkpoint was reached; carries the matching quorum set.
    StableCheckpoint(Vec<SignedCheckpoint>),
    /// A configuration change completed.
    FinishConfigChange(String),
    /// Recovery completed.
    FinishRecovery(String),
    /// A view change completed.
    FinishViewChange(String),
    /// A state transfer completed.
    FinishStateUpdate(String),
}

/// Commands the state machine wants performed.
///
/// The runner executes actions and may convert results back into events.
/// Network sends and execution submissions are fire-and-forget.
#[derive(Debug, Clone)]
pub enum Action<T> {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast an envelope to every peer.
    Broadcast {
        /// The stamped envelope.
        envelope: Box<Envelope>,
    },
    /// Send an envelope to one replica.
    Unicast {
        /// The stamped envelope.
        envelope: Box<Envelope>,
        /// Destination replica.
        to: ReplicaId,
    },
    /// Send an envelope to a replica addressed by hostname, used when the
    /// requester may not be in the current routing table.
    UnicastByHostname {
        /// The stamped envelope.
        envelope: Box<Envelope>,
        /// Destination hostname.
        hostname: String,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Arm a one-shot timer; posts `event` on expiry. Restarts the timer if
    /// it is already armed. `duration` overrides the configured default.
    StartTimer {
        /// Which timer.
        id: TimerId,
        /// Override of the configured duration.
        duration: Option<Duration>,
        /// Event to post on expiry.
        event: Box<Event<T>>,
    },
    /// Disarm a timer. No-op if it is not armed.
    StopTimer {
        /// Which timer.
        id: TimerId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Execution service
    // ═══════════════════════════════════════════════════════════════════════
    /// Submit an ordered batch for execution.
    Execute {
        /// Transactions in execution order (deduplicated).
        txs: Vec<T>,
        /// Per-transaction local flags, aligned with `txs`.
        local_flags: Vec<bool>,
        /// Sequence of the batch.
        seq_no: SeqNo,
        /// Batch timestamp; zero for the null batch.
        timestamp: i64,
        /// Staking account of the batch's proposer.
        proposer_account: String,
    },
    /// Ask the execution service to catch the ledger up to `target`.
    StateUpdate {
        /// Target (height, digest).
        target: MetaState,
        /// Quorum checkpoints supporting the target.
        checkpoint_set: Vec<SignedCheckpoint>,
        /// Epoch-change proofs covering the span, when syncing across epochs.
        epoch_changes: Vec<QuorumCheckpoint>,
    },
    /// Push a filter event to the application layer.
    SendFilterEvent {
        /// The event.
        event: FilterEvent,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Control
    // ═══════════════════════════════════════════════════════════════════════
    /// Re-inject an internal event; drained before external inputs.
    EnqueueInternal {
        /// The follow-up event.
        event: Box<Event<T>>,
    },
    /// Fatal, operator-visible stop: signals the delete flag so the
    /// supervisor tears the namespace down.
    StopNamespace {
        /// Human-readable cause.
        reason: String,
    },
}

impl<T> Action<T> {
    /// Action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::Unicast { .. } => "Unicast",
            Action::UnicastByHostname { .. } => "UnicastByHostname",
            Action::StartTimer { .. } => "StartTimer",
            Action::StopTimer { .. } => "StopTimer",
            Action::Execute { .. } => "Execute",
            Action::StateUpdate { .. } => "StateUpdate",
            Action::SendFilterEvent { .. } => "SendFilterEvent",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::StopNamespace { .. } => "StopNamespace",
        }
    }

    /// Whether this is an internal-event action.
    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }

    /// Whether this action leaves the replica (network or executor).
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            Action::Broadcast { .. }
                | Action::Unicast { .. }
                | Action::UnicastByHostname { .. }
                | Action::Execute { .. }
                | Action::StateUpdate { .. }
                | Action::SendFilterEvent { .. }
        )
    }
}

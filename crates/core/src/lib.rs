//! Core abstractions for the RBFT ordering kernel.
//!
//! The kernel is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no `.await`
//! - **Deterministic**: same state + event = same actions
//! - **I/O-free**: network sends, timer arming, execution submissions, and
//!   state-transfer requests are all returned as [`Action`]s
//!
//! A runner (production or test harness) delivers events, executes the
//! returned actions, and converts action results back into events. Internal
//! follow-up events ([`Action::EnqueueInternal`]) are drained to a fixed
//! point before the next external input, preserving causality.
//!
//! Persistent storage, the signer, and the epoch service are the exception
//! to the I/O rule: they are injected capability handles called from inside
//! handlers, and implementations must not stall the loop.

mod action;
mod event;
mod storage;
mod traits;

pub use action::{Action, FilterEvent};
pub use event::{Event, EventPriority, Inspect, InspectReply, InspectRequest};
pub use storage::MemoryStorage;
pub use traits::{CryptoService, EpochService, KeyedCrypto, StateMachine, Storage, StorageError};

/// Named one-shot timers owned by the runner.
///
/// Each timer has a configured default duration; the engine may override it
/// per start. Firing posts the event carried by the start action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Primary batching interval.
    Batch,
    /// Empty-batch generation interval (timed empty blocks).
    NoTxBatch,
    /// Primary heartbeat / backup watchdog.
    NullRequest,
    /// Bounds progress on outstanding batches and the wait for NewView.
    NewView,
    /// Retries an unanswered view change.
    VcResend,
    /// Garbage-collects out-of-date view-change messages.
    CleanVc,
    /// Bounds the wait for sync-state responses.
    SyncStateResponse,
    /// Re-probes cluster state periodically while idle.
    SyncStateRestart,
    /// Retries fetching a config checkpoint.
    FetchCheckpoint,
    /// Retries fetching an agreed new view after restart.
    FetchView,
    /// Bounds how long the replica tolerates a stuck watermark window.
    HighWatermark,
    /// Periodic out-of-date request rebroadcast.
    CheckPool,
    /// Periodic timed-out request eviction.
    CheckPoolRemove,
}

impl TimerId {
    /// Timer name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            TimerId::Batch => "batch",
            TimerId::NoTxBatch => "no_tx_batch",
            TimerId::NullRequest => "null_request",
            TimerId::NewView => "new_view",
            TimerId::VcResend => "vc_resend",
            TimerId::CleanVc => "clean_vc",
            TimerId::SyncStateResponse => "sync_state_response",
            TimerId::SyncStateRestart => "sync_state_restart",
            TimerId::FetchCheckpoint => "fetch_checkpoint",
            TimerId::FetchView => "fetch_view",
            TimerId::HighWatermark => "high_watermark",
            TimerId::CheckPool => "check_pool",
            TimerId::CheckPoolRemove => "check_pool_remove",
        }
    }
}

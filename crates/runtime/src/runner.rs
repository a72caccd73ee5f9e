//! The tokio event loop driving one replica.

use crate::{Network, RbftMetrics, TimerManager};
use rbft_core::{
    Action, Event, FilterEvent, Inspect, InspectReply, InspectRequest, StateMachine,
};
use rbft_engine::Replica;
use rbft_mempool::RequestPool;
use rbft_messages::{Envelope, QuorumCheckpoint, SignedCheckpoint};
use rbft_types::{MetaState, NodeStatus, RequestSet, ServiceState, Transaction};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Errors from the runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The event channel closed; every handle was dropped.
    #[error("event channel closed")]
    ChannelClosed,
    /// The engine requested a fatal stop.
    #[error("fatal stop: {0}")]
    FatalStop(String),
}

/// Execution-service surface the runner calls on behalf of the engine.
/// Implementations must not block the caller; hand work to a background
/// task and report back through the runner handle.
pub trait ExecutionService<T>: Send + Sync {
    /// Execute an ordered batch.
    fn execute(
        &self,
        txs: Vec<T>,
        local_flags: Vec<bool>,
        seq_no: u64,
        timestamp: i64,
        proposer_account: String,
    );

    /// Catch the ledger up to `target`.
    fn state_update(
        &self,
        target: MetaState,
        checkpoint_set: Vec<SignedCheckpoint>,
        epoch_changes: Vec<QuorumCheckpoint>,
    );

    /// Deliver a filter event to the application layer.
    fn send_filter_event(&self, event: FilterEvent);
}

/// Cloneable handle for feeding a running replica.
pub struct RunnerHandle<T> {
    event_tx: mpsc::Sender<Event<T>>,
    del_flag_rx: watch::Receiver<bool>,
}

impl<T> Clone for RunnerHandle<T> {
    fn clone(&self) -> Self {
        RunnerHandle {
            event_tx: self.event_tx.clone(),
            del_flag_rx: self.del_flag_rx.clone(),
        }
    }
}

impl<T: Transaction> RunnerHandle<T> {
    /// Deliver a consensus message from the transport.
    pub async fn step(&self, envelope: Envelope) {
        let _ = self
            .event_tx
            .send(Event::ConsensusMessage(Box::new(envelope)))
            .await;
    }

    /// Post a transaction set from the API layer.
    pub async fn post_requests(&self, requests: Vec<T>, local: bool) {
        let _ = self
            .event_tx
            .send(Event::RequestSet(RequestSet { requests, local }))
            .await;
    }

    /// Report a finished state transfer.
    pub async fn report_state_updated(&self, state: ServiceState) {
        let _ = self.event_tx.send(Event::StateUpdated(state)).await;
    }

    /// Report execution reaching a checkpoint or configuration height.
    pub async fn report_checkpoint(&self, state: ServiceState) {
        let _ = self
            .event_tx
            .send(Event::CheckpointBlockExecuted(state))
            .await;
    }

    /// Run an introspection query through the event queue, so the read is
    /// ordered with writes.
    pub async fn inspect(&self, query: Inspect) -> Option<InspectReply<T>> {
        let (tx, rx) = std::sync::mpsc::channel();
        let req = InspectRequest { query, reply: tx };
        self.event_tx.send(Event::Inspect(req)).await.ok()?;
        tokio::task::spawn_blocking(move || {
            rx.recv_timeout(std::time::Duration::from_secs(5)).ok()
        })
        .await
        .ok()?
    }

    /// The replica's status snapshot.
    pub async fn status(&self) -> Option<NodeStatus> {
        match self.inspect(Inspect::Status).await? {
            InspectReply::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Look up a pooled transaction by hash.
    pub async fn tx_by_hash(&self, hash: rbft_types::Hash) -> Option<T> {
        match self.inspect(Inspect::TxByHash(hash)).await? {
            InspectReply::Tx(tx) => tx,
            _ => None,
        }
    }

    /// Watch for the fatal-stop flag.
    pub fn del_flag(&self) -> watch::Receiver<bool> {
        self.del_flag_rx.clone()
    }
}

/// Drives one [`Replica`]: delivers events, executes actions, and posts
/// timer fires and internal follow-ups back into the queue.
pub struct Runner<T: Transaction, P: RequestPool<T>> {
    replica: Replica<T, P>,
    event_rx: mpsc::Receiver<Event<T>>,
    timers: TimerManager<T>,
    network: Arc<dyn Network>,
    execution: Arc<dyn ExecutionService<T>>,
    metrics: Option<RbftMetrics>,
    del_flag_tx: watch::Sender<bool>,
}

impl<T: Transaction, P: RequestPool<T>> Runner<T, P> {
    /// Wire a replica to its transport and execution service.
    pub fn new(
        replica: Replica<T, P>,
        network: Arc<dyn Network>,
        execution: Arc<dyn ExecutionService<T>>,
        channel_capacity: usize,
    ) -> (Runner<T, P>, RunnerHandle<T>) {
        let (event_tx, event_rx) = mpsc::channel(channel_capacity);
        let (del_flag_tx, del_flag_rx) = watch::channel(false);
        let timers = TimerManager::new(event_tx.clone());
        (
            Runner {
                replica,
                event_rx,
                timers,
                network,
                execution,
                metrics: None,
                del_flag_tx,
            },
            RunnerHandle {
                event_tx,
                del_flag_rx,
            },
        )
    }

    /// Attach metrics.
    pub fn with_metrics(mut self, metrics: RbftMetrics) -> Runner<T, P> {
        self.metrics = Some(metrics);
        self
    }

    fn now_ns() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }

    /// Run until the event channel closes or the engine stops fatally.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        info!("runner starting");
        self.replica.set_time(Self::now_ns());
        let start_actions = self.replica.start();
        if let Some(reason) = self.dispatch_actions(start_actions) {
            return self.fatal(reason);
        }

        while let Some(event) = self.event_rx.recv().await {
            self.replica.set_time(Self::now_ns());
            if let Some(metrics) = &self.metrics {
                metrics
                    .events_processed
                    .with_label_values(&[event.type_name()])
                    .inc();
            }

            // Drain internal follow-ups before the next external input.
            let mut queue = VecDeque::new();
            queue.push_back(event);
            let mut fatal = None;
            while let Some(next) = queue.pop_front() {
                let actions = self.replica.handle(next);
                for action in actions {
                    match action {
                        Action::EnqueueInternal { event } => queue.push_back(*event),
                        other => {
                            if let Some(reason) = self.execute_action(other) {
                                fatal = Some(reason);
                            }
                        }
                    }
                }
            }
            if let Some(metrics) = &self.metrics {
                let status = self.replica.status();
                metrics.view.set(status.view as i64);
                metrics.low_watermark.set(status.h as i64);
                metrics.last_exec.set(self.replica.last_exec() as i64);
            }
            if let Some(reason) = fatal {
                return self.fatal(reason);
            }
        }

        info!("event channel closed, runner exiting");
        self.timers.cancel_all();
        Err(RunnerError::ChannelClosed)
    }

    fn dispatch_actions(&mut self, actions: Vec<Action<T>>) -> Option<String> {
        let mut queue: VecDeque<Action<T>> = actions.into();
        let mut fatal = None;
        while let Some(action) = queue.pop_front() {
            match action {
                Action::EnqueueInternal { event } => {
                    for follow_up in self.replica.handle(*event) {
                        queue.push_back(follow_up);
                    }
                }
                other => {
                    if let Some(reason) = self.execute_action(other) {
                        fatal = Some(reason);
                    }
                }
            }
        }
        fatal
    }

    /// Execute one externally visible action. Returns the reason on fatal
    /// stop.
    fn execute_action(&mut self, action: Action<T>) -> Option<String> {
        if let Some(metrics) = &self.metrics {
            metrics
                .actions_executed
                .with_label_values(&[action.type_name()])
                .inc();
        }
        match action {
            Action::Broadcast { envelope } => {
                self.network.broadcast(&envelope);
            }
            Action::Unicast { envelope, to } => {
                self.network.unicast(&envelope, to);
            }
            Action::UnicastByHostname { envelope, hostname } => {
                self.network.unicast_by_hostname(&envelope, &hostname);
            }
            Action::StartTimer {
                id,
                duration,
                event,
            } => match duration {
                Some(duration) => self.timers.set_timer(id, duration, *event),
                None => {
                    // The engine always supplies a duration; a missing one
                    // is a programming error worth surfacing, not a crash.
                    warn!(timer = id.name(), "start timer without a duration, ignoring");
                }
            },
            Action::StopTimer { id } => self.timers.cancel_timer(id),
            Action::Execute {
                txs,
                local_flags,
                seq_no,
                timestamp,
                proposer_account,
            } => {
                self.execution
                    .execute(txs, local_flags, seq_no, timestamp, proposer_account);
            }
            Action::StateUpdate {
                target,
                checkpoint_set,
                epoch_changes,
            } => {
                self.execution
                    .state_update(target, checkpoint_set, epoch_changes);
            }
            Action::SendFilterEvent { event } => {
                self.execution.send_filter_event(event);
            }
            Action::EnqueueInternal { .. } => {
                debug!("internal event reached the action executor");
            }
            Action::StopNamespace { reason } => return Some(reason),
        }
        None
    }

    fn fatal(mut self, reason: String) -> Result<(), RunnerError> {
        error!(%reason, "engine requested namespace stop");
        self.timers.cancel_all();
        let _ = self.del_flag_tx.send(true);
        Err(RunnerError::FatalStop(reason))
    }
}

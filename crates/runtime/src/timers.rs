//! Timer management for the runner.
//!
//! Each armed timer is a tokio task that sleeps and then posts the event the
//! engine attached to the start action. Timers are one-shot, restartable,
//! and idempotent to cancel.

use rbft_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Manages the runner's timers.
pub struct TimerManager<T> {
    /// Armed timers (id → task handle).
    timers: HashMap<TimerId, JoinHandle<()>>,
    /// Event sender for timer fires.
    event_tx: mpsc::Sender<Event<T>>,
}

impl<T: Send + 'static> TimerManager<T> {
    /// Create a new timer manager posting fires into `event_tx`.
    pub fn new(event_tx: mpsc::Sender<Event<T>>) -> TimerManager<T> {
        TimerManager {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm a timer that posts `event` after `duration`. An armed timer with
    /// the same id is cancelled first.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration, event: Event<T>) {
        self.cancel_timer(id);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            trace!(timer = id.name(), ?duration, "timer armed, sleeping");
            tokio::time::sleep(duration).await;
            trace!(timer = id.name(), "timer fired");
            // A closed channel means the runner is shutting down.
            let _ = event_tx.send(event).await;
        });

        self.timers.insert(id, handle);
        debug!(timer = id.name(), ?duration, "timer set");
    }

    /// Disarm a timer. No-op if it is not armed or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            debug!(timer = id.name(), "timer cancelled");
        }
    }

    /// Disarm everything; called on shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(timer = id.name(), "timer cancelled (shutdown)");
        }
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl<T> Drop for TimerManager<T> {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use borsh::{BorshDeserialize, BorshSerialize};
    use rbft_types::{Hash, Transaction};

    #[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
    struct TestTx(u64);

    impl Transaction for TestTx {
        fn tx_hash(&self) -> Hash {
            Hash::digest(&self.0.to_le_bytes())
        }
    }

    #[tokio::test]
    async fn timer_fires() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager: TimerManager<TestTx> = TimerManager::new(event_tx);

        manager.set_timer(
            TimerId::Batch,
            Duration::from_millis(10),
            Event::BatchTimer,
        );

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, Event::BatchTimer));
    }

    #[tokio::test]
    async fn timer_cancel() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager: TimerManager<TestTx> = TimerManager::new(event_tx);

        manager.set_timer(
            TimerId::Batch,
            Duration::from_millis(50),
            Event::BatchTimer,
        );
        manager.cancel_timer(TimerId::Batch);

        let result = tokio::time::timeout(Duration::from_millis(100), event_rx.recv()).await;
        assert!(result.is_err(), "timer should have been cancelled");
    }

    #[tokio::test]
    async fn timer_replace() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager: TimerManager<TestTx> = TimerManager::new(event_tx);

        manager.set_timer(
            TimerId::NewView,
            Duration::from_millis(5_000),
            Event::NewViewTimer { demand: Some(1) },
        );
        manager.set_timer(
            TimerId::NewView,
            Duration::from_millis(10),
            Event::NewViewTimer { demand: Some(2) },
        );

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timeout - replaced timer did not fire quickly")
            .expect("channel closed");
        assert!(matches!(event, Event::NewViewTimer { demand: Some(2) }));
    }

    #[tokio::test]
    async fn cancel_all() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager: TimerManager<TestTx> = TimerManager::new(event_tx);

        manager.set_timer(
            TimerId::Batch,
            Duration::from_millis(50),
            Event::BatchTimer,
        );
        manager.set_timer(
            TimerId::CheckPool,
            Duration::from_millis(50),
            Event::CheckPoolTimer,
        );
        assert_eq!(manager.active_count(), 2);

        manager.cancel_all();
        assert_eq!(manager.active_count(), 0);

        let result = tokio::time::timeout(Duration::from_millis(120), event_rx.recv()).await;
        assert!(result.is_err(), "no timers should have fired");
    }
}

//! Production runner for the RBFT ordering kernel.
//!
//! Owns everything the deterministic engine must not: the tokio event loop,
//! timer tasks, RocksDB persistence, the network adapter, the execution
//! service, and metrics. The engine stays a pure state machine; the runner
//! feeds it events, executes its actions, and converts action results back
//! into events.

mod metrics;
mod network;
mod runner;
mod storage;
mod timers;

pub use metrics::RbftMetrics;
pub use network::{LoopbackNetwork, Network};
pub use runner::{ExecutionService, Runner, RunnerHandle, RunnerError};
pub use storage::{RocksDbConfig, RocksDbStorage};
pub use timers::TimerManager;

/// Initialize a tracing subscriber honoring `RUST_LOG`. Intended for
/// binaries and examples; tests use `tracing-test`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

//! Prometheus metrics for the runner.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

/// Metrics published by one replica's runner.
#[derive(Clone)]
pub struct RbftMetrics {
    /// Events processed, by event type.
    pub events_processed: IntCounterVec,
    /// Actions executed, by action type.
    pub actions_executed: IntCounterVec,
    /// Current view.
    pub view: IntGauge,
    /// Current low watermark.
    pub low_watermark: IntGauge,
    /// Last executed sequence.
    pub last_exec: IntGauge,
}

impl RbftMetrics {
    /// Create and register the metric family in `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<RbftMetrics> {
        let events_processed = IntCounterVec::new(
            Opts::new("rbft_events_processed_total", "Events processed by the engine"),
            &["type"],
        )?;
        let actions_executed = IntCounterVec::new(
            Opts::new("rbft_actions_executed_total", "Actions executed by the runner"),
            &["type"],
        )?;
        let view = IntGauge::new("rbft_view", "Current view")?;
        let low_watermark = IntGauge::new("rbft_low_watermark", "Current low watermark")?;
        let last_exec = IntGauge::new("rbft_last_exec", "Last executed sequence")?;

        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(actions_executed.clone()))?;
        registry.register(Box::new(view.clone()))?;
        registry.register(Box::new(low_watermark.clone()))?;
        registry.register(Box::new(last_exec.clone()))?;

        Ok(RbftMetrics {
            events_processed,
            actions_executed,
            view,
            low_watermark,
            last_exec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once() {
        let registry = Registry::new();
        let metrics = RbftMetrics::new(&registry).unwrap();
        metrics.events_processed.with_label_values(&["PrePrepare"]).inc();
        metrics.view.set(3);
        assert!(RbftMetrics::new(&registry).is_err(), "double registration must fail");
    }
}

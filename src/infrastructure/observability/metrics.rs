//! Prometheus metrics definitions for riskgate
//!
//! All metrics use the `riskgate_` prefix and are read-only. The registry
//! is push-oriented: `gather()` renders the text exposition format for a
//! pushgateway or log shipper; nothing here listens for requests.

use prometheus::{
    core::{AtomicF64, GenericGauge},
    CounterVec, Gauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Pre-trade decisions by outcome (approved / denied)
    pub decisions_total: CounterVec,
    /// OCO validation runs
    pub oco_validations_total: CounterVec,
    /// Positions force-closed by the OCO validator
    pub oco_force_closes_total: CounterVec,
    /// Currently supervised positions
    pub active_positions: GenericGauge<AtomicF64>,
    /// Supervised positions reaching a terminal state, by outcome
    pub position_outcomes_total: CounterVec,
}

impl Metrics {
    /// Create a new Metrics instance with all gauges and counters registered
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let decisions_total = CounterVec::new(
            Opts::new("riskgate_decisions_total", "Pre-trade decisions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(decisions_total.clone()))?;

        let oco_validations_total = CounterVec::new(
            Opts::new(
                "riskgate_oco_validations_total",
                "OCO validation results by classification",
            ),
            &["result"],
        )?;
        registry.register(Box::new(oco_validations_total.clone()))?;

        let oco_force_closes_total = CounterVec::new(
            Opts::new(
                "riskgate_oco_force_closes_total",
                "Positions force-closed by the OCO validator",
            ),
            &["confirmed"],
        )?;
        registry.register(Box::new(oco_force_closes_total.clone()))?;

        let active_positions = Gauge::with_opts(Opts::new(
            "riskgate_active_positions",
            "Currently supervised positions",
        ))?;
        registry.register(Box::new(active_positions.clone()))?;

        let position_outcomes_total = CounterVec::new(
            Opts::new(
                "riskgate_position_outcomes_total",
                "Terminal position outcomes",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(position_outcomes_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            decisions_total,
            oco_validations_total,
            oco_force_closes_total,
            active_positions,
            position_outcomes_total,
        })
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        Ok(encoder.encode_to_string(&families)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        let metrics = Metrics::new().unwrap();
        metrics.decisions_total.with_label_values(&["approved"]).inc();
        metrics.active_positions.set(3.0);

        let rendered = metrics.gather().unwrap();
        assert!(rendered.contains("riskgate_decisions_total"));
        assert!(rendered.contains("riskgate_active_positions 3"));
    }

    #[test]
    fn test_metrics_clone_shares_registry() {
        let metrics = Metrics::new().unwrap();
        let clone = metrics.clone();
        clone.decisions_total.with_label_values(&["denied"]).inc();

        let rendered = metrics.gather().unwrap();
        assert!(rendered.contains("denied"));
    }
}

//! Pre-trade risk orchestration: position sizing composed with correlation
//! exposure control.
//!
//! `evaluate` is the single entry point for a candidate trade. The sequence
//! is: compute the Kelly-derived size, apply the correlation verdict, clamp
//! to the absolute and portfolio ceilings, then return an approval or a
//! denial carrying the complete reasoning.
//!
//! The orchestrator mutates its own sizing history and position table, so a
//! single caller context must own it; wrap it in a `Mutex` if several tasks
//! need access. `record_executed` and `record_closed` must each be called
//! exactly once per open/close event or exposure will be double-counted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use crate::domain::ports::PriceHistorySource;
use crate::domain::risk::correlation::{
    CorrelationAssessment, CorrelationConfig, CorrelationMonitor, CorrelationVerdict,
};
use crate::domain::risk::sizing::{
    RiskLevel, SizingConfig, SizingDecision, SizingEngine, SizingRequest, TradeRecord,
};
use crate::domain::trading::types::MarketRegime;
use crate::infrastructure::observability::Metrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskControlConfig {
    /// Hard per-position ceiling as a fraction of capital
    pub absolute_max_position: f64,
    /// Ceiling on total portfolio exposure
    pub portfolio_max_exposure: f64,
    /// Correlated-exposure level that triggers a concentration warning
    pub high_exposure_warn: f64,
    /// Confidence below which a warning is attached
    pub low_confidence_warn: f64,
    /// Observations pulled per symbol when refreshing price history
    pub price_history_window: usize,
    /// Timeout for a price-history refresh call
    pub refresh_timeout_ms: u64,
}

impl Default for RiskControlConfig {
    fn default() -> Self {
        Self {
            absolute_max_position: 0.10,
            portfolio_max_exposure: 0.80,
            high_exposure_warn: 0.30,
            low_confidence_warn: 0.5,
            price_history_window: 64,
            refresh_timeout_ms: 5000,
        }
    }
}

impl RiskControlConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.absolute_max_position <= 0.0 || self.absolute_max_position > 1.0 {
            return Err(format!(
                "Invalid absolute_max_position: {}",
                self.absolute_max_position
            ));
        }
        if self.portfolio_max_exposure <= 0.0 || self.portfolio_max_exposure > 1.0 {
            return Err(format!(
                "Invalid portfolio_max_exposure: {}",
                self.portfolio_max_exposure
            ));
        }
        if self.absolute_max_position > self.portfolio_max_exposure {
            return Err(
                "absolute_max_position must not exceed portfolio_max_exposure".to_string(),
            );
        }
        if self.refresh_timeout_ms == 0 {
            return Err("refresh_timeout_ms must be > 0".to_string());
        }
        Ok(())
    }
}

/// Why a trade was denied. Closed set so callers can match exhaustively.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum DenyReason {
    #[error("sizing returned no usable fraction: {detail}")]
    SizingUnavailable { detail: String },

    #[error("correlation {coefficient:.2} with held {held_symbol} at or above block threshold")]
    CorrelationBlocked {
        held_symbol: String,
        coefficient: f64,
    },

    #[error("portfolio exposure {current_exposure:.2} leaves no headroom under cap {cap:.2}")]
    PortfolioCapExceeded { current_exposure: f64, cap: f64 },
}

/// Full pre-trade decision with every intermediate value preserved.
#[derive(Debug, Clone)]
pub struct Decision {
    pub approved: bool,
    pub symbol: String,
    /// Final recommended fraction of capital; zero when denied
    pub final_fraction: f64,
    pub reasons: Vec<DenyReason>,
    pub warnings: Vec<String>,
    pub sizing: Option<SizingDecision>,
    pub correlation: Option<CorrelationAssessment>,
    /// Total exposure if this trade executes at `final_fraction`
    pub portfolio_exposure_after: f64,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    fn denied(symbol: &str, reason: DenyReason) -> Self {
        Self {
            approved: false,
            symbol: symbol.to_string(),
            final_fraction: 0.0,
            reasons: vec![reason],
            warnings: Vec::new(),
            sizing: None,
            correlation: None,
            portfolio_exposure_after: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Everything the orchestrator needs to know about a candidate trade.
#[derive(Debug, Clone)]
pub struct TradeContext {
    pub current_price: Decimal,
    pub balance: Decimal,
    pub confidence: f64,
    pub recent_prices: Option<Vec<f64>>,
    pub regime: Option<MarketRegime>,
}

pub struct RiskControl {
    config: RiskControlConfig,
    sizing: SizingEngine,
    correlation: CorrelationMonitor,
    metrics: Option<Metrics>,
}

impl RiskControl {
    pub fn new(
        config: RiskControlConfig,
        sizing_config: SizingConfig,
        correlation_config: CorrelationConfig,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("RiskControl configuration error: {}", e))?;
        sizing_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Sizing configuration error: {}", e))?;
        correlation_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Correlation configuration error: {}", e))?;

        Ok(Self {
            config,
            sizing: SizingEngine::new(sizing_config),
            correlation: CorrelationMonitor::new(correlation_config),
            metrics,
        })
    }

    pub fn config(&self) -> &RiskControlConfig {
        &self.config
    }

    /// Feed a price observation into the correlation buffers.
    pub fn observe_price(&mut self, symbol: &str, price: f64) {
        self.correlation.observe_price(symbol, price);
    }

    /// Pull recent prices for the given symbols into the correlation
    /// buffers, with a bounded per-call timeout. Failures degrade to the
    /// asset-class fallback rather than aborting.
    pub async fn refresh_price_history(
        &mut self,
        source: &dyn PriceHistorySource,
        symbols: &[String],
    ) -> Result<()> {
        let window = self.config.price_history_window;
        let per_call = Duration::from_millis(self.config.refresh_timeout_ms);

        for symbol in symbols {
            let prices = timeout(per_call, source.recent_prices(symbol, window))
                .await
                .map_err(|_| {
                    anyhow::anyhow!("price history fetch for {} timed out", symbol)
                })
                .and_then(|r| r.context(format!("price history fetch for {} failed", symbol)));

            match prices {
                Ok(prices) => {
                    for price in prices {
                        self.correlation.observe_price(symbol, price);
                    }
                }
                Err(e) => {
                    warn!("RiskControl: {:#}. Correlation will use fallback estimates.", e);
                }
            }
        }
        Ok(())
    }

    /// Evaluate a candidate trade. Never fails: an unusable input produces
    /// a denial with reasons, not an error.
    pub fn evaluate(&mut self, symbol: &str, context: &TradeContext) -> Decision {
        if let Some(price) = context.current_price.to_f64() {
            self.correlation.observe_price(symbol, price);
        }

        // Step 1: Kelly-derived size
        let sizing = self.sizing.calculate(
            symbol,
            &SizingRequest {
                current_price: context.current_price,
                balance: context.balance,
                confidence: context.confidence,
                recent_prices: context.recent_prices.as_deref(),
                regime: context.regime,
            },
        );

        if sizing.final_fraction <= 0.0 {
            let decision = Decision {
                sizing: Some(sizing.clone()),
                ..Decision::denied(
                    symbol,
                    DenyReason::SizingUnavailable {
                        detail: sizing.reasoning,
                    },
                )
            };
            return self.finish(decision);
        }

        // Step 2: correlation verdict on the proposed size
        let assessment = self.correlation.assess(symbol, sizing.final_fraction);
        if assessment.verdict == CorrelationVerdict::Block {
            let (held_symbol, coefficient) = assessment
                .strongest_pair()
                .map(|p| (p.held_symbol.clone(), p.coefficient))
                .unwrap_or_else(|| (String::new(), assessment.max_correlation));
            let decision = Decision {
                sizing: Some(sizing),
                correlation: Some(assessment),
                ..Decision::denied(
                    symbol,
                    DenyReason::CorrelationBlocked {
                        held_symbol,
                        coefficient,
                    },
                )
            };
            return self.finish(decision);
        }

        // Step 3: clamp to the absolute ceiling and remaining portfolio headroom
        let current_exposure = self.correlation.total_exposure();
        let headroom = self.config.portfolio_max_exposure - current_exposure;
        if headroom <= 0.0 {
            let decision = Decision {
                sizing: Some(sizing),
                correlation: Some(assessment),
                ..Decision::denied(
                    symbol,
                    DenyReason::PortfolioCapExceeded {
                        current_exposure,
                        cap: self.config.portfolio_max_exposure,
                    },
                )
            };
            return self.finish(decision);
        }

        let final_fraction = assessment
            .adjusted_fraction
            .min(self.config.absolute_max_position)
            .min(headroom);

        if final_fraction <= 0.0 {
            let decision = Decision {
                sizing: Some(sizing),
                correlation: Some(assessment),
                ..Decision::denied(
                    symbol,
                    DenyReason::PortfolioCapExceeded {
                        current_exposure,
                        cap: self.config.portfolio_max_exposure,
                    },
                )
            };
            return self.finish(decision);
        }

        // Step 4: assemble warnings for the approval
        let mut warnings = Vec::new();
        match sizing.risk_level {
            RiskLevel::Extreme => {
                warnings.push("EXTREME RISK: high volatility detected".to_string());
            }
            RiskLevel::High => {
                warnings.push("HIGH RISK: elevated market volatility".to_string());
            }
            _ => {}
        }
        if sizing.confidence < self.config.low_confidence_warn {
            warnings.push("LOW CONFIDENCE: insufficient historical data".to_string());
        }
        if assessment.verdict == CorrelationVerdict::Warn {
            warnings.push(format!(
                "CORRELATION WARNING: {:.0}% correlation with existing positions",
                assessment.max_correlation * 100.0
            ));
        }
        if assessment.total_correlated_exposure > self.config.high_exposure_warn {
            warnings.push("HIGH CORRELATION EXPOSURE: portfolio concentration risk".to_string());
        }

        let decision = Decision {
            approved: true,
            symbol: symbol.to_string(),
            final_fraction,
            reasons: Vec::new(),
            warnings,
            portfolio_exposure_after: current_exposure + final_fraction,
            sizing: Some(sizing),
            correlation: Some(assessment),
            timestamp: Utc::now(),
        };
        self.finish(decision)
    }

    fn finish(&self, decision: Decision) -> Decision {
        if decision.approved {
            info!(
                "RiskControl [{}]: APPROVED at {:.4} of capital ({} warnings)",
                decision.symbol,
                decision.final_fraction,
                decision.warnings.len()
            );
        } else {
            info!(
                "RiskControl [{}]: DENIED - {}",
                decision.symbol,
                decision
                    .reasons
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            );
        }
        if let Some(metrics) = &self.metrics {
            let outcome = if decision.approved { "approved" } else { "denied" };
            metrics.decisions_total.with_label_values(&[outcome]).inc();
        }
        decision
    }

    /// Record that an approved trade was actually executed. Call exactly
    /// once per opened position.
    pub fn record_executed(&mut self, symbol: &str, fraction: f64, regime: Option<MarketRegime>) {
        self.correlation.note_opened(symbol, fraction, regime);
        info!(
            "RiskControl [{}]: position recorded at {:.4}, total exposure {:.4}",
            symbol,
            fraction,
            self.correlation.total_exposure()
        );
    }

    /// Record that a position closed with the given result. Call exactly
    /// once per closed position.
    pub fn record_closed(&mut self, symbol: &str, result: TradeRecord) {
        if !self.correlation.note_closed(symbol) {
            warn!(
                "RiskControl [{}]: close recorded for untracked position",
                symbol
            );
        }
        self.sizing.record_trade(symbol, result);
    }

    pub fn total_exposure(&self) -> f64 {
        self.correlation.total_exposure()
    }

    pub fn diversification_score(&self) -> f64 {
        self.correlation.diversification_score()
    }

    pub fn sizing(&self) -> &SizingEngine {
        &self.sizing
    }

    pub fn correlation(&self) -> &CorrelationMonitor {
        &self.correlation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::TradeOutcome;
    use rust_decimal_macros::dec;

    fn orchestrator() -> RiskControl {
        RiskControl::new(
            RiskControlConfig::default(),
            SizingConfig::default(),
            CorrelationConfig::default(),
            None,
        )
        .unwrap()
    }

    fn trade_record(outcome: TradeOutcome, pnl_pct: f64) -> TradeRecord {
        TradeRecord {
            outcome,
            pnl: Decimal::ZERO,
            pnl_pct,
            timestamp: Utc::now(),
        }
    }

    fn seed_history(control: &mut RiskControl, symbol: &str) {
        // Open/close cycles so both correlation table and sizing history
        // stay consistent with the exactly-once discipline.
        for i in 0..12 {
            control.record_executed(symbol, 0.05, None);
            let record = if i % 3 == 2 {
                trade_record(TradeOutcome::Loss, -0.010)
            } else {
                trade_record(TradeOutcome::Win, 0.015)
            };
            control.record_closed(symbol, record);
        }
    }

    fn context() -> TradeContext {
        TradeContext {
            current_price: dec!(1.1000),
            balance: dec!(10000),
            confidence: 1.0,
            recent_prices: None,
            regime: None,
        }
    }

    #[test]
    fn test_approval_with_history() {
        let mut control = orchestrator();
        seed_history(&mut control, "EUR_USD");

        let decision = control.evaluate("EUR_USD", &context());
        assert!(decision.approved);
        assert!(decision.final_fraction > 0.0);
        assert!(decision.final_fraction <= 0.10);
        let sizing = decision.sizing.unwrap();
        assert!(decision.final_fraction < sizing.raw_kelly);
    }

    #[test]
    fn test_insufficient_history_uses_fallback_not_denial() {
        let mut control = orchestrator();
        let decision = control.evaluate("EUR_USD", &context());
        assert!(decision.approved);
        assert_eq!(decision.final_fraction, 0.005);
    }

    #[test]
    fn test_zero_fallback_denies() {
        let mut sizing_config = SizingConfig::default();
        sizing_config.fallback_fraction = 0.0;
        let mut control = RiskControl::new(
            RiskControlConfig::default(),
            sizing_config,
            CorrelationConfig::default(),
            None,
        )
        .unwrap();

        let decision = control.evaluate("EUR_USD", &context());
        assert!(!decision.approved);
        assert!(matches!(
            decision.reasons[0],
            DenyReason::SizingUnavailable { .. }
        ));
    }

    #[test]
    fn test_correlation_block_takes_precedence() {
        let mut control = orchestrator();
        seed_history(&mut control, "GBP_USD");

        // Feed strongly coupled series for both symbols
        let mut eur = 1.1000;
        let mut gbp = 1.3000;
        for i in 0..60 {
            let shared = ((i as f64) * 0.7).sin() * 0.004;
            eur *= 1.0 + shared;
            gbp *= 1.0 + shared * 0.98;
            control.observe_price("EUR_USD", eur);
            control.observe_price("GBP_USD", gbp);
        }
        // Keep the buffers aligned: evaluate() appends one GBP observation
        control.observe_price("EUR_USD", eur);
        control.record_executed("EUR_USD", 0.08, None);

        let mut ctx = context();
        ctx.current_price = Decimal::from_f64_retain(gbp).unwrap();
        let decision = control.evaluate("GBP_USD", &ctx);
        assert!(!decision.approved);
        match &decision.reasons[0] {
            DenyReason::CorrelationBlocked {
                held_symbol,
                coefficient,
            } => {
                assert_eq!(held_symbol, "EUR_USD");
                assert!(*coefficient >= 0.70);
            }
            other => panic!("expected correlation block, got {:?}", other),
        }
    }

    #[test]
    fn test_portfolio_cap_denies() {
        let mut config = RiskControlConfig::default();
        config.portfolio_max_exposure = 0.10;
        let mut control = RiskControl::new(
            config,
            SizingConfig::default(),
            CorrelationConfig::default(),
            None,
        )
        .unwrap();

        control.record_executed("BTC-USD", 0.10, None);

        let decision = control.evaluate("EUR_USD", &context());
        assert!(!decision.approved);
        assert!(matches!(
            decision.reasons[0],
            DenyReason::PortfolioCapExceeded { .. }
        ));
    }

    #[test]
    fn test_headroom_clamps_final_size() {
        let mut config = RiskControlConfig::default();
        config.portfolio_max_exposure = 0.12;
        let mut control = RiskControl::new(
            config,
            SizingConfig::default(),
            CorrelationConfig::default(),
            None,
        )
        .unwrap();

        // 0.10 held leaves only 0.02 headroom; BTC avoids the fx-class fallback
        control.record_executed("BTC-USD", 0.10, None);
        seed_history(&mut control, "EUR_USD");

        let decision = control.evaluate("EUR_USD", &context());
        assert!(decision.approved);
        assert!(decision.final_fraction <= 0.02 + 1e-12);
        assert!(decision.portfolio_exposure_after <= 0.12 + 1e-12);
    }

    #[test]
    fn test_correlation_warning_attached() {
        let mut control = orchestrator();
        seed_history(&mut control, "GBP_USD");
        // Same asset class, no price data: 0.60 fallback -> warn + shrink
        control.record_executed("EUR_USD", 0.08, None);

        let decision = control.evaluate("GBP_USD", &context());
        assert!(decision.approved);
        assert!(decision
            .warnings
            .iter()
            .any(|w| w.contains("CORRELATION WARNING")));
        let assessment = decision.correlation.unwrap();
        assert!(decision.final_fraction <= assessment.proposed_fraction);
    }

    #[test]
    fn test_record_closed_untracked_does_not_panic() {
        let mut control = orchestrator();
        control.record_closed("EUR_USD", trade_record(TradeOutcome::Win, 0.01));
        assert_eq!(control.sizing().trades_recorded("EUR_USD"), 1);
    }

    #[test]
    fn test_config_cross_validation() {
        let mut config = RiskControlConfig::default();
        config.absolute_max_position = 0.9;
        assert!(config.validate().is_err());
    }
}

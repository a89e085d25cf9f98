//! Kelly-style position sizing from historical trade outcomes.
//!
//! The engine keeps a bounded per-symbol history of trade results and
//! derives a conservative capital fraction: quarter-Kelly scaled by
//! volatility, risk-adjusted performance and market regime, clamped to a
//! hard per-position ceiling. Below the minimum history sample the engine
//! returns a fixed conservative fraction instead of computing from noise.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::debug;

use crate::domain::risk::volatility;
use crate::domain::trading::types::{MarketRegime, TradeOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Conservative Kelly scaling (0.25 = quarter Kelly)
    pub kelly_multiplier: f64,
    /// Hard per-position ceiling as a fraction of capital
    pub max_position_pct: f64,
    /// Fraction returned when history is too thin to trust
    pub fallback_fraction: f64,
    /// Minimum recorded trades before Kelly is computed
    pub min_trades: usize,
    /// Samples used for realized-volatility estimation
    pub volatility_lookback: usize,
    /// Daily volatility the sizing targets
    pub volatility_target: f64,
    /// Annual risk-free rate for the Sharpe adjustment
    pub risk_free_rate: f64,
    /// Retained trades per symbol
    pub max_history: usize,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_multiplier: 0.25,
            max_position_pct: 0.10,
            fallback_fraction: 0.005,
            min_trades: 10,
            volatility_lookback: 20,
            volatility_target: 0.02,
            risk_free_rate: 0.02,
            max_history: 100,
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.kelly_multiplier <= 0.0 || self.kelly_multiplier > 1.0 {
            return Err(format!("Invalid kelly_multiplier: {}", self.kelly_multiplier));
        }
        if self.max_position_pct <= 0.0 || self.max_position_pct > 1.0 {
            return Err(format!("Invalid max_position_pct: {}", self.max_position_pct));
        }
        if self.fallback_fraction < 0.0 || self.fallback_fraction > self.max_position_pct {
            return Err(format!(
                "fallback_fraction {} must be within [0, max_position_pct]",
                self.fallback_fraction
            ));
        }
        if self.min_trades == 0 {
            return Err("min_trades must be > 0".to_string());
        }
        if self.volatility_target <= 0.0 {
            return Err(format!("Invalid volatility_target: {}", self.volatility_target));
        }
        if self.max_history < self.min_trades {
            return Err("max_history must be >= min_trades".to_string());
        }
        Ok(())
    }
}

/// Qualitative risk classification derived from the sizing factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Extreme,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Moderate => "MODERATE",
            RiskLevel::High => "HIGH",
            RiskLevel::Extreme => "EXTREME",
        };
        write!(f, "{}", s)
    }
}

/// A completed trade as recorded into sizing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub outcome: TradeOutcome,
    pub pnl: Decimal,
    /// Return as a fraction of capital, e.g. 0.015 for +1.5%
    pub pnl_pct: f64,
    pub timestamp: DateTime<Utc>,
}

/// Intermediate Kelly statistics, exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KellyStats {
    pub trades_analyzed: usize,
    pub win_rate: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub odds_ratio: f64,
    pub raw_kelly: f64,
    pub conservative_kelly: f64,
}

/// Inputs for a single sizing request.
#[derive(Debug, Clone)]
pub struct SizingRequest<'a> {
    pub current_price: Decimal,
    pub balance: Decimal,
    pub confidence: f64,
    pub recent_prices: Option<&'a [f64]>,
    pub regime: Option<MarketRegime>,
}

/// Immutable result of one sizing request.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingDecision {
    pub symbol: String,
    /// Kelly fraction before any scaling
    pub raw_kelly: f64,
    /// Kelly after the conservative multiplier
    pub base_kelly: f64,
    pub volatility_adjustment: f64,
    pub sharpe_adjustment: f64,
    pub regime_adjustment: f64,
    /// All adjustments applied, before the ceiling
    pub adjusted_fraction: f64,
    /// Final recommended fraction of capital
    pub final_fraction: f64,
    pub max_position_pct: f64,
    pub recommended_units: u64,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub reasoning: String,
}

pub struct SizingEngine {
    config: SizingConfig,
    history: HashMap<String, VecDeque<TradeRecord>>,
}

impl SizingEngine {
    pub fn new(config: SizingConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Record a completed trade for future Kelly calculations. History is
    /// bounded per symbol; the oldest records are dropped first.
    pub fn record_trade(&mut self, symbol: &str, record: TradeRecord) {
        let records = self.history.entry(symbol.to_string()).or_default();
        records.push_back(record);
        while records.len() > self.config.max_history {
            records.pop_front();
        }
    }

    pub fn trades_recorded(&self, symbol: &str) -> usize {
        self.history.get(symbol).map_or(0, VecDeque::len)
    }

    /// Kelly optimal fraction `f = (b*p - q) / b` over the symbol's history.
    ///
    /// Returns None when the sample is too small or one-sided to be trusted.
    pub fn kelly_stats(&self, symbol: &str) -> Option<KellyStats> {
        let trades = self.history.get(symbol)?;
        if trades.len() < self.config.min_trades {
            return None;
        }

        let wins: Vec<f64> = trades
            .iter()
            .filter(|t| t.outcome == TradeOutcome::Win)
            .map(|t| t.pnl_pct)
            .collect();
        let losses: Vec<f64> = trades
            .iter()
            .filter(|t| t.outcome == TradeOutcome::Loss)
            .map(|t| t.pnl_pct.abs())
            .collect();
        if wins.is_empty() || losses.is_empty() {
            return None;
        }

        let win_rate = wins.len() as f64 / trades.len() as f64;
        let loss_rate = 1.0 - win_rate;
        let avg_win = volatility::mean(&wins)?;
        let avg_loss = volatility::mean(&losses)?;
        if avg_loss <= 0.0 {
            return None;
        }

        let odds_ratio = avg_win / avg_loss;
        let raw_kelly = ((odds_ratio * win_rate - loss_rate) / odds_ratio).max(0.0);

        Some(KellyStats {
            trades_analyzed: trades.len(),
            win_rate,
            avg_win_pct: avg_win,
            avg_loss_pct: avg_loss,
            odds_ratio,
            raw_kelly,
            conservative_kelly: raw_kelly * self.config.kelly_multiplier,
        })
    }

    /// Scale inversely with realized volatility against the daily target,
    /// capped at 2x and floored at 0.1x.
    fn volatility_adjustment(&self, symbol: &str, prices: Option<&[f64]>) -> f64 {
        let realized = match prices {
            Some(prices) if prices.len() >= self.config.volatility_lookback => {
                volatility::realized_volatility(prices, 252.0)
            }
            _ => {
                // Fall back to the symbol's own return history
                let trades = match self.history.get(symbol) {
                    Some(t) if t.len() >= 5 => t,
                    _ => return 1.0,
                };
                let returns: Vec<f64> = trades
                    .iter()
                    .rev()
                    .take(self.config.volatility_lookback)
                    .map(|t| t.pnl_pct)
                    .collect();
                volatility::std_dev(&returns).map(|sd| sd * 252.0_f64.sqrt())
            }
        };

        match realized {
            Some(vol) => (self.config.volatility_target / vol.max(0.001)).clamp(0.1, 2.0),
            None => 1.0,
        }
    }

    /// Reward recent risk-adjusted performance: higher Sharpe means larger
    /// positions (up to 1.5x), poor Sharpe shrinks them (down to 0.5x).
    fn sharpe_adjustment(&self, symbol: &str) -> f64 {
        let trades = match self.history.get(symbol) {
            Some(t) if t.len() >= self.config.min_trades => t,
            _ => return 1.0,
        };

        let returns: Vec<f64> = trades.iter().rev().take(30).map(|t| t.pnl_pct).collect();
        if returns.len() < 5 {
            return 1.0;
        }

        let (mean, std_dev) = match (
            volatility::mean(&returns),
            volatility::std_dev(&returns),
        ) {
            (Some(mean), Some(sd)) if sd > 0.0 => (mean, sd),
            _ => return 1.0,
        };

        let daily_rf = self.config.risk_free_rate / 252.0;
        let sharpe = (mean - daily_rf) / std_dev;

        if sharpe > 2.0 {
            1.5
        } else if sharpe > 1.0 {
            1.0 + (sharpe - 1.0) * 0.5
        } else if sharpe > 0.0 {
            0.7 + sharpe * 0.3
        } else {
            0.5
        }
    }

    fn regime_adjustment(regime: Option<MarketRegime>) -> f64 {
        match regime {
            Some(MarketRegime::Sideways) => 0.7,
            Some(MarketRegime::Bearish) => 0.8,
            Some(MarketRegime::Bullish) | None => 1.0,
        }
    }

    fn risk_level(kelly: f64, vol_adj: f64, sharpe_adj: f64) -> RiskLevel {
        let combined = kelly * vol_adj * sharpe_adj;
        if combined >= 0.08 {
            RiskLevel::Extreme
        } else if combined >= 0.06 {
            RiskLevel::High
        } else if combined >= 0.03 {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }

    /// Compute the recommended capital fraction for a candidate trade.
    pub fn calculate(&self, symbol: &str, request: &SizingRequest<'_>) -> SizingDecision {
        let stats = match self.kelly_stats(symbol) {
            Some(stats) => stats,
            None => {
                let recorded = self.trades_recorded(symbol);
                let fraction = self
                    .config
                    .fallback_fraction
                    .min(self.config.max_position_pct);
                debug!(
                    "SizingEngine: Insufficient history for {} ({} trades < {}), using fallback fraction {:.4}",
                    symbol, recorded, self.config.min_trades, fraction
                );
                return SizingDecision {
                    symbol: symbol.to_string(),
                    raw_kelly: 0.0,
                    base_kelly: 0.0,
                    volatility_adjustment: 1.0,
                    sharpe_adjustment: 1.0,
                    regime_adjustment: 1.0,
                    adjusted_fraction: fraction,
                    final_fraction: fraction,
                    max_position_pct: self.config.max_position_pct,
                    recommended_units: Self::units_for(
                        fraction,
                        request.balance,
                        request.current_price,
                    ),
                    risk_level: RiskLevel::Low,
                    confidence: 0.0,
                    reasoning: format!(
                        "Insufficient history: {} trades < {} required, conservative fallback applied",
                        recorded, self.config.min_trades
                    ),
                };
            }
        };

        let vol_adj = self.volatility_adjustment(symbol, request.recent_prices);
        let sharpe_adj = self.sharpe_adjustment(symbol);
        let regime_adj = Self::regime_adjustment(request.regime);
        let confidence = request.confidence.clamp(0.0, 1.0);

        let adjusted = stats.conservative_kelly * vol_adj * sharpe_adj * regime_adj * confidence;
        let final_fraction = adjusted.clamp(0.0, self.config.max_position_pct);

        let reasoning = format!(
            "Kelly: {:.3} | Vol adj: {:.2} | Sharpe adj: {:.2} | Regime adj: {:.2} | Confidence: {:.2} | {} trades analyzed",
            stats.conservative_kelly, vol_adj, sharpe_adj, regime_adj, confidence, stats.trades_analyzed
        );

        debug!("SizingEngine [{}]: {}", symbol, reasoning);

        SizingDecision {
            symbol: symbol.to_string(),
            raw_kelly: stats.raw_kelly,
            base_kelly: stats.conservative_kelly,
            volatility_adjustment: vol_adj,
            sharpe_adjustment: sharpe_adj,
            regime_adjustment: regime_adj,
            adjusted_fraction: adjusted,
            final_fraction,
            max_position_pct: self.config.max_position_pct,
            recommended_units: Self::units_for(final_fraction, request.balance, request.current_price),
            risk_level: Self::risk_level(stats.conservative_kelly, vol_adj, sharpe_adj),
            confidence,
            reasoning,
        }
    }

    fn units_for(fraction: f64, balance: Decimal, price: Decimal) -> u64 {
        if price <= Decimal::ZERO || balance <= Decimal::ZERO {
            return 0;
        }
        let fraction = Decimal::from_f64(fraction).unwrap_or(Decimal::ZERO);
        (balance * fraction / price)
            .floor()
            .to_u64()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(outcome: TradeOutcome, pnl_pct: f64) -> TradeRecord {
        TradeRecord {
            outcome,
            pnl: Decimal::from_f64(pnl_pct * 10_000.0).unwrap(),
            pnl_pct,
            timestamp: Utc::now(),
        }
    }

    fn engine_with_history() -> SizingEngine {
        let mut engine = SizingEngine::new(SizingConfig::default());
        // 8 wins at +1.5%, 4 losses at -1.0%
        for _ in 0..8 {
            engine.record_trade("EUR_USD", record(TradeOutcome::Win, 0.015));
        }
        for _ in 0..4 {
            engine.record_trade("EUR_USD", record(TradeOutcome::Loss, -0.010));
        }
        engine
    }

    fn request(balance: Decimal) -> SizingRequest<'static> {
        SizingRequest {
            current_price: dec!(1.1000),
            balance,
            confidence: 1.0,
            recent_prices: None,
            regime: None,
        }
    }

    #[test]
    fn test_kelly_stats_matches_formula() {
        let engine = engine_with_history();
        let stats = engine.kelly_stats("EUR_USD").unwrap();

        // p = 8/12, b = 0.015/0.010 = 1.5, f = (1.5 * 2/3 - 1/3) / 1.5
        assert!((stats.win_rate - 8.0 / 12.0).abs() < 1e-9);
        assert!((stats.odds_ratio - 1.5).abs() < 1e-9);
        let expected = (1.5 * (8.0 / 12.0) - 4.0 / 12.0) / 1.5;
        assert!((stats.raw_kelly - expected).abs() < 1e-9);
        assert!((stats.conservative_kelly - expected * 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_history_is_deterministic_fallback() {
        let mut engine = SizingEngine::new(SizingConfig::default());
        for _ in 0..5 {
            engine.record_trade("EUR_USD", record(TradeOutcome::Win, 0.02));
        }

        let a = engine.calculate("EUR_USD", &request(dec!(10000)));
        let b = engine.calculate("EUR_USD", &request(dec!(10000)));

        assert_eq!(a.final_fraction, 0.005);
        assert_eq!(a.final_fraction, b.final_fraction);
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert!(a.reasoning.contains("Insufficient history"));
    }

    #[test]
    fn test_one_sided_history_falls_back() {
        let mut engine = SizingEngine::new(SizingConfig::default());
        for _ in 0..15 {
            engine.record_trade("EUR_USD", record(TradeOutcome::Win, 0.02));
        }
        assert!(engine.kelly_stats("EUR_USD").is_none());
        let decision = engine.calculate("EUR_USD", &request(dec!(10000)));
        assert_eq!(decision.final_fraction, 0.005);
    }

    #[test]
    fn test_final_fraction_below_raw_kelly_and_ceiling() {
        let engine = engine_with_history();
        let decision = engine.calculate("EUR_USD", &request(dec!(10000)));

        assert!(decision.raw_kelly > 0.0);
        assert!(decision.final_fraction < decision.raw_kelly);
        assert!(decision.final_fraction <= 0.10);
        assert!(decision.final_fraction > 0.0);
    }

    #[test]
    fn test_regime_reduces_size() {
        let engine = engine_with_history();
        let neutral = engine.calculate("EUR_USD", &request(dec!(10000)));

        let mut sideways_request = request(dec!(10000));
        sideways_request.regime = Some(MarketRegime::Sideways);
        let sideways = engine.calculate("EUR_USD", &sideways_request);

        assert!(sideways.adjusted_fraction < neutral.adjusted_fraction);
        assert!((sideways.regime_adjustment - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_high_volatility_shrinks_position() {
        let engine = engine_with_history();

        // Calm series vs. a violent one
        let calm: Vec<f64> = (0..30).map(|i| 1.10 + (i % 2) as f64 * 0.0002).collect();
        let wild: Vec<f64> = (0..30)
            .map(|i| 1.10 * (1.0 + ((i % 2) as f64 * 2.0 - 1.0) * 0.05))
            .collect();

        let mut calm_request = request(dec!(10000));
        calm_request.recent_prices = Some(&calm);
        let mut wild_request = request(dec!(10000));
        wild_request.recent_prices = Some(&wild);

        let calm_decision = engine.calculate("EUR_USD", &calm_request);
        let wild_decision = engine.calculate("EUR_USD", &wild_request);

        assert!(wild_decision.volatility_adjustment < calm_decision.volatility_adjustment);
        assert!((wild_decision.volatility_adjustment - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_ceiling_is_enforced() {
        let mut config = SizingConfig::default();
        config.kelly_multiplier = 1.0; // full Kelly to force a large fraction
        let mut engine = SizingEngine::new(config);
        for _ in 0..20 {
            engine.record_trade("EUR_USD", record(TradeOutcome::Win, 0.05));
        }
        engine.record_trade("EUR_USD", record(TradeOutcome::Loss, -0.005));

        let decision = engine.calculate("EUR_USD", &request(dec!(10000)));
        assert!(decision.adjusted_fraction > decision.final_fraction);
        assert_eq!(decision.final_fraction, 0.10);
    }

    #[test]
    fn test_recommended_units() {
        let engine = engine_with_history();
        let decision = engine.calculate("EUR_USD", &request(dec!(10000)));
        let approx = 10_000.0 * decision.final_fraction / 1.1;
        assert!(decision.recommended_units > 0);
        assert!((decision.recommended_units as f64 - approx).abs() <= 1.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut engine = SizingEngine::new(SizingConfig::default());
        for _ in 0..150 {
            engine.record_trade("EUR_USD", record(TradeOutcome::Win, 0.01));
        }
        assert_eq!(engine.trades_recorded("EUR_USD"), 100);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SizingConfig::default();
        assert!(config.validate().is_ok());
        config.kelly_multiplier = 0.0;
        assert!(config.validate().is_err());

        let mut config = SizingConfig::default();
        config.fallback_fraction = 0.5;
        assert!(config.validate().is_err());
    }
}

//! Correlation exposure monitoring across the open portfolio.
//!
//! Keeps a rolling buffer of recent prices per symbol and computes Pearson
//! correlation of log-returns between a proposed instrument and every held
//! one. High correlation blocks the trade; moderate correlation shrinks it
//! proportionally to the total correlated exposure. Symbols without enough
//! observations fall back to an asset-class estimate, or to zero when the
//! pair spans classes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::domain::risk::volatility::log_returns;
use crate::domain::trading::types::MarketRegime;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Correlation at or above which a trade is blocked outright
    pub block_threshold: f64,
    /// Correlation at or above which the size is shrunk and a warning emitted
    pub warn_threshold: f64,
    /// Observations required before a measured correlation is trusted
    pub min_samples: usize,
    /// Retained price observations per symbol
    pub max_observations: usize,
    /// Assumed correlation for same-asset-class pairs lacking data
    pub same_class_fallback: f64,
    /// Ceiling on the proportional size reduction
    pub max_exposure_reduction: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            block_threshold: 0.70,
            warn_threshold: 0.50,
            min_samples: 20,
            max_observations: 120,
            same_class_fallback: 0.60,
            max_exposure_reduction: 0.5,
        }
    }
}

impl CorrelationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.block_threshold) {
            return Err(format!("Invalid block_threshold: {}", self.block_threshold));
        }
        if self.warn_threshold > self.block_threshold {
            return Err(format!(
                "warn_threshold {} must not exceed block_threshold {}",
                self.warn_threshold, self.block_threshold
            ));
        }
        if self.min_samples < 3 {
            return Err("min_samples must be >= 3".to_string());
        }
        if self.max_observations < self.min_samples {
            return Err("max_observations must be >= min_samples".to_string());
        }
        if !(0.0..=1.0).contains(&self.max_exposure_reduction) {
            return Err(format!(
                "Invalid max_exposure_reduction: {}",
                self.max_exposure_reduction
            ));
        }
        Ok(())
    }
}

/// Where a pairwise coefficient came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CorrelationSource {
    Measured { samples: usize },
    AssetClassFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairCorrelation {
    pub held_symbol: String,
    pub coefficient: f64,
    pub source: CorrelationSource,
    pub held_fraction: f64,
    /// Held fraction weighted by |coefficient|
    pub correlated_exposure: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationVerdict {
    Allow,
    Warn,
    Block,
}

/// Result of a correlation risk check for a proposed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationAssessment {
    pub symbol: String,
    pub proposed_fraction: f64,
    pub adjusted_fraction: f64,
    pub max_correlation: f64,
    pub total_correlated_exposure: f64,
    pub pairs: Vec<PairCorrelation>,
    pub verdict: CorrelationVerdict,
}

impl CorrelationAssessment {
    /// The held pair with the strongest correlation, if any.
    pub fn strongest_pair(&self) -> Option<&PairCorrelation> {
        self.pairs.iter().max_by(|a, b| {
            a.coefficient
                .abs()
                .partial_cmp(&b.coefficient.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

#[derive(Debug, Clone)]
struct ExposureEntry {
    fraction: f64,
    opened_at: DateTime<Utc>,
    regime: Option<MarketRegime>,
    asset_class: Option<&'static str>,
}

const FX_MAJOR: [&str; 7] = [
    "EUR_USD", "GBP_USD", "USD_JPY", "USD_CHF", "AUD_USD", "USD_CAD", "NZD_USD",
];
const FX_MINOR: [&str; 6] = [
    "EUR_GBP", "EUR_JPY", "EUR_CHF", "EUR_AUD", "GBP_JPY", "CHF_JPY",
];
const CRYPTO_MAJOR: [&str; 5] = ["BTC-USD", "ETH-USD", "BNB-USD", "SOL-USD", "XRP-USD"];
const CRYPTO_ALT: [&str; 5] = ["ADA-USD", "DOT-USD", "LINK-USD", "LTC-USD", "BCH-USD"];
const INDICES: [&str; 6] = ["US30", "SPX500", "NAS100", "UK100", "GER40", "JPN225"];

fn asset_class_of(symbol: &str) -> Option<&'static str> {
    if FX_MAJOR.contains(&symbol) {
        Some("fx_major")
    } else if FX_MINOR.contains(&symbol) {
        Some("fx_minor")
    } else if CRYPTO_MAJOR.contains(&symbol) {
        Some("crypto_major")
    } else if CRYPTO_ALT.contains(&symbol) {
        Some("crypto_alt")
    } else if INDICES.contains(&symbol) {
        Some("indices")
    } else {
        None
    }
}

pub struct CorrelationMonitor {
    config: CorrelationConfig,
    prices: HashMap<String, VecDeque<f64>>,
    positions: HashMap<String, ExposureEntry>,
}

impl CorrelationMonitor {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            config,
            prices: HashMap::new(),
            positions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Append a price observation to the symbol's rolling buffer.
    pub fn observe_price(&mut self, symbol: &str, price: f64) {
        if price <= 0.0 {
            return;
        }
        let buffer = self.prices.entry(symbol.to_string()).or_default();
        buffer.push_back(price);
        while buffer.len() > self.config.max_observations {
            buffer.pop_front();
        }
    }

    pub fn observations(&self, symbol: &str) -> usize {
        self.prices.get(symbol).map_or(0, VecDeque::len)
    }

    /// Pearson correlation of log-returns over the aligned tails of the two
    /// price buffers. None when either side is below the minimum sample.
    pub fn measured_correlation(&self, a: &str, b: &str) -> Option<(f64, usize)> {
        if a == b {
            return None;
        }
        let buf_a = self.prices.get(a)?;
        let buf_b = self.prices.get(b)?;
        let n = buf_a.len().min(buf_b.len());
        if n < self.config.min_samples {
            return None;
        }

        let tail_a: Vec<f64> = buf_a.iter().skip(buf_a.len() - n).copied().collect();
        let tail_b: Vec<f64> = buf_b.iter().skip(buf_b.len() - n).copied().collect();
        let returns_a = log_returns(&tail_a);
        let returns_b = log_returns(&tail_b);
        let len = returns_a.len().min(returns_b.len());
        if len < self.config.min_samples - 1 {
            return None;
        }

        let coefficient = pearson(&returns_a[..len], &returns_b[..len])?;
        Some((coefficient, len))
    }

    /// Best available correlation estimate for a pair: measured when the
    /// data supports it, the asset-class fallback otherwise.
    fn estimate(&self, a: &str, b: &str) -> Option<(f64, CorrelationSource)> {
        if let Some((coefficient, samples)) = self.measured_correlation(a, b) {
            return Some((coefficient, CorrelationSource::Measured { samples }));
        }
        match (asset_class_of(a), asset_class_of(b)) {
            (Some(class_a), Some(class_b)) if class_a == class_b => Some((
                self.config.same_class_fallback,
                CorrelationSource::AssetClassFallback,
            )),
            _ => None,
        }
    }

    /// Check a proposed position against every held instrument.
    pub fn assess(&self, symbol: &str, proposed_fraction: f64) -> CorrelationAssessment {
        let mut pairs = Vec::new();
        let mut total_correlated_exposure = 0.0;
        let mut max_correlation: f64 = 0.0;

        for (held_symbol, entry) in &self.positions {
            if held_symbol == symbol {
                continue;
            }
            let Some((coefficient, source)) = self.estimate(symbol, held_symbol) else {
                continue;
            };

            let strength = coefficient.abs();
            max_correlation = max_correlation.max(strength);

            if strength >= self.config.warn_threshold {
                let correlated_exposure = entry.fraction * strength;
                total_correlated_exposure += correlated_exposure;
                pairs.push(PairCorrelation {
                    held_symbol: held_symbol.clone(),
                    coefficient,
                    source,
                    held_fraction: entry.fraction,
                    correlated_exposure,
                });
            }
        }

        let verdict = if max_correlation >= self.config.block_threshold {
            CorrelationVerdict::Block
        } else if max_correlation >= self.config.warn_threshold {
            CorrelationVerdict::Warn
        } else {
            CorrelationVerdict::Allow
        };

        let adjusted_fraction = match verdict {
            CorrelationVerdict::Block => 0.0,
            _ if total_correlated_exposure > 0.0 => {
                let reduction = total_correlated_exposure.min(self.config.max_exposure_reduction);
                proposed_fraction * (1.0 - reduction)
            }
            _ => proposed_fraction,
        };

        if verdict == CorrelationVerdict::Block {
            warn!(
                "CorrelationMonitor: Blocking {} - max correlation {:.2} >= {:.2}",
                symbol, max_correlation, self.config.block_threshold
            );
        } else if verdict == CorrelationVerdict::Warn {
            warn!(
                "CorrelationMonitor: {} correlated at {:.2} with open positions, size {:.4} -> {:.4}",
                symbol, max_correlation, proposed_fraction, adjusted_fraction
            );
        }

        CorrelationAssessment {
            symbol: symbol.to_string(),
            proposed_fraction,
            adjusted_fraction,
            max_correlation,
            total_correlated_exposure,
            pairs,
            verdict,
        }
    }

    /// Track a newly opened exposure. Must be called exactly once per open.
    pub fn note_opened(&mut self, symbol: &str, fraction: f64, regime: Option<MarketRegime>) {
        self.positions.insert(
            symbol.to_string(),
            ExposureEntry {
                fraction,
                opened_at: Utc::now(),
                regime,
                asset_class: asset_class_of(symbol),
            },
        );
        debug!(
            "CorrelationMonitor: Tracking {} at {:.2}% of capital",
            symbol,
            fraction * 100.0
        );
    }

    /// Drop a closed exposure. Returns false if the symbol was not tracked.
    pub fn note_closed(&mut self, symbol: &str) -> bool {
        let removed = self.positions.remove(symbol).is_some();
        if removed {
            debug!("CorrelationMonitor: Released {}", symbol);
        }
        removed
    }

    pub fn held_symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn total_exposure(&self) -> f64 {
        self.positions.values().map(|p| p.fraction).sum()
    }

    /// Portfolio diversification score in [0, 1]: penalizes asset-class
    /// concentration and correlated holdings, rewards breadth.
    pub fn diversification_score(&self) -> f64 {
        if self.positions.is_empty() {
            return 1.0;
        }

        let mut group_exposure: HashMap<&str, f64> = HashMap::new();
        for entry in self.positions.values() {
            *group_exposure
                .entry(entry.asset_class.unwrap_or("uncategorized"))
                .or_default() += entry.fraction;
        }
        let max_group = group_exposure.values().copied().fold(0.0, f64::max);

        let mut score: f64 = 1.0;
        if max_group > 0.5 {
            score *= 0.7;
        } else if max_group > 0.3 {
            score *= 0.85;
        }

        // Penalize strongly correlated pairs already held together
        let symbols: Vec<&String> = self.positions.keys().collect();
        let mut high_correlations = Vec::new();
        for (i, a) in symbols.iter().enumerate() {
            for b in symbols.iter().skip(i + 1) {
                if let Some((coefficient, _)) = self.measured_correlation(a, b) {
                    if coefficient.abs() >= self.config.warn_threshold {
                        high_correlations.push(coefficient.abs());
                    }
                }
            }
        }
        if !high_correlations.is_empty() {
            let avg: f64 = high_correlations.iter().sum::<f64>() / high_correlations.len() as f64;
            score *= 1.0 - avg * 0.5;
        }

        score += (self.positions.len() as f64 / 10.0).min(0.1);
        score += (group_exposure.len() as f64 / 5.0).min(0.1);
        score.clamp(0.0, 1.0)
    }

    /// Regime recorded for a held symbol, if tracked.
    pub fn regime_of(&self, symbol: &str) -> Option<MarketRegime> {
        self.positions.get(symbol).and_then(|p| p.regime)
    }

    pub fn opened_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.positions.get(symbol).map(|p| p.opened_at)
    }
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let len = a.len().min(b.len());
    if len < 2 {
        return None;
    }

    let mean_a = a[..len].iter().sum::<f64>() / len as f64;
    let mean_b = b[..len].iter().sum::<f64>() / len as f64;

    let mut numer = 0.0;
    let mut denom_a = 0.0;
    let mut denom_b = 0.0;
    for i in 0..len {
        let diff_a = a[i] - mean_a;
        let diff_b = b[i] - mean_b;
        numer += diff_a * diff_b;
        denom_a += diff_a * diff_a;
        denom_b += diff_b * diff_b;
    }

    if denom_a == 0.0 || denom_b == 0.0 {
        return None;
    }

    let coefficient = numer / (denom_a.sqrt() * denom_b.sqrt());
    if coefficient.is_nan() {
        None
    } else {
        Some(coefficient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed two series whose moves share a common factor; `coupling` controls
    /// how much of each move is shared.
    fn feed_pair(monitor: &mut CorrelationMonitor, a: &str, b: &str, coupling: f64, n: usize) {
        let mut price_a = 1.1000;
        let mut price_b = 1.3000;
        for i in 0..n {
            // Deterministic pseudo-noise, different phase per leg
            let market = ((i as f64) * 0.7).sin() * 0.004;
            let noise_a = ((i as f64) * 1.9).cos() * 0.003;
            let noise_b = ((i as f64) * 2.3).sin() * 0.003;

            price_a *= 1.0 + market * coupling + noise_a * (1.0 - coupling);
            price_b *= 1.0 + market * coupling + noise_b * (1.0 - coupling);
            monitor.observe_price(a, price_a);
            monitor.observe_price(b, price_b);
        }
    }

    #[test]
    fn test_correlated_series_measure_high() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        feed_pair(&mut monitor, "EUR_USD", "GBP_USD", 0.95, 60);

        let (coefficient, samples) = monitor.measured_correlation("EUR_USD", "GBP_USD").unwrap();
        assert!(coefficient > 0.7, "expected strong correlation, got {coefficient}");
        assert!(samples >= 19);
    }

    #[test]
    fn test_independent_series_measure_low() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        feed_pair(&mut monitor, "EUR_USD", "BTC-USD", 0.0, 60);

        let (coefficient, _) = monitor.measured_correlation("EUR_USD", "BTC-USD").unwrap();
        assert!(coefficient.abs() < 0.5, "expected weak correlation, got {coefficient}");
    }

    #[test]
    fn test_insufficient_data_returns_none() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        for i in 0..10 {
            monitor.observe_price("EUR_USD", 1.10 + i as f64 * 0.001);
            monitor.observe_price("GBP_USD", 1.30 + i as f64 * 0.001);
        }
        assert!(monitor.measured_correlation("EUR_USD", "GBP_USD").is_none());
    }

    #[test]
    fn test_block_verdict_above_threshold() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        feed_pair(&mut monitor, "EUR_USD", "GBP_USD", 0.97, 80);
        monitor.note_opened("EUR_USD", 0.08, None);

        let assessment = monitor.assess("GBP_USD", 0.06);
        assert_eq!(assessment.verdict, CorrelationVerdict::Block);
        assert_eq!(assessment.adjusted_fraction, 0.0);
        assert!(assessment.max_correlation >= 0.70);
        assert_eq!(
            assessment.strongest_pair().unwrap().held_symbol,
            "EUR_USD"
        );
    }

    #[test]
    fn test_allow_when_uncorrelated() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        feed_pair(&mut monitor, "EUR_USD", "BTC-USD", 0.0, 80);
        monitor.note_opened("EUR_USD", 0.08, None);

        let assessment = monitor.assess("BTC-USD", 0.06);
        assert_eq!(assessment.verdict, CorrelationVerdict::Allow);
        assert_eq!(assessment.adjusted_fraction, 0.06);
    }

    #[test]
    fn test_asset_class_fallback_when_data_missing() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        monitor.note_opened("EUR_USD", 0.08, None);

        // GBP_USD has no price data; both are fx_major, so the fallback
        // coefficient (0.60) applies: warn and shrink, but no block.
        let assessment = monitor.assess("GBP_USD", 0.06);
        assert_eq!(assessment.verdict, CorrelationVerdict::Warn);
        assert!(assessment.adjusted_fraction < 0.06);
        assert_eq!(
            assessment.pairs[0].source,
            CorrelationSource::AssetClassFallback
        );
    }

    #[test]
    fn test_cross_class_pair_without_data_is_unknown() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        monitor.note_opened("EUR_USD", 0.08, None);

        let assessment = monitor.assess("BTC-USD", 0.06);
        assert_eq!(assessment.verdict, CorrelationVerdict::Allow);
        assert!(assessment.pairs.is_empty());
        assert_eq!(assessment.adjusted_fraction, 0.06);
    }

    #[test]
    fn test_shrink_proportional_to_correlated_exposure() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        monitor.note_opened("EUR_USD", 0.10, None);
        monitor.note_opened("USD_JPY", 0.10, None);

        // Both pairs fall back to 0.60: exposure = 2 * 0.10 * 0.60 = 0.12
        let assessment = monitor.assess("GBP_USD", 0.05);
        assert!((assessment.total_correlated_exposure - 0.12).abs() < 1e-9);
        assert!((assessment.adjusted_fraction - 0.05 * (1.0 - 0.12)).abs() < 1e-9);
    }

    #[test]
    fn test_exposure_reduction_is_capped() {
        let mut config = CorrelationConfig::default();
        config.same_class_fallback = 0.69; // below block, above warn
        let mut monitor = CorrelationMonitor::new(config);
        for symbol in ["EUR_USD", "USD_JPY", "USD_CHF", "AUD_USD", "USD_CAD"] {
            monitor.note_opened(symbol, 0.15, None);
        }

        let assessment = monitor.assess("GBP_USD", 0.08);
        // Correlated exposure far exceeds the 0.5 cap
        assert!(assessment.total_correlated_exposure > 0.5);
        assert!((assessment.adjusted_fraction - 0.08 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_position_table_round_trip() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        monitor.note_opened("EUR_USD", 0.08, Some(MarketRegime::Bullish));
        assert_eq!(monitor.total_exposure(), 0.08);
        assert_eq!(monitor.regime_of("EUR_USD"), Some(MarketRegime::Bullish));

        assert!(monitor.note_closed("EUR_USD"));
        assert!(!monitor.note_closed("EUR_USD"));
        assert_eq!(monitor.total_exposure(), 0.0);
    }

    #[test]
    fn test_diversification_score_penalizes_concentration() {
        let mut concentrated = CorrelationMonitor::new(CorrelationConfig::default());
        concentrated.note_opened("EUR_USD", 0.30, None);
        concentrated.note_opened("GBP_USD", 0.30, None);

        let mut spread = CorrelationMonitor::new(CorrelationConfig::default());
        spread.note_opened("EUR_USD", 0.05, None);
        spread.note_opened("BTC-USD", 0.05, None);
        spread.note_opened("US30", 0.05, None);

        assert!(spread.diversification_score() > concentrated.diversification_score());
        assert_eq!(
            CorrelationMonitor::new(CorrelationConfig::default()).diversification_score(),
            1.0
        );
    }

    #[test]
    fn test_price_buffer_is_bounded() {
        let mut monitor = CorrelationMonitor::new(CorrelationConfig::default());
        for i in 0..500 {
            monitor.observe_price("EUR_USD", 1.10 + (i % 7) as f64 * 0.0001);
        }
        assert_eq!(monitor.observations("EUR_USD"), 120);
    }
}

//! Volatility-based trailing stop distances.
//!
//! The trail distance is a multiple of short-term ATR that tightens
//! progressively as profit grows, loosening slightly when the trade has
//! momentum so winners can run. The computed distance is always clamped to
//! a min/max price band, and the resulting stop is only ever applied
//! through [`crate::domain::trading::position::Position::try_tighten_stop`],
//! which enforces the monotonic-tightening invariant.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::trading::types::Direction;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingConfig {
    /// Minimum trail distance in price units (10 pips for standard forex)
    pub min_distance: f64,
    /// Maximum trail distance in price units (100 pips for standard forex)
    pub max_distance: f64,
    /// Applied on top of the ladder multiple when momentum is active
    pub loosening_factor: f64,
    /// Profit in ATR multiples above which momentum is assumed
    pub momentum_threshold: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            min_distance: 0.001,
            max_distance: 0.01,
            loosening_factor: 1.15,
            momentum_threshold: 2.0,
        }
    }
}

impl TrailingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_distance <= 0.0 {
            return Err(format!("Invalid min_distance: {}", self.min_distance));
        }
        if self.max_distance < self.min_distance {
            return Err(format!(
                "max_distance {} must be >= min_distance {}",
                self.max_distance, self.min_distance
            ));
        }
        if self.loosening_factor < 1.0 {
            return Err(format!(
                "loosening_factor must be >= 1.0, got {}",
                self.loosening_factor
            ));
        }
        if self.momentum_threshold <= 0.0 {
            return Err(format!(
                "Invalid momentum_threshold: {}",
                self.momentum_threshold
            ));
        }
        Ok(())
    }
}

/// Ladder of ATR multiples by profit level. Tightens as the trade works:
///
/// | Profit (ATR multiples) | Trail multiple |
/// |------------------------|----------------|
/// | < 1                    | 1.2            |
/// | 1 - 2                  | 1.0            |
/// | 2 - 3                  | 0.8            |
/// | 3 - 4                  | 0.6            |
/// | 4 - 5                  | 0.5            |
/// | 5+                     | 0.4            |
fn ladder_multiple(profit_atr_multiple: f64) -> f64 {
    if profit_atr_multiple < 1.0 {
        1.2
    } else if profit_atr_multiple < 2.0 {
        1.0
    } else if profit_atr_multiple < 3.0 {
        0.8
    } else if profit_atr_multiple < 4.0 {
        0.6
    } else if profit_atr_multiple < 5.0 {
        0.5
    } else {
        0.4
    }
}

/// Trail distance in price units for the current profit level, clamped to
/// the configured band.
pub fn trail_distance(
    profit_atr_multiple: f64,
    atr: f64,
    momentum_active: bool,
    config: &TrailingConfig,
) -> Decimal {
    let loosening = if momentum_active {
        config.loosening_factor
    } else {
        1.0
    };
    let raw = atr * ladder_multiple(profit_atr_multiple) * loosening;
    let clamped = raw.clamp(config.min_distance, config.max_distance);
    Decimal::from_f64(clamped).unwrap_or(Decimal::ZERO)
}

/// Stop level implied by trailing the given distance behind the price.
pub fn proposed_stop(direction: Direction, price: Decimal, distance: Decimal) -> Decimal {
    match direction {
        Direction::Long => price - distance,
        Direction::Short => price + distance,
    }
}

//! Compliance charter: the fixed set of constraints every candidate trade
//! must satisfy before it may be placed.
//!
//! All validators are pure functions over the charter's constants. The
//! composite [`Charter::check_trade`] collects every failing rule rather
//! than stopping at the first, so callers can report a complete violation
//! list. Construction fails on an internally inconsistent rule set.

use chrono::Duration;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;
use thiserror::Error;

use crate::domain::errors::CharterError;
use crate::domain::trading::types::{Direction, Timeframe, TradeRequest};

/// A single failed charter rule.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CharterViolation {
    #[error("notional ${notional} below charter floor ${floor}")]
    NotionalBelowFloor { notional: Decimal, floor: Decimal },

    #[error("margin ${margin} below charter floor ${floor}")]
    MarginBelowFloor { margin: Decimal, floor: Decimal },

    #[error("{units} units below the {floor}-unit floor for {symbol}")]
    UnitsBelowFloor {
        symbol: String,
        units: u64,
        floor: u64,
    },

    #[error("risk:reward {ratio:.2} below charter minimum {minimum:.2}")]
    RiskRewardTooLow { ratio: f64, minimum: f64 },

    #[error("bracket orders are mandatory: missing {missing}")]
    MissingBracket { missing: &'static str },

    #[error("hold duration {hours}h exceeds charter maximum {max_hours}h")]
    HoldTooLong { hours: i64, max_hours: i64 },

    #[error("timeframe {timeframe} is not charter-approved")]
    TimeframeNotAllowed { timeframe: Timeframe },

    #[error("daily loss {loss_pct:.2}% breaches the {breaker_pct:.2}% circuit breaker")]
    DailyLossBreached { loss_pct: f64, breaker_pct: f64 },
}

/// Broker-compliant bracket levels derived from the charter's stop-distance
/// rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OcoLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub stop_distance: Decimal,
    pub risk_reward: f64,
}

const MAJOR_PAIRS: [&str; 7] = [
    "EUR_USD", "GBP_USD", "USD_JPY", "USD_CHF", "USD_CAD", "AUD_USD", "NZD_USD",
];

/// Immutable trading constraints.
///
/// The shipped defaults reproduce the constants the system was validated
/// with; overrides go through [`Charter::with_limits`] which re-checks
/// consistency.
#[derive(Debug, Clone)]
pub struct Charter {
    pub min_notional_usd: Decimal,
    pub min_margin_usd: Decimal,
    pub major_pairs_min_units: u64,
    pub other_fx_min_units: u64,
    pub min_risk_reward: f64,
    pub max_hold_duration: Duration,
    pub allowed_timeframes: HashSet<Timeframe>,
    pub rejected_timeframes: HashSet<Timeframe>,
    pub daily_loss_breaker_pct: f64,
    pub max_portfolio_risk_pct: f64,
    pub max_correlated_exposure_pct: f64,
    pub max_concurrent_positions: usize,
    pub max_daily_trades: usize,
    pub default_min_stop_pips: f64,
    pub stop_buffer_multiplier: f64,
    pub min_stop_buffer_pips: f64,
}

impl Charter {
    /// The standard charter. Fails only if the built-in constants have been
    /// edited into an inconsistent state.
    pub fn standard() -> Result<Self, CharterError> {
        Self::with_limits(Charter {
            min_notional_usd: Decimal::ONE_HUNDRED,
            min_margin_usd: Decimal::from(25),
            major_pairs_min_units: 2500,
            other_fx_min_units: 1000,
            min_risk_reward: 2.0,
            max_hold_duration: Duration::hours(6),
            allowed_timeframes: HashSet::from([Timeframe::M15, Timeframe::M30, Timeframe::H1]),
            rejected_timeframes: HashSet::from([Timeframe::M1, Timeframe::M5]),
            daily_loss_breaker_pct: 0.05,
            max_portfolio_risk_pct: 0.10,
            max_correlated_exposure_pct: 0.15,
            max_concurrent_positions: 5,
            max_daily_trades: 20,
            default_min_stop_pips: 3.0,
            stop_buffer_multiplier: 1.5,
            min_stop_buffer_pips: 2.0,
        })
    }

    /// Validate and adopt a custom rule set.
    pub fn with_limits(charter: Charter) -> Result<Self, CharterError> {
        if let Some(tf) = charter
            .allowed_timeframes
            .intersection(&charter.rejected_timeframes)
            .next()
        {
            return Err(CharterError::ConflictingTimeframe {
                timeframe: tf.to_string(),
            });
        }
        if charter.allowed_timeframes.is_empty() {
            return Err(CharterError::NoAllowedTimeframes);
        }
        if charter.min_risk_reward < 1.0 {
            return Err(CharterError::InvalidRiskReward(charter.min_risk_reward));
        }
        if charter.daily_loss_breaker_pct <= 0.0 || charter.daily_loss_breaker_pct >= 1.0 {
            return Err(CharterError::InvalidLossBreaker(
                charter.daily_loss_breaker_pct,
            ));
        }
        if charter.min_notional_usd <= Decimal::ZERO {
            return Err(CharterError::NonPositiveLimit {
                field: "min_notional_usd",
                value: charter.min_notional_usd.to_string(),
            });
        }
        if charter.min_margin_usd <= Decimal::ZERO {
            return Err(CharterError::NonPositiveLimit {
                field: "min_margin_usd",
                value: charter.min_margin_usd.to_string(),
            });
        }
        if charter.max_hold_duration <= Duration::zero() {
            return Err(CharterError::NonPositiveLimit {
                field: "max_hold_duration",
                value: charter.max_hold_duration.num_hours().to_string(),
            });
        }
        if charter.max_concurrent_positions == 0 {
            return Err(CharterError::ZeroConcurrencyLimit);
        }
        Ok(charter)
    }

    pub fn is_major_pair(symbol: &str) -> bool {
        MAJOR_PAIRS.contains(&symbol)
    }

    /// Pip value for a symbol: JPY pairs quote pips at 0.01.
    pub fn pip_value(symbol: &str) -> Decimal {
        if symbol.contains("JPY") {
            Decimal::new(1, 2) // 0.01
        } else {
            Decimal::new(1, 4) // 0.0001
        }
    }

    pub fn validate_notional(&self, notional_usd: Decimal) -> Result<(), CharterViolation> {
        if notional_usd < self.min_notional_usd {
            return Err(CharterViolation::NotionalBelowFloor {
                notional: notional_usd,
                floor: self.min_notional_usd,
            });
        }
        Ok(())
    }

    pub fn validate_margin(&self, margin_usd: Decimal) -> Result<(), CharterViolation> {
        if margin_usd < self.min_margin_usd {
            return Err(CharterViolation::MarginBelowFloor {
                margin: margin_usd,
                floor: self.min_margin_usd,
            });
        }
        Ok(())
    }

    pub fn validate_units(&self, symbol: &str, units: u64) -> Result<(), CharterViolation> {
        let floor = if Self::is_major_pair(symbol) {
            self.major_pairs_min_units
        } else {
            self.other_fx_min_units
        };
        if units < floor {
            return Err(CharterViolation::UnitsBelowFloor {
                symbol: symbol.to_string(),
                units,
                floor,
            });
        }
        Ok(())
    }

    pub fn validate_risk_reward(&self, ratio: f64) -> Result<(), CharterViolation> {
        if ratio < self.min_risk_reward {
            return Err(CharterViolation::RiskRewardTooLow {
                ratio,
                minimum: self.min_risk_reward,
            });
        }
        Ok(())
    }

    pub fn validate_hold_duration(&self, held: Duration) -> Result<(), CharterViolation> {
        if held > self.max_hold_duration {
            return Err(CharterViolation::HoldTooLong {
                hours: held.num_hours(),
                max_hours: self.max_hold_duration.num_hours(),
            });
        }
        Ok(())
    }

    pub fn validate_timeframe(&self, timeframe: Timeframe) -> Result<(), CharterViolation> {
        if !self.allowed_timeframes.contains(&timeframe) {
            return Err(CharterViolation::TimeframeNotAllowed { timeframe });
        }
        Ok(())
    }

    /// Daily-loss circuit breaker over a measured loss fraction (positive =
    /// loss).
    pub fn validate_daily_loss(&self, loss_pct: f64) -> Result<(), CharterViolation> {
        if loss_pct >= self.daily_loss_breaker_pct {
            return Err(CharterViolation::DailyLossBreached {
                loss_pct: loss_pct * 100.0,
                breaker_pct: self.daily_loss_breaker_pct * 100.0,
            });
        }
        Ok(())
    }

    /// Run every applicable validator over a candidate trade and collect all
    /// failures.
    pub fn check_trade(&self, request: &TradeRequest) -> Vec<CharterViolation> {
        let mut violations = Vec::new();

        if let Err(v) = self.validate_notional(request.notional_usd) {
            violations.push(v);
        }
        if let Err(v) = self.validate_margin(request.margin_usd) {
            violations.push(v);
        }
        if let Err(v) = self.validate_units(&request.symbol, request.units) {
            violations.push(v);
        }
        if let Err(v) = self.validate_timeframe(request.timeframe) {
            violations.push(v);
        }

        // Bracket orders are mandatory: no stop loss + take profit, no trade.
        match (request.stop_loss, request.take_profit) {
            (None, None) => violations.push(CharterViolation::MissingBracket {
                missing: "stop loss and take profit",
            }),
            (None, Some(_)) => violations.push(CharterViolation::MissingBracket {
                missing: "stop loss",
            }),
            (Some(_), None) => violations.push(CharterViolation::MissingBracket {
                missing: "take profit",
            }),
            (Some(_), Some(_)) => {
                if let Some(ratio) = request.risk_reward() {
                    if let Err(v) = self.validate_risk_reward(ratio) {
                        violations.push(v);
                    }
                }
            }
        }

        violations
    }

    /// Stop distance in price units: broker minimum plus a safety buffer.
    pub fn required_stop_distance(&self, symbol: &str, broker_min_pips: Option<f64>) -> Decimal {
        let pip = Self::pip_value(symbol);
        let broker_min = broker_min_pips.unwrap_or(self.default_min_stop_pips);
        let buffer = (self.stop_buffer_multiplier * broker_min).max(self.min_stop_buffer_pips);
        let total_pips = broker_min + buffer;
        Decimal::from_f64(total_pips).unwrap_or(Decimal::ZERO) * pip
    }

    /// Bracket levels at the charter's minimum risk:reward, respecting the
    /// broker's stop-distance rules.
    pub fn oco_levels(
        &self,
        symbol: &str,
        direction: Direction,
        entry_price: Decimal,
        broker_min_pips: Option<f64>,
    ) -> OcoLevels {
        let distance = self.required_stop_distance(symbol, broker_min_pips);
        let reward = Decimal::from_f64(self.min_risk_reward).unwrap_or(Decimal::TWO) * distance;
        let (stop_loss, take_profit) = match direction {
            Direction::Long => (entry_price - distance, entry_price + reward),
            Direction::Short => (entry_price + distance, entry_price - reward),
        };
        OcoLevels {
            stop_loss,
            take_profit,
            stop_distance: distance,
            risk_reward: self.min_risk_reward,
        }
    }
}

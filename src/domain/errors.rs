use thiserror::Error;

/// Errors raised when the compliance charter is internally inconsistent.
///
/// Any of these is fatal at construction time: a charter that cannot prove
/// its own consistency must never accept a trade.
#[derive(Debug, Error)]
pub enum CharterError {
    #[error("timeframe {timeframe} is listed as both allowed and rejected")]
    ConflictingTimeframe { timeframe: String },

    #[error("min_risk_reward must be >= 1.0, got {0}")]
    InvalidRiskReward(f64),

    #[error("daily_loss_breaker_pct must be within (0, 1), got {0}")]
    InvalidLossBreaker(f64),

    #[error("{field} must be positive, got {value}")]
    NonPositiveLimit { field: &'static str, value: String },

    #[error("max_concurrent_positions must be > 0")]
    ZeroConcurrencyLimit,

    #[error("no allowed timeframes configured")]
    NoAllowedTimeframes,
}

/// Errors related to market data availability.
///
/// These are recoverable: callers fall back to the last known price or a
/// conservative default and flag degraded mode.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("no market data available for {symbol}")]
    Unavailable { symbol: String },

    #[error("price fetch for {symbol} timed out after {timeout_ms}ms")]
    Timeout { symbol: String, timeout_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charter_error_formatting() {
        let err = CharterError::ConflictingTimeframe {
            timeframe: "M15".to_string(),
        };
        assert!(err.to_string().contains("M15"));

        let err = CharterError::InvalidRiskReward(0.5);
        assert!(err.to_string().contains("0.5"));
    }

    #[test]
    fn test_market_data_error_formatting() {
        let err = MarketDataError::Timeout {
            symbol: "EUR_USD".to_string(),
            timeout_ms: 5000,
        };
        let msg = err.to_string();
        assert!(msg.contains("EUR_USD"));
        assert!(msg.contains("5000"));
    }
}

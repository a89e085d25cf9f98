use crate::domain::trading::types::{BrokerOrder, BrokerPosition, Quote};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;

// Need async_trait for async functions in traits
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>>;
    async fn get_orders(&self) -> Result<Vec<BrokerOrder>>;
    async fn get_account_balance(&self) -> Result<Decimal>;
    /// Request a close; returns false if the broker refused.
    async fn close_position(&self, position_id: &str) -> Result<bool>;
    async fn get_current_bid_ask(&self, symbol: &str) -> Result<Quote>;
}

/// Source of recent prices for volatility and correlation calculations.
#[async_trait]
pub trait PriceHistorySource: Send + Sync {
    async fn recent_prices(&self, symbol: &str, window: usize) -> Result<Vec<f64>>;
}

/// Kinds of alerts the core emits. Closed set so consumers can match
/// exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    OcoViolation,
    ValidatorError,
    LifecycleFailClosed,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::OcoViolation => "OCO_VIOLATION",
            AlertKind::ValidatorError => "VALIDATOR_ERROR",
            AlertKind::LifecycleFailClosed => "LIFECYCLE_FAIL_CLOSED",
        };
        write!(f, "{}", s)
    }
}

/// Best-effort alert delivery. Failures are logged by callers, never
/// propagated into the validation path.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, kind: AlertKind, message: &str) -> Result<()>;
}

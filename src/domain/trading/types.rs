use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Side of the order that closes a position in this direction.
    pub fn closing_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::Limit => write!(f, "LIMIT"),
            OrderKind::Stop => write!(f, "STOP"),
            OrderKind::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

/// Execution timeframe of a candidate trade.
///
/// M1 and M5 exist so that the charter can name them as explicitly rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "M30" => Ok(Timeframe::M30),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            _ => anyhow::bail!("Invalid timeframe: {}", s),
        }
    }
}

/// Market regime classification supplied by an external regime detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketRegime {
    Bullish,
    Bearish,
    Sideways,
}

/// Outcome of a completed trade, as recorded into sizing history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    Win,
    Loss,
    Breakeven,
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeOutcome::Win => write!(f, "WIN"),
            TradeOutcome::Loss => write!(f, "LOSS"),
            TradeOutcome::Breakeven => write!(f, "BREAKEVEN"),
        }
    }
}

/// Bid/ask quote returned by a broker collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Price at which a position in the given direction would be closed.
    pub fn exit_price(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Long => self.bid,
            Direction::Short => self.ask,
        }
    }
}

/// Open position as reported by a broker collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl BrokerPosition {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.current_price
    }
}

/// Outstanding order as reported by a broker collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

/// Candidate trade submitted to the charter for compliance checking.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRequest {
    pub symbol: String,
    pub direction: Direction,
    pub units: u64,
    pub notional_usd: Decimal,
    pub margin_usd: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub timeframe: Timeframe,
}

impl TradeRequest {
    /// Risk:reward ratio implied by the bracket levels, if both are present
    /// and the stop distance is non-zero.
    pub fn risk_reward(&self) -> Option<f64> {
        use rust_decimal::prelude::ToPrimitive;

        let stop = self.stop_loss?;
        let target = self.take_profit?;
        let risk = (self.entry_price - stop).abs();
        let reward = (target - self.entry_price).abs();
        if risk.is_zero() {
            return None;
        }
        (reward / risk).to_f64()
    }
}

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::trading::types::Direction;

/// Lifecycle states of a supervised position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Active,
    Trailing,
    Closing,
    Closed,
    Expired,
    Stopped,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionStatus::Closed | PositionStatus::Expired | PositionStatus::Stopped
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::Active => "active",
            PositionStatus::Trailing => "trailing",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
            PositionStatus::Expired => "expired",
            PositionStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Final outcome reported by a supervisor when it terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionOutcome {
    TargetHit,
    StoppedOut,
    TtlExpired,
    ExternalStop,
    /// Market data was unavailable for too long; the position was closed
    /// rather than left unmanaged.
    DataLost,
}

impl fmt::Display for PositionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionOutcome::TargetHit => "target_hit",
            PositionOutcome::StoppedOut => "stopped_out",
            PositionOutcome::TtlExpired => "ttl_expired",
            PositionOutcome::ExternalStop => "external_stop",
            PositionOutcome::DataLost => "data_lost",
        };
        write!(f, "{}", s)
    }
}

/// Everything needed to open a supervised position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSpec {
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub stop_loss: Decimal,
    pub ttl: Duration,
}

/// A live position, owned exclusively by its lifecycle supervisor.
///
/// `current_stop` only ever moves in the risk-reducing direction once
/// trailing begins; all stop updates go through [`Position::try_tighten_stop`].
#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub target_price: Decimal,
    pub initial_stop: Decimal,
    pub current_stop: Decimal,
    pub opened_at: DateTime<Utc>,
    pub ttl: Duration,
    pub status: PositionStatus,
    pub unrealized_pnl: Decimal,
    pub max_favorable: Decimal,
    pub last_update: DateTime<Utc>,
}

impl Position {
    pub fn open(spec: PositionSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: spec.symbol,
            direction: spec.direction,
            quantity: spec.quantity,
            entry_price: spec.entry_price,
            current_price: spec.entry_price,
            target_price: spec.target_price,
            initial_stop: spec.stop_loss,
            current_stop: spec.stop_loss,
            opened_at: now,
            ttl: spec.ttl,
            status: PositionStatus::Active,
            unrealized_pnl: Decimal::ZERO,
            max_favorable: Decimal::ZERO,
            last_update: now,
        }
    }

    /// Update unrealized P&L and maximum favorable excursion from a fresh price.
    pub fn update_market(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.current_price = price;
        self.unrealized_pnl = match self.direction {
            Direction::Long => (price - self.entry_price) * self.quantity,
            Direction::Short => (self.entry_price - price) * self.quantity,
        };

        let favorable = match self.direction {
            Direction::Long => price - self.entry_price,
            Direction::Short => self.entry_price - price,
        };
        if favorable > self.max_favorable {
            self.max_favorable = favorable;
        }

        self.last_update = now;
    }

    pub fn target_hit(&self, price: Decimal) -> bool {
        match self.direction {
            Direction::Long => price >= self.target_price,
            Direction::Short => price <= self.target_price,
        }
    }

    pub fn stop_hit(&self, price: Decimal) -> bool {
        match self.direction {
            Direction::Long => price <= self.current_stop,
            Direction::Short => price >= self.current_stop,
        }
    }

    pub fn ttl_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.opened_at > self.ttl
    }

    pub fn ttl_remaining(&self, now: DateTime<Utc>) -> Duration {
        let remaining = self.ttl - (now - self.opened_at);
        if remaining < Duration::zero() {
            Duration::zero()
        } else {
            remaining
        }
    }

    /// Accept a new stop only if it is strictly more favorable than the
    /// current one. Returns true if the stop moved.
    pub fn try_tighten_stop(&mut self, candidate: Decimal) -> bool {
        let improves = match self.direction {
            Direction::Long => candidate > self.current_stop,
            Direction::Short => candidate < self.current_stop,
        };
        if improves {
            self.current_stop = candidate;
        }
        improves
    }

    /// Favorable excursion expressed in multiples of the given ATR.
    pub fn profit_atr_multiple(&self, atr: f64) -> f64 {
        use rust_decimal::prelude::ToPrimitive;

        if atr <= 0.0 {
            return 0.0;
        }
        let favorable = match self.direction {
            Direction::Long => self.current_price - self.entry_price,
            Direction::Short => self.entry_price - self.current_price,
        };
        favorable.to_f64().unwrap_or(0.0) / atr
    }

    pub fn snapshot(&self, now: DateTime<Utc>, outcome: Option<PositionOutcome>) -> PositionSnapshot {
        PositionSnapshot {
            id: self.id,
            symbol: self.symbol.clone(),
            direction: self.direction,
            status: self.status,
            entry_price: self.entry_price,
            current_price: self.current_price,
            current_stop: self.current_stop,
            target_price: self.target_price,
            unrealized_pnl: self.unrealized_pnl,
            max_favorable: self.max_favorable,
            opened_at: self.opened_at,
            ttl_remaining_secs: self.ttl_remaining(now).num_seconds(),
            outcome,
        }
    }
}

/// Read-only view of a supervised position, published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub status: PositionStatus,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub current_stop: Decimal,
    pub target_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub max_favorable: Decimal,
    pub opened_at: DateTime<Utc>,
    pub ttl_remaining_secs: i64,
    pub outcome: Option<PositionOutcome>,
}

//! Per-position lifecycle supervision.
//!
//! Every open position gets its own tokio task that owns the `Position`
//! exclusively until it reaches a terminal state. Each tick the supervisor
//! fetches a fresh quote (bounded timeout, last-known-price fallback),
//! updates P&L, then checks in fixed priority order: target hit, stop hit,
//! TTL expiry, trailing-stop tightening. The stop signal is observed every
//! tick, and a terminal snapshot is always published - including on the
//! market-data failure path, where the position is closed rather than left
//! unmanaged.

use anyhow::{bail, Result};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::errors::MarketDataError;
use crate::domain::ports::BrokerClient;
use crate::domain::risk::trailing::{self, TrailingConfig};
use crate::domain::risk::volatility;
use crate::domain::trading::position::{
    Position, PositionOutcome, PositionSnapshot, PositionSpec, PositionStatus,
};
use crate::infrastructure::observability::Metrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Sleep between evaluation ticks
    pub tick_interval_ms: u64,
    /// Timeout for a single quote fetch
    pub price_timeout_ms: u64,
    /// Consecutive failed fetches tolerated before failing closed
    pub max_stale_ticks: u32,
    /// ATR period for the trailing distance
    pub atr_period: usize,
    /// Price observations kept for ATR computation
    pub price_window: usize,
    pub trailing: TrailingConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10_000,
            price_timeout_ms: 5_000,
            max_stale_ticks: 10,
            atr_period: 14,
            price_window: 32,
            trailing: TrailingConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be > 0".to_string());
        }
        if self.price_timeout_ms == 0 {
            return Err("price_timeout_ms must be > 0".to_string());
        }
        if self.max_stale_ticks == 0 {
            return Err("max_stale_ticks must be > 0".to_string());
        }
        if self.atr_period == 0 || self.price_window <= self.atr_period {
            return Err(format!(
                "price_window {} must exceed atr_period {}",
                self.price_window, self.atr_period
            ));
        }
        self.trailing.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Maximum concurrently supervised positions, enforced before spawning
    pub max_concurrent: usize,
    pub supervisor: SupervisorConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be > 0".to_string());
        }
        self.supervisor.validate()
    }
}

/// Handle to a running supervisor: stop signal, snapshot channel, join.
pub struct PositionHandle {
    id: Uuid,
    symbol: String,
    stop_tx: watch::Sender<bool>,
    snapshot_rx: watch::Receiver<PositionSnapshot>,
    join: JoinHandle<PositionOutcome>,
}

impl PositionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Signal the supervisor to stop. It will observe the signal on its
    /// next tick and terminate with `ExternalStop`.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Latest published snapshot.
    pub fn status(&self) -> PositionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the supervisor to terminate and return its final outcome.
    /// A panicked task reports `DataLost` (fail-closed) rather than hiding
    /// the position.
    pub async fn join(self) -> PositionOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("PositionSupervisor task failed: {}", e);
                PositionOutcome::DataLost
            }
        }
    }
}

/// Spawns and tracks one supervisor task per open position.
pub struct LifecycleManager {
    config: LifecycleConfig,
    broker: Arc<dyn BrokerClient>,
    handles: HashMap<Uuid, PositionHandle>,
    metrics: Option<Metrics>,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        broker: Arc<dyn BrokerClient>,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        if let Err(e) = config.validate() {
            bail!("Lifecycle configuration error: {}", e);
        }
        Ok(Self {
            config,
            broker,
            handles: HashMap::new(),
            metrics,
        })
    }

    /// Spawn a dedicated supervisor for a new position. Fails if the
    /// concurrent-position bound is already met.
    pub fn spawn(&mut self, spec: PositionSpec) -> Result<Uuid> {
        self.reap_finished();
        if self.active_count() >= self.config.max_concurrent {
            bail!(
                "concurrent position limit reached ({}/{})",
                self.active_count(),
                self.config.max_concurrent
            );
        }

        let position = Position::open(spec, Utc::now());
        let id = position.id;
        let symbol = position.symbol.clone();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (snapshot_tx, snapshot_rx) = watch::channel(position.snapshot(Utc::now(), None));

        let supervisor = PositionSupervisor {
            position,
            config: self.config.supervisor.clone(),
            broker: self.broker.clone(),
            stop_rx,
            snapshot_tx,
            prices: VecDeque::new(),
            stale_ticks: 0,
            metrics: self.metrics.clone(),
        };

        let join = tokio::spawn(supervisor.run());
        info!(
            "LifecycleManager: spawned supervisor for {} position {} ({}/{} active)",
            symbol,
            id,
            self.active_count() + 1,
            self.config.max_concurrent
        );

        self.handles.insert(
            id,
            PositionHandle {
                id,
                symbol,
                stop_tx,
                snapshot_rx,
                join,
            },
        );
        if let Some(metrics) = &self.metrics {
            metrics.active_positions.set(self.active_count() as f64);
        }
        Ok(id)
    }

    pub fn stop(&self, id: Uuid) -> bool {
        match self.handles.get(&id) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for handle in self.handles.values() {
            handle.stop();
        }
        info!("LifecycleManager: stop signal sent to all supervisors");
    }

    pub fn status(&self, id: Uuid) -> Option<PositionSnapshot> {
        self.handles.get(&id).map(PositionHandle::status)
    }

    pub fn statuses(&self) -> Vec<PositionSnapshot> {
        self.handles.values().map(PositionHandle::status).collect()
    }

    /// Supervisors still running (finished ones are pruned lazily).
    pub fn active_count(&self) -> usize {
        self.handles.values().filter(|h| !h.is_finished()).count()
    }

    /// Remove and return the handle, e.g. to await its final outcome.
    pub fn take_handle(&mut self, id: Uuid) -> Option<PositionHandle> {
        self.handles.remove(&id)
    }

    fn reap_finished(&mut self) {
        self.handles.retain(|_, handle| !handle.is_finished());
        if let Some(metrics) = &self.metrics {
            metrics.active_positions.set(self.active_count() as f64);
        }
    }
}

struct PositionSupervisor {
    position: Position,
    config: SupervisorConfig,
    broker: Arc<dyn BrokerClient>,
    stop_rx: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<PositionSnapshot>,
    prices: VecDeque<f64>,
    stale_ticks: u32,
    metrics: Option<Metrics>,
}

enum TickResult {
    Continue,
    Terminal(PositionOutcome),
}

impl PositionSupervisor {
    async fn run(mut self) -> PositionOutcome {
        let symbol = self.position.symbol.clone();
        info!(
            "PositionSupervisor [{}]: managing position {} ({} {} @ {})",
            symbol,
            self.position.id,
            self.position.direction,
            self.position.quantity,
            self.position.entry_price
        );

        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                changed = self.stop_rx.changed() => {
                    // A dropped sender also counts as a stop request
                    if changed.is_err() || *self.stop_rx.borrow() {
                        info!("PositionSupervisor [{}]: external stop received", symbol);
                        self.position.status = PositionStatus::Closed;
                        break PositionOutcome::ExternalStop;
                    }
                }
                _ = ticker.tick() => {
                    match self.evaluate_tick().await {
                        TickResult::Continue => {}
                        TickResult::Terminal(outcome) => break outcome,
                    }
                }
            }
        };

        // Always report the final state, whatever path ended the loop
        self.publish(Some(outcome));
        if let Some(metrics) = &self.metrics {
            metrics
                .position_outcomes_total
                .with_label_values(&[&outcome.to_string()])
                .inc();
        }
        info!(
            "PositionSupervisor [{}]: terminated with {} | P&L {} | max favorable {}",
            symbol, outcome, self.position.unrealized_pnl, self.position.max_favorable
        );
        outcome
    }

    async fn evaluate_tick(&mut self) -> TickResult {
        let symbol = self.position.symbol.clone();

        let price = match self.fetch_price().await {
            Some(price) => {
                self.stale_ticks = 0;
                price
            }
            None => {
                self.stale_ticks += 1;
                if self.stale_ticks >= self.config.max_stale_ticks {
                    // Fail closed: a position we cannot price may not stay open
                    error!(
                        "PositionSupervisor [{}]: no market data for {} consecutive ticks, closing",
                        symbol, self.stale_ticks
                    );
                    self.position.status = PositionStatus::Closed;
                    return TickResult::Terminal(PositionOutcome::DataLost);
                }
                match self.last_price() {
                    Some(price) => {
                        warn!(
                            "PositionSupervisor [{}]: price fetch failed ({}), using last known",
                            symbol, self.stale_ticks
                        );
                        price
                    }
                    None => {
                        let err = MarketDataError::Unavailable {
                            symbol: symbol.clone(),
                        };
                        warn!("PositionSupervisor [{}]: {}, no prior data to fall back on", symbol, err);
                        self.publish(None);
                        return TickResult::Continue;
                    }
                }
            }
        };

        let now = Utc::now();
        self.position.update_market(price, now);

        // 1. Target
        if self.position.target_hit(price) {
            info!(
                "PositionSupervisor [{}]: target hit at {}, closing",
                symbol, price
            );
            self.position.status = PositionStatus::Closing;
            self.publish(None);
            self.position.status = PositionStatus::Closed;
            return TickResult::Terminal(PositionOutcome::TargetHit);
        }

        // 2. Stop loss
        if self.position.stop_hit(price) {
            info!(
                "PositionSupervisor [{}]: stop {} hit at {}",
                symbol, self.position.current_stop, price
            );
            self.position.status = PositionStatus::Stopped;
            return TickResult::Terminal(PositionOutcome::StoppedOut);
        }

        // 3. Time to live
        if self.position.ttl_expired(now) {
            info!("PositionSupervisor [{}]: TTL elapsed, expiring", symbol);
            self.position.status = PositionStatus::Expired;
            return TickResult::Terminal(PositionOutcome::TtlExpired);
        }

        // 4. Trailing stop
        self.maybe_trail(price);

        self.publish(None);
        TickResult::Continue
    }

    fn maybe_trail(&mut self, price: rust_decimal::Decimal) {
        let atr = match volatility::average_true_range(
            self.prices.make_contiguous(),
            self.config.atr_period,
        ) {
            Some(atr) => atr,
            None => return, // not enough data yet
        };

        let profit_atr = self.position.profit_atr_multiple(atr);
        let momentum = profit_atr > self.config.trailing.momentum_threshold;
        let distance = trailing::trail_distance(profit_atr, atr, momentum, &self.config.trailing);
        let candidate = trailing::proposed_stop(self.position.direction, price, distance);

        let previous = self.position.current_stop;
        if self.position.try_tighten_stop(candidate) {
            self.position.status = PositionStatus::Trailing;
            info!(
                "PositionSupervisor [{}]: trailing stop {} -> {} (price {}, atr {:.6})",
                self.position.symbol, previous, self.position.current_stop, price, atr
            );
        }
    }

    async fn fetch_price(&mut self) -> Option<rust_decimal::Decimal> {
        let quote = timeout(
            Duration::from_millis(self.config.price_timeout_ms),
            self.broker.get_current_bid_ask(&self.position.symbol),
        )
        .await;

        match quote {
            Ok(Ok(quote)) => {
                let price = quote.exit_price(self.position.direction);
                if let Some(value) = price.to_f64() {
                    self.prices.push_back(value);
                    while self.prices.len() > self.config.price_window {
                        self.prices.pop_front();
                    }
                }
                Some(price)
            }
            Ok(Err(e)) => {
                warn!(
                    "PositionSupervisor [{}]: quote fetch failed: {}",
                    self.position.symbol, e
                );
                None
            }
            Err(_) => {
                let err = MarketDataError::Timeout {
                    symbol: self.position.symbol.clone(),
                    timeout_ms: self.config.price_timeout_ms,
                };
                warn!("PositionSupervisor [{}]: {}", self.position.symbol, err);
                None
            }
        }
    }

    fn last_price(&self) -> Option<rust_decimal::Decimal> {
        use rust_decimal::prelude::FromPrimitive;
        self.prices
            .back()
            .and_then(|p| rust_decimal::Decimal::from_f64(*p))
    }

    fn publish(&self, outcome: Option<PositionOutcome>) {
        let _ = self
            .snapshot_tx
            .send(self.position.snapshot(Utc::now(), outcome));
    }
}

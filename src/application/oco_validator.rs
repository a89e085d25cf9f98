//! Periodic OCO bracket audit over all open positions.
//!
//! Independent of any lifecycle supervisor: on every run the validator
//! pulls the full position and order books from the broker collaborator,
//! matches opposing protective orders to each position, and classifies it.
//! A position missing both brackets, or whose exposure exceeds the
//! force-close threshold, is closed immediately. Every result is appended
//! to a durable JSONL audit log with a monotonically increasing validation
//! counter so violation rates are reconstructable from the log alone.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::application::audit_log::AuditLog;
use crate::domain::ports::{AlertKind, AlertSink, BrokerClient};
use crate::domain::trading::types::{BrokerOrder, BrokerPosition, OrderKind};
use crate::infrastructure::observability::Metrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcoValidatorConfig {
    /// Risk per position above which a warning becomes a concern
    pub max_risk_per_position: f64,
    /// Exposure fraction above which an unprotected position is closed
    pub force_close_threshold: f64,
    /// Validation cadence
    pub interval_ms: u64,
    /// Balance assumed when the broker cannot report one
    pub fallback_balance: f64,
}

impl Default for OcoValidatorConfig {
    fn default() -> Self {
        Self {
            max_risk_per_position: 0.02,
            force_close_threshold: 0.05,
            interval_ms: 30_000,
            fallback_balance: 10_000.0,
        }
    }
}

impl OcoValidatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_risk_per_position <= 0.0 || self.max_risk_per_position > 1.0 {
            return Err(format!(
                "Invalid max_risk_per_position: {}",
                self.max_risk_per_position
            ));
        }
        if self.force_close_threshold < self.max_risk_per_position {
            return Err(format!(
                "force_close_threshold {} must be >= max_risk_per_position {}",
                self.force_close_threshold, self.max_risk_per_position
            ));
        }
        if self.interval_ms == 0 {
            return Err("interval_ms must be > 0".to_string());
        }
        Ok(())
    }
}

/// Which protective order(s) a position lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingBracket {
    StopLoss,
    TakeProfit,
    Both,
}

impl fmt::Display for MissingBracket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissingBracket::StopLoss => "stop loss",
            MissingBracket::TakeProfit => "take profit",
            MissingBracket::Both => "stop loss and take profit",
        };
        write!(f, "{}", s)
    }
}

/// Action taken for one validated position. Closed set, one variant per
/// outcome kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OcoAction {
    Valid,
    Warned {
        missing: MissingBracket,
    },
    ForceClosed {
        missing: MissingBracket,
        close_confirmed: bool,
    },
}

impl OcoAction {
    pub fn is_violation(&self) -> bool {
        !matches!(self, OcoAction::Valid)
    }
}

/// One audit record, appended to the durable log per position per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoValidationRecord {
    pub validation_id: u64,
    pub position_id: String,
    pub symbol: String,
    pub has_take_profit: bool,
    pub has_stop_loss: bool,
    pub is_valid: bool,
    /// Position notional as a fraction of account balance
    pub risk_exposure: f64,
    pub action: OcoAction,
    pub timestamp: DateTime<Utc>,
    pub stats: ValidatorStats,
}

/// Running totals, also embedded in every audit record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ValidatorStats {
    pub validations: u64,
    pub violations: u64,
    pub closed: u64,
    pub last_validation: Option<DateTime<Utc>>,
}

impl ValidatorStats {
    pub fn violation_rate(&self) -> f64 {
        self.violations as f64 / (self.validations.max(1)) as f64
    }
}

pub struct OcoValidator {
    config: OcoValidatorConfig,
    audit: AuditLog,
    alerts: Arc<dyn AlertSink>,
    stats: ValidatorStats,
    metrics: Option<Metrics>,
}

impl OcoValidator {
    pub fn new(
        config: OcoValidatorConfig,
        audit: AuditLog,
        alerts: Arc<dyn AlertSink>,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("OcoValidator configuration error: {}", e))?;
        info!(
            "OcoValidator: max risk per position {:.1}%, force close above {:.1}%, log {}",
            config.max_risk_per_position * 100.0,
            config.force_close_threshold * 100.0,
            audit.path().display()
        );
        Ok(Self {
            config,
            audit,
            alerts,
            stats: ValidatorStats::default(),
            metrics,
        })
    }

    pub fn stats(&self) -> ValidatorStats {
        self.stats
    }

    /// Audit every open position once. Each record is logged before any
    /// corrective action is attempted.
    pub async fn run_once(
        &mut self,
        broker: &dyn BrokerClient,
    ) -> Result<Vec<OcoValidationRecord>> {
        self.stats.validations += 1;
        self.stats.last_validation = Some(Utc::now());
        let validation_id = self.stats.validations;

        let positions = broker
            .get_open_positions()
            .await
            .context("failed to fetch open positions")?;
        if positions.is_empty() {
            info!("OcoValidator: no open positions, validation {} complete", validation_id);
            return Ok(Vec::new());
        }

        let orders = broker.get_orders().await.unwrap_or_else(|e| {
            warn!("OcoValidator: failed to fetch orders: {}", e);
            Vec::new()
        });
        let balance = match broker.get_account_balance().await {
            Ok(balance) if balance > Decimal::ZERO => balance,
            Ok(_) | Err(_) => {
                warn!(
                    "OcoValidator: no usable account balance, assuming {}",
                    self.config.fallback_balance
                );
                Decimal::from_f64_retain(self.config.fallback_balance)
                    .unwrap_or(Decimal::ONE)
            }
        };

        info!(
            "OcoValidator: validation {} over {} positions",
            validation_id,
            positions.len()
        );

        let mut records = Vec::with_capacity(positions.len());
        let mut violations = Vec::new();

        for position in &positions {
            let record = self
                .validate_position(validation_id, position, &orders, balance, broker)
                .await;

            if let Err(e) = self.audit.append(&record) {
                // A write that fails twice is surfaced, never ignored
                error!("OcoValidator: audit log append failed: {}", e);
            }
            if let Some(metrics) = &self.metrics {
                let label = if record.is_valid { "valid" } else { "violation" };
                metrics
                    .oco_validations_total
                    .with_label_values(&[label])
                    .inc();
            }
            if record.action.is_violation() {
                violations.push(record.clone());
            }
            records.push(record);
        }

        if !violations.is_empty() {
            self.send_violation_alert(&violations).await;
        }

        info!(
            "OcoValidator: validation {} complete, {} positions checked, {} violations",
            validation_id,
            records.len(),
            violations.len()
        );
        Ok(records)
    }

    async fn validate_position(
        &mut self,
        validation_id: u64,
        position: &BrokerPosition,
        orders: &[BrokerOrder],
        balance: Decimal,
        broker: &dyn BrokerClient,
    ) -> OcoValidationRecord {
        let (has_take_profit, has_stop_loss) = match_protective_orders(position, orders);
        let is_valid = has_take_profit && has_stop_loss;

        let risk_exposure = (position.notional() / balance).to_f64().unwrap_or(0.0);

        let action = if is_valid {
            OcoAction::Valid
        } else {
            let missing = match (has_stop_loss, has_take_profit) {
                (false, false) => MissingBracket::Both,
                (false, true) => MissingBracket::StopLoss,
                (true, false) => MissingBracket::TakeProfit,
                (true, true) => unreachable!(),
            };

            self.stats.violations += 1;
            warn!(
                "OcoValidator: {} position {} missing {} (exposure {:.2}%)",
                position.symbol,
                position.id,
                missing,
                risk_exposure * 100.0
            );

            if risk_exposure > self.config.force_close_threshold
                || missing == MissingBracket::Both
            {
                let close_confirmed = match broker.close_position(&position.id).await {
                    Ok(confirmed) => confirmed,
                    Err(e) => {
                        error!(
                            "OcoValidator: failed to close position {}: {}",
                            position.id, e
                        );
                        false
                    }
                };
                if close_confirmed {
                    self.stats.closed += 1;
                    info!(
                        "OcoValidator: force-closed position {} ({})",
                        position.id, position.symbol
                    );
                }
                if let Some(metrics) = &self.metrics {
                    metrics
                        .oco_force_closes_total
                        .with_label_values(&[if close_confirmed { "true" } else { "false" }])
                        .inc();
                }
                OcoAction::ForceClosed {
                    missing,
                    close_confirmed,
                }
            } else {
                OcoAction::Warned { missing }
            }
        };

        OcoValidationRecord {
            validation_id,
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            has_take_profit,
            has_stop_loss,
            is_valid,
            risk_exposure,
            action,
            timestamp: Utc::now(),
            stats: self.stats,
        }
    }

    async fn send_violation_alert(&self, violations: &[OcoValidationRecord]) {
        let closed = violations
            .iter()
            .filter(|v| matches!(v.action, OcoAction::ForceClosed { .. }))
            .count();

        let mut message = format!(
            "OCO violations: {} positions missing bracket orders",
            violations.len()
        );
        if closed > 0 {
            message.push_str(&format!(", {} force-closed", closed));
        }
        let details: Vec<String> = violations
            .iter()
            .take(5)
            .map(|v| format!("{} (risk {:.1}%)", v.symbol, v.risk_exposure * 100.0))
            .collect();
        message.push_str(&format!(". Details: {}", details.join("; ")));

        // Best effort only; alert failures must not abort validation
        if let Err(e) = self
            .alerts
            .send_alert(AlertKind::OcoViolation, &message)
            .await
        {
            warn!("OcoValidator: alert delivery failed: {}", e);
        }
    }

    /// Run validations on a fixed cadence until the stop signal flips.
    pub async fn run_periodic(
        &mut self,
        broker: Arc<dyn BrokerClient>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "OcoValidator: periodic validation every {}ms",
            self.config.interval_ms
        );

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        info!("OcoValidator: stop signal received");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(broker.as_ref()).await {
                        error!("OcoValidator: validation cycle failed: {:#}", e);
                        let _ = self
                            .alerts
                            .send_alert(AlertKind::ValidatorError, &format!("{:#}", e))
                            .await;
                    }
                }
            }
        }
    }
}

/// Find opposing protective orders for a position: a take profit is a limit
/// order on the closing side, a stop loss is a stop or stop-limit order on
/// the closing side, both matched by symbol.
fn match_protective_orders(position: &BrokerPosition, orders: &[BrokerOrder]) -> (bool, bool) {
    let closing_side = position.direction.closing_side();
    let mut has_take_profit = false;
    let mut has_stop_loss = false;

    for order in orders {
        if order.symbol != position.symbol || order.side != closing_side {
            continue;
        }
        match order.kind {
            OrderKind::Limit => has_take_profit = true,
            OrderKind::Stop | OrderKind::StopLimit => has_stop_loss = true,
            OrderKind::Market => {}
        }
    }

    (has_take_profit, has_stop_loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::{Direction, OrderSide};
    use crate::infrastructure::mock::{MockAlertSink, MockBroker};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn broker_position(id: &str, symbol: &str, quantity: Decimal, price: Decimal) -> BrokerPosition {
        BrokerPosition {
            id: id.to_string(),
            symbol: symbol.to_string(),
            direction: Direction::Long,
            quantity,
            entry_price: price,
            current_price: price,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    fn protective_order(id: &str, symbol: &str, kind: OrderKind) -> BrokerOrder {
        BrokerOrder {
            id: id.to_string(),
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            kind,
            quantity: dec!(10000),
            price: Some(dec!(1.1000)),
        }
    }

    fn validator(dir: &TempDir) -> (OcoValidator, Arc<MockAlertSink>) {
        let alerts = Arc::new(MockAlertSink::new());
        let validator = OcoValidator::new(
            OcoValidatorConfig::default(),
            AuditLog::new(dir.path().join("oco.jsonl")),
            alerts.clone(),
            None,
        )
        .unwrap();
        (validator, alerts)
    }

    #[test]
    fn test_matching_requires_opposing_side() {
        let position = broker_position("p1", "EUR_USD", dec!(10000), dec!(1.10));
        let mut tp = protective_order("o1", "EUR_USD", OrderKind::Limit);
        tp.side = OrderSide::Buy; // same side as the position, not protective

        let (has_tp, has_sl) = match_protective_orders(&position, &[tp]);
        assert!(!has_tp);
        assert!(!has_sl);
    }

    #[test]
    fn test_matching_by_symbol_and_kind() {
        let position = broker_position("p1", "EUR_USD", dec!(10000), dec!(1.10));
        let orders = vec![
            protective_order("o1", "EUR_USD", OrderKind::Limit),
            protective_order("o2", "EUR_USD", OrderKind::Stop),
            protective_order("o3", "GBP_USD", OrderKind::Stop), // other symbol
        ];
        let (has_tp, has_sl) = match_protective_orders(&position, &orders);
        assert!(has_tp);
        assert!(has_sl);
    }

    #[tokio::test]
    async fn test_fully_protected_position_is_valid() {
        let dir = TempDir::new().unwrap();
        let (mut validator, _alerts) = validator(&dir);

        let broker = MockBroker::new(dec!(10000));
        broker.add_position(broker_position("p1", "EUR_USD", dec!(100), dec!(1.10)));
        broker.add_order(protective_order("o1", "EUR_USD", OrderKind::Limit));
        broker.add_order(protective_order("o2", "EUR_USD", OrderKind::Stop));

        let records = validator.run_once(&broker).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, OcoAction::Valid);
        assert!(records[0].is_valid);
        assert!(broker.closed_positions().is_empty());

        let stats = validator.stats();
        assert_eq!(stats.validations, 1);
        assert_eq!(stats.violations, 0);
    }

    #[tokio::test]
    async fn test_missing_both_is_force_closed() {
        let dir = TempDir::new().unwrap();
        let (mut validator, alerts) = validator(&dir);

        let broker = MockBroker::new(dec!(10000));
        // Low exposure, but both brackets missing: still closed
        broker.add_position(broker_position("p1", "EUR_USD", dec!(100), dec!(1.10)));

        let records = validator.run_once(&broker).await.unwrap();
        assert_eq!(
            records[0].action,
            OcoAction::ForceClosed {
                missing: MissingBracket::Both,
                close_confirmed: true,
            }
        );
        assert_eq!(broker.closed_positions(), vec!["p1".to_string()]);
        assert_eq!(validator.stats().closed, 1);
        assert_eq!(alerts.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_single_missing_bracket_below_threshold_only_warns() {
        let dir = TempDir::new().unwrap();
        let (mut validator, _alerts) = validator(&dir);

        let broker = MockBroker::new(dec!(10000));
        // Notional 110 of 10k balance: ~1.1% exposure, under the 5% threshold
        broker.add_position(broker_position("p1", "EUR_USD", dec!(100), dec!(1.10)));
        broker.add_order(protective_order("o1", "EUR_USD", OrderKind::Limit));

        let records = validator.run_once(&broker).await.unwrap();
        assert_eq!(
            records[0].action,
            OcoAction::Warned {
                missing: MissingBracket::StopLoss
            }
        );
        assert!(broker.closed_positions().is_empty());
    }

    #[tokio::test]
    async fn test_single_missing_bracket_above_threshold_closes() {
        let dir = TempDir::new().unwrap();
        let (mut validator, _alerts) = validator(&dir);

        let broker = MockBroker::new(dec!(10000));
        // Notional 1100 of 10k balance: 11% exposure, over the 5% threshold
        broker.add_position(broker_position("p1", "EUR_USD", dec!(1000), dec!(1.10)));
        broker.add_order(protective_order("o1", "EUR_USD", OrderKind::Stop));

        let records = validator.run_once(&broker).await.unwrap();
        match records[0].action {
            OcoAction::ForceClosed {
                missing: MissingBracket::TakeProfit,
                close_confirmed: true,
            } => {}
            other => panic!("expected force close, got {:?}", other),
        }
        assert!((records[0].risk_exposure - 0.11).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_audit_log_grows_per_position_per_run() {
        let dir = TempDir::new().unwrap();
        let (mut validator, _alerts) = validator(&dir);

        let broker = MockBroker::new(dec!(10000));
        broker.add_position(broker_position("p1", "EUR_USD", dec!(100), dec!(1.10)));
        broker.add_order(protective_order("o1", "EUR_USD", OrderKind::Limit));
        broker.add_order(protective_order("o2", "EUR_USD", OrderKind::Stop));

        validator.run_once(&broker).await.unwrap();
        validator.run_once(&broker).await.unwrap();

        let log = AuditLog::new(dir.path().join("oco.jsonl"));
        assert_eq!(log.len().unwrap(), 2);

        // Records embed the monotonically increasing counter and stats
        let contents = std::fs::read_to_string(log.path()).unwrap();
        let last: OcoValidationRecord =
            serde_json::from_str(contents.lines().last().unwrap()).unwrap();
        assert_eq!(last.validation_id, 2);
        assert_eq!(last.stats.validations, 2);
    }

    #[tokio::test]
    async fn test_alert_failure_does_not_abort_validation() {
        let dir = TempDir::new().unwrap();
        let alerts = Arc::new(MockAlertSink::new());
        alerts.fail(true);
        let mut validator = OcoValidator::new(
            OcoValidatorConfig::default(),
            AuditLog::new(dir.path().join("oco.jsonl")),
            alerts,
            None,
        )
        .unwrap();

        let broker = MockBroker::new(dec!(10000));
        broker.add_position(broker_position("p1", "EUR_USD", dec!(100), dec!(1.10)));

        let records = validator.run_once(&broker).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].action.is_violation());
    }

    #[tokio::test]
    async fn test_no_positions_short_circuits() {
        let dir = TempDir::new().unwrap();
        let (mut validator, _alerts) = validator(&dir);

        let broker = MockBroker::new(dec!(10000));
        let records = validator.run_once(&broker).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(validator.stats().validations, 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = OcoValidatorConfig::default();
        assert!(config.validate().is_ok());
        config.force_close_threshold = 0.01; // below per-position risk
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_violation_rate() {
        let stats = ValidatorStats {
            validations: 4,
            violations: 1,
            closed: 1,
            last_validation: None,
        };
        assert!((stats.violation_rate() - 0.25).abs() < 1e-9);
        assert_eq!(ValidatorStats::default().violation_rate(), 0.0);
    }
}

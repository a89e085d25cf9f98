//! Mock collaborators for unit and integration tests.
//!
//! `MockBroker` serves scripted quote sequences (the last quote repeats
//! once a script is exhausted) and records close requests; there is no
//! randomized price simulation anywhere - tests drive exact price paths.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::domain::ports::{AlertKind, AlertSink, BrokerClient, PriceHistorySource};
use crate::domain::trading::types::{BrokerOrder, BrokerPosition, Quote};

pub struct MockBroker {
    balance: Mutex<Decimal>,
    positions: Mutex<Vec<BrokerPosition>>,
    orders: Mutex<Vec<BrokerOrder>>,
    quotes: Mutex<HashMap<String, VecDeque<Quote>>>,
    closed: Mutex<Vec<String>>,
    fail_quotes: AtomicBool,
    refuse_close: AtomicBool,
}

impl MockBroker {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance: Mutex::new(balance),
            positions: Mutex::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            quotes: Mutex::new(HashMap::new()),
            closed: Mutex::new(Vec::new()),
            fail_quotes: AtomicBool::new(false),
            refuse_close: AtomicBool::new(false),
        }
    }

    pub fn add_position(&self, position: BrokerPosition) {
        self.positions.lock().unwrap().push(position);
    }

    pub fn add_order(&self, order: BrokerOrder) {
        self.orders.lock().unwrap().push(order);
    }

    /// Queue mid prices for a symbol; a one-pip spread is applied around
    /// each. The final quote repeats forever once the script runs out.
    pub fn script_quotes(&self, symbol: &str, mids: &[f64]) {
        let mut quotes = self.quotes.lock().unwrap();
        let queue = quotes.entry(symbol.to_string()).or_default();
        for mid in mids {
            let mid = Decimal::from_f64(*mid).unwrap_or(Decimal::ZERO);
            let half_spread = Decimal::new(5, 5); // 0.00005
            queue.push_back(Quote {
                bid: mid - half_spread,
                ask: mid + half_spread,
            });
        }
    }

    pub fn fail_quotes(&self, fail: bool) {
        self.fail_quotes.store(fail, Ordering::SeqCst);
    }

    pub fn refuse_close(&self, refuse: bool) {
        self.refuse_close.store(refuse, Ordering::SeqCst);
    }

    pub fn closed_positions(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn set_balance(&self, balance: Decimal) {
        *self.balance.lock().unwrap() = balance;
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn get_orders(&self) -> Result<Vec<BrokerOrder>> {
        Ok(self.orders.lock().unwrap().clone())
    }

    async fn get_account_balance(&self) -> Result<Decimal> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn close_position(&self, position_id: &str) -> Result<bool> {
        if self.refuse_close.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.closed.lock().unwrap().push(position_id.to_string());
        self.positions
            .lock()
            .unwrap()
            .retain(|p| p.id != position_id);
        Ok(true)
    }

    async fn get_current_bid_ask(&self, symbol: &str) -> Result<Quote> {
        if self.fail_quotes.load(Ordering::SeqCst) {
            bail!("mock quote feed disabled for {}", symbol);
        }
        let mut quotes = self.quotes.lock().unwrap();
        match quotes.get_mut(symbol) {
            Some(queue) if !queue.is_empty() => {
                let quote = if queue.len() == 1 {
                    *queue.front().unwrap() // repeat the last quote
                } else {
                    queue.pop_front().unwrap()
                };
                Ok(quote)
            }
            _ => bail!("no scripted quotes for {}", symbol),
        }
    }
}

/// Scripted price-history source.
pub struct MockPriceFeed {
    series: Mutex<HashMap<String, Vec<f64>>>,
    fail: AtomicBool,
}

impl MockPriceFeed {
    pub fn new() -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_series(&self, symbol: &str, prices: Vec<f64>) {
        self.series.lock().unwrap().insert(symbol.to_string(), prices);
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Default for MockPriceFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceHistorySource for MockPriceFeed {
    async fn recent_prices(&self, symbol: &str, window: usize) -> Result<Vec<f64>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("mock price history disabled");
        }
        let series = self.series.lock().unwrap();
        match series.get(symbol) {
            Some(prices) => {
                let start = prices.len().saturating_sub(window);
                Ok(prices[start..].to_vec())
            }
            None => bail!("no series for {}", symbol),
        }
    }
}

/// Records alerts; can be made to fail to exercise best-effort delivery.
pub struct MockAlertSink {
    sent: Mutex<Vec<(AlertKind, String)>>,
    fail: AtomicBool,
}

impl MockAlertSink {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<(AlertKind, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Default for MockAlertSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertSink for MockAlertSink {
    async fn send_alert(&self, kind: AlertKind, message: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("mock alert sink disabled");
        }
        self.sent.lock().unwrap().push((kind, message.to_string()));
        Ok(())
    }
}

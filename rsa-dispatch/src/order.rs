//! Order request model.
//!
//! An [`OrderRequest`] is the normalized form of whatever the user typed.
//! It is built by the command parser, validated once before any broker
//! is contacted and once more per broker after login.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::broker::BrokerId;

/// What the request asks every broker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Holdings,
}

impl Action {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Holdings => "holdings",
        }
    }

    pub const fn is_trade(&self) -> bool {
        matches!(self, Self::Buy | Self::Sell)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order validation failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderError {
    #[error("No brokers to run")]
    NoBrokers,

    #[error("Amount is required for {0} orders")]
    MissingAmount(Action),

    #[error("Amount must be a positive number, got {0}")]
    InvalidAmount(f64),

    #[error("At least one symbol is required for {0} orders")]
    NoSymbols(Action),

    #[error("{0} not logged in, skipping...")]
    NotLoggedIn(String),
}

/// A normalized user request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    action: Action,
    /// Quantity per symbol per account (trades only)
    amount: Option<f64>,
    /// Upper-cased tickers in request order
    symbols: Vec<String>,
    /// Target brokers in insertion order, no duplicates
    brokers: Vec<BrokerId>,
    /// Subtracted right before each broker runs
    excluded: BTreeSet<BrokerId>,
    /// Real orders are only placed when this is false
    dry_run: bool,
}

impl OrderRequest {
    /// Create an empty request. Dry run is on until explicitly disabled.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            amount: None,
            symbols: Vec::new(),
            brokers: Vec::new(),
            excluded: BTreeSet::new(),
            dry_run: true,
        }
    }

    /// Create a holdings request for the given brokers.
    pub fn holdings(brokers: impl IntoIterator<Item = BrokerId>) -> Self {
        let mut order = Self::new(Action::Holdings);
        order.add_brokers(brokers);
        order
    }

    /// Create a trade request.
    pub fn trade(
        action: Action,
        amount: f64,
        symbols: impl IntoIterator<Item = impl AsRef<str>>,
        brokers: impl IntoIterator<Item = BrokerId>,
    ) -> Self {
        let mut order = Self::new(action);
        order.set_amount(amount);
        for symbol in symbols {
            order.add_symbol(symbol.as_ref());
        }
        order.add_brokers(brokers);
        order
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn amount(&self) -> Option<f64> {
        self.amount
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn brokers(&self) -> &[BrokerId] {
        &self.brokers
    }

    pub fn excluded(&self) -> &BTreeSet<BrokerId> {
        &self.excluded
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn set_amount(&mut self, amount: f64) {
        self.amount = Some(amount);
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Add a ticker, upper-cased.
    pub fn add_symbol(&mut self, symbol: &str) {
        let symbol = symbol.trim().to_uppercase();
        if !symbol.is_empty() {
            self.symbols.push(symbol);
        }
    }

    /// Add a broker, keeping first-insertion order.
    pub fn add_broker(&mut self, broker: BrokerId) {
        if !self.brokers.contains(&broker) {
            self.brokers.push(broker);
        }
    }

    pub fn add_brokers(&mut self, brokers: impl IntoIterator<Item = BrokerId>) {
        for broker in brokers {
            self.add_broker(broker);
        }
    }

    pub fn exclude(&mut self, broker: BrokerId) {
        self.excluded.insert(broker);
    }

    pub fn is_excluded(&self, broker: BrokerId) -> bool {
        self.excluded.contains(&broker)
    }

    /// Whether the amount has a fractional part.
    pub fn is_fractional(&self) -> bool {
        self.amount.is_some_and(|a| a.fract() != 0.0)
    }

    /// Checks run before any broker is contacted.
    pub fn validate_pre_login(&self) -> Result<(), OrderError> {
        if self.brokers.is_empty() {
            return Err(OrderError::NoBrokers);
        }
        if self.action.is_trade() {
            match self.amount {
                None => return Err(OrderError::MissingAmount(self.action)),
                Some(a) if !a.is_finite() || a <= 0.0 => {
                    return Err(OrderError::InvalidAmount(a))
                }
                Some(_) => {}
            }
            if self.symbols.is_empty() {
                return Err(OrderError::NoSymbols(self.action));
            }
        }
        Ok(())
    }

    /// Checks run after a broker login, before its action.
    pub fn validate_post_login(
        &self,
        broker_name: &str,
        logged_in_accounts: usize,
    ) -> Result<(), OrderError> {
        if self.brokers.is_empty() {
            return Err(OrderError::NoBrokers);
        }
        if logged_in_accounts == 0 {
            return Err(OrderError::NotLoggedIn(broker_name.to_string()));
        }
        Ok(())
    }

    /// Multi-line confirmation text shown before real orders are placed.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Action: {}", self.action)];
        if self.action.is_trade() {
            lines.push(format!(
                "Amount: {}",
                self.amount.map_or_else(|| "None".to_string(), |a| a.to_string())
            ));
            lines.push(format!(
                "Stock: {}",
                join_or_none(self.symbols.iter().map(String::as_str))
            ));
        }
        lines.push(format!(
            "Brokers: {}",
            join_or_none(self.brokers.iter().map(BrokerId::as_str))
        ));
        lines.push(format!(
            "Not Brokers: {}",
            join_or_none(self.excluded.iter().map(BrokerId::as_str))
        ));
        lines.push(format!("DRY: {}", self.dry_run));
        lines.join("\n")
    }
}

fn join_or_none<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let items: Vec<&str> = items.collect();
    if items.is_empty() {
        "None".to_string()
    } else {
        items.join(", ")
    }
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.amount {
            Some(amount) if self.action.is_trade() => write!(
                f,
                "{} {} {}",
                self.action,
                amount,
                self.symbols.join(",")
            ),
            _ => write!(f, "{}", self.action),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

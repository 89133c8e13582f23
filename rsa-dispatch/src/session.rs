//! Per-broker login state.
//!
//! A [`BrokerSession`] lives for one dispatch. Its adapter creates it during
//! login, fills in accounts and holdings, and it is dropped when the batch
//! ends. Nothing here is persisted.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One position inside an account.
#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub symbol: String,
    pub quantity: f64,
    /// Last price, when the broker reported one
    pub price: Option<f64>,
}

impl Holding {
    pub fn new(symbol: impl Into<String>, quantity: f64, price: Option<f64>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            price,
        }
    }

    /// Market value, if the price is known.
    pub fn value(&self) -> Option<f64> {
        self.price.map(|p| p * self.quantity)
    }
}

/// A single brokerage account discovered under a login.
#[derive(Debug, Clone, Default)]
pub struct AccountRecord {
    pub number: String,
    pub account_type: Option<String>,
    pub balance: Option<f64>,
    pub holdings: Vec<Holding>,
}

impl AccountRecord {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            ..Default::default()
        }
    }

    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = Some(balance);
        self
    }

    pub fn with_type(mut self, account_type: impl Into<String>) -> Self {
        self.account_type = Some(account_type.into());
        self
    }
}

/// One logged-in credential set.
pub struct SubAccount {
    /// Display key, e.g. `alice-Tradier 1`
    pub key: String,
    /// Adapter-owned login object
    handle: Arc<dyn Any + Send + Sync>,
    /// Broker-specific ids (profile id, device id, ...)
    pub identifiers: HashMap<String, String>,
    pub accounts: Vec<AccountRecord>,
}

impl SubAccount {
    pub fn new<H: Any + Send + Sync>(key: impl Into<String>, handle: H) -> Self {
        Self {
            key: key.into(),
            handle: Arc::new(handle),
            identifiers: HashMap::new(),
            accounts: Vec::new(),
        }
    }

    /// Borrow the login handle as the adapter's concrete type.
    pub fn handle<H: Any + Send + Sync>(&self) -> Option<&H> {
        self.handle.downcast_ref::<H>()
    }

    pub fn account(&self, number: &str) -> Option<&AccountRecord> {
        self.accounts.iter().find(|a| a.number == number)
    }

    pub fn account_mut(&mut self, number: &str) -> Option<&mut AccountRecord> {
        self.accounts.iter_mut().find(|a| a.number == number)
    }

    /// Add an account. Returns false when this sub-account already owns it.
    pub fn add_account(&mut self, account: AccountRecord) -> bool {
        if self.account(&account.number).is_some() {
            return false;
        }
        self.accounts.push(account);
        true
    }
}

impl fmt::Debug for SubAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubAccount")
            .field("key", &self.key)
            .field("identifiers", &self.identifiers.keys().collect::<Vec<_>>())
            .field("accounts", &self.accounts)
            .finish_non_exhaustive()
    }
}

/// All login state for one broker within one dispatch.
#[derive(Debug)]
pub struct BrokerSession {
    display_name: String,
    sub_accounts: Vec<SubAccount>,
}

impl BrokerSession {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            sub_accounts: Vec::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn sub_accounts(&self) -> &[SubAccount] {
        &self.sub_accounts
    }

    pub fn sub_accounts_mut(&mut self) -> &mut [SubAccount] {
        &mut self.sub_accounts
    }

    pub fn sub_account(&self, key: &str) -> Option<&SubAccount> {
        self.sub_accounts.iter().find(|s| s.key == key)
    }

    pub fn sub_account_mut(&mut self, key: &str) -> Option<&mut SubAccount> {
        self.sub_accounts.iter_mut().find(|s| s.key == key)
    }

    /// Register a logged-in credential set. Duplicate keys are rejected.
    pub fn add_sub_account(&mut self, sub: SubAccount) -> bool {
        if self.sub_account(&sub.key).is_some() {
            tracing::warn!(
                broker = %self.display_name,
                key = %sub.key,
                "Duplicate sub-account ignored"
            );
            return false;
        }
        self.sub_accounts.push(sub);
        true
    }

    /// Number of logged-in credential sets.
    pub fn logged_in_count(&self) -> usize {
        self.sub_accounts.len()
    }

    /// Total accounts across every sub-account.
    pub fn account_count(&self) -> usize {
        self.sub_accounts.iter().map(|s| s.accounts.len()).sum()
    }

    /// Append another session's sub-accounts (same broker, other credential set).
    pub fn merge(&mut self, other: BrokerSession) {
        for sub in other.sub_accounts {
            self.add_sub_account(sub);
        }
    }

    /// Iterate (sub-account key, account) pairs in order.
    pub fn accounts(&self) -> impl Iterator<Item = (&str, &AccountRecord)> {
        self.sub_accounts
            .iter()
            .flat_map(|s| s.accounts.iter().map(move |a| (s.key.as_str(), a)))
    }
}

//! Broker adapter contract and registry.
//!
//! Every broker integration exposes the same three operations: log in every
//! credential set (`init`), report holdings, and place the order. How an
//! adapter runs depends on what its integration needs:
//!
//! - [`Broker`]: plain async code, awaited inline (REST APIs).
//! - [`BlockingBroker`]: synchronous SDKs, each call runs on a blocking
//!   worker thread.
//! - [`SessionBroker`]: stateful browser sessions, the whole
//!   login → action → close sequence for one credential set runs on a
//!   dedicated thread with its own runtime.
//!
//! The [`AdapterRegistry`] maps each [`BrokerId`] to one [`Adapter`] at
//! startup; brokers with no entry are skipped at dispatch time.

mod id;
pub mod tradier;

pub use id::{BrokerGroup, BrokerId};
pub use tradier::TradierBroker;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::credentials::CredentialSet;
use crate::order::OrderRequest;
use crate::relay::{CodeOutcome, CodeProvider};
use crate::reporter::Reporter;
use crate::session::BrokerSession;

/// Everything an adapter gets to log in.
#[derive(Clone)]
pub struct LoginContext {
    /// User the dispatch runs for
    pub identity: String,
    pub broker: BrokerId,
    /// Decrypted credential sets, in stored order
    pub credentials: Vec<CredentialSet>,
    pub reporter: Reporter,
    pub headless: bool,
    codes: Arc<dyn CodeProvider>,
    runtime: tokio::runtime::Handle,
}

impl LoginContext {
    /// Must be called from inside a Tokio runtime.
    pub fn new(
        identity: impl Into<String>,
        broker: BrokerId,
        credentials: Vec<CredentialSet>,
        reporter: Reporter,
        codes: Arc<dyn CodeProvider>,
    ) -> Self {
        Self {
            identity: identity.into(),
            broker,
            credentials,
            reporter,
            headless: true,
            codes,
            runtime: tokio::runtime::Handle::current(),
        }
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Sub-account key for a credential set, e.g. `alice-Tradier 1`.
    pub fn sub_account_key(&self, set: &CredentialSet) -> String {
        format!(
            "{}-{} {}",
            self.identity,
            self.broker.display_name(),
            set.index
        )
    }

    /// Wait for an out-of-band verification code.
    pub async fn request_code(&self, label: &str, code_length: Option<usize>) -> CodeOutcome {
        self.codes
            .request_code(&self.identity, label, code_length)
            .await
    }

    /// Blocking form of [`LoginContext::request_code`] for [`BlockingBroker`]s.
    ///
    /// Only call this from a blocking worker thread, never from async code.
    pub fn request_code_blocking(&self, label: &str, code_length: Option<usize>) -> CodeOutcome {
        self.runtime.block_on(self.request_code(label, code_length))
    }

    /// Same context with only one credential set (session workers).
    pub fn for_set(&self, set: &CredentialSet) -> Self {
        let mut ctx = self.clone();
        ctx.credentials = vec![set.clone()];
        ctx
    }
}

/// Async broker integration.
#[async_trait]
pub trait Broker: Send + Sync {
    fn id(&self) -> BrokerId;

    /// Log in every credential set. `Ok(None)` means the integration is unavailable.
    async fn init(&self, ctx: &LoginContext) -> Result<Option<BrokerSession>>;

    /// Fill in holdings for every account in the session.
    async fn holdings(&self, session: &mut BrokerSession, reporter: &Reporter) -> Result<()>;

    /// Place the order on every account in the session.
    async fn transact(
        &self,
        session: &mut BrokerSession,
        order: &OrderRequest,
        reporter: &Reporter,
    ) -> Result<()>;
}

/// Synchronous broker integration, run on blocking worker threads.
pub trait BlockingBroker: Send + Sync + 'static {
    fn id(&self) -> BrokerId;

    fn init(&self, ctx: &LoginContext) -> Result<Option<BrokerSession>>;

    fn holdings(&self, session: &mut BrokerSession, reporter: &Reporter) -> Result<()>;

    fn transact(
        &self,
        session: &mut BrokerSession,
        order: &OrderRequest,
        reporter: &Reporter,
    ) -> Result<()>;
}

/// Stateful session integration, one dedicated thread per credential set.
#[async_trait]
pub trait SessionBroker: Send + Sync + 'static {
    fn id(&self) -> BrokerId;

    /// Log in the single credential set in `ctx`.
    async fn login(&self, ctx: &LoginContext) -> Result<Option<BrokerSession>>;

    async fn holdings(&self, session: &mut BrokerSession, reporter: &Reporter) -> Result<()>;

    async fn transact(
        &self,
        session: &mut BrokerSession,
        order: &OrderRequest,
        reporter: &Reporter,
    ) -> Result<()>;

    /// Release the session (close the browser). Called even after failures.
    async fn close(&self, _session: &mut BrokerSession) {}
}

/// How a broker's calls are executed.
#[derive(Clone)]
pub enum Adapter {
    Direct(Arc<dyn Broker>),
    Blocking(Arc<dyn BlockingBroker>),
    Session(Arc<dyn SessionBroker>),
}

impl Adapter {
    pub fn id(&self) -> BrokerId {
        match self {
            Self::Direct(b) => b.id(),
            Self::Blocking(b) => b.id(),
            Self::Session(b) => b.id(),
        }
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Blocking(_) => "blocking",
            Self::Session(_) => "session",
        }
    }
}

/// Closed mapping from broker to adapter, built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<BrokerId, Adapter>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter this build ships.
    pub fn with_defaults(brokers: &rsa_common::BrokersConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Adapter::Direct(Arc::new(TradierBroker::new(brokers)?)));
        Ok(registry)
    }

    /// Register an adapter under its own broker id, replacing any previous one.
    pub fn register(&mut self, adapter: Adapter) -> &mut Self {
        let id = adapter.id();
        if self.adapters.insert(id, adapter).is_some() {
            tracing::warn!(broker = %id, "Replaced registered adapter");
        }
        self
    }

    pub fn get(&self, broker: BrokerId) -> Option<&Adapter> {
        self.adapters.get(&broker)
    }

    /// Registered brokers in broker order.
    pub fn brokers(&self) -> Vec<BrokerId> {
        let mut brokers: Vec<BrokerId> = self.adapters.keys().copied().collect();
        brokers.sort();
        brokers
    }
}

// ============================================================================
// Tests
// ============================================================================

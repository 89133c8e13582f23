//! Dispatch orchestrator.
//!
//! Runs one [`OrderRequest`] across its brokers, one broker at a time in the
//! order the user listed them. Each broker moves through
//!
//! ```text
//! Pending ─┬─▶ Excluded
//!          ├─▶ SkippedUnconfigured
//!          └─▶ LoggingIn ─┬─▶ SkippedUnconfigured   (adapter unavailable)
//!                         ├─▶ LoginFailed
//!                         └─▶ LoggedIn ─▶ Running ─┬─▶ Done
//!                                                  └─▶ Errored
//! ```
//!
//! A failing broker never stops the rest of the batch. Only an invalid order
//! or an unreachable credential store aborts it.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use rsa_common::logging::generate_trace_id;
use rsa_common::util::sanitize_for_log;
use rsa_common::{CredentialCipher, DispatchConfig};

use crate::broker::{
    Adapter, AdapterRegistry, BlockingBroker, Broker, BrokerId, LoginContext, SessionBroker,
};
use crate::credentials::{parse_credentials, CredentialStore};
use crate::error::DispatchError;
use crate::order::{Action, OrderRequest};
use crate::relay::CodeProvider;
use crate::reporter::Reporter;
use crate::session::BrokerSession;
use crate::worker;

/// Line emitted once at the end of every batch.
pub const BATCH_COMPLETE: &str = "All commands complete in all registered brokers";

// ============================================================================
// Outcomes
// ============================================================================

/// Where a broker is in its dispatch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerState {
    Pending,
    Excluded,
    SkippedUnconfigured,
    LoggingIn,
    LoginFailed,
    LoggedIn,
    Running,
    Done,
    Errored,
}

impl BrokerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Excluded | Self::SkippedUnconfigured | Self::LoginFailed | Self::Done | Self::Errored
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Excluded => "excluded",
            Self::SkippedUnconfigured => "skipped_unconfigured",
            Self::LoggingIn => "logging_in",
            Self::LoginFailed => "login_failed",
            Self::LoggedIn => "logged_in",
            Self::Running => "running",
            Self::Done => "done",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state of one broker in a batch.
#[derive(Debug, Clone)]
pub struct BrokerOutcome {
    pub broker: BrokerId,
    pub state: BrokerState,
    /// Whether the broker's adapter was invoked at all
    pub attempted: bool,
    pub error: Option<String>,
}

impl BrokerOutcome {
    fn new(broker: BrokerId) -> Self {
        Self {
            broker,
            state: BrokerState::Pending,
            attempted: false,
            error: None,
        }
    }

    fn advance(&mut self, state: BrokerState) {
        tracing::debug!(broker = %self.broker, from = %self.state, to = %state, "Broker state change");
        self.state = state;
        if state == BrokerState::LoggingIn {
            self.attempted = true;
        }
    }

    fn fail(mut self, state: BrokerState, error: impl Into<String>) -> Self {
        self.advance(state);
        self.error = Some(error.into());
        self
    }

    fn finish(mut self, state: BrokerState) -> Self {
        self.advance(state);
        self
    }
}

/// Result of one dispatch batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: String,
    pub identity: String,
    pub action: Action,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One outcome per requested broker, in request order
    pub outcomes: Vec<BrokerOutcome>,
}

impl BatchReport {
    /// Brokers whose adapter was invoked.
    pub fn processed(&self) -> Vec<BrokerId> {
        self.outcomes
            .iter()
            .filter(|o| o.attempted)
            .map(|o| o.broker)
            .collect()
    }

    pub fn outcome(&self, broker: BrokerId) -> Option<&BrokerOutcome> {
        self.outcomes.iter().find(|o| o.broker == broker)
    }

    pub fn state_of(&self, broker: BrokerId) -> Option<BrokerState> {
        self.outcome(broker).map(|o| o.state)
    }

    pub fn count(&self, state: BrokerState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Tunables for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Upper bound on any single adapter call
    pub call_timeout: Duration,
    pub headless: bool,
    /// Add cross-account totals to large holdings reports
    pub summarize_holdings: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            headless: config.headless,
            summarize_holdings: true,
        }
    }
}

/// How one broker's login and action went, before it is turned into a state.
enum Attempt {
    /// Adapter reported its integration unavailable
    Unavailable,
    LoginFailed { function: &'static str, error: String },
    /// Logged in, but no account is usable
    NotLoggedIn,
    ActionFailed { function: &'static str, error: String },
    Completed(BrokerSession),
    /// Some credential sets finished, others failed
    Partial { session: BrokerSession, error: String },
}

/// Result of a session worker for one credential set.
enum SessionRun {
    Unavailable,
    LoginFailed(anyhow::Error),
    NotLoggedIn,
    Finished {
        session: BrokerSession,
        action: anyhow::Result<()>,
    },
}

/// Runs orders across the registered broker adapters.
pub struct Dispatcher {
    registry: AdapterRegistry,
    store: Arc<dyn CredentialStore>,
    cipher: Option<CredentialCipher>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(registry: AdapterRegistry, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            registry,
            store,
            cipher: None,
            settings: DispatchSettings::default(),
        }
    }

    /// Key for credentials stored encrypted.
    pub fn with_cipher(mut self, cipher: CredentialCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Run `order` for `identity`, reporting progress through `reporter`.
    ///
    /// Returns an error only when the whole batch could not run. Per-broker
    /// failures are reported and recorded in the [`BatchReport`].
    pub async fn dispatch(
        &self,
        identity: &str,
        order: &OrderRequest,
        reporter: &Reporter,
        codes: Arc<dyn CodeProvider>,
    ) -> Result<BatchReport, DispatchError> {
        let batch_id = generate_trace_id();
        let span = tracing::info_span!(
            "dispatch",
            batch_id = %batch_id,
            identity = %identity,
            action = %order.action(),
        );
        self.run_batch(batch_id, identity, order, reporter, codes)
            .instrument(span)
            .await
    }

    async fn run_batch(
        &self,
        batch_id: String,
        identity: &str,
        order: &OrderRequest,
        reporter: &Reporter,
        codes: Arc<dyn CodeProvider>,
    ) -> Result<BatchReport, DispatchError> {
        if let Err(e) = order.validate_pre_login() {
            tracing::warn!(order = %order, error = %e, "Rejected order");
            reporter.emit(e.to_string());
            return Err(e.into());
        }

        if let Err(e) = self.store.ensure_live().await {
            tracing::error!(error = %e, "Credential store unavailable, aborting batch");
            reporter.emit(format!("Error: credential store unavailable: {e}"));
            return Err(DispatchError::CredentialStore(e));
        }

        tracing::info!(
            brokers = order.brokers().len(),
            excluded = order.excluded().len(),
            dry_run = order.dry_run(),
            "Starting dispatch"
        );

        let started_at = Utc::now();
        let mut outcomes = Vec::with_capacity(order.brokers().len());
        for &broker in order.brokers() {
            let outcome = self
                .run_broker(broker, identity, order, reporter, &codes)
                .instrument(tracing::info_span!("broker", broker = %broker))
                .await;
            tracing::info!(broker = %broker, state = %outcome.state, "Broker finished");
            outcomes.push(outcome);
        }

        reporter.emit(BATCH_COMPLETE);

        let report = BatchReport {
            batch_id,
            identity: identity.to_string(),
            action: order.action(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        tracing::info!(
            done = report.count(BrokerState::Done),
            errored = report.count(BrokerState::Errored),
            login_failed = report.count(BrokerState::LoginFailed),
            "Dispatch complete"
        );
        Ok(report)
    }

    async fn run_broker(
        &self,
        broker: BrokerId,
        identity: &str,
        order: &OrderRequest,
        reporter: &Reporter,
        codes: &Arc<dyn CodeProvider>,
    ) -> BrokerOutcome {
        let mut outcome = BrokerOutcome::new(broker);

        if order.is_excluded(broker) {
            tracing::info!(broker = %broker, "Broker excluded, skipping");
            return outcome.finish(BrokerState::Excluded);
        }

        let Some(adapter) = self.registry.get(broker) else {
            tracing::info!(broker = %broker, "No adapter registered, skipping");
            return outcome.finish(BrokerState::SkippedUnconfigured);
        };

        let credential = match self.store.lookup(identity, broker).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                tracing::info!(broker = %broker, "No credentials configured, skipping");
                return outcome.finish(BrokerState::SkippedUnconfigured);
            }
            Err(e) => {
                let error = DispatchError::Credentials { broker, source: e };
                self.report_failure(broker, "init", &error.to_string(), order, reporter);
                return outcome.fail(BrokerState::LoginFailed, error.to_string());
            }
        };

        let plaintext = match credential.reveal(self.cipher.as_ref()) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                let error = DispatchError::Credentials { broker, source: e };
                tracing::error!(broker = %broker, error = %error, "Failed to decrypt credentials");
                reporter.emit(format!(
                    "Error decrypting {} credentials",
                    broker.display_name()
                ));
                return outcome.fail(BrokerState::LoginFailed, error.to_string());
            }
        };

        let ctx = LoginContext::new(
            identity,
            broker,
            parse_credentials(&plaintext),
            reporter.clone(),
            Arc::clone(codes),
        )
        .with_headless(self.settings.headless);
        drop(plaintext);

        outcome.advance(BrokerState::LoggingIn);
        tracing::info!(broker = %broker, strategy = adapter.strategy(), "Logging in");

        let attempt = match adapter {
            Adapter::Direct(b) => self.run_direct(b.as_ref(), &ctx, order, reporter, &mut outcome).await,
            Adapter::Blocking(b) => {
                self.run_blocking(Arc::clone(b), &ctx, order, reporter, &mut outcome)
                    .await
            }
            Adapter::Session(b) => {
                self.run_session(Arc::clone(b), &ctx, order, reporter, &mut outcome)
                    .await
            }
        };

        self.settle(outcome, attempt, identity, order, reporter)
    }

    /// Turn an attempt into a terminal state and emit its closing lines.
    fn settle(
        &self,
        outcome: BrokerOutcome,
        attempt: Attempt,
        identity: &str,
        order: &OrderRequest,
        reporter: &Reporter,
    ) -> BrokerOutcome {
        let broker = outcome.broker;
        let name = broker.display_name();
        match attempt {
            Attempt::Unavailable => {
                reporter.emit(format!("{name} not found, skipping..."));
                outcome.finish(BrokerState::SkippedUnconfigured)
            }
            Attempt::LoginFailed { function, error } => {
                self.report_failure(broker, function, &error, order, reporter);
                outcome.fail(BrokerState::LoginFailed, error)
            }
            Attempt::NotLoggedIn => {
                let message = crate::order::OrderError::NotLoggedIn(name.to_string()).to_string();
                reporter.emit(&message);
                outcome.fail(BrokerState::LoginFailed, message)
            }
            Attempt::ActionFailed { function, error } => {
                self.report_failure(broker, function, &error, order, reporter);
                outcome.fail(BrokerState::Errored, error)
            }
            Attempt::Completed(session) => {
                self.finish_action(identity, &session, order, reporter);
                outcome.finish(BrokerState::Done)
            }
            Attempt::Partial { session, error } => {
                self.finish_action(identity, &session, order, reporter);
                outcome.fail(BrokerState::Errored, error)
            }
        }
    }

    fn finish_action(
        &self,
        identity: &str,
        session: &BrokerSession,
        order: &OrderRequest,
        reporter: &Reporter,
    ) {
        match order.action() {
            Action::Holdings => {
                reporter.flush_holdings(identity, session, self.settings.summarize_holdings);
            }
            Action::Buy | Action::Sell => {
                reporter.emit(format!(
                    "All {} transactions complete",
                    session.display_name()
                ));
            }
        }
    }

    fn report_failure(
        &self,
        broker: BrokerId,
        function: &str,
        error: &str,
        order: &OrderRequest,
        reporter: &Reporter,
    ) {
        let error = sanitize_for_log(error);
        tracing::error!(
            broker = %broker,
            function,
            error = %error,
            order = %order,
            "Broker call failed"
        );
        reporter.emit(format!(
            "Error in {function} with {}: {error}",
            broker.display_name()
        ));
    }

    // ------------------------------------------------------------------------
    // Strategies
    // ------------------------------------------------------------------------

    async fn run_direct(
        &self,
        adapter: &dyn Broker,
        ctx: &LoginContext,
        order: &OrderRequest,
        reporter: &Reporter,
        outcome: &mut BrokerOutcome,
    ) -> Attempt {
        let broker = ctx.broker;
        let limit = self.settings.call_timeout;

        let init = worker::run_guarded(broker, "init", limit, adapter.init(ctx)).await;
        let mut session = match init {
            Ok(Ok(Some(session))) => session,
            Ok(Ok(None)) => return Attempt::Unavailable,
            Ok(Err(e)) => {
                return Attempt::LoginFailed {
                    function: "init",
                    error: format!("{e:#}"),
                }
            }
            Err(e) => {
                return Attempt::LoginFailed {
                    function: "init",
                    error: e.to_string(),
                }
            }
        };

        if order
            .validate_post_login(broker.display_name(), session.logged_in_count())
            .is_err()
        {
            return Attempt::NotLoggedIn;
        }
        outcome.advance(BrokerState::LoggedIn);
        outcome.advance(BrokerState::Running);

        let function = action_function(order.action());
        let result = match order.action() {
            Action::Holdings => {
                let holdings = adapter.holdings(&mut session, reporter);
                worker::run_guarded(broker, function, limit, holdings).await
            }
            Action::Buy | Action::Sell => {
                worker::run_guarded(
                    broker,
                    function,
                    limit,
                    adapter.transact(&mut session, order, reporter),
                )
                .await
            }
        };

        match result {
            Ok(Ok(())) => Attempt::Completed(session),
            Ok(Err(e)) => Attempt::ActionFailed {
                function,
                error: format!("{e:#}"),
            },
            Err(e) => Attempt::ActionFailed {
                function,
                error: e.to_string(),
            },
        }
    }

    async fn run_blocking(
        &self,
        adapter: Arc<dyn BlockingBroker>,
        ctx: &LoginContext,
        order: &OrderRequest,
        reporter: &Reporter,
        outcome: &mut BrokerOutcome,
    ) -> Attempt {
        let broker = ctx.broker;
        let limit = self.settings.call_timeout;

        let init = {
            let adapter = Arc::clone(&adapter);
            let ctx = ctx.clone();
            worker::run_blocking(broker, "init", limit, move || adapter.init(&ctx)).await
        };
        let mut session = match init {
            Ok(Ok(Some(session))) => session,
            Ok(Ok(None)) => return Attempt::Unavailable,
            Ok(Err(e)) => {
                return Attempt::LoginFailed {
                    function: "init",
                    error: format!("{e:#}"),
                }
            }
            Err(e) => {
                return Attempt::LoginFailed {
                    function: "init",
                    error: e.to_string(),
                }
            }
        };

        if order
            .validate_post_login(broker.display_name(), session.logged_in_count())
            .is_err()
        {
            return Attempt::NotLoggedIn;
        }
        outcome.advance(BrokerState::LoggedIn);
        outcome.advance(BrokerState::Running);

        let function = action_function(order.action());
        let run = {
            let order = order.clone();
            let reporter = reporter.clone();
            worker::run_blocking(broker, function, limit, move || {
                let result = match order.action() {
                    Action::Holdings => adapter.holdings(&mut session, &reporter),
                    Action::Buy | Action::Sell => adapter.transact(&mut session, &order, &reporter),
                };
                (session, result)
            })
            .await
        };

        match run {
            Ok((session, Ok(()))) => Attempt::Completed(session),
            Ok((_, Err(e))) => Attempt::ActionFailed {
                function,
                error: format!("{e:#}"),
            },
            Err(e) => Attempt::ActionFailed {
                function,
                error: e.to_string(),
            },
        }
    }

    /// One dedicated thread per credential set, sessions merged afterwards.
    async fn run_session(
        &self,
        adapter: Arc<dyn SessionBroker>,
        ctx: &LoginContext,
        order: &OrderRequest,
        reporter: &Reporter,
        outcome: &mut BrokerOutcome,
    ) -> Attempt {
        let broker = ctx.broker;
        if ctx.credentials.is_empty() {
            return Attempt::LoginFailed {
                function: "init",
                error: "no credential sets".to_string(),
            };
        }

        // Login, action and close share one thread budget
        let limit = self.settings.call_timeout * 2;

        let mut jobs = Vec::with_capacity(ctx.credentials.len());
        for set in &ctx.credentials {
            let set_ctx = ctx.for_set(set);
            let adapter = Arc::clone(&adapter);
            let order = order.clone();
            let reporter = reporter.clone();
            jobs.push(tokio::spawn(worker::run_on_session_thread(
                broker,
                "session",
                limit,
                move || async move { session_job(adapter, set_ctx, order, reporter).await },
            )));
        }

        let mut merged = BrokerSession::new(broker.display_name());
        let mut unavailable = 0;
        let mut completed = 0;
        let mut login_errors = Vec::new();
        let mut action_errors = Vec::new();

        for job in jobs {
            let run = match job.await {
                Ok(run) => run,
                Err(e) => Err(DispatchError::Worker {
                    broker,
                    operation: "session",
                    reason: e.to_string(),
                }),
            };
            match run {
                Ok(SessionRun::Unavailable) => unavailable += 1,
                Ok(SessionRun::NotLoggedIn) => {}
                Ok(SessionRun::LoginFailed(e)) => login_errors.push(format!("{e:#}")),
                Ok(SessionRun::Finished { session, action }) => {
                    merged.merge(session);
                    match action {
                        Ok(()) => completed += 1,
                        Err(e) => action_errors.push(format!("{e:#}")),
                    }
                }
                Err(e) => action_errors.push(e.to_string()),
            }
        }

        if unavailable == ctx.credentials.len() {
            return Attempt::Unavailable;
        }
        if merged.logged_in_count() == 0 {
            if let Some(error) = login_errors.into_iter().chain(action_errors).next() {
                return Attempt::LoginFailed {
                    function: "init",
                    error,
                };
            }
            return Attempt::NotLoggedIn;
        }

        outcome.advance(BrokerState::LoggedIn);
        outcome.advance(BrokerState::Running);

        let function = action_function(order.action());
        if login_errors.is_empty() && action_errors.is_empty() {
            return Attempt::Completed(merged);
        }
        for error in &login_errors {
            self.report_failure(broker, "init", error, order, reporter);
        }
        for error in &action_errors {
            self.report_failure(broker, function, error, order, reporter);
        }
        let error = login_errors
            .into_iter()
            .chain(action_errors)
            .collect::<Vec<_>>()
            .join("; ");
        if completed > 0 {
            Attempt::Partial {
                session: merged,
                error,
            }
        } else {
            Attempt::ActionFailed { function, error }
        }
    }
}

/// Runs on the session thread: login, action, close.
async fn session_job(
    adapter: Arc<dyn SessionBroker>,
    ctx: LoginContext,
    order: OrderRequest,
    reporter: Reporter,
) -> SessionRun {
    let mut session = match adapter.login(&ctx).await {
        Ok(Some(session)) => session,
        Ok(None) => return SessionRun::Unavailable,
        Err(e) => return SessionRun::LoginFailed(e),
    };

    if order
        .validate_post_login(ctx.broker.display_name(), session.logged_in_count())
        .is_err()
    {
        adapter.close(&mut session).await;
        return SessionRun::NotLoggedIn;
    }

    let action = match order.action() {
        Action::Holdings => adapter.holdings(&mut session, &reporter).await,
        Action::Buy | Action::Sell => adapter.transact(&mut session, &order, &reporter).await,
    };
    adapter.close(&mut session).await;

    SessionRun::Finished { session, action }
}

fn action_function(action: Action) -> &'static str {
    match action {
        Action::Holdings => "holdings",
        Action::Buy | Action::Sell => "transaction",
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::EnvCredentialStore;
    use crate::relay::{CodeRelay, RelayCodeProvider};
    use crate::reporter::MemorySink;
    use crate::session::{AccountRecord, SubAccount};
    use async_trait::async_trait;

    struct StaticBroker {
        id: BrokerId,
        accounts: usize,
    }

    #[async_trait]
    impl Broker for StaticBroker {
        fn id(&self) -> BrokerId {
            self.id
        }

        async fn init(&self, ctx: &LoginContext) -> anyhow::Result<Option<BrokerSession>> {
            let mut session = BrokerSession::new(self.id.display_name());
            for set in &ctx.credentials {
                if self.accounts == 0 {
                    continue;
                }
                let mut sub = SubAccount::new(ctx.sub_account_key(set), ());
                for n in 0..self.accounts {
                    sub.add_account(AccountRecord::new(format!("1000{n}")));
                }
                session.add_sub_account(sub);
            }
            Ok(Some(session))
        }

        async fn holdings(&self, _s: &mut BrokerSession, _r: &Reporter) -> anyhow::Result<()> {
            Ok(())
        }

        async fn transact(
            &self,
            _s: &mut BrokerSession,
            _o: &OrderRequest,
            _r: &Reporter,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn harness(brokers: &[(BrokerId, usize)]) -> (Dispatcher, Reporter, Arc<MemorySink>, Arc<dyn CodeProvider>) {
        let mut registry = AdapterRegistry::new();
        let mut store = EnvCredentialStore::default();
        for &(id, accounts) in brokers {
            registry.register(Adapter::Direct(Arc::new(StaticBroker { id, accounts })));
            store = store.with_credential(id, "token");
        }
        let sink = Arc::new(MemorySink::new());
        let reporter = Reporter::with_console(sink.clone());
        let codes: Arc<dyn CodeProvider> = Arc::new(RelayCodeProvider::new(
            Arc::new(CodeRelay::default()),
            reporter.clone(),
        ));
        (
            Dispatcher::new(registry, Arc::new(store)),
            reporter,
            sink,
            codes,
        )
    }

    #[test]
    fn test_terminal_states() {
        assert!(BrokerState::Done.is_terminal());
        assert!(BrokerState::Excluded.is_terminal());
        assert!(!BrokerState::LoggedIn.is_terminal());
        assert!(!BrokerState::Pending.is_terminal());
    }

    #[tokio::test]
    async fn test_invalid_order_aborts_without_completion_line() {
        let (dispatcher, reporter, sink, codes) = harness(&[(BrokerId::Tradier, 1)]);
        let order = OrderRequest::new(Action::Buy);

        let err = dispatcher
            .dispatch("alice", &order, &reporter, codes)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(sink.lines(), vec!["No brokers to run".to_string()]);
    }

    #[tokio::test]
    async fn test_unregistered_and_unconfigured_are_skipped_silently() {
        let (dispatcher, reporter, sink, codes) = harness(&[(BrokerId::Tradier, 1)]);
        let order = OrderRequest::holdings([BrokerId::Chase, BrokerId::Tradier]);

        let report = dispatcher
            .dispatch("alice", &order, &reporter, codes)
            .await
            .unwrap();

        assert_eq!(report.state_of(BrokerId::Chase), Some(BrokerState::SkippedUnconfigured));
        assert_eq!(report.state_of(BrokerId::Tradier), Some(BrokerState::Done));
        assert_eq!(report.processed(), vec![BrokerId::Tradier]);
        assert_eq!(sink.count_containing("Chase"), 0);
        assert_eq!(sink.count_containing("Holdings on Tradier"), 1);
        assert_eq!(sink.count_containing(BATCH_COMPLETE), 1);
    }

    #[tokio::test]
    async fn test_no_accounts_is_login_failure() {
        let (dispatcher, reporter, sink, codes) = harness(&[(BrokerId::Tradier, 0)]);
        let order = OrderRequest::trade(Action::Sell, 2.0, ["abc"], [BrokerId::Tradier]);

        let report = dispatcher
            .dispatch("alice", &order, &reporter, codes)
            .await
            .unwrap();

        assert_eq!(report.state_of(BrokerId::Tradier), Some(BrokerState::LoginFailed));
        assert_eq!(sink.count_containing("Tradier not logged in, skipping..."), 1);
        assert_eq!(sink.count_containing("All Tradier transactions complete"), 0);
    }

    #[tokio::test]
    async fn test_trade_emits_per_broker_completion() {
        let (dispatcher, reporter, sink, codes) =
            harness(&[(BrokerId::Tradier, 1), (BrokerId::Public, 2)]);
        let order = OrderRequest::trade(
            Action::Buy,
            1.0,
            ["xyz"],
            [BrokerId::Public, BrokerId::Tradier],
        );

        let report = dispatcher
            .dispatch("alice", &order, &reporter, codes)
            .await
            .unwrap();

        assert_eq!(report.count(BrokerState::Done), 2);
        let lines = sink.lines();
        let public = lines.iter().position(|l| l == "All Public transactions complete");
        let tradier = lines.iter().position(|l| l == "All Tradier transactions complete");
        assert!(public.unwrap() < tradier.unwrap());
        assert_eq!(lines.last().map(String::as_str), Some(BATCH_COMPLETE));
    }
}

//! Integration tests for the dispatch flow.
//!
//! Every broker here is a fake adapter that records what it was asked to do,
//! so the tests can check which brokers ran, which orders were real, and
//! what the user saw.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use rsa_dispatch::{
    parse_command, AccountRecord, Action, Adapter, AdapterRegistry, BlockingBroker, Broker,
    BrokerId, BrokerSession, BrokerState, ChatBridge, CodeOutcome, CodeProvider, CodeRelay,
    DispatchSettings, Dispatcher, EnvCredentialStore, Holding, IncomingMessage, LoginContext,
    MemorySink, OrderRequest, RelayCodeProvider, Reporter, SessionBroker, SubAccount,
    BATCH_COMPLETE,
};

// ============================================================================
// Fake adapters
// ============================================================================

#[derive(Clone, Copy)]
enum Login {
    Accounts(usize),
    Unavailable,
    Fails,
    Panics,
}

/// Direct adapter that records every call.
struct FakeBroker {
    id: BrokerId,
    login: Login,
    fail_action: bool,
    panic_action: bool,
    /// Wait for a verification code during login
    code_label: Option<&'static str>,
    inits: AtomicUsize,
    dry_runs: AtomicUsize,
    real_orders: Mutex<Vec<String>>,
}

impl FakeBroker {
    fn new(id: BrokerId, login: Login) -> Self {
        Self {
            id,
            login,
            fail_action: false,
            panic_action: false,
            code_label: None,
            inits: AtomicUsize::new(0),
            dry_runs: AtomicUsize::new(0),
            real_orders: Mutex::new(Vec::new()),
        }
    }

    fn failing_action(mut self) -> Self {
        self.fail_action = true;
        self
    }

    fn panicking_action(mut self) -> Self {
        self.panic_action = true;
        self
    }

    fn with_code(mut self, label: &'static str) -> Self {
        self.code_label = Some(label);
        self
    }

    fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    fn real_orders(&self) -> Vec<String> {
        self.real_orders.lock().unwrap().clone()
    }
}

fn logged_in_session(ctx: &LoginContext, accounts: usize) -> BrokerSession {
    let mut session = BrokerSession::new(ctx.broker.display_name());
    if accounts == 0 {
        return session;
    }
    for set in &ctx.credentials {
        let mut sub = SubAccount::new(ctx.sub_account_key(set), ());
        for n in 0..accounts {
            sub.add_account(AccountRecord::new(format!("{}00{n}", set.index)));
        }
        session.add_sub_account(sub);
    }
    session
}

fn fill_holdings(session: &mut BrokerSession) {
    for sub in session.sub_accounts_mut() {
        for account in &mut sub.accounts {
            account.holdings = vec![Holding::new("XYZ", 2.0, Some(10.0))];
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    fn id(&self) -> BrokerId {
        self.id
    }

    async fn init(&self, ctx: &LoginContext) -> Result<Option<BrokerSession>> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if let Some(label) = self.code_label {
            match ctx.request_code(label, None).await {
                CodeOutcome::Code(code) if code == "999999" => {}
                CodeOutcome::Code(code) => bail!("wrong code {code}"),
                CodeOutcome::TimedOut => bail!("no code received"),
            }
        }
        match self.login {
            Login::Accounts(n) => Ok(Some(logged_in_session(ctx, n))),
            Login::Unavailable => Ok(None),
            Login::Fails => Err(anyhow!("bad password")),
            Login::Panics => panic!("client library crashed"),
        }
    }

    async fn holdings(&self, session: &mut BrokerSession, _reporter: &Reporter) -> Result<()> {
        if self.panic_action {
            panic!("holdings parser crashed");
        }
        if self.fail_action {
            bail!("holdings endpoint down");
        }
        fill_holdings(session);
        Ok(())
    }

    async fn transact(
        &self,
        session: &mut BrokerSession,
        order: &OrderRequest,
        reporter: &Reporter,
    ) -> Result<()> {
        if self.fail_action {
            bail!("order endpoint down");
        }
        let name = self.id.display_name();
        let amount = order.amount().unwrap_or_default();
        for symbol in order.symbols() {
            for (_, account) in session.accounts() {
                if order.dry_run() {
                    self.dry_runs.fetch_add(1, Ordering::SeqCst);
                    reporter.emit(format!(
                        "{name} account {}: Running in DRY mode",
                        account.number
                    ));
                } else {
                    self.real_orders
                        .lock()
                        .unwrap()
                        .push(format!("{} {amount} {symbol}", order.action()));
                    reporter.emit(format!("{name} {} {amount} {symbol} success", order.action()));
                }
            }
        }
        Ok(())
    }
}

/// Blocking adapter: login waits for a code from a blocking thread.
struct FakeBlockingBroker {
    id: BrokerId,
    panic_on_init: bool,
}

impl BlockingBroker for FakeBlockingBroker {
    fn id(&self) -> BrokerId {
        self.id
    }

    fn init(&self, ctx: &LoginContext) -> Result<Option<BrokerSession>> {
        if self.panic_on_init {
            panic!("sdk crashed");
        }
        let label = format!("{} 1", ctx.broker.display_name());
        match ctx.request_code_blocking(&label, Some(6)) {
            CodeOutcome::Code(_) => Ok(Some(logged_in_session(ctx, 1))),
            CodeOutcome::TimedOut => bail!("no code received"),
        }
    }

    fn holdings(&self, session: &mut BrokerSession, _reporter: &Reporter) -> Result<()> {
        fill_holdings(session);
        Ok(())
    }

    fn transact(&self, _s: &mut BrokerSession, _o: &OrderRequest, _r: &Reporter) -> Result<()> {
        Ok(())
    }
}

/// Session adapter: credential sets whose first field is "bad" fail to log in.
struct FakeSessionBroker {
    id: BrokerId,
    panic_on_login: bool,
    threads: Mutex<Vec<String>>,
    closed: AtomicUsize,
}

impl FakeSessionBroker {
    fn new(id: BrokerId) -> Self {
        Self {
            id,
            panic_on_login: false,
            threads: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionBroker for FakeSessionBroker {
    fn id(&self) -> BrokerId {
        self.id
    }

    async fn login(&self, ctx: &LoginContext) -> Result<Option<BrokerSession>> {
        if self.panic_on_login {
            panic!("browser crashed");
        }
        let name = std::thread::current().name().unwrap_or_default().to_string();
        self.threads.lock().unwrap().push(name);

        if ctx.credentials[0].field(0) == Some("bad") {
            bail!("login rejected");
        }
        Ok(Some(logged_in_session(ctx, 1)))
    }

    async fn holdings(&self, session: &mut BrokerSession, _reporter: &Reporter) -> Result<()> {
        fill_holdings(session);
        Ok(())
    }

    async fn transact(
        &self,
        _session: &mut BrokerSession,
        _order: &OrderRequest,
        _reporter: &Reporter,
    ) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _session: &mut BrokerSession) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    dispatcher: Dispatcher,
    reporter: Reporter,
    lines: Arc<MemorySink>,
    relay: Arc<CodeRelay>,
    codes: Arc<dyn CodeProvider>,
}

impl Harness {
    fn new(adapters: Vec<Adapter>) -> Self {
        let mut registry = AdapterRegistry::new();
        let mut store = EnvCredentialStore::default();
        for adapter in adapters {
            let raw = match adapter.id() {
                BrokerId::Fidelity => "bad:pw,user:pw",
                BrokerId::Webull => "user:pw:device:1234",
                _ => "user:pw",
            };
            store = store.with_credential(adapter.id(), raw);
            registry.register(adapter);
        }

        let lines = Arc::new(MemorySink::new());
        let reporter = Reporter::with_console(lines.clone());
        let relay = Arc::new(CodeRelay::new(Duration::from_secs(5)));
        let codes: Arc<dyn CodeProvider> =
            Arc::new(RelayCodeProvider::new(relay.clone(), reporter.clone()));
        let settings = DispatchSettings {
            call_timeout: Duration::from_secs(10),
            headless: true,
            summarize_holdings: true,
        };

        Self {
            dispatcher: Dispatcher::new(registry, Arc::new(store)).with_settings(settings),
            reporter,
            lines,
            relay,
            codes,
        }
    }

    async fn run(&self, command: &str) -> rsa_dispatch::BatchReport {
        let order = parse_command(command).unwrap();
        self.dispatcher
            .dispatch("alice", &order, &self.reporter, self.codes.clone())
            .await
            .unwrap()
    }
}

/// Submit `code` as soon as a challenge for `label` is open.
fn answer_code(relay: Arc<CodeRelay>, label: &'static str, code: &'static str) {
    tokio::spawn(async move {
        loop {
            if relay.pending_labels("alice").await.iter().any(|l| l == label) {
                relay.submit_code("alice", label, code).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
}

// ============================================================================
// Orchestration properties
// ============================================================================

#[tokio::test]
async fn test_excluded_brokers_are_never_processed() {
    let chase = Arc::new(FakeBroker::new(BrokerId::Chase, Login::Accounts(1)));
    let public = Arc::new(FakeBroker::new(BrokerId::Public, Login::Accounts(1)));
    let harness = Harness::new(vec![
        Adapter::Direct(chase.clone()),
        Adapter::Direct(public.clone()),
    ]);

    let report = harness.run("holdings chase,public not public").await;

    assert_eq!(report.state_of(BrokerId::Public), Some(BrokerState::Excluded));
    assert_eq!(report.state_of(BrokerId::Chase), Some(BrokerState::Done));
    assert!(!report.processed().contains(&BrokerId::Public));
    assert_eq!(public.inits(), 0);
    assert_eq!(chase.inits(), 1);
}

#[tokio::test]
async fn test_dry_run_never_places_real_orders() {
    let chase = Arc::new(FakeBroker::new(BrokerId::Chase, Login::Accounts(2)));
    let public = Arc::new(FakeBroker::new(BrokerId::Public, Login::Accounts(1)));
    let harness = Harness::new(vec![
        Adapter::Direct(chase.clone()),
        Adapter::Direct(public.clone()),
    ]);

    let report = harness.run("buy 1 xyz,abc chase,public").await;

    assert_eq!(report.count(BrokerState::Done), 2);
    assert!(chase.real_orders().is_empty());
    assert!(public.real_orders().is_empty());
    // 2 symbols x 2 accounts
    assert_eq!(chase.dry_runs.load(Ordering::SeqCst), 4);
    assert_eq!(harness.lines.count_containing("success"), 0);
}

#[tokio::test]
async fn test_failing_middle_adapter_does_not_stop_the_batch() {
    let first = Arc::new(FakeBroker::new(BrokerId::Chase, Login::Accounts(1)));
    let middle = Arc::new(FakeBroker::new(BrokerId::Firstrade, Login::Accounts(1)).failing_action());
    let last = Arc::new(FakeBroker::new(BrokerId::Public, Login::Accounts(1)));
    let harness = Harness::new(vec![
        Adapter::Direct(first.clone()),
        Adapter::Direct(middle),
        Adapter::Direct(last.clone()),
    ]);

    let report = harness.run("sell 3 xyz chase,ft,public false").await;

    assert_eq!(report.state_of(BrokerId::Chase), Some(BrokerState::Done));
    assert_eq!(report.state_of(BrokerId::Firstrade), Some(BrokerState::Errored));
    assert_eq!(report.state_of(BrokerId::Public), Some(BrokerState::Done));
    assert_eq!(first.real_orders(), vec!["sell 3 XYZ".to_string()]);
    assert_eq!(last.real_orders(), vec!["sell 3 XYZ".to_string()]);
    assert_eq!(
        harness
            .lines
            .count_containing("Error in transaction with Firstrade: order endpoint down"),
        1
    );
    assert_eq!(harness.lines.count_containing(BATCH_COMPLETE), 1);
}

#[tokio::test]
async fn test_login_failure_is_isolated() {
    let failing = Arc::new(FakeBroker::new(BrokerId::Chase, Login::Fails));
    let ok = Arc::new(FakeBroker::new(BrokerId::Public, Login::Accounts(1)));
    let harness = Harness::new(vec![Adapter::Direct(failing), Adapter::Direct(ok)]);

    let report = harness.run("holdings chase,public").await;

    assert_eq!(report.state_of(BrokerId::Chase), Some(BrokerState::LoginFailed));
    assert_eq!(report.state_of(BrokerId::Public), Some(BrokerState::Done));
    assert_eq!(harness.lines.count_containing("Error in init with Chase: bad password"), 1);
    assert_eq!(harness.lines.count_containing("Holdings on Public (alice)"), 1);
}

#[tokio::test]
async fn test_middle_login_failure_does_not_stop_the_batch() {
    let first = Arc::new(FakeBroker::new(BrokerId::Chase, Login::Accounts(1)));
    let middle = Arc::new(FakeBroker::new(BrokerId::Firstrade, Login::Fails));
    let last = Arc::new(FakeBroker::new(BrokerId::Public, Login::Accounts(1)));
    let harness = Harness::new(vec![
        Adapter::Direct(first.clone()),
        Adapter::Direct(middle.clone()),
        Adapter::Direct(last.clone()),
    ]);

    let report = harness.run("buy 1 xyz chase,ft,public false").await;

    assert_eq!(report.state_of(BrokerId::Chase), Some(BrokerState::Done));
    assert_eq!(report.state_of(BrokerId::Firstrade), Some(BrokerState::LoginFailed));
    assert_eq!(report.state_of(BrokerId::Public), Some(BrokerState::Done));
    assert_eq!(middle.inits(), 1);
    assert_eq!(first.real_orders(), vec!["buy 1 XYZ".to_string()]);
    assert_eq!(last.real_orders(), vec!["buy 1 XYZ".to_string()]);
    assert_eq!(
        harness.lines.lines().last().map(String::as_str),
        Some(BATCH_COMPLETE)
    );
}

#[tokio::test]
async fn test_direct_adapter_panic_on_login_is_contained() {
    let panicking = Arc::new(FakeBroker::new(BrokerId::Chase, Login::Panics));
    let healthy = Arc::new(FakeBroker::new(BrokerId::Public, Login::Accounts(1)));
    let harness = Harness::new(vec![
        Adapter::Direct(panicking),
        Adapter::Direct(healthy.clone()),
    ]);

    let report = harness.run("holdings chase,public").await;

    assert_eq!(report.state_of(BrokerId::Chase), Some(BrokerState::LoginFailed));
    assert!(report
        .outcome(BrokerId::Chase)
        .and_then(|o| o.error.as_deref())
        .is_some_and(|e| e.contains("client library crashed")));
    assert_eq!(report.state_of(BrokerId::Public), Some(BrokerState::Done));
    assert_eq!(healthy.inits(), 1);
    assert_eq!(harness.lines.count_containing("Error in init with Chase"), 1);
    assert_eq!(
        harness.lines.lines().last().map(String::as_str),
        Some(BATCH_COMPLETE)
    );
}

#[tokio::test]
async fn test_direct_adapter_panic_in_action_is_errored() {
    let panicking =
        Arc::new(FakeBroker::new(BrokerId::Chase, Login::Accounts(1)).panicking_action());
    let healthy = Arc::new(FakeBroker::new(BrokerId::Public, Login::Accounts(1)));
    let harness = Harness::new(vec![
        Adapter::Direct(panicking),
        Adapter::Direct(healthy),
    ]);

    let report = harness.run("holdings chase,public").await;

    assert_eq!(report.state_of(BrokerId::Chase), Some(BrokerState::Errored));
    assert_eq!(harness.lines.count_containing("Error in holdings with Chase"), 1);
    assert_eq!(report.state_of(BrokerId::Public), Some(BrokerState::Done));
    assert_eq!(harness.lines.count_containing(BATCH_COMPLETE), 1);
}

#[tokio::test]
async fn test_end_to_end_buy_with_unavailable_broker() {
    let tradier = Arc::new(FakeBroker::new(BrokerId::Tradier, Login::Accounts(1)));
    let public = Arc::new(FakeBroker::new(BrokerId::Public, Login::Unavailable));
    let harness = Harness::new(vec![
        Adapter::Direct(tradier.clone()),
        Adapter::Direct(public.clone()),
    ]);

    let report = harness.run("buy 1 XYZ tradier,public dry:false").await;

    assert_eq!(report.state_of(BrokerId::Tradier), Some(BrokerState::Done));
    assert_eq!(
        report.state_of(BrokerId::Public),
        Some(BrokerState::SkippedUnconfigured)
    );
    assert_eq!(public.inits(), 1);
    assert_eq!(harness.lines.count_containing("Public not found, skipping..."), 1);
    assert_eq!(harness.lines.count_containing("Tradier buy 1 XYZ success"), 1);
    assert_eq!(harness.lines.count_containing(BATCH_COMPLETE), 1);
    assert_eq!(
        harness.lines.lines().last().map(String::as_str),
        Some(BATCH_COMPLETE)
    );
}

#[tokio::test]
async fn test_holdings_report_is_flushed_per_broker() {
    let chase = Arc::new(FakeBroker::new(BrokerId::Chase, Login::Accounts(2)));
    let harness = Harness::new(vec![Adapter::Direct(chase)]);

    harness.run("holdings chase").await;

    let report = harness
        .lines
        .lines()
        .into_iter()
        .find(|l| l.starts_with("Holdings on Chase (alice)"))
        .unwrap();
    assert!(report.contains("alice-Chase 1"));
    assert!(report.contains("XYZ: 2 @ $10.00 = $20.00"));
}

// ============================================================================
// Worker strategies
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_adapter_waits_for_code_without_stalling() {
    let harness = Harness::new(vec![Adapter::Blocking(Arc::new(FakeBlockingBroker {
        id: BrokerId::Webull,
        panic_on_init: false,
    }))]);
    answer_code(harness.relay.clone(), "Webull 1", "123456");

    let report = harness.run("holdings webull").await;

    assert_eq!(report.state_of(BrokerId::Webull), Some(BrokerState::Done));
    assert_eq!(
        harness
            .lines
            .count_containing("Webull 1 requires a 6-digit verification code"),
        1
    );
    assert_eq!(harness.lines.count_containing("Holdings on Webull (alice)"), 1);
}

#[tokio::test]
async fn test_blocking_adapter_panic_becomes_login_failure() {
    let last = Arc::new(FakeBroker::new(BrokerId::Public, Login::Accounts(1)));
    let harness = Harness::new(vec![
        Adapter::Blocking(Arc::new(FakeBlockingBroker {
            id: BrokerId::Webull,
            panic_on_init: true,
        })),
        Adapter::Direct(last),
    ]);

    let report = harness.run("holdings webull,public").await;

    assert_eq!(report.state_of(BrokerId::Webull), Some(BrokerState::LoginFailed));
    assert!(report
        .outcome(BrokerId::Webull)
        .and_then(|o| o.error.as_deref())
        .is_some_and(|e| e.contains("sdk crashed")));
    assert_eq!(report.state_of(BrokerId::Public), Some(BrokerState::Done));
}

#[tokio::test]
async fn test_session_adapter_isolates_credential_sets() {
    let fidelity = Arc::new(FakeSessionBroker::new(BrokerId::Fidelity));
    let harness = Harness::new(vec![Adapter::Session(fidelity.clone())]);

    let report = harness.run("holdings fid").await;

    // Set 1 is rejected, set 2 still reports
    assert_eq!(report.state_of(BrokerId::Fidelity), Some(BrokerState::Errored));
    let holdings = harness
        .lines
        .lines()
        .into_iter()
        .find(|l| l.starts_with("Holdings on Fidelity"))
        .unwrap();
    assert!(holdings.contains("alice-Fidelity 2"));
    assert!(!holdings.contains("alice-Fidelity 1"));
    assert_eq!(
        harness
            .lines
            .count_containing("Error in init with Fidelity: login rejected"),
        1
    );

    let threads = fidelity.threads.lock().unwrap().clone();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().all(|t| t == "rsa-fidelity-session"));
    // Only the logged-in set is closed
    assert_eq!(fidelity.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_session_adapter_panic_is_contained() {
    let mut crashing = FakeSessionBroker::new(BrokerId::Schwab);
    crashing.panic_on_login = true;
    let last = Arc::new(FakeBroker::new(BrokerId::Public, Login::Accounts(1)));
    let harness = Harness::new(vec![
        Adapter::Session(Arc::new(crashing)),
        Adapter::Direct(last),
    ]);

    let report = harness.run("buy 1 xyz schwab,public").await;

    assert_eq!(report.state_of(BrokerId::Schwab), Some(BrokerState::LoginFailed));
    assert_eq!(report.state_of(BrokerId::Public), Some(BrokerState::Done));
    assert_eq!(harness.lines.count_containing("All Public transactions complete"), 1);
    assert_eq!(harness.lines.count_containing(BATCH_COMPLETE), 1);
}

// ============================================================================
// Chat bridge
// ============================================================================

#[tokio::test]
async fn test_chat_code_reaches_dispatch_waiting_on_it() {
    let chase = Arc::new(FakeBroker::new(BrokerId::Chase, Login::Accounts(1)).with_code("Chase 1"));
    let mut registry = AdapterRegistry::new();
    registry.register(Adapter::Direct(chase.clone()));
    let store = EnvCredentialStore::default().with_credential(BrokerId::Chase, "user:pw");
    let dispatcher = Arc::new(Dispatcher::new(registry, Arc::new(store)));

    let relay = Arc::new(CodeRelay::new(Duration::from_secs(5)));
    let bridge = Arc::new(
        ChatBridge::new(dispatcher, relay.clone()).with_console(Arc::new(MemorySink::new())),
    );

    let order_replies = Arc::new(MemorySink::new());
    let order = {
        let bridge = bridge.clone();
        let reply = order_replies.clone();
        tokio::spawn(async move {
            bridge
                .process(IncomingMessage {
                    identity: "alice".into(),
                    text: "!rsa holdings chase".into(),
                    is_direct: false,
                    reply,
                })
                .await
        })
    };

    while relay.pending_labels("alice").await.is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let code_replies = Arc::new(MemorySink::new());
    bridge
        .process(IncomingMessage {
            identity: "alice".into(),
            text: "!code Chase 1 999999".into(),
            is_direct: false,
            reply: code_replies.clone(),
        })
        .await
        .unwrap();
    assert_eq!(code_replies.lines(), vec!["Code received for Chase 1".to_string()]);

    assert!(order.await.unwrap().unwrap());
    assert_eq!(
        order_replies.count_containing("Chase 1 requires a verification code"),
        1
    );
    assert_eq!(order_replies.count_containing("Holdings on Chase (alice)"), 1);
    assert_eq!(order_replies.count_containing(BATCH_COMPLETE), 1);
}

#[tokio::test]
async fn test_long_chat_replies_are_chunked() {
    let sink = Arc::new(MemorySink::with_max_len(2000));
    let reporter = Reporter::with_console(Arc::new(MemorySink::new())).attach_remote(sink.clone());

    let text = "x".repeat(5000);
    reporter.emit(&text);
    reporter.flush().await;

    let chunks = sink.lines();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks.concat(), text);
    assert!(chunks.iter().all(|c| c.chars().count() <= 2000));
}

#[test]
fn test_group_aliases() {
    let most = parse_command("holdings most").unwrap();
    let all = parse_command("holdings all").unwrap();
    assert_eq!(all.brokers().len(), most.brokers().len() + 1);
    assert!(!most.brokers().contains(&BrokerId::Vanguard));
    assert_eq!(
        parse_command("holdings most").unwrap().brokers(),
        most.brokers()
    );
    assert_eq!(most.action(), Action::Holdings);
}

//! Out-of-band 2FA code relay.
//!
//! Broker logins that need a verification code register a pending challenge
//! keyed by `(identity, label)` and suspend until the code arrives from a
//! different context (a chat message, the console) or the deadline passes.
//!
//! ```text
//!  login ──register(identity, label)──▶ pending map ◀──submit(identity, label, code)── chat
//!    │                                      │
//!    └────── wait (deadline) ◀──oneshot─────┘
//! ```
//!
//! Correlation always uses the full key, so one user logging into several
//! brokers at once gets each code routed to the login that asked for it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::reporter::Reporter;

/// Default time a login waits for its code.
pub const DEFAULT_CODE_TIMEOUT: Duration = Duration::from_secs(300);

/// How a code wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeOutcome {
    Code(String),
    TimedOut,
}

impl CodeOutcome {
    pub fn into_code(self) -> Option<String> {
        match self {
            Self::Code(code) => Some(code),
            Self::TimedOut => None,
        }
    }
}

/// Result of submitting a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed to the waiting login
    Delivered,
    /// Nothing is waiting under that key
    NoPending,
    /// The challenge deadline already passed
    Expired,
    /// Wrong length; the challenge stays open
    Rejected,
    /// More than one challenge open for the identity, a label is required
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChallengeKey {
    identity: String,
    label: String,
}

struct PendingChallenge {
    id: u64,
    deadline: Instant,
    code_length: Option<usize>,
    responder: oneshot::Sender<String>,
}

type PendingMap = Arc<Mutex<HashMap<ChallengeKey, PendingChallenge>>>;

/// Registry of logins waiting for a code.
pub struct CodeRelay {
    pending: PendingMap,
    next_id: AtomicU64,
    default_timeout: Duration,
}

/// A registered challenge. Await [`PendingCode::wait`] for the outcome.
pub struct PendingCode {
    key: ChallengeKey,
    id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<String>,
    pending: PendingMap,
}

impl PendingCode {
    pub fn label(&self) -> &str {
        &self.key.label
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the code arrives or the deadline passes.
    pub async fn wait(self) -> CodeOutcome {
        let PendingCode {
            key,
            id,
            deadline,
            rx,
            pending,
        } = self;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(code)) => CodeOutcome::Code(code),
            Ok(Err(_)) => {
                // Superseded by a newer registration, or expired on submit
                tracing::debug!(identity = %key.identity, label = %key.label, "Code challenge closed");
                CodeOutcome::TimedOut
            }
            Err(_) => {
                let mut map = pending.lock().await;
                if map.get(&key).is_some_and(|c| c.id == id) {
                    map.remove(&key);
                }
                tracing::warn!(identity = %key.identity, label = %key.label, "Timed out waiting for code");
                CodeOutcome::TimedOut
            }
        }
    }
}

impl CodeRelay {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Open a challenge for `(identity, label)`.
    ///
    /// A second registration under the same key supersedes the first, whose
    /// wait then resolves as timed out.
    pub async fn register(
        &self,
        identity: &str,
        label: &str,
        code_length: Option<usize>,
        timeout: Option<Duration>,
    ) -> PendingCode {
        let key = ChallengeKey {
            identity: identity.to_string(),
            label: label.to_string(),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();

        let replaced = self.pending.lock().await.insert(
            key.clone(),
            PendingChallenge {
                id,
                deadline,
                code_length,
                responder: tx,
            },
        );
        if replaced.is_some() {
            tracing::warn!(identity = %identity, label = %label, "Replaced pending code challenge");
        }
        tracing::info!(identity = %identity, label = %label, "Waiting for verification code");

        PendingCode {
            key,
            id,
            deadline,
            rx,
            pending: Arc::clone(&self.pending),
        }
    }

    /// Register and wait in one step.
    pub async fn await_code(
        &self,
        identity: &str,
        label: &str,
        code_length: Option<usize>,
        timeout: Option<Duration>,
    ) -> CodeOutcome {
        self.register(identity, label, code_length, timeout)
            .await
            .wait()
            .await
    }

    /// Deliver a code to the challenge registered under `(identity, label)`.
    pub async fn submit_code(&self, identity: &str, label: &str, code: &str) -> SubmitOutcome {
        let key = ChallengeKey {
            identity: identity.to_string(),
            label: label.to_string(),
        };
        let mut map = self.pending.lock().await;
        deliver(&mut map, &key, code)
    }

    /// Deliver a code when exactly one challenge is open for `identity`.
    pub async fn submit_for_identity(&self, identity: &str, code: &str) -> SubmitOutcome {
        let mut map = self.pending.lock().await;
        let mut keys = map.keys().filter(|k| k.identity == identity);
        let key = match (keys.next(), keys.next()) {
            (None, _) => return SubmitOutcome::NoPending,
            (Some(_), Some(_)) => return SubmitOutcome::Ambiguous,
            (Some(key), None) => key.clone(),
        };
        deliver(&mut map, &key, code)
    }

    /// Labels with an open challenge for `identity`, sorted.
    pub async fn pending_labels(&self, identity: &str) -> Vec<String> {
        let map = self.pending.lock().await;
        let mut labels: Vec<String> = map
            .keys()
            .filter(|k| k.identity == identity)
            .map(|k| k.label.clone())
            .collect();
        labels.sort();
        labels
    }

    /// Drop challenges whose deadline passed. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.pending.lock().await;
        let before = map.len();
        map.retain(|_, c| c.deadline > now);
        before - map.len()
    }
}

impl Default for CodeRelay {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_TIMEOUT)
    }
}

fn deliver(
    map: &mut HashMap<ChallengeKey, PendingChallenge>,
    key: &ChallengeKey,
    code: &str,
) -> SubmitOutcome {
    let code = code.trim();
    let Some(challenge) = map.get(key) else {
        return SubmitOutcome::NoPending;
    };

    if Instant::now() >= challenge.deadline {
        map.remove(key);
        return SubmitOutcome::Expired;
    }
    let length_ok = challenge
        .code_length
        .map_or(true, |len| code.chars().count() == len);
    if code.is_empty() || !length_ok {
        return SubmitOutcome::Rejected;
    }

    let Some(challenge) = map.remove(key) else {
        return SubmitOutcome::NoPending;
    };
    match challenge.responder.send(code.to_string()) {
        Ok(()) => {
            tracing::info!(identity = %key.identity, label = %key.label, "Verification code delivered");
            SubmitOutcome::Delivered
        }
        // The waiter gave up between the deadline check and the send
        Err(_) => SubmitOutcome::NoPending,
    }
}

// ============================================================================
// Code providers
// ============================================================================

/// Source of verification codes handed to adapters during login.
#[async_trait]
pub trait CodeProvider: Send + Sync {
    async fn request_code(
        &self,
        identity: &str,
        label: &str,
        code_length: Option<usize>,
    ) -> CodeOutcome;
}

/// Chat mode: prompt through the reporter and wait on the relay.
pub struct RelayCodeProvider {
    relay: Arc<CodeRelay>,
    reporter: Reporter,
    timeout: Duration,
}

impl RelayCodeProvider {
    pub fn new(relay: Arc<CodeRelay>, reporter: Reporter) -> Self {
        let timeout = relay.default_timeout();
        Self {
            relay,
            reporter,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CodeProvider for RelayCodeProvider {
    async fn request_code(
        &self,
        identity: &str,
        label: &str,
        code_length: Option<usize>,
    ) -> CodeOutcome {
        let pending = self
            .relay
            .register(identity, label, code_length, Some(self.timeout))
            .await;

        let digits = code_length
            .map(|n| format!("{n}-digit "))
            .unwrap_or_default();
        self.reporter.emit(format!(
            "{label} requires a {digits}verification code. Reply with `!code {label} <code>` within {} seconds",
            self.timeout.as_secs()
        ));

        let outcome = pending.wait().await;
        if outcome == CodeOutcome::TimedOut {
            self.reporter
                .emit(format!("Timed out waiting for {label} verification code"));
        }
        outcome
    }
}

/// CLI mode: read the code from stdin.
pub struct ConsoleCodeProvider {
    timeout: Duration,
}

impl ConsoleCodeProvider {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CodeProvider for ConsoleCodeProvider {
    async fn request_code(
        &self,
        _identity: &str,
        label: &str,
        _code_length: Option<usize>,
    ) -> CodeOutcome {
        let prompt = format!("Enter {label} verification code: ");
        // The blocking read cannot be cancelled; on timeout the thread stays
        // parked on stdin until the next line arrives.
        let read = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            let _ = write!(stdout, "{prompt}");
            let _ = stdout.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        });

        match tokio::time::timeout(self.timeout, read).await {
            Ok(Ok(Ok(line))) if !line.trim().is_empty() => CodeOutcome::Code(line.trim().to_string()),
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, label = %label, "Failed to read code from stdin");
                CodeOutcome::TimedOut
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, label = %label, "Code reader task failed");
                CodeOutcome::TimedOut
            }
            _ => CodeOutcome::TimedOut,
        }
    }
}

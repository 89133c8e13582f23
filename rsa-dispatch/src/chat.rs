//! Chat command bridge.
//!
//! Routes incoming chat messages to the dispatcher, the code relay and the
//! credential store. The chat transport itself lives elsewhere: it hands
//! over an [`IncomingMessage`] carrying a reply sink, and every reply for
//! that message goes through a [`Reporter`] attached to that sink.
//!
//! Each message is processed in its own task, so a dispatch that is waiting
//! for a verification code never blocks the `!code` message that answers it.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use rsa_common::ChatConfig;

use crate::broker::BrokerId;
use crate::command::parse_command;
use crate::credentials::SqliteCredentialStore;
use crate::dispatcher::Dispatcher;
use crate::relay::{CodeProvider, CodeRelay, RelayCodeProvider, SubmitOutcome};
use crate::reporter::{ConsoleSink, MessageSink, Reporter, StdoutConsole};

/// A chat message addressed to the bot.
pub struct IncomingMessage {
    /// Stable id of the sender
    pub identity: String,
    pub text: String,
    /// Sent as a direct message rather than in a shared channel
    pub is_direct: bool,
    /// Where replies go
    pub reply: Arc<dyn MessageSink>,
}

/// Commands understood by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Ping,
    Rsa(String),
    Code(Vec<String>),
    AddCredentials(Vec<String>),
    RemoveCredentials(Vec<String>),
    ListCredentials,
}

impl ChatCommand {
    /// Parse `text` if it starts with `prefix` and names a known command.
    pub fn parse(prefix: &str, text: &str) -> Option<Self> {
        let body = text.trim().strip_prefix(prefix)?;
        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (body, ""),
        };
        let args = || rest.split_whitespace().map(str::to_string).collect();

        match name.to_lowercase().as_str() {
            "ping" => Some(Self::Ping),
            "rsa" => Some(Self::Rsa(rest.to_string())),
            "code" => Some(Self::Code(args())),
            "rsaadd" => Some(Self::AddCredentials(args())),
            "removersa" => Some(Self::RemoveCredentials(args())),
            "accountrsa" => Some(Self::ListCredentials),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Rsa(_) => "rsa",
            Self::Code(_) => "code",
            Self::AddCredentials(_) => "rsaadd",
            Self::RemoveCredentials(_) => "removersa",
            Self::ListCredentials => "accountrsa",
        }
    }
}

/// Chat front end for the dispatcher.
pub struct ChatBridge {
    dispatcher: Arc<Dispatcher>,
    relay: Arc<CodeRelay>,
    credentials: Option<Arc<SqliteCredentialStore>>,
    console: Arc<dyn ConsoleSink>,
    prefix: String,
    code_timeout: Duration,
    summary_threshold: Option<usize>,
}

impl ChatBridge {
    pub fn new(dispatcher: Arc<Dispatcher>, relay: Arc<CodeRelay>) -> Self {
        let code_timeout = relay.default_timeout();
        Self {
            dispatcher,
            relay,
            credentials: None,
            console: Arc::new(StdoutConsole),
            prefix: ChatConfig::default().command_prefix,
            code_timeout,
            summary_threshold: None,
        }
    }

    /// Enable the credential management commands.
    pub fn with_credentials(mut self, store: Arc<SqliteCredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn with_config(mut self, config: &ChatConfig) -> Self {
        self.prefix = config.command_prefix.clone();
        self
    }

    pub fn with_console(mut self, console: Arc<dyn ConsoleSink>) -> Self {
        self.console = console;
        self
    }

    pub fn with_code_timeout(mut self, timeout: Duration) -> Self {
        self.code_timeout = timeout;
        self
    }

    pub fn with_summary_threshold(mut self, threshold: usize) -> Self {
        self.summary_threshold = Some(threshold);
        self
    }

    pub fn relay(&self) -> &Arc<CodeRelay> {
        &self.relay
    }

    /// Handle one message. Returns false when it is not a bridge command.
    pub async fn process(&self, message: IncomingMessage) -> Result<bool> {
        let Some(command) = ChatCommand::parse(&self.prefix, &message.text) else {
            return Ok(false);
        };
        tracing::info!(
            identity = %message.identity,
            command = command.name(),
            direct = message.is_direct,
            "Chat command received"
        );

        let reporter = self.reporter_for(&message);
        match command {
            ChatCommand::Ping => reporter.emit("pong"),
            ChatCommand::Rsa(args) => self.run_order(&message.identity, &args, &reporter).await,
            ChatCommand::Code(args) => self.submit_code(&message.identity, &args, &reporter).await,
            ChatCommand::AddCredentials(args) => {
                if message.is_direct {
                    self.add_credentials(&message.identity, &args, &reporter)
                        .await
                } else {
                    reporter.emit("This command can only be used via DM.");
                }
            }
            ChatCommand::RemoveCredentials(args) => {
                self.remove_credentials(&message.identity, &args, &reporter)
                    .await
            }
            ChatCommand::ListCredentials => {
                self.list_credentials(&message.identity, &reporter).await
            }
        }

        reporter.flush().await;
        Ok(true)
    }

    fn reporter_for(&self, message: &IncomingMessage) -> Reporter {
        let mut reporter = Reporter::with_console(Arc::clone(&self.console));
        if let Some(threshold) = self.summary_threshold {
            reporter = reporter.with_summary_threshold(threshold);
        }
        reporter.attach_remote(Arc::clone(&message.reply))
    }

    async fn run_order(&self, identity: &str, args: &str, reporter: &Reporter) {
        let order = match parse_command(args) {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "Rejected order command");
                reporter.emit(format!("Error placing order: {e}"));
                return;
            }
        };

        let codes: Arc<dyn CodeProvider> = Arc::new(
            RelayCodeProvider::new(Arc::clone(&self.relay), reporter.clone())
                .with_timeout(self.code_timeout),
        );
        // The dispatcher reports fatal errors itself
        if let Err(e) = self.dispatcher.dispatch(identity, &order, reporter, codes).await {
            tracing::error!(identity = %identity, error = %e, "Dispatch aborted");
        }
    }

    async fn submit_code(&self, identity: &str, args: &[String], reporter: &Reporter) {
        let Some((code, label)) = args.split_last() else {
            reporter.emit("Usage: !code [label] <code>");
            return;
        };
        let label = label.join(" ");

        let outcome = if label.is_empty() {
            self.relay.submit_for_identity(identity, code).await
        } else {
            self.relay.submit_code(identity, &label, code).await
        };
        tracing::info!(identity = %identity, label = %label, outcome = ?outcome, "Code submitted");

        let target = if label.is_empty() {
            String::new()
        } else {
            format!(" for {label}")
        };
        let reply = match outcome {
            SubmitOutcome::Delivered => format!("Code received{target}"),
            SubmitOutcome::NoPending => format!("No verification code is pending{target}"),
            SubmitOutcome::Expired => format!("Verification code{target} arrived too late"),
            SubmitOutcome::Rejected => format!("Invalid code{target}, try again"),
            SubmitOutcome::Ambiguous => {
                let labels = self.relay.pending_labels(identity).await;
                format!(
                    "Several logins are waiting for a code ({}). Use `!code <label> <code>`",
                    labels.join(", ")
                )
            }
        };
        reporter.emit(reply);
    }

    async fn add_credentials(&self, identity: &str, args: &[String], reporter: &Reporter) {
        let [broker, credentials] = args else {
            reporter.emit("Usage: !rsaadd <broker> <credentials>");
            return;
        };
        let Some(store) = &self.credentials else {
            reporter.emit("Credential storage is not configured");
            return;
        };
        let Some(id) = BrokerId::from_name(broker) else {
            reporter.emit(format!(
                "Error adding {broker} account: {broker} is not a supported broker"
            ));
            return;
        };

        match store.upsert(identity, id, credentials).await {
            Ok(()) => reporter.emit(format!("Successfully added {id} account")),
            Err(e) => {
                tracing::warn!(identity = %identity, broker = %id, error = %e, "Failed to add credentials");
                reporter.emit(format!("Error adding {id} account: {e}"));
            }
        }
    }

    async fn remove_credentials(&self, identity: &str, args: &[String], reporter: &Reporter) {
        let [broker] = args else {
            reporter.emit("Usage: !removersa <broker>");
            return;
        };
        let Some(store) = &self.credentials else {
            reporter.emit("Credential storage is not configured");
            return;
        };
        let Some(id) = BrokerId::from_name(broker) else {
            reporter.emit(format!(
                "Error retrieving accounts: {broker} is not a supported broker"
            ));
            return;
        };

        match store.remove(identity, id).await {
            Ok(true) => reporter.emit(format!(
                "Successfully removed {identity}'s account from {id}."
            )),
            Ok(false) => reporter.emit(format!("No account found for {identity} with {id}.")),
            Err(e) => reporter.emit(format!("Error retrieving accounts: {e}")),
        }
    }

    async fn list_credentials(&self, identity: &str, reporter: &Reporter) {
        let Some(store) = &self.credentials else {
            reporter.emit("Credential storage is not configured");
            return;
        };

        match store.list_brokers(identity).await {
            Ok(brokers) if brokers.is_empty() => {
                reporter.emit("You haven't set up any accounts yet.")
            }
            Ok(brokers) => {
                let names: Vec<&str> = brokers.iter().map(BrokerId::as_str).collect();
                reporter.emit(format!(
                    "Here are the accounts you have set up:\n{}",
                    names.join("\n")
                ));
            }
            Err(e) => reporter.emit(format!("Error retrieving accounts: {e}")),
        }
    }

    /// Start a background processor that handles messages from a channel.
    pub fn spawn_processor(
        bridge: Arc<Self>,
        mut rx: mpsc::Receiver<IncomingMessage>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Chat bridge processor started");

            while let Some(message) = rx.recv().await {
                let bridge = bridge.clone();

                // Process each message in its own task
                tokio::spawn(async move {
                    if let Err(e) = bridge.process(message).await {
                        tracing::error!(error = %e, "Failed to process message");
                    }
                });
            }

            tracing::info!("Chat bridge processor stopped");
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

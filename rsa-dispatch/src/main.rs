use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use rsa_common::logging::init_logging;
use rsa_common::security::{generate_key_base64, load_or_create_key};
use rsa_common::{Config, CredentialCipher};
use rsa_dispatch::reporter::SinkError;
use rsa_dispatch::{
    parse_args, AdapterRegistry, BrokerId, ChatBridge, CodeProvider, CodeRelay, ConsoleCodeProvider,
    ConsoleSink, CredentialStore, DispatchSettings, Dispatcher, EnvCredentialStore,
    IncomingMessage, MessageSink, Reporter, SqliteCredentialStore,
};

/// Place one order across many brokerage accounts.
#[derive(Parser, Debug)]
#[command(name = "rsa-dispatch")]
#[command(version)]
#[command(about = "Multi-broker order dispatcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an order, e.g. `order buy 1 XYZ tradier false` or `order holdings all`
    Order {
        /// Use this user's stored credentials instead of environment variables
        #[arg(long)]
        user: Option<String>,

        /// The order command
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Manage stored broker credentials
    Credential {
        #[command(subcommand)]
        command: CredentialCommands,
    },

    /// Local chat session: each stdin line is handled as a chat message
    Chat {
        /// Identity the messages are sent as
        #[arg(long)]
        user: String,
    },

    /// Print a new base64 encryption key for RSA_ENCRYPTION_KEY
    Keygen,
}

#[derive(Subcommand, Debug)]
enum CredentialCommands {
    /// Store credentials for a broker (comma-separate multiple logins)
    Add {
        #[arg(long)]
        user: String,
        broker: String,
        credentials: String,
    },
    /// Remove a broker's credentials
    Remove {
        #[arg(long)]
        user: String,
        broker: String,
    },
    /// List brokers with stored credentials
    List {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Keygen => {
            println!("{}", generate_key_base64().as_str());
            return Ok(());
        }
        command => command,
    };

    let config = Config::load_with_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );
    if config.dispatch.danger_mode {
        println!("DANGER MODE ENABLED");
        println!();
    }

    match command {
        Commands::Keygen => Ok(()),
        Commands::Order { user, args } => run_order(&config, user, &args).await,
        Commands::Credential { command } => run_credential(&config, command).await,
        Commands::Chat { user } => run_chat(&config, user).await,
    }
}

fn load_cipher(config: &Config) -> Result<CredentialCipher> {
    let cipher = match &config.storage.encryption_key {
        Some(key) => CredentialCipher::from_base64_key(key)?,
        None => load_or_create_key(&config.storage.key_file())?,
    };
    Ok(cipher)
}

fn sqlite_store(config: &Config) -> Result<SqliteCredentialStore> {
    let cipher = load_cipher(config)?;
    Ok(SqliteCredentialStore::new(config.storage.database_path(), cipher))
}

fn build_dispatcher(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Dispatcher> {
    let registry = AdapterRegistry::with_defaults(&config.brokers)?;
    tracing::info!(brokers = ?registry.brokers(), "Adapters registered");
    Ok(Dispatcher::new(registry, store).with_settings(DispatchSettings::from(&config.dispatch)))
}

async fn run_order(config: &Config, user: Option<String>, args: &[String]) -> Result<()> {
    let order = parse_args(args)?;

    let (identity, dispatcher) = match user {
        Some(user) => {
            let cipher = load_cipher(config)?;
            let store = SqliteCredentialStore::new(config.storage.database_path(), cipher.clone());
            let dispatcher = build_dispatcher(config, Arc::new(store))?.with_cipher(cipher);
            (user, dispatcher)
        }
        None => {
            let store = EnvCredentialStore::from_env();
            tracing::info!(brokers = ?store.configured(), "Using credentials from environment");
            (
                config.dispatch.cli_identity.clone(),
                build_dispatcher(config, Arc::new(store))?,
            )
        }
    };

    if !order.dry_run() && !config.dispatch.danger_mode && !confirm(&order.summary()).await? {
        println!("Order cancelled");
        return Ok(());
    }

    let reporter =
        Reporter::console_only().with_summary_threshold(config.dispatch.holdings_summary_threshold);
    let codes: Arc<dyn CodeProvider> =
        Arc::new(ConsoleCodeProvider::new(config.dispatch.code_timeout()));

    let report = dispatcher.dispatch(&identity, &order, &reporter, codes).await?;
    tracing::info!(
        batch_id = %report.batch_id,
        processed = report.processed().len(),
        "Order finished"
    );
    Ok(())
}

async fn confirm(summary: &str) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{summary}\nContinue? (y/N) ").as_bytes())
        .await?;
    stdout.flush().await?;

    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

async fn run_credential(config: &Config, command: CredentialCommands) -> Result<()> {
    let store = sqlite_store(config)?;

    match command {
        CredentialCommands::Add {
            user,
            broker,
            credentials,
        } => {
            let broker = parse_broker(&broker)?;
            store.upsert(&user, broker, &credentials).await?;
            println!("Successfully added {broker} account");
        }
        CredentialCommands::Remove { user, broker } => {
            let broker = parse_broker(&broker)?;
            if store.remove(&user, broker).await? {
                println!("Successfully removed {user}'s account from {broker}.");
            } else {
                println!("No account found for {user} with {broker}.");
            }
        }
        CredentialCommands::List { user } => {
            let brokers = store.list_brokers(&user).await?;
            if brokers.is_empty() {
                println!("You haven't set up any accounts yet.");
            } else {
                println!("Here are the accounts you have set up:");
                for broker in brokers {
                    println!("{broker}");
                }
            }
        }
    }
    Ok(())
}

fn parse_broker(name: &str) -> Result<BrokerId> {
    match BrokerId::from_name(name) {
        Some(broker) => Ok(broker),
        None => bail!("{name} is not a supported broker"),
    }
}

/// Chat replies printed to the terminal.
struct TerminalChat {
    max_len: usize,
}

#[async_trait]
impl MessageSink for TerminalChat {
    fn max_message_len(&self) -> usize {
        self.max_len
    }

    async fn send(&self, text: &str) -> Result<(), SinkError> {
        println!("bot> {text}");
        Ok(())
    }
}

/// Console lines go to the log; the terminal shows the chat replies.
struct LogConsole;

impl ConsoleSink for LogConsole {
    fn write_line(&self, line: &str) {
        tracing::debug!(line, "report");
    }
}

async fn run_chat(config: &Config, user: String) -> Result<()> {
    let store = Arc::new(sqlite_store(config)?);
    let cipher = store.cipher().clone();
    let dispatcher = Arc::new(build_dispatcher(config, store.clone())?.with_cipher(cipher));
    let relay = Arc::new(CodeRelay::new(config.dispatch.code_timeout()));

    let bridge = Arc::new(
        ChatBridge::new(dispatcher, relay)
            .with_config(&config.chat)
            .with_credentials(store)
            .with_console(Arc::new(LogConsole))
            .with_summary_threshold(config.dispatch.holdings_summary_threshold),
    );
    let reply: Arc<dyn MessageSink> = Arc::new(TerminalChat {
        max_len: config.chat.max_message_len,
    });

    let (tx, rx) = mpsc::channel(32);
    let processor = ChatBridge::spawn_processor(bridge, rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(text) = lines.next_line().await? {
        if text.trim().is_empty() {
            continue;
        }
        let message = IncomingMessage {
            identity: user.clone(),
            text,
            is_direct: true,
            reply: Arc::clone(&reply),
        };
        if tx.send(message).await.is_err() {
            break;
        }
    }

    drop(tx);
    processor.await?;
    Ok(())
}

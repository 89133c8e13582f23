//! RSA Dispatch - fans one order out across many brokerage integrations.
//!
//! A request (buy, sell or holdings) names a set of brokers. The dispatcher
//! logs in to each one with the requesting user's stored credentials, runs
//! the action on every account, and reports progress line by line to the
//! console and, in bot mode, to a chat channel.
//!
//! ## Architecture
//!
//! ```text
//! CLI / chat ──▶ command ──▶ OrderRequest ──▶ Dispatcher ──▶ AdapterRegistry
//!                                               │   ▲            │
//!                                 CredentialStore   │            ▼
//!                                               │   └── Broker / BlockingBroker / SessionBroker
//!                                               ▼                │
//!                                            Reporter ◀──────────┘
//!                                               │         (login codes)
//!                                  console + chat sink ◀── CodeRelay ◀── !code
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod broker;
pub mod chat;
pub mod command;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod order;
pub mod relay;
pub mod reporter;
pub mod session;
pub mod worker;

pub use broker::{
    Adapter, AdapterRegistry, BlockingBroker, Broker, BrokerGroup, BrokerId, LoginContext,
    SessionBroker,
};
pub use chat::{ChatBridge, ChatCommand, IncomingMessage};
pub use command::{parse_args, parse_command, CommandError};
pub use credentials::{
    Credential, CredentialError, CredentialSet, CredentialStore, EnvCredentialStore,
    SqliteCredentialStore,
};
pub use dispatcher::{
    BatchReport, BrokerOutcome, BrokerState, DispatchSettings, Dispatcher, BATCH_COMPLETE,
};
pub use error::DispatchError;
pub use order::{Action, OrderError, OrderRequest};
pub use relay::{
    CodeOutcome, CodeProvider, CodeRelay, ConsoleCodeProvider, RelayCodeProvider, SubmitOutcome,
};
pub use reporter::{ConsoleSink, MemorySink, MessageSink, Reporter, StdoutConsole};
pub use session::{AccountRecord, BrokerSession, Holding, SubAccount};

//! Result reporting.
//!
//! Every progress and result line goes to the console. When a chat
//! destination is attached, the same line is also queued for it, split into
//! chunks the chat platform will accept. A single delivery task drains the
//! queue so chunks arrive in emit order, and adapters never wait on the
//! network to report progress.
//!
//! ```text
//! adapter ──emit──▶ console
//!            │
//!            └────▶ queue ──▶ delivery task ──▶ MessageSink (chat)
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use rsa_common::util::mask_string;

use crate::session::BrokerSession;

/// Maximum message length accepted by the chat platform.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Holdings reports covering more accounts than this get a summary.
pub const DEFAULT_SUMMARY_THRESHOLD: usize = 5;

/// Chat delivery failure.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),
}

/// Local, synchronous output (stdout in production).
pub trait ConsoleSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Remote chat destination.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Largest message this sink accepts, in characters.
    fn max_message_len(&self) -> usize {
        MAX_MESSAGE_LENGTH
    }

    async fn send(&self, text: &str) -> Result<(), SinkError>;
}

/// Writes report lines to stdout.
pub struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

/// Forwards chunks to a chat transport over a channel.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
    max_len: usize,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            max_len: MAX_MESSAGE_LENGTH,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    fn max_message_len(&self) -> usize {
        self.max_len
    }

    async fn send(&self, text: &str) -> Result<(), SinkError> {
        self.tx
            .send(text.to_string())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Records everything it receives. Usable as both console and chat sink.
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
    max_len: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_max_len(MAX_MESSAGE_LENGTH)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            max_len,
        }
    }

    /// Snapshot of received lines or chunks.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Number of received lines containing `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }

    fn push(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.push(line);
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    fn max_message_len(&self) -> usize {
        self.max_len
    }

    async fn send(&self, text: &str) -> Result<(), SinkError> {
        self.push(text);
        Ok(())
    }
}

enum Delivery {
    Chunk(String),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct RemoteQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    max_len: usize,
}

/// Cloneable handle adapters and the dispatcher report through.
#[derive(Clone)]
pub struct Reporter {
    console: Arc<dyn ConsoleSink>,
    remote: Option<RemoteQueue>,
    summary_threshold: usize,
}

impl Reporter {
    /// Console output only (CLI mode).
    pub fn console_only() -> Self {
        Self::with_console(Arc::new(StdoutConsole))
    }

    pub fn with_console(console: Arc<dyn ConsoleSink>) -> Self {
        Self {
            console,
            remote: None,
            summary_threshold: DEFAULT_SUMMARY_THRESHOLD,
        }
    }

    pub fn with_summary_threshold(mut self, threshold: usize) -> Self {
        self.summary_threshold = threshold;
        self
    }

    /// Attach a chat destination. Must be called inside a Tokio runtime.
    pub fn attach_remote(mut self, sink: Arc<dyn MessageSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let max_len = sink.max_message_len().max(1);
        tokio::spawn(deliver(rx, sink));
        self.remote = Some(RemoteQueue { tx, max_len });
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Report one line. Never waits on chat delivery.
    pub fn emit(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        self.console.write_line(line);

        if let Some(remote) = &self.remote {
            for chunk in split_message(line, remote.max_len) {
                if remote.tx.send(Delivery::Chunk(chunk)).is_err() {
                    tracing::debug!("Report delivery task stopped, dropping chunk");
                    break;
                }
            }
        }
    }

    /// Wait until everything emitted so far has been handed to the chat sink.
    pub async fn flush(&self) {
        let Some(remote) = &self.remote else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if remote.tx.send(Delivery::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Emit a formatted holdings report for one broker and return its text.
    ///
    /// With `summarize_if_many`, reports covering more accounts than the
    /// summary threshold end with per-symbol totals across all accounts.
    pub fn flush_holdings(
        &self,
        identity: &str,
        session: &BrokerSession,
        summarize_if_many: bool,
    ) -> String {
        let text = format_holdings(
            identity,
            session,
            summarize_if_many.then_some(self.summary_threshold),
        );
        self.emit(&text);
        text
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Delivery>, sink: Arc<dyn MessageSink>) {
    while let Some(item) = rx.recv().await {
        match item {
            Delivery::Chunk(chunk) => {
                if let Err(e) = sink.send(&chunk).await {
                    tracing::warn!(error = %e, "Failed to deliver report chunk");
                }
            }
            Delivery::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Split text into chunks of at most `max_chars` characters.
///
/// Cuts fall on character boundaries, and concatenating the chunks gives
/// back the input exactly.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if max_chars == 0 {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::with_capacity(text.len() / max_chars + 1);
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn format_holdings(identity: &str, session: &BrokerSession, summary_above: Option<usize>) -> String {
    let mut lines = vec![format!(
        "Holdings on {} ({identity})",
        session.display_name()
    )];

    for (key, account) in session.accounts() {
        let kind = account
            .account_type
            .as_deref()
            .map(|t| format!(" [{t}]"))
            .unwrap_or_default();
        lines.push(format!("{key} ({}){kind}:", mask_string(&account.number)));

        if account.holdings.is_empty() {
            lines.push("No holdings in Account".to_string());
        }
        let mut total = 0.0;
        for holding in &account.holdings {
            match (holding.price, holding.value()) {
                (Some(price), Some(value)) => {
                    total += value;
                    lines.push(format!(
                        "{}: {} @ ${price:.2} = ${value:.2}",
                        holding.symbol, holding.quantity
                    ));
                }
                _ => lines.push(format!(
                    "{}: {} @ N/A = N/A",
                    holding.symbol, holding.quantity
                )),
            }
        }
        lines.push(format!("Total: ${total:.2}"));
    }

    let account_count = session.account_count();
    if let Some(threshold) = summary_above {
        if account_count > threshold {
            let mut totals: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
            for (_, account) in session.accounts() {
                for holding in &account.holdings {
                    let entry = totals.entry(holding.symbol.as_str()).or_default();
                    entry.0 += holding.quantity;
                    entry.1 += holding.value().unwrap_or(0.0);
                }
            }
            lines.push(format!("Summary across {account_count} accounts:"));
            for (symbol, (quantity, value)) in totals {
                lines.push(format!("{symbol}: {quantity} = ${value:.2}"));
            }
        }
    }

    lines.join("\n")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AccountRecord, Holding, SubAccount};

    fn session_with_accounts(n: usize) -> BrokerSession {
        let mut session = BrokerSession::new("Tradier");
        let mut sub = SubAccount::new("alice-Tradier 1", ());
        for i in 0..n {
            let mut account = AccountRecord::new(format!("1000000{i}"));
            account.holdings.push(Holding::new("XYZ", 2.0, Some(1.5)));
            sub.add_account(account);
        }
        session.add_sub_account(sub);
        session
    }

    #[test]
    fn test_split_5000_chars_into_three_chunks() {
        let text: String = "abcdefghij".repeat(500);
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 2000);
        assert_eq!(chunks[1].chars().count(), 2000);
        assert_eq!(chunks[2].chars().count(), 1000);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "é".repeat(5);
        let chunks = split_message(&text, 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn test_split_short_and_empty() {
        assert_eq!(split_message("hello", 2000), vec!["hello"]);
        assert!(split_message("", 2000).is_empty());
        assert_eq!(split_message(&"a".repeat(2000), 2000).len(), 1);
    }

    #[test]
    fn test_emit_writes_console() {
        let console = Arc::new(MemorySink::new());
        let reporter = Reporter::with_console(console.clone());
        reporter.emit("first");
        reporter.emit("second");
        assert_eq!(console.lines(), vec!["first", "second"]);
        assert!(!reporter.has_remote());
    }

    #[tokio::test]
    async fn test_remote_receives_ordered_chunks() {
        let console = Arc::new(MemorySink::new());
        let remote = Arc::new(MemorySink::with_max_len(2000));
        let reporter = Reporter::with_console(console.clone()).attach_remote(remote.clone());

        let long = "x".repeat(5000);
        reporter.emit("start");
        reporter.emit(&long);
        reporter.emit("end");
        reporter.flush().await;

        let chunks = remote.lines();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0], "start");
        assert_eq!(chunks[1..4].concat(), long);
        assert_eq!(chunks[4], "end");
        assert_eq!(console.lines().len(), 3);
    }

    struct FailingSink;

    #[async_trait]
    impl MessageSink for FailingSink {
        async fn send(&self, _text: &str) -> Result<(), SinkError> {
            Err(SinkError::Send("rate limited".into()))
        }
    }

    #[tokio::test]
    async fn test_remote_failure_does_not_stop_console() {
        let console = Arc::new(MemorySink::new());
        let reporter = Reporter::with_console(console.clone()).attach_remote(Arc::new(FailingSink));
        reporter.emit("still printed");
        reporter.flush().await;
        assert_eq!(console.lines(), vec!["still printed"]);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::channel(8);
        let reporter = Reporter::with_console(Arc::new(MemorySink::new()))
            .attach_remote(Arc::new(ChannelSink::new(tx).with_max_len(3)));
        reporter.emit("abcdef");
        reporter.flush().await;
        assert_eq!(rx.recv().await.as_deref(), Some("abc"));
        assert_eq!(rx.recv().await.as_deref(), Some("def"));
    }

    #[test]
    fn test_holdings_format() {
        let mut session = session_with_accounts(1);
        if let Some(sub) = session.sub_account_mut("alice-Tradier 1") {
            sub.accounts[0].holdings.push(Holding::new("ABC", 1.0, None));
        }
        let reporter = Reporter::with_console(Arc::new(MemorySink::new()));
        let text = reporter.flush_holdings("alice", &session, true);

        assert!(text.starts_with("Holdings on Tradier (alice)"));
        assert!(text.contains("alice-Tradier 1 (****0000):"));
        assert!(text.contains("XYZ: 2 @ $1.50 = $3.00"));
        assert!(text.contains("ABC: 1 @ N/A = N/A"));
        assert!(text.contains("Total: $3.00"));
        assert!(!text.contains("Summary"));
    }

    #[test]
    fn test_holdings_summary_above_threshold() {
        let session = session_with_accounts(6);
        let reporter = Reporter::with_console(Arc::new(MemorySink::new()));

        let text = reporter.flush_holdings("alice", &session, true);
        assert!(text.contains("Summary across 6 accounts:"));
        assert!(text.contains("XYZ: 12 = $18.00"));

        let text = reporter.flush_holdings("alice", &session, false);
        assert!(!text.contains("Summary"));

        let text = reporter.flush_holdings("alice", &session_with_accounts(5), true);
        assert!(!text.contains("Summary"));
    }
}

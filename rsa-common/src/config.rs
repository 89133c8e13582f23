//! Configuration management.
//!
//! The dispatcher reads a single configuration file at `~/.autorsa/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `RSA_LOG_LEVEL` → observability.log_level
//! - `RSA_LOG_FORMAT` → observability.log_format
//! - `RSA_DATABASE_PATH` → storage.database_path
//! - `RSA_ENCRYPTION_KEY` / `ENCRYPTION_KEY` → storage.encryption_key
//! - `RSA_CODE_TIMEOUT_SECS` → dispatch.code_timeout_secs
//! - `RSA_CALL_TIMEOUT_SECS` → dispatch.call_timeout_secs
//! - `DANGER_MODE` → dispatch.danger_mode
//! - `HEADLESS` → dispatch.headless
//! - `TRADIER_BASE_URL` → brokers.tradier_base_url

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".autorsa"),
        |dirs| dirs.home_dir().join(".autorsa"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub brokers: BrokersConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("RSA_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("RSA_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        if let Some(path) = lookup("RSA_DATABASE_PATH") {
            self.storage.database_path = path;
        }
        if let Some(key) = lookup("RSA_ENCRYPTION_KEY").or_else(|| lookup("ENCRYPTION_KEY")) {
            self.storage.encryption_key = Some(key);
        }

        if let Some(secs) = lookup("RSA_CODE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.dispatch.code_timeout_secs = secs;
        }
        if let Some(secs) = lookup("RSA_CALL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.dispatch.call_timeout_secs = secs;
        }
        if let Some(flag) = lookup("DANGER_MODE") {
            self.dispatch.danger_mode = parse_flag(&flag);
        }
        if let Some(flag) = lookup("HEADLESS") {
            self.dispatch.headless = parse_flag(&flag);
        }

        if let Some(url) = lookup("TRADIER_BASE_URL") {
            self.brokers.tradier_base_url = url;
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ============================================================================
// Observability
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Credential Storage
// ============================================================================

/// Credential database and encryption key settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding per-user broker credentials
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Base64 encoded 32-byte key. When absent the key file is used.
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Key file created on first use when no key is configured
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            encryption_key: None,
            key_file: default_key_file(),
        }
    }
}

impl StorageConfig {
    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).into_owned())
    }

    /// Key file path with `~` expanded.
    pub fn key_file(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.key_file).into_owned())
    }
}

fn default_database_path() -> String {
    "~/.autorsa/rsa_bot_users.db".into()
}

fn default_key_file() -> String {
    "~/.autorsa/credentials.key".into()
}

// ============================================================================
// Dispatch
// ============================================================================

/// Orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long a login waits for an out-of-band 2FA code
    #[serde(default = "default_code_timeout_secs")]
    pub code_timeout_secs: u64,

    /// Upper bound for a single adapter call (init, holdings, transact)
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Holdings reports for more accounts than this get a per-symbol summary
    #[serde(default = "default_holdings_summary_threshold")]
    pub holdings_summary_threshold: usize,

    /// Skip the interactive confirmation before placing orders
    #[serde(default)]
    pub danger_mode: bool,

    /// Run browser-backed adapters without a visible window
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Identity used for credential lookup in CLI mode
    #[serde(default = "default_cli_identity")]
    pub cli_identity: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            code_timeout_secs: default_code_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            holdings_summary_threshold: default_holdings_summary_threshold(),
            danger_mode: false,
            headless: true,
            cli_identity: default_cli_identity(),
        }
    }
}

impl DispatchConfig {
    pub fn code_timeout(&self) -> Duration {
        Duration::from_secs(self.code_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn default_code_timeout_secs() -> u64 {
    300
}

fn default_call_timeout_secs() -> u64 {
    600
}

fn default_holdings_summary_threshold() -> usize {
    5
}

fn default_cli_identity() -> String {
    "cli".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Chat
// ============================================================================

/// Chat surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Maximum characters per outgoing chat message
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    /// Prefix that marks a message as a command
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
            command_prefix: default_command_prefix(),
        }
    }
}

fn default_max_message_len() -> usize {
    2000
}

fn default_command_prefix() -> String {
    "!".into()
}

// ============================================================================
// Brokers
// ============================================================================

/// Per-broker endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokersConfig {
    #[serde(default = "default_tradier_base_url")]
    pub tradier_base_url: String,

    /// HTTP timeout for REST brokers
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BrokersConfig {
    fn default() -> Self {
        Self {
            tradier_base_url: default_tradier_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl BrokersConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_tradier_base_url() -> String {
    "https://api.tradier.com/v1".into()
}

fn default_request_timeout_secs() -> u64 {
    30
}

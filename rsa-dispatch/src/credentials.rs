//! Per-user broker credentials.
//!
//! Credentials are stored one row per `(user, broker)`. A row's plain text
//! holds one or more credential sets separated by `,`, each with
//! colon-separated fields (`user:pass`, `user:pass:totp`, a bare token, ...).
//!
//! The SQLite store connects lazily and is checked with `SELECT 1` before
//! every dispatch, reopening the connection when the check fails. Queries run
//! on Tokio's blocking pool.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use zeroize::Zeroizing;

use rsa_common::CredentialCipher;

use crate::broker::BrokerId;

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS rsa_credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    broker TEXT NOT NULL,
    credentials TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(user_id, broker)
);

CREATE INDEX IF NOT EXISTS idx_rsa_credentials_user
ON rsa_credentials(user_id);
"#;

/// Credential storage or format failure.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid {broker} credentials: expected {expected}")]
    InvalidFormat {
        broker: BrokerId,
        expected: &'static str,
    },

    #[error("No encryption key configured for stored credentials")]
    NoKey,

    #[error(transparent)]
    Crypto(#[from] rsa_common::Error),
}

/// A stored credential as returned by a lookup.
pub enum Credential {
    /// Ciphertext from the database, decrypted just before use
    Encrypted(String),
    /// Plain text from the environment (CLI mode)
    Plain(Zeroizing<String>),
}

impl Credential {
    /// Decrypt if needed and return the plain text.
    pub fn reveal(
        self,
        cipher: Option<&CredentialCipher>,
    ) -> Result<Zeroizing<String>, CredentialError> {
        match self {
            Self::Plain(text) => Ok(text),
            Self::Encrypted(blob) => {
                let cipher = cipher.ok_or(CredentialError::NoKey)?;
                Ok(cipher.decrypt(&blob)?)
            }
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypted(_) => f.write_str("Credential::Encrypted(..)"),
            Self::Plain(_) => f.write_str("Credential::Plain(..)"),
        }
    }
}

/// One login's worth of credential fields.
#[derive(Clone)]
pub struct CredentialSet {
    /// 1-based position within the stored credential string
    pub index: usize,
    fields: Vec<Zeroizing<String>>,
}

impl CredentialSet {
    pub fn new(index: usize, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            index,
            fields: fields
                .into_iter()
                .map(|f| Zeroizing::new(f.into()))
                .collect(),
        }
    }

    pub fn field(&self, i: usize) -> Option<&str> {
        self.fields.get(i).map(|f| f.as_str())
    }

    /// Optional field where `NA` (any case) or empty means absent.
    pub fn optional_field(&self, i: usize) -> Option<&str> {
        self.field(i)
            .filter(|f| !f.is_empty() && !f.eq_ignore_ascii_case("na"))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("index", &self.index)
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// Split stored plain text into credential sets.
pub fn parse_credentials(raw: &str) -> Vec<CredentialSet> {
    raw.split(',')
        .map(str::trim)
        .filter(|set| !set.is_empty())
        .enumerate()
        .map(|(i, set)| CredentialSet::new(i + 1, set.split(':').map(str::trim)))
        .collect()
}

/// Check every set against the broker's expected field count.
pub fn validate_credentials(broker: BrokerId, raw: &str) -> Result<(), CredentialError> {
    let sets = parse_credentials(raw);
    let expected = broker.credential_fields();
    if sets.is_empty() || sets.iter().any(|s| !expected.contains(&s.len())) {
        return Err(CredentialError::InvalidFormat {
            broker,
            expected: broker.credential_format(),
        });
    }
    Ok(())
}

/// Where the dispatcher looks up credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Verify the backing connection, reconnecting if needed.
    async fn ensure_live(&self) -> Result<(), CredentialError>;

    /// Zero or one credential for `(identity, broker)`.
    async fn lookup(
        &self,
        identity: &str,
        broker: BrokerId,
    ) -> Result<Option<Credential>, CredentialError>;
}

// ============================================================================
// SQLite store
// ============================================================================

/// Encrypted credential table in SQLite.
///
/// Every query runs on the blocking pool; the connection is shared behind a
/// std mutex so a slow disk never holds up the async workers.
pub struct SqliteCredentialStore {
    path: PathBuf,
    cipher: CredentialCipher,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteCredentialStore {
    /// Create a store. The database is opened on first use.
    pub fn new(path: impl Into<PathBuf>, cipher: CredentialCipher) -> Self {
        Self {
            path: path.into(),
            cipher,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cipher(&self) -> &CredentialCipher {
        &self.cipher
    }

    /// Run `f` on the blocking pool with an open connection, connecting first if needed.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, CredentialError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let shared = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || -> Result<T, CredentialError> {
            let mut guard = lock_connection(&shared)?;
            let conn = match guard.take() {
                Some(conn) => conn,
                None => open_connection(&path)?,
            };
            let result = f(&conn);
            *guard = Some(conn);
            Ok(result?)
        })
        .await
        .map_err(|e| CredentialError::Unavailable(format!("database task failed: {e}")))?
    }

    /// Store or replace a user's credentials for one broker.
    pub async fn upsert(
        &self,
        identity: &str,
        broker: BrokerId,
        plaintext: &str,
    ) -> Result<(), CredentialError> {
        validate_credentials(broker, plaintext)?;
        let blob = self.cipher.encrypt(plaintext)?;
        let now = Utc::now().to_rfc3339();
        let user_id = identity.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rsa_credentials (user_id, broker, credentials, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, broker)
                 DO UPDATE SET credentials = excluded.credentials, updated_at = excluded.updated_at",
                params![user_id, broker.as_str(), blob, now],
            )
        })
        .await?;

        tracing::info!(identity = %identity, broker = %broker, "Stored credentials");
        Ok(())
    }

    /// Remove a user's credentials for one broker. Returns whether a row existed.
    pub async fn remove(&self, identity: &str, broker: BrokerId) -> Result<bool, CredentialError> {
        let user_id = identity.to_string();
        let removed = self
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM rsa_credentials WHERE user_id = ?1 AND broker = ?2",
                    params![user_id, broker.as_str()],
                )
            })
            .await?;
        Ok(removed > 0)
    }

    /// Brokers the user has credentials for, in broker order.
    pub async fn list_brokers(&self, identity: &str) -> Result<Vec<BrokerId>, CredentialError> {
        let user_id = identity.to_string();
        let names = self
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT broker FROM rsa_credentials WHERE user_id = ?1")?;
                let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()
            })
            .await?;

        let mut brokers: Vec<BrokerId> = names
            .iter()
            .filter_map(|name| BrokerId::from_name(name))
            .collect();
        brokers.sort();
        Ok(brokers)
    }
}

fn lock_connection(
    shared: &Mutex<Option<Connection>>,
) -> Result<MutexGuard<'_, Option<Connection>>, CredentialError> {
    shared
        .lock()
        .map_err(|_| CredentialError::Unavailable("database handle poisoned".into()))
}

fn open_connection(path: &Path) -> Result<Connection, CredentialError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CredentialError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(CREATE_TABLES_SQL)?;
    tracing::debug!(path = %path.display(), "Opened credential database");
    Ok(conn)
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn ensure_live(&self) -> Result<(), CredentialError> {
        let path = self.path.clone();
        let shared = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || -> Result<(), CredentialError> {
            let mut guard = lock_connection(&shared)?;
            if let Some(conn) = guard.as_ref() {
                match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        tracing::warn!(error = %e, "Credential database connection lost, reconnecting");
                    }
                }
            }
            *guard = None;
            *guard = Some(open_connection(&path)?);
            Ok(())
        })
        .await
        .map_err(|e| CredentialError::Unavailable(format!("database task failed: {e}")))?
    }

    async fn lookup(
        &self,
        identity: &str,
        broker: BrokerId,
    ) -> Result<Option<Credential>, CredentialError> {
        let user_id = identity.to_string();
        let blob = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT credentials FROM rsa_credentials WHERE user_id = ?1 AND broker = ?2",
                    params![user_id, broker.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;
        Ok(blob.map(Credential::Encrypted))
    }
}

// ============================================================================
// Environment store
// ============================================================================

/// Plain-text credentials read from environment variables (CLI mode).
///
/// Every identity sees the same credentials.
#[derive(Default)]
pub struct EnvCredentialStore {
    values: HashMap<BrokerId, Zeroizing<String>>,
}

impl EnvCredentialStore {
    /// Capture `TRADIER`, `SCHWAB`, ... from the process environment.
    pub fn from_env() -> Self {
        let values = BrokerId::ALL
            .into_iter()
            .filter_map(|b| {
                std::env::var(b.env_var())
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| (b, Zeroizing::new(v)))
            })
            .collect();
        Self { values }
    }

    pub fn with_credential(mut self, broker: BrokerId, value: impl Into<String>) -> Self {
        self.values.insert(broker, Zeroizing::new(value.into()));
        self
    }

    pub fn configured(&self) -> Vec<BrokerId> {
        let mut brokers: Vec<BrokerId> = self.values.keys().copied().collect();
        brokers.sort();
        brokers
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn ensure_live(&self) -> Result<(), CredentialError> {
        Ok(())
    }

    async fn lookup(
        &self,
        _identity: &str,
        broker: BrokerId,
    ) -> Result<Option<Credential>, CredentialError> {
        Ok(self.values.get(&broker).cloned().map(Credential::Plain))
    }
}

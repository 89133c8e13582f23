//! Dispatcher error types.

use thiserror::Error;

use crate::broker::BrokerId;
use crate::credentials::CredentialError;
use crate::order::OrderError;

/// Errors raised while running a dispatch.
///
/// Only [`DispatchError::InvalidOrder`] and [`DispatchError::CredentialStore`]
/// abort a whole batch. The rest describe a single broker's failure and end
/// up in that broker's outcome.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    InvalidOrder(#[from] OrderError),

    #[error("Credential store unavailable: {0}")]
    CredentialStore(#[source] CredentialError),

    #[error("{broker} credentials unusable: {source}")]
    Credentials {
        broker: BrokerId,
        #[source]
        source: CredentialError,
    },

    #[error("{broker} {operation} timed out after {seconds}s")]
    Timeout {
        broker: BrokerId,
        operation: &'static str,
        seconds: u64,
    },

    #[error("{broker} worker failed during {operation}: {reason}")]
    Worker {
        broker: BrokerId,
        operation: &'static str,
        reason: String,
    },
}

impl DispatchError {
    /// Whether this error ends the whole batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidOrder(_) | Self::CredentialStore(_))
    }
}

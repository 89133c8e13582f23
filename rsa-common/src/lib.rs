//! RSA Common - Shared building blocks for the auto-RSA order dispatcher.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup
//! - Credential encryption
//! - Small string utilities (masking, log sanitizing)

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod security;
pub mod util;
pub mod validation;

pub use config::{
    BrokersConfig, ChatConfig, Config, DispatchConfig, ObservabilityConfig, StorageConfig,
};
pub use error::{Error, Result};
pub use security::CredentialCipher;
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
    pub use crate::security::CredentialCipher;
    pub use crate::validation::{Validate, ValidationError};
}

//! Configuration validation.
//!
//! Each configuration section checks its own fields; `Config::validate`
//! collects every failure instead of stopping at the first one.

use thiserror::Error;

use crate::config::{
    BrokersConfig, ChatConfig, Config, DispatchConfig, ObservabilityConfig, StorageConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        let sections: [&dyn Validate; 5] = [
            &self.observability,
            &self.storage,
            &self.dispatch,
            &self.chat,
            &self.brokers,
        ];
        for section in sections {
            if let Err(e) = section.validate() {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}

impl Validate for StorageConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.database_path.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "storage.database_path".into(),
            });
        }
        if self.encryption_key.is_none() && self.key_file.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "storage.key_file".into(),
            });
        }
        Ok(())
    }
}

impl Validate for DispatchConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.code_timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "dispatch.code_timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.call_timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "dispatch.call_timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.cli_identity.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "dispatch.cli_identity".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ChatConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_message_len < 100 {
            return Err(ValidationError::InvalidValue {
                field: "chat.max_message_len".into(),
                reason: "must be at least 100".into(),
            });
        }
        if self.command_prefix.is_empty() {
            return Err(ValidationError::MissingField {
                field: "chat.command_prefix".into(),
            });
        }
        Ok(())
    }
}

impl Validate for BrokersConfig {
    fn validate(&self) -> ValidationResult<()> {
        let url = self.tradier_base_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ValidationError::InvalidValue {
                field: "brokers.tradier_base_url".into(),
                reason: "must be an http(s) URL".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "brokers.request_timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

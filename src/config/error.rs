//! Errors raised while locating, parsing and validating `tasker-config.yaml`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("No configuration file found (looked for {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("Cannot read configuration file '{path}': {reason}")]
    Unreadable { path: String, reason: String },

    /// Syntax errors, and values that do not fit the configuration types
    #[error("Malformed configuration in '{path}': {reason}")]
    Malformed { path: String, reason: String },

    #[error("Environment section '{environment}' cannot be applied: {reason}")]
    EnvironmentSection { environment: String, reason: String },

    #[error("'{field}' is required in the {section} section")]
    MissingField { field: String, section: String },

    #[error("'{field}' = {value} is not usable: {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl ConfigurationError {
    pub fn unreadable(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Unreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn missing_field(field: impl Into<String>, section: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
            section: section.into(),
        }
    }

    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;

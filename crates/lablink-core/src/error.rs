//! # Core Error Types
//!
//! Configuration and validation errors shared across the workspace.
//! Protocol, persistence and sync failures have their own taxonomies in
//! the crates that produce them.

use thiserror::Error;

/// Errors raised while loading, saving or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read or written.
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML.
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be serialized back to TOML.
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Config parsed but failed a semantic check.
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ValidationError),
}

/// Field-level validation failures.
///
/// Each variant carries the offending field so callers can report exactly
/// what to fix.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Value falls outside the allowed range.
    #[error("{field} out of range: {reason}")]
    OutOfRange { field: String, reason: String },

    /// Value has the wrong shape.
    #[error("{field} invalid: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value collides with another entry.
    #[error("duplicate {field}: {value}")]
    Duplicate { field: String, value: String },
}

/// Result alias for validation helpers.
pub type ValidationResult<T> = Result<T, ValidationError>;

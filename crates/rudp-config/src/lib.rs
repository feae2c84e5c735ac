//! Configuration loading for rudp connections and the NAT
//! punch-through mediator.
//!
//! A single TOML document shape (`Config`) carries the connection
//! reliability-engine tunables, the mediator's bind address and rate
//! limit, and ambient log settings; a binary embedding the connection
//! engine and the mediator both read the same file and use the
//! section relevant to them.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;

pub use config::{Config, ConnectionConfig, LoggingSettings, MediatorConfig};

use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Validation error.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Result type for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::SerializationError(err.to_string())
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(err: toml::ser::Error) -> Self {
        ConfigError::SerializationError(err.to_string())
    }
}

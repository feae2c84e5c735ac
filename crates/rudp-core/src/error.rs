//! Core error types

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// A channel qualifier did not decode to a known channel type
    #[error("invalid channel qualifier: {0}")]
    InvalidChannelQualifier(i32),

    /// Invalid address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

//! Cryptographic error types

use thiserror::Error;

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        got: usize,
    },

    /// Cookie HMAC verification failed
    #[error("cookie verification failed")]
    CookieVerificationFailed,

    /// Cookie has the wrong length for the protocol
    #[error("invalid cookie length: expected {expected}, got {got}")]
    InvalidCookieLength {
        /// Expected cookie length
        expected: usize,
        /// Actual cookie length
        got: usize,
    },
}

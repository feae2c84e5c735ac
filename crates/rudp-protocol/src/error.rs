//! Protocol error types

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the connection's public API.
///
/// Malformed or suspicious wire input never reaches this type — it is
/// dropped at the point of parsing (logged via `tracing::debug!`) and
/// never propagates past packet dispatch. Only constructive API
/// failures (below) and asynchronous disconnect events are visible to
/// the user.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted on a non-open connection.
    #[error("connection is closed")]
    Closed,

    /// Zero-length payload passed to `send`.
    #[error("empty message")]
    EmptyMessage,

    /// A reliable message would exceed the sender buffer's capacity.
    #[error("send buffer would overflow")]
    SendBufferOverflow,

    /// Header parse failure, invalid flag combination, truncated
    /// packet, or wrong-length control payload.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The underlying socket capability failed to bind.
    #[error("socket open failed: {0}")]
    SocketOpenFailed(String),

    /// No inbound traffic within `connectionTimeout`.
    #[error("connection timed out")]
    Timeout,

    /// Cryptographic error bubbled up from cookie verification.
    #[error("crypto error: {0}")]
    Crypto(#[from] rudp_crypto::CryptoError),

    /// Shared addressing/channel error from `rudp-core`.
    #[error("core error: {0}")]
    Core(#[from] rudp_core::CoreError),
}

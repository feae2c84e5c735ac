//! Connection lifecycle enums shared between the protocol engine and
//! its observers.

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Reserved for API symmetry; never emitted by `forceClose` itself.
    NoError,
    /// This host initiated the close handshake.
    ThisHostClosed,
    /// The peer initiated the close handshake (RST or SYN-RST-ACK).
    OtherHostClosed,
    /// No inbound packet arrived within `connectionTimeout`.
    ConnectionTimedOut,
}

/// NAT punch-through progress for a P2P connection's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2pState {
    /// Not a P2P connection, or punch-through has not started.
    NotEstablishing,
    /// Probing inner/outer endpoints, remote address not yet switched.
    Establishing,
    /// Remote address has switched away from the mediator-supplied one.
    Established,
    /// Probing timed out without a successful endpoint switch.
    Failed,
}

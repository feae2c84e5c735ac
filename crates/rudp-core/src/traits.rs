//! Host capabilities the connection engine is generic over.
//!
//! Each external collaborator — the datagram socket, the timer
//! scheduler, the random number/HMAC source, and the event sink the
//! host application observes — is a named trait, and the engine holds
//! them by ownership rather than by back-reference.

use std::net::SocketAddr;

use crate::channel::Channel;
use crate::event::DisconnectReason;

/// Datagram I/O capability a connection container sends through.
///
/// Implemented directly by a real `UdpSocket` wrapper at the edges of
/// the system; the engine itself never touches sockets.
pub trait DatagramSocket: Send + Sync {
    /// Send `data` from `local` to `remote`.
    fn send_to(&self, local: SocketAddr, remote: SocketAddr, data: &[u8]) -> std::io::Result<()>;

    /// The local port this socket is bound to.
    fn local_port(&self) -> u16;
}

/// Random/HMAC capability, decoupling the engine from a concrete crypto
/// crate (useful for deterministic tests that need reproducible
/// "random" bytes).
pub trait CryptoHost {
    /// Fill `buf` with cryptographically secure random bytes.
    fn random_bytes(&self, buf: &mut [u8]);

    /// Compute HMAC-SHA256 of `data` under `key`.
    fn hmac(&self, key: &[u8], data: &[u8]) -> [u8; 32];
}

/// Sink for events the host application observes: inbound messages,
/// loss reports, and connection lifecycle transitions.
pub trait ConnectionObserver {
    /// A complete message was reassembled and is ready for delivery.
    fn on_message(&mut self, channel: Channel, data: &[u8]);

    /// The receiver buffer detected `lost` missing sequence numbers on
    /// `channel`.
    fn on_packet_loss(&mut self, channel: Channel, lost: u32) {
        let _ = (channel, lost);
    }

    /// No inbound traffic for `connectionWarningTimeout`; the
    /// connection is degraded but not yet torn down.
    fn on_connection_lost(&mut self) {}

    /// Inbound traffic resumed after `on_connection_lost`.
    fn on_connection_regained(&mut self) {}

    /// The connection was torn down; fired exactly once per lifetime.
    fn on_disconnect(&mut self, reason: DisconnectReason) {
        let _ = reason;
    }

    /// NAT punch-through completed (`success = false` on timeout).
    fn on_nat_punchthrough_finished(&mut self, success: bool) {
        let _ = success;
    }

    /// The client/P2P-side open handshake finished.
    fn on_connection_opened(&mut self, error: bool, reason: DisconnectReason) {
        let _ = (error, reason);
    }
}

//! Reliable message-oriented transport over UDP.
//!
//! Framing, RTT/RTO estimation, per-channel sender/receiver buffering,
//! a congestion-gated send queue, connection timers, the SYN/RST
//! handshake, NAT punch-through, and the per-connection container that
//! wires all of the above to a socket.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod congestion;
pub mod connection;
pub mod constants;
pub mod container;
pub mod error;
pub mod flags;
pub mod header;
pub mod natpunch;
pub mod receiver_buffer;
pub mod rtt;
pub mod send_queue;
pub mod sender_buffer;
pub mod seq;
pub mod timers;

pub use congestion::{CongestionControl, WindowCongestionControl};
pub use connection::{ConnectionEvent, LogicalConnection, Role};
pub use container::{Container, ContainerParams};
pub use error::{Error, Result};
pub use flags::{message_bit, packet_bit, ControlKind, MessageFlags};
pub use header::{Datagram, Message, MessageHeader, PacketHeader, RttResponse};
pub use natpunch::{NatPunchEvent, NatPunchThrough};
pub use receiver_buffer::{Delivered, ReceiverBuffer};
pub use rtt::RttEstimator;
pub use send_queue::SendQueue;
pub use sender_buffer::{SenderBuffer, SenderEntry};
pub use timers::{ConnectionTimers, TimerEvent, TimerHost, TimerId};

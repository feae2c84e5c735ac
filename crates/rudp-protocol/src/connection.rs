//! Logical connection: handshake, close, and the `send` API.
//!
//! Generalizes a protocol-session state machine (a hard-reset handshake,
//! a protocol-state enum, ACK processing against a reliable transport)
//! into the SYN/SYN-RST/RST handshake and per-channel sequencing this
//! transport uses instead. The state enum and `Instant`-based timeout
//! bookkeeping carry over; the opcode-per-message dispatch becomes
//! `MessageFlags::classify`-per-message dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use rudp_core::{Channel, ChannelType, DisconnectReason, Endpoint, EndpointPair, P2pState};

use crate::congestion::CongestionControl;
use crate::flags::{message_bit, ControlKind, MessageFlags};
use crate::header::{Message, MessageHeader};
use crate::natpunch::{self, NatPunchEvent, NatPunchThrough};
use crate::receiver_buffer::ReceiverBuffer;
use crate::send_queue::SendQueue;
use crate::sender_buffer::SenderBuffer;
use crate::seq;
use crate::{Error, Result};

/// Default cadence at which unresolved `PRX-SYN` probes are resent.
const DEFAULT_NAT_PROBE_INTERVAL: Duration = Duration::from_millis(150);
/// Default overall NAT punch-through probe-phase timeout.
const DEFAULT_NAT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Control-message kinds belonging to the NAT punch-through
/// sub-protocol, dispatched independently of (and before) the regular
/// per-channel sequence reconstruction — they are exchanged directly
/// between peers (or with the mediator) outside the handshake's own
/// sequence space.
fn is_nat_punch_kind(kind: ControlKind) -> bool {
    matches!(
        kind,
        ControlKind::Prx
            | ControlKind::PrxAck
            | ControlKind::PrxSyn
            | ControlKind::PrxSynAck
            | ControlKind::PrxRstSynAck
            | ControlKind::PrxRst
            | ControlKind::PrxRstAck
    )
}

/// Which side of the handshake this connection is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Received the peer's SYN already (or a mediator-brokered
    /// equivalent); responds with SYN-RST immediately.
    Server,
    /// Initiates with a reliable SYN and waits for SYN-RST.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Something the container should relay to the connection's observer.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The handshake completed; the connection is now open.
    Opened,
    /// The connection has closed, for the given reason.
    Disconnected(DisconnectReason),
    /// An application message was delivered.
    Message {
        /// Channel it arrived on.
        channel: Channel,
        /// Reassembled body.
        body: Bytes,
    },
    /// Send `message` to `to` immediately, bypassing the send queue and
    /// the connection's single configured remote address — used for
    /// NAT punch-through probes/acks/teardown, which must reach
    /// addresses other than whichever one traffic currently flows
    /// through.
    SendRaw {
        /// Destination address.
        to: SocketAddr,
        /// Message to send, wrapped in its own single-message datagram.
        message: Message,
    },
    /// NAT punch-through selected (or switched to) a new remote
    /// address; the container must redirect ordinary traffic there.
    RemoteAddrChanged(SocketAddr),
    /// NAT punch-through finished, successfully or not (`success =
    /// false` on probe-phase timeout).
    NatPunchFinished(bool),
}

/// Handshake and close state machine plus per-channel sequencing, send
/// buffering, and receive reassembly for one peer.
pub struct LogicalConnection {
    role: Role,
    state: ConnState,
    /// Next outgoing non-wrapping SN per channel.
    sequence_memo: HashMap<Channel, u64>,
    /// Highest non-wrapping SN reconstructed per channel so far, used
    /// as the reference point for the next wire-SN reconstruction.
    receive_reference: HashMap<Channel, u64>,
    sender: SenderBuffer,
    receiver: ReceiverBuffer,
    /// Non-wrapping SN of the outstanding reliable SYN, released once
    /// SYN-RST (client) or SYN-RST-ACK (server) arrives.
    reliable_handshake_msg_sn: Option<u64>,
    /// Peer's initial sequence number, learned from SYN (server) or
    /// SYN-RST (client).
    peer_initial_sn: Option<u64>,
    /// Set once `initiate_close` has released the handshake slot but
    /// the sender buffer hadn't yet drained; `poll_close` finishes the
    /// job once it does.
    rst_pending: bool,
    /// Address of the mediator that brokered this connection, learned
    /// from whichever address a `PRX`/`PRX-RST-SYN-ACK` message
    /// arrives from. `None` for connections that never went through a
    /// mediator.
    mediator_addr: Option<SocketAddr>,
    /// Live only from receipt of `PRX-RST-SYN-ACK` until punch-through
    /// succeeds or its probe phase times out. Owned here, per the
    /// connection-exclusive-ownership rule; the container is only told
    /// about address switches and completion via [`ConnectionEvent`].
    nat_punch: Option<NatPunchThrough>,
    nat_probe_interval: Duration,
    nat_probe_timeout: Duration,
}

impl LogicalConnection {
    /// Server-side construction: the peer's SYN (and its initial SN)
    /// has already been observed by the container. Returns the
    /// connection, already `Open`, and the unreliable SYN-RST the
    /// caller must enqueue.
    pub fn new_server(
        peer_initial_sn: u64,
        sender_capacity: usize,
        receiver_capacity: usize,
        own_initial_sn: u64,
    ) -> (Self, Message) {
        let conn = Self {
            role: Role::Server,
            state: ConnState::Open,
            sequence_memo: HashMap::new(),
            receive_reference: HashMap::from([(Channel::Control, peer_initial_sn)]),
            sender: SenderBuffer::new(sender_capacity),
            receiver: ReceiverBuffer::new(receiver_capacity),
            reliable_handshake_msg_sn: None,
            peer_initial_sn: Some(peer_initial_sn),
            rst_pending: false,
            mediator_addr: None,
            nat_punch: None,
            nat_probe_interval: DEFAULT_NAT_PROBE_INTERVAL,
            nat_probe_timeout: DEFAULT_NAT_PROBE_TIMEOUT,
        };
        let syn_rst = control_message(
            MessageFlags::NONE.with(message_bit::SYN).with(message_bit::RST),
            own_initial_sn,
        );
        (conn, syn_rst)
    }

    /// Client-side construction: sends a reliable SYN and waits for
    /// SYN-RST. Returns the connection and the SYN message the caller
    /// must both enqueue and register in the sender buffer (the latter
    /// is done here, since it must be tracked as the handshake slot).
    pub fn new_client(
        sender_capacity: usize,
        receiver_capacity: usize,
        own_initial_sn: u64,
        now: Instant,
    ) -> Result<(Self, Message)> {
        let mut conn = Self {
            role: Role::Client,
            state: ConnState::Connecting,
            sequence_memo: HashMap::new(),
            receive_reference: HashMap::new(),
            sender: SenderBuffer::new(sender_capacity),
            receiver: ReceiverBuffer::new(receiver_capacity),
            reliable_handshake_msg_sn: None,
            peer_initial_sn: None,
            rst_pending: false,
            mediator_addr: None,
            nat_punch: None,
            nat_probe_interval: DEFAULT_NAT_PROBE_INTERVAL,
            nat_probe_timeout: DEFAULT_NAT_PROBE_TIMEOUT,
        };
        let flags = MessageFlags::NONE.with(message_bit::SYN);
        let syn = control_message(flags, own_initial_sn);
        conn.sender
            .register(Channel::Control, own_initial_sn, flags, syn.body.clone(), now)?;
        conn.reliable_handshake_msg_sn = Some(own_initial_sn);
        Ok((conn, syn))
    }

    /// Whether the handshake has completed.
    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnState::Open)
    }

    /// Whether the connection is closed and may be discarded.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    /// Read-only access to the sender buffer, for RTO scheduling and
    /// retransmission by the container.
    pub fn sender_buffer(&self) -> &SenderBuffer {
        &self.sender
    }

    /// Override the default NAT punch-through probe cadence/timeout
    /// (normally taken from `ContainerParams` at construction time).
    pub fn configure_nat_punch_timing(&mut self, probe_interval: Duration, probe_timeout: Duration) {
        self.nat_probe_interval = probe_interval;
        self.nat_probe_timeout = probe_timeout;
    }

    /// Current high-level NAT punch-through state, per spec: `ESTABLISHING`
    /// while probing, `ESTABLISHED` once an endpoint has been selected,
    /// `FAILED` if the probe phase timed out, `NOT_ESTABLISHING` if no
    /// punch-through was ever started (or it already finished and was
    /// torn down).
    pub fn p2p_state(&self) -> P2pState {
        self.nat_punch.as_ref().map(|p| p.state()).unwrap_or(P2pState::NotEstablishing)
    }

    /// The mediator's address, once learned from a `PRX`/
    /// `PRX-RST-SYN-ACK` message.
    pub fn mediator_addr(&self) -> Option<SocketAddr> {
        self.mediator_addr
    }

    fn reconstruct(&mut self, channel: Channel, observed: u16) -> u64 {
        let reference = *self.receive_reference.get(&channel).unwrap_or(&0);
        let sn = seq::reconstruct(reference, observed);
        let entry = self.receive_reference.entry(channel).or_insert(0);
        if sn > *entry {
            *entry = sn;
        }
        sn
    }

    /// Process one inbound message, dispatching control messages to
    /// the handshake/close state machine and data messages to the
    /// receiver buffer. `from` is the address the datagram actually
    /// arrived from, which during NAT punch-through may differ from
    /// whatever address the container currently sends to.
    pub fn on_message(
        &mut self,
        from: SocketAddr,
        header: &MessageHeader,
        body: Bytes,
        channel_type: ChannelType,
        now: Instant,
        send_queue: &mut SendQueue,
    ) -> Vec<ConnectionEvent> {
        let kind = header.flags.classify();

        // NAT punch-through control messages live outside this
        // connection's per-channel sequence space (they're exchanged
        // directly between peers, or with the mediator, ahead of or in
        // parallel with the handshake proper), so they never touch
        // `reconstruct`/`receive_reference`.
        if is_nat_punch_kind(kind) {
            return self.on_nat_punch_message(from, kind, body, now);
        }

        let mut events = Vec::new();
        if let Some(punch) = &self.nat_punch {
            if let Some(target) = punch.recovery_target(from) {
                events.push(self.raw_prx_syn_ack(target));
            }
        }

        let sn = self.reconstruct(header.channel, header.sequence_number);

        if header.flags.is_control() {
            events.extend(self.on_control_message(kind, header.channel, sn, now, send_queue));
            return events;
        }

        events.extend(
            self.receiver
                .receive(header.channel, channel_type, sn, header.flags, body)
                .into_iter()
                .map(|delivered| ConnectionEvent::Message {
                    channel: delivered.channel,
                    body: delivered.body,
                }),
        );
        events
    }

    fn on_control_message(
        &mut self,
        kind: ControlKind,
        channel: Channel,
        peer_sn: u64,
        now: Instant,
        send_queue: &mut SendQueue,
    ) -> Vec<ConnectionEvent> {
        match kind {
            ControlKind::SynRst if self.role == Role::Client => {
                self.peer_initial_sn = Some(peer_sn);
                if let Some(handshake_sn) = self.reliable_handshake_msg_sn.take() {
                    self.sender.deregister_one(Channel::Control, handshake_sn);
                }
                self.state = ConnState::Open;
                vec![ConnectionEvent::Opened]
            }
            ControlKind::SynRstAck => {
                let reason = if matches!(self.state, ConnState::Closing) {
                    DisconnectReason::ThisHostClosed
                } else {
                    DisconnectReason::OtherHostClosed
                };
                self.force_close(reason)
            }
            ControlKind::Rst => self.force_close(DisconnectReason::OtherHostClosed),
            ControlKind::Ack => {
                self.sender.deregister_up_to(channel, peer_sn);
                Vec::new()
            }
            ControlKind::Sack => {
                self.sender.deregister_one(channel, peer_sn);
                Vec::new()
            }
            _ => {
                let _ = (now, send_queue);
                Vec::new()
            }
        }
    }

    fn raw_prx_syn_ack(&self, to: SocketAddr) -> ConnectionEvent {
        ConnectionEvent::SendRaw {
            to,
            message: control_message(MessageFlags::NONE.with(message_bit::PRX).with(message_bit::SYN).with(message_bit::ACK), 0),
        }
    }

    /// Dispatch one NAT punch-through control message. Separate from
    /// [`Self::on_control_message`] since these never advance this
    /// connection's own handshake/ACK bookkeeping.
    fn on_nat_punch_message(
        &mut self,
        from: SocketAddr,
        kind: ControlKind,
        body: Bytes,
        now: Instant,
    ) -> Vec<ConnectionEvent> {
        match kind {
            ControlKind::Prx | ControlKind::PrxAck => {
                // The mediator's receipt acknowledgment for our SYN (or
                // the rendezvous ack carrying a peer's inner address,
                // relevant only on the mediator side of this exchange).
                self.mediator_addr = Some(from);
                Vec::new()
            }
            ControlKind::PrxRstSynAck => {
                let Some((_own_inner, _own_outer, peer_inner, peer_outer)) = natpunch::decode_endpoint_quad(&body)
                else {
                    return Vec::new();
                };
                self.mediator_addr = Some(from);
                let peer = EndpointPair {
                    inner: Endpoint::new(peer_inner),
                    outer: Endpoint::new(peer_outer),
                };
                self.nat_punch = Some(NatPunchThrough::new(peer, now, self.nat_probe_timeout));
                self.send_nat_probes(now)
            }
            ControlKind::PrxSyn => {
                vec![ConnectionEvent::SendRaw {
                    to: from,
                    message: control_message(
                        MessageFlags::NONE.with(message_bit::PRX).with(message_bit::SYN).with(message_bit::ACK),
                        0,
                    ),
                }]
            }
            ControlKind::PrxSynAck => {
                let Some(punch) = self.nat_punch.as_mut() else {
                    return Vec::new();
                };
                match punch.on_prx_syn_ack(from) {
                    NatPunchEvent::Switched(addr) => {
                        vec![ConnectionEvent::RemoteAddrChanged(addr), ConnectionEvent::NatPunchFinished(true)]
                    }
                    NatPunchEvent::Unchanged | NatPunchEvent::Failed => Vec::new(),
                }
            }
            ControlKind::PrxRst => {
                self.nat_punch = None;
                vec![ConnectionEvent::SendRaw {
                    to: from,
                    message: control_message(
                        MessageFlags::NONE.with(message_bit::PRX).with(message_bit::RST).with(message_bit::ACK),
                        0,
                    ),
                }]
            }
            ControlKind::PrxRstAck => {
                self.nat_punch = None;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn send_nat_probes(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        let interval = self.nat_probe_interval;
        let Some(punch) = self.nat_punch.as_mut() else {
            return Vec::new();
        };
        if !punch.due_for_probe(now, interval) {
            return Vec::new();
        }
        let peer = punch.peer();
        let probe = control_message(MessageFlags::NONE.with(message_bit::PRX).with(message_bit::SYN), 0);
        vec![
            ConnectionEvent::SendRaw { to: peer.inner.addr(), message: probe.clone() },
            ConnectionEvent::SendRaw { to: peer.outer.addr(), message: probe },
        ]
    }

    /// Called once per tick: resends unresolved `PRX-SYN` probes at
    /// `nat_probe_interval` and reports probe-phase timeout.
    pub fn poll_nat_punch(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        let mut events = self.send_nat_probes(now);
        if let Some(punch) = self.nat_punch.as_mut() {
            if punch.poll(now) == NatPunchEvent::Failed {
                self.nat_punch = None;
                events.push(ConnectionEvent::NatPunchFinished(false));
            }
        }
        events
    }

    /// Begin a graceful close: releases the handshake slot if still
    /// pending and enqueues a reliable RST once the sender buffer
    /// drains (immediately, if it already has).
    pub fn initiate_close(&mut self, own_next_sn: u64, now: Instant, send_queue: &mut SendQueue) -> Result<()> {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return Ok(());
        }
        self.state = ConnState::Closing;
        if let Some(handshake_sn) = self.reliable_handshake_msg_sn.take() {
            self.sender.deregister_one(Channel::Control, handshake_sn);
        }
        if self.sender.is_empty() {
            self.send_rst(own_next_sn, now, send_queue)?;
        } else {
            self.rst_pending = true;
        }
        Ok(())
    }

    /// Called once per tick while closing: finishes sending the RST
    /// once the sender buffer has drained.
    pub fn poll_close(&mut self, own_next_sn: u64, now: Instant, send_queue: &mut SendQueue) -> Result<()> {
        if self.rst_pending && self.sender.is_empty() {
            self.rst_pending = false;
            self.send_rst(own_next_sn, now, send_queue)?;
        }
        Ok(())
    }

    fn send_rst(&mut self, own_next_sn: u64, now: Instant, send_queue: &mut SendQueue) -> Result<()> {
        let flags = MessageFlags::NONE.with(message_bit::RST);
        let message = control_message(flags, own_next_sn);
        self.sender
            .register(Channel::Control, own_next_sn, flags, message.body.clone(), now)?;
        send_queue_enqueue_unconditionally(send_queue, message);
        Ok(())
    }

    /// Idempotent forced close: transitions to `Closed` exactly once
    /// and returns the resulting event. The container is responsible
    /// for removing this connection from its registry *before*
    /// invoking the observer — a null-then-delete pattern, since there
    /// is no live pointer here that a reentrant callback could
    /// dereference.
    pub fn force_close(&mut self, reason: DisconnectReason) -> Vec<ConnectionEvent> {
        if matches!(self.state, ConnState::Closed) {
            return Vec::new();
        }
        self.state = ConnState::Closed;
        vec![ConnectionEvent::Disconnected(reason)]
    }

    /// Send an application message on `channel`. Splits payloads larger
    /// than `max_msg_len` across consecutive sequence numbers, tagging
    /// all but the first with `SPLIT_NOT_FIRST` and all but the last
    /// with `SPLIT_NOT_LAST`.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &mut self,
        data: &[u8],
        channel: Channel,
        channel_type: ChannelType,
        max_msg_len: usize,
        now: Instant,
        send_queue: &mut SendQueue,
        congestion: &dyn CongestionControl,
    ) -> Result<()> {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return Err(Error::Closed);
        }
        if data.is_empty() {
            return Err(Error::EmptyMessage);
        }

        let prev_sn = *self.sequence_memo.get(&channel).unwrap_or(&0);
        let chunks: Vec<&[u8]> = data.chunks(max_msg_len.max(1)).collect();
        let num_messages = chunks.len();

        if channel_type.is_reliable() && !self.sender.fits_into_buffer(data.len(), num_messages) {
            return Err(Error::SendBufferOverflow);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let sn = prev_sn + i as u64;
            let mut flags = MessageFlags::NONE;
            if i > 0 {
                flags = flags.with(message_bit::SPLIT_NOT_FIRST);
            }
            if i + 1 < num_messages {
                flags = flags.with(message_bit::SPLIT_NOT_LAST);
            }
            let body = Bytes::copy_from_slice(chunk);
            let message = Message {
                header: MessageHeader {
                    flags,
                    channel,
                    sequence_number: seq::to_wire(sn),
                    length: body.len() as u16,
                },
                body: body.clone(),
            };
            if channel_type.is_reliable() {
                self.sender.register(channel, sn, flags, body, now)?;
            }
            send_queue.enqueue_message(message, congestion, now);
        }

        self.sequence_memo.insert(channel, prev_sn + num_messages as u64);

        if channel_type == ChannelType::ReliableSequenced {
            self.sender.deregister_up_to(channel, prev_sn.saturating_sub(1));
        }

        Ok(())
    }

    /// The peer's initial sequence number, once known.
    pub fn peer_initial_sn(&self) -> Option<u64> {
        self.peer_initial_sn
    }
}

fn control_message(flags: MessageFlags, sequence_number: u64) -> Message {
    Message {
        header: MessageHeader {
            flags,
            channel: Channel::Control,
            sequence_number: seq::to_wire(sequence_number),
            length: 0,
        },
        body: Bytes::new(),
    }
}

/// Control messages (SYN/RST/…) bypass congestion admission entirely,
/// but `SendQueue::enqueue_message` still wants a `CongestionControl`
/// reference for its signature; since `Channel::Control` is always
/// admitted regardless of what the congestion controller says, a
/// no-op stand-in is used here rather than threading one through
/// every close/handshake call site.
fn send_queue_enqueue_unconditionally(send_queue: &mut SendQueue, message: Message) {
    struct AlwaysAdmit;
    impl std::fmt::Debug for AlwaysAdmit {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("AlwaysAdmit")
        }
    }
    impl CongestionControl for AlwaysAdmit {
        fn can_send(&self, _now: Instant, _len: usize, _is_control: bool) -> bool {
            true
        }
        fn on_send(&mut self, _now: Instant, _len: usize) {}
        fn on_receive(&mut self, _now: Instant, _rtt: Option<std::time::Duration>, _sn: u64, _len: usize) {}
        fn on_rto(&mut self, _now: Instant) {}
    }
    send_queue.enqueue_message(message, &AlwaysAdmit, Instant::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::WindowCongestionControl;
    use rudp_core::ChannelId;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn server_construction_emits_unreliable_syn_rst() {
        let (conn, syn_rst) = LogicalConnection::new_server(7, 65536, 65536, 42);
        assert!(conn.is_open());
        assert_eq!(syn_rst.header.flags.classify(), ControlKind::SynRst);
    }

    #[test]
    fn client_handshake_opens_on_syn_rst() {
        let now = Instant::now();
        let (mut conn, syn) = LogicalConnection::new_client(65536, 65536, 1, now).unwrap();
        assert_eq!(syn.header.flags.classify(), ControlKind::Syn);
        assert!(!conn.is_open());

        let mut queue = SendQueue::new();
        let header = MessageHeader {
            flags: MessageFlags::NONE.with(message_bit::SYN).with(message_bit::RST),
            channel: Channel::Control,
            sequence_number: 9,
            length: 0,
        };
        let events = conn.on_message(peer_addr(), &header, Bytes::new(), ChannelType::Unreliable, now, &mut queue);
        assert!(conn.is_open());
        assert!(matches!(events[0], ConnectionEvent::Opened));
        assert_eq!(conn.peer_initial_sn(), Some(9));
    }

    #[test]
    fn peer_rst_force_closes_with_other_host_closed_reason() {
        let (mut conn, _) = LogicalConnection::new_server(7, 65536, 65536, 42);
        let mut queue = SendQueue::new();
        let header = MessageHeader {
            flags: MessageFlags::NONE.with(message_bit::RST),
            channel: Channel::Control,
            sequence_number: 1,
            length: 0,
        };
        let events = conn.on_message(peer_addr(), &header, Bytes::new(), ChannelType::Unreliable, Instant::now(), &mut queue);
        assert!(matches!(events[0], ConnectionEvent::Disconnected(DisconnectReason::OtherHostClosed)));
        assert!(conn.is_closed());

        // Idempotent: a second force_close is a no-op.
        assert!(conn.force_close(DisconnectReason::OtherHostClosed).is_empty());
    }

    #[test]
    fn send_splits_oversized_payload_and_advances_sequence_memo() {
        let (mut conn, _) = LogicalConnection::new_server(7, 65536, 65536, 42);
        let mut queue = SendQueue::new();
        let cc = WindowCongestionControl::new(usize::MAX, 0, usize::MAX, 1200);
        let channel = Channel::Data(ChannelId::new(ChannelType::ReliableOrdered, 0));
        let data = vec![7u8; 25];
        conn.send(&data, channel, ChannelType::ReliableOrdered, 10, Instant::now(), &mut queue, &cc)
            .unwrap();
        assert_eq!(*conn.sequence_memo.get(&channel).unwrap(), 3);
    }

    #[test]
    fn reliable_sequenced_send_deregisters_prior_messages() {
        let (mut conn, _) = LogicalConnection::new_server(7, 65536, 65536, 42);
        let mut queue = SendQueue::new();
        let cc = WindowCongestionControl::new(usize::MAX, 0, usize::MAX, 1200);
        let channel = Channel::Data(ChannelId::new(ChannelType::ReliableSequenced, 0));
        let now = Instant::now();
        conn.send(b"first", channel, ChannelType::ReliableSequenced, 1024, now, &mut queue, &cc)
            .unwrap();
        assert!(!conn.sender.is_empty());
        conn.send(b"second", channel, ChannelType::ReliableSequenced, 1024, now, &mut queue, &cc)
            .unwrap();
        // Only the newest message (sn 1) should remain registered.
        assert_eq!(conn.sender.total_bytes(), b"second".len());
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn prx_rst_syn_ack_starts_probing_both_candidates() {
        let (mut conn, _) = LogicalConnection::new_client(65536, 65536, 1, Instant::now()).unwrap();
        let mut queue = SendQueue::new();
        let mediator = addr(5000);
        let body = natpunch::encode_endpoint_quad(addr(1), addr(2), addr(10), addr(20));
        let header = MessageHeader {
            flags: MessageFlags::NONE
                .with(message_bit::PRX)
                .with(message_bit::RST)
                .with(message_bit::SYN)
                .with(message_bit::ACK),
            channel: Channel::Control,
            sequence_number: 0,
            length: body.len() as u16,
        };
        let events = conn.on_message(mediator, &header, body, ChannelType::Unreliable, Instant::now(), &mut queue);
        assert_eq!(conn.p2p_state(), P2pState::Establishing);
        assert_eq!(conn.mediator_addr(), Some(mediator));
        let targets: Vec<SocketAddr> = events
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::SendRaw { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert!(targets.contains(&addr(10)));
        assert!(targets.contains(&addr(20)));
    }

    #[test]
    fn inner_prx_syn_ack_selects_remote_and_reports_success() {
        let (mut conn, _) = LogicalConnection::new_client(65536, 65536, 1, Instant::now()).unwrap();
        let mut queue = SendQueue::new();
        let body = natpunch::encode_endpoint_quad(addr(1), addr(2), addr(10), addr(20));
        let quad_header = MessageHeader {
            flags: MessageFlags::NONE
                .with(message_bit::PRX)
                .with(message_bit::RST)
                .with(message_bit::SYN)
                .with(message_bit::ACK),
            channel: Channel::Control,
            sequence_number: 0,
            length: body.len() as u16,
        };
        conn.on_message(addr(5000), &quad_header, body, ChannelType::Unreliable, Instant::now(), &mut queue);

        let ack_header = MessageHeader {
            flags: MessageFlags::NONE.with(message_bit::PRX).with(message_bit::SYN).with(message_bit::ACK),
            channel: Channel::Control,
            sequence_number: 0,
            length: 0,
        };
        let events = conn.on_message(addr(10), &ack_header, Bytes::new(), ChannelType::Unreliable, Instant::now(), &mut queue);
        assert!(events.iter().any(|e| matches!(e, ConnectionEvent::RemoteAddrChanged(a) if *a == addr(10))));
        assert!(events.iter().any(|e| matches!(e, ConnectionEvent::NatPunchFinished(true))));
        assert_eq!(conn.p2p_state(), P2pState::Established);
    }
}

//! Container: binds a socket, the logical connection, and its buffers,
//! queues and timers into one per-connection unit.
//!
//! Generalizes a per-connection state struct (protocol state, last
//! activity, peer address, stats) into a socket-owning container
//! driving a full reliability engine rather than a TLS-backed tunnel.
//! The artificial-drop hook has no analogue in a VPN tunnel; it mirrors
//! `shouldArtificiallyDropPacket`-style fault injection used to test
//! NAT punch-through convergence under packet loss.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace, warn};

use rudp_core::{Channel, ChannelType, ConnectionObserver, DatagramSocket, DisconnectReason};

use crate::congestion::CongestionControl;
use crate::connection::{ConnectionEvent, LogicalConnection};
use crate::header::{Datagram, Message, PacketHeader, RttResponse};
use crate::rtt::RttEstimator;
use crate::send_queue::SendQueue;
use crate::timers::{ConnectionTimers, TimerEvent};
use crate::{seq, Error, Result};

/// Per-connection tunables that would otherwise be threaded through
/// every constructor argument by argument. A higher-level `Config`
/// (see `rudp-config`) is expected to be converted into one of these
/// at connection-setup time.
#[derive(Debug, Clone)]
pub struct ContainerParams {
    /// Outgoing datagram size ceiling.
    pub mtu: usize,
    /// Largest single message before `send` splits it.
    pub max_msg_len: usize,
    /// Sender buffer byte capacity.
    pub sender_buffer_capacity: usize,
    /// Receiver buffer byte capacity.
    pub receiver_buffer_capacity: usize,
    /// Heartbeat cadence, expressed as a fraction of the current RTO
    /// (`heartbeat_frequency` heartbeats per RTO interval).
    pub heartbeat_interval: Duration,
    /// Steady-state inbound silence timeout.
    pub connection_timeout: Duration,
    /// Inbound silence duration that triggers `connectionLost`.
    pub connection_warning_timeout: Duration,
    /// Inbound silence timeout before the handshake completes.
    pub initial_connect_timeout: Duration,
    /// Probability (0.0-1.0) of silently dropping a packet, for
    /// fault-injection testing. Zero disables the hook.
    pub fabricated_packet_drop_rate: f64,
    /// Cadence at which unresolved NAT punch-through `PRX-SYN` probes
    /// are resent.
    pub nat_probe_interval: Duration,
    /// Overall NAT punch-through probe-phase timeout.
    pub nat_probe_timeout: Duration,
}

/// Owns the socket (or a shared handle to one borrowed from the
/// server), the logical connection, and everything that drives it.
pub struct Container<S, O> {
    socket: Arc<S>,
    /// Known once either supplied at construction (client/P2P, which own
    /// an exclusively-bound socket and know their bind address upfront)
    /// or learned from the first inbound packet that carries a sequence
    /// number (server, which borrows a socket shared across connections
    /// and must pin down which local interface this peer is on).
    local_addr: Option<SocketAddr>,
    remote_addr: SocketAddr,
    connection: LogicalConnection,
    send_queue: SendQueue,
    congestion: Box<dyn CongestionControl>,
    timers: ConnectionTimers,
    rtt: RttEstimator,
    observer: O,
    params: ContainerParams,
    own_packet_sn: u16,
    /// Set for one tick after `issue_rtt_request` fires; consumed by
    /// the next `flush` so the request rides on an actual outbound
    /// packet instead of only living in `self.rtt`'s bookkeeping.
    pending_rtt_request: Option<u16>,
}

impl<S, O> Container<S, O>
where
    S: DatagramSocket,
    O: ConnectionObserver,
{
    /// Wrap an already-constructed [`LogicalConnection`] (client or
    /// server side — construction differs, see `connection.rs`) with
    /// its socket, timers, and congestion control.
    ///
    /// `local_addr` should be `Some(bind_address)` for a client/P2P
    /// container, which owns its socket outright and so already knows
    /// where it's bound; server containers that borrow a socket shared
    /// across many peers pass `None` and let it be learned from the
    /// first inbound sequenced packet (see [`Self::on_inbound`]).
    pub fn new(
        socket: Arc<S>,
        local_addr: Option<SocketAddr>,
        remote_addr: SocketAddr,
        mut connection: LogicalConnection,
        congestion: Box<dyn CongestionControl>,
        params: ContainerParams,
        observer: O,
        now: Instant,
    ) -> Self {
        let mut timers = ConnectionTimers::new(
            now,
            params.heartbeat_interval,
            params.connection_timeout,
            params.connection_warning_timeout,
            params.initial_connect_timeout,
        );
        if connection.is_open() {
            timers.mark_opened();
        }
        connection.configure_nat_punch_timing(params.nat_probe_interval, params.nat_probe_timeout);
        Self {
            socket,
            local_addr,
            remote_addr,
            connection,
            send_queue: SendQueue::new(),
            congestion,
            timers,
            rtt: RttEstimator::new(),
            observer,
            params,
            own_packet_sn: 0,
            pending_rtt_request: None,
        }
    }

    fn should_artificially_drop(&self) -> bool {
        self.params.fabricated_packet_drop_rate > 0.0
            && rand::thread_rng().gen::<f64>() < self.params.fabricated_packet_drop_rate
    }

    /// Handle one datagram received on local address `local`, claimed
    /// to originate from `remote`. Ordinary post-handshake traffic
    /// arrives from `self.remote_addr`, but NAT punch-through probes
    /// and the mediator's own messages legitimately arrive from other
    /// addresses while a connection is still establishing — the caller
    /// (mediator/acceptor) dispatches to this container by pair/cookie
    /// rather than by address match, and `remote` is threaded through
    /// to the logical connection so it can react to where each message
    /// actually came from.
    pub fn on_inbound(&mut self, local: SocketAddr, remote: SocketAddr, data: &[u8], now: Instant) -> Result<()> {
        if self.should_artificially_drop() {
            trace!("artificially dropping inbound packet");
            return Ok(());
        }

        let datagram = match Datagram::parse(data) {
            Ok(d) => d,
            Err(err) => {
                debug!(%err, "dropping malformed inbound packet");
                return Ok(());
            }
        };

        if datagram.header.sequence_number.is_some() {
            match self.local_addr {
                Some(recorded) if recorded != local => {
                    debug!(%recorded, %local, "dropping packet received on mismatched local interface");
                    return Ok(());
                }
                Some(_) => {}
                None => self.local_addr = Some(local),
            }
        }

        self.timers.on_inbound_received(now);
        self.rtt.on_packet_received();

        if let Some(sn) = datagram.header.sequence_number {
            self.congestion.on_receive(now, self.rtt.srtt(), sn as u64, data.len());
        }

        if let Some(rtt_response) = datagram.header.rtt_response {
            self.rtt.on_rtt_response(rtt_response.sequence_number, Duration::from_micros(rtt_response.delay_micros as u64), now);
        }

        if let Some(request_sn) = datagram.header.rtt_request_sequence_number {
            let response = self.send_queue_rtt_response(request_sn, Duration::ZERO);
            self.send_immediately(response, now);
        }

        for message in datagram.messages {
            let channel_type = match message.header.channel {
                Channel::Control => ChannelType::Unreliable,
                Channel::Data(id) => id.kind,
            };
            let events = self.connection.on_message(
                remote,
                &message.header,
                message.body,
                channel_type,
                now,
                &mut self.send_queue,
            );
            self.dispatch_events(events, now);
        }

        Ok(())
    }

    fn send_queue_rtt_response(&self, request_sn: u16, delay: Duration) -> Datagram {
        Datagram {
            header: PacketHeader {
                sequence_number: Some(self.own_packet_sn),
                rtt_response: Some(RttResponse {
                    sequence_number: request_sn,
                    delay_micros: delay.as_micros() as u32,
                }),
                ..Default::default()
            },
            messages: Vec::new(),
        }
    }

    fn dispatch_events(&mut self, events: Vec<ConnectionEvent>, now: Instant) {
        for event in events {
            match event {
                ConnectionEvent::Opened => {
                    self.timers.mark_opened();
                    self.observer.on_connection_opened(false, DisconnectReason::NoError);
                }
                ConnectionEvent::Disconnected(reason) => {
                    self.observer.on_disconnect(reason);
                }
                ConnectionEvent::Message { channel, body } => {
                    self.observer.on_message(channel, &body);
                }
                ConnectionEvent::SendRaw { to, message } => {
                    self.send_raw_message(to, message, now);
                }
                ConnectionEvent::RemoteAddrChanged(addr) => {
                    debug!(%addr, "nat punch-through switched remote address");
                    self.remote_addr = addr;
                }
                ConnectionEvent::NatPunchFinished(success) => {
                    self.observer.on_nat_punchthrough_finished(success);
                }
            }
        }
    }

    /// Send a single message to `to` in its own datagram, bypassing the
    /// coalescing send queue and this container's normal `remote_addr`
    /// — used only for NAT punch-through probes/acks/teardown.
    fn send_raw_message(&mut self, to: SocketAddr, message: Message, _now: Instant) {
        if self.should_artificially_drop() {
            trace!("artificially dropping outbound NAT punch-through packet");
            return;
        }
        let datagram = Datagram {
            header: PacketHeader {
                sequence_number: Some(self.own_packet_sn),
                ..Default::default()
            },
            messages: vec![message],
        };
        let bytes = datagram.write();
        self.own_packet_sn = self.own_packet_sn.wrapping_add(1);
        let Some(local) = self.local_addr else {
            warn!("dropping NAT punch-through datagram before local address is known");
            return;
        };
        if let Err(err) = self.socket.send_to(local, to, &bytes) {
            warn!(%err, "failed to send NAT punch-through datagram");
        }
    }

    /// Current high-level NAT punch-through state (see spec §4.8/§4.9).
    pub fn p2p_state(&self) -> rudp_core::P2pState {
        self.connection.p2p_state()
    }

    /// Called once per `TICK` while this container is alive: advances
    /// timers, handles RTO-triggered retransmission, sends a heartbeat
    /// if nothing else went out, and flushes any queued datagram.
    pub fn on_tick(&mut self, now: Instant) -> Result<()> {
        if let Some(deadline) = self.connection.sender_buffer().earliest_registered_at() {
            self.timers.schedule_rto(deadline + self.rtt.rto());
        } else {
            self.timers.clear_rto();
        }

        for event in self.timers.poll(now) {
            match event {
                TimerEvent::Rto => self.handle_rto(now),
                TimerEvent::Heartbeat => self.handle_heartbeat(now),
                TimerEvent::ConnectionLost => self.observer.on_connection_lost(),
                TimerEvent::ConnectionRegained => self.observer.on_connection_regained(),
                TimerEvent::ConnectionTimedOut => {
                    let events = self.connection.force_close(DisconnectReason::ConnectionTimedOut);
                    self.dispatch_events(events, now);
                }
                TimerEvent::InitialConnectTimedOut => {
                    let events = self.connection.force_close(DisconnectReason::ConnectionTimedOut);
                    self.dispatch_events(events, now);
                }
            }
        }

        let nat_events = self.connection.poll_nat_punch(now);
        self.dispatch_events(nat_events, now);

        self.connection.poll_close(self.next_packet_sn() as u64, now, &mut self.send_queue)?;

        if self.rtt.should_issue_rtt_request(now) {
            let sn = self.next_packet_sn();
            self.rtt.issue_rtt_request(sn, now);
            self.pending_rtt_request = Some(sn);
        }

        self.flush(now);
        Ok(())
    }

    fn next_packet_sn(&self) -> u16 {
        self.own_packet_sn
    }

    fn handle_rto(&mut self, now: Instant) {
        // Capture the RTO that made these entries overdue *before*
        // backing off — `on_rto_fired` only governs the next interval,
        // it must not retroactively raise the bar an entry just cleared.
        let rto = self.rtt.rto();
        self.rtt.on_rto_fired();
        self.congestion.on_rto(now);
        let mut retransmits = Vec::new();
        self.connection.sender_buffer().each_current_message(now, rto, |entry| {
            retransmits.push((entry.channel, entry.flags, entry.non_wrapping_sn, entry.body.clone()));
        });
        for (channel, flags, non_wrapping_sn, body) in retransmits {
            let message = crate::header::Message {
                header: crate::header::MessageHeader {
                    flags,
                    channel,
                    sequence_number: seq::to_wire(non_wrapping_sn),
                    length: body.len() as u16,
                },
                body,
            };
            self.send_queue.enqueue_message(message, self.congestion.as_ref(), now);
        }
    }

    fn handle_heartbeat(&mut self, now: Instant) {
        if let Some(datagram) = self.send_queue.heartbeat(self.own_packet_sn, self.params.mtu) {
            self.send_immediately(datagram, now);
        }
    }

    fn flush(&mut self, now: Instant) {
        if self.send_queue.is_empty() && self.pending_rtt_request.is_none() {
            return;
        }
        let header = PacketHeader {
            sequence_number: Some(self.own_packet_sn),
            rtt_request_sequence_number: self.pending_rtt_request.take(),
            ..Default::default()
        };
        if let Some(datagram) = self.send_queue.flush(header, self.params.mtu) {
            self.send_immediately(datagram, now);
        }
    }

    fn send_immediately(&mut self, datagram: Datagram, now: Instant) {
        if self.should_artificially_drop() {
            trace!("artificially dropping outbound packet");
            return;
        }
        let bytes = datagram.write();
        self.timers.on_outbound_sent(now);
        self.own_packet_sn = self.own_packet_sn.wrapping_add(1);
        let Some(local) = self.local_addr else {
            warn!("dropping outbound datagram before local address is known");
            return;
        };
        if let Err(err) = self.socket.send_to(local, self.remote_addr, &bytes) {
            warn!(%err, "failed to send datagram");
        }
    }

    /// Hand off the initial handshake message returned by
    /// [`LogicalConnection::new_client`]/[`LogicalConnection::new_server`]
    /// to this container's send queue. Callers construct the connection
    /// and its container separately (the container needs the connection
    /// to already exist to know whether the handshake is open), so this
    /// is the public seam that lets the caller finish wiring the two
    /// together without reaching into the container's internals.
    pub fn enqueue_handshake_message(&mut self, message: Message, now: Instant) {
        self.send_queue.enqueue_message(message, self.congestion.as_ref(), now);
    }

    /// Send an application message. See [`LogicalConnection::send`].
    pub fn send(&mut self, data: &[u8], channel: Channel, channel_type: ChannelType, now: Instant) -> Result<()> {
        if data.is_empty() {
            return Err(Error::EmptyMessage);
        }
        self.connection.send(
            data,
            channel,
            channel_type,
            self.params.max_msg_len,
            now,
            &mut self.send_queue,
            self.congestion.as_ref(),
        )
    }

    /// Begin a graceful close.
    pub fn initiate_close(&mut self, now: Instant) -> Result<()> {
        let sn = self.next_packet_sn() as u64;
        self.connection.initiate_close(sn, now, &mut self.send_queue)
    }

    /// Whether the underlying logical connection has closed.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Whether the handshake has completed.
    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Peer address this container talks to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

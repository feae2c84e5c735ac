//! The cookie-authenticated rendezvous and forwarding state machine.
//!
//! Deliberately pure: [`Mediator::on_packet`] takes an inbound datagram
//! and returns the datagrams to send in response, touching no socket
//! itself. `main.rs` drives the actual `UdpSocket` I/O, the same split
//! `rudp-protocol` uses between `LogicalConnection` (pure) and
//! `Container` (I/O).

use std::collections::HashMap;
use std::time::{Duration, Instant};
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use rudp_core::Endpoint;
use rudp_crypto::{CookieAuthority, CookieRandNum};
use rudp_protocol::flags::{message_bit, ControlKind, MessageFlags};
use rudp_protocol::header::{Datagram, Message, MessageHeader, PacketHeader};
use rudp_protocol::natpunch;
use rudp_core::Channel;

use crate::rate_limit::RateLimiter;

/// One side of a rendezvous pair.
#[derive(Debug, Clone, Copy)]
struct Slot {
    /// The address packets from this peer are observed to arrive from.
    addr: SocketAddr,
    /// The initial sequence number carried by this peer's `SYN`, used
    /// to detect a peer that forgot about this pairing and is opening
    /// a fresh one from the same address.
    initial_sn: u16,
    /// This peer's locally-bound address, once reported via `PRX-ACK`.
    inner_addr: Option<SocketAddr>,
}

impl Slot {
    fn new(addr: SocketAddr, initial_sn: u16) -> Self {
        Self { addr, initial_sn, inner_addr: None }
    }
}

/// State for one rendezvous, keyed by the cookie's shared random
/// number for as long as only one peer has shown up, and additionally
/// indexed by both peers' addresses in [`Mediator::by_addr`] once both
/// are known.
#[derive(Debug)]
struct Pair {
    first: Slot,
    first_complementary: bool,
    second: Option<Slot>,
    last_activity: Instant,
}

impl Pair {
    fn slot_for(&self, addr: SocketAddr) -> Option<&Slot> {
        if self.first.addr == addr {
            Some(&self.first)
        } else if self.second.as_ref().is_some_and(|s| s.addr == addr) {
            self.second.as_ref()
        } else {
            None
        }
    }

    fn slot_for_mut(&mut self, addr: SocketAddr) -> Option<&mut Slot> {
        if self.first.addr == addr {
            Some(&mut self.first)
        } else if self.second.as_ref().is_some_and(|s| s.addr == addr) {
            self.second.as_mut()
        } else {
            None
        }
    }

    fn other(&self, addr: SocketAddr) -> Option<SocketAddr> {
        if self.first.addr == addr {
            self.second.map(|s| s.addr)
        } else if self.second.as_ref().is_some_and(|s| s.addr == addr) {
            Some(self.first.addr)
        } else {
            None
        }
    }
}

/// A datagram the caller must send.
pub struct Outbound {
    /// Destination address.
    pub to: SocketAddr,
    /// Wire bytes.
    pub data: Bytes,
}

fn control_message(flags: MessageFlags, body: Bytes) -> Message {
    Message {
        header: MessageHeader {
            flags,
            channel: Channel::Control,
            sequence_number: 0,
            length: body.len() as u16,
        },
        body,
    }
}

fn datagram_bytes(message: Message) -> Bytes {
    let datagram = Datagram { header: PacketHeader::default(), messages: vec![message] };
    datagram.write().freeze()
}

fn reply(to: SocketAddr, flags: MessageFlags, body: Bytes) -> Outbound {
    Outbound { to, data: datagram_bytes(control_message(flags, body)) }
}

/// Cookie-authenticated rendezvous and packet-forwarding state.
pub struct Mediator {
    cookies: CookieAuthority,
    pairs: HashMap<CookieRandNum, Pair>,
    by_addr: HashMap<Endpoint, CookieRandNum>,
    rate_limiter: RateLimiter,
    pair_idle_timeout: Duration,
}

impl Mediator {
    /// Construct a mediator with a freshly generated cookie secret.
    pub fn new(rate_limit: u32, pair_idle_timeout: Duration) -> Self {
        Self {
            cookies: CookieAuthority::new(),
            pairs: HashMap::new(),
            by_addr: HashMap::new(),
            rate_limiter: RateLimiter::new(rate_limit),
            pair_idle_timeout,
        }
    }

    /// Issue a fresh complementary cookie pair, to be handed to the two
    /// peers through whatever out-of-band channel brought them
    /// together (not part of this wire protocol).
    pub fn generate_cookie_pair(&self, now: Instant) -> (rudp_crypto::Cookie, rudp_crypto::Cookie) {
        self.cookies.generate_pair(instant_to_unix(now))
    }

    fn rand_for_addr(&self, addr: SocketAddr) -> Option<CookieRandNum> {
        self.by_addr.get(&Endpoint::new(addr)).copied()
    }

    fn remove_pair(&mut self, rand: CookieRandNum) {
        if let Some(pair) = self.pairs.remove(&rand) {
            self.by_addr.remove(&Endpoint::new(pair.first.addr));
            if let Some(second) = pair.second {
                self.by_addr.remove(&Endpoint::new(second.addr));
            }
        }
    }

    /// Drop pairs that have seen no traffic for `pair_idle_timeout`.
    pub fn evict_stale(&mut self, now: Instant) {
        let stale: Vec<CookieRandNum> = self
            .pairs
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_activity) >= self.pair_idle_timeout)
            .map(|(rand, _)| *rand)
            .collect();
        for rand in stale {
            self.remove_pair(rand);
        }
        self.rate_limiter.evict_stale(now, self.pair_idle_timeout);
    }

    /// Process one inbound datagram from `remote`, arrived on `local`.
    /// Returns the datagrams to send in response (possibly none).
    pub fn on_packet(&mut self, now: Instant, local: SocketAddr, remote: SocketAddr, data: &[u8]) -> Vec<Outbound> {
        if !self.rate_limiter.admit(Endpoint::new(remote), now) {
            trace!(%remote, "mediator rate limit exceeded, dropping packet");
            return Vec::new();
        }

        let Ok(datagram) = Datagram::parse(data) else {
            debug!(%remote, "dropping malformed datagram");
            return Vec::new();
        };

        if let Some(rand) = self.rand_for_addr(remote) {
            if let Some(pair) = self.pairs.get_mut(&rand) {
                pair.last_activity = now;
            }
        }

        let Some(first) = datagram.messages.first() else {
            // Heartbeat: packet header only, no messages. Just forward.
            return self.forward_raw(remote, local, data);
        };

        if !first.header.flags.is_control() {
            return self.forward_raw(remote, local, data);
        }

        if datagram.messages.len() != 1 {
            debug!(%remote, "dropping control datagram carrying more than one message");
            return Vec::new();
        }

        match first.header.flags.classify() {
            ControlKind::Syn => self.handle_syn(now, local, remote, first.header.sequence_number, &first.body),
            ControlKind::PrxAck => self.handle_prx_ack(now, local, remote, &first.body),
            ControlKind::Rst => self.handle_rst(local, remote, data),
            ControlKind::SynRstAck => self.handle_rst_syn_ack(local, remote, data),
            ControlKind::PrxRst => self.handle_prx_rst(local, remote),
            _ => {
                debug!(%remote, kind = ?first.header.flags.classify(), "dropping irrelevant control message");
                Vec::new()
            }
        }
    }

    fn forward_raw(&self, remote: SocketAddr, local: SocketAddr, data: &[u8]) -> Vec<Outbound> {
        let Some(rand) = self.rand_for_addr(remote) else {
            return Vec::new();
        };
        let Some(pair) = self.pairs.get(&rand) else {
            return Vec::new();
        };
        let Some(other) = pair.other(remote) else {
            return Vec::new();
        };
        let _ = local;
        vec![Outbound { to: other, data: Bytes::copy_from_slice(data) }]
    }

    fn handle_syn(
        &mut self,
        now: Instant,
        local: SocketAddr,
        remote: SocketAddr,
        initial_sn: u16,
        cookie: &[u8],
    ) -> Vec<Outbound> {
        let Ok((rand, complementary)) = self.cookies.verify(cookie, instant_to_unix(now)) else {
            debug!(%remote, "dropping SYN with invalid cookie");
            return Vec::new();
        };

        let mut rand_for_addr = self.rand_for_addr(remote);

        if let Some(r) = rand_for_addr {
            let mismatched = self.pairs.get(&r).and_then(|p| p.slot_for(remote)).map(|s| s.initial_sn) != Some(initial_sn);
            if mismatched {
                debug!(%remote, "SYN initial sequence number mismatch, discarding existing pair");
                self.remove_pair(r);
                rand_for_addr = None;
            }
        }

        if rand_for_addr.is_none() {
            if let Some(pair) = self.pairs.get_mut(&rand) {
                if pair.first_complementary == complementary {
                    // Same peer, seen from a second local address before the
                    // first was confirmed. Not a real pairing; ignore.
                    return Vec::new();
                }
                pair.second = Some(Slot::new(remote, initial_sn));
                pair.last_activity = now;
                self.by_addr.insert(Endpoint::new(remote), rand);
            } else {
                self.pairs.insert(
                    rand,
                    Pair { first: Slot::new(remote, initial_sn), first_complementary: complementary, second: None, last_activity: now },
                );
                self.by_addr.insert(Endpoint::new(remote), rand);
            }
        }

        vec![reply(remote, MessageFlags::NONE.with(message_bit::PRX), Bytes::new())]
            .into_iter()
            .map(|o| { let _ = local; o })
            .collect()
    }

    fn handle_prx_ack(&mut self, now: Instant, local: SocketAddr, remote: SocketAddr, body: &[u8]) -> Vec<Outbound> {
        let Some(rand) = self.rand_for_addr(remote) else {
            debug!(%remote, "dropping PRX-ACK without an open pairing");
            return Vec::new();
        };
        let Some((inner_addr, consumed)) = natpunch::decode_endpoint(body) else {
            debug!(%remote, "dropping malformed PRX-ACK payload");
            return Vec::new();
        };
        if consumed != body.len() {
            debug!(%remote, "dropping PRX-ACK with trailing garbage");
            return Vec::new();
        }

        if let Some(pair) = self.pairs.get_mut(&rand) {
            if let Some(slot) = pair.slot_for_mut(remote) {
                slot.inner_addr = Some(inner_addr);
            }
            pair.last_activity = now;
        }

        self.maybe_send_endpoint_pair(local, rand)
    }

    fn maybe_send_endpoint_pair(&self, local: SocketAddr, rand: CookieRandNum) -> Vec<Outbound> {
        let _ = local;
        let Some(pair) = self.pairs.get(&rand) else { return Vec::new() };
        let Some(second) = pair.second else { return Vec::new() };
        let (Some(first_inner), Some(second_inner)) = (pair.first.inner_addr, second.inner_addr) else {
            return Vec::new();
        };

        let first_outer = pair.first.addr;
        let second_outer = second.addr;

        let flags = MessageFlags::NONE.with(message_bit::PRX).with(message_bit::RST).with(message_bit::SYN).with(message_bit::ACK);

        vec![
            reply(first_outer, flags, natpunch::encode_endpoint_quad(first_inner, first_outer, second_inner, second_outer)),
            reply(second_outer, flags, natpunch::encode_endpoint_quad(second_inner, second_outer, first_inner, first_outer)),
        ]
    }

    fn handle_rst(&mut self, local: SocketAddr, remote: SocketAddr, data: &[u8]) -> Vec<Outbound> {
        let _ = local;
        match self.rand_for_addr(remote).and_then(|r| self.pairs.get(&r)?.other(remote)) {
            Some(other) => vec![Outbound { to: other, data: Bytes::copy_from_slice(data) }],
            None => {
                // No pairing for this address: the peer already heard
                // back from us once and we've forgotten; let it close.
                vec![reply(remote, MessageFlags::NONE.with(message_bit::SYN).with(message_bit::RST).with(message_bit::ACK), Bytes::new())]
            }
        }
    }

    fn handle_rst_syn_ack(&mut self, local: SocketAddr, remote: SocketAddr, data: &[u8]) -> Vec<Outbound> {
        let _ = local;
        let Some(rand) = self.rand_for_addr(remote) else {
            return Vec::new();
        };
        let other = self.pairs.get(&rand).and_then(|p| p.other(remote));
        self.remove_pair(rand);
        match other {
            Some(other) => vec![Outbound { to: other, data: Bytes::copy_from_slice(data) }],
            None => Vec::new(),
        }
    }

    fn handle_prx_rst(&mut self, local: SocketAddr, remote: SocketAddr) -> Vec<Outbound> {
        let _ = local;
        if let Some(rand) = self.rand_for_addr(remote) {
            self.remove_pair(rand);
        }
        vec![reply(remote, MessageFlags::NONE.with(message_bit::PRX).with(message_bit::RST).with(message_bit::ACK), Bytes::new())]
    }
}

/// `CookieAuthority` keys its time buckets off a `Duration` rather than
/// `Instant` (cookies must stay verifiable across process restarts);
/// the mediator otherwise works in `Instant` like the rest of the
/// protocol engine, so callers convert at the boundary.
fn instant_to_unix(now: Instant) -> Duration {
    let _ = now;
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn local() -> SocketAddr {
        addr(9)
    }

    fn syn_datagram(cookie: &[u8], initial_sn: u16) -> Bytes {
        datagram_bytes(Message {
            header: MessageHeader {
                flags: MessageFlags::NONE.with(message_bit::SYN),
                channel: Channel::Control,
                sequence_number: initial_sn,
                length: cookie.len() as u16,
            },
            body: Bytes::copy_from_slice(cookie),
        })
    }

    fn prx_ack_datagram(inner: SocketAddr) -> Bytes {
        datagram_bytes(control_message(MessageFlags::NONE.with(message_bit::PRX).with(message_bit::ACK), natpunch::encode_own_address(inner)))
    }

    #[test]
    fn full_rendezvous_pairs_two_peers_and_sends_endpoint_quads() {
        let mut mediator = Mediator::new(0, Duration::from_secs(60));
        let now = Instant::now();
        let (cookie_a, cookie_b) = mediator.generate_cookie_pair(now);

        let a_outer = addr(1);
        let b_outer = addr(2);
        let a_inner = addr(101);
        let b_inner = addr(102);

        let reply_a = mediator.on_packet(now, local(), a_outer, &syn_datagram(&cookie_a, 1));
        assert_eq!(reply_a.len(), 1);
        assert_eq!(reply_a[0].to, a_outer);

        let reply_b = mediator.on_packet(now, local(), b_outer, &syn_datagram(&cookie_b, 2));
        assert_eq!(reply_b.len(), 1);
        assert_eq!(reply_b[0].to, b_outer);

        let ack_a = mediator.on_packet(now, local(), a_outer, &prx_ack_datagram(a_inner));
        assert!(ack_a.is_empty());

        let ack_b = mediator.on_packet(now, local(), b_outer, &prx_ack_datagram(b_inner));
        assert_eq!(ack_b.len(), 2);

        let to_a = ack_b.iter().find(|o| o.to == a_outer).expect("reply to A");
        let parsed = Datagram::parse(&to_a.data).unwrap();
        let (own_inner, own_outer, peer_inner, peer_outer) = natpunch::decode_endpoint_quad(&parsed.messages[0].body).unwrap();
        assert_eq!(own_inner, a_inner);
        assert_eq!(own_outer, a_outer);
        assert_eq!(peer_inner, b_inner);
        assert_eq!(peer_outer, b_outer);
    }

    #[test]
    fn syn_with_unknown_cookie_is_dropped_silently() {
        let mut mediator = Mediator::new(0, Duration::from_secs(60));
        let now = Instant::now();
        let bogus_cookie = [0u8; rudp_crypto::COOKIE_SIZE];
        let replies = mediator.on_packet(now, local(), addr(1), &syn_datagram(&bogus_cookie, 1));
        assert!(replies.is_empty());
    }

    #[test]
    fn orphan_rst_gets_syn_rst_ack() {
        let mut mediator = Mediator::new(0, Duration::from_secs(60));
        let now = Instant::now();
        let rst = datagram_bytes(control_message(MessageFlags::NONE.with(message_bit::RST), Bytes::new()));
        let replies = mediator.on_packet(now, local(), addr(5), &rst);
        assert_eq!(replies.len(), 1);
        let parsed = Datagram::parse(&replies[0].data).unwrap();
        assert_eq!(parsed.messages[0].header.flags.classify(), ControlKind::SynRstAck);
    }

    #[test]
    fn prx_rst_tears_down_pair_and_acks() {
        let mut mediator = Mediator::new(0, Duration::from_secs(60));
        let now = Instant::now();
        let (cookie_a, _) = mediator.generate_cookie_pair(now);
        mediator.on_packet(now, local(), addr(1), &syn_datagram(&cookie_a, 1));
        assert!(mediator.rand_for_addr(addr(1)).is_some());

        let prx_rst = datagram_bytes(control_message(MessageFlags::NONE.with(message_bit::PRX).with(message_bit::RST), Bytes::new()));
        let replies = mediator.on_packet(now, local(), addr(1), &prx_rst);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].data.len() > 0, true);
        assert!(mediator.rand_for_addr(addr(1)).is_none());
    }

    #[test]
    fn mismatched_initial_sequence_number_discards_existing_pair() {
        let mut mediator = Mediator::new(0, Duration::from_secs(60));
        let now = Instant::now();
        let (cookie_a, cookie_b) = mediator.generate_cookie_pair(now);
        mediator.on_packet(now, local(), addr(1), &syn_datagram(&cookie_a, 1));
        mediator.on_packet(now, local(), addr(2), &syn_datagram(&cookie_b, 2));
        let rand_before = mediator.rand_for_addr(addr(1));
        assert!(rand_before.is_some());

        let (cookie_c, _) = mediator.generate_cookie_pair(now);
        mediator.on_packet(now, local(), addr(1), &syn_datagram(&cookie_c, 99));

        // the old pairing under addr(2) must be gone since it shared
        // a pair with addr(1)
        assert!(mediator.rand_for_addr(addr(2)).is_none());
    }

    #[test]
    fn rate_limit_drops_excess_packets() {
        let mut mediator = Mediator::new(1, Duration::from_secs(60));
        let now = Instant::now();
        let (cookie_a, _) = mediator.generate_cookie_pair(now);
        let first = mediator.on_packet(now, local(), addr(1), &syn_datagram(&cookie_a, 1));
        assert_eq!(first.len(), 1);
        let second = mediator.on_packet(now, local(), addr(1), &syn_datagram(&cookie_a, 1));
        assert!(second.is_empty());
    }
}

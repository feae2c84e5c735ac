//! NAT punch-through: probes a peer's inner and outer endpoints after
//! the mediator brokers a rendezvous, and commits to whichever answers
//! first (preferring inner).
//!
//! A VPN tunnel always talks to a fixed, externally-reachable server
//! and has no equivalent phase, so this state machine is grounded
//! directly on the mediator's own `gotConnectionOpen`/
//! `gotConnectionOpenAck`/`sendEndpointPair` handling of the same
//! handshake, expressed as a small struct-plus-`impl` state machine.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use rudp_core::{EndpointPair, P2pState};

/// Which of the peer's two candidate endpoints a `PRX-SYN-ACK` arrived
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Inner,
    Outer,
}

/// Result of feeding a punch-through state machine a new event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatPunchEvent {
    /// No change in selected endpoint.
    Unchanged,
    /// The remote address committed to changed (inner strictly
    /// dominates outer; an inner ack always wins over an outer one).
    Switched(SocketAddr),
    /// The probe phase timed out without a single successful ack.
    Failed,
}

/// Per-connection NAT punch-through probe, alive from receipt of the
/// mediator's `PRX-RST-SYN-ACK` until teardown completes.
#[derive(Debug)]
pub struct NatPunchThrough {
    peer: EndpointPair,
    inner_succeeded: bool,
    outer_succeeded: bool,
    selected: Option<(Candidate, SocketAddr)>,
    state: P2pState,
    started_at: Instant,
    probe_timeout: Duration,
    last_probed_at: Option<Instant>,
}

impl NatPunchThrough {
    /// Begin probing. The caller must send `PRX-SYN` to both
    /// `peer.inner` and `peer.outer` immediately after construction.
    pub fn new(peer: EndpointPair, now: Instant, probe_timeout: Duration) -> Self {
        Self {
            peer,
            inner_succeeded: false,
            outer_succeeded: false,
            selected: None,
            state: P2pState::Establishing,
            started_at: now,
            probe_timeout,
            last_probed_at: None,
        }
    }

    /// Whether a fresh round of `PRX-SYN` probes is due: true at most
    /// once per `interval`, and never once an endpoint is selected.
    pub fn due_for_probe(&mut self, now: Instant, interval: Duration) -> bool {
        if self.selected.is_some() {
            return false;
        }
        if matches!(self.last_probed_at, Some(t) if now.saturating_duration_since(t) < interval) {
            return false;
        }
        self.last_probed_at = Some(now);
        true
    }

    /// The peer endpoints being probed.
    pub fn peer(&self) -> EndpointPair {
        self.peer
    }

    /// Current high-level punch-through state.
    pub fn state(&self) -> P2pState {
        self.state
    }

    /// The endpoint this side has committed to, if any.
    pub fn selected_endpoint(&self) -> Option<SocketAddr> {
        self.selected.map(|(_, addr)| addr)
    }

    fn candidate_of(&self, from: SocketAddr) -> Option<Candidate> {
        if from == self.peer.inner.addr() {
            Some(Candidate::Inner)
        } else if from == self.peer.outer.addr() {
            Some(Candidate::Outer)
        } else {
            None
        }
    }

    /// Process a `PRX-SYN-ACK` received from `from`. Inner strictly
    /// dominates outer: an inner ack always becomes (or stays) the
    /// selection, even replacing an already-committed outer one.
    pub fn on_prx_syn_ack(&mut self, from: SocketAddr) -> NatPunchEvent {
        let Some(candidate) = self.candidate_of(from) else {
            return NatPunchEvent::Unchanged;
        };

        match candidate {
            Candidate::Inner => self.inner_succeeded = true,
            Candidate::Outer => self.outer_succeeded = true,
        }

        let already_selected = self.selected.map(|(c, _)| c);
        let should_switch = match (candidate, already_selected) {
            (Candidate::Inner, Some(Candidate::Inner)) => false,
            (Candidate::Inner, _) => true,
            (Candidate::Outer, None) => true,
            (Candidate::Outer, Some(_)) => false,
        };

        if !should_switch {
            return NatPunchEvent::Unchanged;
        }

        self.selected = Some((candidate, from));
        self.state = P2pState::Established;
        NatPunchEvent::Switched(from)
    }

    /// Asymmetric recovery: a non-`PRX` packet arrived from `from`
    /// while this side has committed to a different (necessarily
    /// inner-dominated) endpoint. Returns the endpoint a fresh
    /// `PRX-SYN-ACK` should be sent to so the peer converges, per the
    /// "inner strictly dominates" rule.
    pub fn recovery_target(&self, from: SocketAddr) -> Option<SocketAddr> {
        let (selected_candidate, selected_addr) = self.selected?;
        if from == selected_addr {
            return None;
        }
        if selected_candidate == Candidate::Inner && self.candidate_of(from) == Some(Candidate::Outer) {
            Some(self.peer.inner.addr())
        } else {
            None
        }
    }

    /// Poll for probe-phase expiry. Returns `Failed` exactly once, the
    /// first time `now` passes the timeout with nothing selected yet.
    pub fn poll(&mut self, now: Instant) -> NatPunchEvent {
        if self.selected.is_some() || self.state == P2pState::Failed {
            return NatPunchEvent::Unchanged;
        }
        if now.saturating_duration_since(self.started_at) >= self.probe_timeout {
            self.state = P2pState::Failed;
            return NatPunchEvent::Failed;
        }
        NatPunchEvent::Unchanged
    }
}

const TAG_V4: u8 = 4;
const TAG_V6: u8 = 6;

/// Append `addr` to `buf` as a 1-byte family tag, 4 or 16 address
/// bytes, and a 2-byte big-endian port — the payload format for
/// `PRX-ACK` (one address) and `PRX-RST-SYN-ACK` (four, concatenated).
pub fn encode_endpoint(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(TAG_V4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(TAG_V6);
            buf.put_slice(&v6.octets());
        }
    }
    buf.put_u16(addr.port());
}

/// Decode one endpoint written by [`encode_endpoint`], returning the
/// address and the number of bytes consumed.
pub fn decode_endpoint(buf: &[u8]) -> Option<(SocketAddr, usize)> {
    let (&tag, rest) = buf.split_first()?;
    let (ip_len, ip): (usize, IpAddr) = match tag {
        TAG_V4 => {
            let octets: [u8; 4] = rest.get(..4)?.try_into().ok()?;
            (4, IpAddr::V4(Ipv4Addr::from(octets)))
        }
        TAG_V6 => {
            let octets: [u8; 16] = rest.get(..16)?.try_into().ok()?;
            (16, IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => return None,
    };
    let port_bytes = rest.get(ip_len..ip_len + 2)?;
    let port = u16::from_be_bytes(port_bytes.try_into().ok()?);
    Some((SocketAddr::new(ip, port), 1 + ip_len + 2))
}

/// Encode the `PRX-ACK` payload: this host's own inner (locally-bound)
/// address, as reported to the mediator.
pub fn encode_own_address(addr: SocketAddr) -> Bytes {
    let mut buf = BytesMut::new();
    encode_endpoint(&mut buf, addr);
    buf.freeze()
}

/// Decode the `PRX-RST-SYN-ACK` payload the mediator sends once both
/// peers have reported their inner address: this host's (inner, outer)
/// pair followed by the peer's (inner, outer) pair, in that order.
pub fn decode_endpoint_quad(buf: &[u8]) -> Option<(SocketAddr, SocketAddr, SocketAddr, SocketAddr)> {
    let mut offset = 0;
    let mut next = || {
        let (addr, len) = decode_endpoint(&buf[offset..])?;
        offset += len;
        Some(addr)
    };
    let own_inner = next()?;
    let own_outer = next()?;
    let peer_inner = next()?;
    let peer_outer = next()?;
    Some((own_inner, own_outer, peer_inner, peer_outer))
}

/// Encode the `PRX-RST-SYN-ACK` payload (see [`decode_endpoint_quad`]).
pub fn encode_endpoint_quad(
    own_inner: SocketAddr,
    own_outer: SocketAddr,
    peer_inner: SocketAddr,
    peer_outer: SocketAddr,
) -> Bytes {
    let mut buf = BytesMut::new();
    encode_endpoint(&mut buf, own_inner);
    encode_endpoint(&mut buf, own_outer);
    encode_endpoint(&mut buf, peer_inner);
    encode_endpoint(&mut buf, peer_outer);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudp_core::Endpoint;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn peer_pair() -> EndpointPair {
        EndpointPair {
            inner: Endpoint::new(addr(1)),
            outer: Endpoint::new(addr(2)),
        }
    }

    #[test]
    fn inner_ack_is_selected_immediately() {
        let mut punch = NatPunchThrough::new(peer_pair(), Instant::now(), Duration::from_secs(5));
        let event = punch.on_prx_syn_ack(addr(1));
        assert_eq!(event, NatPunchEvent::Switched(addr(1)));
        assert_eq!(punch.state(), P2pState::Established);
    }

    #[test]
    fn inner_ack_overrides_prior_outer_selection() {
        let mut punch = NatPunchThrough::new(peer_pair(), Instant::now(), Duration::from_secs(5));
        punch.on_prx_syn_ack(addr(2));
        assert_eq!(punch.selected_endpoint(), Some(addr(2)));

        let event = punch.on_prx_syn_ack(addr(1));
        assert_eq!(event, NatPunchEvent::Switched(addr(1)));
        assert_eq!(punch.selected_endpoint(), Some(addr(1)));
    }

    #[test]
    fn outer_ack_does_not_override_inner_selection() {
        let mut punch = NatPunchThrough::new(peer_pair(), Instant::now(), Duration::from_secs(5));
        punch.on_prx_syn_ack(addr(1));
        let event = punch.on_prx_syn_ack(addr(2));
        assert_eq!(event, NatPunchEvent::Unchanged);
        assert_eq!(punch.selected_endpoint(), Some(addr(1)));
    }

    #[test]
    fn asymmetric_recovery_targets_inner_endpoint() {
        let mut punch = NatPunchThrough::new(peer_pair(), Instant::now(), Duration::from_secs(5));
        punch.on_prx_syn_ack(addr(1));
        assert_eq!(punch.recovery_target(addr(2)), Some(addr(1)));
        assert_eq!(punch.recovery_target(addr(1)), None);
    }

    #[test]
    fn endpoint_quad_roundtrips() {
        let a = addr(1);
        let b = addr(2);
        let c = addr(3);
        let d = addr(4);
        let encoded = encode_endpoint_quad(a, b, c, d);
        assert_eq!(decode_endpoint_quad(&encoded), Some((a, b, c, d)));
    }

    #[test]
    fn single_endpoint_roundtrips() {
        let a = addr(42);
        let encoded = encode_own_address(a);
        assert_eq!(decode_endpoint(&encoded), Some((a, encoded.len())));
    }

    #[test]
    fn due_for_probe_is_rate_limited() {
        let start = Instant::now();
        let mut punch = NatPunchThrough::new(peer_pair(), start, Duration::from_secs(5));
        assert!(punch.due_for_probe(start, Duration::from_millis(100)));
        assert!(!punch.due_for_probe(start + Duration::from_millis(50), Duration::from_millis(100)));
        assert!(punch.due_for_probe(start + Duration::from_millis(150), Duration::from_millis(100)));
    }

    #[test]
    fn probe_times_out_without_any_ack() {
        let start = Instant::now();
        let mut punch = NatPunchThrough::new(peer_pair(), start, Duration::from_millis(100));
        assert_eq!(punch.poll(start + Duration::from_millis(50)), NatPunchEvent::Unchanged);
        assert_eq!(punch.poll(start + Duration::from_millis(150)), NatPunchEvent::Failed);
        assert_eq!(punch.state(), P2pState::Failed);
    }
}

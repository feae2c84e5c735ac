//! Canonicalized socket addresses.
//!
//! The mediator keys its pair map by the addresses peers are observed
//! sending from. Two sockaddrs that are semantically the same host
//! (an IPv4 address and its IPv4-mapped IPv6 form) must hash and compare
//! equal, so the map key canonicalizes on construction rather than
//! comparing the raw `SocketAddr` bit pattern.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A socket address canonicalized to `(family, address-bytes, port)`.
///
/// Construct via `From<SocketAddr>`; the wrapped address is always in
/// its canonical form, so derived `Eq`/`Hash`/`Ord` are structural and
/// correct for use as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Wrap a socket address, canonicalizing IPv4-mapped IPv6 forms down
    /// to plain IPv4 so the two compare equal.
    pub fn new(addr: SocketAddr) -> Self {
        let canonical = match addr.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
                None => addr,
            },
            IpAddr::V4(_) => addr,
        };
        Self(canonical)
    }

    /// The underlying canonical socket address.
    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    /// The canonical port.
    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Endpoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        SocketAddr::deserialize(deserializer).map(Endpoint::new)
    }
}

/// A peer's (inner, outer) address pair as observed by a NAT-traversal
/// mediator: `inner` is the address the peer believes it bound to,
/// `outer` is the address the mediator actually saw packets arrive
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    /// The peer's locally-bound (pre-NAT) address.
    pub inner: Endpoint,
    /// The address observed by the remote side (post-NAT).
    pub outer: Endpoint,
}

impl EndpointPair {
    /// Construct a pair from raw socket addresses.
    pub fn new(inner: SocketAddr, outer: SocketAddr) -> Self {
        Self {
            inner: Endpoint::new(inner),
            outer: Endpoint::new(outer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn ipv4_mapped_ipv6_canonicalizes_to_ipv4() {
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 4000);
        let mapped = SocketAddr::new(
            IpAddr::V6(Ipv4Addr::new(203, 0, 113, 5).to_ipv6_mapped()),
            4000,
        );

        assert_eq!(Endpoint::new(v4), Endpoint::new(mapped));
    }

    #[test]
    fn distinct_ports_are_distinct_endpoints() {
        let a = Endpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1));
        let b = Endpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2));
        assert_ne!(a, b);
    }

    #[test]
    fn genuinely_distinct_v6_addresses_stay_distinct() {
        let a = Endpoint::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 1));
        let b = Endpoint::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 1));
        assert_ne!(a, b);
    }
}

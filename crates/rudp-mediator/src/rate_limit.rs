//! Per-address inbound packet rate limiting.
//!
//! A fixed-window counter rather than a token bucket: the mediator
//! only needs a coarse packets/sec cap to blunt a flood from a single
//! address, not smooth traffic shaping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rudp_core::Endpoint;

struct Window {
    started_at: Instant,
    count: u32,
}

/// Caps inbound packets per address to `limit` per rolling one-second
/// window. A `limit` of zero disables the cap.
pub struct RateLimiter {
    limit: u32,
    windows: HashMap<Endpoint, Window>,
}

const WINDOW: Duration = Duration::from_secs(1);

impl RateLimiter {
    /// Construct a limiter admitting up to `limit` packets/sec per
    /// address.
    pub fn new(limit: u32) -> Self {
        Self { limit, windows: HashMap::new() }
    }

    /// Record one inbound packet from `addr` at `now`, returning
    /// whether it should be admitted.
    pub fn admit(&mut self, addr: Endpoint, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }

        let window = self.windows.entry(addr).or_insert(Window { started_at: now, count: 0 });
        if now.saturating_duration_since(window.started_at) >= WINDOW {
            window.started_at = now;
            window.count = 0;
        }

        window.count += 1;
        window.count <= self.limit
    }

    /// Drop tracking state for addresses idle for longer than `idle_for`.
    pub fn evict_stale(&mut self, now: Instant, idle_for: Duration) {
        self.windows.retain(|_, w| now.saturating_duration_since(w.started_at) < idle_for);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> Endpoint {
        Endpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000))
    }

    #[test]
    fn admits_up_to_the_limit_then_rejects() {
        let mut limiter = RateLimiter::new(2);
        let now = Instant::now();
        assert!(limiter.admit(addr(), now));
        assert!(limiter.admit(addr(), now));
        assert!(!limiter.admit(addr(), now));
    }

    #[test]
    fn resets_after_the_window_elapses() {
        let mut limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert!(limiter.admit(addr(), now));
        assert!(!limiter.admit(addr(), now));
        assert!(limiter.admit(addr(), now + Duration::from_secs(2)));
    }

    #[test]
    fn zero_limit_disables_the_cap() {
        let mut limiter = RateLimiter::new(0);
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.admit(addr(), now));
        }
    }
}

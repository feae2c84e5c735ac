//! Congestion control: a pluggable black box the send queue consults
//! before admitting a datagram.
//!
//! A TLS-over-UDP tunnel leans on TCP or a fixed-rate channel and does
//! no window management of its own, so this follows the classic AIMD
//! shape (additive increase, multiplicative decrease on RTO) as a
//! small struct-plus-`impl` pair rather than a standalone crate.

use std::time::{Duration, Instant};

/// Observes traffic and gates outbound admission. Implementations must
/// never block control messages (`is_control = true` always admitted).
pub trait CongestionControl: std::fmt::Debug + Send {
    /// Whether a datagram of `len` bytes may be sent right now.
    fn can_send(&self, now: Instant, len: usize, is_control: bool) -> bool;

    /// Record that a datagram of `len` bytes was just sent.
    fn on_send(&mut self, now: Instant, len: usize);

    /// Observe an inbound packet: `sn` is its non-wrapping sequence
    /// number, `rtt` a fresh sample if one was taken this packet.
    fn on_receive(&mut self, now: Instant, rtt: Option<Duration>, sn: u64, len: usize);

    /// The RTO timer fired: back off hard.
    fn on_rto(&mut self, now: Instant);
}

/// Default byte-oriented AIMD window: grows by one MSS per
/// newly-acknowledged packet, halves on RTO, floored and ceilinged.
#[derive(Debug, Clone)]
pub struct WindowCongestionControl {
    window: f64,
    min_window: f64,
    max_window: f64,
    mss: f64,
    bytes_in_flight: usize,
    highest_seen_sn: Option<u64>,
}

impl WindowCongestionControl {
    /// Construct with an initial window and hard floor/ceiling, both
    /// in bytes.
    pub fn new(initial_window: usize, min_window: usize, max_window: usize, mss: usize) -> Self {
        Self {
            window: initial_window as f64,
            min_window: min_window as f64,
            max_window: max_window as f64,
            mss: mss as f64,
            bytes_in_flight: 0,
            highest_seen_sn: None,
        }
    }

    /// Current congestion window, in bytes.
    pub fn window(&self) -> usize {
        self.window as usize
    }
}

impl CongestionControl for WindowCongestionControl {
    fn can_send(&self, _now: Instant, len: usize, is_control: bool) -> bool {
        is_control || self.bytes_in_flight + len <= self.window as usize
    }

    fn on_send(&mut self, _now: Instant, len: usize) {
        self.bytes_in_flight += len;
    }

    fn on_receive(&mut self, _now: Instant, _rtt: Option<Duration>, sn: u64, len: usize) {
        let advances = !matches!(self.highest_seen_sn, Some(h) if sn <= h);
        if !advances {
            return;
        }
        self.highest_seen_sn = Some(sn);
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(len);
        self.window = (self.window + self.mss).min(self.max_window);
    }

    fn on_rto(&mut self, _now: Instant) {
        self.window = (self.window / 2.0).max(self.min_window);
        self.bytes_in_flight = 0;
    }
}

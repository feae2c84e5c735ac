//! Smoothed round-trip time and retransmission-timeout estimation.
//!
//! Generalizes the shape of a classic SRTT/RTTVAR estimator (the same
//! one RFC 6298-style TCP stacks use) with two extensions the transport
//! needs on top: exponential backoff tracked via `expCount`, reset by
//! any received packet, and a NAK threshold distinct from the RTO.

use std::time::{Duration, Instant};

use crate::constants::{INITIAL_RTO, RTT_ALPHA, TICK};

/// An outstanding RTT probe: at most one may be in flight at a time.
#[derive(Debug, Clone, Copy)]
struct RttRequest {
    sequence_number: u16,
    sent_at: Instant,
}

/// Smoothed round-trip-time and retransmission-timeout state for one
/// connection.
#[derive(Debug)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Option<Duration>,
    exp_count: u32,
    outstanding_request: Option<RttRequest>,
}

impl RttEstimator {
    /// A fresh estimator with no samples yet.
    pub fn new() -> Self {
        Self {
            srtt: None,
            rttvar: None,
            exp_count: 0,
            outstanding_request: None,
        }
    }

    /// Incorporate a fresh RTT sample.
    pub fn on_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = abs_diff(srtt, sample);
                self.rttvar = Some(blend(rttvar, diff, RTT_ALPHA));
                self.srtt = Some(blend(srtt, sample, RTT_ALPHA));
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
    }

    /// Smoothed RTT, if any sample has been taken.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// The unbacked-off RTO: `srtt + 4*rttvar`, or the initial default
    /// before any sample has been taken.
    fn base_rto(&self) -> Duration {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => srtt + rttvar * 4,
            _ => INITIAL_RTO,
        }
    }

    /// The RTO actually used to schedule retransmission: the base RTO
    /// scaled by `1 + expCount` (exponential backoff) plus one tick,
    /// clamped to `[MIN_RTO, MAX_RTO]`.
    pub fn rto(&self) -> Duration {
        let scaled = self.base_rto().mul_f64(1.0 + self.exp_count as f64) + TICK;
        clamp(scaled, crate::constants::MIN_RTO, crate::constants::MAX_RTO)
    }

    /// Threshold past which a missing sequence number is worth NAKing:
    /// `4*srtt + rttvar + TICK`, or one second before any sample exists
    /// (conservative: avoids spurious NAKs while RTT is unknown).
    pub fn nak_threshold(&self) -> Duration {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => srtt * 4 + rttvar + TICK,
            _ => Duration::from_secs(1),
        }
    }

    /// Current exponential-backoff count.
    pub fn exp_count(&self) -> u32 {
        self.exp_count
    }

    /// Called when the RTO timer fires (a retransmission was needed):
    /// backs off the next RTO.
    pub fn on_rto_fired(&mut self) {
        self.exp_count += 1;
    }

    /// Called on receipt of any packet: reverts backoff to the
    /// unbacked-off RTO.
    pub fn on_packet_received(&mut self) {
        self.exp_count = 0;
    }

    /// Whether a new RTT request may be issued: only if no request is
    /// outstanding, or the previous one has aged past both the current
    /// RTO and one tick.
    pub fn should_issue_rtt_request(&self, now: Instant) -> bool {
        match self.outstanding_request {
            None => true,
            Some(req) => {
                let elapsed = now.saturating_duration_since(req.sent_at);
                elapsed > self.rto() && elapsed > TICK
            }
        }
    }

    /// Record that an RTT request was just sent.
    pub fn issue_rtt_request(&mut self, sequence_number: u16, now: Instant) {
        self.outstanding_request = Some(RttRequest {
            sequence_number,
            sent_at: now,
        });
    }

    /// Process a matching RTT response. `response_delay` is the
    /// responder's measured processing delay, subtracted out of the
    /// sampled RTT. Non-matching sequence numbers are ignored.
    pub fn on_rtt_response(&mut self, sequence_number: u16, response_delay: Duration, now: Instant) {
        let Some(req) = self.outstanding_request else {
            return;
        };
        if req.sequence_number != sequence_number {
            return;
        }
        let elapsed = now.saturating_duration_since(req.sent_at);
        let sample = elapsed.checked_sub(response_delay).unwrap_or(Duration::ZERO);
        self.on_sample(sample);
        self.outstanding_request = None;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

fn blend(old: Duration, sample: Duration, alpha: f64) -> Duration {
    old.mul_f64(1.0 - alpha) + sample.mul_f64(alpha)
}

fn clamp(value: Duration, min: Duration, max: Duration) -> Duration {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rto_stays_within_bounds_before_and_after_samples() {
        let mut est = RttEstimator::new();
        assert!(est.rto() >= crate::constants::MIN_RTO);
        assert!(est.rto() <= crate::constants::MAX_RTO);

        est.on_sample(Duration::from_millis(50));
        for _ in 0..20 {
            est.on_rto_fired();
        }
        assert!(est.rto() <= crate::constants::MAX_RTO);
    }

    #[test]
    fn received_packet_resets_exp_count() {
        let mut est = RttEstimator::new();
        est.on_sample(Duration::from_millis(100));
        let unbacked = est.rto();

        est.on_rto_fired();
        est.on_rto_fired();
        assert!(est.rto() > unbacked);

        est.on_packet_received();
        assert_eq!(est.exp_count(), 0);
        assert_eq!(est.rto(), unbacked);
    }

    #[test]
    fn first_sample_sets_rttvar_to_half_srtt() {
        let mut est = RttEstimator::new();
        est.on_sample(Duration::from_millis(80));
        assert_eq!(est.srtt(), Some(Duration::from_millis(80)));
    }
}

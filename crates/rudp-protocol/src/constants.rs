//! Protocol-wide numeric constants not carried by `Config`.

use std::time::Duration;

/// Cooperative scheduler quantum: the lower bound on output-coalescing
/// latency and the granularity `exposed rto` is padded by.
pub const TICK: Duration = Duration::from_millis(10);

/// Floor on the exposed (post-backoff) RTO.
pub const MIN_RTO: Duration = Duration::from_millis(100);

/// Ceiling on the exposed (post-backoff) RTO.
pub const MAX_RTO: Duration = Duration::from_secs(3);

/// Smoothing factor for SRTT/RTTVAR updates (RFC 6298 names this alpha).
pub const RTT_ALPHA: f64 = 0.125;

/// RTO used before the first RTT sample is taken. Matches the literal
/// client-handshake-retransmit scenario of "receives nothing within
/// RTO = 500ms".
pub const INITIAL_RTO: Duration = Duration::from_millis(500);

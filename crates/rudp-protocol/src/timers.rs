//! Connection timers.
//!
//! Modeled on `tokio::time::interval` polling in a periodic cleanup
//! task, but per-connection and generalized behind a `TimerHost`
//! capability (spec.md §9 REDESIGN FLAGS) rather than hard-wiring
//! `tokio::time`: `ConnectionTimers` allocates its heartbeat and RTO
//! deadlines through `make_timer`/`schedule_timer`/`free_timer` and is
//! itself the only implementor, but a caller that wanted a different
//! scheduler (a wheel timer, a mocked clock) could swap one in without
//! touching the handshake/ACK logic that drives this module.
//!
//! The connection-lifetime timeouts (warning/timeout/initial-connect)
//! are level-triggered off a single `last_inbound` anchor re-evaluated
//! every `poll`, rather than scheduled deadlines — three one-shot
//! timers recomputed from the same anchor on every inbound packet
//! would just be `last_inbound + constant` recomputed each time poll
//! already does the comparison, so they stay plain field comparisons.
//! The container drives `poll` every `TICK`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Opaque handle to a timer allocated through [`TimerHost::make_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u32);

/// Host capability for scheduling a connection's one-shot timers,
/// generalized from `EmiP2PSock`'s delegate-provided
/// `makeTimer`/`scheduleTimer`/`freeTimer` callbacks.
pub trait TimerHost {
    /// Allocate a new timer, initially unscheduled.
    fn make_timer(&mut self) -> TimerId;
    /// (Re)schedule `timer` to fire at `deadline`.
    fn schedule_timer(&mut self, timer: TimerId, deadline: Instant);
    /// Cancel `timer`, if scheduled.
    fn free_timer(&mut self, timer: TimerId);
}

/// A timer condition that became true since the last `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The RTO timer expired — the sender buffer has an entry due for
    /// retransmission.
    Rto,
    /// Time to send a heartbeat (no outbound packet since the last
    /// heartbeat interval elapsed).
    Heartbeat,
    /// No inbound packet for `connectionWarningTimeout`.
    ConnectionLost,
    /// Inbound traffic resumed after a `ConnectionLost` warning.
    ConnectionRegained,
    /// No inbound packet for `connectionTimeout` — the connection must
    /// be torn down.
    ConnectionTimedOut,
    /// No inbound packet within `initialConnectTimeout`, before the
    /// connection ever opened.
    InitialConnectTimedOut,
}

/// Tracks the handful of deadlines a connection cares about and
/// reports which fired on each `poll`.
#[derive(Debug)]
pub struct ConnectionTimers {
    timers: HashMap<TimerId, Instant>,
    next_timer_id: u32,
    heartbeat_timer: TimerId,
    rto_timer: TimerId,
    heartbeat_interval: Duration,
    last_inbound: Instant,
    connection_timeout: Duration,
    connection_warning_timeout: Duration,
    initial_connect_timeout: Duration,
    opened: bool,
    warned: bool,
    timed_out: bool,
}

impl TimerHost for ConnectionTimers {
    fn make_timer(&mut self) -> TimerId {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        id
    }

    fn schedule_timer(&mut self, timer: TimerId, deadline: Instant) {
        self.timers.insert(timer, deadline);
    }

    fn free_timer(&mut self, timer: TimerId) {
        self.timers.remove(&timer);
    }
}

impl ConnectionTimers {
    /// Construct with the connection's configured intervals. Starts in
    /// the not-yet-open state, so `initial_connect_timeout` governs
    /// until [`Self::mark_opened`] is called.
    pub fn new(
        now: Instant,
        heartbeat_interval: Duration,
        connection_timeout: Duration,
        connection_warning_timeout: Duration,
        initial_connect_timeout: Duration,
    ) -> Self {
        let mut timers = Self {
            timers: HashMap::new(),
            next_timer_id: 0,
            heartbeat_timer: TimerId(0),
            rto_timer: TimerId(0),
            heartbeat_interval,
            last_inbound: now,
            connection_timeout,
            connection_warning_timeout,
            initial_connect_timeout,
            opened: false,
            warned: false,
            timed_out: false,
        };
        timers.heartbeat_timer = timers.make_timer();
        timers.rto_timer = timers.make_timer();
        timers.schedule_timer(timers.heartbeat_timer, now + heartbeat_interval);
        timers
    }

    /// Switch from the initial-connect timeout to the steady-state
    /// connection timeout.
    pub fn mark_opened(&mut self) {
        self.opened = true;
    }

    /// Record that a datagram was just sent: pushes the heartbeat
    /// deadline back out.
    pub fn on_outbound_sent(&mut self, now: Instant) {
        self.schedule_timer(self.heartbeat_timer, now + self.heartbeat_interval);
    }

    /// Record that a datagram was just received: resets the connection
    /// (or initial-connect) timeout clock.
    pub fn on_inbound_received(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// Schedule (or reschedule) the RTO timer for `deadline`, normally
    /// the sender buffer's earliest registration time plus the current
    /// RTO.
    pub fn schedule_rto(&mut self, deadline: Instant) {
        self.schedule_timer(self.rto_timer, deadline);
    }

    /// Clear the RTO timer — called once the sender buffer empties.
    pub fn clear_rto(&mut self) {
        self.free_timer(self.rto_timer);
    }

    fn active_timeout(&self) -> Duration {
        if self.opened {
            self.connection_timeout
        } else {
            self.initial_connect_timeout
        }
    }

    /// The next instant worth calling `poll` again for — the caller's
    /// tick loop may sleep until this deadline (clamped to `TICK`
    /// granularity by the container).
    pub fn next_deadline(&self) -> Instant {
        let mut deadline = self.timers.get(&self.heartbeat_timer).copied().unwrap_or(self.last_inbound);
        if let Some(rto) = self.timers.get(&self.rto_timer) {
            deadline = deadline.min(*rto);
        }
        deadline.min(self.last_inbound + self.active_timeout())
    }

    /// Advance to `now`, returning every timer condition that newly
    /// fired. The RTO timer is left armed — callers clear or
    /// reschedule it explicitly once they've handled the retransmit.
    pub fn poll(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut events = Vec::new();

        if matches!(self.timers.get(&self.rto_timer), Some(deadline) if now >= *deadline) {
            events.push(TimerEvent::Rto);
        }

        if matches!(self.timers.get(&self.heartbeat_timer), Some(deadline) if now >= *deadline) {
            events.push(TimerEvent::Heartbeat);
            self.schedule_timer(self.heartbeat_timer, now + self.heartbeat_interval);
        }

        let elapsed = now.saturating_duration_since(self.last_inbound);
        if self.opened {
            if elapsed >= self.connection_timeout && !self.timed_out {
                self.timed_out = true;
                events.push(TimerEvent::ConnectionTimedOut);
            } else if elapsed >= self.connection_warning_timeout && !self.warned {
                self.warned = true;
                events.push(TimerEvent::ConnectionLost);
            } else if elapsed < self.connection_warning_timeout && self.warned {
                self.warned = false;
                events.push(TimerEvent::ConnectionRegained);
            }
        } else if elapsed >= self.initial_connect_timeout && !self.timed_out {
            self.timed_out = true;
            events.push(TimerEvent::InitialConnectTimedOut);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers_at(now: Instant) -> ConnectionTimers {
        let mut t = ConnectionTimers::new(
            now,
            Duration::from_millis(100),
            Duration::from_secs(10),
            Duration::from_secs(3),
            Duration::from_secs(2),
        );
        t.mark_opened();
        t
    }

    #[test]
    fn heartbeat_fires_once_and_reschedules() {
        let now = Instant::now();
        let mut t = timers_at(now);
        assert!(t.poll(now + Duration::from_millis(50)).is_empty());
        let events = t.poll(now + Duration::from_millis(150));
        assert!(events.contains(&TimerEvent::Heartbeat));
    }

    #[test]
    fn outbound_send_resets_heartbeat() {
        let now = Instant::now();
        let mut t = timers_at(now);
        t.on_outbound_sent(now + Duration::from_millis(90));
        assert!(t.poll(now + Duration::from_millis(150)).is_empty());
    }

    #[test]
    fn connection_lost_then_regained() {
        let now = Instant::now();
        let mut t = timers_at(now);
        let events = t.poll(now + Duration::from_secs(4));
        assert!(events.contains(&TimerEvent::ConnectionLost));

        t.on_inbound_received(now + Duration::from_secs(4));
        let events = t.poll(now + Duration::from_secs(4) + Duration::from_millis(10));
        assert!(events.contains(&TimerEvent::ConnectionRegained));
    }

    #[test]
    fn initial_connect_timeout_is_shorter_than_steady_state() {
        let now = Instant::now();
        let mut t = ConnectionTimers::new(
            now,
            Duration::from_millis(100),
            Duration::from_secs(10),
            Duration::from_secs(3),
            Duration::from_secs(2),
        );
        let events = t.poll(now + Duration::from_secs(3));
        assert!(events.contains(&TimerEvent::InitialConnectTimedOut));
    }

    #[test]
    fn rto_fires_and_stays_armed_until_cleared() {
        let now = Instant::now();
        let mut t = timers_at(now);
        t.schedule_rto(now + Duration::from_millis(500));
        let events = t.poll(now + Duration::from_millis(600));
        assert!(events.contains(&TimerEvent::Rto));
        t.clear_rto();
        assert!(!t.poll(now + Duration::from_millis(700)).contains(&TimerEvent::Rto));
    }
}

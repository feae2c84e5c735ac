//! Sender buffer: retains reliable messages until acknowledged.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rudp_core::Channel;

use crate::flags::MessageFlags;
use crate::{Error, Result};

/// One reliable message awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct SenderEntry {
    /// Serialized message body.
    pub body: Bytes,
    /// Message flags as originally sent (split bits, SYN/RST, …).
    pub flags: MessageFlags,
    /// Channel the message was sent on.
    pub channel: Channel,
    /// Non-wrapping sequence number.
    pub non_wrapping_sn: u64,
    /// When this entry was registered (used for RTO scheduling, not
    /// wall-clock retransmit count).
    pub registered_at: Instant,
}

/// Retains reliable messages, indexed by `(channel, non-wrapping SN)`,
/// until the peer acknowledges them or the connection closes.
///
/// Invariant: `total_bytes() <= capacity` after every operation.
#[derive(Debug)]
pub struct SenderBuffer {
    capacity: usize,
    total_bytes: usize,
    entries: BTreeMap<(Channel, u64), SenderEntry>,
}

impl SenderBuffer {
    /// Create a sender buffer with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            total_bytes: 0,
            entries: BTreeMap::new(),
        }
    }

    /// Total bytes currently buffered across all channels.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Configured byte capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether there are no outstanding reliable messages.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Predicts whether `data_len` additional bytes (across
    /// `num_messages` messages) would fit without exceeding capacity.
    /// This is the authoritative admission check — callers must not
    /// register a message `fits_into_buffer` rejected.
    pub fn fits_into_buffer(&self, data_len: usize, num_messages: usize) -> bool {
        let _ = num_messages;
        self.total_bytes + data_len <= self.capacity
    }

    /// Register a reliable message. Refuses if it would exceed
    /// capacity — callers should have pre-checked with
    /// `fits_into_buffer`.
    pub fn register(
        &mut self,
        channel: Channel,
        non_wrapping_sn: u64,
        flags: MessageFlags,
        body: Bytes,
        now: Instant,
    ) -> Result<()> {
        if !self.fits_into_buffer(body.len(), 1) {
            return Err(Error::SendBufferOverflow);
        }
        self.total_bytes += body.len();
        self.entries.insert(
            (channel, non_wrapping_sn),
            SenderEntry {
                body,
                flags,
                channel,
                non_wrapping_sn,
                registered_at: now,
            },
        );
        Ok(())
    }

    /// Drop all entries on `channel` with sequence number `<= sn`.
    pub fn deregister_up_to(&mut self, channel: Channel, sn: u64) {
        let keys: Vec<_> = self
            .entries
            .range((channel, 0)..=(channel, sn))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                self.total_bytes -= entry.body.len();
            }
        }
    }

    /// Drop a single acknowledged entry (used for SACK processing,
    /// which may ack an SN out of cumulative order).
    pub fn deregister_one(&mut self, channel: Channel, sn: u64) {
        if let Some(entry) = self.entries.remove(&(channel, sn)) {
            self.total_bytes -= entry.body.len();
        }
    }

    /// Earliest registration time among all outstanding entries, used
    /// to schedule the RTO timer.
    pub fn earliest_registered_at(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.registered_at).min()
    }

    /// Visit every entry whose `registered_at + rto_at_schedule <= now`
    /// — i.e. is due for retransmission. Entries remain in the buffer;
    /// they are only removed once acknowledged.
    pub fn each_current_message(
        &self,
        now: Instant,
        rto_at_schedule: Duration,
        mut sink: impl FnMut(&SenderEntry),
    ) {
        for entry in self.entries.values() {
            if entry.registered_at + rto_at_schedule <= now {
                sink(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_is_rejected_without_mutating_state() {
        let mut buf = SenderBuffer::new(2048);
        let now = Instant::now();
        buf.register(Channel::Control, 0, MessageFlags::NONE, Bytes::from(vec![0u8; 1024]), now)
            .unwrap();
        buf.register(Channel::Control, 1, MessageFlags::NONE, Bytes::from(vec![0u8; 1024]), now)
            .unwrap();
        assert_eq!(buf.total_bytes(), 2048);

        let err = buf.register(Channel::Control, 2, MessageFlags::NONE, Bytes::from(vec![0u8; 1]), now);
        assert!(matches!(err, Err(Error::SendBufferOverflow)));
        assert_eq!(buf.total_bytes(), 2048);
    }

    #[test]
    fn deregister_up_to_drops_all_lower_or_equal_entries() {
        let mut buf = SenderBuffer::new(4096);
        let now = Instant::now();
        for sn in 0..4u64 {
            buf.register(Channel::Control, sn, MessageFlags::NONE, Bytes::from_static(b"x"), now)
                .unwrap();
        }
        buf.deregister_up_to(Channel::Control, 2);
        assert_eq!(buf.total_bytes(), 1);
        assert!(!buf.is_empty());
    }
}

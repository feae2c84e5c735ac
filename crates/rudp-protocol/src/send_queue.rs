//! Send queue: coalesces outgoing messages into MTU-bounded datagrams.
//!
//! A tunnel that sends one packet per message has no analogue for this
//! coalescing step; built fresh, using `bytes::BytesMut` for
//! serialization scratch space and small `Result`-returning methods in
//! the same idiom as the rest of this crate.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::BytesMut;

use crate::congestion::CongestionControl;
use crate::header::{Datagram, Message, PacketHeader};

/// Accumulates outgoing messages for the next datagram, prioritizing
/// control traffic over data and deferring to congestion control for
/// data-channel admission.
#[derive(Debug, Default)]
pub struct SendQueue {
    control: VecDeque<Message>,
    data: VecDeque<Message>,
}

impl SendQueue {
    /// An empty send queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything is queued.
    pub fn is_empty(&self) -> bool {
        self.control.is_empty() && self.data.is_empty()
    }

    /// Queue a message for the next flush. Control messages (channel
    /// qualifier `-1`) are never subject to congestion admission; data
    /// messages are dropped (not queued) if `congestion` refuses them —
    /// the caller's reliable retransmit, if any, will re-offer it.
    /// Returns whether the message was admitted.
    pub fn enqueue_message(
        &mut self,
        message: Message,
        congestion: &dyn CongestionControl,
        now: Instant,
    ) -> bool {
        if message.header.channel.is_control() {
            self.control.push_back(message);
            return true;
        }
        if !congestion.can_send(now, message.encoded_len(), false) {
            return false;
        }
        self.data.push_back(message);
        true
    }

    /// Flush the current batch into a single datagram under `header`,
    /// which may itself carry an ACK/NAK/RTT-request. Returns `None`
    /// (nothing sent) only if the queue is empty and the header carries
    /// no information of its own — an ACK-only or heartbeat packet
    /// still produces a datagram with zero messages.
    pub fn flush(&mut self, header: PacketHeader, mtu: usize) -> Option<Datagram> {
        let mut budget = mtu.saturating_sub(header_encoded_len(&header));
        let mut messages = Vec::new();

        while let Some(msg) = self.control.front() {
            if msg.encoded_len() > budget {
                break;
            }
            let msg = self.control.pop_front().expect("front just checked");
            budget -= msg.encoded_len();
            messages.push(msg);
        }
        while let Some(msg) = self.data.front() {
            if msg.encoded_len() > budget {
                break;
            }
            let msg = self.data.pop_front().expect("front just checked");
            budget -= msg.encoded_len();
            messages.push(msg);
        }

        if messages.is_empty() && !header_carries_information(&header) {
            return None;
        }
        Some(Datagram { header, messages })
    }

    /// A bare heartbeat: a packet header with only its own sequence
    /// number, and whatever control/data happens to be queued.
    pub fn heartbeat(&mut self, sequence_number: u16, mtu: usize) -> Option<Datagram> {
        self.flush(
            PacketHeader {
                sequence_number: Some(sequence_number),
                ..Default::default()
            },
            mtu,
        )
    }

    /// An ACK-only datagram, bypassing the message queues entirely.
    pub fn ack_only(sequence_number: u16, ack_sequence_number: u16) -> Datagram {
        Datagram {
            header: PacketHeader {
                sequence_number: Some(sequence_number),
                ack_sequence_number: Some(ack_sequence_number),
                ..Default::default()
            },
            messages: Vec::new(),
        }
    }

    /// A NAK-only datagram.
    pub fn nak_only(sequence_number: u16, nak_sequence_number: u16) -> Datagram {
        Datagram {
            header: PacketHeader {
                sequence_number: Some(sequence_number),
                nak_sequence_number: Some(nak_sequence_number),
                ..Default::default()
            },
            messages: Vec::new(),
        }
    }

    /// An RTT-response-only datagram.
    pub fn rtt_response_only(
        sequence_number: u16,
        response: crate::header::RttResponse,
    ) -> Datagram {
        Datagram {
            header: PacketHeader {
                sequence_number: Some(sequence_number),
                rtt_response: Some(response),
                ..Default::default()
            },
            messages: Vec::new(),
        }
    }
}

fn header_encoded_len(header: &PacketHeader) -> usize {
    let mut buf = BytesMut::new();
    header.write(&mut buf);
    buf.len()
}

fn header_carries_information(header: &PacketHeader) -> bool {
    header.ack_sequence_number.is_some()
        || header.nak_sequence_number.is_some()
        || header.rtt_request_sequence_number.is_some()
        || header.rtt_response.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::WindowCongestionControl;
    use crate::flags::MessageFlags;
    use crate::header::MessageHeader;
    use bytes::Bytes;
    use rudp_core::Channel;

    fn data_message(channel: Channel, sn: u16, body: &'static [u8]) -> Message {
        Message {
            header: MessageHeader {
                flags: MessageFlags::NONE,
                channel,
                sequence_number: sn,
                length: body.len() as u16,
            },
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn control_messages_never_wait_on_congestion() {
        let mut queue = SendQueue::new();
        let cc = WindowCongestionControl::new(0, 0, 0, 1200);
        let admitted = queue.enqueue_message(
            data_message(Channel::Control, 0, b"syn"),
            &cc,
            Instant::now(),
        );
        assert!(admitted);
        assert!(!queue.is_empty());
    }

    #[test]
    fn data_message_refused_by_congestion_is_dropped_not_queued() {
        let mut queue = SendQueue::new();
        let cc = WindowCongestionControl::new(0, 0, 0, 1200);
        let channel = Channel::Data(rudp_core::ChannelId::new(
            rudp_core::ChannelType::Unreliable,
            0,
        ));
        let admitted = queue.enqueue_message(data_message(channel, 0, b"hi"), &cc, Instant::now());
        assert!(!admitted);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_with_no_queue_and_plain_header_sends_nothing() {
        let mut queue = SendQueue::new();
        let header = PacketHeader {
            sequence_number: Some(1),
            ..Default::default()
        };
        assert!(queue.flush(header, 1400).is_none());
    }

    #[test]
    fn flush_respects_mtu_budget() {
        let mut queue = SendQueue::new();
        let cc = WindowCongestionControl::new(usize::MAX, 0, usize::MAX, 1200);
        let channel = Channel::Data(rudp_core::ChannelId::new(
            rudp_core::ChannelType::Unreliable,
            0,
        ));
        for i in 0..3u16 {
            queue.enqueue_message(data_message(channel, i, b"0123456789"), &cc, Instant::now());
        }
        let header = PacketHeader {
            sequence_number: Some(0),
            ..Default::default()
        };
        // Budget for only one 19-byte message (9-byte header + 10-byte body) plus the 1-byte packet header flags.
        let datagram = queue.flush(header, 20).unwrap();
        assert_eq!(datagram.messages.len(), 1);
        assert!(!queue.is_empty());
    }
}

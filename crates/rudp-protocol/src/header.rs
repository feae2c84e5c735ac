//! Packet and message header codecs — the on-wire framing.
//!
//! A datagram is one packet header followed by zero or more messages,
//! each with its own message header. Every optional packet-header field
//! is gated by a flag bit so a bare heartbeat costs one byte.

use bytes::{BufMut, Bytes, BytesMut};

use rudp_core::Channel;

use crate::flags::{packet_bit, MessageFlags};
use crate::{Error, Result};

/// An RTT-response field: the sequence number being answered and the
/// processing delay (microseconds) the responder measured before
/// replying, subtracted out of the sampled RTT by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttResponse {
    /// Sequence number of the RTT request being answered.
    pub sequence_number: u16,
    /// Delay between receiving the request and sending this response.
    pub delay_micros: u32,
}

/// Per-datagram header: always present, carries only the optional
/// fields actually in use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// This datagram's own sequence number (almost always present;
    /// absent only for certain mediator-forwarded relay traffic).
    pub sequence_number: Option<u16>,
    /// Cumulative ACK up to this sequence number.
    pub ack_sequence_number: Option<u16>,
    /// Selective NAK for this sequence number.
    pub nak_sequence_number: Option<u16>,
    /// An RTT sample is being requested; carries the probe's own SN.
    pub rtt_request_sequence_number: Option<u16>,
    /// Answers an earlier RTT request.
    pub rtt_response: Option<RttResponse>,
}

impl PacketHeader {
    fn flags(&self) -> u8 {
        let mut f = 0u8;
        if self.sequence_number.is_some() {
            f |= packet_bit::SEQUENCE_NUMBER;
        }
        if self.ack_sequence_number.is_some() {
            f |= packet_bit::ACK;
        }
        if self.nak_sequence_number.is_some() {
            f |= packet_bit::NAK;
        }
        if self.rtt_request_sequence_number.is_some() {
            f |= packet_bit::RTT_REQUEST;
        }
        if self.rtt_response.is_some() {
            f |= packet_bit::RTT_RESPONSE;
        }
        f
    }

    /// Serialize the header onto `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags());
        if let Some(sn) = self.sequence_number {
            buf.put_u16(sn);
        }
        if let Some(sn) = self.ack_sequence_number {
            buf.put_u16(sn);
        }
        if let Some(sn) = self.nak_sequence_number {
            buf.put_u16(sn);
        }
        if let Some(sn) = self.rtt_request_sequence_number {
            buf.put_u16(sn);
        }
        if let Some(r) = self.rtt_response {
            buf.put_u16(r.sequence_number);
            buf.put_u32(r.delay_micros);
        }
    }

    /// Parse a header from the front of `data`, returning it and the
    /// number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(Error::Malformed("empty datagram".into()));
        }
        let flags = data[0];
        let mut offset = 1;

        let mut take_u16 = |offset: &mut usize| -> Result<u16> {
            if data.len() < *offset + 2 {
                return Err(Error::Malformed("truncated packet header".into()));
            }
            let v = u16::from_be_bytes([data[*offset], data[*offset + 1]]);
            *offset += 2;
            Ok(v)
        };

        let sequence_number = if flags & packet_bit::SEQUENCE_NUMBER != 0 {
            Some(take_u16(&mut offset)?)
        } else {
            None
        };
        let ack_sequence_number = if flags & packet_bit::ACK != 0 {
            Some(take_u16(&mut offset)?)
        } else {
            None
        };
        let nak_sequence_number = if flags & packet_bit::NAK != 0 {
            Some(take_u16(&mut offset)?)
        } else {
            None
        };
        let rtt_request_sequence_number = if flags & packet_bit::RTT_REQUEST != 0 {
            Some(take_u16(&mut offset)?)
        } else {
            None
        };
        let rtt_response = if flags & packet_bit::RTT_RESPONSE != 0 {
            let sequence_number = take_u16(&mut offset)?;
            if data.len() < offset + 4 {
                return Err(Error::Malformed("truncated RTT response".into()));
            }
            let delay_micros = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap());
            offset += 4;
            Some(RttResponse {
                sequence_number,
                delay_micros,
            })
        } else {
            None
        };

        Ok((
            Self {
                sequence_number,
                ack_sequence_number,
                nak_sequence_number,
                rtt_request_sequence_number,
                rtt_response,
            },
            offset,
        ))
    }
}

/// Per-message header: channel, flags, sequence number, and body
/// length. Always the same 9 bytes regardless of flags, since every
/// message travels on an explicit channel with an explicit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message role bitmap.
    pub flags: MessageFlags,
    /// Destination channel (control, or a data channel).
    pub channel: Channel,
    /// Wire (16-bit) sequence number.
    pub sequence_number: u16,
    /// Body length in bytes.
    pub length: u16,
}

impl MessageHeader {
    /// On-wire size of a message header.
    pub const SIZE: usize = 1 + 4 + 2 + 2;

    /// Serialize the header onto `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags.bits());
        buf.put_i32(self.channel.to_qualifier());
        buf.put_u16(self.sequence_number);
        buf.put_u16(self.length);
    }

    /// Parse a header from the front of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Malformed("truncated message header".into()));
        }
        let flags = MessageFlags::from_bits(data[0]);
        let qualifier = i32::from_be_bytes(data[1..5].try_into().unwrap());
        let sequence_number = u16::from_be_bytes([data[5], data[6]]);
        let length = u16::from_be_bytes([data[7], data[8]]);
        let channel = Channel::from_qualifier(qualifier).map_err(|err| Error::Malformed(err.to_string()))?;
        Ok(Self {
            flags,
            channel,
            sequence_number,
            length,
        })
    }
}

/// A fully decoded message: header plus its body.
#[derive(Debug, Clone)]
pub struct Message {
    /// Message header.
    pub header: MessageHeader,
    /// Message body (may be empty for pure control messages).
    pub body: Bytes,
}

impl Message {
    /// Serialized size of this message (header + body).
    pub fn encoded_len(&self) -> usize {
        MessageHeader::SIZE + self.body.len()
    }

    /// Serialize onto `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        self.header.write(buf);
        buf.put_slice(&self.body);
    }
}

/// A decoded datagram: one packet header plus the messages it carries.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Packet header.
    pub header: PacketHeader,
    /// Messages carried in this datagram, in wire order.
    pub messages: Vec<Message>,
}

impl Datagram {
    /// Parse a full datagram.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (header, mut offset) = PacketHeader::parse(data)?;
        let mut messages = Vec::new();

        while offset < data.len() {
            let msg_header = MessageHeader::parse(&data[offset..])?;
            let body_start = offset + MessageHeader::SIZE;
            let body_end = body_start + msg_header.length as usize;
            if data.len() < body_end {
                return Err(Error::Malformed("message body truncated".into()));
            }
            messages.push(Message {
                header: msg_header,
                body: Bytes::copy_from_slice(&data[body_start..body_end]),
            });
            offset = body_end;
        }

        Ok(Self { header, messages })
    }

    /// Serialize the full datagram.
    pub fn write(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1500);
        self.header.write(&mut buf);
        for message in &self.messages {
            message.write(&mut buf);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::message_bit;
    use rudp_core::{ChannelId, ChannelType};

    #[test]
    fn packet_header_roundtrip_with_all_optional_fields() {
        let header = PacketHeader {
            sequence_number: Some(10),
            ack_sequence_number: Some(9),
            nak_sequence_number: Some(3),
            rtt_request_sequence_number: Some(11),
            rtt_response: Some(RttResponse {
                sequence_number: 8,
                delay_micros: 1500,
            }),
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        let (parsed, consumed) = PacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn packet_header_roundtrip_bare() {
        let header = PacketHeader::default();
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), 1);
        let (parsed, _) = PacketHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn message_header_roundtrip() {
        let header = MessageHeader {
            flags: MessageFlags::NONE.with(message_bit::SYN),
            channel: Channel::Data(ChannelId::new(ChannelType::ReliableOrdered, 3)),
            sequence_number: 42,
            length: 7,
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        let parsed = MessageHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn message_header_rejects_undecodable_channel_qualifier() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageFlags::NONE.bits());
        buf.put_i32(0x7000_0000);
        buf.put_u16(0);
        buf.put_u16(0);
        assert!(MessageHeader::parse(&buf).is_err());
    }

    #[test]
    fn datagram_roundtrip_with_two_messages() {
        let datagram = Datagram {
            header: PacketHeader {
                sequence_number: Some(1),
                ..Default::default()
            },
            messages: vec![
                Message {
                    header: MessageHeader {
                        flags: MessageFlags::NONE,
                        channel: Channel::Control,
                        sequence_number: 1,
                        length: 5,
                    },
                    body: Bytes::from_static(b"hello"),
                },
                Message {
                    header: MessageHeader {
                        flags: MessageFlags::NONE,
                        channel: Channel::Data(ChannelId::new(ChannelType::Unreliable, 0)),
                        sequence_number: 2,
                        length: 0,
                    },
                    body: Bytes::new(),
                },
            ],
        };

        let encoded = datagram.write();
        let decoded = Datagram::parse(&encoded).unwrap();
        assert_eq!(decoded.messages.len(), 2);
        assert_eq!(decoded.messages[0].body, Bytes::from_static(b"hello"));
        assert_eq!(decoded.messages[1].body.len(), 0);
    }
}

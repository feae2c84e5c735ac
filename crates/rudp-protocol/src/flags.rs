//! Wire flag bitmaps for packet and message headers.
//!
//! Both headers carry small bitmaps rather than an enumerated opcode:
//! a message's role (`SYN`, `RST`, `PRX-SYN-ACK`, …) is a *combination*
//! of bits, not a single tag, so a NAT punch-through acknowledgment and
//! a close handshake reply share the same `ACK` bit without needing a
//! parallel enum variant for every combination. [`MessageFlags`] still
//! exposes a `classify` that collapses a bit combination down to a
//! [`ControlKind`] for dispatch, the same role `OpCode` plays in a
//! fixed-opcode protocol.

/// Bits of the per-message flags byte.
pub mod message_bit {
    /// Opening a logical connection.
    pub const SYN: u8 = 1 << 0;
    /// Closing a logical connection (or a NAT punch-through pairing).
    pub const RST: u8 = 1 << 1;
    /// Cumulative acknowledgment.
    pub const ACK: u8 = 1 << 2;
    /// Selective acknowledgment.
    pub const SACK: u8 = 1 << 3;
    /// NAT punch-through ("proxy") control message.
    pub const PRX: u8 = 1 << 4;
    /// This fragment is not the first of a split message.
    pub const SPLIT_NOT_FIRST: u8 = 1 << 5;
    /// This fragment is not the last of a split message.
    pub const SPLIT_NOT_LAST: u8 = 1 << 6;

    /// Flags relevant to control-message classification (i.e. everything
    /// except the split-fragment bits, which apply uniformly to any
    /// message, control or data).
    pub const CONTROL_MASK: u8 = PRX | RST | SYN | ACK | SACK;
}

/// Bits of the per-packet flags byte (selects which optional fields
/// follow in the packet header).
pub mod packet_bit {
    /// A 16-bit sequence number follows.
    pub const SEQUENCE_NUMBER: u8 = 1 << 0;
    /// A 16-bit cumulative ACK sequence number follows.
    pub const ACK: u8 = 1 << 1;
    /// A 16-bit NAK sequence number follows.
    pub const NAK: u8 = 1 << 2;
    /// A 16-bit RTT-request sequence number follows.
    pub const RTT_REQUEST: u8 = 1 << 3;
    /// A 16-bit RTT-response sequence number and a µs delay follow.
    pub const RTT_RESPONSE: u8 = 1 << 4;
}

/// The per-message flags bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    /// The empty flag set (a plain data message).
    pub const NONE: Self = Self(0);

    /// Construct from raw bits.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Set `bit` and return self (builder style).
    pub const fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }

    /// Whether `bit` is set.
    pub const fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    /// Whether any control-relevant bit is set (i.e. this is not a
    /// plain data message).
    pub const fn is_control(self) -> bool {
        self.0 & message_bit::CONTROL_MASK != 0
    }
}

/// A message's role, collapsed from its flag combination for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// `SYN` — open request.
    Syn,
    /// `SYN|RST` — server's immediate open response.
    SynRst,
    /// `SYN|RST|ACK` — handshake acknowledgment / close notice.
    SynRstAck,
    /// `RST` — close request.
    Rst,
    /// `PRX|SYN` — NAT probe.
    PrxSyn,
    /// `PRX|SYN|ACK` — NAT probe acknowledgment.
    PrxSynAck,
    /// `PRX|RST|SYN|ACK` — mediator's endpoint-pair announcement.
    PrxRstSynAck,
    /// `PRX|RST` — NAT punch-through teardown request.
    PrxRst,
    /// `PRX|RST|ACK` — NAT punch-through teardown acknowledgment.
    PrxRstAck,
    /// `PRX|ACK` — mediator rendezvous acknowledgment carrying an inner
    /// address.
    PrxAck,
    /// `PRX` alone — the mediator's receipt acknowledgment for a SYN it
    /// just paired or forwarded.
    Prx,
    /// `ACK` alone — cumulative acknowledgment only.
    Ack,
    /// `SACK` (optionally combined with `ACK`) — selective acknowledgment.
    Sack,
    /// No control bits set — ordinary data message.
    Data,
}

impl MessageFlags {
    /// Classify this flag combination for dispatch.
    pub fn classify(self) -> ControlKind {
        use message_bit::*;
        let bits = self.0 & CONTROL_MASK;
        match bits {
            b if b == SYN => ControlKind::Syn,
            b if b == (SYN | RST) => ControlKind::SynRst,
            b if b == (SYN | RST | ACK) => ControlKind::SynRstAck,
            b if b == RST => ControlKind::Rst,
            b if b == (PRX | SYN) => ControlKind::PrxSyn,
            b if b == (PRX | SYN | ACK) => ControlKind::PrxSynAck,
            b if b == (PRX | RST | SYN | ACK) => ControlKind::PrxRstSynAck,
            b if b == (PRX | RST) => ControlKind::PrxRst,
            b if b == (PRX | RST | ACK) => ControlKind::PrxRstAck,
            b if b == (PRX | ACK) => ControlKind::PrxAck,
            b if b == PRX => ControlKind::Prx,
            b if b == ACK => ControlKind::Ack,
            b if b & SACK != 0 => ControlKind::Sack,
            0 => ControlKind::Data,
            _ => ControlKind::Data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_syn_rst_ack_combinations() {
        assert_eq!(MessageFlags::NONE.with(message_bit::SYN).classify(), ControlKind::Syn);
        assert_eq!(
            MessageFlags::NONE.with(message_bit::SYN).with(message_bit::RST).classify(),
            ControlKind::SynRst
        );
        assert_eq!(
            MessageFlags::NONE
                .with(message_bit::PRX)
                .with(message_bit::RST)
                .with(message_bit::SYN)
                .with(message_bit::ACK)
                .classify(),
            ControlKind::PrxRstSynAck
        );
    }

    #[test]
    fn lone_prx_bit_is_not_data() {
        assert_eq!(
            MessageFlags::NONE.with(message_bit::PRX).classify(),
            ControlKind::Prx
        );
    }

    #[test]
    fn data_message_has_no_control_bits() {
        let flags = MessageFlags::NONE.with(message_bit::SPLIT_NOT_FIRST);
        assert!(!flags.is_control());
        assert_eq!(flags.classify(), ControlKind::Data);
    }
}

//! Channel qualifiers.
//!
//! On the wire a channel is a single 32-bit signed integer: the
//! reserved value `-1` denotes the control channel, everything else
//! packs a reliability mode into the high bits and a channel index into
//! the low bits.

use crate::{CoreError, Result};

/// Reserved channel qualifier for control messages.
pub const CONTROL_CHANNEL_QUALIFIER: i32 = -1;

const KIND_SHIFT: u32 = 28;
const INDEX_MASK: i32 = (1 << KIND_SHIFT) - 1;

/// Per-channel reliability/ordering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelType {
    /// No reliability, no ordering; duplicates within the receiver's
    /// sliding window are still suppressed.
    Unreliable = 0,
    /// No reliability; newer sequence numbers supersede older ones.
    UnreliableSequenced = 1,
    /// Reliable; newest sequence number per channel wins, stale
    /// retransmits are dropped once superseded.
    ReliableSequenced = 2,
    /// Reliable; delivered strictly in sequence-number order.
    ReliableOrdered = 3,
}

impl ChannelType {
    fn from_bits(bits: i32) -> Option<Self> {
        match bits {
            0 => Some(ChannelType::Unreliable),
            1 => Some(ChannelType::UnreliableSequenced),
            2 => Some(ChannelType::ReliableSequenced),
            3 => Some(ChannelType::ReliableOrdered),
            _ => None,
        }
    }

    /// Whether messages on this channel are tracked in the sender
    /// buffer and retransmitted until acknowledged.
    pub fn is_reliable(self) -> bool {
        matches!(self, ChannelType::ReliableSequenced | ChannelType::ReliableOrdered)
    }

    /// Whether only the newest sequence number is ever delivered
    /// (sequenced channels, as opposed to strictly ordered ones).
    pub fn is_sequenced(self) -> bool {
        matches!(self, ChannelType::UnreliableSequenced | ChannelType::ReliableSequenced)
    }

    /// Whether delivery must preserve strict sequence-number order.
    pub fn is_ordered(self) -> bool {
        matches!(self, ChannelType::ReliableOrdered)
    }
}

/// A data-channel identifier: reliability mode plus an application
/// chosen index distinguishing multiple channels of the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelId {
    /// Reliability/ordering mode.
    pub kind: ChannelType,
    /// Application-chosen index within that mode.
    pub index: u32,
}

impl ChannelId {
    /// Construct a channel id.
    pub fn new(kind: ChannelType, index: u32) -> Self {
        Self { kind, index }
    }

    /// Encode as the wire channel qualifier.
    pub fn to_qualifier(self) -> i32 {
        ((self.kind as i32) << KIND_SHIFT) | (self.index as i32 & INDEX_MASK)
    }

    /// Decode a non-control wire qualifier.
    pub fn from_qualifier(qualifier: i32) -> Result<Self> {
        if qualifier == CONTROL_CHANNEL_QUALIFIER {
            return Err(CoreError::InvalidChannelQualifier(qualifier));
        }
        let kind_bits = qualifier >> KIND_SHIFT;
        let kind = ChannelType::from_bits(kind_bits)
            .ok_or(CoreError::InvalidChannelQualifier(qualifier))?;
        Ok(Self {
            kind,
            index: (qualifier & INDEX_MASK) as u32,
        })
    }
}

/// The channel a message travels on: the reserved control channel, or
/// an application data channel with a reliability mode and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// The reserved control channel (qualifier `-1`).
    Control,
    /// An application data channel.
    Data(ChannelId),
}

impl Channel {
    /// Encode as the wire channel qualifier.
    pub fn to_qualifier(self) -> i32 {
        match self {
            Channel::Control => CONTROL_CHANNEL_QUALIFIER,
            Channel::Data(id) => id.to_qualifier(),
        }
    }

    /// Decode a wire channel qualifier.
    pub fn from_qualifier(qualifier: i32) -> Result<Self> {
        if qualifier == CONTROL_CHANNEL_QUALIFIER {
            Ok(Channel::Control)
        } else {
            ChannelId::from_qualifier(qualifier).map(Channel::Data)
        }
    }

    /// Whether this is the reserved control channel.
    pub fn is_control(self) -> bool {
        matches!(self, Channel::Control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifier_roundtrip() {
        for kind in [
            ChannelType::Unreliable,
            ChannelType::UnreliableSequenced,
            ChannelType::ReliableSequenced,
            ChannelType::ReliableOrdered,
        ] {
            for index in [0u32, 1, 42, 0x0FFF_FFFF] {
                let id = ChannelId::new(kind, index);
                let q = id.to_qualifier();
                assert_ne!(q, CONTROL_CHANNEL_QUALIFIER);
                assert_eq!(ChannelId::from_qualifier(q).unwrap(), id);
            }
        }
    }

    #[test]
    fn control_channel_is_reserved() {
        assert_eq!(Channel::from_qualifier(-1).unwrap(), Channel::Control);
        assert!(ChannelId::from_qualifier(-1).is_err());
    }

    #[test]
    fn undecodable_qualifier_is_an_error_not_a_silent_fallback() {
        let bogus_kind = 0x7 << KIND_SHIFT;
        assert!(Channel::from_qualifier(bogus_kind).is_err());
    }
}

//! Logical transport channels

use super::error::ProtocolError;

/// Number of channels requested from the transport when connecting
pub const CHANNEL_COUNT: usize = 10;

/// Delivery guarantee for a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Retransmitted until acknowledged, delivered in order
    Reliable,
    /// Fire and forget, may be lost or reordered
    Unreliable,
}

/// Logical channels multiplexed over one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelId {
    /// Key exchange and challenge
    Auth = 0,
    /// Encrypted control events
    Control = 1,
    /// Client to server audio
    AudioUplink = 2,
    /// Server to client audio, prefixed with the sender header
    AudioDownlink = 3,
}

impl ChannelId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this channel carries audio datagrams
    pub fn is_audio(self) -> bool {
        matches!(self, Self::AudioUplink | Self::AudioDownlink)
    }

    /// Delivery class used for packets on this channel
    pub fn delivery(self) -> Delivery {
        if self.is_audio() {
            Delivery::Unreliable
        } else {
            Delivery::Reliable
        }
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Auth),
            1 => Ok(Self::Control),
            2 => Ok(Self::AudioUplink),
            3 => Ok(Self::AudioDownlink),
            other => Err(ProtocolError::UnknownChannel(other)),
        }
    }
}

//! Downlink audio packet format
//!
//! Packet format (4-byte header):
//! - user_id: 2 bytes (big-endian)
//! - sequence: 2 bytes (big-endian)
//! - codec payload: remaining bytes

use super::error::ProtocolError;

/// Header size in bytes
pub const AUDIO_HEADER_SIZE: usize = 4;

/// One encoded audio frame relayed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub user_id: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl AudioFrame {
    pub fn new(user_id: u16, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            user_id,
            sequence,
            payload,
        }
    }

    /// Serialize the header followed by the payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(AUDIO_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.user_id.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a decrypted downlink datagram
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < AUDIO_HEADER_SIZE {
            return Err(ProtocolError::TruncatedAudioHeader(data.len()));
        }

        Ok(Self {
            user_id: u16::from_be_bytes([data[0], data[1]]),
            sequence: u16::from_be_bytes([data[2], data[3]]),
            payload: data[AUDIO_HEADER_SIZE..].to_vec(),
        })
    }
}

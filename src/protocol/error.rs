//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding wire data
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Audio packet too short: {0} bytes")]
    TruncatedAudioHeader(usize),

    #[error("Unknown channel: {0}")]
    UnknownChannel(u8),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Invalid data for event {event}: {reason}")]
    InvalidEventData { event: String, reason: String },

    #[error("Envelope encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Envelope decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

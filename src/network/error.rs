//! Network error types

use thiserror::Error;

use crate::protocol::{ChannelId, ProtocolError};

/// Errors raised by the channel transport
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Peer is not connected")]
    PeerGone,

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// Errors raised by the session cipher
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Key wrapping failed: {0}")]
    KeyWrap(#[from] rsa::Error),

    #[error("Ciphertext too short: {0} bytes")]
    Truncated(usize),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,
}

/// Errors returned by [`super::Client`] operations
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    #[error("Already disconnected")]
    AlreadyDisconnected,

    #[error("Can't send control events on channel {0:?}")]
    ReservedChannel(ChannelId),

    #[error("Handshake failed")]
    HandshakeFailed,

    #[error("Transport error: {0}")]
    Transport(#[from] NetworkError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

//! Audio error types

use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Failed to spawn audio thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] super::codec::CodecError),
}

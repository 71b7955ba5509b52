//! Audio module
//!
//! Handles capture, encoding, jitter-buffered playback and device enumeration.

mod backend;
pub mod codec;
mod device;
mod engine;
mod error;
mod remote_user;
mod transmitter;

pub use backend::{AudioBuffer, CaptureDevice, OutputVoice, VoiceState};
pub use codec::{create_codec, AudioCodec, CodecConfig, CodecError, CodecType, PcmCodec};
pub use device::{
    find_input_device, find_output_device, list_input_devices, list_output_devices, AudioDevice,
    DeviceId,
};
pub use engine::{CpalCapture, CpalVoice, StreamFormat};
pub use error::AudioError;
pub use remote_user::{JitterPlayback, RemoteUser, UpdateOutcome, DEFAULT_JITTER_BUFFER_SIZE};
pub use transmitter::Transmitter;

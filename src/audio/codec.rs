//! Audio codec abstraction for encoding/decoding audio frames
//!
//! Voice traffic is Opus at 48 kHz stereo. Opus support requires the `opus-codec`
//! feature and the libopus system library; [`PcmCodec`] is always available and is
//! used for local testing.

use thiserror::Error;

/// Sample rate used on the wire
pub const SAMPLE_RATE: u32 = 48000;

/// Channel count used on the wire
pub const CHANNELS: u16 = 2;

/// Samples per channel in one frame (40 ms @ 48 kHz)
pub const DEFAULT_FRAME_SIZE: usize = 1920;

/// Largest encoded Opus packet we accept
#[cfg(feature = "opus-codec")]
const MAX_PACKET_SIZE: usize = 4000;

/// Codec type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecType {
    /// Raw f32 PCM (no compression)
    Pcm,
    /// Opus
    #[default]
    Opus,
}

impl CodecType {
    /// Check if this codec type is available in the current build
    pub fn is_available(&self) -> bool {
        match self {
            CodecType::Pcm => true,
            #[cfg(feature = "opus-codec")]
            CodecType::Opus => true,
            #[cfg(not(feature = "opus-codec"))]
            CodecType::Opus => false,
        }
    }
}

/// Codec configuration
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Codec type to use
    pub codec_type: CodecType,
    /// Sample rate in Hz (default: 48000)
    pub sample_rate: u32,
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u16,
    /// Frame size in samples per channel (default: 1920)
    pub frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            codec_type: CodecType::Opus,
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

impl CodecConfig {
    /// Interleaved samples in one frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }
}

/// Errors that can occur during codec operations
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Encode failed: {0}")]
    EncodeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Invalid frame size: expected {expected}, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("Invalid data format: {0}")]
    InvalidData(String),

    #[error("Codec not available: {0}")]
    NotAvailable(String),
}

/// Encodes or decodes one frame at a time
///
/// Must be Send so encoders and decoders can live on pipeline threads.
pub trait AudioCodec: Send {
    /// Encode exactly one frame of interleaved samples
    fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, CodecError>;

    /// Decode one packet to interleaved samples
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError>;

    /// Get codec type
    fn codec_type(&self) -> CodecType;
}

/// PCM codec (passthrough, no compression)
///
/// Converts f32 samples to/from little-endian bytes.
pub struct PcmCodec {
    samples_per_frame: usize,
}

impl PcmCodec {
    /// Create a new PCM codec
    pub fn new(config: &CodecConfig) -> Self {
        Self {
            samples_per_frame: config.samples_per_frame(),
        }
    }
}

impl AudioCodec for PcmCodec {
    fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, CodecError> {
        if samples.len() != self.samples_per_frame {
            return Err(CodecError::InvalidFrameSize {
                expected: self.samples_per_frame,
                actual: samples.len(),
            });
        }
        Ok(samples.iter().flat_map(|&s| s.to_le_bytes()).collect())
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        if data.len() % 4 != 0 {
            return Err(CodecError::InvalidData(format!(
                "PCM data length {} is not a multiple of 4",
                data.len()
            )));
        }

        Ok(data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    fn codec_type(&self) -> CodecType {
        CodecType::Pcm
    }
}

#[cfg(feature = "opus-codec")]
mod opus_impl {
    use super::*;

    /// Opus encoder/decoder pair
    pub struct OpusCodec {
        encoder: opus::Encoder,
        decoder: opus::Decoder,
        frame_size: usize,
        channels: u16,
        encode_buffer: Vec<u8>,
    }

    impl OpusCodec {
        /// Create a new Opus codec
        pub fn new(config: &CodecConfig) -> Result<Self, CodecError> {
            let channels = match config.channels {
                1 => opus::Channels::Mono,
                2 => opus::Channels::Stereo,
                _ => {
                    return Err(CodecError::InitializationFailed(format!(
                        "Unsupported channel count: {}",
                        config.channels
                    )))
                }
            };

            let encoder =
                opus::Encoder::new(config.sample_rate, channels, opus::Application::Audio)
                    .map_err(|e| {
                        CodecError::InitializationFailed(format!("Encoder init failed: {}", e))
                    })?;

            let decoder = opus::Decoder::new(config.sample_rate, channels).map_err(|e| {
                CodecError::InitializationFailed(format!("Decoder init failed: {}", e))
            })?;

            Ok(Self {
                encoder,
                decoder,
                frame_size: config.frame_size,
                channels: config.channels,
                encode_buffer: vec![0u8; MAX_PACKET_SIZE],
            })
        }
    }

    impl AudioCodec for OpusCodec {
        fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, CodecError> {
            let expected = self.frame_size * self.channels as usize;
            if samples.len() != expected {
                return Err(CodecError::InvalidFrameSize {
                    expected,
                    actual: samples.len(),
                });
            }

            let len = self
                .encoder
                .encode_float(samples, &mut self.encode_buffer)
                .map_err(|e| CodecError::EncodeFailed(format!("Opus encode failed: {}", e)))?;

            Ok(self.encode_buffer[..len].to_vec())
        }

        fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
            let mut output = vec![0.0f32; self.frame_size * self.channels as usize];

            let decoded = self
                .decoder
                .decode_float(data, &mut output, false)
                .map_err(|e| CodecError::DecodeFailed(format!("Opus decode failed: {}", e)))?;

            output.truncate(decoded * self.channels as usize);
            Ok(output)
        }

        fn codec_type(&self) -> CodecType {
            CodecType::Opus
        }
    }
}

#[cfg(feature = "opus-codec")]
pub use opus_impl::OpusCodec;

/// Create a codec based on configuration
pub fn create_codec(config: &CodecConfig) -> Result<Box<dyn AudioCodec>, CodecError> {
    match config.codec_type {
        CodecType::Pcm => Ok(Box::new(PcmCodec::new(config))),
        #[cfg(feature = "opus-codec")]
        CodecType::Opus => Ok(Box::new(OpusCodec::new(config)?)),
        #[cfg(not(feature = "opus-codec"))]
        CodecType::Opus => Err(CodecError::NotAvailable(
            "Opus codec requires the 'opus-codec' feature and libopus system library".to_string(),
        )),
    }
}

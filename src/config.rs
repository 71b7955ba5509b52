//! Client configuration
//!
//! Holds the settings the engine consumes: server address, display name, audio
//! devices and buffering. Persisting them is left to the embedding application,
//! which exchanges them as JSON through [`ClientConfig::to_json`] and
//! [`ClientConfig::from_json`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::codec::DEFAULT_FRAME_SIZE;
use crate::audio::{CodecConfig, DeviceId, DEFAULT_JITTER_BUFFER_SIZE};
use crate::network::ServerAddress;

/// Time allowed for connecting and authenticating
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default server port
pub const DEFAULT_PORT: u16 = 4000;

/// Frame sizes Opus accepts at 48 kHz (2.5 to 60 ms)
const VALID_FRAME_SIZES: [usize; 6] = [120, 240, 480, 960, 1920, 2880];

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Server host name or address
    #[serde(default)]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Display name announced to the server
    #[serde(default)]
    pub name: String,

    /// Capture device (None = system default)
    #[serde(default)]
    pub input_device: Option<String>,

    /// Playback device (None = system default)
    #[serde(default)]
    pub output_device: Option<String>,

    /// Jitter buffer depth in frames
    #[serde(default = "default_jitter_buffer_size")]
    pub jitter_buffer_size: usize,

    /// Samples per channel in one voice frame
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_jitter_buffer_size() -> usize {
    DEFAULT_JITTER_BUFFER_SIZE
}

fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            name: String::new(),
            input_device: None,
            output_device: None,
            jitter_buffer_size: DEFAULT_JITTER_BUFFER_SIZE,
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("Server host is not set".to_string());
        }

        if self.port == 0 {
            return Err("Server port must be non-zero".to_string());
        }

        self.validate_audio()
    }

    /// Validate only the audio settings
    pub fn validate_audio(&self) -> Result<(), String> {
        if self.jitter_buffer_size == 0 {
            return Err("Jitter buffer size must be at least 1".to_string());
        }

        if !VALID_FRAME_SIZES.contains(&self.frame_size) {
            return Err(format!(
                "Invalid frame size: {}. Valid values are {:?}",
                self.frame_size, VALID_FRAME_SIZES
            ));
        }

        Ok(())
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Address of the configured server
    pub fn server_address(&self) -> ServerAddress {
        ServerAddress::new(self.host.clone(), self.port)
    }

    pub fn input_device_id(&self) -> Option<DeviceId> {
        self.input_device.clone().map(DeviceId)
    }

    pub fn output_device_id(&self) -> Option<DeviceId> {
        self.output_device.clone().map(DeviceId)
    }

    /// Codec settings for the configured frame size
    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            frame_size: self.frame_size,
            ..Default::default()
        }
    }
}

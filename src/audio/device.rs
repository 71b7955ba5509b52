//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use super::error::AudioError;

/// Identifier for an audio device (its cpal name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

/// Information about an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device identifier
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Whether this is the default device
    pub is_default: bool,
}

fn describe<I>(devices: I, default_name: Option<String>) -> Vec<AudioDevice>
where
    I: Iterator<Item = cpal::Device>,
{
    devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let is_default = default_name.as_ref() == Some(&name);
            Some(AudioDevice {
                id: DeviceId(name.clone()),
                name,
                is_default,
            })
        })
        .collect()
}

/// List available input (capture) devices
pub fn list_input_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    host.input_devices()
        .map(|devices| describe(devices, default_name))
        .unwrap_or_default()
}

/// List available output (playback) devices
pub fn list_output_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    host.output_devices()
        .map(|devices| describe(devices, default_name))
        .unwrap_or_default()
}

/// Find an input device by id, or the default one
pub fn find_input_device(id: Option<&DeviceId>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match id {
        Some(id) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .find(|d| d.name().ok().as_ref() == Some(&id.0))
            .ok_or_else(|| AudioError::DeviceNotFound(id.0.clone())),
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".into())),
    }
}

/// Find an output device by id, or the default one
pub fn find_output_device(id: Option<&DeviceId>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match id {
        Some(id) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .find(|d| d.name().ok().as_ref() == Some(&id.0))
            .ok_or_else(|| AudioError::DeviceNotFound(id.0.clone())),
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".into())),
    }
}

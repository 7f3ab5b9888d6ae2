//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::AudioError;

/// Device description for listings
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    /// Stable id: `input:<name>` or `output:<name>`
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    /// Whether the device accepts mono 48 kHz
    pub supports_voice_format: bool,
}

/// Which side of the device a lookup targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn prefix(self) -> &'static str {
        match self {
            Direction::Input => "input:",
            Direction::Output => "output:",
        }
    }
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    for direction in [Direction::Input, Direction::Output] {
        let (default_name, iter) = match direction {
            Direction::Input => (
                host.default_input_device().and_then(|d| d.name().ok()),
                host.input_devices(),
            ),
            Direction::Output => (
                host.default_output_device().and_then(|d| d.name().ok()),
                host.output_devices(),
            ),
        };

        let Ok(iter) = iter else { continue };
        for device in iter {
            let Ok(name) = device.name() else { continue };
            devices.push(AudioDeviceInfo {
                id: format!("{}{}", direction.prefix(), name),
                is_default: default_name.as_ref() == Some(&name),
                supports_voice_format: supports_voice_format(&device, direction),
                is_input: direction == Direction::Input,
                is_output: direction == Direction::Output,
                name,
            });
        }
    }

    devices
}

/// Check for a mono 48 kHz configuration
fn supports_voice_format(device: &cpal::Device, direction: Direction) -> bool {
    let rate = cpal::SampleRate(crate::constants::SAMPLE_RATE);
    let matches = |range: cpal::SupportedStreamConfigRange| {
        range.channels() == crate::constants::CHANNELS
            && range.min_sample_rate() <= rate
            && rate <= range.max_sample_rate()
    };

    match direction {
        Direction::Input => device
            .supported_input_configs()
            .map(|mut configs| configs.any(matches))
            .unwrap_or(false),
        Direction::Output => device
            .supported_output_configs()
            .map(|mut configs| configs.any(matches))
            .unwrap_or(false),
    }
}

/// Get a device by its id. A bare name is looked up on `direction`.
pub fn get_device_by_id(id: &str, direction: Direction) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let name = id.strip_prefix(direction.prefix()).unwrap_or(id);

    let devices = match direction {
        Direction::Input => host.input_devices()?,
        Direction::Output => host.output_devices()?,
    };

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// Resolve a configured device id, falling back to the host default
pub fn resolve_device(id: Option<&str>, direction: Direction) -> Result<cpal::Device, AudioError> {
    if let Some(id) = id {
        return get_device_by_id(id, direction);
    }

    let host = cpal::default_host();
    match direction {
        Direction::Input => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
        Direction::Output => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
    }
}

//! Device enumeration.

use cpal::traits::{DeviceTrait, HostTrait};

use mf_core::{Error, Result};

/// What a caller needs to pick a device: its name and channel count.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub channels: usize,
}

/// Enumerates output devices on the default host.
pub fn output_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let devices = host.output_devices().map_err(|err| {
        log::error!("failed to enumerate output devices: {err}");
        Error::BackendError
    })?;
    let mut result = Vec::new();
    for device in devices {
        let name = device.name().unwrap_or_else(|_| "<unknown>".into());
        let channels = device
            .default_output_config()
            .map(|config| config.channels() as usize)
            .unwrap_or(0);
        result.push(DeviceInfo { name, channels });
    }
    Ok(result)
}

/// Enumerates input devices on the default host.
pub fn input_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let devices = host.input_devices().map_err(|err| {
        log::error!("failed to enumerate input devices: {err}");
        Error::BackendError
    })?;
    let mut result = Vec::new();
    for device in devices {
        let name = device.name().unwrap_or_else(|_| "<unknown>".into());
        let channels = device
            .default_input_config()
            .map(|config| config.channels() as usize)
            .unwrap_or(0);
        result.push(DeviceInfo { name, channels });
    }
    Ok(result)
}

pub(crate) fn find_output_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => {
            let mut devices = host.output_devices().map_err(|err| {
                log::error!("failed to enumerate output devices: {err}");
                Error::BackendError
            })?;
            devices
                .find(|device| device.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or(Error::NoDevicesAvailable)
        }
        None => host.default_output_device().ok_or(Error::NoDevicesAvailable),
    }
}

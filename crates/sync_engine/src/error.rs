//! Registry and engine errors

use contracts::DeviceId;
use thiserror::Error;

/// Rejected registry operation. Never fatal to the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    /// Device id is not registered and auto-registration is off
    #[error("unknown device: {device_id}")]
    UnknownDevice { device_id: DeviceId },

    /// Offline devices receive no offset commands
    #[error("device {device_id} is offline")]
    DeviceOffline { device_id: DeviceId },

    /// Id cannot be used as a topic segment
    #[error("invalid device id '{device_id}'")]
    InvalidDeviceId { device_id: String },

    #[error("unknown sync group: {group_id}")]
    UnknownGroup { group_id: String },

    #[error("offset {offset_ms} ms is not a finite value")]
    InvalidOffset { offset_ms: f64 },
}

impl RegistryError {
    pub fn unknown_device(device_id: &DeviceId) -> Self {
        Self::UnknownDevice {
            device_id: device_id.clone(),
        }
    }

    pub fn device_offline(device_id: &DeviceId) -> Self {
        Self::DeviceOffline {
            device_id: device_id.clone(),
        }
    }
}

/// Failure talking to a running engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine task has stopped
    #[error("sync engine is not running")]
    Closed,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

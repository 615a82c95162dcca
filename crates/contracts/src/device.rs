//! Device-facing data model
//!
//! The registry owns the live per-device state; this module holds the
//! profile a node announces with and the read-only snapshot handed to the
//! monitoring layer.

use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// Group every device lands in unless it names another one.
pub const DEFAULT_GROUP: &str = "default";

/// Node lifecycle status
///
/// `Registering -> Online <-> Degraded -> Offline`, `Offline -> Registering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Announced (or re-contacted) but no valid drift sample yet
    #[default]
    Registering,
    /// Heartbeat current and valid samples arriving
    Online,
    /// Heartbeat current but samples persistently rejected or stale
    Degraded,
    /// Heartbeat timed out; offset frozen
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Registering => "registering",
            DeviceStatus::Online => "online",
            DeviceStatus::Degraded => "degraded",
            DeviceStatus::Offline => "offline",
        }
    }

    /// Offline devices take no part in group math and receive no commands.
    pub fn is_reachable(&self) -> bool {
        !matches!(self, DeviceStatus::Offline)
    }
}

/// Output device kind (informational)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Analog,
    Hdmi,
    Chromecast,
    Airplay,
    Bluetooth,
    Snapcast,
    Pulse,
    Alsa,
}

/// Static description of a node, from configuration or announce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_id: DeviceId,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub device_type: DeviceType,
    /// Static output latency of the device class
    #[serde(default)]
    pub base_latency_ms: f64,
    #[serde(default = "default_group")]
    pub sync_group: String,
}

pub(crate) fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

impl DeviceProfile {
    /// Profile for a device that was never announced.
    pub fn anonymous(device_id: DeviceId) -> Self {
        Self {
            device_id,
            device_name: None,
            device_type: DeviceType::default(),
            base_latency_ms: 0.0,
            sync_group: default_group(),
        }
    }
}

/// Per-device measurement counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// All samples received
    pub measurements: u64,
    /// Samples that passed validation
    pub valid: u64,
    pub rejected_low_correlation: u64,
    pub rejected_ambiguous: u64,
    pub rejected_out_of_range: u64,
    /// Valid samples excluded from the EMA
    pub outliers: u64,
    /// Offset commands applied
    pub commands_applied: u64,
    /// Mean of valid drift samples currently in history
    pub mean_drift_ms: f64,
    /// Standard deviation of valid drift samples currently in history
    pub std_drift_ms: f64,
}

/// Read-only view of one device for the monitoring layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub device_name: Option<String>,
    pub device_type: DeviceType,
    pub sync_group: String,
    pub base_latency_ms: f64,
    pub current_offset_ms: f64,
    pub ema_drift_ms: f64,
    pub last_raw_drift_ms: f64,
    pub last_correlation: f64,
    pub status: DeviceStatus,
    /// Milliseconds since the last contact
    pub last_seen_ago_ms: u64,
    pub manual_override: bool,
    pub history_len: usize,
    pub stats: DeviceStats,
}

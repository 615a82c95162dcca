//! Controller output: offset commands and node commands

use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// Why an offset command was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReason {
    /// Smoothed drift crossed the tolerance
    Reactive,
    /// Trend extrapolation ahead of the reactive threshold
    Predictive,
    /// Operator-set offset
    Manual,
    /// Spread reduction inside a sync group
    GroupRebalance,
    /// First correction after a resync
    Resync,
}

impl OffsetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReason::Reactive => "reactive",
            OffsetReason::Predictive => "predictive",
            OffsetReason::Manual => "manual",
            OffsetReason::GroupRebalance => "group_rebalance",
            OffsetReason::Resync => "resync",
        }
    }
}

/// Absolute buffer offset for one device.
///
/// Carries the target value rather than a delta so applying it twice leaves
/// the buffer unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetCommand {
    pub device_id: DeviceId,
    pub new_offset_ms: f64,
    pub reason: OffsetReason,
    /// Wall-clock issue time (seconds since epoch)
    pub issued_at: f64,
}

/// Control verbs sent on `command/*`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCommand {
    Start,
    Stop,
    Resync,
    TestTone,
}

impl NodeCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeCommand::Start => "start",
            NodeCommand::Stop => "stop",
            NodeCommand::Resync => "resync",
            NodeCommand::TestTone => "test_tone",
        }
    }
}

//! DriftSample - Drift Detector output
//!
//! Sign convention: positive `raw_drift_ms` means the node's acoustic output
//! trails the reference stream. The value is the node's intrinsic drift: the
//! correction the node already applies is removed before reporting.

use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// Why a measurement was marked invalid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Normalized peak below the configured minimum
    LowCorrelation,
    /// Secondary peak too close to the main peak
    AmbiguousPeak,
    /// Implied drift beyond the configured maximum
    DriftOutOfRange,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::LowCorrelation => "low_correlation",
            RejectReason::AmbiguousPeak => "ambiguous_peak",
            RejectReason::DriftOutOfRange => "drift_out_of_range",
        }
    }
}

/// One drift measurement. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSample {
    /// Measured node
    pub device_id: DeviceId,
    /// Capture time of the microphone window (seconds since epoch)
    pub timestamp: f64,
    /// Drift in milliseconds (positive = node lags reference)
    pub raw_drift_ms: f64,
    /// Normalized peak correlation in [0, 1]
    pub correlation_score: f64,
    /// Whether the measurement passed validation
    pub valid: bool,
    /// Set when `valid` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectReason>,
}

impl DriftSample {
    /// Build an accepted sample
    pub fn accepted(
        device_id: DeviceId,
        timestamp: f64,
        raw_drift_ms: f64,
        correlation_score: f64,
    ) -> Self {
        Self {
            device_id,
            timestamp,
            raw_drift_ms,
            correlation_score,
            valid: true,
            rejection: None,
        }
    }

    /// Build a rejected sample
    pub fn rejected(
        device_id: DeviceId,
        timestamp: f64,
        raw_drift_ms: f64,
        correlation_score: f64,
        reason: RejectReason,
    ) -> Self {
        Self {
            device_id,
            timestamp,
            raw_drift_ms,
            correlation_score,
            valid: false,
            rejection: Some(reason),
        }
    }

    /// Copy of this sample with the drift shifted by `delta_ms`.
    pub fn shifted(&self, delta_ms: f64) -> Self {
        Self {
            raw_drift_ms: self.raw_drift_ms + delta_ms,
            ..self.clone()
        }
    }
}

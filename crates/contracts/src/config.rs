//! SyncStream configuration contracts shared across crates.
//!
//! Every section has defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::DeviceProfile;

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStreamConfig {
    #[serde(default)]
    pub version: ConfigVersion,

    /// Signal preprocessing
    #[serde(default)]
    pub preprocess: PreprocessConfig,

    /// Cross-correlation and validation
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Node measurement cadence
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Offset control loop
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Liveness and history
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Measurement channel queues
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Statically known devices, registered at startup
    #[serde(default)]
    pub devices: Vec<DeviceProfile>,

    /// Group priorities
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// Signal preprocessor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// High-pass cutoff in Hz
    pub highpass_cutoff_hz: f64,
    /// RMS level every window is normalized to
    pub target_rms: f64,
    /// Fraction of the window tapered at each edge (0 - 0.5)
    pub edge_taper: f64,
    /// Shortest window accepted, in seconds (one correlation period)
    pub min_window_s: f64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            highpass_cutoff_hz: 100.0,
            target_rms: 0.1,
            edge_taper: 0.1,
            min_window_s: 0.5,
        }
    }
}

/// Drift detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Correlation window length in seconds
    pub window_s: f64,
    /// Largest drift searched for and accepted
    pub max_drift_ms: f64,
    /// Minimum normalized correlation for a valid sample
    pub min_correlation: f64,
    /// Main peak must exceed the best secondary peak by this ratio
    pub min_peak_ratio: f64,
    /// Half-width around the main peak ignored when looking for a secondary peak
    pub peak_exclusion_ms: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_s: 2.0,
            max_drift_ms: 1000.0,
            min_correlation: 0.7,
            min_peak_ratio: 1.5,
            peak_exclusion_ms: 5.0,
        }
    }
}

/// Node sampling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Starting and minimum measurement interval
    pub base_interval_s: f64,
    /// Longest measurement interval
    pub max_interval_s: f64,
    /// Interval multiplier applied after a stable streak
    pub backoff_factor: f64,
    /// Consecutive in-tolerance measurements before backing off
    pub stable_streak: u32,
    /// How far behind "now" the measured window ends
    pub lookback_s: f64,
    /// Heartbeat period
    pub heartbeat_interval_s: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            base_interval_s: 5.0,
            max_interval_s: 60.0,
            backoff_factor: 1.5,
            stable_streak: 3,
            lookback_s: 0.5,
            heartbeat_interval_s: 10.0,
        }
    }
}

impl SamplingConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs_f64(self.base_interval_s.max(0.001))
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs_f64(self.max_interval_s.max(self.base_interval_s).max(0.001))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_s.max(0.001))
    }
}

/// Spread thresholds for group quality tiers (milliseconds, inclusive)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub excellent_ms: f64,
    pub good_ms: f64,
    pub fair_ms: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_ms: 2.0,
            good_ms: 10.0,
            fair_ms: 25.0,
        }
    }
}

/// Trend-based proactive correction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    pub enabled: bool,
    /// Period of the predictive pass
    pub interval_s: f64,
    /// Valid samples needed before fitting a trend
    pub min_samples: usize,
    /// Minimum coefficient of determination of the fit
    pub min_r2: f64,
    /// Minimum |slope| that counts as a trend (ms of drift per second)
    pub min_slope_ms_per_s: f64,
    /// How far ahead the trend is extrapolated
    pub horizon_s: f64,
    /// Predicted error that triggers a proactive step
    pub trigger_ms: f64,
    /// Largest proactive step
    pub step_ms: f64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: 15.0,
            min_samples: 5,
            min_r2: 0.6,
            min_slope_ms_per_s: 0.02,
            horizon_s: 30.0,
            trigger_ms: 5.0,
            step_ms: 2.0,
        }
    }
}

impl PredictiveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_s.max(0.001))
    }
}

/// Sync controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// EMA smoothing factor
    pub adjustment_rate: f64,
    /// Error beyond which a reactive correction starts
    pub tolerance_ms: f64,
    /// Per-command step clamp (defaults to `tolerance_ms`)
    pub max_step_ms: Option<f64>,
    /// Error below which an ongoing correction stops
    pub settle_ms: f64,
    /// Outlier threshold in standard deviations
    pub outlier_sigma: f64,
    /// Valid history samples needed before outlier rejection applies
    pub outlier_min_samples: usize,
    /// Floor for the history standard deviation
    pub min_outlier_sigma_ms: f64,
    /// Group spread that triggers rebalancing
    pub group_spread_tolerance_ms: f64,
    /// A device without a valid sample for this long is frozen
    pub stability_window_s: f64,
    #[serde(default)]
    pub predictive: PredictiveConfig,
    #[serde(default)]
    pub quality: QualityThresholds,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            adjustment_rate: 0.2,
            tolerance_ms: 15.0,
            max_step_ms: None,
            settle_ms: 1.0,
            outlier_sigma: 3.0,
            outlier_min_samples: 5,
            min_outlier_sigma_ms: 1.0,
            group_spread_tolerance_ms: 1.0,
            stability_window_s: 120.0,
            predictive: PredictiveConfig::default(),
            quality: QualityThresholds::default(),
        }
    }
}

impl ControllerConfig {
    /// Effective per-step clamp
    pub fn step_clamp_ms(&self) -> f64 {
        self.max_step_ms.unwrap_or(self.tolerance_ms).abs()
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_secs_f64(self.stability_window_s.max(0.0))
    }
}

/// Device registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Heartbeat timeout
    pub device_timeout_s: f64,
    /// Period of the liveness sweep
    pub sweep_interval_s: f64,
    /// Consecutive rejected samples before Degraded
    pub degrade_after_rejects: u32,
    /// Samples kept per device
    pub history_capacity: usize,
    /// Offline devices are deregistered after this long
    pub evict_after_s: f64,
    /// Register unknown devices on first heartbeat or drift report
    pub auto_register: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            device_timeout_s: 30.0,
            sweep_interval_s: 5.0,
            degrade_after_rejects: 3,
            history_capacity: 20,
            evict_after_s: 600.0,
            auto_register: true,
        }
    }
}

impl RegistryConfig {
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.device_timeout_s.max(0.0))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sweep_interval_s.max(0.001))
    }

    pub fn evict_after(&self) -> Duration {
        Duration::from_secs_f64(self.evict_after_s.max(0.0))
    }
}

/// Channel queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Topic prefix
    pub topic_prefix: String,
    /// Inbound (node -> controller) queue capacity
    pub inbound_capacity: usize,
    /// Per-node outbound queue capacity
    pub link_queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "syncstream".to_string(),
            inbound_capacity: 256,
            link_queue_capacity: 64,
        }
    }
}

/// Group declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_id: String,
    #[serde(default)]
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SyncStreamConfig::default();
        assert_eq!(config.preprocess.highpass_cutoff_hz, 100.0);
        assert_eq!(config.detector.max_drift_ms, 1000.0);
        assert_eq!(config.detector.min_correlation, 0.7);
        assert_eq!(config.controller.adjustment_rate, 0.2);
        assert_eq!(config.controller.tolerance_ms, 15.0);
        assert_eq!(config.registry.device_timeout_s, 30.0);
        assert_eq!(config.registry.history_capacity, 20);
        assert_eq!(config.sampling.base_interval_s, 5.0);
        assert_eq!(config.sampling.max_interval_s, 60.0);
    }

    #[test]
    fn test_step_clamp_defaults_to_tolerance() {
        let mut controller = ControllerConfig::default();
        assert_eq!(controller.step_clamp_ms(), 15.0);
        controller.max_step_ms = Some(4.0);
        assert_eq!(controller.step_clamp_ms(), 4.0);
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let config: SyncStreamConfig =
            serde_json::from_str(r#"{ "controller": { "tolerance_ms": 8.0 } }"#).unwrap();
        assert_eq!(config.controller.tolerance_ms, 8.0);
        assert_eq!(config.controller.adjustment_rate, 0.2);
        assert!(config.devices.is_empty());
    }
}

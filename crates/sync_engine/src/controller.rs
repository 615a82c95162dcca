//! Offset control math.
//!
//! The controller is pure: it reads device state and returns corrections.
//! The registry applies them.
//!
//! Frame: a node reports its intrinsic drift (measured lag with its applied
//! correction removed). A device is aligned when
//! `offset = base_latency - ema_drift + reference_drift`, where the reference
//! drift is the median smoothed drift of the other aligned members of its
//! group (zero for a device that is effectively alone). Positive error means
//! the device delays more than it should.

use contracts::{ControllerConfig, GroupQuality, OffsetReason};

use crate::history::SampleHistory;
use crate::registry::DeviceState;
use crate::trend::{self, Trend};

/// Derived alignment figures for one sync group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupAlignment {
    /// Common drift the members are steered towards
    pub reference_drift_ms: f64,
    /// Max minus min acoustic lag across aligned members
    pub spread_ms: f64,
    pub quality: GroupQuality,
    /// Reachable members with current drift data
    pub aligned_members: usize,
    pub reachable_members: usize,
}

impl GroupAlignment {
    /// Alignment of a group with no usable member
    pub fn empty() -> Self {
        Self {
            reference_drift_ms: 0.0,
            spread_ms: 0.0,
            quality: GroupQuality::Poor,
            aligned_members: 0,
            reachable_members: 0,
        }
    }
}

/// A single offset change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub new_offset_ms: f64,
    /// Signed change, `new - current`
    pub step_ms: f64,
    pub reason: OffsetReason,
}

/// Result of evaluating one device after a valid sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub correction: Option<Correction>,
    /// Whether the device still has an unfinished correction
    pub correcting: bool,
    pub error_ms: f64,
}

/// Proactive correction derived from the drift trend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub correction: Correction,
    pub trend: Trend,
    pub predicted_drift_ms: f64,
}

#[derive(Debug, Clone)]
pub struct SyncController {
    config: ControllerConfig,
}

impl SyncController {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Exponential smoothing step
    pub fn smooth(&self, ema_ms: f64, raw_ms: f64) -> f64 {
        let alpha = self.config.adjustment_rate;
        alpha * raw_ms + (1.0 - alpha) * ema_ms
    }

    /// A valid sample too far from both the EMA and the history mean.
    ///
    /// Needs `outlier_min_samples` valid samples before it rejects anything;
    /// the standard deviation is floored at `min_outlier_sigma_ms`.
    pub fn is_outlier(&self, history: &SampleHistory, ema_ms: f64, raw_ms: f64) -> bool {
        let stats = history.valid_stats();
        if stats.count < self.config.outlier_min_samples.max(2) {
            return false;
        }
        let threshold =
            self.config.outlier_sigma * stats.std_dev.max(self.config.min_outlier_sigma_ms);
        (raw_ms - ema_ms).abs() > threshold && (raw_ms - stats.mean).abs() > threshold
    }

    /// Reference drift, spread and quality over a group's members
    pub fn group_alignment<'a, I>(&self, members: I) -> GroupAlignment
    where
        I: IntoIterator<Item = &'a DeviceState>,
    {
        let mut reachable = 0;
        let mut emas = Vec::new();
        let mut lags = Vec::new();

        for member in members {
            if !member.status.is_reachable() {
                continue;
            }
            reachable += 1;
            if member.has_alignment() {
                emas.push(member.ema_drift_ms);
                lags.push(member.acoustic_lag_ms());
            }
        }

        if lags.is_empty() {
            return GroupAlignment {
                reachable_members: reachable,
                ..GroupAlignment::empty()
            };
        }

        let reference_drift_ms = if emas.len() >= 2 { median(&mut emas) } else { 0.0 };
        let (min, max) = lags
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let spread_ms = max - min;

        GroupAlignment {
            reference_drift_ms,
            spread_ms,
            quality: GroupQuality::from_spread(spread_ms, &self.config.quality),
            aligned_members: lags.len(),
            reachable_members: reachable,
        }
    }

    /// Offset at which the device is aligned with its group
    pub fn target_offset(&self, state: &DeviceState, group: &GroupAlignment) -> f64 {
        state.profile.base_latency_ms - state.ema_drift_ms + group.reference_drift_ms
    }

    /// Reactive and group evaluation after a valid sample.
    ///
    /// A correction starts once the error exceeds the tolerance and keeps
    /// going on later samples until the error is within `settle_ms`. Inside a
    /// multi-member group a spread above `group_spread_tolerance_ms` also
    /// pulls the device onto the group target.
    pub fn evaluate(&self, state: &DeviceState, group: &GroupAlignment) -> Decision {
        let error = state.current_offset_ms - self.target_offset(state, group);
        let settle = self.config.settle_ms.abs();

        let reason = if error.abs() > self.config.tolerance_ms
            || (state.correcting && error.abs() > settle)
        {
            Some(if state.resync_pending {
                OffsetReason::Resync
            } else {
                OffsetReason::Reactive
            })
        } else if group.aligned_members >= 2
            && group.spread_ms > self.config.group_spread_tolerance_ms
            && error.abs() > settle
        {
            Some(OffsetReason::GroupRebalance)
        } else {
            None
        };

        let Some(reason) = reason else {
            return Decision {
                correction: None,
                correcting: false,
                error_ms: error,
            };
        };

        let clamp = self.config.step_clamp_ms();
        let step = error.clamp(-clamp, clamp);
        Decision {
            correction: Some(Correction {
                new_offset_ms: state.current_offset_ms - step,
                step_ms: -step,
                reason,
            }),
            correcting: (error - step).abs() > settle,
            error_ms: error,
        }
    }

    /// Trend extrapolation ahead of the reactive threshold.
    ///
    /// Fires only for an online, controllable device whose current error is
    /// inside the tolerance but whose extrapolated error exceeds
    /// `trigger_ms`. The step never pushes the current error past the
    /// tolerance.
    pub fn predict(&self, state: &DeviceState, group: &GroupAlignment) -> Option<Prediction> {
        let predictive = &self.config.predictive;
        if !predictive.enabled || !state.is_controllable() || state.manual_override {
            return None;
        }

        let points = state.history.valid_points();
        if points.len() < predictive.min_samples.max(2) {
            return None;
        }
        let trend = trend::fit(&points)?;
        if trend.r2 < predictive.min_r2 || trend.slope_ms_per_s.abs() < predictive.min_slope_ms_per_s
        {
            return None;
        }

        let tolerance = self.config.tolerance_ms;
        let current_error = state.current_offset_ms - self.target_offset(state, group);
        if current_error.abs() > tolerance {
            return None;
        }

        let (last_ts, _) = *points.last()?;
        let predicted_drift_ms = trend.predict(last_ts + predictive.horizon_s);
        let predicted_target =
            state.profile.base_latency_ms - predicted_drift_ms + group.reference_drift_ms;
        let predicted_error = state.current_offset_ms - predicted_target;
        if predicted_error.abs() <= predictive.trigger_ms {
            return None;
        }

        let limit = predictive.step_ms.abs();
        let step = predicted_error.clamp(-limit, limit);
        if (current_error - step).abs() > tolerance {
            return None;
        }

        Some(Prediction {
            correction: Correction {
                new_offset_ms: state.current_offset_ms - step,
                step_ms: -step,
                reason: OffsetReason::Predictive,
            },
            trend,
            predicted_drift_ms,
        })
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use contracts::{DeviceProfile, DeviceStatus, DriftSample};

    fn controller() -> SyncController {
        SyncController::new(ControllerConfig::default())
    }

    fn device(id: &str, base: f64) -> DeviceState {
        let mut profile = DeviceProfile::anonymous(id.into());
        profile.base_latency_ms = base;
        let mut state = DeviceState::new(profile, 20, Instant::now());
        state.status = DeviceStatus::Online;
        state
    }

    fn feed(state: &mut DeviceState, ts: f64, drift: f64) {
        state
            .history
            .push(DriftSample::accepted(state.profile.device_id.clone(), ts, drift, 0.95));
        state.last_valid_at = Some(Instant::now());
    }

    #[test]
    fn test_smoothing_factor() {
        let c = controller();
        assert!((c.smooth(0.0, 20.0) - 4.0).abs() < 1e-12);
        assert!((c.smooth(10.0, 10.0) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_outlier_needs_history() {
        let c = controller();
        let mut state = device("den", 0.0);
        for i in 0..4 {
            feed(&mut state, i as f64, 5.0);
        }
        assert!(!c.is_outlier(&state.history, 5.0, 500.0));
        feed(&mut state, 4.0, 5.0);
        assert!(c.is_outlier(&state.history, 5.0, 500.0));
        assert!(!c.is_outlier(&state.history, 5.0, 6.0));
    }

    #[test]
    fn test_steady_drift_ahead_of_ema_is_not_outlier() {
        let c = controller();
        let mut state = device("den", 0.0);
        let mut ema = 0.0;
        for i in 0..5 {
            feed(&mut state, i as f64, 40.0);
            ema = c.smooth(ema, 40.0);
        }
        // EMA still catching up, far outside 3 floored sigmas of a flat history
        assert!(40.0 - ema > 10.0);
        assert!(!c.is_outlier(&state.history, ema, 40.0));
        assert!(c.is_outlier(&state.history, ema, 400.0));
    }

    #[test]
    fn test_no_correction_inside_tolerance() {
        let c = controller();
        let mut state = device("den", 30.0);
        state.current_offset_ms = 30.0;
        state.ema_drift_ms = 10.0;
        let decision = c.evaluate(&state, &GroupAlignment::empty());
        assert!(decision.correction.is_none());
        assert_eq!(decision.error_ms, 10.0);
    }

    #[test]
    fn test_reactive_step_is_clamped() {
        let c = controller();
        let mut state = device("den", 30.0);
        state.current_offset_ms = 30.0;
        state.ema_drift_ms = 40.0;

        let decision = c.evaluate(&state, &GroupAlignment::empty());
        let correction = decision.correction.unwrap();
        assert_eq!(correction.reason, OffsetReason::Reactive);
        assert_eq!(correction.new_offset_ms, 15.0);
        assert_eq!(correction.step_ms, -15.0);
        assert!(decision.correcting);
    }

    #[test]
    fn test_correction_continues_until_settled() {
        let c = controller();
        let mut state = device("den", 0.0);
        state.ema_drift_ms = 5.0;
        state.correcting = true;

        let decision = c.evaluate(&state, &GroupAlignment::empty());
        assert_eq!(decision.correction.unwrap().new_offset_ms, -5.0);
        assert!(!decision.correcting);

        state.current_offset_ms = -4.5;
        let decision = c.evaluate(&state, &GroupAlignment::empty());
        assert!(decision.correction.is_none());
    }

    #[test]
    fn test_resync_reason() {
        let c = controller();
        let mut state = device("den", 0.0);
        state.ema_drift_ms = -20.0;
        state.resync_pending = true;
        let correction = c.evaluate(&state, &GroupAlignment::empty()).correction.unwrap();
        assert_eq!(correction.reason, OffsetReason::Resync);
        assert_eq!(correction.new_offset_ms, 15.0);
    }

    #[test]
    fn test_group_alignment_median_and_spread() {
        let c = controller();
        let mut a = device("a", 0.0);
        let mut b = device("b", 0.0);
        let mut offline = device("c", 0.0);
        for (state, ema) in [(&mut a, 4.0), (&mut b, 6.0), (&mut offline, 90.0)] {
            state.ema_drift_ms = ema;
            feed(state, 1.0, ema);
        }
        b.current_offset_ms = 10.0;
        offline.status = DeviceStatus::Offline;

        let group = c.group_alignment([&a, &b, &offline]);
        assert_eq!(group.reachable_members, 2);
        assert_eq!(group.aligned_members, 2);
        assert_eq!(group.reference_drift_ms, 5.0);
        assert_eq!(group.spread_ms, 12.0);
        assert_eq!(group.quality, GroupQuality::Fair);
    }

    #[test]
    fn test_group_rebalance_moves_to_target() {
        let c = controller();
        let mut a = device("a", 0.0);
        let mut b = device("b", 0.0);
        for state in [&mut a, &mut b] {
            state.ema_drift_ms = 5.0;
            feed(state, 1.0, 5.0);
        }
        b.current_offset_ms = 10.0;

        let group = c.group_alignment([&a, &b]);
        assert!(c.evaluate(&a, &group).correction.is_none());
        let correction = c.evaluate(&b, &group).correction.unwrap();
        assert_eq!(correction.reason, OffsetReason::GroupRebalance);
        assert_eq!(correction.new_offset_ms, 0.0);
    }

    #[test]
    fn test_lone_member_uses_absolute_frame() {
        let c = controller();
        let mut a = device("a", 0.0);
        a.ema_drift_ms = 7.0;
        feed(&mut a, 1.0, 7.0);
        let group = c.group_alignment([&a]);
        assert_eq!(group.reference_drift_ms, 0.0);
        assert_eq!(group.spread_ms, 0.0);
        assert_eq!(group.quality, GroupQuality::Excellent);
    }

    #[test]
    fn test_predictive_on_steady_trend() {
        let c = controller();
        let mut state = device("den", 0.0);
        for i in 0..8 {
            feed(&mut state, 1000.0 + i as f64 * 5.0, 0.2 * i as f64 * 5.0);
        }
        state.ema_drift_ms = 5.0;

        let prediction = c.predict(&state, &GroupAlignment::empty()).unwrap();
        assert!((prediction.trend.slope_ms_per_s - 0.2).abs() < 1e-9);
        assert_eq!(prediction.correction.reason, OffsetReason::Predictive);
        assert_eq!(prediction.correction.new_offset_ms, -2.0);
    }

    #[test]
    fn test_predictive_skips_flat_or_overridden() {
        let c = controller();
        let mut state = device("den", 0.0);
        for i in 0..8 {
            feed(&mut state, i as f64 * 5.0, 3.0);
        }
        assert!(c.predict(&state, &GroupAlignment::empty()).is_none());

        let mut rising = device("den", 0.0);
        for i in 0..8 {
            feed(&mut rising, i as f64 * 5.0, i as f64 * 5.0);
        }
        rising.manual_override = true;
        assert!(c.predict(&rising, &GroupAlignment::empty()).is_none());
        rising.manual_override = false;
        rising.frozen = true;
        assert!(c.predict(&rising, &GroupAlignment::empty()).is_none());
    }
}

//! Serialized sync path.
//!
//! `SyncCore` owns the registry and the controller and processes one message
//! at a time, so every device sees its offset commands in submission order.
//! The engine actor drives it; tests drive it directly with explicit time.

use std::time::Instant;

use channel::{CommandPayload, DriftReport, Message, Target};
use contracts::{
    unix_now, DetectorConfig, DeviceId, DeviceProfile, DeviceSnapshot, DeviceStatus, DriftSample,
    NodeCommand, OffsetCommand, OffsetReason, RejectReason, SyncGroup, SyncStreamConfig,
};
use observability::{MetricsSummary, SyncMetricsAggregator};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::controller::{Correction, GroupAlignment, SyncController};
use crate::error::RegistryError;
use crate::registry::{DeviceRegistry, RegisterOutcome, SampleOutcome, StatusChange, SweepReport};

/// What a resync request covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncScope {
    Device(DeviceId),
    Group(String),
    All,
}

/// Fleet-wide summary for the monitoring layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub device_count: usize,
    pub online_devices: usize,
    pub degraded_devices: usize,
    pub offline_devices: usize,
    pub group_count: usize,
    /// Offset commands issued
    pub sync_events: u64,
    /// Mean |smoothed drift| over reachable devices with data
    pub average_drift_ms: f64,
    pub max_drift_ms: f64,
}

pub struct SyncCore {
    registry: DeviceRegistry,
    controller: SyncController,
    limits: DetectorConfig,
    aggregator: SyncMetricsAggregator,
    sync_events: u64,
}

impl SyncCore {
    /// Build the core and pre-register the statically configured devices
    pub fn new(config: &SyncStreamConfig, now: Instant) -> Result<Self, RegistryError> {
        let mut registry = DeviceRegistry::new(
            config.registry.clone(),
            config.controller.stability_window(),
            &config.groups,
        );
        for profile in &config.devices {
            registry.register(profile.clone(), now)?;
        }

        Ok(Self {
            registry,
            controller: SyncController::new(config.controller.clone()),
            limits: config.detector.clone(),
            aggregator: SyncMetricsAggregator::new(),
            sync_events: 0,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn controller(&self) -> &SyncController {
        &self.controller
    }

    /// Route one inbound message, returning outbound messages
    pub fn handle_message(&mut self, message: Message, now: Instant) -> Vec<Message> {
        let result = match message {
            Message::Drift(report) => self
                .handle_drift(report, now)
                .map(|command| command.map(Message::BufferOffset).into_iter().collect()),
            Message::Heartbeat { device_id, payload } => {
                debug!(device_id = %device_id, sequence = ?payload.sequence, "Heartbeat");
                self.heartbeat(&device_id, now).map(|_| Vec::new())
            }
            Message::Status(status) => {
                debug!(
                    device_id = %status.device_id,
                    is_playing = status.is_playing,
                    offset_ms = status.current_offset_ms,
                    "Status report"
                );
                self.heartbeat(&status.device_id, now).map(|_| Vec::new())
            }
            Message::Register(profile) => self.register(profile, now),
            Message::BufferOffset(_) | Message::Command { .. } => {
                warn!(kind = message.kind().as_str(), "Node-bound message on inbound channel");
                Ok(Vec::new())
            }
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Inbound message rejected");
            Vec::new()
        })
    }

    /// Announce. Re-announce of a known device replays its authoritative offset.
    pub fn register(
        &mut self,
        profile: DeviceProfile,
        now: Instant,
    ) -> Result<Vec<Message>, RegistryError> {
        let device_id = profile.device_id.clone();
        let group_id = profile.sync_group.clone();
        let (outcome, change) = self.registry.register(profile, now)?;
        self.note_change(change);

        let mut outbound = Vec::new();
        if let RegisterOutcome::Updated { previous_group } = outcome {
            if let Some(previous) = previous_group {
                self.refresh_group(&previous);
            }
            if let Some(state) = self.registry.get(&device_id) {
                outbound.push(Message::BufferOffset(OffsetCommand {
                    device_id: device_id.clone(),
                    new_offset_ms: state.current_offset_ms(),
                    reason: OffsetReason::Resync,
                    issued_at: unix_now(),
                }));
            }
        }
        self.refresh_group(&group_id);
        self.record_counts();
        Ok(outbound)
    }

    pub fn heartbeat(&mut self, device_id: &DeviceId, now: Instant) -> Result<(), RegistryError> {
        let change = self.registry.touch(device_id, now)?;
        self.note_change(change);
        Ok(())
    }

    /// Process one drift report; returns the correction it caused, if any
    #[instrument(
        level = "debug",
        name = "sync_core_drift",
        skip(self, report, now),
        fields(device_id = %report.device_id, raw_drift_ms = report.raw_drift_ms)
    )]
    pub fn handle_drift(
        &mut self,
        report: DriftReport,
        now: Instant,
    ) -> Result<Option<OffsetCommand>, RegistryError> {
        if !report.timestamp.is_finite() {
            warn!(device_id = %report.device_id, "Drift report without a usable timestamp");
            return Ok(None);
        }
        let sample = self.revalidate(report);
        let device_id = sample.device_id.clone();
        let raw = sample.raw_drift_ms;

        let outlier = sample.valid
            && self.registry.get(&device_id).is_some_and(|state| {
                self.controller
                    .is_outlier(state.history(), state.ema_drift_ms(), raw)
            });

        let recorded = sample.clone();
        let outcome = self.registry.record_sample(sample, outlier, now)?;
        if outcome != SampleOutcome::Duplicate {
            observability::record_drift_sample(&recorded);
            self.aggregator.update_sample(&recorded);
        }

        match outcome {
            SampleOutcome::Duplicate => {
                self.aggregator.update_duplicate();
                Ok(None)
            }
            SampleOutcome::Rejected { reason, change } => {
                debug!(
                    device_id = %device_id,
                    reason = reason.map(|r| r.as_str()).unwrap_or("unknown"),
                    "Drift sample rejected"
                );
                self.note_change(change);
                Ok(None)
            }
            SampleOutcome::Accepted { outlier: true, change } => {
                info!(device_id = %device_id, raw_drift_ms = raw, "Outlier kept out of EMA");
                observability::record_outlier(&device_id);
                self.aggregator.update_outlier();
                self.note_change(change);
                Ok(None)
            }
            SampleOutcome::Accepted { outlier: false, change } => {
                self.note_change(change);
                self.apply_valid_sample(&device_id, raw)
            }
        }
    }

    fn apply_valid_sample(
        &mut self,
        device_id: &DeviceId,
        raw: f64,
    ) -> Result<Option<OffsetCommand>, RegistryError> {
        let state = self
            .registry
            .get(device_id)
            .ok_or_else(|| RegistryError::unknown_device(device_id))?;
        let ema = self.controller.smooth(state.ema_drift_ms(), raw);
        let group_id = state.sync_group().to_string();
        self.registry.set_ema(device_id, ema);
        observability::record_ema(device_id, ema);

        let alignment = self.refresh_group(&group_id);
        let state = self
            .registry
            .get(device_id)
            .ok_or_else(|| RegistryError::unknown_device(device_id))?;
        if !state.is_controllable() {
            return Ok(None);
        }
        let decision = self.controller.evaluate(state, &alignment);
        self.registry.settle(device_id, decision.correcting);

        debug!(
            device_id = %device_id,
            ema_drift_ms = ema,
            error_ms = decision.error_ms,
            spread_ms = alignment.spread_ms,
            "Drift evaluated"
        );

        match decision.correction {
            Some(correction) => self.issue(device_id, correction).map(Some),
            None => Ok(None),
        }
    }

    /// Trend-based proactive corrections across every group
    #[instrument(level = "debug", name = "sync_core_predictive", skip(self))]
    pub fn predictive_pass(&mut self) -> Vec<OffsetCommand> {
        let mut commands = Vec::new();

        for group_id in self.registry.group_ids() {
            let alignment = self.refresh_group(&group_id);
            let predictions: Vec<_> = self
                .registry
                .members(&group_id)
                .filter_map(|state| {
                    self.controller
                        .predict(state, &alignment)
                        .map(|p| (state.device_id().clone(), p))
                })
                .collect();

            for (device_id, prediction) in predictions {
                debug!(
                    device_id = %device_id,
                    slope_ms_per_s = prediction.trend.slope_ms_per_s,
                    r2 = prediction.trend.r2,
                    predicted_drift_ms = prediction.predicted_drift_ms,
                    "Drift trend detected"
                );
                match self.issue(&device_id, prediction.correction) {
                    Ok(command) => commands.push(command),
                    Err(e) => warn!(device_id = %device_id, error = %e, "Predictive step dropped"),
                }
            }
        }

        commands
    }

    /// Operator-set offset; holds until the device's next valid sample
    pub fn manual_offset(
        &mut self,
        device_id: &DeviceId,
        offset_ms: f64,
    ) -> Result<OffsetCommand, RegistryError> {
        if !offset_ms.is_finite() {
            return Err(RegistryError::InvalidOffset { offset_ms });
        }
        let state = self
            .registry
            .get(device_id)
            .ok_or_else(|| RegistryError::unknown_device(device_id))?;
        let correction = Correction {
            new_offset_ms: offset_ms,
            step_ms: offset_ms - state.current_offset_ms(),
            reason: OffsetReason::Manual,
        };
        let command = self.issue(device_id, correction)?;
        self.registry.set_manual_override(device_id);
        Ok(command)
    }

    /// Reset smoothing and history, and tell the nodes to resync
    pub fn resync(&mut self, scope: ResyncScope) -> Result<Vec<Message>, RegistryError> {
        let resync = CommandPayload::new(NodeCommand::Resync);

        let (devices, target): (Vec<DeviceId>, Option<Target>) = match &scope {
            ResyncScope::Device(device_id) => (vec![device_id.clone()], None),
            ResyncScope::Group(group_id) => {
                let group = self.registry.group(group_id).ok_or_else(|| {
                    RegistryError::UnknownGroup {
                        group_id: group_id.clone(),
                    }
                })?;
                (group.member_device_ids.iter().cloned().collect(), None)
            }
            ResyncScope::All => (
                self.registry.devices().map(|s| s.device_id().clone()).collect(),
                Some(Target::All),
            ),
        };

        let mut outbound = Vec::new();
        for device_id in &devices {
            self.registry.resync(device_id)?;
            let reachable = self
                .registry
                .get(device_id)
                .is_some_and(|s| s.status().is_reachable());
            if target.is_none() && reachable {
                outbound.push(Message::Command {
                    target: Target::Device(device_id.clone()),
                    payload: resync.clone(),
                });
            }
        }
        if let Some(target) = target {
            outbound.push(Message::Command {
                target,
                payload: resync,
            });
        }

        for group_id in self.registry.group_ids() {
            self.refresh_group(&group_id);
        }
        info!(scope = ?scope, devices = devices.len(), "Resync requested");
        Ok(outbound)
    }

    pub fn deregister(&mut self, device_id: &DeviceId) -> Result<(), RegistryError> {
        let state = self.registry.deregister(device_id)?;
        self.refresh_group(state.sync_group());
        self.record_counts();
        Ok(())
    }

    /// Periodic liveness sweep
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let report = self.registry.sweep(now);
        for change in &report.changes {
            self.note_change(Some(change.clone()));
        }
        for device_id in &report.evicted {
            info!(device_id = %device_id, "Offline device evicted");
        }
        for group_id in &report.touched_groups {
            self.refresh_group(group_id);
        }
        self.record_counts();
        report
    }

    pub fn note_decode_failure(&mut self) {
        self.aggregator.update_decode_failure();
    }

    pub fn snapshot(&self, device_id: &DeviceId, now: Instant) -> Option<DeviceSnapshot> {
        self.registry.snapshot(device_id, now)
    }

    pub fn snapshots(&self, now: Instant) -> Vec<DeviceSnapshot> {
        self.registry.snapshots(now)
    }

    pub fn groups(&self) -> Vec<SyncGroup> {
        self.registry.groups()
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        self.aggregator.summary()
    }

    pub fn status(&self) -> SyncStatus {
        let mut status = SyncStatus {
            device_count: self.registry.len(),
            group_count: self.registry.groups().len(),
            sync_events: self.sync_events,
            ..Default::default()
        };
        let mut drifts = Vec::new();
        for state in self.registry.devices() {
            match state.status() {
                DeviceStatus::Online => status.online_devices += 1,
                DeviceStatus::Degraded => status.degraded_devices += 1,
                DeviceStatus::Offline => status.offline_devices += 1,
                DeviceStatus::Registering => {}
            }
            if state.has_alignment() {
                drifts.push(state.ema_drift_ms().abs());
            }
        }
        if !drifts.is_empty() {
            status.average_drift_ms = drifts.iter().sum::<f64>() / drifts.len() as f64;
            status.max_drift_ms = drifts.iter().copied().fold(0.0, f64::max);
        }
        status
    }

    /// Apply a correction through the registry and build its command
    fn issue(
        &mut self,
        device_id: &DeviceId,
        correction: Correction,
    ) -> Result<OffsetCommand, RegistryError> {
        let command = OffsetCommand {
            device_id: device_id.clone(),
            new_offset_ms: correction.new_offset_ms,
            reason: correction.reason,
            issued_at: unix_now(),
        };
        let previous = self.registry.apply_command(&command)?;
        self.sync_events += 1;
        observability::record_offset_command(&command, correction.step_ms);
        self.aggregator.update_command(&command, correction.step_ms);

        info!(
            device_id = %device_id,
            reason = command.reason.as_str(),
            previous_ms = previous,
            offset_ms = command.new_offset_ms,
            "Offset command issued"
        );

        if let Some(group_id) = self.registry.get(device_id).map(|s| s.sync_group().to_string()) {
            self.refresh_group(&group_id);
        }
        Ok(command)
    }

    /// Recompute reference drift, spread and quality of a group
    fn refresh_group(&mut self, group_id: &str) -> GroupAlignment {
        let alignment = self
            .controller
            .group_alignment(self.registry.members(group_id));
        self.registry.set_group_alignment(group_id, &alignment);
        if self.registry.group(group_id).is_some() {
            observability::record_group_quality(group_id, alignment.spread_ms, alignment.quality);
        }
        alignment
    }

    fn note_change(&mut self, change: Option<StatusChange>) {
        if let Some(change) = change {
            observability::record_status_transition(&change.device_id, change.from, change.to);
            self.aggregator.update_transition();
        }
    }

    fn record_counts(&self) {
        let online = self
            .registry
            .devices()
            .filter(|s| s.status() == DeviceStatus::Online)
            .count();
        observability::record_device_counts(self.registry.len(), online);
    }

    /// The controller re-checks score and range; a node-side rejection within
    /// both limits is an ambiguous peak.
    fn revalidate(&self, report: DriftReport) -> DriftSample {
        let score = report.correlation_score;
        let drift = report.raw_drift_ms;
        let reason = if !score.is_finite() || score < self.limits.min_correlation {
            Some(RejectReason::LowCorrelation)
        } else if !drift.is_finite() || drift.abs() > self.limits.max_drift_ms {
            Some(RejectReason::DriftOutOfRange)
        } else if report.valid == Some(false) {
            Some(RejectReason::AmbiguousPeak)
        } else {
            None
        };

        match reason {
            None => DriftSample::accepted(report.device_id, report.timestamp, drift, score),
            Some(reason) => {
                DriftSample::rejected(report.device_id, report.timestamp, drift, score, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use contracts::{ControllerConfig, GroupConfig, GroupQuality, RegistryConfig};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn config() -> SyncStreamConfig {
        SyncStreamConfig {
            controller: ControllerConfig {
                tolerance_ms: 15.0,
                adjustment_rate: 0.2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn profile(id: &str, group: &str, base: f64) -> DeviceProfile {
        DeviceProfile {
            sync_group: group.to_string(),
            base_latency_ms: base,
            ..DeviceProfile::anonymous(id.into())
        }
    }

    fn report(id: &str, ts: f64, drift: f64, score: f64) -> DriftReport {
        DriftReport {
            device_id: id.into(),
            raw_drift_ms: drift,
            correlation_score: score,
            timestamp: ts,
            valid: Some(true),
        }
    }

    fn offset(core: &SyncCore, id: &str) -> f64 {
        core.registry.get(&id.into()).unwrap().current_offset_ms()
    }

    fn ema(core: &SyncCore, id: &str) -> f64 {
        core.registry.get(&id.into()).unwrap().ema_drift_ms()
    }

    #[test]
    fn test_resync_then_perfect_sample_keeps_offset() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.register(profile("den", "default", 35.0), now).unwrap();
        core.handle_drift(report("den", 1.0, 0.0, 1.0), now).unwrap();

        let messages = core.resync(ResyncScope::Device("den".into())).unwrap();
        assert_eq!(messages.len(), 1);
        let before = offset(&core, "den");

        let command = core.handle_drift(report("den", 2.0, 0.0, 1.0), now).unwrap();
        assert!(command.is_none());
        assert_eq!(offset(&core, "den"), before);
        assert_eq!(ema(&core, "den"), 0.0);

        // resync is idempotent
        core.resync(ResyncScope::Device("den".into())).unwrap();
        core.resync(ResyncScope::Device("den".into())).unwrap();
        assert!(core.handle_drift(report("den", 3.0, 0.0, 1.0), now).unwrap().is_none());
        assert_eq!(offset(&core, "den"), before);
    }

    #[test]
    fn test_resync_keeps_offset_settled_away_from_base() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.register(profile("den", "default", 0.0), now).unwrap();
        for i in 0..40 {
            core.handle_drift(report("den", i as f64, 40.0, 0.95), now).unwrap();
        }
        let settled = offset(&core, "den");
        assert!(settled < -20.0, "offset {settled}");

        core.resync(ResyncScope::Device("den".into())).unwrap();
        assert!((ema(&core, "den") + settled).abs() < 1e-9);

        // unchanged drift
        let command = core.handle_drift(report("den", 40.0, 40.0, 1.0), now).unwrap();
        assert!(command.is_none(), "{command:?}");
        assert_eq!(offset(&core, "den"), settled);

        // acoustically perfect: the node hears no lag under its offset
        core.resync(ResyncScope::Device("den".into())).unwrap();
        let command = core.handle_drift(report("den", 41.0, -settled, 1.0), now).unwrap();
        assert!(command.is_none(), "{command:?}");
        assert_eq!(offset(&core, "den"), settled);
        assert!((ema(&core, "den") + settled).abs() < 1e-9);

        // zero intrinsic drift after resync moves at most a fraction of the gap
        core.resync(ResyncScope::Device("den".into())).unwrap();
        assert!(core.handle_drift(report("den", 42.0, 0.0, 1.0), now).unwrap().is_none());
        assert_eq!(offset(&core, "den"), settled);
    }

    #[test]
    fn test_group_resync_keeps_aligned_members() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.register(profile("a", "upstairs", 0.0), now).unwrap();
        core.register(profile("b", "upstairs", 20.0), now).unwrap();
        for round in 0..40 {
            let ts = round as f64;
            core.handle_drift(report("a", ts, 30.0, 0.95), now).unwrap();
            core.handle_drift(report("b", ts, -10.0, 0.95), now).unwrap();
        }
        let before = (offset(&core, "a"), offset(&core, "b"));
        let spread = core.registry.group("upstairs").unwrap().spread_ms;
        assert!(spread < 2.0, "spread {spread}");

        core.resync(ResyncScope::Group("upstairs".to_string())).unwrap();
        assert!(core.registry.group("upstairs").unwrap().spread_ms < 2.0);

        let mut commands = 0;
        for (i, (id, drift)) in [("a", 30.0), ("b", -10.0)].into_iter().enumerate() {
            if let Some(command) = core.handle_drift(report(id, 40.0 + i as f64, drift, 1.0), now).unwrap() {
                assert_eq!(command.reason, OffsetReason::Resync);
                commands += 1;
            }
        }
        let after = (offset(&core, "a"), offset(&core, "b"));
        // at most a settle-sized touch-up, never a clamp-sized jump
        let settle = core.controller().config().settle_ms;
        assert!((after.0 - before.0).abs() <= 2.0 * settle + 1e-9, "{before:?} -> {after:?}");
        assert!((after.1 - before.1).abs() <= 2.0 * settle + 1e-9, "{before:?} -> {after:?}");
        assert!(commands <= 2);
    }

    #[test]
    fn test_constant_drift_converges_without_oscillation() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.register(profile("den", "default", 0.0), now).unwrap();
        let clamp = core.controller().config().step_clamp_ms();

        let mut last_ema = 0.0;
        let mut last_offset = offset(&core, "den");
        for i in 0..20 {
            if let Some(command) = core.handle_drift(report("den", i as f64, 20.0, 0.95), now).unwrap() {
                let step = command.new_offset_ms - last_offset;
                assert!(step <= 0.0, "correction reversed direction");
                assert!(step.abs() <= clamp + 1e-9);
            }
            let current = ema(&core, "den");
            assert!(current >= last_ema);
            last_ema = current;
            last_offset = offset(&core, "den");
        }

        assert!((ema(&core, "den") - 20.0).abs() < 1.0);
        let state = core.registry.get(&"den".into()).unwrap();
        let error = state.current_offset_ms() - (0.0 - state.ema_drift_ms());
        assert!(error.abs() <= 15.0);
        assert!(core.status().sync_events >= 1);
    }

    #[test]
    fn test_outlier_does_not_move_ema() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.register(profile("den", "default", 0.0), now).unwrap();
        for i in 0..10 {
            let drift = if i % 2 == 0 { 4.9 } else { 5.1 };
            core.handle_drift(report("den", i as f64, drift, 0.95), now).unwrap();
        }
        let before = ema(&core, "den");
        let history_before = core.registry.get(&"den".into()).unwrap().history().len();

        // 10 sigma away (sigma floored at 1 ms)
        let command = core.handle_drift(report("den", 10.0, 15.0, 0.95), now).unwrap();
        assert!(command.is_none());

        let state = core.registry.get(&"den".into()).unwrap();
        assert_eq!(state.ema_drift_ms(), before);
        assert_eq!(state.history().len(), history_before + 1);
        assert_eq!(state.history().latest().map(|s| s.raw_drift_ms), Some(15.0));
        assert_eq!(core.metrics_summary().outliers, 1);
    }

    #[test]
    fn test_group_spread_converges() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.register(profile("a", "upstairs", 0.0), now).unwrap();
        core.register(profile("b", "upstairs", 0.0), now).unwrap();
        core.manual_offset(&"b".into(), 10.0).unwrap();

        let clamp = core.controller().config().step_clamp_ms();
        let mut rng = StdRng::seed_from_u64(7);
        for round in 0..30 {
            let shared = 5.0 + rng.random_range(-0.3..0.3);
            for id in ["a", "b"] {
                let ts = round as f64;
                // node reports intrinsic drift, identical for both
                if let Some(command) = core.handle_drift(report(id, ts, shared, 0.95), now).unwrap() {
                    let state = core.registry.get(&id.into()).unwrap();
                    let group = core.registry.group("upstairs").unwrap();
                    let target = state.profile().base_latency_ms - state.ema_drift_ms()
                        + group.target_group_offset_ms;
                    assert!((command.new_offset_ms - target).abs() <= clamp + 1e-9);
                }
            }
        }

        let group = core.registry.group("upstairs").unwrap();
        assert!(group.spread_ms < 2.0, "spread {}", group.spread_ms);
        assert_eq!(group.quality, GroupQuality::Excellent);
        assert!(core.metrics_summary().commands.contains_key("group_rebalance"));
    }

    #[test]
    fn test_manual_override_until_next_valid_sample() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.register(profile("den", "default", 0.0), now).unwrap();
        core.handle_drift(report("den", 1.0, 0.0, 0.95), now).unwrap();

        let command = core.manual_offset(&"den".into(), 80.0).unwrap();
        assert_eq!(command.reason, OffsetReason::Manual);
        assert!(core.registry.get(&"den".into()).unwrap().manual_override());

        // rejected samples do not end the override
        core.handle_drift(report("den", 2.0, 0.0, 0.1), now).unwrap();
        assert!(core.registry.get(&"den".into()).unwrap().manual_override());

        let command = core.handle_drift(report("den", 3.0, 0.0, 0.95), now).unwrap();
        assert!(!core.registry.get(&"den".into()).unwrap().manual_override());
        let command = command.unwrap();
        assert_eq!(command.reason, OffsetReason::Reactive);
        assert_eq!(command.new_offset_ms, 65.0);
    }

    #[test]
    fn test_manual_offset_rejects_offline_and_unknown() {
        let t0 = Instant::now();
        let mut core = SyncCore::new(&config(), t0).unwrap();
        core.register(profile("den", "default", 0.0), t0).unwrap();
        core.sweep(t0 + Duration::from_secs(31));

        assert!(matches!(
            core.manual_offset(&"den".into(), 5.0),
            Err(RegistryError::DeviceOffline { .. })
        ));
        assert!(matches!(
            core.manual_offset(&"ghost".into(), 5.0),
            Err(RegistryError::UnknownDevice { .. })
        ));
        assert!(matches!(
            core.manual_offset(&"den".into(), f64::NAN),
            Err(RegistryError::InvalidOffset { .. })
        ));
    }

    #[test]
    fn test_timeout_freezes_offset() {
        let t0 = Instant::now();
        let mut core = SyncCore::new(&config(), t0).unwrap();
        core.register(profile("den", "default", 12.0), t0).unwrap();
        core.handle_drift(report("den", 1.0, 40.0, 0.95), t0).unwrap();
        let before = offset(&core, "den");

        let report = core.sweep(t0 + Duration::from_secs(31));
        assert_eq!(report.changes.len(), 1);
        assert_eq!(offset(&core, "den"), before);
        assert_eq!(core.status().offline_devices, 1);
        assert!(core.sweep(t0 + Duration::from_secs(45)).changes.is_empty());
    }

    #[test]
    fn test_revalidation_reclassifies_reports() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.handle_drift(report("den", 1.0, 5.0, 0.3), now).unwrap();
        core.handle_drift(report("den", 2.0, 5000.0, 0.9), now).unwrap();
        let mut ambiguous = report("den", 3.0, 5.0, 0.9);
        ambiguous.valid = Some(false);
        core.handle_drift(ambiguous, now).unwrap();

        let state = core.registry.get(&"den".into()).unwrap();
        assert_eq!(state.stats.rejected_low_correlation, 1);
        assert_eq!(state.stats.rejected_out_of_range, 1);
        assert_eq!(state.stats.rejected_ambiguous, 1);
        assert_eq!(state.status(), DeviceStatus::Degraded);
    }

    #[test]
    fn test_duplicate_report_counted_once() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.handle_drift(report("den", 1.0, 40.0, 0.95), now).unwrap();
        core.handle_drift(report("den", 1.0, 40.0, 0.95), now).unwrap();
        let summary = core.metrics_summary();
        assert_eq!(summary.total_samples, 1);
        assert_eq!(summary.duplicates, 1);
    }

    #[test]
    fn test_resync_group_and_all() {
        let now = Instant::now();
        let config = SyncStreamConfig {
            groups: vec![GroupConfig {
                group_id: "upstairs".to_string(),
                priority: 1,
            }],
            ..config()
        };
        let mut core = SyncCore::new(&config, now).unwrap();
        core.register(profile("a", "upstairs", 0.0), now).unwrap();
        core.register(profile("b", "upstairs", 0.0), now).unwrap();
        core.register(profile("c", "patio", 0.0), now).unwrap();

        let messages = core.resync(ResyncScope::Group("upstairs".to_string())).unwrap();
        assert_eq!(messages.len(), 2);

        let messages = core.resync(ResyncScope::All).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            Message::Command { target: Target::All, payload } if payload.command == NodeCommand::Resync
        ));

        assert!(matches!(
            core.resync(ResyncScope::Group("attic".to_string())),
            Err(RegistryError::UnknownGroup { .. })
        ));
    }

    #[test]
    fn test_static_devices_preregistered() {
        let now = Instant::now();
        let config = SyncStreamConfig {
            devices: vec![profile("kitchen", "default", 20.0)],
            registry: RegistryConfig {
                auto_register: false,
                ..Default::default()
            },
            ..config()
        };
        let mut core = SyncCore::new(&config, now).unwrap();
        assert_eq!(core.snapshots(now).len(), 1);
        assert!(core.heartbeat(&"ghost".into(), now).is_err());
        assert!(core.heartbeat(&"kitchen".into(), now).is_ok());
    }

    #[test]
    fn test_reannounce_replays_offset() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        assert!(core.register(profile("den", "default", 0.0), now).unwrap().is_empty());
        core.manual_offset(&"den".into(), 7.5).unwrap();

        let messages = core.register(profile("den", "default", 0.0), now).unwrap();
        assert!(matches!(
            &messages[..],
            [Message::BufferOffset(command)] if command.new_offset_ms == 7.5
        ));
    }

    #[test]
    fn test_predictive_pass_on_drifting_device() {
        let now = Instant::now();
        let mut core = SyncCore::new(&config(), now).unwrap();
        core.register(profile("den", "default", 0.0), now).unwrap();
        // slow linear drift, below the reactive threshold
        for i in 0..8 {
            let ts = 1000.0 + i as f64 * 5.0;
            core.handle_drift(report("den", ts, i as f64, 0.95), now).unwrap();
        }
        let before = offset(&core, "den");
        let commands = core.predictive_pass();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].reason, OffsetReason::Predictive);
        assert!(commands[0].new_offset_ms < before);
    }
}

//! Device registry: per-device state, group membership, liveness.
//!
//! State machine: `Registering -> Online <-> Degraded -> Offline`, and
//! `Offline -> Registering` on re-contact. Timeouts are only evaluated by
//! [`DeviceRegistry::sweep`]; message handlers never expire anything.
//!
//! Every time argument is a monotonic `Instant` supplied by the caller.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use contracts::{
    DeviceId, DeviceProfile, DeviceSnapshot, DeviceStats, DeviceStatus, DriftSample, GroupConfig,
    OffsetCommand, RegistryConfig, RejectReason, SyncGroup,
};
use tracing::{debug, info, warn};

use crate::controller::GroupAlignment;
use crate::error::RegistryError;
use crate::history::SampleHistory;

/// Live state of one registered node
#[derive(Debug)]
pub struct DeviceState {
    pub(crate) profile: DeviceProfile,
    pub(crate) current_offset_ms: f64,
    pub(crate) ema_drift_ms: f64,
    pub(crate) last_raw_drift_ms: f64,
    pub(crate) last_correlation: f64,
    pub(crate) status: DeviceStatus,
    pub(crate) last_seen: Instant,
    pub(crate) last_valid_at: Option<Instant>,
    pub(crate) offline_since: Option<Instant>,
    pub(crate) history: SampleHistory,
    pub(crate) reject_streak: u32,
    /// Correction in progress, continues until settled
    pub(crate) correcting: bool,
    /// Operator offset in force until the next valid sample
    pub(crate) manual_override: bool,
    /// Next correction is reported as a resync
    pub(crate) resync_pending: bool,
    /// No valid sample within the stability window
    pub(crate) frozen: bool,
    /// Newest processed sample timestamp
    pub(crate) last_sample_ts: Option<f64>,
    pub(crate) stats: DeviceStats,
}

impl DeviceState {
    pub(crate) fn new(profile: DeviceProfile, history_capacity: usize, now: Instant) -> Self {
        Self {
            current_offset_ms: profile.base_latency_ms,
            profile,
            ema_drift_ms: 0.0,
            last_raw_drift_ms: 0.0,
            last_correlation: 0.0,
            status: DeviceStatus::Registering,
            last_seen: now,
            last_valid_at: None,
            offline_since: None,
            history: SampleHistory::new(history_capacity),
            reject_streak: 0,
            correcting: false,
            manual_override: false,
            resync_pending: false,
            frozen: false,
            last_sample_ts: None,
            stats: DeviceStats::default(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.profile.device_id
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn sync_group(&self) -> &str {
        &self.profile.sync_group
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn current_offset_ms(&self) -> f64 {
        self.current_offset_ms
    }

    pub fn ema_drift_ms(&self) -> f64 {
        self.ema_drift_ms
    }

    pub fn history(&self) -> &SampleHistory {
        &self.history
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn manual_override(&self) -> bool {
        self.manual_override
    }

    /// Lag heard at the microphone under the current offset
    pub fn acoustic_lag_ms(&self) -> f64 {
        self.ema_drift_ms + self.current_offset_ms - self.profile.base_latency_ms
    }

    /// Contributes to group reference and spread
    pub fn has_alignment(&self) -> bool {
        self.status.is_reachable() && !self.frozen && self.last_valid_at.is_some()
    }

    /// Eligible for controller-originated commands
    pub fn is_controllable(&self) -> bool {
        self.status == DeviceStatus::Online && !self.frozen
    }

    fn snapshot(&self, now: Instant) -> DeviceSnapshot {
        let history = self.history.valid_stats();
        DeviceSnapshot {
            device_id: self.profile.device_id.clone(),
            device_name: self.profile.device_name.clone(),
            device_type: self.profile.device_type,
            sync_group: self.profile.sync_group.clone(),
            base_latency_ms: self.profile.base_latency_ms,
            current_offset_ms: self.current_offset_ms,
            ema_drift_ms: self.ema_drift_ms,
            last_raw_drift_ms: self.last_raw_drift_ms,
            last_correlation: self.last_correlation,
            status: self.status,
            last_seen_ago_ms: now.saturating_duration_since(self.last_seen).as_millis() as u64,
            manual_override: self.manual_override,
            history_len: self.history.len(),
            stats: DeviceStats {
                mean_drift_ms: history.mean,
                std_drift_ms: history.std_dev,
                ..self.stats.clone()
            },
        }
    }
}

/// Status change produced by a registry operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub device_id: DeviceId,
    pub from: DeviceStatus,
    pub to: DeviceStatus,
}

/// How an announce was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    /// Known device re-announced; `previous_group` is set when it moved
    Updated { previous_group: Option<String> },
}

/// How a drift sample was handled
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Timestamp not newer than the last processed sample
    Duplicate,
    Rejected {
        reason: Option<RejectReason>,
        change: Option<StatusChange>,
    },
    /// Valid sample; `outlier` samples are kept out of the EMA
    Accepted {
        outlier: bool,
        change: Option<StatusChange>,
    },
}

/// Result of one liveness sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub changes: Vec<StatusChange>,
    /// Devices frozen for lack of valid samples
    pub frozen: Vec<DeviceId>,
    pub evicted: Vec<DeviceId>,
    /// Groups whose membership or reachability changed
    pub touched_groups: BTreeSet<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.frozen.is_empty() && self.evicted.is_empty()
    }
}

/// Owner of every `DeviceState` and `SyncGroup`
#[derive(Debug)]
pub struct DeviceRegistry {
    config: RegistryConfig,
    stability_window: Duration,
    devices: HashMap<DeviceId, DeviceState>,
    groups: BTreeMap<String, SyncGroup>,
    /// Groups from configuration are kept even when empty
    declared_groups: BTreeSet<String>,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig, stability_window: Duration, groups: &[GroupConfig]) -> Self {
        let groups_map = groups
            .iter()
            .map(|g| (g.group_id.clone(), SyncGroup::new(g.group_id.clone(), g.priority)))
            .collect();
        Self {
            config,
            stability_window,
            devices: HashMap::new(),
            groups: groups_map,
            declared_groups: groups.iter().map(|g| g.group_id.clone()).collect(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceState> {
        self.devices.values()
    }

    pub fn group(&self, group_id: &str) -> Option<&SyncGroup> {
        self.groups.get(group_id)
    }

    /// Current members of a group
    pub fn members<'a>(&'a self, group_id: &str) -> impl Iterator<Item = &'a DeviceState> + 'a {
        self.groups
            .get(group_id)
            .into_iter()
            .flat_map(|g| g.member_device_ids.iter())
            .filter_map(|id| self.devices.get(id))
    }

    /// Create or update a device from its profile.
    ///
    /// Re-announce of an offline device moves it to `Registering`. A changed
    /// `sync_group` moves the device between groups in one step.
    pub fn register(
        &mut self,
        profile: DeviceProfile,
        now: Instant,
    ) -> Result<(RegisterOutcome, Option<StatusChange>), RegistryError> {
        if !profile.device_id.is_addressable() {
            return Err(RegistryError::InvalidDeviceId {
                device_id: profile.device_id.to_string(),
            });
        }
        let device_id = profile.device_id.clone();
        let group_id = profile.sync_group.clone();

        let Some(state) = self.devices.get_mut(&device_id) else {
            info!(
                device_id = %device_id,
                group_id = %group_id,
                base_latency_ms = profile.base_latency_ms,
                "Device registered"
            );
            let state = DeviceState::new(profile, self.config.history_capacity, now);
            self.devices.insert(device_id.clone(), state);
            self.join_group(&device_id, &group_id);
            return Ok((RegisterOutcome::Created, None));
        };

        let previous_group = (state.profile.sync_group != group_id)
            .then(|| state.profile.sync_group.clone());
        state.profile = profile;
        let change = contact(state, now);

        if let Some(previous) = &previous_group {
            info!(
                device_id = %device_id,
                from = %previous,
                to = %group_id,
                "Device moved between sync groups"
            );
            self.leave_group(&device_id, previous);
            self.join_group(&device_id, &group_id);
        }

        Ok((RegisterOutcome::Updated { previous_group }, change))
    }

    /// Remove a device and its group membership
    pub fn deregister(&mut self, device_id: &DeviceId) -> Result<DeviceState, RegistryError> {
        let state = self
            .devices
            .remove(device_id)
            .ok_or_else(|| RegistryError::unknown_device(device_id))?;
        self.leave_group(device_id, &state.profile.sync_group);
        info!(device_id = %device_id, "Device deregistered");
        Ok(state)
    }

    /// Heartbeat or status report
    pub fn touch(
        &mut self,
        device_id: &DeviceId,
        now: Instant,
    ) -> Result<Option<StatusChange>, RegistryError> {
        let state = self.known_or_auto(device_id, now)?;
        Ok(contact(state, now))
    }

    /// Record a drift sample: contact, history, validity streak.
    ///
    /// `outlier` is the controller's verdict for a valid sample; it is
    /// counted here and the sample still enters the history.
    pub fn record_sample(
        &mut self,
        sample: DriftSample,
        outlier: bool,
        now: Instant,
    ) -> Result<SampleOutcome, RegistryError> {
        let degrade_after = self.config.degrade_after_rejects.max(1);
        let state = self.known_or_auto(&sample.device_id, now)?;
        let contact_change = contact(state, now);

        if state
            .last_sample_ts
            .is_some_and(|last| sample.timestamp <= last)
        {
            debug!(
                device_id = %sample.device_id,
                timestamp = sample.timestamp,
                "Duplicate drift sample ignored"
            );
            return Ok(SampleOutcome::Duplicate);
        }
        state.last_sample_ts = Some(sample.timestamp);
        state.stats.measurements += 1;
        state.last_raw_drift_ms = sample.raw_drift_ms;
        state.last_correlation = sample.correlation_score;

        if !sample.valid {
            let reason = sample.rejection;
            match reason {
                Some(RejectReason::LowCorrelation) => state.stats.rejected_low_correlation += 1,
                Some(RejectReason::AmbiguousPeak) => state.stats.rejected_ambiguous += 1,
                Some(RejectReason::DriftOutOfRange) | None => {
                    state.stats.rejected_out_of_range += 1
                }
            }
            state.reject_streak += 1;
            state.history.push(sample);

            let change = if state.reject_streak >= degrade_after
                && state.status != DeviceStatus::Degraded
            {
                warn!(
                    device_id = %state.profile.device_id,
                    streak = state.reject_streak,
                    "Drift samples persistently rejected"
                );
                transition(state, DeviceStatus::Degraded)
            } else {
                None
            };
            return Ok(SampleOutcome::Rejected {
                reason,
                change: change.or(contact_change),
            });
        }

        state.stats.valid += 1;
        if outlier {
            state.stats.outliers += 1;
        }
        state.reject_streak = 0;
        state.last_valid_at = Some(now);
        state.frozen = false;
        state.history.push(sample);

        let change = match state.status {
            DeviceStatus::Registering | DeviceStatus::Degraded => {
                transition(state, DeviceStatus::Online)
            }
            _ => None,
        };
        Ok(SampleOutcome::Accepted {
            outlier,
            change: change.or(contact_change),
        })
    }

    pub(crate) fn set_ema(&mut self, device_id: &DeviceId, ema_ms: f64) {
        if let Some(state) = self.devices.get_mut(device_id) {
            state.ema_drift_ms = ema_ms;
        }
    }

    /// Record the controller's correction state after an evaluation
    pub(crate) fn settle(&mut self, device_id: &DeviceId, correcting: bool) {
        if let Some(state) = self.devices.get_mut(device_id) {
            state.correcting = correcting;
            state.manual_override = false;
            state.resync_pending = false;
        }
    }

    /// Apply an offset command.
    ///
    /// Checks and mutation happen together; a rejected command changes
    /// nothing. Returns the previous offset.
    pub fn apply_command(&mut self, command: &OffsetCommand) -> Result<f64, RegistryError> {
        let state = self
            .devices
            .get_mut(&command.device_id)
            .ok_or_else(|| RegistryError::unknown_device(&command.device_id))?;
        if !state.status.is_reachable() {
            return Err(RegistryError::device_offline(&command.device_id));
        }
        let previous = state.current_offset_ms;
        state.current_offset_ms = command.new_offset_ms;
        state.stats.commands_applied += 1;
        Ok(previous)
    }

    /// Mark an operator-set offset
    pub(crate) fn set_manual_override(&mut self, device_id: &DeviceId) {
        if let Some(state) = self.devices.get_mut(device_id) {
            state.manual_override = true;
            state.correcting = false;
        }
    }

    /// Forget history and restart smoothing at zero residual error.
    ///
    /// Reported drift is intrinsic, so the smoothed value restarts from the
    /// drift the current offset already compensates; a resync alone never
    /// moves the device.
    pub fn resync(&mut self, device_id: &DeviceId) -> Result<(), RegistryError> {
        let group_id = self
            .devices
            .get(device_id)
            .map(|s| s.profile.sync_group.clone())
            .ok_or_else(|| RegistryError::unknown_device(device_id))?;
        let reference_ms = self
            .groups
            .get(&group_id)
            .map_or(0.0, |g| g.target_group_offset_ms);
        let state = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::unknown_device(device_id))?;
        state.ema_drift_ms =
            state.profile.base_latency_ms - state.current_offset_ms + reference_ms;
        state.history.clear();
        state.correcting = false;
        state.manual_override = false;
        state.resync_pending = true;
        Ok(())
    }

    /// Store derived group figures
    pub(crate) fn set_group_alignment(&mut self, group_id: &str, alignment: &GroupAlignment) {
        if let Some(group) = self.groups.get_mut(group_id) {
            group.target_group_offset_ms = alignment.reference_drift_ms;
            group.spread_ms = alignment.spread_ms;
            group.quality = alignment.quality;
        }
    }

    /// Timeout, staleness and eviction checks
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let timeout = self.config.device_timeout();
        let evict_after = self.config.evict_after();
        let mut report = SweepReport::default();

        for state in self.devices.values_mut() {
            let silent_for = now.saturating_duration_since(state.last_seen);

            if state.status.is_reachable() && silent_for > timeout {
                warn!(
                    device_id = %state.profile.device_id,
                    silent_ms = silent_for.as_millis() as u64,
                    offset_ms = state.current_offset_ms,
                    "Device timed out"
                );
                state.offline_since = Some(now);
                state.correcting = false;
                if let Some(change) = transition(state, DeviceStatus::Offline) {
                    report.changes.push(change);
                }
                report.touched_groups.insert(state.profile.sync_group.clone());
                continue;
            }

            if state.status == DeviceStatus::Online && !state.frozen {
                let stale = state
                    .last_valid_at
                    .is_none_or(|at| now.saturating_duration_since(at) > self.stability_window);
                if stale {
                    warn!(
                        device_id = %state.profile.device_id,
                        "No valid drift sample within stability window, freezing"
                    );
                    state.frozen = true;
                    state.correcting = false;
                    report.frozen.push(state.profile.device_id.clone());
                    report.touched_groups.insert(state.profile.sync_group.clone());
                    if let Some(change) = transition(state, DeviceStatus::Degraded) {
                        report.changes.push(change);
                    }
                }
            }
        }

        let expired: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|s| {
                s.status == DeviceStatus::Offline
                    && s.offline_since
                        .is_some_and(|at| now.saturating_duration_since(at) > evict_after)
            })
            .map(|s| s.profile.device_id.clone())
            .collect();
        for device_id in expired {
            if let Ok(state) = self.deregister(&device_id) {
                report.touched_groups.insert(state.profile.sync_group);
                report.evicted.push(device_id);
            }
        }

        report
    }

    pub fn snapshot(&self, device_id: &DeviceId, now: Instant) -> Option<DeviceSnapshot> {
        self.devices.get(device_id).map(|s| s.snapshot(now))
    }

    /// Snapshots ordered by device id
    pub fn snapshots(&self, now: Instant) -> Vec<DeviceSnapshot> {
        let mut snapshots: Vec<DeviceSnapshot> =
            self.devices.values().map(|s| s.snapshot(now)).collect();
        snapshots.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        snapshots
    }

    /// Groups, highest priority first
    pub fn groups(&self) -> Vec<SyncGroup> {
        let mut groups: Vec<SyncGroup> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.group_id.cmp(&b.group_id)));
        groups
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups().into_iter().map(|g| g.group_id).collect()
    }

    /// Known device, or a fresh anonymous one when auto-registration is on
    fn known_or_auto(
        &mut self,
        device_id: &DeviceId,
        now: Instant,
    ) -> Result<&mut DeviceState, RegistryError> {
        if !self.devices.contains_key(device_id) {
            if !self.config.auto_register {
                return Err(RegistryError::unknown_device(device_id));
            }
            self.register(DeviceProfile::anonymous(device_id.clone()), now)?;
        }
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::unknown_device(device_id))
    }

    fn join_group(&mut self, device_id: &DeviceId, group_id: &str) {
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| SyncGroup::new(group_id, 0))
            .member_device_ids
            .insert(device_id.clone());
    }

    fn leave_group(&mut self, device_id: &DeviceId, group_id: &str) {
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        group.member_device_ids.remove(device_id);
        if group.is_empty() && !self.declared_groups.contains(group_id) {
            self.groups.remove(group_id);
        }
    }
}

/// Contact from the device: refresh liveness, revive an offline device
fn contact(state: &mut DeviceState, now: Instant) -> Option<StatusChange> {
    state.last_seen = now;
    if state.status == DeviceStatus::Offline {
        state.offline_since = None;
        info!(device_id = %state.profile.device_id, "Offline device reconnected");
        return transition(state, DeviceStatus::Registering);
    }
    None
}

fn transition(state: &mut DeviceState, to: DeviceStatus) -> Option<StatusChange> {
    let from = state.status;
    if from == to {
        return None;
    }
    state.status = to;
    Some(StatusChange {
        device_id: state.profile.device_id.clone(),
        from,
        to,
    })
}

//! NodeAgent - node side of the measurement channel
//!
//! One agent per node. It announces the node, sends heartbeats and status,
//! measures drift on an adaptive cadence and applies the offsets the
//! controller sends back.
//!
//! Measurements run on the blocking pool. If the previous measurement is
//! still running when the next one is due, the new one is skipped rather
//! than queued.
//!
//! A window captured while the buffer offset changed mixes two lags and is
//! discarded; every other window is reported against the offset that was in
//! force while it played.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, warn};

use channel::{CommandPayload, DriftReport, Envelope, Heartbeat, Message, StatusReport, Uplink};
use contracts::{
    unix_now, BufferDelay, DeviceId, DeviceProfile, DriftSample, NodeCommand, OffsetCommand,
    SamplingConfig, SyncStreamConfig, TimeRange, TonePlayer, WindowSource,
};

use crate::detector::DriftDetector;
use crate::error::DetectorError;

/// Correlation drop that counts as a quality loss
const SCORE_DROP: f64 = 0.1;

/// Offset changes kept for matching windows to the offset they played with
const OFFSET_LOG_LEN: usize = 64;

/// Default test-tone length when the command carries none
const DEFAULT_TONE_S: f64 = 1.0;

/// Adaptive measurement interval.
///
/// Starts at the base interval; after `stable_streak` stable samples in a
/// row the interval grows by `backoff_factor` up to the maximum. An unstable
/// sample shrinks it by the same factor down to the base.
#[derive(Debug, Clone)]
pub struct Cadence {
    base: Duration,
    max: Duration,
    factor: f64,
    streak_needed: u32,
    tolerance_ms: f64,
    interval: Duration,
    streak: u32,
    last_score: Option<f64>,
}

impl Cadence {
    pub fn new(sampling: &SamplingConfig, tolerance_ms: f64) -> Self {
        let base = sampling.base_interval();
        Self {
            base,
            max: sampling.max_interval(),
            factor: sampling.backoff_factor.max(1.0),
            streak_needed: sampling.stable_streak.max(1),
            tolerance_ms,
            interval: base,
            streak: 0,
            last_score: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Feed one measurement. `acoustic_lag_ms` is the lag actually heard,
    /// with the applied correction in place.
    pub fn record(&mut self, valid: bool, acoustic_lag_ms: f64, score: f64) {
        let score_dropped = self
            .last_score
            .is_some_and(|last| last - score > SCORE_DROP);
        self.last_score = Some(score);

        if valid && acoustic_lag_ms.abs() <= self.tolerance_ms && !score_dropped {
            self.streak += 1;
            if self.streak >= self.streak_needed {
                self.streak = 0;
                self.interval = self.interval.mul_f64(self.factor).min(self.max);
            }
        } else {
            self.streak = 0;
            self.interval = self.interval.div_f64(self.factor).max(self.base);
        }
    }

    /// Back to the base interval, forgetting the streak
    pub fn reset(&mut self) {
        self.interval = self.base;
        self.streak = 0;
        self.last_score = None;
    }
}

/// Buffer offsets applied by this node, stamped on the node clock
#[derive(Debug, Clone)]
pub struct OffsetLog {
    /// Offset in force before the oldest kept change
    initial_ms: f64,
    /// `(applied_at, offset_ms)`, oldest first
    changes: VecDeque<(f64, f64)>,
}

impl OffsetLog {
    pub fn new(initial_ms: f64) -> Self {
        Self {
            initial_ms,
            changes: VecDeque::new(),
        }
    }

    /// Note that `offset_ms` took effect at `at`. Re-applying the offset
    /// already in force is not a change.
    pub fn record(&mut self, at: f64, offset_ms: f64) {
        if self.latest() == offset_ms {
            return;
        }
        self.changes.push_back((at, offset_ms));
        while self.changes.len() > OFFSET_LOG_LEN {
            if let Some((_, oldest)) = self.changes.pop_front() {
                self.initial_ms = oldest;
            }
        }
    }

    pub fn latest(&self) -> f64 {
        self.changes.back().map_or(self.initial_ms, |(_, offset)| *offset)
    }

    /// Offset in force for the whole of `range`, or `None` when it changed
    /// while the window was playing
    pub fn in_force(&self, range: TimeRange) -> Option<f64> {
        if self
            .changes
            .iter()
            .any(|(at, _)| *at > range.start && *at < range.end)
        {
            return None;
        }
        Some(
            self.changes
                .iter()
                .rev()
                .find(|(at, _)| *at <= range.start)
                .map_or(self.initial_ms, |(_, offset)| *offset),
        )
    }
}

/// Audio collaborators of one node
#[derive(Clone)]
pub struct NodeAudio {
    pub reference: Arc<dyn WindowSource>,
    pub capture: Arc<dyn WindowSource>,
    pub delay: Arc<dyn BufferDelay>,
    pub tone: Arc<dyn TonePlayer>,
}

/// Counters shared with whoever spawned the agent
#[derive(Debug, Default)]
pub struct AgentStats {
    measurements: AtomicU64,
    skipped: AtomicU64,
    discarded: AtomicU64,
    unavailable: AtomicU64,
    failed: AtomicU64,
    offsets_applied: AtomicU64,
    commands: AtomicU64,
}

impl AgentStats {
    pub fn measurements(&self) -> u64 {
        self.measurements.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Windows dropped because the offset changed while they played
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn unavailable(&self) -> u64 {
        self.unavailable.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn offsets_applied(&self) -> u64 {
        self.offsets_applied.load(Ordering::Relaxed)
    }

    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }
}

/// Wall clock that advances with the runtime clock
#[derive(Debug, Clone, Copy)]
struct NodeClock {
    wall_origin: f64,
    origin: Instant,
}

impl NodeClock {
    fn new() -> Self {
        Self {
            wall_origin: unix_now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> f64 {
        self.wall_origin + self.origin.elapsed().as_secs_f64()
    }
}

/// Result of one measurement, sent back from the blocking pool
struct Measurement {
    /// Sample as measured (acoustic lag)
    acoustic: DriftSample,
    /// Node-clock span of the captured window
    capture_range: TimeRange,
}

/// Node-side agent
pub struct NodeAgent {
    profile: DeviceProfile,
    sampling: SamplingConfig,
    window_s: f64,
    prefix: String,
    detector: Arc<DriftDetector>,
    audio: NodeAudio,
    uplink: Uplink,
    inbox: mpsc::Receiver<Envelope>,
    cadence: Cadence,
    clock: NodeClock,
    offsets: OffsetLog,
    busy: Arc<AtomicBool>,
    playing: bool,
    heartbeat_seq: u64,
    last_sample: Option<DriftSample>,
    stats: Arc<AgentStats>,
}

impl NodeAgent {
    pub fn new(
        profile: DeviceProfile,
        config: &SyncStreamConfig,
        detector: Arc<DriftDetector>,
        audio: NodeAudio,
        uplink: Uplink,
        inbox: mpsc::Receiver<Envelope>,
    ) -> Self {
        Self {
            offsets: OffsetLog::new(audio.delay.current_offset_ms()),
            cadence: Cadence::new(&config.sampling, config.controller.tolerance_ms),
            sampling: config.sampling.clone(),
            window_s: config.detector.window_s,
            prefix: config.channel.topic_prefix.clone(),
            profile,
            detector,
            audio,
            uplink,
            inbox,
            clock: NodeClock::new(),
            busy: Arc::new(AtomicBool::new(false)),
            playing: true,
            heartbeat_seq: 0,
            last_sample: None,
            stats: Arc::new(AgentStats::default()),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.profile.device_id
    }

    pub fn stats(&self) -> Arc<AgentStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `shutdown` flips to true or the inbox closes
    #[instrument(name = "node_agent_run", skip_all, fields(device_id = %self.profile.device_id))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(device_id = %self.profile.device_id, "Node agent started");

        if let Err(e) = self.uplink.publish(&Message::Register(self.profile.clone())).await {
            warn!(device_id = %self.profile.device_id, error = %e, "Register failed");
            return;
        }

        let (result_tx, mut result_rx) = mpsc::channel::<Result<Measurement, DetectorError>>(4);

        let mut heartbeat = time::interval(self.sampling.heartbeat_interval());
        let next_measure = time::sleep(self.cadence.interval());
        tokio::pin!(next_measure);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat().await;
                }
                () = &mut next_measure => {
                    if self.playing {
                        self.start_measurement(&result_tx);
                    }
                    next_measure.as_mut().reset(Instant::now() + self.cadence.interval());
                }
                Some(result) = result_rx.recv() => {
                    self.finish_measurement(result).await;
                }
                envelope = self.inbox.recv() => {
                    let Some(envelope) = envelope else {
                        info!(device_id = %self.profile.device_id, "Inbox closed");
                        break;
                    };
                    if self.handle_envelope(&envelope) {
                        // Resync: measure right away
                        next_measure.as_mut().reset(Instant::now());
                    }
                }
            }
        }

        info!(
            device_id = %self.profile.device_id,
            measurements = self.stats.measurements(),
            skipped = self.stats.skipped(),
            discarded = self.stats.discarded(),
            "Node agent stopped"
        );
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn send_heartbeat(&mut self) {
        self.heartbeat_seq += 1;
        let device_id = self.profile.device_id.clone();
        let now = self.clock.now();

        let heartbeat = Message::Heartbeat {
            device_id: device_id.clone(),
            payload: Heartbeat {
                timestamp: now,
                sequence: Some(self.heartbeat_seq),
            },
        };
        let status = Message::Status(StatusReport {
            device_id,
            is_playing: self.playing,
            current_offset_ms: self.audio.delay.current_offset_ms(),
            last_drift_ms: self.last_sample.as_ref().map_or(0.0, |s| s.raw_drift_ms),
            correlation_quality: self
                .last_sample
                .as_ref()
                .map_or(0.0, |s| s.correlation_score),
            cpu_usage: None,
            timestamp: now,
        });

        for message in [heartbeat, status] {
            if let Err(e) = self.uplink.publish(&message).await {
                warn!(device_id = %self.profile.device_id, error = %e, "Publish failed");
            }
        }
    }

    /// Kick off a measurement on the blocking pool, unless one is running
    fn start_measurement(&self, result_tx: &mpsc::Sender<Result<Measurement, DetectorError>>) {
        if self.busy.swap(true, Ordering::AcqRel) {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("syncstream_detector_skipped_total").increment(1);
            debug!(device_id = %self.profile.device_id, "Previous measurement still running, skipped");
            return;
        }

        let capture_range =
            TimeRange::ending_before(self.clock.now(), self.sampling.lookback_s, self.window_s);
        let device_id = self.profile.device_id.clone();
        let detector = Arc::clone(&self.detector);
        let audio = self.audio.clone();
        let busy = Arc::clone(&self.busy);
        let result_tx = result_tx.clone();

        tokio::spawn(async move {
            let job = tokio::task::spawn_blocking(move || {
                measure(&detector, &audio, &device_id, capture_range)
            });
            let result = job.await;
            busy.store(false, Ordering::Release);
            match result {
                Ok(result) => {
                    let _ = result_tx.send(result).await;
                }
                Err(e) => warn!(error = %e, "Measurement task panicked"),
            }
        });
    }

    async fn finish_measurement(&mut self, result: Result<Measurement, DetectorError>) {
        let measurement = match result {
            Ok(m) => m,
            Err(e) if e.is_window_unavailable() => {
                self.stats.unavailable.fetch_add(1, Ordering::Relaxed);
                debug!(device_id = %self.profile.device_id, error = %e, "Window unavailable, retry next cycle");
                return;
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(device_id = %self.profile.device_id, error = %e, "Measurement failed");
                return;
            }
        };
        let Some(applied_ms) = self.offsets.in_force(measurement.capture_range) else {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                device_id = %self.profile.device_id,
                start = measurement.capture_range.start,
                end = measurement.capture_range.end,
                "Offset changed during window, discarded"
            );
            return;
        };
        self.stats.measurements.fetch_add(1, Ordering::Relaxed);

        let acoustic = measurement.acoustic;
        self.cadence
            .record(acoustic.valid, acoustic.raw_drift_ms, acoustic.correlation_score);

        // Report intrinsic drift: remove the correction that was in place
        let sample = acoustic.shifted(self.profile.base_latency_ms - applied_ms);
        debug!(
            device_id = %self.profile.device_id,
            acoustic_ms = acoustic.raw_drift_ms,
            drift_ms = sample.raw_drift_ms,
            valid = sample.valid,
            next_interval_ms = self.cadence.interval().as_millis() as u64,
            "Measurement complete"
        );

        let report = Message::Drift(DriftReport::from_sample(&sample));
        self.last_sample = Some(sample);
        if let Err(e) = self.uplink.publish(&report).await {
            warn!(device_id = %self.profile.device_id, error = %e, "Drift report not sent");
        }
    }

    /// Returns true when a measurement should start immediately
    fn handle_envelope(&mut self, envelope: &Envelope) -> bool {
        let message = match Message::decode(&self.prefix, envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!(device_id = %self.profile.device_id, error = %e, "Rejected inbound message");
                return false;
            }
        };

        match message {
            Message::BufferOffset(command) => {
                self.apply_offset(&command);
                false
            }
            Message::Command { payload, .. } => self.handle_command(&payload),
            other => {
                debug!(
                    device_id = %self.profile.device_id,
                    kind = other.kind().as_str(),
                    "Ignoring controller-bound message"
                );
                false
            }
        }
    }

    fn apply_offset(&mut self, command: &OffsetCommand) {
        if command.device_id != self.profile.device_id {
            warn!(
                device_id = %self.profile.device_id,
                target = %command.device_id,
                "Offset for another device ignored"
            );
            return;
        }
        let applied_at = self.clock.now();
        self.audio.delay.apply_offset(command.new_offset_ms);
        self.offsets.record(applied_at, command.new_offset_ms);
        self.stats.offsets_applied.fetch_add(1, Ordering::Relaxed);
        info!(
            device_id = %self.profile.device_id,
            offset_ms = command.new_offset_ms,
            reason = command.reason.as_str(),
            "Buffer offset applied"
        );
    }

    fn handle_command(&mut self, payload: &CommandPayload) -> bool {
        self.stats.commands.fetch_add(1, Ordering::Relaxed);
        info!(
            device_id = %self.profile.device_id,
            command = payload.command.as_str(),
            "Command received"
        );
        match payload.command {
            NodeCommand::Start => {
                self.playing = true;
                false
            }
            NodeCommand::Stop => {
                self.playing = false;
                false
            }
            NodeCommand::Resync => {
                self.cadence.reset();
                self.last_sample = None;
                self.playing
            }
            NodeCommand::TestTone => {
                let duration_s = payload
                    .params
                    .get("duration_s")
                    .and_then(|v| v.as_f64())
                    .filter(|d| d.is_finite() && *d > 0.0)
                    .unwrap_or(DEFAULT_TONE_S);
                info!(device_id = %self.profile.device_id, duration_s, "Playing test tone");
                self.audio.tone.play_test_tone(duration_s);
                false
            }
        }
    }
}

fn measure(
    detector: &DriftDetector,
    audio: &NodeAudio,
    device_id: &DeviceId,
    capture_range: TimeRange,
) -> Result<Measurement, DetectorError> {
    let capture = audio.capture.fetch(capture_range)?;
    let reference = audio.reference.fetch(detector.reference_range(capture_range))?;
    let acoustic = detector.measure(device_id, &reference, &capture)?;
    Ok(Measurement {
        acoustic,
        capture_range,
    })
}

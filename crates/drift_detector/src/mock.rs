//! Simulated acoustics for tests and the `simulate` command
//!
//! A seeded broadband signal plays as the reference stream. Each simulated
//! node hears it back through its microphone late by
//! `intrinsic(t) + offset(t) - base_latency`, where the intrinsic part
//! drifts linearly with time and `offset(t)` is the buffer offset that was
//! in force when that audio played.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use contracts::{
    unix_now, AudioWindow, BufferDelay, ContractError, TimeRange, TonePlayer, WindowSource,
};

/// Offset changes remembered by [`SharedOffset`]
const OFFSET_HISTORY: usize = 256;

/// Looping broadband reference signal
#[derive(Debug, Clone)]
pub struct SimulatedAcoustics {
    sample_rate: u32,
    signal: Arc<[f32]>,
}

impl SimulatedAcoustics {
    /// `loop_s` seconds of seeded noise, repeated forever
    pub fn new(sample_rate: u32, loop_s: f64, seed: u64) -> Self {
        let len = ((loop_s * f64::from(sample_rate)) as usize).max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let signal: Vec<f32> = (0..len).map(|_| rng.random_range(-0.5..0.5)).collect();
        Self {
            sample_rate,
            signal: signal.into(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Reference signal at wall-clock time `t`, linearly interpolated
    fn value_at(&self, t: f64) -> f32 {
        let pos = t * f64::from(self.sample_rate);
        let base = pos.floor();
        let frac = (pos - base) as f32;
        let len = self.signal.len() as i64;
        let i = (base as i64).rem_euclid(len) as usize;
        let j = (i + 1) % self.signal.len();
        self.signal[i] * (1.0 - frac) + self.signal[j] * frac
    }

    fn sample_count(&self, range: TimeRange) -> usize {
        (range.duration() * f64::from(self.sample_rate)).round() as usize
    }

    pub fn reference_window(&self, range: TimeRange) -> AudioWindow {
        let rate = f64::from(self.sample_rate);
        let samples = (0..self.sample_count(range))
            .map(|i| self.value_at(range.start + i as f64 / rate))
            .collect();
        AudioWindow::new(range.start, self.sample_rate, samples)
    }

    /// Microphone window hearing the reference `lag_ms` late, plus uniform
    /// noise of amplitude `noise`
    pub fn capture_window(&self, range: TimeRange, lag_ms: f64, noise: f32, seed: u64) -> AudioWindow {
        self.capture_window_with(range, |_| lag_ms, noise, seed)
    }

    /// Like [`capture_window`](Self::capture_window), with the lag sampled
    /// per captured sample at its capture time
    pub fn capture_window_with(
        &self,
        range: TimeRange,
        lag_ms_at: impl Fn(f64) -> f64,
        noise: f32,
        seed: u64,
    ) -> AudioWindow {
        let rate = f64::from(self.sample_rate);
        let mut rng = StdRng::seed_from_u64(seed);
        let samples = (0..self.sample_count(range))
            .map(|i| {
                let heard_at = range.start + i as f64 / rate;
                let t = heard_at - lag_ms_at(heard_at) / 1000.0;
                let n = if noise > 0.0 {
                    rng.random_range(-noise..noise)
                } else {
                    0.0
                };
                self.value_at(t) + n
            })
            .collect();
        AudioWindow::new(range.start, self.sample_rate, samples)
    }
}

/// Reference stream as a [`WindowSource`]
pub struct ReferenceSource {
    acoustics: Arc<SimulatedAcoustics>,
}

impl ReferenceSource {
    pub fn new(acoustics: Arc<SimulatedAcoustics>) -> Self {
        Self { acoustics }
    }
}

impl WindowSource for ReferenceSource {
    fn name(&self) -> &str {
        "reference"
    }

    fn fetch(&self, range: TimeRange) -> Result<AudioWindow, ContractError> {
        Ok(self.acoustics.reference_window(range))
    }
}

#[derive(Debug, Default)]
struct OffsetHistory {
    /// Offset before the oldest remembered change
    initial_ms: f64,
    /// `(applied_at, offset_ms)`, oldest first
    changes: VecDeque<(f64, f64)>,
}

/// Buffer delay held in memory, with the times it changed
#[derive(Debug, Default)]
pub struct SharedOffset {
    bits: AtomicU64,
    applied: AtomicU64,
    history: Mutex<OffsetHistory>,
}

impl SharedOffset {
    pub fn new(offset_ms: f64) -> Self {
        Self {
            bits: AtomicU64::new(offset_ms.to_bits()),
            applied: AtomicU64::new(0),
            history: Mutex::new(OffsetHistory {
                initial_ms: offset_ms,
                changes: VecDeque::new(),
            }),
        }
    }

    /// Number of `apply_offset` calls
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Apply `offset_ms` as of wall-clock time `at`
    pub fn apply_offset_at(&self, at: f64, offset_ms: f64) {
        self.bits.store(offset_ms.to_bits(), Ordering::Release);
        self.applied.fetch_add(1, Ordering::Relaxed);

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.changes.push_back((at, offset_ms));
        while history.changes.len() > OFFSET_HISTORY {
            if let Some((_, oldest)) = history.changes.pop_front() {
                history.initial_ms = oldest;
            }
        }
    }

    /// Offset in force at wall-clock time `t`
    pub fn offset_at(&self, t: f64) -> f64 {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .changes
            .iter()
            .rev()
            .find(|(at, _)| *at <= t)
            .map_or(history.initial_ms, |(_, offset)| *offset)
    }
}

impl BufferDelay for SharedOffset {
    fn apply_offset(&self, offset_ms: f64) {
        self.apply_offset_at(unix_now(), offset_ms);
    }

    fn current_offset_ms(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Test-tone output that only remembers what it was asked to play
#[derive(Debug, Default)]
pub struct ToneLog {
    played: Mutex<Vec<f64>>,
}

impl ToneLog {
    /// Durations of the tones played so far
    pub fn played(&self) -> Vec<f64> {
        self.played
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TonePlayer for ToneLog {
    fn play_test_tone(&self, duration_s: f64) {
        self.played
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration_s);
    }
}

/// Intrinsic drift of a simulated node: `initial_ms + rate_ms_per_s * (t - epoch)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftModel {
    pub initial_ms: f64,
    pub rate_ms_per_s: f64,
    pub epoch: f64,
}

impl DriftModel {
    pub fn constant(initial_ms: f64) -> Self {
        Self {
            initial_ms,
            rate_ms_per_s: 0.0,
            epoch: 0.0,
        }
    }

    pub fn intrinsic_at(&self, t: f64) -> f64 {
        self.initial_ms + self.rate_ms_per_s * (t - self.epoch)
    }
}

/// Microphone of one simulated node
pub struct SimulatedCapture {
    name: String,
    acoustics: Arc<SimulatedAcoustics>,
    model: DriftModel,
    base_latency_ms: f64,
    delay: Arc<SharedOffset>,
    noise: f32,
    seed: AtomicU64,
    available: AtomicBool,
}

impl SimulatedCapture {
    pub fn new(
        name: impl Into<String>,
        acoustics: Arc<SimulatedAcoustics>,
        model: DriftModel,
        base_latency_ms: f64,
        delay: Arc<SharedOffset>,
        noise: f32,
    ) -> Self {
        Self {
            name: name.into(),
            acoustics,
            model,
            base_latency_ms,
            delay,
            noise,
            seed: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Lag the microphone hears at `t`, under the offset in force at `t`
    pub fn acoustic_lag_ms(&self, t: f64) -> f64 {
        self.model.intrinsic_at(t) + self.delay.offset_at(t) - self.base_latency_ms
    }

    /// Make every fetch fail with `WindowUnavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl WindowSource for SimulatedCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, range: TimeRange) -> Result<AudioWindow, ContractError> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(ContractError::window_unavailable(&self.name, range.start, range.end));
        }
        let seed = self.seed.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .acoustics
            .capture_window_with(range, |t| self.acoustic_lag_ms(t), self.noise, seed))
    }
}

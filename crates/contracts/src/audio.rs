//! Audio collaborator interfaces
//!
//! The core never captures or plays audio itself. It pulls reference and
//! microphone windows from sources keyed by wall-clock time range and hands
//! buffer-delay changes to a node-side applier.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::ContractError;

/// Current wall-clock time as seconds since the UNIX epoch.
///
/// This is the timestamp format used on every channel payload.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Half-open wall-clock interval `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Range of `duration_s` seconds ending `lookback_s` before `now`.
    pub fn ending_before(now: f64, lookback_s: f64, duration_s: f64) -> Self {
        let end = now - lookback_s;
        Self {
            start: end - duration_s,
            end,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Mono PCM window.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioWindow {
    /// Wall-clock time of the first sample (seconds since epoch)
    pub start: f64,
    /// Samples per second
    pub sample_rate: u32,
    /// Mono samples, nominally in [-1, 1]
    pub samples: Vec<f32>,
}

impl AudioWindow {
    pub fn new(start: f64, sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            start,
            sample_rate,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Window length in seconds
    pub fn duration_s(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Wall-clock time just past the last sample
    pub fn end(&self) -> f64 {
        self.start + self.duration_s()
    }
}

/// Source of audio windows keyed by time range.
///
/// Implemented by the reference-stream buffer and by the node microphone
/// capture. Both fail with [`ContractError::WindowUnavailable`] when the
/// requested range is not buffered.
pub trait WindowSource: Send + Sync {
    /// Source name (used for logging)
    fn name(&self) -> &str;

    /// Fetch the window covering `range`.
    fn fetch(&self, range: TimeRange) -> Result<AudioWindow, ContractError>;
}

/// Node-side buffer-delay applier.
///
/// Applying the same offset twice must leave the buffer in the same state.
pub trait BufferDelay: Send + Sync {
    /// Set the absolute output delay in milliseconds.
    fn apply_offset(&self, offset_ms: f64);

    /// Delay currently applied, in milliseconds.
    fn current_offset_ms(&self) -> f64;
}

/// Node-side test-tone output, used to check a speaker by ear.
pub trait TonePlayer: Send + Sync {
    /// Play an audible test tone for `duration_s` seconds without blocking.
    fn play_test_tone(&self, duration_s: f64);
}

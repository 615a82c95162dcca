//! Signal preprocessing applied to every window before correlation
//!
//! 1. Zero-phase 4th-order Butterworth high-pass (two biquads, run forward
//!    then backward so the filter adds no lag of its own)
//! 2. RMS normalization to a fixed target
//! 3. Tukey taper at both edges

use std::f64::consts::PI;

use contracts::{AudioWindow, PreprocessConfig};

use crate::error::DetectorError;

/// Q of the two sections of a 4th-order Butterworth response
const BUTTERWORTH_Q: [f64; 2] = [0.541_196_100_146_197, 1.306_562_964_876_376_5];

/// Below this RMS a window is treated as silence
const SILENCE_RMS: f64 = 1e-9;

/// Biquad IIR section (transposed direct form II)
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    pub fn high_pass(sample_rate: u32, freq: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * freq / f64::from(sample_rate);
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        Self {
            b0: (1.0 + cos_w0) / 2.0 / a0,
            b1: -(1.0 + cos_w0) / a0,
            b2: (1.0 + cos_w0) / 2.0 / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Filter in place, starting from rest
    pub fn apply(&self, samples: &mut [f64]) {
        let (mut z1, mut z2) = (0.0, 0.0);
        for x in samples.iter_mut() {
            let input = *x;
            let y = self.b0 * input + z1;
            z1 = self.b1 * input - self.a1 * y + z2;
            z2 = self.b2 * input - self.a2 * y;
            *x = y;
        }
    }
}

/// Stateless window preprocessor; safe to share across threads.
#[derive(Debug, Clone)]
pub struct SignalPreprocessor {
    config: PreprocessConfig,
}

impl SignalPreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Shortest window accepted at `sample_rate`
    pub fn min_samples(&self, sample_rate: u32) -> usize {
        ((self.config.min_window_s * f64::from(sample_rate)).ceil() as usize).max(2)
    }

    /// Produce a filtered, normalized, tapered copy of `window`.
    ///
    /// The output has the same length (and so the same duration) as the
    /// input. A silent window stays all zeros.
    pub fn process(&self, window: &AudioWindow) -> Result<Vec<f64>, DetectorError> {
        let needed = self.min_samples(window.sample_rate);
        if window.len() < needed {
            return Err(DetectorError::InsufficientSamples {
                needed,
                got: window.len(),
            });
        }

        let cutoff = self.config.highpass_cutoff_hz;
        if window.sample_rate == 0 || cutoff >= f64::from(window.sample_rate) / 2.0 {
            return Err(DetectorError::UnsupportedSampleRate {
                sample_rate: window.sample_rate,
                cutoff_hz: cutoff,
            });
        }

        let mut samples: Vec<f64> = window.samples.iter().map(|&s| f64::from(s)).collect();

        remove_mean(&mut samples);
        self.high_pass_zero_phase(&mut samples, window.sample_rate);
        normalize_rms(&mut samples, self.config.target_rms);
        tukey_taper(&mut samples, self.config.edge_taper);

        Ok(samples)
    }

    fn high_pass_zero_phase(&self, samples: &mut [f64], sample_rate: u32) {
        let sections = BUTTERWORTH_Q
            .map(|q| Biquad::high_pass(sample_rate, self.config.highpass_cutoff_hz, q));

        for section in &sections {
            section.apply(samples);
        }
        samples.reverse();
        for section in &sections {
            section.apply(samples);
        }
        samples.reverse();
    }
}

fn remove_mean(samples: &mut [f64]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    samples.iter_mut().for_each(|s| *s -= mean);
}

pub(crate) fn rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64).sqrt()
}

fn normalize_rms(samples: &mut [f64], target: f64) {
    let current = rms(samples);
    if current < SILENCE_RMS {
        samples.iter_mut().for_each(|s| *s = 0.0);
        return;
    }
    let gain = target / current;
    samples.iter_mut().for_each(|s| *s *= gain);
}

/// Raised-cosine ramps over `fraction` of the window at each end
fn tukey_taper(samples: &mut [f64], fraction: f64) {
    let n = samples.len();
    let ramp = ((fraction.clamp(0.0, 0.5) * n as f64).floor() as usize).min(n / 2);
    if ramp == 0 {
        return;
    }
    for i in 0..ramp {
        let w = 0.5 * (1.0 - (PI * i as f64 / ramp as f64).cos());
        samples[i] *= w;
        samples[n - 1 - i] *= w;
    }
}

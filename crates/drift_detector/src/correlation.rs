//! FFT cross-correlation over a bounded lag range
//!
//! `c[k] = Σ capture[i + k] · reference[i]`. A peak at positive `k` means the
//! reference content shows up `k` samples later in the capture.

use std::ops::RangeInclusive;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Best alignment found between two windows
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationPeak {
    /// Lag of the peak in samples, with sub-sample refinement
    pub lag_samples: f64,
    /// |c| at the peak over the energies of the capture and the aligned
    /// reference segment, in [0, 1]
    pub score: f64,
    /// |c| at the peak over the best |c| outside the exclusion zone
    pub peak_ratio: f64,
    /// Peak sits on the edge of the searched range
    pub at_boundary: bool,
}

impl CorrelationPeak {
    fn silent() -> Self {
        Self {
            lag_samples: 0.0,
            score: 0.0,
            peak_ratio: 0.0,
            at_boundary: false,
        }
    }
}

/// Cross-correlate `capture` against `reference` for lags in `lags`.
///
/// `lags` is clipped to the lags at which the windows overlap at all.
/// Returns `None` when no searched lag overlaps.
pub fn correlate(
    reference: &[f64],
    capture: &[f64],
    lags: RangeInclusive<i64>,
    exclusion: usize,
) -> Option<CorrelationPeak> {
    let n_ref = reference.len() as i64;
    let n_cap = capture.len() as i64;
    if n_ref == 0 || n_cap == 0 {
        return None;
    }

    let min_lag = (*lags.start()).max(-(n_ref - 1));
    let max_lag = (*lags.end()).min(n_cap - 1);
    if min_lag > max_lag {
        return None;
    }

    let values = cross_correlation(reference, capture, min_lag, max_lag);
    let capture_energy: f64 = capture.iter().map(|s| s * s).sum();

    let (peak_idx, peak_abs) = values
        .iter()
        .map(|v| v.abs())
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;

    if capture_energy <= f64::EPSILON || peak_abs <= f64::EPSILON {
        return Some(CorrelationPeak::silent());
    }

    let peak_lag = min_lag + peak_idx as i64;
    let segment_energy = aligned_reference_energy(reference, n_cap, peak_lag);
    let score = if segment_energy <= f64::EPSILON {
        0.0
    } else {
        (peak_abs / (capture_energy * segment_energy).sqrt()).clamp(0.0, 1.0)
    };

    let secondary = values
        .iter()
        .enumerate()
        .filter(|(i, _)| i.abs_diff(peak_idx) > exclusion)
        .map(|(_, v)| v.abs())
        .fold(0.0, f64::max);
    let peak_ratio = if secondary <= f64::EPSILON {
        f64::INFINITY
    } else {
        peak_abs / secondary
    };

    Some(CorrelationPeak {
        lag_samples: peak_lag as f64 + parabolic_offset(&values, peak_idx),
        score,
        peak_ratio,
        at_boundary: peak_idx == 0 || peak_idx == values.len() - 1,
    })
}

/// `c[k]` for `k` in `min_lag..=max_lag`, via zero-padded FFTs.
fn cross_correlation(reference: &[f64], capture: &[f64], min_lag: i64, max_lag: i64) -> Vec<f64> {
    let fft_len = (reference.len() + capture.len() - 1).next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(fft_len);
    let inverse = planner.plan_fft_inverse(fft_len);

    let mut cap_spec = padded(capture, fft_len);
    let mut ref_spec = padded(reference, fft_len);
    forward.process(&mut cap_spec);
    forward.process(&mut ref_spec);

    let mut product: Vec<Complex<f64>> = cap_spec
        .iter()
        .zip(&ref_spec)
        .map(|(c, r)| c * r.conj())
        .collect();
    inverse.process(&mut product);

    let scale = 1.0 / fft_len as f64;
    let len = fft_len as i64;
    (min_lag..=max_lag)
        .map(|k| product[k.rem_euclid(len) as usize].re * scale)
        .collect()
}

fn padded(samples: &[f64], len: usize) -> Vec<Complex<f64>> {
    let mut out = vec![Complex::new(0.0, 0.0); len];
    for (slot, &s) in out.iter_mut().zip(samples) {
        slot.re = s;
    }
    out
}

/// Energy of the reference samples that overlap the capture at `lag`
fn aligned_reference_energy(reference: &[f64], capture_len: i64, lag: i64) -> f64 {
    let start = (-lag).max(0) as usize;
    let end = (capture_len - lag).clamp(0, reference.len() as i64) as usize;
    if start >= end {
        return 0.0;
    }
    reference[start..end].iter().map(|s| s * s).sum()
}

/// Vertex of the parabola through the peak and its neighbours, in [-0.5, 0.5]
fn parabolic_offset(values: &[f64], idx: usize) -> f64 {
    if idx == 0 || idx + 1 >= values.len() {
        return 0.0;
    }
    let sign = values[idx].signum();
    let (left, mid, right) = (
        sign * values[idx - 1],
        sign * values[idx],
        sign * values[idx + 1],
    );
    let denom = left - 2.0 * mid + right;
    if denom.abs() <= f64::EPSILON {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}

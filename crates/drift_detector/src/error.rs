//! Detector error types

use thiserror::Error;

use contracts::ContractError;

/// Failures that prevent a measurement from being taken at all.
///
/// A measurement that was taken but failed validation is not an error; it
/// comes back as a rejected `DriftSample`.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// Window shorter than one correlation period
    #[error("insufficient samples: need {needed}, got {got}")]
    InsufficientSamples { needed: usize, got: usize },

    /// Reference and capture were recorded at different rates
    #[error("sample rate mismatch: reference {reference} Hz, capture {capture} Hz")]
    SampleRateMismatch { reference: u32, capture: u32 },

    /// Sample rate cannot carry the configured high-pass cutoff
    #[error("unsupported sample rate {sample_rate} Hz for cutoff {cutoff_hz} Hz")]
    UnsupportedSampleRate { sample_rate: u32, cutoff_hz: f64 },

    /// Audio collaborator could not supply a window
    #[error(transparent)]
    Source(#[from] ContractError),
}

impl DetectorError {
    /// Whether the failure is a missing window (retry next cycle)
    pub fn is_window_unavailable(&self) -> bool {
        matches!(
            self,
            DetectorError::Source(ContractError::WindowUnavailable { .. })
        )
    }
}

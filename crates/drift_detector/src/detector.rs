//! DriftDetector - turns a reference/capture window pair into a DriftSample

use tracing::{debug, instrument};

use contracts::{
    AudioWindow, DetectorConfig, DeviceId, DriftSample, PreprocessConfig, RejectReason,
    SyncStreamConfig, TimeRange,
};

use crate::correlation::{correlate, CorrelationPeak};
use crate::error::DetectorError;
use crate::preprocess::SignalPreprocessor;

/// Measures acoustic lag of a node against the reference stream.
///
/// Holds configuration only; `measure` is a pure computation and can run on
/// any thread.
#[derive(Debug, Clone)]
pub struct DriftDetector {
    preprocessor: SignalPreprocessor,
    config: DetectorConfig,
}

impl DriftDetector {
    /// The shortest accepted window is capped at the correlation window, so
    /// a full capture is never too short.
    pub fn new(mut preprocess: PreprocessConfig, config: DetectorConfig) -> Self {
        preprocess.min_window_s = preprocess.min_window_s.min(config.window_s);
        Self {
            preprocessor: SignalPreprocessor::new(preprocess),
            config,
        }
    }

    pub fn from_config(config: &SyncStreamConfig) -> Self {
        Self::new(config.preprocess.clone(), config.detector.clone())
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn preprocessor(&self) -> &SignalPreprocessor {
        &self.preprocessor
    }

    /// Reference range to fetch for a capture range.
    ///
    /// Padded by the maximum drift on both sides so the capture is fully
    /// covered at every lag that can be accepted.
    pub fn reference_range(&self, capture: TimeRange) -> TimeRange {
        let pad = self.config.max_drift_ms / 1000.0;
        TimeRange::new(capture.start - pad, capture.end + pad)
    }

    /// Measure the lag of `capture` against `reference`.
    ///
    /// The returned drift is the acoustic lag in milliseconds: positive when
    /// the capture hears the reference content late. Validation failures
    /// come back as a rejected sample; only unusable input is an error.
    #[instrument(
        name = "drift_detector_measure",
        skip(self, reference, capture),
        fields(device_id = %device_id)
    )]
    pub fn measure(
        &self,
        device_id: &DeviceId,
        reference: &AudioWindow,
        capture: &AudioWindow,
    ) -> Result<DriftSample, DetectorError> {
        if reference.sample_rate != capture.sample_rate {
            return Err(DetectorError::SampleRateMismatch {
                reference: reference.sample_rate,
                capture: capture.sample_rate,
            });
        }
        let rate = f64::from(capture.sample_rate);

        let reference_samples = self.preprocessor.process(reference)?;
        let capture_samples = self.preprocessor.process(capture)?;

        // Lag between the window starts, in samples
        let start_offset = ((capture.start - reference.start) * rate).round() as i64;
        let max_lag = (self.config.max_drift_ms / 1000.0 * rate).floor() as i64;
        let exclusion = (self.config.peak_exclusion_ms / 1000.0 * rate).round() as usize;

        let peak = correlate(
            &reference_samples,
            &capture_samples,
            (-max_lag - start_offset)..=(max_lag - start_offset),
            exclusion,
        );

        let sample = match peak {
            Some(peak) => self.validate(device_id, capture.start, peak, start_offset, rate),
            None => DriftSample::rejected(
                device_id.clone(),
                capture.start,
                0.0,
                0.0,
                RejectReason::DriftOutOfRange,
            ),
        };

        record_sample(&sample);
        debug!(
            device_id = %device_id,
            drift_ms = sample.raw_drift_ms,
            score = sample.correlation_score,
            valid = sample.valid,
            "Drift measured"
        );
        Ok(sample)
    }

    fn validate(
        &self,
        device_id: &DeviceId,
        timestamp: f64,
        peak: CorrelationPeak,
        start_offset: i64,
        rate: f64,
    ) -> DriftSample {
        let drift_ms = (peak.lag_samples + start_offset as f64) / rate * 1000.0;
        let score = peak.score;

        let rejection = if score < self.config.min_correlation {
            Some(RejectReason::LowCorrelation)
        } else if peak.at_boundary || drift_ms.abs() > self.config.max_drift_ms {
            Some(RejectReason::DriftOutOfRange)
        } else if peak.peak_ratio < self.config.min_peak_ratio {
            Some(RejectReason::AmbiguousPeak)
        } else {
            None
        };

        match rejection {
            None => DriftSample::accepted(device_id.clone(), timestamp, drift_ms, score),
            Some(reason) => {
                DriftSample::rejected(device_id.clone(), timestamp, drift_ms, score, reason)
            }
        }
    }
}

fn record_sample(sample: &DriftSample) {
    let result = match sample.rejection {
        None => "valid",
        Some(reason) => reason.as_str(),
    };
    metrics::counter!("syncstream_detector_samples_total", "result" => result).increment(1);
    metrics::histogram!("syncstream_detector_correlation_score").record(sample.correlation_score);
    if sample.valid {
        metrics::histogram!("syncstream_detector_drift_ms").record(sample.raw_drift_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::SimulatedAcoustics;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const RATE: u32 = 8_000;

    fn acoustics() -> SimulatedAcoustics {
        SimulatedAcoustics::new(RATE, 20.0, 42)
    }

    fn detector() -> DriftDetector {
        DriftDetector::new(PreprocessConfig::default(), DetectorConfig::default())
    }

    /// Reference/capture pair for a node whose output lags by `lag_ms`
    fn pair(
        detector: &DriftDetector,
        acoustics: &SimulatedAcoustics,
        lag_ms: f64,
        noise: f32,
    ) -> (AudioWindow, AudioWindow) {
        let capture_range = TimeRange::new(5.0, 7.0);
        let reference = acoustics.reference_window(detector.reference_range(capture_range));
        let capture = acoustics.capture_window(capture_range, lag_ms, noise, 7);
        (reference, capture)
    }

    #[test]
    fn test_measures_lag() {
        let detector = detector();
        let acoustics = acoustics();
        for lag in [0.0, 12.5, -40.0, 250.0] {
            let (reference, capture) = pair(&detector, &acoustics, lag, 0.05);
            let sample = detector.measure(&"den".into(), &reference, &capture).unwrap();
            assert!(sample.valid, "lag {lag}: {sample:?}");
            assert!(
                (sample.raw_drift_ms - lag).abs() < 0.2,
                "lag {lag}: measured {}",
                sample.raw_drift_ms
            );
            assert!(sample.correlation_score > 0.8);
            assert_eq!(sample.timestamp, 5.0);
        }
    }

    #[test]
    fn test_unrelated_capture_is_low_correlation() {
        let detector = detector();
        let acoustics = acoustics();
        let other = SimulatedAcoustics::new(RATE, 20.0, 99);
        let capture_range = TimeRange::new(5.0, 7.0);
        let reference = acoustics.reference_window(detector.reference_range(capture_range));
        let capture = other.capture_window(capture_range, 0.0, 0.0, 1);

        let sample = detector.measure(&"den".into(), &reference, &capture).unwrap();
        assert!(!sample.valid);
        assert_eq!(sample.rejection, Some(RejectReason::LowCorrelation));
    }

    #[test]
    fn test_lag_beyond_max_is_rejected() {
        let detector = DriftDetector::new(
            PreprocessConfig::default(),
            DetectorConfig {
                max_drift_ms: 50.0,
                ..Default::default()
            },
        );
        let acoustics = acoustics();
        // Reference padded wider than the search range so the true lag is
        // present in the data but outside the accepted range
        let capture_range = TimeRange::new(5.0, 7.0);
        let reference = acoustics.reference_window(TimeRange::new(4.0, 8.0));
        let capture = acoustics.capture_window(capture_range, 120.0, 0.0, 1);

        let sample = detector.measure(&"den".into(), &reference, &capture).unwrap();
        assert!(!sample.valid);
        assert!(sample.raw_drift_ms.abs() <= 50.0);
    }

    #[test]
    fn test_valid_samples_never_exceed_max_drift() {
        let max_drift_ms = 80.0;
        let detector = DriftDetector::new(
            PreprocessConfig::default(),
            DetectorConfig {
                max_drift_ms,
                ..Default::default()
            },
        );
        let acoustics = acoustics();
        let mut rng = StdRng::seed_from_u64(3);

        for round in 0..12 {
            let lag = rng.random_range(-200.0..200.0);
            let capture_range = TimeRange::new(5.0, 7.0);
            let reference = acoustics.reference_window(TimeRange::new(4.5, 7.5));
            let capture = acoustics.capture_window(capture_range, lag, 0.1, round);

            let sample = detector.measure(&"den".into(), &reference, &capture).unwrap();
            if sample.valid {
                assert!(sample.correlation_score >= detector.config().min_correlation);
                assert!(
                    sample.raw_drift_ms.abs() <= max_drift_ms,
                    "lag {lag}: accepted {}",
                    sample.raw_drift_ms
                );
            }
        }
    }

    #[test]
    fn test_tone_is_ambiguous() {
        let detector = detector();
        let capture_range = TimeRange::new(5.0, 7.0);
        let tone = |range: TimeRange| {
            let n = (range.duration() * f64::from(RATE)).round() as usize;
            let samples = (0..n)
                .map(|i| {
                    let t = range.start + i as f64 / f64::from(RATE);
                    (2.0 * std::f64::consts::PI * 440.0 * t).sin() as f32
                })
                .collect();
            AudioWindow::new(range.start, RATE, samples)
        };
        let reference = tone(detector.reference_range(capture_range));
        let capture = tone(capture_range);

        let sample = detector.measure(&"den".into(), &reference, &capture).unwrap();
        assert_eq!(sample.rejection, Some(RejectReason::AmbiguousPeak));
    }

    #[test]
    fn test_sample_rate_mismatch() {
        let detector = detector();
        let reference = AudioWindow::new(0.0, 8_000, vec![0.0; 16_000]);
        let capture = AudioWindow::new(0.0, 16_000, vec![0.0; 32_000]);
        assert!(matches!(
            detector.measure(&"den".into(), &reference, &capture),
            Err(DetectorError::SampleRateMismatch { .. })
        ));
    }

    #[test]
    fn test_full_window_is_never_too_short() {
        let detector = DriftDetector::new(
            PreprocessConfig {
                min_window_s: 1.5,
                ..Default::default()
            },
            DetectorConfig {
                window_s: 1.0,
                ..Default::default()
            },
        );
        assert_eq!(detector.preprocessor().config().min_window_s, 1.0);

        let acoustics = acoustics();
        let capture_range = TimeRange::new(5.0, 6.0);
        let reference = acoustics.reference_window(detector.reference_range(capture_range));
        let capture = acoustics.capture_window(capture_range, 12.5, 0.05, 3);
        let sample = detector.measure(&"den".into(), &reference, &capture).unwrap();
        assert!(sample.valid, "{sample:?}");
        assert!((sample.raw_drift_ms - 12.5).abs() < 0.2);
    }

    #[test]
    fn test_short_capture() {
        let detector = detector();
        let acoustics = acoustics();
        let reference = acoustics.reference_window(TimeRange::new(4.0, 6.0));
        let capture = acoustics.capture_window(TimeRange::new(5.0, 5.1), 0.0, 0.0, 1);
        assert!(matches!(
            detector.measure(&"den".into(), &reference, &capture),
            Err(DetectorError::InsufficientSamples { .. })
        ));
    }
}

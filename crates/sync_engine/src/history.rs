//! Bounded per-device sample history.
//!
//! Backed by a fixed-capacity ring buffer; inserting into a full history
//! drops the oldest sample.

use std::fmt;

use contracts::DriftSample;
use ringbuf::{traits::*, HeapRb};

/// Mean and population standard deviation of a set of drift values
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriftStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
}

pub struct SampleHistory {
    ring: HeapRb<DriftSample>,
    capacity: usize,
    evicted: u64,
}

impl fmt::Debug for SampleHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleHistory")
            .field("len", &self.ring.occupied_len())
            .field("capacity", &self.capacity)
            .field("evicted", &self.evicted)
            .finish()
    }
}

impl SampleHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: HeapRb::new(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Append a sample, dropping the oldest one when full
    pub fn push(&mut self, sample: DriftSample) {
        if self.ring.is_full() {
            self.ring.try_pop();
            self.evicted += 1;
        }
        let _ = self.ring.try_push(sample);
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &DriftSample> {
        self.ring.iter()
    }

    pub fn valid(&self) -> impl Iterator<Item = &DriftSample> {
        self.ring.iter().filter(|s| s.valid)
    }

    pub fn latest(&self) -> Option<&DriftSample> {
        self.ring.iter().last()
    }

    /// Stats over the valid samples
    pub fn valid_stats(&self) -> DriftStats {
        let (count, sum, sum_sq) = self
            .valid()
            .fold((0usize, 0.0, 0.0), |(n, s, sq), sample| {
                (n + 1, s + sample.raw_drift_ms, sq + sample.raw_drift_ms.powi(2))
            });
        if count == 0 {
            return DriftStats::default();
        }
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        DriftStats {
            count,
            mean,
            std_dev: variance.sqrt(),
        }
    }

    /// `(timestamp, drift)` of the valid samples, oldest first
    pub fn valid_points(&self) -> Vec<(f64, f64)> {
        self.valid().map(|s| (s.timestamp, s.raw_drift_ms)).collect()
    }
}

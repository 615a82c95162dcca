//! Least-squares drift trend over the sample history

use nalgebra::{Matrix2, Vector2};

/// Straight-line fit `drift(t) = intercept + slope * (t - origin)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trend {
    /// Time the intercept refers to (first sample)
    pub origin: f64,
    pub intercept_ms: f64,
    /// Drift change per second
    pub slope_ms_per_s: f64,
    /// Coefficient of determination
    pub r2: f64,
    pub samples: usize,
}

impl Trend {
    pub fn predict(&self, t: f64) -> f64 {
        self.intercept_ms + self.slope_ms_per_s * (t - self.origin)
    }
}

/// Fit a line through `(timestamp, drift)` points.
///
/// `None` with fewer than two points or when all timestamps coincide.
pub fn fit(points: &[(f64, f64)]) -> Option<Trend> {
    let (origin, _) = *points.first()?;
    if points.len() < 2 {
        return None;
    }

    // Normal equations on [1, t - origin]
    let mut xtx = Matrix2::<f64>::zeros();
    let mut xty = Vector2::<f64>::zeros();
    for &(t, y) in points {
        let row = Vector2::new(1.0, t - origin);
        xtx += row * row.transpose();
        xty += row * y;
    }
    let beta = xtx.try_inverse()? * xty;
    let (intercept_ms, slope_ms_per_s) = (beta[0], beta[1]);
    if !intercept_ms.is_finite() || !slope_ms_per_s.is_finite() {
        return None;
    }

    let mean = points.iter().map(|&(_, y)| y).sum::<f64>() / points.len() as f64;
    let (ss_res, ss_tot) = points.iter().fold((0.0, 0.0), |(res, tot), &(t, y)| {
        let fitted = intercept_ms + slope_ms_per_s * (t - origin);
        (res + (y - fitted).powi(2), tot + (y - mean).powi(2))
    });
    let r2 = if ss_tot <= f64::EPSILON {
        1.0
    } else {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    };

    Some(Trend {
        origin,
        intercept_ms,
        slope_ms_per_s,
        r2,
        samples: points.len(),
    })
}

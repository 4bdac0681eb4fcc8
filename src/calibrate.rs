//! Robust calibration of per-run RT/IM coordinates onto a reference scale.
//!
//! Each run is mapped onto the reference run by locally weighted
//! scatterplot smoothing (lowess) fitted on high-confidence shared
//! peptides. The fitted curve is evaluated by interpolation between its
//! knots; outside the training domain the boundary-nearest fitted value is
//! used (flat extrapolation), so gradient extremes can never blow up the
//! mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Calibration axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    /// Chromatographic retention time.
    RetentionTime,
    /// Ion mobility.
    IonMobility,
}

impl Axis {
    /// Short label used in log output.
    pub fn label(&self) -> &'static str {
        match self {
            Axis::RetentionTime => "RT",
            Axis::IonMobility => "IM",
        }
    }

    /// Column name used in coordinate files.
    pub fn column_name(&self) -> &'static str {
        match self {
            Axis::RetentionTime => "retention_time",
            Axis::IonMobility => "ion_mobility",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors raised while fitting a calibration model.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    /// Too few shared anchor peptides to fit the mapping; the run is
    /// excluded from the library.
    #[error("run {run_id}: {observed} shared {axis} anchors, {required} required for calibration")]
    InsufficientData {
        /// Run that failed to calibrate.
        run_id: String,
        /// Axis being calibrated.
        axis: Axis,
        /// Minimum anchor count.
        required: usize,
        /// Anchors actually available.
        observed: usize,
    },

    /// Smoothing fraction outside (0, 1].
    #[error("invalid lowess fraction {0}; expected a value in (0, 1] (or 0 on the CLI for cross-validation)")]
    InvalidFraction(f64),
}

/// Lowess bandwidth selection.
///
/// The CLI encodes cross-validation as fraction `0`; that sentinel is
/// resolved into this explicit choice at the boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmoothingFraction {
    /// Use this fraction of points for every local fit.
    Fixed(f64),
    /// Choose the fraction by k-fold cross-validation.
    CrossValidated,
}

impl SmoothingFraction {
    /// Validated fixed fraction.
    pub fn fixed(fraction: f64) -> Result<Self, CalibrationError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(CalibrationError::InvalidFraction(fraction));
        }
        Ok(SmoothingFraction::Fixed(fraction))
    }

    /// Resolve the CLI convention: `0` selects cross-validation, any
    /// other value is a fixed fraction.
    pub fn from_cli(fraction: f64) -> Result<Self, CalibrationError> {
        if fraction == 0.0 {
            Ok(SmoothingFraction::CrossValidated)
        } else {
            Self::fixed(fraction)
        }
    }
}

/// Default minimum anchor peptides for a successful calibration.
pub const DEFAULT_MIN_CALIBRATION_PEPTIDES: usize = 5;

/// Candidate fractions scanned during cross-validation.
const CV_FRACTIONS: [f64; 9] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];

/// Maximum fold count for cross-validation.
const CV_MAX_FOLDS: usize = 10;

/// A fitted native-to-reference mapping for one run and one axis.
///
/// Valid over the convex hull of the training native values; outside that
/// domain `predict` extrapolates flat from the nearest boundary.
#[derive(Debug, Clone)]
pub struct AxisCalibration {
    knots: Vec<f64>,
    fitted: Vec<f64>,
}

impl AxisCalibration {
    /// Fit a lowess mapping from `pairs` of (native, reference) anchor
    /// coordinates.
    pub fn fit(
        run_id: &str,
        axis: Axis,
        pairs: &[(f64, f64)],
        fraction: SmoothingFraction,
        min_peptides: usize,
    ) -> Result<Self, CalibrationError> {
        if pairs.len() < min_peptides.max(2) {
            return Err(CalibrationError::InsufficientData {
                run_id: run_id.to_string(),
                axis,
                required: min_peptides.max(2),
                observed: pairs.len(),
            });
        }

        let (x, y) = collapse_duplicates(pairs);

        let fraction = match fraction {
            SmoothingFraction::Fixed(f) => f,
            SmoothingFraction::CrossValidated => cross_validate(&x, &y),
        };

        let fitted = lowess_fit(&x, &y, fraction);
        Ok(AxisCalibration { knots: x, fitted })
    }

    /// Training domain (smallest and largest native anchor value).
    pub fn domain(&self) -> (f64, f64) {
        (self.knots[0], self.knots[self.knots.len() - 1])
    }

    /// Map a native axis value onto the reference scale.
    ///
    /// In-domain values interpolate linearly between fitted knots;
    /// out-of-domain values take the boundary-nearest fitted value.
    pub fn predict(&self, native: f64) -> f64 {
        let n = self.knots.len();
        if native <= self.knots[0] {
            return self.fitted[0];
        }
        if native >= self.knots[n - 1] {
            return self.fitted[n - 1];
        }
        let hi = self.knots.partition_point(|&k| k <= native);
        let lo = hi - 1;
        let dx = self.knots[hi] - self.knots[lo];
        if dx <= 0.0 {
            return self.fitted[lo];
        }
        let t = (native - self.knots[lo]) / dx;
        self.fitted[lo] + t * (self.fitted[hi] - self.fitted[lo])
    }
}

/// Sort pairs by native value and average reference values of exactly
/// duplicated native coordinates, yielding strictly increasing knots.
fn collapse_duplicates(pairs: &[(f64, f64)]) -> (Vec<f64>, Vec<f64>) {
    let mut sorted: Vec<(f64, f64)> = pairs.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut x = Vec::with_capacity(sorted.len());
    let mut y = Vec::with_capacity(sorted.len());
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        let mut sum = 0.0;
        while j < sorted.len() && sorted[j].0 == sorted[i].0 {
            sum += sorted[j].1;
            j += 1;
        }
        x.push(sorted[i].0);
        y.push(sum / (j - i) as f64);
        i = j;
    }
    (x, y)
}

/// Lowess: tricube-weighted local linear regression evaluated at every
/// knot. `x` must be sorted ascending.
fn lowess_fit(x: &[f64], y: &[f64], fraction: f64) -> Vec<f64> {
    let n = x.len();
    let window = ((fraction * n as f64).ceil() as usize).clamp(2, n);

    let mut fitted = Vec::with_capacity(n);
    let mut lo = 0;
    for i in 0..n {
        // Slide the window so it holds the `window` nearest neighbors.
        let mut hi = lo + window;
        while hi < n && x[hi] - x[i] < x[i] - x[lo] {
            lo += 1;
            hi += 1;
        }
        let span = &x[lo..lo + window];
        let span_y = &y[lo..lo + window];
        let max_dist = span
            .iter()
            .map(|&xj| (xj - x[i]).abs())
            .fold(0.0_f64, f64::max);

        if max_dist <= 0.0 {
            // Degenerate window: every point shares the same coordinate.
            fitted.push(span_y.iter().sum::<f64>() / span_y.len() as f64);
            continue;
        }

        // Local linear fit centered at x[i]; the fitted value is the
        // intercept at offset zero.
        let (mut sw, mut swd, mut swy, mut swdd, mut swdy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&xj, &yj) in span.iter().zip(span_y) {
            let d = xj - x[i];
            let u = d.abs() / max_dist;
            if u >= 1.0 {
                continue;
            }
            let w = (1.0 - u * u * u).powi(3);
            sw += w;
            swd += w * d;
            swy += w * yj;
            swdd += w * d * d;
            swdy += w * d * yj;
        }

        let denom = sw * swdd - swd * swd;
        if denom.abs() < 1e-12 {
            fitted.push(swy / sw);
        } else {
            let slope = (sw * swdy - swd * swy) / denom;
            fitted.push((swy - slope * swd) / sw);
        }
    }
    fitted
}

/// Select the lowess fraction minimizing out-of-fold squared prediction
/// error. Folds are assigned by index stride, so selection is
/// deterministic; ties keep the smallest fraction.
fn cross_validate(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len();
    let folds = CV_MAX_FOLDS.min(n);

    let mut best = (CV_FRACTIONS[0], f64::INFINITY);
    for &fraction in &CV_FRACTIONS {
        let mut error = 0.0;
        for fold in 0..folds {
            let mut train_x = Vec::with_capacity(n);
            let mut train_y = Vec::with_capacity(n);
            let mut test_x = Vec::new();
            let mut test_y = Vec::new();
            for i in 0..n {
                if i % folds == fold {
                    test_x.push(x[i]);
                    test_y.push(y[i]);
                } else {
                    train_x.push(x[i]);
                    train_y.push(y[i]);
                }
            }
            if train_x.len() < 2 || test_x.is_empty() {
                continue;
            }
            let fitted = lowess_fit(&train_x, &train_y, fraction);
            let model = AxisCalibration {
                knots: train_x,
                fitted,
            };
            for (&xt, &yt) in test_x.iter().zip(&test_y) {
                let residual = model.predict(xt) - yt;
                error += residual * residual;
            }
        }
        if error < best.1 {
            best = (fraction, error);
        }
    }
    best.0
}

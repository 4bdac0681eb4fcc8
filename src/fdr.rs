//! False-discovery-rate estimation and filtering.
//!
//! Entities (PSMs, peptides or proteins) arrive as posterior error
//! probabilities plus decoy flags. Q-values are model-based: the q-value of
//! an entity is the mean PEP over all entities scoring at least as well,
//! which makes acceptance sets nest across thresholds by construction.
//! The null proportion (pi0) is estimated by an injectable strategy so the
//! statistics back-end can be swapped; the built-in strategy implements the
//! Storey estimator over decoy-derived empirical p-values.

use std::fmt;

/// Errors raised during FDR estimation.
#[derive(Debug, thiserror::Error)]
pub enum FdrError {
    /// Too few entities to estimate error rates at this level.
    #[error("insufficient data for {level} FDR estimation: {observed} entities, {required} required")]
    InsufficientData {
        /// Level the estimate was requested for.
        level: FdrLevel,
        /// Minimum entity count.
        required: usize,
        /// Entities actually observed.
        observed: usize,
    },

    /// No decoy entities available for null estimation.
    #[error("no decoy entities available for null estimation")]
    NoDecoys,

    /// pi0 estimation was requested but no strategy is wired in.
    #[error("pi0 estimation requested but no estimator capability is available")]
    MissingPi0Estimator,

    /// Lambda parameters outside the valid range.
    #[error("invalid pi0 lambda parameters: {0}")]
    InvalidLambda(String),

    /// FDR threshold outside (0, 1].
    #[error("invalid FDR threshold {0}; expected a value in (0, 1]")]
    InvalidThreshold(f64),
}

/// Statistical level an FDR estimate applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdrLevel {
    /// Peptide-spectrum match level.
    Psm,
    /// Peptide level (best PSM per peptide).
    Peptide,
    /// Protein level (best PSM per protein).
    Protein,
}

impl fmt::Display for FdrLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdrLevel::Psm => write!(f, "PSM"),
            FdrLevel::Peptide => write!(f, "peptide"),
            FdrLevel::Protein => write!(f, "protein"),
        }
    }
}

/// Lambda parameterization for pi0 estimation.
///
/// The CLI triple `start,end,step` maps to `Range`; the degenerate triple
/// `v,0,0` means "use the fixed value v directly" and maps to `Fixed`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pi0Lambda {
    /// Use this pi0 value directly, skipping estimation.
    Fixed(f64),
    /// Evaluate pi0 over a lambda grid and smooth.
    Range {
        /// First lambda (inclusive).
        start: f64,
        /// Last lambda (inclusive).
        end: f64,
        /// Grid spacing.
        step: f64,
    },
}

impl Pi0Lambda {
    /// Build from the `start,end,step` CLI triple, resolving the
    /// `v,0,0` fixed-value convention into an explicit variant.
    pub fn from_triple(start: f64, end: f64, step: f64) -> Result<Self, FdrError> {
        if end == 0.0 && step == 0.0 {
            if start <= 0.0 || start > 1.0 {
                return Err(FdrError::InvalidLambda(format!(
                    "fixed pi0 {start} outside (0, 1]"
                )));
            }
            return Ok(Pi0Lambda::Fixed(start));
        }
        if !(0.0..1.0).contains(&start) || end <= start || end >= 1.0 || step <= 0.0 {
            return Err(FdrError::InvalidLambda(format!(
                "range {start},{end},{step} must satisfy 0 <= start < end < 1 and step > 0"
            )));
        }
        Ok(Pi0Lambda::Range { start, end, step })
    }

    /// Lambda grid points for `Range`; empty for `Fixed`.
    fn grid(&self) -> Vec<f64> {
        match *self {
            Pi0Lambda::Fixed(_) => Vec::new(),
            Pi0Lambda::Range { start, end, step } => {
                let mut grid = Vec::new();
                let mut lambda = start;
                // Half-step tolerance so the endpoint survives float drift.
                while lambda <= end + step * 0.5 {
                    grid.push(lambda.min(end));
                    lambda += step;
                }
                grid.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
                grid
            }
        }
    }
}

/// Injectable pi0 (null-proportion) estimation strategy.
pub trait Pi0Estimator {
    /// Estimate the proportion of true nulls among the target entities.
    ///
    /// `scores` are PEPs (lower is better) and `decoys` marks decoy
    /// entities, index-aligned with `scores`.
    fn estimate(
        &self,
        scores: &[f64],
        decoys: &[bool],
        lambda: &Pi0Lambda,
    ) -> Result<f64, FdrError>;
}

/// Storey pi0 estimator over decoy-derived empirical p-values.
///
/// For each target entity, the p-value is the fraction of decoys scoring
/// at least as well (with add-one smoothing). pi0(lambda) is evaluated on
/// the lambda grid and smoothed by a least-squares line evaluated at the
/// largest lambda.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreyPi0;

impl Pi0Estimator for StoreyPi0 {
    fn estimate(
        &self,
        scores: &[f64],
        decoys: &[bool],
        lambda: &Pi0Lambda,
    ) -> Result<f64, FdrError> {
        if let Pi0Lambda::Fixed(value) = lambda {
            return Ok(*value);
        }

        let mut decoy_scores: Vec<f64> = scores
            .iter()
            .zip(decoys)
            .filter(|(_, d)| **d)
            .map(|(s, _)| *s)
            .collect();
        if decoy_scores.is_empty() {
            return Err(FdrError::NoDecoys);
        }
        decoy_scores.sort_by(f64::total_cmp);

        let pvalues: Vec<f64> = scores
            .iter()
            .zip(decoys)
            .filter(|(_, d)| !**d)
            .map(|(s, _)| {
                let better = decoy_scores.partition_point(|d| *d <= *s);
                (better as f64 + 1.0) / (decoy_scores.len() as f64 + 1.0)
            })
            .collect();
        if pvalues.is_empty() {
            // All entities are decoys: the target population is pure null.
            return Ok(1.0);
        }

        let grid = lambda.grid();
        let m = pvalues.len() as f64;
        let raw: Vec<(f64, f64)> = grid
            .iter()
            .map(|&l| {
                let exceed = pvalues.iter().filter(|&&p| p > l).count() as f64;
                (l, exceed / (m * (1.0 - l)))
            })
            .collect();

        Ok(smooth_at_max_lambda(&raw).clamp(f64::MIN_POSITIVE, 1.0))
    }
}

/// Least-squares line through (lambda, pi0(lambda)), evaluated at the
/// largest lambda. Stand-in for the reference spline smoother; exact for
/// a flat pi0 profile.
fn smooth_at_max_lambda(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    if points.len() < 2 {
        return points.first().map(|(_, p)| *p).unwrap_or(1.0);
    }
    let (sx, sy, sxx, sxy) = points.iter().fold((0.0, 0.0, 0.0, 0.0), |acc, (x, y)| {
        (acc.0 + x, acc.1 + y, acc.2 + x * x, acc.3 + x * y)
    });
    let denom = n * sxx - sx * sx;
    let max_x = points[points.len() - 1].0;
    if denom.abs() < 1e-12 {
        return sy / n;
    }
    let slope = (n * sxy - sx * sy) / denom;
    let intercept = (sy - slope * sx) / n;
    intercept + slope * max_x
}

/// Model-based q-values from posterior error probabilities.
///
/// The q-value of an entity is the mean PEP over all entities with a PEP
/// at or below its own. Q-values are nondecreasing in PEP, so for any two
/// thresholds t1 < t2 the accepted set at t1 is a subset of the accepted
/// set at t2.
pub fn posterior_qvalues(peps: &[f64]) -> Vec<f64> {
    let n = peps.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| peps[a].total_cmp(&peps[b]));

    let mut qvalues = vec![0.0; n];
    let mut cumulative = 0.0;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j < n && peps[order[j]] == peps[order[i]] {
            cumulative += peps[order[j]];
            j += 1;
        }
        // Ties share the q-value of the last tied rank.
        let q = cumulative / j as f64;
        for k in i..j {
            qvalues[order[k]] = q;
        }
        i = j;
    }
    qvalues
}

/// Outcome of assessing one entity population at one level.
#[derive(Debug, Clone)]
pub struct FdrAssessment {
    /// Q-value per input entity, index-aligned.
    pub qvalues: Vec<f64>,
    /// Accept decision per input entity (target and q-value at or below
    /// the threshold).
    pub accept: Vec<bool>,
    /// Number of accepted entities.
    pub passing: usize,
    /// Estimated null proportion.
    pub pi0: f64,
    /// Estimated global false-discovery proportion among accepted
    /// entities (mean accepted PEP).
    pub global_fdp: f64,
}

/// q-value/pi0 engine for one invocation of the pipeline.
pub struct FdrEstimator {
    lambda: Pi0Lambda,
    pi0: Option<Box<dyn Pi0Estimator>>,
    min_entities: usize,
}

/// Default minimum entity count for a usable FDR estimate.
pub const DEFAULT_MIN_FDR_ENTITIES: usize = 20;

impl FdrEstimator {
    /// Create an estimator with no pi0 capability wired in.
    pub fn new(lambda: Pi0Lambda) -> Self {
        Self {
            lambda,
            pi0: None,
            min_entities: DEFAULT_MIN_FDR_ENTITIES,
        }
    }

    /// Wire in a pi0 estimation strategy.
    pub fn with_pi0(mut self, pi0: Box<dyn Pi0Estimator>) -> Self {
        self.pi0 = Some(pi0);
        self
    }

    /// Override the minimum entity count below which estimation fails
    /// closed.
    pub fn with_min_entities(mut self, min_entities: usize) -> Self {
        self.min_entities = min_entities;
        self
    }

    /// Assess one entity population at `level` against `threshold`.
    ///
    /// Fails closed: fewer than the minimum entity count is an error, not
    /// blanket acceptance. A missing pi0 strategy is a capability error.
    pub fn assess(
        &self,
        level: FdrLevel,
        threshold: f64,
        peps: &[f64],
        decoys: &[bool],
    ) -> Result<FdrAssessment, FdrError> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(FdrError::InvalidThreshold(threshold));
        }
        if peps.len() < self.min_entities {
            return Err(FdrError::InsufficientData {
                level,
                required: self.min_entities,
                observed: peps.len(),
            });
        }

        let pi0 = self
            .pi0
            .as_ref()
            .ok_or(FdrError::MissingPi0Estimator)?
            .estimate(peps, decoys, &self.lambda)?;

        let qvalues = posterior_qvalues(peps);
        let mut accept = vec![false; peps.len()];
        let mut passing = 0;
        let mut accepted_pep_sum = 0.0;
        for (i, q) in qvalues.iter().enumerate() {
            if !decoys[i] && *q <= threshold {
                accept[i] = true;
                passing += 1;
                accepted_pep_sum += peps[i];
            }
        }
        let global_fdp = if passing > 0 {
            accepted_pep_sum / passing as f64
        } else {
            0.0
        };

        Ok(FdrAssessment {
            qvalues,
            accept,
            passing,
            pi0,
            global_fdp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_population(n_targets: usize, n_decoys: usize) -> (Vec<f64>, Vec<bool>) {
        let mut peps = Vec::new();
        let mut decoys = Vec::new();
        for i in 0..n_targets {
            peps.push(0.001 + 0.002 * i as f64);
            decoys.push(false);
        }
        for i in 0..n_decoys {
            peps.push(0.5 + 0.01 * i as f64);
            decoys.push(true);
        }
        (peps, decoys)
    }

    #[test]
    fn test_qvalues_are_monotone_in_pep() {
        let peps = vec![0.5, 0.001, 0.02, 0.3, 0.001];
        let q = posterior_qvalues(&peps);
        let mut pairs: Vec<(f64, f64)> = peps.iter().copied().zip(q.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        for window in pairs.windows(2) {
            assert!(window[0].1 <= window[1].1);
        }
    }

    #[test]
    fn test_qvalue_is_mean_of_better_peps() {
        let peps = vec![0.1, 0.2, 0.4];
        let q = posterior_qvalues(&peps);
        assert!((q[0] - 0.1).abs() < 1e-12);
        assert!((q[1] - 0.15).abs() < 1e-12);
        assert!((q[2] - (0.7 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_tied_peps_share_qvalue() {
        let peps = vec![0.2, 0.2, 0.6];
        let q = posterior_qvalues(&peps);
        assert_eq!(q[0], q[1]);
    }

    #[test]
    fn test_acceptance_sets_nest_across_thresholds() {
        let (peps, decoys) = synthetic_population(50, 30);
        let estimator = FdrEstimator::new(Pi0Lambda::Fixed(1.0)).with_pi0(Box::new(StoreyPi0));
        let tight = estimator
            .assess(FdrLevel::Psm, 0.01, &peps, &decoys)
            .unwrap();
        let loose = estimator
            .assess(FdrLevel::Psm, 0.05, &peps, &decoys)
            .unwrap();
        for i in 0..peps.len() {
            if tight.accept[i] {
                assert!(loose.accept[i], "entity {i} accepted at 0.01 but not 0.05");
            }
        }
        assert!(tight.passing <= loose.passing);
    }

    #[test]
    fn test_fails_closed_on_small_population() {
        let (peps, decoys) = synthetic_population(3, 2);
        let estimator = FdrEstimator::new(Pi0Lambda::Fixed(1.0)).with_pi0(Box::new(StoreyPi0));
        assert!(matches!(
            estimator.assess(FdrLevel::Peptide, 0.01, &peps, &decoys),
            Err(FdrError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_missing_pi0_capability_is_an_error() {
        let (peps, decoys) = synthetic_population(50, 30);
        let estimator = FdrEstimator::new(Pi0Lambda::Fixed(1.0));
        assert!(matches!(
            estimator.assess(FdrLevel::Psm, 0.01, &peps, &decoys),
            Err(FdrError::MissingPi0Estimator)
        ));
    }

    #[test]
    fn test_decoys_are_never_accepted() {
        let (peps, decoys) = synthetic_population(50, 30);
        let estimator = FdrEstimator::new(Pi0Lambda::Fixed(1.0)).with_pi0(Box::new(StoreyPi0));
        let result = estimator
            .assess(FdrLevel::Psm, 1.0, &peps, &decoys)
            .unwrap();
        for (i, is_decoy) in decoys.iter().enumerate() {
            if *is_decoy {
                assert!(!result.accept[i]);
            }
        }
    }

    #[test]
    fn test_fixed_pi0_passes_through() {
        let lambda = Pi0Lambda::from_triple(0.4, 0.0, 0.0).unwrap();
        assert_eq!(lambda, Pi0Lambda::Fixed(0.4));
        let pi0 = StoreyPi0.estimate(&[0.1, 0.9], &[false, true], &lambda).unwrap();
        assert_eq!(pi0, 0.4);
    }

    #[test]
    fn test_lambda_triple_validation() {
        assert!(Pi0Lambda::from_triple(0.1, 0.5, 0.05).is_ok());
        assert!(Pi0Lambda::from_triple(0.0, 0.0, 0.0).is_err());
        assert!(Pi0Lambda::from_triple(0.5, 0.1, 0.05).is_err());
        assert!(Pi0Lambda::from_triple(0.1, 0.5, -0.1).is_err());
        assert!(Pi0Lambda::from_triple(1.5, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_storey_pi0_near_one_for_null_population() {
        // Targets drawn from the same distribution as decoys: pi0 ~ 1.
        let mut peps = Vec::new();
        let mut decoys = Vec::new();
        for i in 0..200 {
            peps.push(i as f64 / 200.0);
            decoys.push(i % 2 == 0);
        }
        let lambda = Pi0Lambda::from_triple(0.1, 0.5, 0.05).unwrap();
        let pi0 = StoreyPi0.estimate(&peps, &decoys, &lambda).unwrap();
        assert!(pi0 > 0.8 && pi0 <= 1.0, "pi0 = {pi0}");
    }

    #[test]
    fn test_storey_pi0_requires_decoys() {
        let lambda = Pi0Lambda::from_triple(0.1, 0.5, 0.05).unwrap();
        assert!(matches!(
            StoreyPi0.estimate(&[0.1, 0.2], &[false, false], &lambda),
            Err(FdrError::NoDecoys)
        ));
    }
}

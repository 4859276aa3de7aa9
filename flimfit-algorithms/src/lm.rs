//! Levenberg-Marquardt decay fitter.
//!
//! Each `iterate()` builds the Jacobian of the multi-exponential model over
//! the fit window, solves the damped normal equations for the free
//! parameters, and applies the step only if it lowers chi-squared. The
//! damping factor adapts between calls: divided by 10 after an accepted
//! step, multiplied by 10 after a rejected one.

use flimfit_core::curve::{evaluate, DecayCurve, PARAMS_PER_COMPONENT};
use flimfit_core::fitter::{CurveFitter, StepOutcome};
use nalgebra::{DMatrix, DVector};

/// Levenberg-Marquardt configuration.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LmConfig {
    /// Damping factor used after a reset.
    pub initial_lambda: f64,
    /// Lower damping bound.
    pub min_lambda: f64,
    /// Upper damping bound.
    pub max_lambda: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            initial_lambda: 1e-3,
            min_lambda: 1e-12,
            max_lambda: 1e12,
        }
    }
}

/// Gradient-based fitter using damped Gauss-Newton steps.
#[derive(Clone, Debug)]
pub struct LevenbergMarquardtFitter {
    curve: DecayCurve,
    config: LmConfig,
    lambda: f64,
}

impl LevenbergMarquardtFitter {
    /// Wraps a curve with the given configuration.
    #[must_use]
    pub fn new(curve: DecayCurve, config: LmConfig) -> Self {
        let lambda = config.initial_lambda;
        Self {
            curve,
            config,
            lambda,
        }
    }

    /// Current damping factor.
    #[must_use]
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Proposes new parameters along with the current chi-squared, or `None`
    /// if the current fit is non-finite or the damped system is singular.
    fn propose(&self, free: &[usize]) -> Option<(Vec<f64>, f64)> {
        let params = self.curve.params();
        let samples: Vec<(f64, f64)> = self.curve.samples().collect();
        let n = samples.len();
        let k = free.len();

        let mut jacobian = DMatrix::<f64>::zeros(n, k);
        let mut residuals = DVector::<f64>::zeros(n);
        let mut chi = 0.0;
        for (row, &(t, y)) in samples.iter().enumerate() {
            let r = y - evaluate(params, t);
            residuals[row] = r;
            chi += r * r;
            for (col, &index) in free.iter().enumerate() {
                jacobian[(row, col)] = partial_derivative(params, index, t);
            }
        }

        if !chi.is_finite() || jacobian.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let jt = jacobian.transpose();
        let normal = &jt * &jacobian;
        let gradient = &jt * &residuals;

        let largest = normal.diagonal().iter().copied().fold(0.0, f64::max);
        let floor = (largest * 1e-12).max(f64::MIN_POSITIVE);
        let mut damped = normal.clone();
        for i in 0..k {
            damped[(i, i)] += self.lambda * normal[(i, i)].max(floor);
        }

        let delta = solve_damped(damped, &gradient)?;
        let mut trial = params.to_vec();
        for (col, &index) in free.iter().enumerate() {
            trial[index] += delta[col];
        }
        Some((trial, chi))
    }
}

impl CurveFitter for LevenbergMarquardtFitter {
    fn name(&self) -> &'static str {
        "Levenberg-Marquardt"
    }

    fn curve(&self) -> &DecayCurve {
        &self.curve
    }

    fn curve_mut(&mut self) -> &mut DecayCurve {
        &mut self.curve
    }

    fn reset_state(&mut self) {
        self.lambda = self.config.initial_lambda;
    }

    fn iterate(&mut self) -> StepOutcome {
        self.curve.record_iteration();
        let free = self.curve.free_indices();
        if free.is_empty() {
            return StepOutcome::Skipped;
        }

        let Some((trial, chi_before)) = self.propose(&free) else {
            self.lambda = (self.lambda * 10.0).min(self.config.max_lambda);
            return if self.curve.rcse().is_finite() {
                StepOutcome::Rejected
            } else {
                StepOutcome::Diverged
            };
        };

        let chi_after = self.curve.chi_squared(&trial);
        if !trial.iter().all(|v| v.is_finite()) || !chi_after.is_finite() {
            log::trace!("rejecting non-finite LM step (lambda {})", self.lambda);
            self.lambda = (self.lambda * 10.0).min(self.config.max_lambda);
            return StepOutcome::Diverged;
        }

        if chi_after < chi_before {
            let result = self.curve.set_params(&trial);
            debug_assert!(result.is_ok(), "trial length mismatch: {result:?}");
            self.lambda = (self.lambda / 10.0).max(self.config.min_lambda);
            StepOutcome::Improved
        } else {
            self.lambda = (self.lambda * 10.0).min(self.config.max_lambda);
            StepOutcome::Rejected
        }
    }
}

/// Derivative of the model with respect to parameter `index` at time `t`.
fn partial_derivative(params: &[f64], index: usize, t: f64) -> f64 {
    let component = index / PARAMS_PER_COMPONENT;
    let base = component * PARAMS_PER_COMPONENT;
    let (a, b) = (params[base], params[base + 1]);
    match index % PARAMS_PER_COMPONENT {
        0 => (-b * t).exp(),
        1 => -a * t * (-b * t).exp(),
        _ => 1.0,
    }
}

/// Solves the damped normal equations.
///
/// Cholesky handles the usual positive-definite case; SVD with a relaxed
/// tolerance covers near-singular systems.
fn solve_damped(matrix: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    if matrix.iter().chain(rhs.iter()).any(|v| !v.is_finite()) {
        return None;
    }
    if let Some(cholesky) = matrix.clone().cholesky() {
        let delta = cholesky.solve(rhs);
        if delta.iter().all(|v| v.is_finite()) {
            return Some(delta);
        }
    }
    let svd = matrix.svd(true, true);
    for &tol in &[1e-12, 1e-9, 1e-6] {
        if let Ok(delta) = svd.solve(rhs, tol) {
            if delta.iter().all(|v| v.is_finite()) {
                return Some(delta);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use flimfit_core::volume::BinWindow;

    fn fitter_for(counts: Vec<u64>, components: usize) -> LevenbergMarquardtFitter {
        let bins = counts.len();
        let curve = DecayCurve::new(counts, BinWindow::full(bins), components).unwrap();
        LevenbergMarquardtFitter::new(curve, LmConfig::default())
    }

    fn noiseless(amplitude: f64, rate: f64, offset: f64, bins: usize) -> Vec<u64> {
        (0..bins)
            .map(|t| {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let v = (amplitude * (-rate * t as f64).exp() + offset).round() as u64;
                v
            })
            .collect()
    }

    #[test]
    fn test_converges_from_rough_guess() {
        let mut fitter = fitter_for(noiseless(5000.0, 0.15, 20.0, 40), 1);
        fitter.set_params(&[3000.0, 0.3, 0.0]).unwrap();
        for _ in 0..100 {
            fitter.iterate();
        }
        let p = fitter.params();
        assert_relative_eq!(p[1], 0.15, max_relative = 0.01);
        assert_relative_eq!(p[0], 5000.0, max_relative = 0.01);
        assert!(fitter.rcse() < 1.0);
        assert_eq!(fitter.iterations(), 100);
    }

    #[test]
    fn test_error_never_increases() {
        let mut fitter = fitter_for(noiseless(800.0, 0.08, 5.0, 32), 2);
        fitter.estimate();
        let mut last = fitter.rcse();
        for _ in 0..50 {
            fitter.iterate();
            assert!(fitter.rcse() <= last);
            last = fitter.rcse();
        }
    }

    #[test]
    fn test_fixed_parameters_untouched() {
        let mut fitter = fitter_for(noiseless(1000.0, 0.2, 10.0, 30), 1);
        fitter.set_params(&[500.0, 0.25, 3.0]).unwrap();
        fitter.set_fixed(&[false, true, false]).unwrap();
        for _ in 0..20 {
            let before = fitter.params()[1];
            fitter.iterate();
            assert_eq!(fitter.params()[1].to_bits(), before.to_bits());
        }
    }

    #[test]
    fn test_all_fixed_skips() {
        let mut fitter = fitter_for(noiseless(100.0, 0.5, 0.0, 10), 1);
        fitter.set_fixed(&[true, true, true]).unwrap();
        assert_eq!(fitter.iterate(), StepOutcome::Skipped);
        assert_eq!(fitter.iterations(), 1);
    }

    #[test]
    fn test_non_finite_start_is_retained() {
        let mut fitter = fitter_for(noiseless(100.0, 0.5, 0.0, 10), 1);
        fitter.set_params(&[1e300, -1e3, 0.0]).unwrap();
        let before = fitter.params().to_vec();
        assert_eq!(fitter.iterate(), StepOutcome::Diverged);
        assert_eq!(fitter.params(), before.as_slice());
    }
}

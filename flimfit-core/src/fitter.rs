//! Curve fitter contract.
//!
//! Every pyramid cell owns one fitter. Fitters are independent of each other
//! and keep all optimizer state (damping, random streams) to themselves, so
//! cells can be refined in any order.

use crate::curve::{DecayCurve, OFFSET_INDEX, PARAMS_PER_COMPONENT};
use crate::error::Result;
use crate::util::usize_to_f64;
use crate::volume::BinWindow;

/// Result of a single `iterate()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step lowered the error and was applied.
    Improved,
    /// The step did not improve the fit; parameters are unchanged.
    Rejected,
    /// The step produced non-finite values and was discarded.
    Diverged,
    /// Nothing to optimize (no free parameters).
    Skipped,
}

impl StepOutcome {
    /// Returns true if the parameters changed.
    #[inline]
    #[must_use]
    pub fn is_improved(self) -> bool {
        matches!(self, StepOutcome::Improved)
    }
}

/// Trait for per-cell decay curve optimizers.
///
/// Implementations provide the optimizer step; data handling, error
/// statistics and model configuration come from the shared [`DecayCurve`].
pub trait CurveFitter: Send {
    /// Algorithm name.
    fn name(&self) -> &'static str;

    /// Curve state (data, window, parameters).
    fn curve(&self) -> &DecayCurve;

    /// Mutable curve state.
    fn curve_mut(&mut self) -> &mut DecayCurve;

    /// Clears optimizer-private state after the model or data changed.
    fn reset_state(&mut self);

    /// Performs exactly one refinement step.
    ///
    /// Fixed parameters are never modified. A step producing non-finite
    /// values leaves the previous parameter vector in place. The curve's
    /// iteration counter advances by one for every call, whatever the
    /// outcome.
    fn iterate(&mut self) -> StepOutcome;

    /// Replaces counts and window and resets the iteration count.
    ///
    /// # Errors
    /// Returns an error if the window does not fit the histogram.
    fn set_data(&mut self, counts: Vec<u64>, window: BinWindow) -> Result<()> {
        self.curve_mut().set_data(counts, window)?;
        self.reset_state();
        Ok(())
    }

    /// Bootstraps the parameters from the data alone.
    fn estimate(&mut self) {
        let guess = log_linear_estimate(self.curve());
        let result = self.curve_mut().set_params(&guess);
        debug_assert!(result.is_ok(), "estimate length mismatch: {result:?}");
        self.reset_state();
    }

    /// Seeds the parameters, e.g. from a coarser pyramid cell.
    ///
    /// # Errors
    /// Returns an error if the vector length differs from the model.
    fn set_params(&mut self, params: &[f64]) -> Result<()> {
        self.curve_mut().set_params(params)?;
        self.reset_state();
        Ok(())
    }

    /// Marks parameters as fixed.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidFixedMask`] on a length mismatch.
    fn set_fixed(&mut self, fixed: &[bool]) -> Result<()> {
        self.curve_mut().set_fixed(fixed)?;
        self.reset_state();
        Ok(())
    }

    /// Changes the number of exponential components.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidComponentCount`] for unsupported counts.
    fn set_component_count(&mut self, components: usize) -> Result<()> {
        self.curve_mut().set_component_count(components)?;
        self.reset_state();
        Ok(())
    }

    /// Sum of squared residuals for `params`.
    fn chi_squared_error(&self, params: &[f64]) -> f64 {
        self.curve().chi_squared(params)
    }

    /// Reduced chi-squared error for `params`.
    fn reduced_chi_squared_error(&self, params: &[f64]) -> f64 {
        self.curve().reduced_chi_squared(params)
    }

    /// Current parameter vector.
    fn params(&self) -> &[f64] {
        self.curve().params()
    }

    /// Iterations since the data was last set.
    fn iterations(&self) -> u32 {
        self.curve().iterations()
    }

    /// Reduced chi-squared error of the current parameters.
    fn rcse(&self) -> f64 {
        self.curve().rcse()
    }
}

/// Closed-form starting point from a weighted log-linear fit of the tail.
///
/// The tail runs from the window's peak bin to its end. Counts above the
/// offset are regressed as `ln(y - c) = ln(a) - b·t` with weights `y - c`.
/// The offset starts at zero unless it is fixed. A second component starts
/// with zero amplitude and twice the first rate. Fixed parameters keep their
/// current values.
#[must_use]
pub fn log_linear_estimate(curve: &DecayCurve) -> Vec<f64> {
    let current = curve.params();
    let fixed = curve.fixed();
    let offset = if curve.offset_fixed() {
        current[OFFSET_INDEX]
    } else {
        0.0
    };

    let samples: Vec<(f64, f64)> = curve.samples().collect();
    let peak = samples
        .iter()
        .enumerate()
        .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1))
        .map_or(0, |(i, _)| i);

    let (mut sw, mut swt, mut swtt, mut swl, mut swtl) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let mut used = 0usize;
    for &(t, y) in &samples[peak..] {
        let v = y - offset;
        if v <= 0.0 {
            continue;
        }
        let l = v.ln();
        sw += v;
        swt += v * t;
        swtt += v * t * t;
        swl += v * l;
        swtl += v * t * l;
        used += 1;
    }

    let peak_value = samples.get(peak).map_or(1.0, |s| (s.1 - offset).max(1.0));
    let fallback_rate = 4.0 / usize_to_f64(samples.len().max(4));
    let det = sw * swtt - swt * swt;
    let (amplitude, rate) = if used >= 2 && det.abs() > f64::EPSILON * sw * swtt {
        let slope = (sw * swtl - swt * swl) / det;
        let intercept = (swl - slope * swt) / sw;
        if slope < 0.0 && intercept.is_finite() {
            (intercept.exp(), -slope)
        } else {
            (peak_value, fallback_rate)
        }
    } else {
        (peak_value, fallback_rate)
    };

    let mut guess = Vec::with_capacity(current.len());
    for component in 0..curve.component_count() {
        if component == 0 {
            guess.extend_from_slice(&[amplitude, rate, offset]);
        } else {
            guess.extend_from_slice(&[0.0, 2.0 * rate, offset]);
        }
    }
    for (i, value) in guess.iter_mut().enumerate() {
        if fixed[i] {
            *value = current[i];
        }
    }
    debug_assert_eq!(guess.len() % PARAMS_PER_COMPONENT, 0);
    guess
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn curve_from(counts: Vec<u64>, components: usize) -> DecayCurve {
        let bins = counts.len();
        DecayCurve::new(counts, BinWindow::full(bins), components).unwrap()
    }

    #[test]
    fn test_estimate_recovers_exact_decay() {
        let curve = curve_from((0..10).map(|t| 1024 >> t).collect(), 1);
        let guess = log_linear_estimate(&curve);
        assert_relative_eq!(guess[0], 1024.0, max_relative = 1e-9);
        assert_relative_eq!(guess[1], std::f64::consts::LN_2, max_relative = 1e-9);
        assert_relative_eq!(guess[2], 0.0);
    }

    #[test]
    fn test_estimate_starts_after_rising_edge() {
        let curve = curve_from(vec![0, 3, 400, 200, 100, 50, 25], 2);
        let guess = log_linear_estimate(&curve);
        assert_eq!(guess.len(), 6);
        assert_relative_eq!(guess[1], std::f64::consts::LN_2, max_relative = 1e-9);
        assert_relative_eq!(guess[3], 0.0);
        assert_relative_eq!(guess[4], 2.0 * guess[1]);
    }

    #[test]
    fn test_estimate_keeps_fixed_parameters() {
        let mut curve = curve_from((0..10).map(|t| 1024 >> t).collect(), 1);
        curve.set_params(&[1.0, 0.5, 0.0]).unwrap();
        curve.set_fixed(&[false, true, false]).unwrap();
        let guess = log_linear_estimate(&curve);
        assert_relative_eq!(guess[1], 0.5);
    }

    #[test]
    fn test_estimate_keeps_offset_fixed_through_mirrored_slot() {
        let mut curve = curve_from((0..10).map(|t| 1024 + (1024 >> t)).collect(), 2);
        curve.set_params(&[1.0, 0.5, 3.0, 0.0, 1.0, 3.0]).unwrap();
        curve
            .set_fixed(&[false, false, false, false, false, true])
            .unwrap();
        let guess = log_linear_estimate(&curve);
        assert_eq!(guess[2].to_bits(), 3.0_f64.to_bits());
        assert_eq!(guess[5].to_bits(), 3.0_f64.to_bits());
    }

    /// Minimal fitter: halves the distance of every free parameter to a
    /// known target.
    struct Halving {
        curve: DecayCurve,
        target: Vec<f64>,
        resets: usize,
    }

    impl CurveFitter for Halving {
        fn name(&self) -> &'static str {
            "halving"
        }
        fn curve(&self) -> &DecayCurve {
            &self.curve
        }
        fn curve_mut(&mut self) -> &mut DecayCurve {
            &mut self.curve
        }
        fn reset_state(&mut self) {
            self.resets += 1;
        }
        fn iterate(&mut self) -> StepOutcome {
            self.curve.record_iteration();
            let mut next = self.curve.params().to_vec();
            for i in self.curve.free_indices() {
                next[i] += 0.5 * (self.target[i] - next[i]);
            }
            self.curve.set_params(&next).unwrap();
            StepOutcome::Improved
        }
    }

    #[test]
    fn test_default_methods_route_through_curve() {
        let mut fitter = Halving {
            curve: curve_from((0..10).map(|t| 1024 >> t).collect(), 1),
            target: vec![1024.0, std::f64::consts::LN_2, 0.0],
            resets: 0,
        };
        fitter.set_params(&[512.0, 1.0, 0.0]).unwrap();
        fitter.set_fixed(&[false, false, true]).unwrap();
        assert_eq!(fitter.resets, 2);

        let start = fitter.rcse();
        for _ in 0..30 {
            fitter.iterate();
        }
        assert_eq!(fitter.iterations(), 30);
        assert!(fitter.rcse() < start);
        assert_relative_eq!(
            fitter.chi_squared_error(fitter.params()),
            fitter.reduced_chi_squared_error(fitter.params()) * 8.0
        );

        fitter.set_data(vec![1; 10], BinWindow::new(0, 5)).unwrap();
        assert_eq!(fitter.iterations(), 0);
        fitter.set_component_count(2).unwrap();
        assert_eq!(fitter.params(), &[0.0; 6]);
        assert!(fitter.set_component_count(3).is_err());
    }

    #[test]
    fn test_estimate_falls_back_on_flat_data() {
        let curve = curve_from(vec![0; 8], 1);
        let guess = log_linear_estimate(&curve);
        assert!(guess.iter().all(|v| v.is_finite()));
        assert!(guess[1] > 0.0);
    }
}

//! Decay curve state and the multi-exponential model.
//!
//! Parameters are stored as one `(amplitude, rate, offset)` triple per
//! exponential component:
//!
//! ```text
//! model(t) = Σ a_i · exp(-b_i · t) + c
//! ```
//!
//! `t` counts bins from the start of the fit window. The offset `c` is a
//! single model parameter: the first triple's offset slot is authoritative
//! and the remaining offset slots mirror it.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{u64_to_f64, usize_to_f64};
use crate::volume::BinWindow;

/// Parameters per exponential component.
pub const PARAMS_PER_COMPONENT: usize = 3;

/// Largest supported number of exponential components.
pub const MAX_COMPONENTS: usize = 2;

/// Index of the shared offset parameter.
pub const OFFSET_INDEX: usize = 2;

/// Checks a component count is supported.
///
/// # Errors
/// Returns [`Error::InvalidComponentCount`] unless `n` is 1 or 2.
pub fn validate_component_count(n: usize) -> Result<()> {
    if n == 0 || n > MAX_COMPONENTS {
        return Err(Error::InvalidComponentCount(n));
    }
    Ok(())
}

/// Evaluates the model at time `t` (bins since window start).
#[inline]
#[must_use]
pub fn evaluate(params: &[f64], t: f64) -> f64 {
    let offset = params.get(OFFSET_INDEX).copied().unwrap_or(0.0);
    params
        .chunks_exact(PARAMS_PER_COMPONENT)
        .map(|p| p[0] * (-p[1] * t).exp())
        .sum::<f64>()
        + offset
}

/// Raw histogram, fit window and current fit state of one pyramid cell.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DecayCurve {
    counts: Vec<u64>,
    window: BinWindow,
    params: Vec<f64>,
    fixed: Vec<bool>,
    iterations: u32,
    rcse: f64,
}

impl DecayCurve {
    /// Creates a curve with zeroed parameters.
    ///
    /// # Errors
    /// Returns an error if the window does not fit the histogram or the
    /// component count is unsupported.
    pub fn new(counts: Vec<u64>, window: BinWindow, components: usize) -> Result<Self> {
        window.validate(counts.len())?;
        validate_component_count(components)?;
        let len = components * PARAMS_PER_COMPONENT;
        let mut curve = Self {
            counts,
            window,
            params: vec![0.0; len],
            fixed: vec![false; len],
            iterations: 0,
            rcse: f64::INFINITY,
        };
        curve.rcse = curve.reduced_chi_squared(&curve.params);
        Ok(curve)
    }

    /// Replaces counts and window, resetting the iteration counter.
    ///
    /// # Errors
    /// Returns [`Error::InvalidWindow`] if the window does not fit.
    pub fn set_data(&mut self, counts: Vec<u64>, window: BinWindow) -> Result<()> {
        window.validate(counts.len())?;
        self.counts = counts;
        self.window = window;
        self.iterations = 0;
        self.refresh_error();
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    #[inline]
    #[must_use]
    pub fn window(&self) -> BinWindow {
        self.window
    }

    /// Current parameter vector.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Replaces the parameter vector (same length), mirroring the offset.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] on a length mismatch.
    pub fn set_params(&mut self, params: &[f64]) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(Error::InvalidDimension(format!(
                "expected {} parameters, got {}",
                self.params.len(),
                params.len()
            )));
        }
        self.params.copy_from_slice(params);
        self.mirror_offset();
        self.refresh_error();
        Ok(())
    }

    /// Parameter flags held constant during iteration.
    #[inline]
    #[must_use]
    pub fn fixed(&self) -> &[bool] {
        &self.fixed
    }

    /// Marks parameters as fixed.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFixedMask`] if the mask length differs from the
    /// parameter vector.
    pub fn set_fixed(&mut self, fixed: &[bool]) -> Result<()> {
        if fixed.len() != self.params.len() {
            return Err(Error::InvalidFixedMask {
                expected: self.params.len(),
                actual: fixed.len(),
            });
        }
        self.fixed.copy_from_slice(fixed);
        self.refresh_error();
        Ok(())
    }

    /// Number of exponential components.
    #[inline]
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.params.len() / PARAMS_PER_COMPONENT
    }

    /// Resizes the model. Parameters are zeroed and must be re-estimated;
    /// fixed flags keep their prefix and new slots start free.
    ///
    /// # Errors
    /// Returns [`Error::InvalidComponentCount`] for unsupported counts.
    pub fn set_component_count(&mut self, components: usize) -> Result<()> {
        validate_component_count(components)?;
        let len = components * PARAMS_PER_COMPONENT;
        self.params = vec![0.0; len];
        self.fixed.resize(len, false);
        self.iterations = 0;
        self.refresh_error();
        Ok(())
    }

    /// Iterations performed since the data was last set.
    #[inline]
    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Records one completed iteration.
    #[inline]
    pub fn record_iteration(&mut self) {
        self.iterations = self.iterations.saturating_add(1);
    }

    /// Reduced chi-squared error of the current parameters.
    #[inline]
    #[must_use]
    pub fn rcse(&self) -> f64 {
        self.rcse
    }

    /// Recomputes the cached reduced error from the current parameters.
    pub fn refresh_error(&mut self) {
        self.rcse = self.reduced_chi_squared(&self.params);
    }

    /// True if any offset slot is flagged fixed.
    ///
    /// The offset is one shared parameter, so fixing any of its slots holds
    /// all of them.
    #[must_use]
    pub fn offset_fixed(&self) -> bool {
        self.fixed
            .iter()
            .skip(OFFSET_INDEX)
            .step_by(PARAMS_PER_COMPONENT)
            .any(|&f| f)
    }

    /// Indices of parameters updated by the optimizer.
    ///
    /// Mirrored offset slots are never free; the shared offset is free unless
    /// one of its slots is fixed.
    #[must_use]
    pub fn free_indices(&self) -> Vec<usize> {
        let offset_fixed = self.offset_fixed();
        (0..self.params.len())
            .filter(|&i| {
                if i % PARAMS_PER_COMPONENT == OFFSET_INDEX {
                    i == OFFSET_INDEX && !offset_fixed
                } else {
                    !self.fixed[i]
                }
            })
            .collect()
    }

    /// Number of free model parameters.
    #[must_use]
    pub fn free_parameter_count(&self) -> usize {
        self.free_indices().len()
    }

    /// Time of each bin in the window, relative to the window start.
    pub fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        let first = self.window.first;
        self.counts[first..self.window.last]
            .iter()
            .enumerate()
            .map(|(i, &c)| (usize_to_f64(i), u64_to_f64(c)))
    }

    /// Sum of squared residuals over the window for `params`.
    #[must_use]
    pub fn chi_squared(&self, params: &[f64]) -> f64 {
        self.samples()
            .map(|(t, y)| {
                let r = evaluate(params, t) - y;
                r * r
            })
            .sum()
    }

    /// Chi-squared divided by the degrees of freedom (at least one).
    #[must_use]
    pub fn reduced_chi_squared(&self, params: &[f64]) -> f64 {
        let dof = self
            .window
            .len()
            .saturating_sub(self.free_parameter_count())
            .max(1);
        self.chi_squared(params) / usize_to_f64(dof)
    }

    /// Copies the shared offset into every mirrored slot.
    pub fn mirror_offset(&mut self) {
        if let Some(&offset) = self.params.get(OFFSET_INDEX) {
            for slot in self
                .params
                .iter_mut()
                .skip(OFFSET_INDEX + PARAMS_PER_COMPONENT)
                .step_by(PARAMS_PER_COMPONENT)
            {
                *slot = offset;
            }
        }
    }

    /// Rate of the component with the largest amplitude.
    #[must_use]
    pub fn dominant_rate(&self) -> f64 {
        self.params
            .chunks_exact(PARAMS_PER_COMPONENT)
            .max_by(|a, b| a[0].abs().total_cmp(&b[0].abs()))
            .map_or(f64::NAN, |p| p[1])
    }

    /// Lifetime in bins: reciprocal of the dominant rate.
    ///
    /// Non-positive or non-finite rates yield `NaN`.
    #[must_use]
    pub fn lifetime(&self) -> f64 {
        let rate = self.dominant_rate();
        if rate.is_finite() && rate > 0.0 {
            1.0 / rate
        } else {
            f64::NAN
        }
    }

    /// Model value for every bin of the histogram (outside the window too).
    #[must_use]
    pub fn fitted_curve(&self) -> Vec<f64> {
        let first = self.window.first;
        (0..self.counts.len())
            .map(|bin| {
                let t = usize_to_f64(bin) - usize_to_f64(first);
                evaluate(&self.params, t)
            })
            .collect()
    }

    /// Residuals `count - model` for every bin.
    #[must_use]
    pub fn residuals(&self) -> Vec<f64> {
        self.fitted_curve()
            .iter()
            .zip(&self.counts)
            .map(|(fit, &c)| u64_to_f64(c) - fit)
            .collect()
    }
}

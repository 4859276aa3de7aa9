//! Synthetic decay volumes for demos and tests.
//!
//! Each pixel receives `Σ a_i · exp(-b_i · t) + c` sampled at integer bins,
//! optionally perturbed by noise and a left-to-right rate gradient.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};

use crate::error::{Error, Result};
use crate::util::{f64_to_count, usize_to_f64};
use crate::volume::DecayVolume;

/// Noise applied to each synthetic bin.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NoiseModel {
    /// Exact model values (rounded to counts).
    None,
    /// Multiply each bin by a uniform factor in `[1 - e, 1 + e]`.
    Relative(f64),
    /// Draw each bin from a Poisson distribution around the model value.
    Poisson,
}

/// Parameters of a synthetic decay dataset.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SyntheticDecay {
    /// Image rows.
    pub rows: usize,
    /// Image columns.
    pub cols: usize,
    /// Time bins per histogram.
    pub bins: usize,
    /// `(amplitude, rate)` per exponential component.
    pub components: Vec<(f64, f64)>,
    /// Constant background.
    pub offset: f64,
    /// Fractional rate increase from the first to the last column.
    pub rate_gradient: f64,
    /// Per-bin noise.
    pub noise: NoiseModel,
    /// Random seed.
    pub seed: u64,
}

impl Default for SyntheticDecay {
    fn default() -> Self {
        Self {
            rows: 16,
            cols: 16,
            bins: 64,
            components: vec![(1000.0, 0.1)],
            offset: 0.0,
            rate_gradient: 0.0,
            noise: NoiseModel::None,
            seed: 0,
        }
    }
}

impl SyntheticDecay {
    /// Creates a single-exponential dataset.
    #[must_use]
    pub fn single(rows: usize, cols: usize, bins: usize, amplitude: f64, rate: f64) -> Self {
        Self {
            rows,
            cols,
            bins,
            components: vec![(amplitude, rate)],
            ..Self::default()
        }
    }

    /// Adds another exponential component.
    #[must_use]
    pub fn with_component(mut self, amplitude: f64, rate: f64) -> Self {
        self.components.push((amplitude, rate));
        self
    }

    /// Sets the constant background.
    #[must_use]
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the left-to-right rate gradient.
    #[must_use]
    pub fn with_rate_gradient(mut self, gradient: f64) -> Self {
        self.rate_gradient = gradient;
        self
    }

    /// Sets the noise model.
    #[must_use]
    pub fn with_noise(mut self, noise: NoiseModel) -> Self {
        self.noise = noise;
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Rate scale applied to pixels in `col`.
    #[must_use]
    pub fn rate_scale(&self, col: usize) -> f64 {
        if self.cols <= 1 {
            return 1.0;
        }
        1.0 + self.rate_gradient * usize_to_f64(col) / usize_to_f64(self.cols - 1)
    }

    /// Noise-free model value at `bin` for a pixel in `col`.
    #[must_use]
    pub fn model_value(&self, col: usize, bin: usize) -> f64 {
        let t = usize_to_f64(bin);
        let scale = self.rate_scale(col);
        self.components
            .iter()
            .map(|&(a, b)| a * (-b * scale * t).exp())
            .sum::<f64>()
            + self.offset
    }

    /// Generates the volume.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] for zero axes or no components.
    pub fn generate(&self) -> Result<DecayVolume> {
        if self.components.is_empty() {
            return Err(Error::InvalidDimension(
                "synthetic decay needs at least one component".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        DecayVolume::from_fn(self.rows, self.cols, self.bins, |_, col| {
            (0..self.bins)
                .map(|bin| {
                    let value = self.model_value(col, bin);
                    let noisy = match self.noise {
                        NoiseModel::None => value,
                        NoiseModel::Relative(error) => {
                            value * (1.0 - error + rng.gen::<f64>() * 2.0 * error)
                        }
                        NoiseModel::Poisson => Poisson::new(value.max(f64::MIN_POSITIVE))
                            .map_or(value, |p| p.sample(&mut rng)),
                    };
                    f64_to_count(noisy)
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_free_power_of_two_decay_is_exact() {
        let synth = SyntheticDecay::single(2, 3, 10, 1024.0, std::f64::consts::LN_2);
        let volume = synth.generate().unwrap();
        let expected: Vec<u32> = (0..10).map(|t| 1024 >> t).collect();
        assert_eq!(volume.histogram(1, 2), expected.as_slice());
    }

    #[test]
    fn test_same_seed_same_volume() {
        let synth = SyntheticDecay::default()
            .with_noise(NoiseModel::Poisson)
            .with_seed(7);
        assert_eq!(synth.generate().unwrap(), synth.generate().unwrap());
    }

    #[test]
    fn test_rate_gradient_spans_columns() {
        let synth = SyntheticDecay::single(1, 5, 4, 100.0, 0.2).with_rate_gradient(1.0);
        assert!((synth.rate_scale(0) - 1.0).abs() < 1e-12);
        assert!((synth.rate_scale(4) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_components_rejected() {
        let mut synth = SyntheticDecay::default();
        synth.components.clear();
        assert!(synth.generate().is_err());
    }
}

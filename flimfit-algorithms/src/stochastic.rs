//! Derivative-free decay fitter based on random mutation.
//!
//! Every `iterate()` draws a small batch of Gaussian perturbations of the
//! free parameters and keeps the best one if it beats the current fit. The
//! mutation scale ("stress") grows after a success and shrinks after a
//! failure.

use flimfit_core::curve::{DecayCurve, PARAMS_PER_COMPONENT};
use flimfit_core::fitter::{CurveFitter, StepOutcome};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Stochastic search configuration.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StochasticConfig {
    /// Candidates drawn per iteration.
    pub population: usize,
    /// Relative mutation scale after a reset.
    pub initial_stress: f64,
    /// Stress never drops below this value.
    pub min_stress: f64,
    /// Stress never exceeds this value.
    pub max_stress: f64,
    /// Base seed; each cell mixes in its own index.
    pub seed: u64,
}

impl Default for StochasticConfig {
    fn default() -> Self {
        Self {
            population: 16,
            initial_stress: 0.2,
            min_stress: 1e-6,
            max_stress: 1.0,
            seed: 0x5eed,
        }
    }
}

impl StochasticConfig {
    /// Sets the number of candidates per iteration.
    #[must_use]
    pub fn with_population(mut self, population: usize) -> Self {
        self.population = population.max(1);
        self
    }

    /// Sets the base seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Random-mutation fitter.
#[derive(Clone, Debug)]
pub struct StochasticFitter {
    curve: DecayCurve,
    config: StochasticConfig,
    rng: StdRng,
    stress: f64,
}

impl StochasticFitter {
    /// Wraps a curve. `stream` selects an independent random stream, usually
    /// the cell's position in the pyramid.
    #[must_use]
    pub fn new(curve: DecayCurve, config: StochasticConfig, stream: u64) -> Self {
        let rng = StdRng::seed_from_u64(config.seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let stress = config.initial_stress;
        Self {
            curve,
            config,
            rng,
            stress,
        }
    }

    /// Current relative mutation scale.
    #[must_use]
    pub fn stress(&self) -> f64 {
        self.stress
    }

    /// Absolute mutation floor per parameter slot, so zero-valued
    /// parameters can still move.
    fn floor(&self, index: usize) -> f64 {
        let peak = self
            .curve
            .samples()
            .map(|(_, y)| y)
            .fold(1.0_f64, f64::max);
        match index % PARAMS_PER_COMPONENT {
            1 => 1e-3,
            _ => 1e-3 * peak,
        }
    }
}

impl CurveFitter for StochasticFitter {
    fn name(&self) -> &'static str {
        "Stochastic"
    }

    fn curve(&self) -> &DecayCurve {
        &self.curve
    }

    fn curve_mut(&mut self) -> &mut DecayCurve {
        &mut self.curve
    }

    fn reset_state(&mut self) {
        self.stress = self.config.initial_stress;
    }

    fn iterate(&mut self) -> StepOutcome {
        self.curve.record_iteration();
        let free = self.curve.free_indices();
        if free.is_empty() {
            return StepOutcome::Skipped;
        }

        let current = self.curve.params().to_vec();
        let floors: Vec<f64> = free.iter().map(|&i| self.floor(i)).collect();
        let mut best_chi = self.curve.chi_squared(&current);
        let mut best: Option<Vec<f64>> = None;
        let mut any_finite = false;

        for _ in 0..self.config.population {
            let mut candidate = current.clone();
            for (&index, &floor) in free.iter().zip(&floors) {
                let sigma = self.stress * (current[index].abs() + floor);
                if let Ok(normal) = Normal::new(0.0, sigma) {
                    candidate[index] += normal.sample(&mut self.rng);
                }
            }
            let chi = self.curve.chi_squared(&candidate);
            if !chi.is_finite() || candidate.iter().any(|v| !v.is_finite()) {
                continue;
            }
            any_finite = true;
            if !best_chi.is_finite() || chi < best_chi {
                best_chi = chi;
                best = Some(candidate);
            }
        }

        if let Some(params) = best {
            let result = self.curve.set_params(&params);
            debug_assert!(result.is_ok(), "candidate length mismatch: {result:?}");
            self.stress = (self.stress * 1.5).min(self.config.max_stress);
            StepOutcome::Improved
        } else {
            self.stress = (self.stress * 0.7).max(self.config.min_stress);
            if any_finite {
                StepOutcome::Rejected
            } else {
                StepOutcome::Diverged
            }
        }
    }
}

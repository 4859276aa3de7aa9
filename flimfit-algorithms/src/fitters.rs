//! Fitter selection.

use crate::lm::{LevenbergMarquardtFitter, LmConfig};
use crate::stochastic::{StochasticConfig, StochasticFitter};
use flimfit_core::curve::DecayCurve;
use flimfit_core::fitter::CurveFitter;

/// Available curve fitting algorithms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FitterKind {
    /// Damped Gauss-Newton steps.
    #[default]
    LevenbergMarquardt,
    /// Random mutation search.
    Stochastic,
}

/// Per-algorithm tuning knobs.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FitterParams {
    /// Levenberg-Marquardt settings.
    pub lm: LmConfig,
    /// Stochastic search settings.
    pub stochastic: StochasticConfig,
}

impl FitterKind {
    /// Display name of the algorithm.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            FitterKind::LevenbergMarquardt => "Levenberg-Marquardt",
            FitterKind::Stochastic => "Stochastic",
        }
    }

    /// Builds a fitter owning `curve`. `stream` identifies the cell so
    /// randomized fitters draw independent sequences.
    #[must_use]
    pub fn create(
        self,
        curve: DecayCurve,
        params: &FitterParams,
        stream: u64,
    ) -> Box<dyn CurveFitter> {
        match self {
            FitterKind::LevenbergMarquardt => {
                Box::new(LevenbergMarquardtFitter::new(curve, params.lm.clone()))
            }
            FitterKind::Stochastic => Box::new(StochasticFitter::new(
                curve,
                params.stochastic.clone(),
                stream,
            )),
        }
    }
}

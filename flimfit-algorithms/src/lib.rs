//! flimfit-algorithms: Progressive multi-resolution decay fitting.
//!
//! This crate provides:
//! - **Fitters** - Levenberg-Marquardt and stochastic search behind one trait
//! - **CurvePyramid** - count-conserving multi-resolution curve hierarchy
//! - **BurnInScheduler** - coarse-to-fine fitting state machine
//! - **ChannelSwitcher** - one scheduler per channel, one live worker
//!
#![warn(missing_docs)]

mod fitters;
mod lm;
mod pyramid;
mod scheduler;
mod stochastic;
mod switcher;

pub use fitters::{FitterKind, FitterParams};
pub use lm::{LevenbergMarquardtFitter, LmConfig};
pub use pyramid::{level_shapes, CurvePyramid, PyramidBuilder, PyramidConfig, PyramidLevel};
pub use scheduler::{
    BurnInScheduler, FitSettings, SchedulerConfig, SchedulerHandle, SchedulerPhase,
    SchedulerStatus,
};
pub use stochastic::{StochasticConfig, StochasticFitter};
pub use switcher::ChannelSwitcher;

// Re-export the core fitting contract
pub use flimfit_core::fitter::{CurveFitter, StepOutcome};

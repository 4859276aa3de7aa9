//! flimfit-core: Core types for fluorescence lifetime curve fitting.
//!
//! This crate provides histogram volumes, the decay curve model, the
//! per-cell curve fitter contract, lifetime images and synthetic data.
//!

pub mod curve;
pub mod error;
pub mod fitter;
pub mod lifetime;
pub mod progress;
pub mod synthetic;
pub mod util;
pub mod volume;

pub use curve::{DecayCurve, MAX_COMPONENTS, PARAMS_PER_COMPONENT};
pub use error::{Error, Result};
pub use fitter::{log_linear_estimate, CurveFitter, StepOutcome};
pub use lifetime::{LifetimeImage, LifetimeStats, TimeCalibration};
pub use progress::{ObserverList, ProgressEvent, ProgressObserver};
pub use synthetic::{NoiseModel, SyntheticDecay};
pub use volume::{BinWindow, DecayVolume, PixelMask};

//! Lifetime images derived from fit parameters.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::util::usize_to_f64;

/// Per-pixel lifetime values (in bins) for a full-resolution image.
///
/// Pixels without a usable fit hold `NaN`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LifetimeImage {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}

impl LifetimeImage {
    /// Creates an image filled with `NaN`.
    #[must_use]
    pub fn empty(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            values: vec![f64::NAN; rows * cols],
        }
    }

    /// Builds an image from a row-major value buffer.
    ///
    /// # Panics
    /// Panics if the buffer length is not `rows * cols`.
    #[must_use]
    pub fn from_values(rows: usize, cols: usize, values: Vec<f64>) -> Self {
        assert_eq!(values.len(), rows * cols, "lifetime buffer size mismatch");
        Self { rows, cols, values }
    }

    #[inline]
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Lifetime of one pixel.
    #[inline]
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.cols + col]
    }

    /// Row-major values.
    #[inline]
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Summary over finite values, or `None` if there are none.
    #[must_use]
    pub fn stats(&self) -> Option<LifetimeStats> {
        let finite: Vec<f64> = self.values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return None;
        }
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = finite.iter().sum::<f64>() / usize_to_f64(finite.len());
        Some(LifetimeStats {
            min,
            max,
            mean,
            pixels: finite.len(),
        })
    }

    /// Converts every value with a time calibration.
    #[must_use]
    pub fn to_picoseconds(&self, calibration: &TimeCalibration) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            values: self
                .values
                .iter()
                .map(|&v| calibration.bins_to_picos(v))
                .collect(),
        }
    }
}

/// Summary statistics of a lifetime image.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LifetimeStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Number of pixels with a finite lifetime.
    pub pixels: usize,
}

/// Mapping from time bins to physical time.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimeCalibration {
    /// Acquisition time range covered by all bins (nanoseconds).
    pub time_range_ns: f64,
    /// Number of bins spanning the range.
    pub bins: usize,
}

impl TimeCalibration {
    /// Creates a calibration.
    #[must_use]
    pub fn new(time_range_ns: f64, bins: usize) -> Self {
        Self {
            time_range_ns,
            bins,
        }
    }

    /// Width of one bin in picoseconds.
    #[must_use]
    pub fn picos_per_bin(&self) -> f64 {
        if self.bins == 0 {
            return 0.0;
        }
        self.time_range_ns * 1000.0 / usize_to_f64(self.bins)
    }

    /// Converts a duration in bins to picoseconds.
    #[must_use]
    pub fn bins_to_picos(&self, bins: f64) -> f64 {
        bins * self.picos_per_bin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_stats_skip_nan() {
        let image = LifetimeImage::from_values(1, 4, vec![1.0, f64::NAN, 3.0, 2.0]);
        let stats = image.stats().unwrap();
        assert_eq!(stats.pixels, 3);
        assert_relative_eq!(stats.mean, 2.0);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 3.0);
        assert!(LifetimeImage::empty(2, 2).stats().is_none());
    }

    #[test]
    fn test_bins_to_picos() {
        // 12.5 ns over 256 bins.
        let calibration = TimeCalibration::new(12.5, 256);
        assert_relative_eq!(calibration.picos_per_bin(), 48.828_125);
        let image = LifetimeImage::from_values(1, 1, vec![2.0]);
        assert_relative_eq!(image.to_picoseconds(&calibration).get(0, 0), 97.656_25);
    }
}

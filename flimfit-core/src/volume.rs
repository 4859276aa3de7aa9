//! Histogram volumes for time-resolved imaging data.
//!
//! A `DecayVolume` stores one photon-count histogram per pixel in a flat
//! buffer indexed by `[row, col, bin]`.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Half-open range of time bins used for fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BinWindow {
    /// First bin included in the fit.
    pub first: usize,
    /// One past the last bin included in the fit.
    pub last: usize,
}

impl BinWindow {
    /// Creates a window covering `[first, last)`.
    #[inline]
    #[must_use]
    pub fn new(first: usize, last: usize) -> Self {
        Self { first, last }
    }

    /// Window spanning every bin of a histogram.
    #[inline]
    #[must_use]
    pub fn full(bins: usize) -> Self {
        Self {
            first: 0,
            last: bins,
        }
    }

    /// Number of bins inside the window.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.last.saturating_sub(self.first)
    }

    /// Returns true if the window contains no bins.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that the window is non-empty and fits inside `bins`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidWindow`] otherwise.
    pub fn validate(&self, bins: usize) -> Result<()> {
        if self.first >= self.last || self.last > bins {
            return Err(Error::InvalidWindow {
                first: self.first,
                last: self.last,
                bins,
            });
        }
        Ok(())
    }

    /// Mean of several windows, each bound rounded toward zero.
    ///
    /// Returns `None` for an empty slice.
    #[must_use]
    pub fn mean(windows: &[BinWindow]) -> Option<Self> {
        if windows.is_empty() {
            return None;
        }
        let n = windows.len();
        let first = windows.iter().map(|w| w.first).sum::<usize>() / n;
        let last = windows.iter().map(|w| w.last).sum::<usize>() / n;
        Some(Self { first, last })
    }
}

/// Photon-count histograms for every pixel of one spectral channel.
///
/// Data is stored row-major: `counts[(row * cols + col) * bins + bin]`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DecayVolume {
    rows: usize,
    cols: usize,
    bins: usize,
    counts: Vec<u32>,
}

impl DecayVolume {
    /// Wraps a flat count buffer.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] if any axis is zero or the buffer
    /// length differs from `rows * cols * bins`.
    pub fn new(rows: usize, cols: usize, bins: usize, counts: Vec<u32>) -> Result<Self> {
        if rows == 0 || cols == 0 || bins == 0 {
            return Err(Error::InvalidDimension(format!(
                "volume axes must be positive, got {rows}x{cols}x{bins}"
            )));
        }
        let expected = rows * cols * bins;
        if counts.len() != expected {
            return Err(Error::InvalidDimension(format!(
                "expected {expected} counts for {rows}x{cols}x{bins}, got {}",
                counts.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            bins,
            counts,
        })
    }

    /// Creates an all-zero volume.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] if any axis is zero.
    pub fn zeros(rows: usize, cols: usize, bins: usize) -> Result<Self> {
        Self::new(rows, cols, bins, vec![0; rows * cols * bins])
    }

    /// Builds a volume by calling `f(row, col)` for each pixel's histogram.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] if any axis is zero or a histogram
    /// has the wrong length.
    pub fn from_fn<F>(rows: usize, cols: usize, bins: usize, mut f: F) -> Result<Self>
    where
        F: FnMut(usize, usize) -> Vec<u32>,
    {
        let mut counts = Vec::with_capacity(rows * cols * bins);
        for row in 0..rows {
            for col in 0..cols {
                let histogram = f(row, col);
                if histogram.len() != bins {
                    return Err(Error::InvalidDimension(format!(
                        "histogram at ({row}, {col}) has {} bins, expected {bins}",
                        histogram.len()
                    )));
                }
                counts.extend_from_slice(&histogram);
            }
        }
        Self::new(rows, cols, bins, counts)
    }

    /// Number of pixel rows.
    #[inline]
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of pixel columns.
    #[inline]
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of time bins per histogram.
    #[inline]
    #[must_use]
    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Histogram of a single pixel.
    ///
    /// # Panics
    /// Panics if the pixel lies outside the volume.
    #[inline]
    #[must_use]
    pub fn histogram(&self, row: usize, col: usize) -> &[u32] {
        assert!(row < self.rows && col < self.cols, "pixel out of range");
        let start = (row * self.cols + col) * self.bins;
        &self.counts[start..start + self.bins]
    }

    /// Raw count buffer.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.counts
    }

    /// Sum of every count in the volume.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }

    /// Summed decay over all pixels (or the pixels selected by `mask`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] if the mask shape does not match.
    pub fn summed_histogram(&self, mask: Option<&PixelMask>) -> Result<Vec<u64>> {
        if let Some(mask) = mask {
            mask.check_shape(self.rows, self.cols)?;
        }
        let mut sum = vec![0u64; self.bins];
        for row in 0..self.rows {
            for col in 0..self.cols {
                if mask.is_some_and(|m| !m.get(row, col)) {
                    continue;
                }
                for (acc, &c) in sum.iter_mut().zip(self.histogram(row, col)) {
                    *acc += u64::from(c);
                }
            }
        }
        Ok(sum)
    }
}

/// Full-resolution boolean region-of-interest mask.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PixelMask {
    rows: usize,
    cols: usize,
    bits: Vec<bool>,
}

impl PixelMask {
    /// Wraps a row-major flag buffer.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] if the buffer does not hold
    /// `rows * cols` flags.
    pub fn new(rows: usize, cols: usize, bits: Vec<bool>) -> Result<Self> {
        if rows == 0 || cols == 0 || bits.len() != rows * cols {
            return Err(Error::InvalidDimension(format!(
                "mask of {} flags cannot cover {rows}x{cols}",
                bits.len()
            )));
        }
        Ok(Self { rows, cols, bits })
    }

    /// Mask with every pixel set to `value`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] if either axis is zero.
    pub fn filled(rows: usize, cols: usize, value: bool) -> Result<Self> {
        Self::new(rows, cols, vec![value; rows * cols])
    }

    /// Mask selecting the rectangle `[row0, row1) x [col0, col1)`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] if either axis is zero.
    pub fn rectangle(
        rows: usize,
        cols: usize,
        row_range: std::ops::Range<usize>,
        col_range: std::ops::Range<usize>,
    ) -> Result<Self> {
        let mut mask = Self::filled(rows, cols, false)?;
        for row in row_range.start..row_range.end.min(rows) {
            for col in col_range.start..col_range.end.min(cols) {
                mask.set(row, col, true);
            }
        }
        Ok(mask)
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

    /// Flag for one pixel.
    #[inline]
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> bool {
        self.bits[row * self.cols + col]
    }

    /// Sets the flag for one pixel.
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: bool) {
        self.bits[row * self.cols + col] = value;
    }

    /// Number of selected pixels.
    #[must_use]
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Checks the mask covers exactly a `rows x cols` image.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] on mismatch.
    pub fn check_shape(&self, rows: usize, cols: usize) -> Result<()> {
        if self.rows != rows || self.cols != cols {
            return Err(Error::InvalidDimension(format!(
                "mask is {}x{}, image is {rows}x{cols}",
                self.rows, self.cols
            )));
        }
        Ok(())
    }
}

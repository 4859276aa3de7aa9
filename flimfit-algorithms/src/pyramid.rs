//! Multi-resolution pyramid of decay curves.
//!
//! Level 0 holds one curve per (optionally pre-binned) pixel. Every coarser
//! level halves both axes, rounding up, until a single cell remains. A
//! coarse cell is the bin-wise sum of the up to four finer cells it covers,
//! so each level holds exactly the photons of level 0.

use crate::fitters::{FitterKind, FitterParams};
use flimfit_core::curve::{validate_component_count, DecayCurve};
use flimfit_core::error::{Error, Result};
use flimfit_core::fitter::CurveFitter;
use flimfit_core::progress::{ObserverList, ProgressEvent, ProgressObserver};
use flimfit_core::volume::{BinWindow, DecayVolume};
use rayon::prelude::*;

const PROGRESS_SOURCE: &str = "CurvePyramid";

/// Pyramid construction settings.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PyramidConfig {
    /// Half-width of the square pre-binning neighborhood (0 disables it).
    pub bin_radius: usize,
    /// Fit window applied to every level-0 curve; `None` uses all bins.
    pub window: Option<BinWindow>,
    /// Exponential components per curve.
    pub components: usize,
    /// Optimizer created for every cell.
    pub fitter: FitterKind,
    /// Optimizer tuning.
    pub fitter_params: FitterParams,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            bin_radius: 0,
            window: None,
            components: 1,
            fitter: FitterKind::default(),
            fitter_params: FitterParams::default(),
        }
    }
}

impl PyramidConfig {
    /// Sets the pre-binning radius.
    #[must_use]
    pub fn with_bin_radius(mut self, radius: usize) -> Self {
        self.bin_radius = radius;
        self
    }

    /// Sets the fit window.
    #[must_use]
    pub fn with_window(mut self, window: BinWindow) -> Self {
        self.window = Some(window);
        self
    }

    /// Sets the component count.
    #[must_use]
    pub fn with_components(mut self, components: usize) -> Self {
        self.components = components;
        self
    }

    /// Selects the optimizer.
    #[must_use]
    pub fn with_fitter(mut self, fitter: FitterKind) -> Self {
        self.fitter = fitter;
        self
    }

    /// Sets optimizer tuning.
    #[must_use]
    pub fn with_fitter_params(mut self, params: FitterParams) -> Self {
        self.fitter_params = params;
        self
    }
}

/// One grid of fitted cells.
pub struct PyramidLevel {
    rows: usize,
    cols: usize,
    cells: Vec<Box<dyn CurveFitter>>,
}

impl PyramidLevel {
    /// Rows in this level.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Columns in this level.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Always false: levels hold at least one cell.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Row-major index of a cell.
    #[inline]
    #[must_use]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    /// Row and column of a row-major index.
    #[inline]
    #[must_use]
    pub fn coords(&self, index: usize) -> (usize, usize) {
        (index / self.cols, index % self.cols)
    }

    /// Cell at (`row`, `col`).
    #[must_use]
    pub fn cell(&self, row: usize, col: usize) -> &dyn CurveFitter {
        self.cells[self.index(row, col)].as_ref()
    }

    /// Mutable cell at (`row`, `col`).
    pub fn cell_mut(&mut self, row: usize, col: usize) -> &mut dyn CurveFitter {
        let index = self.index(row, col);
        self.cells[index].as_mut()
    }

    /// Cell by row-major index.
    #[must_use]
    pub fn cell_at(&self, index: usize) -> &dyn CurveFitter {
        self.cells[index].as_ref()
    }

    /// Mutable cell by row-major index.
    pub fn cell_at_mut(&mut self, index: usize) -> &mut dyn CurveFitter {
        self.cells[index].as_mut()
    }

    /// All cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = &dyn CurveFitter> + '_ {
        self.cells.iter().map(AsRef::as_ref)
    }

    /// Sum of every count in this level.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.cells
            .iter()
            .map(|c| c.curve().counts().iter().sum::<u64>())
            .sum()
    }
}

impl std::fmt::Debug for PyramidLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidLevel")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish_non_exhaustive()
    }
}

/// Decay curves of one channel at every resolution.
#[derive(Debug)]
pub struct CurvePyramid {
    bins: usize,
    levels: Vec<PyramidLevel>,
}

impl CurvePyramid {
    /// Builds a pyramid without progress observers.
    ///
    /// # Errors
    /// See [`PyramidBuilder::build`].
    pub fn build(volume: &DecayVolume, config: PyramidConfig) -> Result<Self> {
        PyramidBuilder::new(config).build(volume)
    }

    /// Index of the coarsest level (0 for a 1x1 image).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Time bins per curve.
    #[must_use]
    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Full-resolution rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.levels[0].rows
    }

    /// Full-resolution columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.levels[0].cols
    }

    /// Level `depth` (0 = full resolution).
    ///
    /// # Panics
    /// Panics if `depth` exceeds [`CurvePyramid::depth`].
    #[must_use]
    pub fn level(&self, depth: usize) -> &PyramidLevel {
        &self.levels[depth]
    }

    /// Mutable level `depth`.
    ///
    /// # Panics
    /// Panics if `depth` exceeds [`CurvePyramid::depth`].
    pub fn level_mut(&mut self, depth: usize) -> &mut PyramidLevel {
        &mut self.levels[depth]
    }

    /// All levels, finest first.
    #[must_use]
    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    /// Cell covering full-resolution pixel (`row`, `col`) at `depth`.
    #[must_use]
    pub fn cell_for_pixel(&self, depth: usize, row: usize, col: usize) -> &dyn CurveFitter {
        self.levels[depth].cell(row >> depth, col >> depth)
    }

    /// Component count shared by every cell.
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.levels[0].cells[0].curve().component_count()
    }

    /// Parameter vector length shared by every cell.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.levels[0].cells[0].params().len()
    }

    /// Applies a fixed-parameter mask to every cell.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFixedMask`] if the mask length is wrong; no
    /// cell is modified in that case.
    pub fn set_fixed(&mut self, fixed: &[bool]) -> Result<()> {
        let expected = self.param_count();
        if fixed.len() != expected {
            return Err(Error::InvalidFixedMask {
                expected,
                actual: fixed.len(),
            });
        }
        for cell in self.levels.iter_mut().flat_map(|l| l.cells.iter_mut()) {
            cell.set_fixed(fixed)?;
        }
        Ok(())
    }

    /// Changes the component count of every cell. Parameters are cleared.
    ///
    /// # Errors
    /// Returns [`Error::InvalidComponentCount`] for unsupported counts.
    pub fn set_component_count(&mut self, components: usize) -> Result<()> {
        validate_component_count(components)?;
        for cell in self.levels.iter_mut().flat_map(|l| l.cells.iter_mut()) {
            cell.set_component_count(components)?;
        }
        Ok(())
    }
}

/// Builds [`CurvePyramid`]s and reports progress to registered observers.
#[derive(Debug)]
pub struct PyramidBuilder {
    config: PyramidConfig,
    observers: ObserverList,
}

impl PyramidBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(config: PyramidConfig) -> Self {
        Self {
            config,
            observers: ObserverList::new(),
        }
    }

    /// Registers an observer for construction progress.
    pub fn register_observer(&mut self, observer: Box<dyn ProgressObserver>) {
        self.observers.register(observer);
    }

    /// Builds the pyramid for one channel.
    ///
    /// Progress events are emitted synchronously: one per coarse cell, with
    /// `max` equal to the number of cells above level 0, plus one event per
    /// finished level carrying a message.
    ///
    /// # Errors
    /// Returns an error if the component count is unsupported or the window
    /// does not fit the volume's bins.
    pub fn build(&mut self, volume: &DecayVolume) -> Result<CurvePyramid> {
        validate_component_count(self.config.components)?;
        let bins = volume.bins();
        let window = self.config.window.unwrap_or_else(|| BinWindow::full(bins));
        window.validate(bins)?;

        let (mut rows, mut cols) = (volume.rows(), volume.cols());
        let base = prebin(volume, self.config.bin_radius);
        let mut grids = vec![Grid {
            rows,
            cols,
            curves: base.into_iter().map(|counts| (counts, window)).collect(),
        }];

        let shapes = level_shapes(rows, cols);
        let max: usize = shapes.iter().skip(1).map(|(r, c)| r * c).sum();
        let mut done = 0usize;

        while rows > 1 || cols > 1 {
            let Some(finer) = grids.last() else { break };
            let next = finer.halve();
            for _ in 0..next.curves.len() {
                done += 1;
                self.observers
                    .emit(&ProgressEvent::new(PROGRESS_SOURCE, done, max));
            }
            log::debug!(
                "pyramid level {}: {}x{} cells",
                grids.len(),
                next.rows,
                next.cols
            );
            self.observers.emit(
                &ProgressEvent::new(PROGRESS_SOURCE, done, max).with_message(format!(
                    "level {} built ({}x{})",
                    grids.len(),
                    next.rows,
                    next.cols
                )),
            );
            rows = next.rows;
            cols = next.cols;
            grids.push(next);
        }

        let kind = self.config.fitter;
        let params = &self.config.fitter_params;
        let components = self.config.components;
        let mut stream = 0u64;
        let mut levels = Vec::with_capacity(grids.len());
        for grid in grids {
            let mut cells = Vec::with_capacity(grid.curves.len());
            for (counts, window) in grid.curves {
                let curve = DecayCurve::new(counts, window, components)?;
                cells.push(kind.create(curve, params, stream));
                stream += 1;
            }
            levels.push(PyramidLevel {
                rows: grid.rows,
                cols: grid.cols,
                cells,
            });
        }

        Ok(CurvePyramid { bins, levels })
    }
}

/// Shapes of every level for an `rows x cols` image, finest first.
#[must_use]
pub fn level_shapes(rows: usize, cols: usize) -> Vec<(usize, usize)> {
    let mut shapes = vec![(rows, cols)];
    let (mut r, mut c) = (rows, cols);
    while r > 1 || c > 1 {
        r = r.div_ceil(2);
        c = c.div_ceil(2);
        shapes.push((r, c));
    }
    shapes
}

/// Raw counts and windows of one level before fitters are attached.
struct Grid {
    rows: usize,
    cols: usize,
    curves: Vec<(Vec<u64>, BinWindow)>,
}

impl Grid {
    fn halve(&self) -> Grid {
        let rows = self.rows.div_ceil(2);
        let cols = self.cols.div_ceil(2);
        let curves = (0..rows * cols)
            .into_par_iter()
            .map(|index| {
                let (row, col) = (index / cols, index % cols);
                let mut counts: Vec<u64> = Vec::new();
                let mut windows = Vec::with_capacity(4);
                for r in (2 * row)..(2 * row + 2).min(self.rows) {
                    for c in (2 * col)..(2 * col + 2).min(self.cols) {
                        let (child, window) = &self.curves[r * self.cols + c];
                        if counts.is_empty() {
                            counts.clone_from(child);
                        } else {
                            for (acc, &v) in counts.iter_mut().zip(child) {
                                *acc += v;
                            }
                        }
                        windows.push(*window);
                    }
                }
                let window =
                    BinWindow::mean(&windows).unwrap_or_else(|| BinWindow::full(counts.len()));
                (counts, window)
            })
            .collect();
        Grid { rows, cols, curves }
    }
}

/// Sums each pixel's histogram over its `(2r+1)^2` neighborhood, clamped at
/// the image edges.
fn prebin(volume: &DecayVolume, radius: usize) -> Vec<Vec<u64>> {
    let (rows, cols) = (volume.rows(), volume.cols());
    (0..rows * cols)
        .into_par_iter()
        .map(|index| {
            let (row, col) = (index / cols, index % cols);
            let mut sum = vec![0u64; volume.bins()];
            let row_range = row.saturating_sub(radius)..=(row + radius).min(rows - 1);
            for r in row_range {
                let col_range = col.saturating_sub(radius)..=(col + radius).min(cols - 1);
                for c in col_range {
                    for (acc, &v) in sum.iter_mut().zip(volume.histogram(r, c)) {
                        *acc += u64::from(v);
                    }
                }
            }
            sum
        })
        .collect()
}

//! Coarse-to-fine burn-in scheduler.
//!
//! The scheduler owns one channel's [`CurvePyramid`] and refines it on a
//! single worker thread:
//!
//! 1. **Initial pass**: the coarsest level is estimated from scratch and
//!    iterated until each cell meets the error threshold or its budget.
//! 2. **Estimating**: each finer level starts from its parent's parameters
//!    and is iterated the same way, down to full resolution.
//! 3. **Burned in**: full-resolution cells inside the ROI are swept
//!    repeatedly, one iteration per eligible cell per sweep.
//!
//! Counters and the lifetime image are published through a
//! [`SchedulerHandle`] so other threads can observe progress without
//! touching the pyramid.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::pyramid::CurvePyramid;
use flimfit_core::curve::{validate_component_count, DecayCurve, PARAMS_PER_COMPONENT};
use flimfit_core::error::{Error, Result};
use flimfit_core::lifetime::LifetimeImage;
use flimfit_core::util::usize_to_f64;
use flimfit_core::volume::PixelMask;

/// Total error changes at or below this count as a stalled sweep.
const STALL_EPSILON: f64 = 1e-9;

/// Iteration and error budgets.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FitSettings {
    /// Per-cell iteration budget.
    pub max_iterations: u32,
    /// Reduced chi-squared error considered converged.
    pub max_rcse: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_rcse: 1.0,
        }
    }
}

impl FitSettings {
    /// Sets the per-cell iteration budget.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the convergence threshold.
    #[must_use]
    pub fn with_max_rcse(mut self, max_rcse: f64) -> Self {
        self.max_rcse = max_rcse;
        self
    }
}

/// Scheduler configuration.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerConfig {
    /// Budgets applied to every cell.
    pub settings: FitSettings,
    /// Minimum time between lifetime snapshots while running.
    pub publish_interval: Duration,
    /// Pause after a sweep that found nothing to do.
    pub idle_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            settings: FitSettings::default(),
            publish_interval: Duration::from_millis(100),
            idle_backoff: Duration::from_millis(5),
        }
    }
}

impl SchedulerConfig {
    /// Sets the budgets.
    #[must_use]
    pub fn with_settings(mut self, settings: FitSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the snapshot cadence.
    #[must_use]
    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    /// Sets the idle pause.
    #[must_use]
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }
}

/// Scheduler state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SchedulerPhase {
    /// Fitting the coarsest level from scratch.
    InitialPass,
    /// Seeding and fitting progressively finer levels.
    Estimating,
    /// Sweeping full resolution.
    BurnedIn,
    /// Not running.
    Stopped,
}

impl SchedulerPhase {
    fn to_u8(self) -> u8 {
        match self {
            SchedulerPhase::InitialPass => 0,
            SchedulerPhase::Estimating => 1,
            SchedulerPhase::BurnedIn => 2,
            SchedulerPhase::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerPhase::InitialPass,
            1 => SchedulerPhase::Estimating,
            2 => SchedulerPhase::BurnedIn,
            _ => SchedulerPhase::Stopped,
        }
    }
}

/// Model and ROI changes waiting for the next safe point.
#[derive(Debug, Default)]
struct PendingChanges {
    mask: Option<Option<PixelMask>>,
    components: Option<usize>,
    fixed: Option<Vec<bool>>,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        self.mask.is_none() && self.components.is_none() && self.fixed.is_none()
    }
}

/// State shared between the worker and observers.
#[derive(Debug)]
struct SharedState {
    rows: usize,
    cols: usize,
    alive: AtomicBool,
    phase: AtomicU8,
    total_iterations: AtomicU64,
    progress: AtomicUsize,
    max_progress: AtomicUsize,
    subsample_level: AtomicUsize,
    stall_count: AtomicU64,
    total_rcse: AtomicU64,
    worst_rcse: AtomicU64,
    max_iterations: AtomicU32,
    max_rcse: AtomicU64,
    components: AtomicUsize,
    has_pending: AtomicBool,
    pending: Mutex<PendingChanges>,
    lifetimes: Mutex<Arc<LifetimeImage>>,
}

impl SharedState {
    fn load_f64(cell: &AtomicU64) -> f64 {
        f64::from_bits(cell.load(Ordering::Relaxed))
    }

    fn store_f64(cell: &AtomicU64, value: f64) {
        cell.store(value.to_bits(), Ordering::Relaxed);
    }

    fn pending(&self) -> MutexGuard<'_, PendingChanges> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, update: impl FnOnce(&mut PendingChanges)) {
        let mut pending = self.pending();
        update(&mut pending);
        self.has_pending.store(true, Ordering::Release);
    }

    fn settings(&self) -> FitSettings {
        FitSettings {
            max_iterations: self.max_iterations.load(Ordering::Relaxed),
            max_rcse: Self::load_f64(&self.max_rcse),
        }
    }
}

/// Point-in-time copy of the scheduler counters.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerStatus {
    /// Current phase.
    pub phase: SchedulerPhase,
    /// Cells completed in the current level or sweep.
    pub progress: usize,
    /// Cells in the current level or sweep.
    pub max_progress: usize,
    /// Halvings between the level being fitted and full resolution.
    pub subsample_level: usize,
    /// Iterations executed since construction.
    pub total_iterations: u64,
    /// Sum of reduced errors over the last completed level or sweep.
    pub total_rcse: f64,
    /// Largest reduced error of the last completed level or sweep.
    pub worst_rcse: f64,
    /// Consecutive sweeps without improvement.
    pub stall_count: u64,
}

impl SchedulerStatus {
    /// Progress in percent.
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.max_progress == 0 {
            return 100.0;
        }
        100.0 * usize_to_f64(self.progress) / usize_to_f64(self.max_progress)
    }
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            SchedulerPhase::InitialPass => write!(f, "Initial pass: {:.0}%", self.percent()),
            SchedulerPhase::Estimating => {
                let steps = self.subsample_level;
                let plural = if steps == 1 { "" } else { "s" };
                write!(f, "Estimating; {steps} step{plural} until total burn-in")
            }
            SchedulerPhase::BurnedIn | SchedulerPhase::Stopped => {
                if self.phase == SchedulerPhase::Stopped {
                    write!(f, "Stopped; ")?;
                }
                write!(
                    f,
                    "Iter. #{}: worst={:.4}: total={:.4}; stalled={}",
                    self.total_iterations, self.worst_rcse, self.total_rcse, self.stall_count
                )
            }
        }
    }
}

/// Thread-safe view and control surface of a [`BurnInScheduler`].
///
/// Settings changes are validated immediately. Budgets take effect on the
/// next cell check; mask and model changes are queued and applied by the
/// worker at the next safe point.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    shared: Arc<SharedState>,
}

impl SchedulerHandle {
    /// Asks the worker to stop after its current step.
    pub fn stop(&self) {
        self.shared.alive.store(false, Ordering::Release);
    }

    pub(crate) fn arm(&self) {
        self.shared.alive.store(true, Ordering::Release);
    }

    /// Returns true while the worker is allowed to run.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SchedulerPhase {
        SchedulerPhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Iterations executed since construction.
    #[must_use]
    pub fn total_iterations(&self) -> u64 {
        self.shared.total_iterations.load(Ordering::Acquire)
    }

    /// `(current, maximum)` progress counters.
    #[must_use]
    pub fn progress(&self) -> (usize, usize) {
        (
            self.shared.progress.load(Ordering::Relaxed),
            self.shared.max_progress.load(Ordering::Relaxed),
        )
    }

    /// Halvings remaining to full resolution.
    #[must_use]
    pub fn subsample_level(&self) -> usize {
        self.shared.subsample_level.load(Ordering::Relaxed)
    }

    /// Consecutive sweeps without improvement.
    #[must_use]
    pub fn stall_count(&self) -> u64 {
        self.shared.stall_count.load(Ordering::Relaxed)
    }

    /// Sum of reduced errors over the last completed level or sweep.
    #[must_use]
    pub fn total_rcse(&self) -> f64 {
        SharedState::load_f64(&self.shared.total_rcse)
    }

    /// Largest reduced error of the last completed level or sweep.
    #[must_use]
    pub fn worst_rcse(&self) -> f64 {
        SharedState::load_f64(&self.shared.worst_rcse)
    }

    /// All counters at once.
    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        let (progress, max_progress) = self.progress();
        SchedulerStatus {
            phase: self.phase(),
            progress,
            max_progress,
            subsample_level: self.subsample_level(),
            total_iterations: self.total_iterations(),
            total_rcse: self.total_rcse(),
            worst_rcse: self.worst_rcse(),
            stall_count: self.stall_count(),
        }
    }

    /// Latest published lifetime image (in bins).
    #[must_use]
    pub fn lifetimes(&self) -> Arc<LifetimeImage> {
        let guard = self
            .shared
            .lifetimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Current budgets.
    #[must_use]
    pub fn settings(&self) -> FitSettings {
        self.shared.settings()
    }

    /// Sets the per-cell iteration budget.
    pub fn set_max_iterations(&self, max_iterations: u32) {
        self.shared
            .max_iterations
            .store(max_iterations, Ordering::Relaxed);
    }

    /// Sets the convergence threshold.
    pub fn set_max_rcse(&self, max_rcse: f64) {
        SharedState::store_f64(&self.shared.max_rcse, max_rcse);
    }

    /// Component count the model is (or will be) using.
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.shared.components.load(Ordering::Acquire)
    }

    /// Checks an ROI mask against the image shape.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] on a shape mismatch.
    pub fn validate_mask(&self, mask: Option<&PixelMask>) -> Result<()> {
        match mask {
            Some(mask) => mask.check_shape(self.shared.rows, self.shared.cols),
            None => Ok(()),
        }
    }

    /// Checks a fixed mask against the current parameter count.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFixedMask`] on a length mismatch.
    pub fn validate_fixed(&self, fixed: &[bool]) -> Result<()> {
        let expected = self.component_count() * PARAMS_PER_COMPONENT;
        if fixed.len() != expected {
            return Err(Error::InvalidFixedMask {
                expected,
                actual: fixed.len(),
            });
        }
        Ok(())
    }

    /// Queues an ROI mask; `None` re-enables the whole image.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] on a shape mismatch.
    pub fn set_mask(&self, mask: Option<PixelMask>) -> Result<()> {
        self.validate_mask(mask.as_ref())?;
        self.shared.queue(|pending| pending.mask = Some(mask));
        Ok(())
    }

    /// Queues a component count change, which restarts the burn-in.
    ///
    /// # Errors
    /// Returns [`Error::InvalidComponentCount`] for unsupported counts.
    pub fn set_component_count(&self, components: usize) -> Result<()> {
        validate_component_count(components)?;
        self.shared.queue(|pending| {
            self.shared.components.store(components, Ordering::Release);
            pending.components = Some(components);
            // A queued mask sized for the old model no longer applies.
            pending.fixed = None;
        });
        Ok(())
    }

    /// Queues a fixed-parameter mask.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFixedMask`] on a length mismatch.
    pub fn set_fixed(&self, fixed: &[bool]) -> Result<()> {
        let mut result = Ok(());
        self.shared.queue(|pending| {
            result = self.validate_fixed(fixed);
            if result.is_ok() {
                pending.fixed = Some(fixed.to_vec());
            }
        });
        result
    }
}

/// Drives progressive fitting of one channel.
pub struct BurnInScheduler {
    pyramid: CurvePyramid,
    config: SchedulerConfig,
    shared: Arc<SharedState>,
    mask: Option<PixelMask>,
    phase: SchedulerPhase,
    depth: usize,
    cursor: usize,
    visited: usize,
    pass_total: f64,
    pass_worst: f64,
    pass_worked: bool,
    previous_total: Option<f64>,
    idle: bool,
    last_publish: Instant,
}

impl BurnInScheduler {
    /// Wraps a pyramid and estimates its coarsest level.
    #[must_use]
    pub fn new(pyramid: CurvePyramid, config: SchedulerConfig) -> Self {
        let shared = Arc::new(SharedState {
            rows: pyramid.rows(),
            cols: pyramid.cols(),
            alive: AtomicBool::new(false),
            phase: AtomicU8::new(SchedulerPhase::Stopped.to_u8()),
            total_iterations: AtomicU64::new(0),
            progress: AtomicUsize::new(0),
            max_progress: AtomicUsize::new(0),
            subsample_level: AtomicUsize::new(pyramid.depth()),
            stall_count: AtomicU64::new(0),
            total_rcse: AtomicU64::new(f64::NAN.to_bits()),
            worst_rcse: AtomicU64::new(f64::NAN.to_bits()),
            max_iterations: AtomicU32::new(config.settings.max_iterations),
            max_rcse: AtomicU64::new(config.settings.max_rcse.to_bits()),
            components: AtomicUsize::new(pyramid.component_count()),
            has_pending: AtomicBool::new(false),
            pending: Mutex::new(PendingChanges::default()),
            lifetimes: Mutex::new(Arc::new(LifetimeImage::empty(
                pyramid.rows(),
                pyramid.cols(),
            ))),
        });
        let mut scheduler = Self {
            depth: pyramid.depth(),
            pyramid,
            config,
            shared,
            mask: None,
            phase: SchedulerPhase::InitialPass,
            cursor: 0,
            visited: 0,
            pass_total: 0.0,
            pass_worst: 0.0,
            pass_worked: false,
            previous_total: None,
            idle: false,
            last_publish: Instant::now(),
        };
        scheduler.restart();
        scheduler
    }

    /// Control and observation handle for other threads.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The pyramid being fitted.
    #[must_use]
    pub fn pyramid(&self) -> &CurvePyramid {
        &self.pyramid
    }

    /// Current phase of the worker state machine (never `Stopped`).
    #[must_use]
    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    /// Level currently being fitted.
    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth
    }

    /// Active ROI mask.
    #[must_use]
    pub fn mask(&self) -> Option<&PixelMask> {
        self.mask.as_ref()
    }

    /// Iterations executed since construction.
    #[must_use]
    pub fn total_iterations(&self) -> u64 {
        self.shared.total_iterations.load(Ordering::Acquire)
    }

    /// Sets the per-cell iteration budget.
    pub fn set_max_iterations(&mut self, max_iterations: u32) {
        self.handle().set_max_iterations(max_iterations);
    }

    /// Sets the convergence threshold.
    pub fn set_max_rcse(&mut self, max_rcse: f64) {
        self.handle().set_max_rcse(max_rcse);
    }

    /// Restricts full-resolution iteration to `mask`; `None` re-enables the
    /// whole image. Existing fits are kept.
    ///
    /// # Errors
    /// Returns [`Error::InvalidDimension`] on a shape mismatch.
    pub fn set_mask(&mut self, mask: Option<PixelMask>) -> Result<()> {
        self.handle().set_mask(mask)?;
        self.apply_pending(true);
        Ok(())
    }

    /// Changes the component count and restarts from the initial pass.
    ///
    /// # Errors
    /// Returns [`Error::InvalidComponentCount`] for unsupported counts.
    pub fn set_component_count(&mut self, components: usize) -> Result<()> {
        self.handle().set_component_count(components)?;
        self.apply_pending(true);
        Ok(())
    }

    /// Holds the flagged parameters constant in every cell.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFixedMask`] on a length mismatch.
    pub fn set_fixed(&mut self, fixed: &[bool]) -> Result<()> {
        self.handle().set_fixed(fixed)?;
        self.apply_pending(true);
        Ok(())
    }

    /// Asks a running worker to stop.
    pub fn stop(&self) {
        self.handle().stop();
    }

    /// Runs until [`SchedulerHandle::stop`] is called.
    ///
    /// Resumes exactly where a previous run stopped.
    pub fn run(&mut self) {
        self.shared.alive.store(true, Ordering::Release);
        self.run_armed();
    }

    /// Runs only if already armed; a stop issued before this call wins.
    pub(crate) fn run_armed(&mut self) {
        if !self.shared.alive.load(Ordering::Acquire) {
            return;
        }
        log::debug!("scheduler resuming in {:?} at depth {}", self.phase, self.depth);
        self.publish_phase();
        self.last_publish = Instant::now();

        while self.shared.alive.load(Ordering::Acquire) {
            self.step();
            if self.idle {
                self.idle = false;
                thread::sleep(self.config.idle_backoff);
            }
            if self.last_publish.elapsed() >= self.config.publish_interval {
                self.publish_lifetimes();
            }
        }

        self.publish_lifetimes();
        self.shared
            .phase
            .store(SchedulerPhase::Stopped.to_u8(), Ordering::Release);
        log::debug!(
            "scheduler stopped after {} iterations",
            self.total_iterations()
        );
    }

    /// Performs one unit of work: at most one `iterate()` call.
    ///
    /// Returns true if a cell was iterated.
    pub fn step(&mut self) -> bool {
        self.apply_pending(false);
        match self.phase {
            SchedulerPhase::BurnedIn => self.step_sweep(),
            _ => self.step_level(),
        }
    }

    /// Best-fit parameters currently backing a full-resolution pixel.
    #[must_use]
    pub fn pixel_params(&self, row: usize, col: usize) -> &[f64] {
        self.pixel_curve(row, col).params()
    }

    /// Curve currently backing a full-resolution pixel. Before burn-in this
    /// may be a coarser cell.
    #[must_use]
    pub fn pixel_curve(&self, row: usize, col: usize) -> &DecayCurve {
        let depth = self.backing_depth(row, col);
        self.pyramid.cell_for_pixel(depth, row, col).curve()
    }

    /// Lifetime image computed from the current backing cells.
    #[must_use]
    pub fn lifetimes(&self) -> LifetimeImage {
        let (rows, cols) = (self.pyramid.rows(), self.pyramid.cols());
        let mut values = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                values.push(self.pixel_curve(row, col).lifetime());
            }
        }
        LifetimeImage::from_values(rows, cols, values)
    }

    /// Depth whose fit currently represents pixel (`row`, `col`).
    ///
    /// Cells already visited at the working depth back their pixels; the
    /// rest are still represented by their parents.
    fn backing_depth(&self, row: usize, col: usize) -> usize {
        if self.phase == SchedulerPhase::BurnedIn {
            return 0;
        }
        let level = self.pyramid.level(self.depth);
        let index = level.index(row >> self.depth, col >> self.depth);
        if index < self.cursor || self.depth == self.pyramid.depth() {
            self.depth
        } else {
            self.depth + 1
        }
    }

    fn is_active(&self, row: usize, col: usize) -> bool {
        self.mask.as_ref().map_or(true, |m| m.get(row, col))
    }

    /// Level passes iterate a cell until it converges or runs out of budget.
    fn needs_work_in_level(&self, rcse: f64, iterations: u32) -> bool {
        let settings = self.shared.settings();
        (rcse.is_nan() || rcse >= settings.max_rcse) && iterations < settings.max_iterations
    }

    /// Sweeps keep iterating cells that are unconverged or under budget.
    fn needs_work_in_sweep(&self, rcse: f64, iterations: u32) -> bool {
        let settings = self.shared.settings();
        rcse.is_nan() || rcse > settings.max_rcse || iterations < settings.max_iterations
    }

    fn count_iteration(&self) {
        self.shared.total_iterations.fetch_add(1, Ordering::AcqRel);
    }

    fn accumulate(&mut self, rcse: f64) {
        self.pass_total += rcse;
        if rcse.is_nan() || rcse > self.pass_worst {
            self.pass_worst = rcse;
        }
    }

    fn step_level(&mut self) -> bool {
        let depth = self.depth;
        let len = self.pyramid.level(depth).len();
        if self.cursor >= len {
            self.finish_level();
            return false;
        }

        let index = self.cursor;
        let (row, col) = self.pyramid.level(depth).coords(index);
        let active = depth > 0 || self.is_active(row, col);
        let (rcse, iterations) = cell_state(&self.pyramid, depth, index);
        if active && self.needs_work_in_level(rcse, iterations) {
            self.pyramid.level_mut(depth).cell_at_mut(index).iterate();
            self.count_iteration();
            return true;
        }

        if active {
            self.accumulate(rcse);
        }
        self.cursor += 1;
        self.shared.progress.store(self.cursor, Ordering::Relaxed);
        false
    }

    fn finish_level(&mut self) {
        self.publish_pass_errors();
        if self.depth == 0 {
            log::info!(
                "burn-in complete after {} iterations",
                self.total_iterations()
            );
            self.phase = SchedulerPhase::BurnedIn;
            self.begin_sweep();
        } else {
            self.seed_children();
            self.depth -= 1;
            self.phase = SchedulerPhase::Estimating;
            self.cursor = 0;
            self.shared
                .subsample_level
                .store(self.depth, Ordering::Relaxed);
            self.shared.progress.store(0, Ordering::Relaxed);
            self.shared
                .max_progress
                .store(self.pyramid.level(self.depth).len(), Ordering::Relaxed);
            log::debug!("descending to pyramid level {}", self.depth);
        }
        self.publish_phase();
        self.publish_lifetimes();
    }

    /// Copies every parent's parameters into its children one level down.
    fn seed_children(&mut self) {
        let parent_depth = self.depth;
        let parents: Vec<Vec<f64>> = self
            .pyramid
            .level(parent_depth)
            .cells()
            .map(|c| c.params().to_vec())
            .collect();
        let parent_cols = self.pyramid.level(parent_depth).cols();
        let children = self.pyramid.level_mut(parent_depth - 1);
        for index in 0..children.len() {
            let (row, col) = children.coords(index);
            let parent = &parents[(row / 2) * parent_cols + col / 2];
            if let Err(err) = children.cell_at_mut(index).set_params(parent) {
                log::warn!("cannot seed cell ({row}, {col}): {err}");
            }
        }
    }

    fn step_sweep(&mut self) -> bool {
        let level_len = self.pyramid.level(0).len();
        while self.cursor < level_len {
            let index = self.cursor;
            let (row, col) = self.pyramid.level(0).coords(index);
            self.cursor += 1;
            if !self.is_active(row, col) {
                continue;
            }
            self.visited += 1;
            self.shared.progress.store(self.visited, Ordering::Relaxed);

            let (rcse, iterations) = cell_state(&self.pyramid, 0, index);
            if self.needs_work_in_sweep(rcse, iterations) {
                let cell = self.pyramid.level_mut(0).cell_at_mut(index);
                cell.iterate();
                let rcse = cell.rcse();
                self.count_iteration();
                self.pass_worked = true;
                self.accumulate(rcse);
                return true;
            }
            self.accumulate(rcse);
        }
        self.finish_sweep();
        false
    }

    fn finish_sweep(&mut self) {
        let total = self.pass_total;
        self.publish_pass_errors();
        let stalled = self.previous_total.is_some_and(|previous| {
            let improvement = previous - total;
            improvement.is_nan() || improvement <= STALL_EPSILON
        });
        if stalled {
            self.shared.stall_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.stall_count.store(0, Ordering::Relaxed);
        }
        self.previous_total = Some(total);
        self.idle = !self.pass_worked;
        self.begin_sweep();
        self.publish_lifetimes();
    }

    fn begin_sweep(&mut self) {
        self.cursor = 0;
        self.visited = 0;
        self.pass_worked = false;
        self.shared.subsample_level.store(0, Ordering::Relaxed);
        self.shared.progress.store(0, Ordering::Relaxed);
        self.shared
            .max_progress
            .store(self.active_pixels(), Ordering::Relaxed);
    }

    fn active_pixels(&self) -> usize {
        self.mask
            .as_ref()
            .map_or(self.pyramid.level(0).len(), PixelMask::count)
    }

    /// Starts over at the coarsest level with fresh estimates.
    fn restart(&mut self) {
        self.depth = self.pyramid.depth();
        self.phase = SchedulerPhase::InitialPass;
        self.cursor = 0;
        self.visited = 0;
        self.pass_total = 0.0;
        self.pass_worst = 0.0;
        self.previous_total = None;
        let coarsest = self.pyramid.level_mut(self.depth);
        for index in 0..coarsest.len() {
            coarsest.cell_at_mut(index).estimate();
        }
        let len = coarsest.len();
        self.shared.stall_count.store(0, Ordering::Relaxed);
        self.shared
            .subsample_level
            .store(self.depth, Ordering::Relaxed);
        self.shared.progress.store(0, Ordering::Relaxed);
        self.shared.max_progress.store(len, Ordering::Relaxed);
        if self.shared.alive.load(Ordering::Acquire) {
            self.publish_phase();
        }
        self.publish_lifetimes();
    }

    /// Applies queued changes. Masks wait for a sweep boundary unless
    /// `immediate` is set; model changes apply at once.
    fn apply_pending(&mut self, immediate: bool) {
        if !self.shared.has_pending.load(Ordering::Acquire) {
            return;
        }
        let mask_ready = immediate || self.phase != SchedulerPhase::BurnedIn || self.cursor == 0;
        let (components, fixed, mask) = {
            let mut pending = self.shared.pending();
            let mask = if mask_ready { pending.mask.take() } else { None };
            let taken = (pending.components.take(), pending.fixed.take(), mask);
            self.shared
                .has_pending
                .store(!pending.is_empty(), Ordering::Release);
            taken
        };

        if let Some(components) = components {
            match self.pyramid.set_component_count(components) {
                Ok(()) => {
                    log::info!("component count set to {components}; restarting burn-in");
                    self.restart();
                }
                Err(err) => log::warn!("ignoring component change: {err}"),
            }
        }
        if let Some(fixed) = fixed {
            if let Err(err) = self.pyramid.set_fixed(&fixed) {
                log::warn!("ignoring fixed mask: {err}");
            }
        }
        if let Some(mask) = mask {
            match &mask {
                Some(m) => log::debug!("ROI mask set: {} pixels", m.count()),
                None => log::debug!("ROI mask cleared"),
            }
            self.mask = mask;
            if self.phase == SchedulerPhase::BurnedIn && self.cursor == 0 {
                self.shared
                    .max_progress
                    .store(self.active_pixels(), Ordering::Relaxed);
            }
        }
    }

    fn publish_pass_errors(&mut self) {
        SharedState::store_f64(&self.shared.total_rcse, self.pass_total);
        SharedState::store_f64(&self.shared.worst_rcse, self.pass_worst);
        self.pass_total = 0.0;
        self.pass_worst = 0.0;
    }

    fn publish_phase(&self) {
        self.shared
            .phase
            .store(self.phase.to_u8(), Ordering::Release);
    }

    fn publish_lifetimes(&mut self) {
        let image = Arc::new(self.lifetimes());
        *self
            .shared
            .lifetimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = image;
        self.last_publish = Instant::now();
    }
}

fn cell_state(pyramid: &CurvePyramid, depth: usize, index: usize) -> (f64, u32) {
    let cell = pyramid.level(depth).cell_at(index);
    (cell.rcse(), cell.iterations())
}

impl fmt::Debug for BurnInScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BurnInScheduler")
            .field("phase", &self.phase)
            .field("depth", &self.depth)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pyramid::PyramidConfig;
    use flimfit_core::volume::DecayVolume;

    fn halving_volume(rows: usize, cols: usize) -> DecayVolume {
        DecayVolume::from_fn(rows, cols, 10, |_, _| (0..10).map(|t| 1024 >> t).collect())
            .unwrap()
    }

    fn scheduler(rows: usize, cols: usize, settings: FitSettings) -> BurnInScheduler {
        let pyramid = CurvePyramid::build(&halving_volume(rows, cols), PyramidConfig::default())
            .unwrap();
        BurnInScheduler::new(pyramid, SchedulerConfig::default().with_settings(settings))
    }

    fn run_until(s: &mut BurnInScheduler, phase: SchedulerPhase, limit: usize) {
        for _ in 0..limit {
            if s.phase() == phase {
                return;
            }
            s.step();
        }
        panic!("phase {phase:?} not reached");
    }

    #[test]
    fn test_phases_progress_to_burn_in() {
        let mut s = scheduler(4, 4, FitSettings::default().with_max_iterations(5));
        assert_eq!(s.phase(), SchedulerPhase::InitialPass);
        assert_eq!(s.current_depth(), 2);
        assert_eq!(s.handle().subsample_level(), 2);
        run_until(&mut s, SchedulerPhase::Estimating, 1000);
        assert_eq!(s.current_depth(), 1);
        run_until(&mut s, SchedulerPhase::BurnedIn, 1000);
        assert_eq!(s.handle().subsample_level(), 0);
        assert_eq!(s.handle().progress().1, 16);
    }

    #[test]
    fn test_children_inherit_parent_parameters() {
        let mut s = scheduler(4, 4, FitSettings::default().with_max_iterations(3));
        run_until(&mut s, SchedulerPhase::Estimating, 1000);
        let parent = s.pyramid().level(2).cell(0, 0).params().to_vec();
        for cell in s.pyramid().level(1).cells() {
            assert_eq!(cell.params(), parent.as_slice());
            assert_eq!(cell.iterations(), 0);
        }
    }

    #[test]
    fn test_step_counts_single_iterations() {
        let mut s = scheduler(2, 2, FitSettings::default().with_max_rcse(0.0));
        let mut expected = 0;
        for _ in 0..50 {
            if s.step() {
                expected += 1;
            }
            assert_eq!(s.total_iterations(), expected);
        }
    }

    #[test]
    fn test_stall_counter_rises_when_converged() {
        let mut s = scheduler(2, 2, FitSettings::default().with_max_iterations(2));
        run_until(&mut s, SchedulerPhase::BurnedIn, 1000);
        for _ in 0..200 {
            s.step();
        }
        assert!(s.handle().stall_count() > 0);
    }

    #[test]
    fn test_status_text() {
        let mut status = SchedulerStatus {
            phase: SchedulerPhase::InitialPass,
            progress: 1,
            max_progress: 4,
            subsample_level: 2,
            total_iterations: 12,
            total_rcse: 0.5,
            worst_rcse: 0.25,
            stall_count: 3,
        };
        assert_eq!(status.to_string(), "Initial pass: 25%");
        status.phase = SchedulerPhase::Estimating;
        assert_eq!(status.to_string(), "Estimating; 2 steps until total burn-in");
        status.subsample_level = 1;
        assert_eq!(status.to_string(), "Estimating; 1 step until total burn-in");
        status.phase = SchedulerPhase::BurnedIn;
        assert_eq!(
            status.to_string(),
            "Iter. #12: worst=0.2500: total=0.5000; stalled=3"
        );
    }

    #[test]
    fn test_handle_validates_synchronously() {
        let s = scheduler(2, 2, FitSettings::default());
        let handle = s.handle();
        assert!(handle.set_fixed(&[true]).is_err());
        assert!(handle.set_component_count(0).is_err());
        let wrong = PixelMask::filled(3, 2, true).unwrap();
        assert!(matches!(
            handle.set_mask(Some(wrong)),
            Err(Error::InvalidDimension(_))
        ));
    }

    #[test]
    fn test_component_change_restarts() {
        let mut s = scheduler(4, 4, FitSettings::default().with_max_iterations(3));
        run_until(&mut s, SchedulerPhase::BurnedIn, 1000);
        s.set_component_count(2).unwrap();
        assert_eq!(s.phase(), SchedulerPhase::InitialPass);
        assert_eq!(s.pyramid().param_count(), 6);
        assert!(s.set_fixed(&[false; 6]).is_ok());
    }

    #[test]
    fn test_lifetime_backing_follows_cursor() {
        let mut s = scheduler(2, 2, FitSettings::default().with_max_iterations(1));
        run_until(&mut s, SchedulerPhase::Estimating, 1000);
        // Level 0 not visited yet: pixels show the coarse fit.
        let coarse = s.pyramid().level(1).cell(0, 0).curve().lifetime();
        assert_eq!(s.lifetimes().get(1, 1).to_bits(), coarse.to_bits());
    }
}

//! flimfit CLI
//!
//! Builds synthetic lifetime datasets and runs the progressive fitter on them.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use flimfit_algorithms::{
    BurnInScheduler, ChannelSwitcher, CurvePyramid, FitSettings, FitterKind, PyramidBuilder,
    PyramidConfig, SchedulerConfig, SchedulerStatus,
};
use flimfit_core::{
    BinWindow, DecayVolume, LifetimeStats, NoiseModel, ProgressEvent, SyntheticDecay,
    TimeCalibration,
};

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("Core error: {0}")]
    Core(#[from] flimfit_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Fitting worker panicked")]
    Worker,
}

/// Fitting algorithm selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Fitter {
    /// Levenberg-Marquardt (gradient based)
    Lm,
    /// Random mutation search
    Stochastic,
}

/// Synthetic noise selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Noise {
    /// Exact model values
    None,
    /// Poisson counting noise
    Poisson,
}

/// Progressive fluorescence lifetime fitting.
#[derive(Parser)]
#[command(name = "flimfit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Synthetic dataset and pyramid options shared by all commands.
#[derive(Args, Debug, Clone)]
struct DataArgs {
    /// Image rows
    #[arg(long, default_value = "32")]
    rows: usize,

    /// Image columns
    #[arg(long, default_value = "32")]
    cols: usize,

    /// Time bins per pixel
    #[arg(long, default_value = "64")]
    bins: usize,

    /// Peak photon count per pixel
    #[arg(long, default_value = "500.0")]
    amplitude: f64,

    /// Decay rate (1/bins) of the first channel
    #[arg(long, default_value = "0.08")]
    rate: f64,

    /// Constant background
    #[arg(long, default_value = "2.0")]
    offset: f64,

    /// Fractional rate increase across the columns
    #[arg(long, default_value = "0.5")]
    rate_gradient: f64,

    /// Noise model
    #[arg(long, value_enum, default_value = "poisson")]
    noise: Noise,

    /// Random seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Pre-binning radius (pixels)
    #[arg(long, default_value = "0")]
    bin_radius: usize,

    /// First bin of the fit window
    #[arg(long)]
    window_first: Option<usize>,

    /// One past the last bin of the fit window
    #[arg(long)]
    window_last: Option<usize>,
}

impl DataArgs {
    fn volume(&self, channel: usize) -> Result<DecayVolume> {
        let noise = match self.noise {
            Noise::None => NoiseModel::None,
            Noise::Poisson => NoiseModel::Poisson,
        };
        let rate = self.rate * (1.0 + 0.5 * channel as f64);
        let volume = SyntheticDecay::single(self.rows, self.cols, self.bins, self.amplitude, rate)
            .with_offset(self.offset)
            .with_rate_gradient(self.rate_gradient)
            .with_noise(noise)
            .with_seed(self.seed.wrapping_add(channel as u64))
            .generate()?;
        Ok(volume)
    }

    fn window(&self) -> Option<BinWindow> {
        match (self.window_first, self.window_last) {
            (None, None) => None,
            (first, last) => Some(BinWindow::new(
                first.unwrap_or(0),
                last.unwrap_or(self.bins),
            )),
        }
    }

    fn pyramid_config(&self, components: usize, fitter: Fitter) -> PyramidConfig {
        let mut config = PyramidConfig::default()
            .with_bin_radius(self.bin_radius)
            .with_components(components)
            .with_fitter(match fitter {
                Fitter::Lm => FitterKind::LevenbergMarquardt,
                Fitter::Stochastic => FitterKind::Stochastic,
            });
        if let Some(window) = self.window() {
            config = config.with_window(window);
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a pyramid and describe its levels
    Pyramid {
        #[command(flatten)]
        data: DataArgs,
    },

    /// Fit one or more synthetic channels
    Fit {
        #[command(flatten)]
        data: DataArgs,

        /// Number of spectral channels
        #[arg(long, default_value = "1")]
        channels: usize,

        /// Exponential components (1 or 2)
        #[arg(short, long, default_value = "1")]
        components: usize,

        /// Fitting algorithm
        #[arg(short, long, value_enum, default_value = "lm")]
        fitter: Fitter,

        /// Per-pixel iteration budget
        #[arg(long, default_value = "50")]
        max_iterations: u32,

        /// Reduced chi-squared error considered converged
        #[arg(long, default_value = "1.5")]
        max_rcse: f64,

        /// Total fitting time (milliseconds)
        #[arg(long, default_value = "2000")]
        duration_ms: u64,

        /// Status polling interval (milliseconds)
        #[arg(long, default_value = "250")]
        poll_ms: u64,

        /// Switch to the next channel after this many milliseconds
        #[arg(long)]
        switch_after_ms: Option<u64>,

        /// Acquisition time range (ns) for reporting lifetimes in picoseconds
        #[arg(long)]
        time_range_ns: Option<f64>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Per-channel fitting summary.
#[derive(Serialize)]
struct ChannelReport {
    channel: usize,
    unit: &'static str,
    status: String,
    total_iterations: u64,
    lifetime: Option<LifetimeStats>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Pyramid { data } => {
            let volume = data.volume(0)?;
            let mut builder = PyramidBuilder::new(data.pyramid_config(1, Fitter::Lm));
            builder.register_observer(Box::new(|event: &ProgressEvent| {
                if event.message.is_some() {
                    log::info!("{}", event);
                }
            }));
            let start = Instant::now();
            let pyramid = builder.build(&volume)?;

            println!(
                "Built {} levels in {:.2}ms",
                pyramid.depth() + 1,
                start.elapsed().as_secs_f64() * 1000.0
            );
            println!(
                "{:<6} | {:<10} | {:<14} | {:<10}",
                "Level", "Shape", "Total count", "Window"
            );
            println!("{:-<50}", "");
            for (depth, level) in pyramid.levels().iter().enumerate() {
                let window = level.cell(0, 0).curve().window();
                println!(
                    "{:<6} | {:<10} | {:<14} | [{}, {})",
                    depth,
                    format!("{}x{}", level.rows(), level.cols()),
                    level.total_count(),
                    window.first,
                    window.last
                );
            }
        }

        Commands::Fit {
            data,
            channels,
            components,
            fitter,
            max_iterations,
            max_rcse,
            duration_ms,
            poll_ms,
            switch_after_ms,
            time_range_ns,
            json,
        } => {
            let settings = FitSettings::default()
                .with_max_iterations(max_iterations)
                .with_max_rcse(max_rcse);
            let mut schedulers = Vec::with_capacity(channels);
            for channel in 0..channels.max(1) {
                let volume = data.volume(channel)?;
                let pyramid = CurvePyramid::build(&volume, data.pyramid_config(components, fitter))?;
                log::info!(
                    "channel {}: {} photons, {} levels",
                    channel,
                    volume.total_count(),
                    pyramid.depth() + 1
                );
                schedulers.push(BurnInScheduler::new(
                    pyramid,
                    SchedulerConfig::default().with_settings(settings),
                ));
            }

            let switcher = Arc::new(ChannelSwitcher::new(schedulers)?);
            let worker = {
                let switcher = Arc::clone(&switcher);
                thread::spawn(move || switcher.run())
            };
            // stop() issued before the worker arms would be overwritten by run()
            while !switcher.handle(switcher.current())?.is_alive() && !worker.is_finished() {
                thread::yield_now();
            }

            let start = Instant::now();
            let duration = Duration::from_millis(duration_ms);
            let mut switched = false;
            while start.elapsed() < duration {
                thread::sleep(Duration::from_millis(poll_ms.max(1)));
                if let Some(after) = switch_after_ms {
                    if !switched && start.elapsed() >= Duration::from_millis(after) {
                        let next = (switcher.current() + 1) % switcher.channel_count();
                        switcher.set_current(next)?;
                        switched = true;
                    }
                }
                if !json {
                    println!(
                        "[{:>6.0}ms] channel {}: {}",
                        start.elapsed().as_secs_f64() * 1000.0,
                        switcher.current(),
                        switcher.status()
                    );
                }
            }

            switcher.stop();
            worker.join().map_err(|_| CliError::Worker)?;

            let calibration = time_range_ns.map(|ns| TimeCalibration::new(ns, data.bins));
            let mut reports = Vec::with_capacity(switcher.channel_count());
            for channel in 0..switcher.channel_count() {
                let handle = switcher.handle(channel)?;
                let lifetimes = handle.lifetimes();
                let stats = match &calibration {
                    Some(calibration) => lifetimes.to_picoseconds(calibration).stats(),
                    None => lifetimes.stats(),
                };
                let status: SchedulerStatus = handle.status();
                reports.push(ChannelReport {
                    channel,
                    unit: if calibration.is_some() { "ps" } else { "bins" },
                    status: status.to_string(),
                    total_iterations: status.total_iterations,
                    lifetime: stats,
                });
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                println!();
                for report in &reports {
                    println!("Channel {}: {}", report.channel, report.status);
                    match &report.lifetime {
                        Some(stats) => println!(
                            "  lifetime ({}): mean {:.3}, min {:.3}, max {:.3} over {} pixels",
                            report.unit, stats.mean, stats.min, stats.max, stats.pixels
                        ),
                        None => println!("  no lifetime estimates yet"),
                    }
                }
            }
        }
    }

    Ok(())
}

#![allow(clippy::uninlined_format_args)]
use std::thread;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use flimfit_algorithms::{
    BurnInScheduler, CurvePyramid, FitSettings, PyramidConfig, SchedulerConfig, SchedulerPhase,
};
use flimfit_core::{DecayVolume, PixelMask};

/// Every pixel holds 1024 * 2^-t, an exact exponential in integer counts.
fn halving_volume(rows: usize, cols: usize) -> DecayVolume {
    DecayVolume::from_fn(rows, cols, 10, |_, _| (0..10).map(|t| 1024 >> t).collect()).unwrap()
}

fn scheduler(components: usize, settings: FitSettings) -> BurnInScheduler {
    let config = PyramidConfig::default().with_components(components);
    let pyramid = CurvePyramid::build(&halving_volume(4, 4), config).unwrap();
    BurnInScheduler::new(pyramid, SchedulerConfig::default().with_settings(settings))
}

/// Settings that never run out of work.
fn endless() -> FitSettings {
    FitSettings::default()
        .with_max_rcse(-1.0)
        .with_max_iterations(5)
}

fn step_until_burned_in(s: &mut BurnInScheduler) {
    for _ in 0..100_000 {
        if s.phase() == SchedulerPhase::BurnedIn {
            return;
        }
        s.step();
    }
    panic!("burn-in did not complete");
}

fn level0_iterations(s: &BurnInScheduler) -> Vec<u32> {
    s.pyramid().level(0).cells().map(|c| c.iterations()).collect()
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_two_component_fit_converges_on_exact_decay() {
    let settings = FitSettings::default()
        .with_max_rcse(1e-6)
        .with_max_iterations(200);
    let mut s = scheduler(2, settings);
    step_until_burned_in(&mut s);
    for _ in 0..16 * 400 {
        s.step();
    }

    let ln2 = std::f64::consts::LN_2;
    for cell in s.pyramid().level(0).cells() {
        assert!(cell.iterations() <= 200);
        assert!(cell.rcse() < 1e-6, "rcse {}", cell.rcse());
        assert_relative_eq!(cell.curve().dominant_rate(), ln2, max_relative = 0.01);
    }
    let lifetimes = s.handle().lifetimes();
    let stats = lifetimes.stats().unwrap();
    assert_eq!(stats.pixels, 16);
    assert_relative_eq!(stats.mean, 1.0 / ln2, max_relative = 0.01);
}

#[test]
fn test_rounded_unit_rate_decay_recovers_rate() {
    // round(100 * e^-t) for t = 0..10
    let decay = [100, 37, 14, 5, 2, 1, 0, 0, 0, 0];
    let volume = DecayVolume::from_fn(4, 4, 10, |_, _| decay.to_vec()).unwrap();
    let pyramid = CurvePyramid::build(&volume, PyramidConfig::default()).unwrap();
    let settings = FitSettings::default()
        .with_max_rcse(1e-6)
        .with_max_iterations(200);
    let mut s = BurnInScheduler::new(pyramid, SchedulerConfig::default().with_settings(settings));
    step_until_burned_in(&mut s);
    for _ in 0..16 * 400 {
        s.step();
    }

    for cell in s.pyramid().level(0).cells() {
        assert_relative_eq!(cell.curve().dominant_rate(), 1.0, max_relative = 0.01);
    }
}

#[test]
fn test_children_start_from_parent_parameters() {
    let mut s = scheduler(1, FitSettings::default().with_max_iterations(4));
    let mut transitions = 0;
    let mut depth = s.current_depth();
    for _ in 0..10_000 {
        s.step();
        if s.current_depth() != depth && s.phase() != SchedulerPhase::BurnedIn {
            depth = s.current_depth();
            transitions += 1;
            let parents = s.pyramid().level(depth + 1);
            let children = s.pyramid().level(depth);
            for row in 0..children.rows() {
                for col in 0..children.cols() {
                    let child = children.cell(row, col);
                    let parent = parents.cell(row / 2, col / 2);
                    assert_eq!(child.params(), parent.params());
                }
            }
        }
        if s.phase() == SchedulerPhase::BurnedIn {
            break;
        }
    }
    assert_eq!(transitions, 2);
}

#[test]
fn test_fixed_parameters_survive_fitting() {
    let mut s = scheduler(1, endless());
    s.set_fixed(&[false, true, false]).unwrap();
    let rate = s.pyramid().level(2).cell(0, 0).params()[1];
    step_until_burned_in(&mut s);
    for _ in 0..500 {
        s.step();
    }
    for level in s.pyramid().levels() {
        for cell in level.cells() {
            assert_eq!(cell.params()[1].to_bits(), rate.to_bits());
        }
    }
}

#[test]
fn test_total_iterations_count_each_step() {
    let mut s = scheduler(1, endless());
    let handle = s.handle();
    let mut previous = handle.total_iterations();
    for _ in 0..300 {
        let iterated = s.step();
        let now = handle.total_iterations();
        assert_eq!(now, previous + u64::from(iterated));
        previous = now;
    }
}

#[test]
fn test_mask_limits_iteration_to_roi() {
    let mut s = scheduler(1, endless());
    step_until_burned_in(&mut s);
    let mask = PixelMask::rectangle(4, 4, 0..2, 0..2).unwrap();
    s.set_mask(Some(mask.clone())).unwrap();
    assert_eq!(s.handle().progress().1, 4);

    let before = level0_iterations(&s);
    for _ in 0..400 {
        s.step();
    }
    let after = level0_iterations(&s);
    for (index, (b, a)) in before.iter().zip(&after).enumerate() {
        let (row, col) = (index / 4, index % 4);
        if mask.get(row, col) {
            assert!(a > b, "pixel ({}, {}) inside the mask stalled", row, col);
        } else {
            assert_eq!(a, b, "pixel ({}, {}) outside the mask was iterated", row, col);
        }
    }

    s.set_mask(None).unwrap();
    for _ in 0..400 {
        s.step();
    }
    let reopened = level0_iterations(&s);
    assert!(reopened.iter().zip(&after).all(|(r, a)| r > a));
}

#[test]
fn test_mask_queued_while_running_applies_between_sweeps() {
    let mut s = scheduler(1, endless());
    step_until_burned_in(&mut s);
    s.step();
    let handle = s.handle();
    handle
        .set_mask(Some(PixelMask::rectangle(4, 4, 3..4, 3..4).unwrap()))
        .unwrap();
    // The current sweep still runs over the whole image.
    assert!(s.mask().is_none());
    for _ in 0..40 {
        s.step();
    }
    assert_eq!(s.mask().map(PixelMask::count), Some(1));
}

#[test]
fn test_stop_halts_and_run_resumes() {
    let mut s = scheduler(2, endless());
    let handle = s.handle();
    let worker = thread::spawn(move || {
        s.run();
        s
    });
    wait_for(|| handle.total_iterations() > 100);
    handle.stop();
    let at_stop = handle.total_iterations();
    let mut s = worker.join().unwrap();
    let stopped = handle.total_iterations();
    assert!(stopped <= at_stop + 1);
    assert_eq!(handle.phase(), SchedulerPhase::Stopped);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(handle.total_iterations(), stopped);

    // Resuming picks up the parameters exactly as they were left.
    let snapshot: Vec<Vec<f64>> = s
        .pyramid()
        .levels()
        .iter()
        .flat_map(|l| l.cells().map(|c| c.params().to_vec()))
        .collect();
    let iterated = s.step();
    let resumed: Vec<Vec<f64>> = s
        .pyramid()
        .levels()
        .iter()
        .flat_map(|l| l.cells().map(|c| c.params().to_vec()))
        .collect();
    let changed = snapshot.iter().zip(&resumed).filter(|(a, b)| a != b).count();
    assert!(changed <= 1);
    assert_eq!(handle.total_iterations(), stopped + u64::from(iterated));

    let worker = thread::spawn(move || {
        s.run();
        s
    });
    wait_for(|| handle.total_iterations() > stopped + 50);
    handle.stop();
    worker.join().unwrap();
}

#[test]
fn test_lifetime_snapshot_published_on_stop() {
    let mut s = scheduler(1, FitSettings::default().with_max_iterations(20));
    let handle = s.handle();
    let worker = thread::spawn(move || s.run());
    wait_for(|| handle.phase() == SchedulerPhase::BurnedIn);
    handle.stop();
    worker.join().unwrap();
    let image = handle.lifetimes();
    assert_eq!((image.rows(), image.cols()), (4, 4));
    assert!(image.values().iter().all(|v| v.is_finite()));
}

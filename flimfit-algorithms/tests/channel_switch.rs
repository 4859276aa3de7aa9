use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flimfit_algorithms::{
    BurnInScheduler, ChannelSwitcher, CurvePyramid, FitSettings, PyramidConfig, SchedulerConfig,
    SchedulerPhase,
};
use flimfit_core::{PixelMask, SyntheticDecay};

fn channel(rate: f64, seed: u64) -> BurnInScheduler {
    let volume = SyntheticDecay::single(4, 4, 24, 500.0, rate)
        .with_seed(seed)
        .generate()
        .unwrap();
    let pyramid = CurvePyramid::build(&volume, PyramidConfig::default()).unwrap();
    let settings = FitSettings::default()
        .with_max_rcse(-1.0)
        .with_max_iterations(5);
    BurnInScheduler::new(pyramid, SchedulerConfig::default().with_settings(settings))
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_switch_stops_previous_channel_first() {
    let switcher = Arc::new(ChannelSwitcher::new(vec![channel(0.1, 1), channel(0.3, 2)]).unwrap());
    let first = switcher.handle(0).unwrap().clone();
    let second = switcher.handle(1).unwrap().clone();

    let worker = {
        let switcher = Arc::clone(&switcher);
        thread::spawn(move || switcher.run())
    };
    wait_for(|| first.total_iterations() > 50);
    assert_eq!(second.total_iterations(), 0);

    switcher.set_current(1).unwrap();
    let frozen = first.total_iterations();
    assert_eq!(first.phase(), SchedulerPhase::Stopped);

    wait_for(|| second.total_iterations() > 50);
    assert_eq!(first.total_iterations(), frozen);

    switcher.stop();
    let final_second = second.total_iterations();
    worker.join().unwrap();
    assert_eq!(second.total_iterations(), final_second);
}

#[test]
fn test_broadcast_reaches_running_and_idle_channels() {
    let switcher = Arc::new(ChannelSwitcher::new(vec![channel(0.1, 3), channel(0.2, 4)]).unwrap());
    let worker = {
        let switcher = Arc::clone(&switcher);
        thread::spawn(move || switcher.run())
    };
    let active = switcher.handle(0).unwrap().clone();
    wait_for(|| active.phase() == SchedulerPhase::BurnedIn);

    let mask = PixelMask::rectangle(4, 4, 0..1, 0..4).unwrap();
    switcher.set_mask(Some(&mask)).unwrap();
    switcher.set_max_iterations(9);

    // Running channel applies the mask at its next sweep boundary.
    wait_for(|| active.progress().1 == 4);
    switcher.stop();
    worker.join().unwrap();

    for index in 0..2 {
        let count = switcher
            .with_scheduler(index, |s| s.mask().map(PixelMask::count))
            .unwrap();
        assert_eq!(count, Some(4));
        assert_eq!(switcher.handle(index).unwrap().settings().max_iterations, 9);
    }
}

#[test]
fn test_restart_after_stop_resumes_same_channel() {
    let switcher = Arc::new(ChannelSwitcher::new(vec![channel(0.1, 5)]).unwrap());
    let handle = switcher.handle(0).unwrap().clone();
    for round in 1..=2u64 {
        let worker = {
            let switcher = Arc::clone(&switcher);
            thread::spawn(move || switcher.run())
        };
        wait_for(|| handle.total_iterations() > round * 40);
        switcher.stop();
        worker.join().unwrap();
    }
    assert!(handle.total_iterations() > 80);
}

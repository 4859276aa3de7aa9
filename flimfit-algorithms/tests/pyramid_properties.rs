#![allow(clippy::uninlined_format_args)]
use flimfit_algorithms::{level_shapes, CurvePyramid, PyramidConfig};
use flimfit_core::{BinWindow, DecayVolume, NoiseModel, SyntheticDecay};

fn noisy_volume(rows: usize, cols: usize, seed: u64) -> DecayVolume {
    SyntheticDecay::single(rows, cols, 32, 400.0, 0.12)
        .with_offset(3.0)
        .with_rate_gradient(0.5)
        .with_noise(NoiseModel::Poisson)
        .with_seed(seed)
        .generate()
        .unwrap()
}

#[test]
fn test_every_level_conserves_counts() {
    for (rows, cols) in [(8, 8), (7, 5), (1, 9), (3, 1)] {
        let volume = noisy_volume(rows, cols, 11);
        let pyramid = CurvePyramid::build(&volume, PyramidConfig::default()).unwrap();
        for (depth, level) in pyramid.levels().iter().enumerate() {
            assert_eq!(
                level.total_count(),
                volume.total_count(),
                "{}x{} level {}",
                rows,
                cols,
                depth
            );
        }
    }
}

#[test]
fn test_level_shapes_halve_to_single_cell() {
    let volume = noisy_volume(8, 8, 1);
    let pyramid = CurvePyramid::build(&volume, PyramidConfig::default()).unwrap();
    assert_eq!(pyramid.depth(), 3);
    for depth in 0..=pyramid.depth() {
        let level = pyramid.level(depth);
        assert_eq!(level.rows(), 8 >> depth);
        assert_eq!(level.cols(), 8 >> depth);
    }

    let volume = noisy_volume(6, 3, 2);
    let pyramid = CurvePyramid::build(&volume, PyramidConfig::default()).unwrap();
    let shapes: Vec<(usize, usize)> = pyramid
        .levels()
        .iter()
        .map(|l| (l.rows(), l.cols()))
        .collect();
    assert_eq!(shapes, level_shapes(6, 3));
    assert_eq!(shapes.last(), Some(&(1, 1)));
}

#[test]
fn test_zero_radius_matches_raw_input() {
    let volume = noisy_volume(5, 4, 3);
    let pyramid = CurvePyramid::build(&volume, PyramidConfig::default().with_bin_radius(0)).unwrap();
    for row in 0..5 {
        for col in 0..4 {
            let raw: Vec<u64> = volume
                .histogram(row, col)
                .iter()
                .map(|&c| u64::from(c))
                .collect();
            assert_eq!(pyramid.level(0).cell(row, col).curve().counts(), raw.as_slice());
        }
    }
}

#[test]
fn test_prebinning_sums_neighborhood() {
    let volume = DecayVolume::from_fn(4, 4, 2, |_, _| vec![1, 2]).unwrap();
    let pyramid = CurvePyramid::build(&volume, PyramidConfig::default().with_bin_radius(1)).unwrap();
    let level = pyramid.level(0);
    assert_eq!(level.cell(0, 0).curve().counts(), &[4, 8]);
    assert_eq!(level.cell(0, 1).curve().counts(), &[6, 12]);
    assert_eq!(level.cell(1, 1).curve().counts(), &[9, 18]);
}

#[test]
fn test_window_propagates_to_every_level() {
    let volume = noisy_volume(4, 4, 5);
    let window = BinWindow::new(2, 30);
    let pyramid = CurvePyramid::build(&volume, PyramidConfig::default().with_window(window)).unwrap();
    for level in pyramid.levels() {
        assert!(level.cells().all(|c| c.curve().window() == window));
    }
}

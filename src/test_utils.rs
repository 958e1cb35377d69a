//! Synthetic bursts for tests.

use ndarray::{s, Array2, ArrayView2};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

/// Smooth texture with structure at several scales, values within `[0.1, 0.9]`.
pub(crate) fn textured_scene(x: f32, y: f32) -> f32 {
    0.5 + 0.12 * (0.31 * x).sin() * (0.23 * y).cos()
        + 0.1 * (0.17 * (x + y)).sin()
        + 0.1 * (0.045 * x + 1.0).sin() * (0.06 * y).cos()
        + 0.06 * (0.11 * x - 0.07 * y + 0.002 * x * y).sin()
}

/// Diagonal gradient with a bright disc of radius 60 centred at (128, 128).
pub(crate) fn gradient_circle_scene(x: f32, y: f32) -> f32 {
    let r = (x - 128.0).hypot(y - 128.0);
    let disc = ((60.0 - r) / 2.0 + 0.5).clamp(0.0, 1.0);

    0.2 + 0.4 * (x + y) / 512.0 + 0.3 * disc
}

/// Render `scene` with its content moved by `shift` and Gaussian noise of `sigma` added.
pub(crate) fn render<F>(
    width: usize,
    height: usize,
    shift: (f32, f32),
    sigma: f32,
    seed: u64,
    scene: F,
) -> Array2<f32>
where
    F: Fn(f32, f32) -> f32,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0f32, sigma.max(f32::MIN_POSITIVE)).unwrap();

    let mut image = Array2::zeros((height, width));
    for ((y, x), v) in image.indexed_iter_mut() {
        let clean = scene(x as f32 - shift.0, y as f32 - shift.1);
        *v = if sigma > 0.0 {
            clean + normal.sample(&mut rng)
        } else {
            clean
        };
    }

    image
}

/// Signal power over residual variance, ignoring `border` pixels on every side.
pub(crate) fn snr(estimate: ArrayView2<'_, f32>, truth: ArrayView2<'_, f32>, border: usize) -> f32 {
    let (height, width) = truth.dim();
    let region = s![border..height - border, border..width - border];

    let truth = truth.slice(region);
    let residual = &estimate.slice(region) - &truth;

    let n = residual.len() as f64;
    let power = truth.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / n;
    let mean = residual.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = residual.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;

    (power / variance.max(f64::MIN_POSITIVE)) as f32
}

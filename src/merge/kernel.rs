//! Interpolation kernels for sub-pixel resampling of alternate tiles.

use std::f32::consts::PI;

use ndarray::{Array2, ArrayView2};

use crate::align::MotionVector;
use crate::image::sample_clamped;

/// A separable, symmetric interpolation kernel.
pub trait Kernel: Send + Sync {
    /// Support half-width in pixels; taps outside `(-radius, radius)` have zero weight.
    fn radius(&self) -> usize;

    /// Weight of a tap at signed distance `t` from the sample position.
    fn weight(&self, t: f32) -> f32;
}

/// Catmull-Rom cubic, `a = -0.5`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bicubic;

impl Kernel for Bicubic {
    #[inline]
    fn radius(&self) -> usize {
        2
    }

    #[inline]
    fn weight(&self, t: f32) -> f32 {
        const A: f32 = -0.5;

        let t = t.abs();
        if t <= 1.0 {
            ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0
        } else if t < 2.0 {
            ((A * t - 5.0 * A) * t + 8.0 * A) * t - 4.0 * A
        } else {
            0.0
        }
    }
}

/// Sinc windowed by a wider sinc, `lobes` taps on each side.
#[derive(Debug, Clone, Copy)]
pub struct Lanczos {
    pub lobes: usize,
}

impl Kernel for Lanczos {
    #[inline]
    fn radius(&self) -> usize {
        self.lobes
    }

    #[inline]
    fn weight(&self, t: f32) -> f32 {
        let a = self.lobes as f32;
        if t.abs() < 1e-6 {
            return 1.0;
        }
        if t.abs() >= a {
            return 0.0;
        }

        let pi_t = PI * t;
        let pi_t_a = pi_t / a;

        (pi_t.sin() / pi_t) * (pi_t_a.sin() / pi_t_a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterpolationKernel {
    #[default]
    Bicubic,
    Lanczos3,
}

impl InterpolationKernel {
    pub fn build(self) -> Box<dyn Kernel> {
        match self {
            InterpolationKernel::Bicubic => Box::new(Bicubic),
            InterpolationKernel::Lanczos3 => Box::new(Lanczos { lobes: 3 }),
        }
    }
}

/// Normalized taps for a sample at `position`: the first tap index and the weights.
fn taps(kernel: &dyn Kernel, position: f32) -> (isize, Vec<f32>) {
    let base = position.floor();
    let frac = position - base;

    // integer positions read the sample itself
    if frac < 1e-6 {
        return (base as isize, vec![1.0]);
    }

    let radius = kernel.radius() as isize;
    let first = base as isize - radius + 1;

    let mut weights: Vec<f32> = (first..=base as isize + radius)
        .map(|tap| kernel.weight(tap as f32 - position))
        .collect();

    let sum: f32 = weights.iter().sum();
    if sum.abs() > f32::EPSILON {
        weights.iter_mut().for_each(|w| *w /= sum);
    }

    (first, weights)
}

/// Read a `size x size` block of `plane` whose top-left corner maps to `(x, y)` in the
/// reference, displaced by `vector`. Reads outside the plane replicate the border.
pub fn resample_tile(
    plane: &ArrayView2<'_, f32>,
    x: usize,
    y: usize,
    size: usize,
    vector: MotionVector,
    kernel: &dyn Kernel,
) -> Array2<f32> {
    // the displacement is constant over the tile, so the taps are shared by every pixel
    let (x_first, x_weights) = taps(kernel, x as f32 + vector.dx);
    let (y_first, y_weights) = taps(kernel, y as f32 + vector.dy);

    // horizontal pass over every row the vertical taps touch
    let rows = size + y_weights.len() - 1;
    let horizontal = Array2::from_shape_fn((rows, size), |(r, c)| {
        let sy = y_first + r as isize;
        let sx = x_first + c as isize;

        x_weights
            .iter()
            .enumerate()
            .map(|(k, w)| w * sample_clamped(plane, sx + k as isize, sy))
            .sum::<f32>()
    });

    Array2::from_shape_fn((size, size), |(r, c)| {
        y_weights
            .iter()
            .enumerate()
            .map(|(k, w)| w * horizontal[[r + k, c]])
            .sum::<f32>()
    })
}

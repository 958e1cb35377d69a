use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayView2, Axis};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::align::MotionVector;
use crate::config::MergeConfig;
use crate::image::Frame;
use crate::merge::kernel::{resample_tile, Kernel};
use crate::merge::weighting::{UniformWeighting, WeightingStrategy};
use crate::noise::NoiseModel;
use crate::tile::{Tile, TileGrid};

/// Total weights at or below this are treated as collapsed.
const MIN_TOTAL_WEIGHT: f32 = 1e-6;

/// Pre-computed transforms for one tile size.
pub struct TilePlans {
    fft_row: Arc<dyn Fft<f32>>,
    fft_col: Arc<dyn Fft<f32>>,
    ifft_row: Arc<dyn Fft<f32>>,
    ifft_col: Arc<dyn Fft<f32>>,
}

impl TilePlans {
    pub fn new(tile_size: usize) -> Self {
        let mut planner = FftPlanner::new();

        Self {
            fft_row: planner.plan_fft_forward(tile_size),
            fft_col: planner.plan_fft_forward(tile_size),
            ifft_row: planner.plan_fft_inverse(tile_size),
            ifft_col: planner.plan_fft_inverse(tile_size),
        }
    }

    pub fn fft2d(&self, input: ArrayView2<'_, f32>) -> Array2<Complex32> {
        let (rows, cols) = input.dim();
        let mut output = input.mapv(|v| Complex32::new(v, 0.0));

        let mut row_vec = vec![Complex32::default(); cols];
        for mut row in output.rows_mut() {
            row_vec.iter_mut().zip(row.iter()).for_each(|(d, s)| *d = *s);
            self.fft_row.process(&mut row_vec);
            row.iter_mut().zip(row_vec.iter()).for_each(|(d, s)| *d = *s);
        }

        let mut col_vec = vec![Complex32::default(); rows];
        for mut col in output.columns_mut() {
            col_vec.iter_mut().zip(col.iter()).for_each(|(d, s)| *d = *s);
            self.fft_col.process(&mut col_vec);
            col.iter_mut().zip(col_vec.iter()).for_each(|(d, s)| *d = *s);
        }

        output
    }

    /// Inverse of [`TilePlans::fft2d`], real part, scaled by `1 / (rows * cols)`.
    pub fn ifft2d(&self, input: &Array2<Complex32>) -> Array2<f32> {
        let (rows, cols) = input.dim();
        let mut intermediate = input.clone();

        let mut col_vec = vec![Complex32::default(); rows];
        for mut col in intermediate.columns_mut() {
            col_vec.iter_mut().zip(col.iter()).for_each(|(d, s)| *d = *s);
            self.ifft_col.process(&mut col_vec);
            col.iter_mut().zip(col_vec.iter()).for_each(|(d, s)| *d = *s);
        }

        let mut row_vec = vec![Complex32::default(); cols];
        for mut row in intermediate.rows_mut() {
            row_vec.iter_mut().zip(row.iter()).for_each(|(d, s)| *d = *s);
            self.ifft_row.process(&mut row_vec);
            row.iter_mut().zip(row_vec.iter()).for_each(|(d, s)| *d = *s);
        }

        let norm = 1.0 / (rows * cols) as f32;
        intermediate.mapv(|c| c.re * norm)
    }
}

/// One merged tile, still multiplied by the tile window, ready for overlap-add.
#[derive(Debug, Clone)]
pub struct MergedTile {
    pub index: usize,
    /// `(plane, row, col)` samples of the tile.
    pub samples: Array3<f32>,
    /// Coefficients where every weight collapsed and the reference passed through.
    pub degenerate: usize,
}

/// Noise-aware merge of co-located tiles in the frequency domain.
///
/// Follows the frequency-domain merge of the HDR+ pipeline
/// (https://graphics.stanford.edu/papers/hdrp/hasinoff-hdrplus-sigasia16.pdf), section 5,
/// with the per-coefficient weight left to a [`WeightingStrategy`].
pub struct FrequencyMerge {
    plans: TilePlans,
    grid: TileGrid,
    kernel: Box<dyn Kernel>,
    weighting: Box<dyn WeightingStrategy>,
    noise: NoiseModel,
}

impl FrequencyMerge {
    pub fn new(config: &MergeConfig, grid: &TileGrid, noise: NoiseModel) -> Self {
        let weighting: Box<dyn WeightingStrategy> = if noise.is_uniform() {
            Box::new(UniformWeighting)
        } else {
            config
                .weighting
                .build(config.noise_tolerance, config.outlier_threshold)
        };

        Self::with_weighting(config, grid, noise, weighting)
    }

    /// Merge with a caller supplied weighting, regardless of the configured mode.
    pub fn with_weighting(
        config: &MergeConfig,
        grid: &TileGrid,
        noise: NoiseModel,
        weighting: Box<dyn WeightingStrategy>,
    ) -> Self {
        Self {
            plans: TilePlans::new(grid.tile_size()),
            grid: grid.clone(),
            kernel: config.kernel.build(),
            weighting,
            noise,
        }
    }

    pub fn noise(&self) -> &NoiseModel {
        &self.noise
    }

    /// Merge the reference tile with every alternate, each displaced by its motion vector.
    pub fn merge_tile(
        &self,
        tile: &Tile,
        reference: &Frame,
        alternates: &[(&Frame, MotionVector)],
    ) -> MergedTile {
        let size = tile.size;
        let window = self.grid.tile_window(tile);
        // sum(w^2) scales per-pixel variance to per-coefficient power
        let window_energy: f32 = window.iter().map(|w| w * w).sum();

        let mut samples = Array3::zeros((reference.plane_count(), size, size));
        let mut degenerate = 0;

        for (plane, mut out) in samples.axis_iter_mut(Axis(0)).enumerate() {
            let ref_tile = resample_tile(
                &reference.plane(plane),
                tile.x,
                tile.y,
                size,
                MotionVector::ZERO,
                self.kernel.as_ref(),
            );

            let mean = ref_tile.mean().unwrap_or(0.0);
            let noise_variance = self
                .noise
                .variance(plane, mean)
                .map_or(0.0, |v| v * window_energy);

            let ref_coeffs = self.plans.fft2d((&ref_tile * &window).view());

            let ref_weight = self.weighting.reference_weight();
            let mut numer = ref_coeffs.mapv(|c| c * ref_weight);
            let mut total = Array2::from_elem(ref_coeffs.dim(), ref_weight);

            for &(frame, vector) in alternates {
                let aligned = resample_tile(
                    &frame.plane(plane),
                    tile.x,
                    tile.y,
                    size,
                    vector,
                    self.kernel.as_ref(),
                );
                let coeffs = self.plans.fft2d((&aligned * &window).view());

                ndarray::Zip::from(&mut numer)
                    .and(&mut total)
                    .and(&ref_coeffs)
                    .and(&coeffs)
                    .for_each(|n, t, &r, &a| {
                        let w = self.weighting.weight(r, a, noise_variance);
                        *n += a * w;
                        *t += w;
                    });
            }

            let merged = ndarray::Zip::from(&numer)
                .and(&total)
                .and(&ref_coeffs)
                .map_collect(|&n, &t, &r| {
                    let blended = n / t;
                    if t > MIN_TOTAL_WEIGHT && blended.re.is_finite() && blended.im.is_finite() {
                        blended
                    } else {
                        degenerate += 1;
                        r
                    }
                });

            out.assign(&self.plans.ifft2d(&merged));
        }

        MergedTile {
            index: tile.index,
            samples,
            degenerate,
        }
    }
}

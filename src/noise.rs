//! Sensor noise model.
//!
//! Noise is described per color plane as `sigma(x) = sqrt(scale * x + offset)`, the usual
//! shot + read noise form: `scale` carries the photon (signal dependent) part and `offset`
//! the read noise floor, both in normalized `[0, 1]` signal units.

use ndarray::ArrayView2;

use crate::error::NoiseProfileError;
use crate::image::Frame;

/// Block edge used by the noise estimator.
const ESTIMATE_BLOCK_SIZE: usize = 8;

/// Number of intensity bins the estimator regresses over.
const ESTIMATE_BINS: usize = 16;

/// Minimum number of blocks a bin needs to take part in the fit.
const ESTIMATE_MIN_BLOCKS_PER_BIN: usize = 4;

/// Variance of the 4-neighbour residual relative to the pixel noise variance.
const RESIDUAL_VARIANCE_GAIN: f32 = 1.25;

/// Smallest shot-noise scale an estimated profile is allowed to carry.
const MIN_ESTIMATED_SCALE: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseFunction {
    pub scale: f32,
    pub offset: f32,
}

impl NoiseFunction {
    /// Validated constructor.
    pub fn new(scale: f32, offset: f32) -> Result<Self, NoiseProfileError> {
        let func = Self { scale, offset };
        if !func.is_valid() {
            return Err(NoiseProfileError::InvalidFunction {
                index: 0,
                scale,
                offset,
            });
        }

        Ok(func)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.scale.is_finite() && self.offset.is_finite() && self.scale > 0.0 && self.offset >= 0.0
    }

    /// Expected noise variance at signal level `x`.
    #[inline]
    pub fn variance(&self, x: f32) -> f32 {
        (self.scale * x.clamp(0.0, 1.0) + self.offset).max(0.0)
    }

    /// Expected noise standard deviation at signal level `x`.
    #[inline]
    pub fn sigma(&self, x: f32) -> f32 {
        self.variance(x).sqrt()
    }
}

/// Calibrated noise functions for a burst, one per plane or a single one shared by all planes.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseProfile {
    functions: Vec<NoiseFunction>,
}

impl NoiseProfile {
    pub fn new(functions: Vec<NoiseFunction>) -> Result<Self, NoiseProfileError> {
        if functions.is_empty() {
            return Err(NoiseProfileError::Empty);
        }

        if let Some((index, func)) = functions.iter().enumerate().find(|(_, f)| !f.is_valid()) {
            return Err(NoiseProfileError::InvalidFunction {
                index,
                scale: func.scale,
                offset: func.offset,
            });
        }

        Ok(Self { functions })
    }

    /// A single function applied to every plane.
    pub fn uniform(func: NoiseFunction) -> Result<Self, NoiseProfileError> {
        Self::new(vec![func])
    }

    /// Check the profile can describe a frame with `plane_count` planes.
    pub fn check_planes(&self, plane_count: usize) -> Result<(), NoiseProfileError> {
        if self.functions.len() != 1 && self.functions.len() != plane_count {
            return Err(NoiseProfileError::PlaneCountMismatch {
                functions: self.functions.len(),
                planes: plane_count,
            });
        }

        Ok(())
    }

    #[inline]
    pub fn functions(&self) -> &[NoiseFunction] {
        &self.functions
    }

    #[inline]
    pub fn for_plane(&self, plane: usize) -> NoiseFunction {
        if self.functions.len() == 1 {
            self.functions[0]
        } else {
            self.functions[plane.min(self.functions.len() - 1)]
        }
    }

    #[inline]
    pub fn variance(&self, plane: usize, x: f32) -> f32 {
        self.for_plane(plane).variance(x)
    }

    /// Estimate a profile from a single frame.
    ///
    /// Each plane is cut into blocks; per block the local mean and the variance of the
    /// 4-neighbour residual (which cancels linear gradients) are measured. Blocks are
    /// binned by mean, the median variance of every bin is taken to reject edges, and a
    /// straight line `variance = scale * mean + offset` is fitted through the bins.
    pub fn estimate(frame: &Frame) -> Result<Self, NoiseProfileError> {
        let functions = (0..frame.plane_count())
            .map(|plane| estimate_plane(frame.plane(plane)))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(functions)
    }
}

fn estimate_plane(plane: ArrayView2<'_, f32>) -> Result<NoiseFunction, NoiseProfileError> {
    let (height, width) = plane.dim();
    if height < ESTIMATE_BLOCK_SIZE + 2 || width < ESTIMATE_BLOCK_SIZE + 2 {
        return Err(NoiseProfileError::InsufficientSamples);
    }

    // (mean, residual variance) per block, skipping the one pixel border
    let mut blocks = Vec::new();
    for by in (1..height - ESTIMATE_BLOCK_SIZE).step_by(ESTIMATE_BLOCK_SIZE) {
        for bx in (1..width - ESTIMATE_BLOCK_SIZE).step_by(ESTIMATE_BLOCK_SIZE) {
            let mut sum = 0.0f64;
            let mut res_sum = 0.0f64;
            let mut res_sq = 0.0f64;

            for y in by..by + ESTIMATE_BLOCK_SIZE {
                for x in bx..bx + ESTIMATE_BLOCK_SIZE {
                    let v = plane[[y, x]];
                    let neighbours = plane[[y, x - 1]]
                        + plane[[y, x + 1]]
                        + plane[[y - 1, x]]
                        + plane[[y + 1, x]];
                    let r = (v - 0.25 * neighbours) as f64;

                    sum += v as f64;
                    res_sum += r;
                    res_sq += r * r;
                }
            }

            let n = (ESTIMATE_BLOCK_SIZE * ESTIMATE_BLOCK_SIZE) as f64;
            let mean = sum / n;
            let res_mean = res_sum / n;
            let res_var = (res_sq / n - res_mean * res_mean).max(0.0) * n / (n - 1.0);

            blocks.push((mean as f32, res_var as f32 / RESIDUAL_VARIANCE_GAIN));
        }
    }

    if blocks.is_empty() {
        return Err(NoiseProfileError::InsufficientSamples);
    }

    let mut bins: Vec<Vec<(f32, f32)>> = vec![Vec::new(); ESTIMATE_BINS];
    for &(mean, var) in &blocks {
        let bin = ((mean.clamp(0.0, 1.0) * ESTIMATE_BINS as f32) as usize).min(ESTIMATE_BINS - 1);
        bins[bin].push((mean, var));
    }

    // (mean level of the bin, median variance, weight)
    let points: Vec<(f32, f32, f32)> = bins
        .iter()
        .filter(|bin| bin.len() >= ESTIMATE_MIN_BLOCKS_PER_BIN)
        .map(|bin| {
            let level = bin.iter().map(|&(mean, _)| mean).sum::<f32>() / bin.len() as f32;
            let mut vars: Vec<f32> = bin.iter().map(|&(_, var)| var).collect();
            (level, median(&mut vars), bin.len() as f32)
        })
        .collect();

    let (scale, offset) = if points.len() >= 2 {
        fit_line(&points)
    } else {
        let mut all: Vec<f32> = blocks.iter().map(|&(_, v)| v).collect();
        (0.0, median(&mut all))
    };

    let func = NoiseFunction {
        scale: scale.max(MIN_ESTIMATED_SCALE),
        offset: offset.max(0.0),
    };

    log::debug!(
        "estimated noise function: scale {:.3e}, offset {:.3e} from {} blocks",
        func.scale,
        func.offset,
        blocks.len()
    );

    Ok(func)
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }

    let mid = values.len() / 2;
    let (_, &mut m, _) = values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    m
}

/// Weighted least squares fit of `y = scale * x + offset`.
fn fit_line(points: &[(f32, f32, f32)]) -> (f32, f32) {
    let (mut sw, mut sx, mut sy, mut sxx, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for &(x, y, w) in points {
        let (x, y, w) = (x as f64, y as f64, w as f64);
        sw += w;
        sx += w * x;
        sy += w * y;
        sxx += w * x * x;
        sxy += w * x * y;
    }

    let denom = sw * sxx - sx * sx;
    if denom.abs() < 1e-12 {
        return (0.0, (sy / sw) as f32);
    }

    let scale = (sw * sxy - sx * sy) / denom;
    let offset = (sy - scale * sx) / sw;

    (scale as f32, offset as f32)
}

/// Where the merge takes its noise characterization from.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseSource {
    /// Calibrated functions, one per plane or one for all planes.
    Profile(Vec<NoiseFunction>),
    /// Estimate from the reference frame.
    Estimate,
    /// Skip noise-aware weighting and treat every frame with equal confidence.
    Uniform,
}

/// The noise characterization a merge actually runs with.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseModel {
    Profile(NoiseProfile),
    Uniform,
}

impl NoiseModel {
    /// Validate `source` against the reference frame.
    ///
    /// An unusable profile never aborts a merge: the model falls back to uniform
    /// weighting and the reason is handed back for reporting.
    pub fn resolve(source: NoiseSource, reference: &Frame) -> (Self, Option<NoiseProfileError>) {
        let profile = match source {
            NoiseSource::Uniform => return (NoiseModel::Uniform, None),
            NoiseSource::Estimate => NoiseProfile::estimate(reference),
            NoiseSource::Profile(functions) => NoiseProfile::new(functions).and_then(|profile| {
                profile.check_planes(reference.plane_count())?;
                Ok(profile)
            }),
        };

        match profile {
            Ok(profile) => (NoiseModel::Profile(profile), None),
            Err(err) => {
                log::warn!("unusable noise profile ({err}), falling back to uniform weighting");
                (NoiseModel::Uniform, Some(err))
            }
        }
    }

    /// Expected noise variance of `plane` at signal level `x`, `None` for uniform weighting.
    #[inline]
    pub fn variance(&self, plane: usize, x: f32) -> Option<f32> {
        match self {
            NoiseModel::Profile(profile) => Some(profile.variance(plane, x)),
            NoiseModel::Uniform => None,
        }
    }

    #[inline]
    pub fn is_uniform(&self) -> bool {
        matches!(self, NoiseModel::Uniform)
    }
}

//! Coarse-to-fine tile alignment.
//!
//! The guide image of every frame is reduced into a pyramid by repeated 2x average pooling.
//! Alignment starts at the coarsest level with an exhaustive search, then walks towards full
//! resolution: at every finer level the vectors of the level above are doubled and refined
//! within a small window. The cost term is the mean squared difference on reduced levels and
//! the mean absolute difference at full resolution, the choice made by the HDR+ paper
//! (see https://graphics.stanford.edu/papers/hdrp/hasinoff-hdrplus-sigasia16.pdf).

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::config::MergeConfig;
use crate::denoise::CancellationToken;
use crate::image::{avg_pool, sample_clamped};
use crate::tile::{Tile, TileGrid};

/// Smallest tile edge used on reduced levels.
const MIN_LEVEL_TILE_SIZE: usize = 8;

/// The coarsest level keeps at least this many pixels along its short side.
const MIN_COARSE_EXTENT: usize = 2 * MIN_LEVEL_TILE_SIZE;

/// Upper bound on the pixels sampled for one global score.
const GLOBAL_SAMPLE_BUDGET: usize = 1 << 18;

const SCORE_EPSILON: f32 = 1e-12;

/// Sub-pixel displacement of an alternate frame against the reference:
/// `alternate(x + dx, y + dy)` matches `reference(x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionVector {
    pub dx: f32,
    pub dy: f32,
}

impl MotionVector {
    pub const ZERO: MotionVector = MotionVector { dx: 0.0, dy: 0.0 };

    pub fn new(dx: f32, dy: f32) -> Self {
        Self { dx, dy }
    }

    #[inline]
    pub fn magnitude(&self) -> f32 {
        self.dx.hypot(self.dy)
    }
}

/// Alignment of one tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileAlignment {
    pub vector: MotionVector,
    /// Best full resolution match score (mean absolute difference).
    pub score: f32,
    /// How distinct the best match is from its neighbourhood, in `[0, 1]`.
    pub confidence: f32,
    /// The local estimate was rejected and the frame's global vector is used instead.
    pub fallback: bool,
}

/// Alignment of one frame against the reference, one entry per tile of the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameAlignment {
    /// Integer full resolution displacement of the whole frame, the coarse prior.
    pub global: (i32, i32),
    /// Sub-pixel refinement of `global`.
    pub global_vector: MotionVector,
    pub tiles: Vec<TileAlignment>,
}

impl FrameAlignment {
    /// The reference frame against itself.
    pub fn identity(n_tiles: usize) -> Self {
        Self {
            global: (0, 0),
            global_vector: MotionVector::ZERO,
            tiles: vec![
                TileAlignment {
                    vector: MotionVector::ZERO,
                    score: 0.0,
                    confidence: 1.0,
                    fallback: false,
                };
                n_tiles
            ],
        }
    }

    #[inline]
    pub fn vector(&self, tile: usize) -> MotionVector {
        self.tiles[tile].vector
    }

    pub fn low_confidence_count(&self) -> usize {
        self.tiles.iter().filter(|t| t.fallback).count()
    }

    pub fn mean_confidence(&self) -> f32 {
        if self.tiles.is_empty() {
            return 0.0;
        }

        self.tiles.iter().map(|t| t.confidence).sum::<f32>() / self.tiles.len() as f32
    }
}

/// Output of one alignment pass. Tiles skipped because of cancellation are `None`.
#[derive(Debug, Clone)]
pub struct AlignmentPass {
    pub global: (i32, i32),
    pub global_vector: MotionVector,
    pub tiles: Vec<Option<TileAlignment>>,
}

impl AlignmentPass {
    /// Turn the pass into a frame alignment, or report the tiles without a vector.
    pub fn complete(self) -> Result<FrameAlignment, Vec<usize>> {
        let missing: Vec<usize> = self
            .tiles
            .iter()
            .enumerate()
            .filter_map(|(index, tile)| tile.is_none().then_some(index))
            .collect();

        if !missing.is_empty() {
            return Err(missing);
        }

        Ok(FrameAlignment {
            global: self.global,
            global_vector: self.global_vector,
            tiles: self.tiles.into_iter().flatten().collect(),
        })
    }
}

/// Downscaled copies of a guide image; level 0 is full resolution.
#[derive(Debug, Clone)]
pub struct Pyramid {
    levels: Vec<Array2<f32>>,
}

impl Pyramid {
    #[inline]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    #[inline]
    pub fn level(&self, level: usize) -> ArrayView2<'_, f32> {
        self.levels[level].view()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    Squared,
    Absolute,
}

impl Metric {
    #[inline]
    fn for_level(level: usize) -> Self {
        if level == 0 {
            Metric::Absolute
        } else {
            Metric::Squared
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Displacement {
    x: i32,
    y: i32,
}

impl Displacement {
    const ZERO: Displacement = Displacement { x: 0, y: 0 };

    #[inline]
    fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    #[inline]
    fn doubled(self) -> Self {
        Self::new(self.x * 2, self.y * 2)
    }

    #[inline]
    fn clamped(self, bound: i32) -> Self {
        Self::new(self.x.clamp(-bound, bound), self.y.clamp(-bound, bound))
    }

    #[inline]
    fn norm2(self) -> i32 {
        self.x * self.x + self.y * self.y
    }

    #[inline]
    fn distance2(self, other: Self) -> i32 {
        Self::new(self.x - other.x, self.y - other.y).norm2()
    }
}

/// Pixel rectangle a score is evaluated on, possibly reaching outside the image.
#[derive(Debug, Clone, Copy)]
struct Region {
    x: isize,
    y: isize,
    width: usize,
    height: usize,
    step: usize,
}

#[derive(Debug, Clone, Copy)]
struct SearchResult {
    best: Displacement,
    best_score: f32,
    mean_score: f32,
}

fn region_score(
    reference: &ArrayView2<'_, f32>,
    alternate: &ArrayView2<'_, f32>,
    region: Region,
    d: Displacement,
    metric: Metric,
) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;

    for y in (0..region.height).step_by(region.step) {
        let ry = region.y + y as isize;
        for x in (0..region.width).step_by(region.step) {
            let rx = region.x + x as isize;

            let diff = sample_clamped(reference, rx, ry)
                - sample_clamped(alternate, rx + d.x as isize, ry + d.y as isize);

            sum += match metric {
                Metric::Squared => (diff * diff) as f64,
                Metric::Absolute => diff.abs() as f64,
            };
            count += 1;
        }
    }

    (sum / count.max(1) as f64) as f32
}

/// Score every displacement within `radius` of `prior` whose components stay within `bound`.
///
/// Equal scores prefer the candidate closer to the prior, then the smaller displacement.
fn search<F>(score: F, prior: Displacement, radius: i32, bound: i32) -> SearchResult
where
    F: Fn(Displacement) -> f32,
{
    let mut best = prior.clamped(bound);
    let mut best_score = f32::INFINITY;
    let mut total = 0.0f64;
    let mut count = 0usize;

    for oy in -radius..=radius {
        for ox in -radius..=radius {
            let d = Displacement::new(prior.x + ox, prior.y + oy);
            if d.x.abs() > bound || d.y.abs() > bound {
                continue;
            }

            let s = score(d);
            total += s as f64;
            count += 1;

            let better = s < best_score
                || (s == best_score
                    && (d.distance2(prior), d.norm2()) < (best.distance2(prior), best.norm2()));

            if better {
                best = d;
                best_score = s;
            }
        }
    }

    if count == 0 {
        best_score = score(best);
        total = best_score as f64;
        count = 1;
    }

    SearchResult {
        best,
        best_score,
        mean_score: (total / count as f64) as f32,
    }
}

/// Refine an integer minimum with an independent parabola fit along each axis.
fn subpixel<F>(score: F, best: Displacement, bound: i32) -> MotionVector
where
    F: Fn(Displacement) -> f32,
{
    let center = score(best);
    let bound = bound as f32;

    // exact match
    if center <= SCORE_EPSILON {
        return MotionVector::new(
            (best.x as f32).clamp(-bound, bound),
            (best.y as f32).clamp(-bound, bound),
        );
    }

    let vertex = |minus: Displacement, plus: Displacement| {
        let l = score(minus);
        let r = score(plus);
        let denom = l + r - 2.0 * center;

        if denom > SCORE_EPSILON {
            (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        }
    };

    let ox = vertex(
        Displacement::new(best.x - 1, best.y),
        Displacement::new(best.x + 1, best.y),
    );
    let oy = vertex(
        Displacement::new(best.x, best.y - 1),
        Displacement::new(best.x, best.y + 1),
    );

    MotionVector::new(
        (best.x as f32 + ox).clamp(-bound, bound),
        (best.y as f32 + oy).clamp(-bound, bound),
    )
}

/// Tile footprint on a pyramid level, centred on the tile.
fn tile_region(tile: &Tile, level: usize) -> Region {
    let size = (tile.size >> level).max(MIN_LEVEL_TILE_SIZE.min(tile.size));
    let cx = ((2 * tile.x + tile.size) >> (level + 1)) as isize;
    let cy = ((2 * tile.y + tile.size) >> (level + 1)) as isize;

    Region {
        x: cx - (size / 2) as isize,
        y: cy - (size / 2) as isize,
        width: size,
        height: size,
        step: 1,
    }
}

/// Whole-image footprint that keeps `margin` pixels away from the border where possible.
fn interior_region(image: &ArrayView2<'_, f32>, margin: usize) -> Region {
    let (height, width) = image.dim();
    let (x, w) = if width > 2 * margin {
        (margin, width - 2 * margin)
    } else {
        (0, width)
    };
    let (y, h) = if height > 2 * margin {
        (margin, height - 2 * margin)
    } else {
        (0, height)
    };

    let step = ((w * h) as f64 / GLOBAL_SAMPLE_BUDGET as f64).sqrt().ceil().max(1.0) as usize;

    Region {
        x: x as isize,
        y: y as isize,
        width: w,
        height: h,
        step,
    }
}

#[derive(Debug, Clone)]
pub struct Aligner {
    levels: usize,
    max_radius: usize,
    refine_radius: i32,
    rejection_threshold: f32,
    min_contrast: f32,
}

impl Aligner {
    pub fn new(config: &MergeConfig) -> Self {
        Self {
            levels: config.pyramid_levels.max(1),
            max_radius: config.max_search_radius,
            refine_radius: config.refine_radius.max(1) as i32,
            rejection_threshold: config.rejection_threshold,
            min_contrast: config.min_match_contrast,
        }
    }

    /// Number of levels a frame of this size supports, at most the configured count.
    fn effective_levels(&self, width: usize, height: usize) -> usize {
        let mut levels = 1;
        let mut short_side = width.min(height);

        while levels < self.levels && short_side.div_ceil(2) >= MIN_COARSE_EXTENT {
            short_side = short_side.div_ceil(2);
            levels += 1;
        }

        levels
    }

    pub fn build_pyramid(&self, guide: Array2<f32>) -> Pyramid {
        let levels = self.effective_levels(guide.ncols(), guide.nrows());

        let mut pyramid = Vec::with_capacity(levels);
        pyramid.push(guide);

        while pyramid.len() < levels {
            let next = avg_pool(pyramid[pyramid.len() - 1].view());
            pyramid.push(next);
        }

        Pyramid { levels: pyramid }
    }

    /// Largest displacement per axis allowed on `level`.
    #[inline]
    fn bound_at(&self, level: usize) -> i32 {
        self.max_radius.div_ceil(1 << level) as i32
    }

    /// Align `alternate` to `reference` for every tile of `grid`.
    ///
    /// Both pyramids must come from frames of the grid's size. Tiles are processed in
    /// parallel; once `cancel` fires, tiles not yet started are left out.
    pub fn align(
        &self,
        reference: &Pyramid,
        alternate: &Pyramid,
        grid: &TileGrid,
        cancel: &CancellationToken,
    ) -> AlignmentPass {
        let levels = reference.len().min(alternate.len()).max(1);
        let (global_levels, global_vector) = self.estimate_global(reference, alternate, levels);
        let global = global_levels[0];

        let mut previous: Option<Vec<Option<Displacement>>> = None;

        for level in (1..levels).rev() {
            let ref_level = reference.level(level);
            let alt_level = alternate.level(level);
            let bound = self.bound_at(level);
            let metric = Metric::for_level(level);

            let vectors: Vec<Option<Displacement>> = (0..grid.len())
                .into_par_iter()
                .map(|index| {
                    if cancel.is_cancelled() {
                        return None;
                    }

                    let tile = grid.tile(index);
                    let region = tile_region(&tile, level);
                    let score =
                        |d: Displacement| region_score(&ref_level, &alt_level, region, d, metric);

                    let (prior, radius) = match &previous {
                        None => (Displacement::ZERO, bound),
                        Some(prev) => (
                            select_prior(&score, grid, &tile, prev, global_levels[level], bound)?,
                            self.refine_radius,
                        ),
                    };

                    Some(search(score, prior, radius, bound).best)
                })
                .collect();

            previous = Some(vectors);
        }

        let ref_level = reference.level(0);
        let alt_level = alternate.level(0);
        let bound = self.bound_at(0);

        let tiles: Vec<Option<TileAlignment>> = (0..grid.len())
            .into_par_iter()
            .map(|index| {
                if cancel.is_cancelled() {
                    return None;
                }

                let tile = grid.tile(index);
                let region = tile_region(&tile, 0);
                let score = |d: Displacement| {
                    region_score(&ref_level, &alt_level, region, d, Metric::Absolute)
                };

                let (prior, radius) = match &previous {
                    None => (Displacement::ZERO, bound),
                    Some(prev) => (
                        select_prior(&score, grid, &tile, prev, global, bound)?,
                        self.refine_radius,
                    ),
                };

                let result = search(&score, prior, radius, bound);
                let confidence = if result.mean_score > SCORE_EPSILON {
                    ((result.mean_score - result.best_score) / result.mean_score).clamp(0.0, 1.0)
                } else {
                    0.0
                };

                if result.best_score > self.rejection_threshold || confidence < self.min_contrast {
                    return Some(TileAlignment {
                        vector: global_vector,
                        score: result.best_score,
                        confidence,
                        fallback: true,
                    });
                }

                let vector = subpixel(
                    |d| region_score(&ref_level, &alt_level, region, d, Metric::Squared),
                    result.best,
                    bound,
                );

                Some(TileAlignment {
                    vector,
                    score: result.best_score,
                    confidence,
                    fallback: false,
                })
            })
            .collect();

        AlignmentPass {
            global: (global.x, global.y),
            global_vector,
            tiles,
        }
    }

    /// Whole-frame displacement per level (index = level) and its sub-pixel refinement.
    fn estimate_global(
        &self,
        reference: &Pyramid,
        alternate: &Pyramid,
        levels: usize,
    ) -> (Vec<Displacement>, MotionVector) {
        let mut per_level = vec![Displacement::ZERO; levels];
        let coarsest = levels - 1;

        let mut best = Displacement::ZERO;
        for level in (0..levels).rev() {
            let ref_level = reference.level(level);
            let alt_level = alternate.level(level);
            let bound = self.bound_at(level);
            let region = interior_region(&ref_level, bound as usize);

            let score =
                |d: Displacement| region_score(&ref_level, &alt_level, region, d, Metric::Squared);

            best = if level == coarsest {
                search(score, Displacement::ZERO, bound, bound).best
            } else {
                search(score, best.doubled().clamped(bound), self.refine_radius, bound).best
            };
            per_level[level] = best;
        }

        let ref_level = reference.level(0);
        let alt_level = alternate.level(0);
        let bound = self.bound_at(0);
        let region = interior_region(&ref_level, bound as usize);

        let vector = subpixel(
            |d| region_score(&ref_level, &alt_level, region, d, Metric::Squared),
            per_level[0],
            bound,
        );

        log::debug!(
            "global alignment ({}, {}) refined to ({:.2}, {:.2})",
            per_level[0].x,
            per_level[0].y,
            vector.dx,
            vector.dy
        );

        (per_level, vector)
    }
}

/// Pick the starting point for a finer level among the upsampled vectors of the tile and
/// its four neighbours and the global estimate. Comparing several candidates corrects
/// upsampling errors at the borders of moving objects.
fn select_prior<F>(
    score: &F,
    grid: &TileGrid,
    tile: &Tile,
    previous: &[Option<Displacement>],
    global: Displacement,
    bound: i32,
) -> Option<Displacement>
where
    F: Fn(Displacement) -> f32,
{
    let own = previous[tile.index]?.doubled().clamped(bound);

    let (col, row) = (tile.col as isize, tile.row as isize);
    let neighbours = [(col - 1, row), (col + 1, row), (col, row - 1), (col, row + 1)]
        .into_iter()
        .filter_map(|(c, r)| grid.index_of(c, r))
        .filter_map(|index| previous[index])
        .map(|d| d.doubled().clamped(bound));

    let mut best = own;
    let mut best_score = score(own);

    for candidate in neighbours.chain(std::iter::once(global.clamped(bound))) {
        if candidate == best {
            continue;
        }

        let s = score(candidate);
        if s < best_score {
            best = candidate;
            best_score = s;
        }
    }

    Some(best)
}

use crate::error::{MergeError, Result};
use crate::merge::kernel::InterpolationKernel;
use crate::merge::weighting::WeightingMode;

/// Default tile edge, shared by alignment and merging
const DEFAULT_TILE_SIZE: usize = 32;

/// Default overlap between neighbouring tiles
const DEFAULT_TILE_OVERLAP: usize = 16;

/// Default number of pyramid levels, full resolution included
const DEFAULT_PYRAMID_LEVELS: usize = 4;

/// Default search radius in full resolution pixels
const DEFAULT_MAX_SEARCH_RADIUS: usize = 32;

/// Default local search radius around a propagated estimate
const DEFAULT_REFINE_RADIUS: usize = 2;

/// Default mean absolute difference above which a tile match is rejected
const DEFAULT_REJECTION_THRESHOLD: f32 = 0.1;

/// Default relative score contrast below which a tile is considered textureless
const DEFAULT_MIN_MATCH_CONTRAST: f32 = 0.1;

/// Default noise tolerance factor of the pairwise weighting
const DEFAULT_NOISE_TOLERANCE: f32 = 4.0;

/// Default mismatch ratio above which a frame coefficient counts as an outlier
const DEFAULT_OUTLIER_THRESHOLD: f32 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileSize {
    Small = 16,
    Medium = 32,
    Large = 64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDistance {
    Small = 16,
    Medium = 32,
    Large = 64,
}

/// Options recognized by a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    /// Tile edge in pixels, power of two recommended. Default: 32
    pub tile_size: usize,
    /// Overlap between neighbouring tiles, at most half the tile. Default: 16
    pub tile_overlap: usize,
    /// Pyramid levels including full resolution. Default: 4
    pub pyramid_levels: usize,
    /// Largest displacement per axis at full resolution. Default: 32
    pub max_search_radius: usize,
    /// Local search radius around a propagated estimate. Default: 2
    pub refine_radius: usize,
    /// Mean absolute difference above which a tile falls back to the global vector. Default: 0.1
    pub rejection_threshold: f32,
    /// Relative score contrast below which a tile falls back to the global vector. Default: 0.1
    pub min_match_contrast: f32,
    /// Worker threads, 0 uses every core. Default: 0
    pub worker_count: usize,
    /// Resampling kernel for sub-pixel displacement. Default: bicubic
    pub kernel: InterpolationKernel,
    /// Per-coefficient frame weighting. Default: Wiener
    pub weighting: WeightingMode,
    /// Multiplier on the expected mismatch variance of the pairwise weighting. Default: 4.0
    pub noise_tolerance: f32,
    /// Mismatch ratio above which a coefficient is attenuated as an outlier. Default: 16.0
    pub outlier_threshold: f32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            pyramid_levels: DEFAULT_PYRAMID_LEVELS,
            max_search_radius: DEFAULT_MAX_SEARCH_RADIUS,
            refine_radius: DEFAULT_REFINE_RADIUS,
            rejection_threshold: DEFAULT_REJECTION_THRESHOLD,
            min_match_contrast: DEFAULT_MIN_MATCH_CONTRAST,
            worker_count: 0,
            kernel: InterpolationKernel::default(),
            weighting: WeightingMode::default(),
            noise_tolerance: DEFAULT_NOISE_TOLERANCE,
            outlier_threshold: DEFAULT_OUTLIER_THRESHOLD,
        }
    }
}

impl MergeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset tile size with half overlap.
    pub fn with_tile_size(mut self, tile_size: TileSize) -> Self {
        self.tile_size = tile_size as usize;
        self.tile_overlap = self.tile_size / 2;
        self
    }

    pub fn with_search_distance(mut self, distance: SearchDistance) -> Self {
        self.max_search_radius = distance as usize;
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(MergeError::InvalidConfig(msg));

        if self.tile_size < 4 || self.tile_size % 2 != 0 {
            return invalid(format!(
                "tile_size must be even and >= 4, got {}",
                self.tile_size
            ));
        }
        if self.tile_overlap > self.tile_size / 2 {
            return invalid(format!(
                "tile_overlap must be <= tile_size / 2, got {}",
                self.tile_overlap
            ));
        }
        if self.pyramid_levels == 0 || self.pyramid_levels > 8 {
            return invalid(format!(
                "pyramid_levels must be in 1..=8, got {}",
                self.pyramid_levels
            ));
        }
        if self.refine_radius == 0 {
            return invalid("refine_radius must be > 0".to_string());
        }
        if !(self.rejection_threshold > 0.0) {
            return invalid("rejection_threshold must be > 0".to_string());
        }
        if !(0.0..1.0).contains(&self.min_match_contrast) {
            return invalid("min_match_contrast must be in [0, 1)".to_string());
        }
        if !(self.noise_tolerance > 0.0 && self.noise_tolerance.is_finite()) {
            return invalid("noise_tolerance must be > 0".to_string());
        }
        if !(self.outlier_threshold >= 1.0) {
            return invalid("outlier_threshold must be >= 1".to_string());
        }

        Ok(())
    }
}

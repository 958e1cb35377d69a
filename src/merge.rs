//! Frequency-domain merge of aligned tiles.

pub mod frequency;
pub mod kernel;
pub mod weighting;

pub use frequency::{FrequencyMerge, MergedTile, TilePlans};
pub use kernel::{Bicubic, InterpolationKernel, Kernel, Lanczos};
pub use weighting::{
    PairwiseWeighting, UniformWeighting, WeightingMode, WeightingStrategy, WienerWeighting,
};

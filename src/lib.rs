//! Burst photography merging.
//!
//! A burst of same-exposure captures is aligned tile by tile against a reference frame with a
//! coarse-to-fine pyramid search, then merged in the frequency domain with weights derived from
//! a sensor noise model. The merged frame has the reference's shape and a higher SNR than any
//! single capture.

pub mod align;
pub mod config;
pub mod denoise;
pub mod error;
pub mod image;
pub mod merge;
pub mod noise;
pub mod tile;

#[cfg(test)]
pub(crate) mod test_utils;

pub use align::{FrameAlignment, MotionVector, TileAlignment};
pub use config::{MergeConfig, SearchDistance, TileSize};
pub use denoise::{
    AlignmentReport, CancellationToken, Denoise, FrameReport, MergeOutcome, MergeProgress,
    MergeResult, MergeStage, MergeWarning,
};
pub use error::{MergeError, NoiseProfileError, Result};
pub use image::{Frame, MergedFrame};
pub use noise::{NoiseFunction, NoiseModel, NoiseProfile, NoiseSource};

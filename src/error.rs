#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("a burst needs at least two frames, got {0}")]
    LessThanTwoImages(usize),

    #[error("frame {index} is {got_width}x{got_height}, reference is {width}x{height}")]
    InconsistentResolutions {
        index: usize,
        width: usize,
        height: usize,
        got_width: usize,
        got_height: usize,
    },

    #[error("frame {index} has {got} planes, reference has {expected}")]
    InconsistentPlaneCount {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("sample buffer holds {got} values, expected {expected}")]
    InvalidBufferLength { expected: usize, got: usize },

    #[error("frame has zero width, height or plane count")]
    EmptyFrame,

    #[error("frame contains non-finite samples")]
    NonFiniteSamples,

    #[error("black level {black} must be below white level {white}")]
    InvalidLevels { black: f32, white: f32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("a merge is already in flight on this instance")]
    MergeInProgress,

    #[error("alignment produced no vector for frame {frame}, tiles {tiles:?}")]
    MissingAlignment { frame: usize, tiles: Vec<usize> },

    #[error("tiles {0:?} produced no merged output")]
    MissingTiles(Vec<usize>),

    #[error("{0} output pixels received no window weight")]
    UncoveredPixels(usize),

    #[error("worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl MergeError {
    /// Burst shape errors, as opposed to configuration or internal failures.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            MergeError::LessThanTwoImages(_)
                | MergeError::InconsistentResolutions { .. }
                | MergeError::InconsistentPlaneCount { .. }
                | MergeError::InvalidBufferLength { .. }
                | MergeError::EmptyFrame
                | MergeError::NonFiniteSamples
                | MergeError::InvalidLevels { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NoiseProfileError {
    #[error("noise profile has no functions")]
    Empty,

    #[error("noise function {index} is invalid (scale {scale}, offset {offset})")]
    InvalidFunction { index: usize, scale: f32, offset: f32 },

    #[error("noise profile has {functions} functions for {planes} planes")]
    PlaneCountMismatch { functions: usize, planes: usize },

    #[error("too few usable samples to estimate noise")]
    InsufficientSamples,
}

pub type Result<T, E = MergeError> = std::result::Result<T, E>;

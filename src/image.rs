use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::error::{MergeError, Result};

/// One decoded capture of the burst: linear samples laid out as `(plane, row, col)`,
/// nominally normalized to `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    samples: Array3<f32>,
}

impl Frame {
    pub fn new(samples: Array3<f32>) -> Result<Self> {
        let (planes, height, width) = samples.dim();
        if planes == 0 || height == 0 || width == 0 {
            return Err(MergeError::EmptyFrame);
        }

        if samples.iter().any(|v| !v.is_finite()) {
            return Err(MergeError::NonFiniteSamples);
        }

        Ok(Self { samples })
    }

    /// Stack equally sized planes into a frame.
    pub fn from_planes(planes: &[Array2<f32>]) -> Result<Self> {
        let first = planes.first().ok_or(MergeError::EmptyFrame)?;
        let (height, width) = first.dim();

        let mut samples = Array3::zeros((planes.len(), height, width));
        for (index, plane) in planes.iter().enumerate() {
            if plane.dim() != (height, width) {
                return Err(MergeError::InconsistentResolutions {
                    index,
                    width,
                    height,
                    got_width: plane.ncols(),
                    got_height: plane.nrows(),
                });
            }

            samples.index_axis_mut(Axis(0), index).assign(plane);
        }

        Self::new(samples)
    }

    /// Build a frame from a planar buffer of sensor values.
    ///
    /// Values are normalized as `(v - black_level) / (white_level - black_level)`. Values
    /// below the black level stay negative; clipping happens only on output.
    pub fn from_u16_samples(
        samples: &[u16],
        width: usize,
        height: usize,
        plane_count: usize,
        black_level: f32,
        white_level: f32,
    ) -> Result<Self> {
        let range = level_range(black_level, white_level)?;

        let expected = width * height * plane_count;
        if samples.len() != expected {
            return Err(MergeError::InvalidBufferLength {
                expected,
                got: samples.len(),
            });
        }

        let data = samples
            .iter()
            .map(|&v| (v as f32 - black_level) / range)
            .collect();

        let samples = Array3::from_shape_vec((plane_count, height, width), data).map_err(|_| {
            MergeError::InvalidBufferLength {
                expected,
                got: samples.len(),
            }
        })?;

        Self::new(samples)
    }

    /// Same as [`Frame::from_u16_samples`] for a native-endian byte buffer.
    pub fn from_ne_bytes(
        bytes: &[u8],
        width: usize,
        height: usize,
        plane_count: usize,
        black_level: f32,
        white_level: f32,
    ) -> Result<Self> {
        if bytes.len() % 2 != 0 {
            return Err(MergeError::InvalidBufferLength {
                expected: width * height * plane_count * 2,
                got: bytes.len(),
            });
        }

        match bytemuck::try_cast_slice::<u8, u16>(bytes) {
            Ok(samples) => Self::from_u16_samples(
                samples,
                width,
                height,
                plane_count,
                black_level,
                white_level,
            ),
            // unaligned input, fall back to a copying read
            Err(_) => {
                let samples: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(bytemuck::pod_read_unaligned::<u16>)
                    .collect();

                Self::from_u16_samples(
                    &samples,
                    width,
                    height,
                    plane_count,
                    black_level,
                    white_level,
                )
            }
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.samples.dim().2
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.samples.dim().1
    }

    #[inline]
    pub fn plane_count(&self) -> usize {
        self.samples.dim().0
    }

    #[inline]
    pub fn plane(&self, plane: usize) -> ArrayView2<'_, f32> {
        self.samples.index_axis(Axis(0), plane)
    }

    #[inline]
    pub fn samples(&self) -> ArrayView3<'_, f32> {
        self.samples.view()
    }

    /// Per-pixel mean over all planes, used as the single-channel image for alignment.
    pub fn guide(&self) -> Array2<f32> {
        self.samples
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array2::zeros((self.height(), self.width())))
    }
}

/// The fused result of a burst, with the reference frame's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedFrame {
    samples: Array3<f32>,
}

impl MergedFrame {
    pub(crate) fn new(samples: Array3<f32>) -> Self {
        Self { samples }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.samples.dim().2
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.samples.dim().1
    }

    #[inline]
    pub fn plane_count(&self) -> usize {
        self.samples.dim().0
    }

    #[inline]
    pub fn plane(&self, plane: usize) -> ArrayView2<'_, f32> {
        self.samples.index_axis(Axis(0), plane)
    }

    #[inline]
    pub fn samples(&self) -> ArrayView3<'_, f32> {
        self.samples.view()
    }

    pub fn into_samples(self) -> Array3<f32> {
        self.samples
    }

    /// Reuse the merged result as an input frame, e.g. for a second pass.
    pub fn into_frame(self) -> Frame {
        Frame {
            samples: self.samples,
        }
    }

    /// Convert back to sensor units, planar layout.
    pub fn to_u16_samples(&self, black_level: f32, white_level: f32) -> Result<Vec<u16>> {
        let range = level_range(black_level, white_level)?;

        Ok(self
            .samples
            .iter()
            .map(|&v| (v * range + black_level + 0.5).clamp(0.0, u16::MAX as f32) as u16)
            .collect())
    }

    /// Native-endian bytes of [`MergedFrame::to_u16_samples`].
    pub fn to_ne_bytes(&self, black_level: f32, white_level: f32) -> Result<Vec<u8>> {
        let samples = self.to_u16_samples(black_level, white_level)?;
        Ok(bytemuck::cast_slice(&samples).to_vec())
    }
}

fn level_range(black_level: f32, white_level: f32) -> Result<f32> {
    if !(black_level.is_finite() && white_level.is_finite() && white_level > black_level) {
        return Err(MergeError::InvalidLevels {
            black: black_level,
            white: white_level,
        });
    }

    Ok(white_level - black_level)
}

/// Read a sample, replicating the border for coordinates outside the image.
#[inline]
pub(crate) fn sample_clamped(image: &ArrayView2<'_, f32>, x: isize, y: isize) -> f32 {
    let (height, width) = image.dim();
    let xc = x.clamp(0, width as isize - 1) as usize;
    let yc = y.clamp(0, height as isize - 1) as usize;
    image[[yc, xc]]
}

/// Downscale by two with a 2x2 box filter. Odd trailing rows and columns are replicated.
pub(crate) fn avg_pool(image: ArrayView2<'_, f32>) -> Array2<f32> {
    let (height, width) = image.dim();
    let out_height = height.div_ceil(2);
    let out_width = width.div_ceil(2);

    Array2::from_shape_fn((out_height, out_width), |(y, x)| {
        let sx = 2 * x as isize;
        let sy = 2 * y as isize;

        0.25 * (sample_clamped(&image, sx, sy)
            + sample_clamped(&image, sx + 1, sy)
            + sample_clamped(&image, sx, sy + 1)
            + sample_clamped(&image, sx + 1, sy + 1))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_and_non_finite() {
        assert!(matches!(
            Frame::new(Array3::zeros((1, 0, 4))),
            Err(MergeError::EmptyFrame)
        ));

        let mut samples = Array3::zeros((1, 2, 2));
        samples[[0, 1, 1]] = f32::NAN;
        assert!(matches!(
            Frame::new(samples),
            Err(MergeError::NonFiniteSamples)
        ));
    }

    #[test]
    fn test_from_planes_checks_shapes() {
        let planes = [Array2::zeros((4, 4)), Array2::zeros((4, 5))];
        let err = Frame::from_planes(&planes).unwrap_err();

        assert!(matches!(
            err,
            MergeError::InconsistentResolutions { index: 1, got_width: 5, .. }
        ));
    }

    #[test]
    fn test_u16_samples_are_normalized_by_levels() {
        let samples = [64u16, 576, 1088, 64, 576, 1088];
        let frame = Frame::from_u16_samples(&samples, 3, 1, 2, 64.0, 1088.0).unwrap();

        assert_eq!(frame.plane_count(), 2);
        assert_eq!(frame.plane(1)[[0, 0]], 0.0);
        assert!((frame.plane(0)[[0, 1]] - 0.5).abs() < 1e-6);
        assert_eq!(frame.plane(0)[[0, 2]], 1.0);
    }

    #[test]
    fn test_buffer_length_mismatch() {
        let err = Frame::from_u16_samples(&[0u16; 5], 3, 2, 1, 0.0, 1.0).unwrap_err();
        assert!(matches!(
            err,
            MergeError::InvalidBufferLength { expected: 6, got: 5 }
        ));

        let err = Frame::from_ne_bytes(&[0u8; 7], 2, 2, 1, 0.0, 1.0).unwrap_err();
        assert!(matches!(err, MergeError::InvalidBufferLength { .. }));
    }

    #[test]
    fn test_invalid_levels() {
        let err = Frame::from_u16_samples(&[0u16; 4], 2, 2, 1, 100.0, 100.0).unwrap_err();
        assert!(matches!(err, MergeError::InvalidLevels { .. }));
    }

    #[test]
    fn test_ne_bytes_handles_unaligned_input() {
        let samples = [0u16, 1000, 2000, 4000];
        let bytes: &[u8] = bytemuck::cast_slice(&samples);

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(bytes);

        let frame = Frame::from_ne_bytes(&shifted[1..], 2, 2, 1, 0.0, 4000.0).unwrap();
        assert!((frame.plane(0)[[0, 1]] - 0.25).abs() < 1e-6);
        assert!((frame.plane(0)[[1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_merged_frame_to_u16_clips() {
        let samples = Array3::from_shape_vec((1, 1, 3), vec![-0.2, 0.5, 1.3]).unwrap();
        let merged = MergedFrame::new(samples);

        assert_eq!(merged.to_u16_samples(0.0, 1000.0).unwrap(), vec![0, 500, 1300]);
        assert_eq!(
            merged.to_u16_samples(0.0, 65535.0).unwrap(),
            vec![0, 32768, 65535]
        );
    }

    #[test]
    fn test_guide_averages_planes() {
        let planes = [
            Array2::from_elem((2, 2), 0.2),
            Array2::from_elem((2, 2), 0.6),
        ];
        let frame = Frame::from_planes(&planes).unwrap();

        assert!(frame.guide().iter().all(|&v| (v - 0.4).abs() < 1e-6));
    }

    #[test]
    fn test_avg_pool_odd_size() {
        let image = Array2::from_shape_fn((3, 3), |(y, x)| (y * 3 + x) as f32);
        let pooled = avg_pool(image.view());

        assert_eq!(pooled.dim(), (2, 2));
        assert_eq!(pooled[[0, 0]], (0.0 + 1.0 + 3.0 + 4.0) / 4.0);
        // bottom-right block replicates the last row and column
        assert_eq!(pooled[[1, 1]], 8.0);
    }

    #[test]
    fn test_sample_clamped_replicates_edges() {
        let image = Array2::from_shape_fn((2, 3), |(y, x)| (y * 3 + x) as f32);
        let view = image.view();

        assert_eq!(sample_clamped(&view, -4, 0), 0.0);
        assert_eq!(sample_clamped(&view, 10, 1), 5.0);
        assert_eq!(sample_clamped(&view, 1, -1), 1.0);
    }
}

//! Per-coefficient frame weights.

use rustfft::num_complex::Complex32;

/// Decides how much an aligned alternate coefficient contributes to the merged coefficient.
pub trait WeightingStrategy: Send + Sync {
    /// Weight in `[0, 1]` for `alternate` given the matching `reference` coefficient and the
    /// expected noise power of a single frame at this coefficient.
    fn weight(&self, reference: Complex32, alternate: Complex32, noise_variance: f32) -> f32;

    /// Baseline weight of the reference coefficient.
    fn reference_weight(&self) -> f32 {
        1.0
    }
}

/// Wiener weighting from the reference's spectrum.
///
/// The signal power of a coefficient is estimated as `S = |R|^2`, and an alternate gets
/// `S / (S + N)`. On top of that, an alternate whose difference to the reference is far above
/// the expected `2N` of two noisy observations is attenuated by `(threshold / ratio)^2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WienerWeighting {
    /// Mismatch ratio `|R - A|^2 / 2N` from which a coefficient counts as an outlier.
    pub outlier_threshold: f32,
}

impl WienerWeighting {
    pub fn new(outlier_threshold: f32) -> Self {
        Self { outlier_threshold }
    }
}

impl WeightingStrategy for WienerWeighting {
    fn weight(&self, reference: Complex32, alternate: Complex32, noise_variance: f32) -> f32 {
        let mismatch = (reference - alternate).norm_sqr();
        let expected = 2.0 * noise_variance;

        if !(expected > 0.0) {
            // noiseless coefficient, only identical values may blend
            return if mismatch == 0.0 { 1.0 } else { 0.0 };
        }

        let signal = reference.norm_sqr();
        let mut weight = signal / (signal + noise_variance);

        attenuate_outlier(&mut weight, mismatch / expected, self.outlier_threshold);
        finite_weight(weight)
    }
}

/// Pairwise Wiener shrinkage towards the reference.
///
/// The difference `d = R - A` of two noisy observations of the same coefficient has expected
/// power `2 * N`; the frame is shrunk towards the reference by `|d|^2 / (|d|^2 + c * 2N)`,
/// i.e. the weight is the complement of the classic `d^2 / (d^2 + n)` term of HDR+.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairwiseWeighting {
    /// Multiplier `c` on the expected mismatch power.
    pub tolerance: f32,
    /// Mismatch ratio `|d|^2 / 2N` from which a coefficient counts as an outlier.
    pub outlier_threshold: f32,
}

impl PairwiseWeighting {
    pub fn new(tolerance: f32, outlier_threshold: f32) -> Self {
        Self {
            tolerance,
            outlier_threshold,
        }
    }
}

impl WeightingStrategy for PairwiseWeighting {
    fn weight(&self, reference: Complex32, alternate: Complex32, noise_variance: f32) -> f32 {
        let mismatch = (reference - alternate).norm_sqr();
        let expected = 2.0 * noise_variance;

        if !(expected > 0.0) {
            return if mismatch == 0.0 { 1.0 } else { 0.0 };
        }

        let shrink = mismatch / (mismatch + self.tolerance * expected);
        let mut weight = 1.0 - shrink;

        attenuate_outlier(&mut weight, mismatch / expected, self.outlier_threshold);
        finite_weight(weight)
    }
}

#[inline]
fn attenuate_outlier(weight: &mut f32, ratio: f32, threshold: f32) {
    if ratio > threshold {
        *weight *= (threshold / ratio).powi(2);
    }
}

#[inline]
fn finite_weight(weight: f32) -> f32 {
    if weight.is_finite() {
        weight.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Every frame counts the same.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformWeighting;

impl WeightingStrategy for UniformWeighting {
    #[inline]
    fn weight(&self, _reference: Complex32, _alternate: Complex32, _noise_variance: f32) -> f32 {
        1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightingMode {
    #[default]
    Wiener,
    Pairwise,
    Uniform,
}

impl WeightingMode {
    /// `tolerance` only affects [`WeightingMode::Pairwise`].
    pub fn build(self, tolerance: f32, outlier_threshold: f32) -> Box<dyn WeightingStrategy> {
        match self {
            WeightingMode::Wiener => Box::new(WienerWeighting::new(outlier_threshold)),
            WeightingMode::Pairwise => {
                Box::new(PairwiseWeighting::new(tolerance, outlier_threshold))
            }
            WeightingMode::Uniform => Box::new(UniformWeighting),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_coefficients_blend_without_change() {
        let wiener = WienerWeighting::new(16.0);
        let c = Complex32::new(3.0, -1.0);

        // S = 10, N = 0.5
        assert!((wiener.weight(c, c, 0.5) - 10.0 / 10.5).abs() < 1e-6);
        assert_eq!(wiener.weight(c, c, 0.0), 1.0);
        assert_eq!(wiener.reference_weight(), 1.0);
    }

    #[test]
    fn test_wiener_weight_follows_reference_power() {
        let wiener = WienerWeighting::new(16.0);
        let a = Complex32::new(0.5, 0.0);

        // reference power equal to the noise gives one half
        let w = wiener.weight(Complex32::new(1.0, 0.0), a, 1.0);
        assert!((w - 0.5).abs() < 1e-6);

        let strong = wiener.weight(Complex32::new(3.0, 0.0), Complex32::new(2.5, 0.0), 1.0);
        assert!((strong - 0.9).abs() < 1e-6);

        assert_eq!(wiener.weight(Complex32::new(0.0, 0.0), a, 1.0), 0.0);
    }

    #[test]
    fn test_wiener_outliers_are_attenuated() {
        let wiener = WienerWeighting::new(16.0);
        let plain = WienerWeighting::new(f32::INFINITY);

        // mismatch ratio 64, four times the threshold
        let r = Complex32::new(4.0, 0.0);
        let a = r + Complex32::new(128.0f32.sqrt(), 0.0);

        let attenuated = wiener.weight(r, a, 1.0);
        let expected = plain.weight(r, a, 1.0) / 16.0;
        assert!((attenuated - expected).abs() < 1e-6);
        assert!((plain.weight(r, a, 1.0) - 16.0 / 17.0).abs() < 1e-6);
    }

    #[test]
    fn test_pairwise_weight_falls_with_mismatch() {
        let pairwise = PairwiseWeighting::new(4.0, 16.0);
        let r = Complex32::new(10.0, 0.0);

        assert_eq!(pairwise.weight(r, r, 1.0), 1.0);

        let mut last = 1.0;
        for d in [0.5f32, 1.0, 2.0, 4.0, 8.0, 16.0] {
            let w = pairwise.weight(r, r + Complex32::new(d, 0.0), 1.0);
            assert!((0.0..=1.0).contains(&w));
            assert!(w < last, "weight should fall with mismatch, {w} at {d}");
            last = w;
        }
    }

    #[test]
    fn test_pairwise_noise_level_mismatch_is_mostly_kept() {
        let pairwise = WeightingMode::Pairwise.build(4.0, 16.0);
        // mismatch power equal to the expected 2N
        let w = pairwise.weight(
            Complex32::new(0.0, 0.0),
            Complex32::new(2.0f32.sqrt(), 0.0),
            1.0,
        );

        assert!((w - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_noiseless_mismatch_is_rejected() {
        let r = Complex32::new(1.0, 0.0);
        let a = Complex32::new(1.5, 0.0);

        assert_eq!(WienerWeighting::new(16.0).weight(r, a, 0.0), 0.0);
        assert_eq!(PairwiseWeighting::new(4.0, 16.0).weight(r, a, 0.0), 0.0);
    }

    #[test]
    fn test_uniform_weighting() {
        let uniform = WeightingMode::Uniform.build(4.0, 16.0);
        let w = uniform.weight(Complex32::new(1.0, 0.0), Complex32::new(-50.0, 3.0), 0.1);

        assert_eq!(w, 1.0);
        assert_eq!(uniform.reference_weight(), 1.0);
    }
}

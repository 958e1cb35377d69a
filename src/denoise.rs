use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ndarray::{s, Array2, Array3, Axis};
use rayon::prelude::*;

use crate::align::{Aligner, FrameAlignment, MotionVector};
use crate::config::MergeConfig;
use crate::error::{MergeError, NoiseProfileError, Result};
use crate::image::{Frame, MergedFrame};
use crate::merge::frequency::{FrequencyMerge, MergedTile};
use crate::noise::{NoiseModel, NoiseSource};
use crate::tile::TileGrid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStage {
    #[default]
    Idle,
    Aligning,
    Merging,
    Normalizing,
    Done,
    Failed,
}

/// Cooperative cancellation flag shared between the caller and a running merge.
///
/// Checked between tiles, never inside one.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Recoverable conditions met during a merge.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeWarning {
    #[error("noise profile rejected, frames weighted uniformly: {0}")]
    InvalidNoiseProfile(NoiseProfileError),

    #[error("frame {frame}: {count} tiles fell back to the global vector")]
    LowConfidenceTiles { frame: usize, count: usize },

    #[error("{count} coefficients kept the reference value after all weights collapsed")]
    DegenerateWeights { count: usize },
}

/// Events published on the progress channel.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeProgress {
    Stage(MergeStage),
    FrameAligned { frame: usize, low_confidence: usize },
    TileMerged { done: usize, total: usize },
    Warning(MergeWarning),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame: usize,
    pub global_vector: MotionVector,
    pub low_confidence_tiles: usize,
    pub mean_confidence: f32,
}

/// Diagnostics of a completed merge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AlignmentReport {
    /// One entry per alternate frame.
    pub frames: Vec<FrameReport>,
    pub degenerate_coefficients: usize,
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub frame: MergedFrame,
    /// Per frame alignment, index 0 is the reference.
    pub alignments: Vec<FrameAlignment>,
    pub report: AlignmentReport,
    pub warnings: Vec<MergeWarning>,
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Completed(MergeResult),
    Cancelled,
}

impl MergeOutcome {
    pub fn completed(self) -> Option<MergeResult> {
        match self {
            MergeOutcome::Completed(result) => Some(result),
            MergeOutcome::Cancelled => None,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MergeOutcome::Cancelled)
    }
}

/// Marks the orchestrator busy for the lifetime of one merge.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MergeError::MergeInProgress)?;

        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Burst merge orchestrator: aligns every alternate to the reference, merges tiles in the
/// frequency domain and reassembles the output.
pub struct Denoise {
    config: MergeConfig,
    pool: rayon::ThreadPool,
    busy: AtomicBool,
    stage: Mutex<MergeStage>,
    progress: Option<flume::Sender<MergeProgress>>,
}

impl Denoise {
    pub fn new(config: MergeConfig) -> Result<Self> {
        config.validate()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count)
            .thread_name(|i| format!("burst-merge-{i}"))
            .build()?;

        Ok(Self {
            config,
            pool,
            busy: AtomicBool::new(false),
            stage: Mutex::new(MergeStage::Idle),
            progress: None,
        })
    }

    /// Publish progress events on `sender`. Events are dropped when the channel is full.
    pub fn with_progress(mut self, sender: flume::Sender<MergeProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    #[inline]
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn stage(&self) -> MergeStage {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn merge(
        &self,
        reference: &Frame,
        alternates: &[Frame],
        noise: NoiseSource,
    ) -> Result<MergeOutcome> {
        self.merge_cancellable(reference, alternates, noise, &CancellationToken::new())
    }

    /// Merge the burst, giving up between tiles once `cancel` fires.
    ///
    /// Only one merge runs per instance; a concurrent call fails with
    /// [`MergeError::MergeInProgress`] and leaves the running merge untouched.
    pub fn merge_cancellable(
        &self,
        reference: &Frame,
        alternates: &[Frame],
        noise: NoiseSource,
        cancel: &CancellationToken,
    ) -> Result<MergeOutcome> {
        let _guard = BusyGuard::acquire(&self.busy)?;
        self.set_stage(MergeStage::Idle);

        let outcome = self
            .pool
            .install(|| self.run(reference, alternates, noise, cancel));

        match &outcome {
            Ok(MergeOutcome::Completed(_)) => {}
            Ok(MergeOutcome::Cancelled) => {
                log::info!("merge cancelled, partial output discarded");
                self.set_stage(MergeStage::Idle);
            }
            Err(err) => {
                log::error!("merge failed: {err}");
                self.set_stage(MergeStage::Failed);
            }
        }

        outcome
    }

    fn run(
        &self,
        reference: &Frame,
        alternates: &[Frame],
        noise: NoiseSource,
        cancel: &CancellationToken,
    ) -> Result<MergeOutcome> {
        validate_burst(reference, alternates)?;

        let mut warnings = Vec::new();
        let (noise, noise_error) = NoiseModel::resolve(noise, reference);
        if let Some(err) = noise_error {
            self.warn(&mut warnings, MergeWarning::InvalidNoiseProfile(err));
        }

        let grid = TileGrid::new(
            reference.width(),
            reference.height(),
            self.config.tile_size,
            self.config.tile_overlap,
        )?;

        self.set_stage(MergeStage::Aligning);
        log::info!(
            "aligning {} frames of {}x{} on {} tiles",
            alternates.len(),
            reference.width(),
            reference.height(),
            grid.len()
        );

        let aligned = self.align_burst(reference, alternates, &grid, cancel, &mut warnings)?;
        let Some(alignments) = aligned else {
            return Ok(MergeOutcome::Cancelled);
        };

        self.set_stage(MergeStage::Merging);
        let merge = FrequencyMerge::new(&self.config, &grid, noise);
        if merge.noise().is_uniform() {
            log::info!("merging {} tiles with uniform weights", grid.len());
        } else {
            log::info!("merging {} tiles with noise-aware weights", grid.len());
        }

        let tiles = self.merge_tiles(&merge, &grid, reference, alternates, &alignments, cancel);
        if cancel.is_cancelled() {
            return Ok(MergeOutcome::Cancelled);
        }

        let missing: Vec<usize> = tiles
            .iter()
            .enumerate()
            .filter_map(|(index, tile)| tile.is_none().then_some(index))
            .collect();
        if !missing.is_empty() {
            return Err(MergeError::MissingTiles(missing));
        }

        self.set_stage(MergeStage::Normalizing);
        let (samples, degenerate) = overlap_add(&grid, reference.plane_count(), tiles)?;

        if degenerate > 0 {
            self.warn(&mut warnings, MergeWarning::DegenerateWeights { count: degenerate });
        }

        let report = AlignmentReport {
            frames: alignments
                .iter()
                .enumerate()
                .skip(1)
                .map(|(frame, alignment)| FrameReport {
                    frame,
                    global_vector: alignment.global_vector,
                    low_confidence_tiles: alignment.low_confidence_count(),
                    mean_confidence: alignment.mean_confidence(),
                })
                .collect(),
            degenerate_coefficients: degenerate,
        };

        self.set_stage(MergeStage::Done);
        log::info!("merged {} frames", alternates.len() + 1);

        Ok(MergeOutcome::Completed(MergeResult {
            frame: MergedFrame::new(samples),
            alignments,
            report,
            warnings,
        }))
    }

    /// Alignment of every frame, the reference first. `None` once cancelled.
    fn align_burst(
        &self,
        reference: &Frame,
        alternates: &[Frame],
        grid: &TileGrid,
        cancel: &CancellationToken,
        warnings: &mut Vec<MergeWarning>,
    ) -> Result<Option<Vec<FrameAlignment>>> {
        let aligner = Aligner::new(&self.config);
        let ref_pyramid = aligner.build_pyramid(reference.guide());

        let mut alignments = Vec::with_capacity(alternates.len() + 1);
        alignments.push(FrameAlignment::identity(grid.len()));

        for (frame, alternate) in (1..).zip(alternates) {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let pyramid = aligner.build_pyramid(alternate.guide());
            let pass = aligner.align(&ref_pyramid, &pyramid, grid, cancel);
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let alignment = pass
                .complete()
                .map_err(|tiles| MergeError::MissingAlignment { frame, tiles })?;

            let low_confidence = alignment.low_confidence_count();
            log::debug!(
                "frame {frame}: global ({:.2}, {:.2}), {low_confidence}/{} tiles on fallback",
                alignment.global_vector.dx,
                alignment.global_vector.dy,
                grid.len()
            );

            self.publish(MergeProgress::FrameAligned {
                frame,
                low_confidence,
            });
            if low_confidence > 0 {
                self.warn(
                    warnings,
                    MergeWarning::LowConfidenceTiles {
                        frame,
                        count: low_confidence,
                    },
                );
            }

            alignments.push(alignment);
        }

        Ok(Some(alignments))
    }

    /// Merge every tile in parallel into its own slot; skipped tiles stay `None`.
    fn merge_tiles(
        &self,
        merge: &FrequencyMerge,
        grid: &TileGrid,
        reference: &Frame,
        alternates: &[Frame],
        alignments: &[FrameAlignment],
        cancel: &CancellationToken,
    ) -> Vec<Option<MergedTile>> {
        let total = grid.len();
        let done = AtomicUsize::new(0);

        (0..total)
            .into_par_iter()
            .map(|index| {
                if cancel.is_cancelled() {
                    return None;
                }

                let inputs: Vec<(&Frame, MotionVector)> = alternates
                    .iter()
                    .zip(&alignments[1..])
                    .map(|(frame, alignment)| (frame, alignment.vector(index)))
                    .collect();

                let merged = merge.merge_tile(&grid.tile(index), reference, &inputs);

                let done = done.fetch_add(1, Ordering::Relaxed) + 1;
                self.publish(MergeProgress::TileMerged { done, total });

                Some(merged)
            })
            .collect()
    }

    fn set_stage(&self, stage: MergeStage) {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner()) = stage;
        log::debug!("merge stage: {stage:?}");
        self.publish(MergeProgress::Stage(stage));
    }

    fn warn(&self, warnings: &mut Vec<MergeWarning>, warning: MergeWarning) {
        log::warn!("{warning}");
        self.publish(MergeProgress::Warning(warning.clone()));
        warnings.push(warning);
    }

    fn publish(&self, event: MergeProgress) {
        if let Some(sender) = &self.progress {
            let _ = sender.try_send(event);
        }
    }
}

fn validate_burst(reference: &Frame, alternates: &[Frame]) -> Result<()> {
    if alternates.is_empty() {
        return Err(MergeError::LessThanTwoImages(alternates.len() + 1));
    }

    for (index, frame) in (1..).zip(alternates) {
        if frame.width() != reference.width() || frame.height() != reference.height() {
            return Err(MergeError::InconsistentResolutions {
                index,
                width: reference.width(),
                height: reference.height(),
                got_width: frame.width(),
                got_height: frame.height(),
            });
        }

        if frame.plane_count() != reference.plane_count() {
            return Err(MergeError::InconsistentPlaneCount {
                index,
                expected: reference.plane_count(),
                got: frame.plane_count(),
            });
        }
    }

    Ok(())
}

/// Sum the windowed tiles in tile order, divide by the summed window and clamp to `[0, 1]`.
///
/// Returns the samples and the total degenerate coefficient count.
fn overlap_add(
    grid: &TileGrid,
    plane_count: usize,
    tiles: Vec<Option<MergedTile>>,
) -> Result<(Array3<f32>, usize)> {
    let (width, height) = (grid.width(), grid.height());
    let size = grid.tile_size();

    let mut samples = Array3::<f32>::zeros((plane_count, height, width));
    let mut weights = Array2::<f32>::zeros((height, width));
    let mut degenerate = 0;

    for merged in tiles.into_iter().flatten() {
        let tile = grid.tile(merged.index);
        let window = grid.tile_window(&tile);
        // tiles of frames smaller than one tile are cropped
        let rows = size.min(height - tile.y);
        let cols = size.min(width - tile.x);

        let mut target = samples.slice_mut(s![.., tile.y..tile.y + rows, tile.x..tile.x + cols]);
        target += &merged.samples.slice(s![.., ..rows, ..cols]);

        let mut target = weights.slice_mut(s![tile.y..tile.y + rows, tile.x..tile.x + cols]);
        target += &window.slice(s![..rows, ..cols]);

        degenerate += merged.degenerate;
    }

    let uncovered = weights.iter().filter(|&&w| !(w > 0.0)).count();
    if uncovered > 0 {
        return Err(MergeError::UncoveredPixels(uncovered));
    }

    for mut plane in samples.axis_iter_mut(Axis(0)) {
        plane /= &weights;
    }
    samples.mapv_inplace(|v| v.clamp(0.0, 1.0));

    Ok((samples, degenerate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::NoiseFunction;
    use crate::test_utils::{gradient_circle_scene, render, snr, textured_scene};
    use ndarray::ArrayView2;
    use rand::prelude::*;

    fn test_config() -> MergeConfig {
        MergeConfig {
            max_search_radius: 16,
            ..Default::default()
        }
        .with_workers(2)
    }

    fn frame(plane: Array2<f32>) -> Frame {
        Frame::from_planes(&[plane]).unwrap()
    }

    fn noise(variance: f32) -> NoiseSource {
        NoiseSource::Profile(vec![NoiseFunction::new(1e-6, variance).unwrap()])
    }

    #[test]
    fn test_merge_with_itself_is_identity() {
        let _ = env_logger::builder().is_test(true).try_init();

        let denoise = Denoise::new(test_config()).unwrap();
        let reference = frame(render(96, 80, (0.0, 0.0), 0.0, 1, textured_scene));

        let result = denoise
            .merge(&reference, &[reference.clone()], noise(4e-4))
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(denoise.stage(), MergeStage::Done);
        assert_eq!(result.alignments.len(), 2);
        assert_eq!(result.report.degenerate_coefficients, 0);
        for (a, b) in result.frame.samples().iter().zip(reference.samples().iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_constant_frame_reconstructs_exactly() {
        let denoise = Denoise::new(test_config()).unwrap();
        let reference = Frame::new(Array3::from_elem((1, 70, 100), 0.3)).unwrap();
        let alternates = vec![reference.clone(), reference.clone()];

        let result = denoise
            .merge(&reference, &alternates, NoiseSource::Uniform)
            .unwrap()
            .completed()
            .unwrap();

        assert!(result.frame.samples().iter().all(|&v| (v - 0.3).abs() < 1e-5));
    }

    /// Noisy gradient burst with three sub-pixel shifted alternates: `(truth, reference, merged)`.
    fn merged_gradient_burst() -> (Array2<f32>, Frame, MergedFrame) {
        let (width, height, sigma) = (256, 256, 0.02);
        let mut rng = StdRng::seed_from_u64(42);

        let truth = render(width, height, (0.0, 0.0), 0.0, 0, gradient_circle_scene);
        let reference = frame(render(width, height, (0.0, 0.0), sigma, 1, gradient_circle_scene));

        let alternates: Vec<Frame> = (0..3)
            .map(|i| {
                let shift = (rng.random_range(-5.0..5.0), rng.random_range(-5.0..5.0));
                frame(render(width, height, shift, sigma, 2 + i, gradient_circle_scene))
            })
            .collect();

        let denoise = Denoise::new(test_config()).unwrap();
        let result = denoise
            .merge(&reference, &alternates, noise(sigma * sigma))
            .unwrap()
            .completed()
            .unwrap();

        (truth, reference, result.frame)
    }

    #[test]
    fn test_merge_improves_snr() {
        let _ = env_logger::builder().is_test(true).try_init();

        let (truth, reference, merged) = merged_gradient_burst();

        assert_eq!(merged.width(), 256);
        assert_eq!(merged.height(), 256);
        assert_eq!(merged.plane_count(), 1);

        let before = snr(reference.plane(0), truth.view(), 8);
        let after = snr(merged.plane(0), truth.view(), 8);
        assert!(after >= 1.3 * before, "SNR {before} -> {after}");
    }

    #[test]
    fn test_frame_border_is_not_amplified() {
        let (truth, reference, merged) = merged_gradient_burst();
        let (height, width) = truth.dim();

        let ring: Vec<(usize, usize)> = (0..width)
            .flat_map(|x| [(0, x), (height - 1, x)])
            .chain((1..height - 1).flat_map(|y| [(y, 0), (y, width - 1)]))
            .collect();

        let rmse = |plane: ArrayView2<'_, f32>| {
            let sum: f32 = ring.iter().map(|&p| (plane[p] - truth[p]).powi(2)).sum();
            (sum / ring.len() as f32).sqrt()
        };
        let max_error = ring
            .iter()
            .map(|&p| (merged.plane(0)[p] - truth[p]).abs())
            .fold(0.0f32, f32::max);

        let before = rmse(reference.plane(0));
        let after = rmse(merged.plane(0));
        assert!(after < before, "border rmse {before} -> {after}");
        assert!(max_error < 0.1, "border error up to {max_error}");

        for corner in [(0, 0), (0, width - 1), (height - 1, 0), (height - 1, width - 1)] {
            let error = (merged.plane(0)[corner] - truth[corner]).abs();
            assert!(error < 0.1, "corner {corner:?} off by {error}");
        }
    }

    #[test]
    fn test_result_does_not_depend_on_worker_count() {
        let reference = frame(render(128, 96, (0.0, 0.0), 0.02, 1, textured_scene));
        let alternates = vec![
            frame(render(128, 96, (2.5, -1.25), 0.02, 2, textured_scene)),
            frame(render(128, 96, (-3.0, 0.75), 0.02, 3, textured_scene)),
        ];

        let run = |workers| {
            let config = MergeConfig {
                max_search_radius: 16,
                ..Default::default()
            }
            .with_workers(workers);

            Denoise::new(config)
                .unwrap()
                .merge(&reference, &alternates, noise(4e-4))
                .unwrap()
                .completed()
                .unwrap()
        };

        let single = run(1);
        let pooled = run(4);

        assert_eq!(single.alignments, pooled.alignments);
        for (a, b) in single.frame.samples().iter().zip(pooled.frame.samples().iter()) {
            assert!((a - b).abs() <= 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_multi_plane_shape_is_preserved() {
        let denoise = Denoise::new(test_config()).unwrap();

        let planes = |shift, seed| {
            [
                render(72, 56, shift, 0.01, seed, textured_scene),
                render(72, 56, shift, 0.01, seed + 100, textured_scene),
                render(72, 56, shift, 0.01, seed + 200, textured_scene),
            ]
        };
        let reference = Frame::from_planes(&planes((0.0, 0.0), 1)).unwrap();
        let alternate = Frame::from_planes(&planes((1.5, -0.5), 2)).unwrap();

        let result = denoise
            .merge(&reference, &[alternate], noise(1e-4))
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(result.frame.samples().dim(), (3, 56, 72));
        assert!(result.frame.samples().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_frame_smaller_than_tile() {
        let denoise = Denoise::new(test_config()).unwrap();
        let reference = frame(render(20, 12, (0.0, 0.0), 0.0, 1, textured_scene));

        let result = denoise
            .merge(&reference, &[reference.clone()], NoiseSource::Uniform)
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(result.frame.samples().dim(), (1, 12, 20));
        for (a, b) in result.frame.samples().iter().zip(reference.samples().iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_invalid_bursts_are_rejected() {
        let denoise = Denoise::new(test_config()).unwrap();
        let reference = Frame::new(Array3::from_elem((1, 32, 32), 0.5)).unwrap();

        let err = denoise
            .merge(&reference, &[], NoiseSource::Uniform)
            .unwrap_err();
        assert!(matches!(err, MergeError::LessThanTwoImages(1)));
        assert!(err.is_invalid_input());
        assert_eq!(denoise.stage(), MergeStage::Failed);

        let wide = Frame::new(Array3::from_elem((1, 32, 40), 0.5)).unwrap();
        let err = denoise
            .merge(&reference, &[reference.clone(), wide], NoiseSource::Uniform)
            .unwrap_err();
        assert!(matches!(
            err,
            MergeError::InconsistentResolutions {
                index: 2,
                got_width: 40,
                ..
            }
        ));

        let two_planes = Frame::new(Array3::from_elem((2, 32, 32), 0.5)).unwrap();
        let err = denoise
            .merge(&reference, &[two_planes], NoiseSource::Uniform)
            .unwrap_err();
        assert!(matches!(
            err,
            MergeError::InconsistentPlaneCount {
                index: 1,
                expected: 1,
                got: 2
            }
        ));
    }

    #[test]
    fn test_invalid_noise_profile_falls_back_with_warning() {
        let denoise = Denoise::new(test_config()).unwrap();
        let reference = frame(render(64, 64, (0.0, 0.0), 0.01, 1, textured_scene));
        let alternate = frame(render(64, 64, (0.0, 0.0), 0.01, 2, textured_scene));

        let bad = NoiseSource::Profile(vec![NoiseFunction {
            scale: -1.0,
            offset: 0.0,
        }]);
        let result = denoise
            .merge(&reference, &[alternate], bad)
            .unwrap()
            .completed()
            .unwrap();

        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, MergeWarning::InvalidNoiseProfile(_))));
    }

    #[test]
    fn test_cancelled_merge_discards_output() {
        let denoise = Denoise::new(test_config()).unwrap();
        let reference = frame(render(64, 64, (0.0, 0.0), 0.0, 1, textured_scene));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = denoise
            .merge_cancellable(&reference, &[reference.clone()], NoiseSource::Uniform, &cancel)
            .unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(denoise.stage(), MergeStage::Idle);
    }

    #[test]
    fn test_concurrent_merge_is_rejected() {
        let denoise = Denoise::new(test_config()).unwrap();
        let reference = Frame::new(Array3::from_elem((1, 32, 32), 0.5)).unwrap();

        let guard = BusyGuard::acquire(&denoise.busy).unwrap();
        let err = denoise
            .merge(&reference, &[reference.clone()], NoiseSource::Uniform)
            .unwrap_err();
        assert!(matches!(err, MergeError::MergeInProgress));

        drop(guard);
        assert!(denoise
            .merge(&reference, &[reference.clone()], NoiseSource::Uniform)
            .is_ok());
    }

    #[test]
    fn test_progress_events() {
        let (tx, rx) = flume::unbounded();
        let denoise = Denoise::new(test_config()).unwrap().with_progress(tx);
        let reference = frame(render(64, 64, (0.0, 0.0), 0.0, 1, textured_scene));

        denoise
            .merge(&reference, &[reference.clone()], NoiseSource::Uniform)
            .unwrap();

        let events: Vec<MergeProgress> = rx.try_iter().collect();
        let stages: Vec<MergeStage> = events
            .iter()
            .filter_map(|e| match e {
                MergeProgress::Stage(stage) => Some(*stage),
                _ => None,
            })
            .collect();

        assert_eq!(
            stages,
            vec![
                MergeStage::Idle,
                MergeStage::Aligning,
                MergeStage::Merging,
                MergeStage::Normalizing,
                MergeStage::Done
            ]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, MergeProgress::FrameAligned { frame: 1, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, MergeProgress::TileMerged { done, total } if done == total)));
    }

    #[test]
    fn test_overlap_add_reports_uncovered_pixels() {
        let grid = TileGrid::new(48, 48, 32, 16).unwrap();
        let tiles = vec![None; grid.len()];

        let err = overlap_add(&grid, 1, tiles).unwrap_err();
        assert!(matches!(err, MergeError::UncoveredPixels(2304)));
    }
}

//! Slice insertion into a voxel grid
//!
//! Every pixel inside the probe region is mapped through
//! `pose * calibration` into the reference frame and splatted into an
//! axis-aligned grid covering all frames. Contributions are accumulated as a
//! weighted sum; the final voxel value is the weighted mean, and voxels that
//! received nothing keep the background value.
//!
//! Pixel mapping of a frame is spread over rows with rayon. The per-row
//! results are accumulated in row order, so the output does not depend on
//! thread scheduling.

use nalgebra::Point3;
use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::config::ReconstructionSettings;
use crate::error::{Result, UsReconError};
use crate::types::{ImageFrame, Transform3D};

use super::assembler::ReconstructInputData;
use super::volume::{GridGeometry, Volume};
use super::CancellationToken;

/// Peak cost per voxel: f32 weighted sum plus f32 weight
///
/// The finished volume reuses the sum buffer, so nothing else is allocated
/// per voxel.
pub const BYTES_PER_VOXEL: u64 = 8;

/// Tolerance used to detect an identity calibration
const IDENTITY_EPSILON: f64 = 1e-9;

/// Growth factor applied while searching an automatic spacing
const SPACING_STEP: f64 = 1.25;

const MAX_SPACING_STEPS: usize = 64;

/// Volume and statistics for one stream
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionResult {
    /// Video stream id
    pub stream_id: String,
    /// The reconstructed volume
    pub volume: Volume,
    /// Frames inserted into the grid
    pub frames_used: usize,
    /// Frames dropped during assembly
    pub frames_dropped: usize,
    /// Voxels that received at least one contribution
    pub voxels_filled: usize,
}

/// Builds a [`Volume`] from assembled frames
#[derive(Debug, Clone, Default)]
pub struct VolumeReconstructor {
    settings: ReconstructionSettings,
}

impl VolumeReconstructor {
    /// Create a reconstructor
    pub fn new(settings: ReconstructionSettings) -> Self {
        Self { settings }
    }

    /// Settings in use
    pub fn settings(&self) -> &ReconstructionSettings {
        &self.settings
    }

    /// Reconstruct one stream
    ///
    /// `progress` is called after each frame with `(processed, total)`.
    /// `cancel` is checked before each frame.
    pub fn reconstruct<F>(
        &self,
        input: &ReconstructInputData,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> Result<ReconstructionResult>
    where
        F: FnMut(usize, usize),
    {
        if input.is_empty() {
            return Err(UsReconError::StaleTracking {
                stream: input.stream_id.clone(),
                dropped: input.dropped.total(),
            });
        }
        self.check_calibration(input)?;

        let grid = self.plan_grid(input)?;
        let voxels = grid.voxel_count();
        tracing::info!(
            "Stream {}: reconstructing {} frames into {}x{}x{} voxels at {:.3} mm ({})",
            input.stream_id,
            input.len(),
            grid.dims[0],
            grid.dims[1],
            grid.dims[2],
            grid.spacing[0],
            self.settings.kernel
        );

        let mut sums = try_zeroed(voxels)?;
        let mut weights = try_zeroed(voxels)?;

        let kernel = self.settings.kernel;
        let total = input.len();
        let mut mask_cache: Option<MaskCache> = None;

        for (processed, assembled) in input.frames.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(
                    "Stream {}: reconstruction cancelled after {} of {} frames",
                    input.stream_id,
                    processed,
                    total
                );
                return Err(UsReconError::Cancelled);
            }

            let frame: &ImageFrame = &assembled.frame;
            let mask = if self.settings.use_sector_mask {
                Some(MaskCache::get(&mut mask_cache, input, frame))
            } else {
                None
            };
            let image_to_reference = assembled.pose * input.calibration;

            let rows: Vec<Vec<(usize, f32, f32)>> = (0..frame.height())
                .into_par_iter()
                .map(|y| {
                    let mut splats = Vec::with_capacity(8);
                    let mut row = Vec::new();
                    for x in 0..frame.width() {
                        if let Some(mask) = mask {
                            if !mask[(y, x)] {
                                continue;
                            }
                        }
                        let value = frame.pixels()[(y, x)] as f32;
                        let p = image_to_reference
                            .transform_point(&frame.pixel_to_image(x as f64, y as f64));
                        splats.clear();
                        kernel.splat(&grid, &p, &mut splats);
                        row.extend(splats.iter().map(|(idx, w)| (*idx, *w, value)));
                    }
                    row
                })
                .collect();

            for (idx, w, value) in rows.into_iter().flatten() {
                sums[idx] += w * value;
                weights[idx] += w;
            }

            progress(processed + 1, total);
        }

        // Weighted mean in place; the volume takes over the sum buffer
        let background = self.settings.background;
        let mut voxels_filled = 0;
        for (sum, weight) in sums.iter_mut().zip(&weights) {
            if *weight > 0.0 {
                voxels_filled += 1;
                *sum /= *weight;
            } else {
                *sum = background;
            }
        }
        drop(weights);

        let data = Array3::from_shape_vec((grid.dims[2], grid.dims[1], grid.dims[0]), sums)
            .map_err(|e| UsReconError::Allocation(format!("voxel grid shape: {}", e)))?;

        tracing::info!(
            "Stream {}: volume done, {} of {} voxels filled",
            input.stream_id,
            voxels_filled,
            voxels
        );

        Ok(ReconstructionResult {
            stream_id: input.stream_id.clone(),
            volume: Volume::new(data, &grid, Transform3D::identity()),
            frames_used: total,
            frames_dropped: input.dropped.total(),
            voxels_filled,
        })
    }

    /// Axis-aligned bounds of all frame corners in the reference frame
    pub fn bounding_box(input: &ReconstructInputData) -> Option<(Point3<f64>, Point3<f64>)> {
        let mut bounds: Option<(Point3<f64>, Point3<f64>)> = None;
        for assembled in &input.frames {
            let image_to_reference = assembled.pose * input.calibration;
            for corner in assembled.frame.corners() {
                let p = image_to_reference.transform_point(&corner);
                bounds = Some(match bounds {
                    None => (p, p),
                    Some((lo, hi)) => (lo.inf(&p), hi.sup(&p)),
                });
            }
        }
        bounds
    }

    /// Grid covering all frames within the memory ceiling
    pub fn plan_grid(&self, input: &ReconstructInputData) -> Result<GridGeometry> {
        let (min, max) = Self::bounding_box(input).ok_or_else(|| UsReconError::StaleTracking {
            stream: input.stream_id.clone(),
            dropped: input.dropped.total(),
        })?;
        let limit = self.settings.max_volume_bytes;

        if let Some(spacing) = self.settings.output_spacing_mm {
            let grid = GridGeometry::covering(min, max, spacing).ok_or_else(|| {
                UsReconError::Allocation(format!(
                    "stream {}: frames span {:?} to {:?}, too large for a grid at {} mm",
                    input.stream_id, min, max, spacing
                ))
            })?;
            return match grid_bytes(&grid) {
                Some(bytes) if bytes <= limit => Ok(grid),
                bytes => Err(UsReconError::Allocation(format!(
                    "{}x{}x{} grid at {} mm needs {} bytes, limit is {}",
                    grid.dims[0],
                    grid.dims[1],
                    grid.dims[2],
                    spacing,
                    bytes.map_or_else(|| "more than u64::MAX".to_string(), |b| b.to_string()),
                    limit
                ))),
            };
        }

        let mut spacing = finest_pixel_spacing(input);
        for _ in 0..MAX_SPACING_STEPS {
            let fits = GridGeometry::covering(min, max, spacing)
                .filter(|grid| grid_bytes(grid).is_some_and(|bytes| bytes <= limit));
            if let Some(grid) = fits {
                tracing::debug!("Stream {}: automatic spacing {:.3} mm", input.stream_id, spacing);
                return Ok(grid);
            }
            spacing *= SPACING_STEP;
        }

        Err(UsReconError::Allocation(format!(
            "no spacing up to {:.1} mm fits the {} byte limit",
            spacing, limit
        )))
    }

    fn check_calibration(&self, input: &ReconstructInputData) -> Result<()> {
        if !input.calibration.is_identity(IDENTITY_EPSILON) {
            return Ok(());
        }
        if self.settings.allow_identity_calibration {
            tracing::warn!(
                "Stream {}: probe calibration is identity, volume geometry may be wrong",
                input.stream_id
            );
            Ok(())
        } else {
            Err(UsReconError::CalibrationMissing(format!(
                "stream {} has an identity probe calibration",
                input.stream_id
            )))
        }
    }
}

/// Sector mask for the frame size currently being processed
struct MaskCache {
    key: (usize, usize, [u64; 2]),
    mask: Array2<bool>,
}

impl MaskCache {
    fn get<'a>(
        cache: &'a mut Option<MaskCache>,
        input: &ReconstructInputData,
        frame: &ImageFrame,
    ) -> &'a Array2<bool> {
        let spacing = frame.spacing();
        let key = (
            frame.width(),
            frame.height(),
            [spacing[0].to_bits(), spacing[1].to_bits()],
        );
        if cache.as_ref().map(|c| c.key) != Some(key) {
            *cache = None;
        }
        &cache
            .get_or_insert_with(|| MaskCache {
                key,
                mask: input.probe.mask(frame.width(), frame.height(), spacing),
            })
            .mask
    }
}

fn grid_bytes(grid: &GridGeometry) -> Option<u64> {
    (grid.checked_voxel_count()? as u64).checked_mul(BYTES_PER_VOXEL)
}

fn finest_pixel_spacing(input: &ReconstructInputData) -> f64 {
    let finest = input
        .frames
        .iter()
        .flat_map(|f| f.frame.spacing())
        .filter(|s| *s > 0.0 && s.is_finite())
        .fold(f64::INFINITY, f64::min);
    if finest.is_finite() {
        finest
    } else {
        1.0
    }
}

fn try_zeroed(len: usize) -> Result<Vec<f32>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|e| {
        UsReconError::Allocation(format!("cannot reserve {} voxels: {}", len, e))
    })?;
    buf.resize(len, 0.0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeDefinition;
    use crate::reconstruction::assembler::{AssembledFrame, DropStats};
    use crate::reconstruction::InterpolationKernel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn input(frames: Vec<(Transform3D, u8)>, calibration: Transform3D) -> ReconstructInputData {
        let assembled: Vec<AssembledFrame> = frames
            .into_iter()
            .enumerate()
            .map(|(i, (pose, value))| AssembledFrame {
                frame_index: i,
                timestamp: i as f64 * 10.0,
                pose,
                frame: Arc::new(ImageFrame::filled(4, 4, [1.0, 1.0], value)),
            })
            .collect();
        ReconstructInputData {
            stream_id: "video".to_string(),
            frames_total: assembled.len(),
            frames: assembled,
            probe: ProbeDefinition::full_frame(4, 4, [1.0, 1.0]),
            calibration,
            dropped: DropStats::default(),
        }
    }

    fn settings() -> ReconstructionSettings {
        ReconstructionSettings::default()
            .with_spacing(1.0)
            .allowing_identity_calibration()
    }

    #[test]
    fn test_overlapping_frames_are_averaged() {
        let data = input(
            vec![(Transform3D::identity(), 100), (Transform3D::identity(), 200)],
            Transform3D::identity(),
        );
        let result = VolumeReconstructor::new(settings())
            .reconstruct(&data, &CancellationToken::new(), |_, _| {})
            .unwrap();

        assert_eq!(result.volume.dimensions(), (4, 4, 1));
        assert!(result.volume.data.iter().all(|v| (*v - 150.0).abs() < 1e-4));
        assert_eq!(result.voxels_filled, 16);
        assert_eq!(result.frames_used, 2);
    }

    #[test]
    fn test_distance_weighted_average() {
        let data = input(
            vec![(Transform3D::identity(), 10), (Transform3D::identity(), 30)],
            Transform3D::identity(),
        );
        let result = VolumeReconstructor::new(settings().with_kernel(InterpolationKernel::DistanceWeighted))
            .reconstruct(&data, &CancellationToken::new(), |_, _| {})
            .unwrap();
        assert!(result.volume.data.iter().all(|v| (*v - 20.0).abs() < 1e-4));
    }

    #[test]
    fn test_untouched_voxels_keep_background() {
        // Two parallel slices 3 mm apart leave the planes between them empty
        let data = input(
            vec![
                (Transform3D::identity(), 50),
                (Transform3D::from_translation(0.0, 0.0, 3.0), 50),
            ],
            Transform3D::identity(),
        );
        let mut s = settings();
        s.background = -1.0;
        let result = VolumeReconstructor::new(s)
            .reconstruct(&data, &CancellationToken::new(), |_, _| {})
            .unwrap();

        assert_eq!(result.volume.dimensions(), (4, 4, 4));
        assert_eq!(result.volume.get(0, 0, 0), Some(50.0));
        assert_eq!(result.volume.get(0, 0, 1), Some(-1.0));
        assert_eq!(result.volume.get(3, 3, 3), Some(50.0));
        assert_eq!(result.voxels_filled, 32);
    }

    #[test]
    fn test_identity_calibration_rejected_by_default() {
        let data = input(vec![(Transform3D::identity(), 1)], Transform3D::identity());
        let err = VolumeReconstructor::new(ReconstructionSettings::default())
            .reconstruct(&data, &CancellationToken::new(), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, UsReconError::CalibrationMissing(_)));
    }

    #[test]
    fn test_memory_ceiling() {
        let data = input(
            vec![(Transform3D::identity(), 1)],
            Transform3D::from_translation(0.0, 0.0, 1.0),
        );
        let mut s = ReconstructionSettings::default().with_spacing(0.01);
        s.max_volume_bytes = 1024;
        let err = VolumeReconstructor::new(s.clone()).plan_grid(&data).unwrap_err();
        assert!(matches!(err, UsReconError::Allocation(_)));

        // Automatic spacing coarsens until the grid fits
        s.output_spacing_mm = None;
        let grid = VolumeReconstructor::new(s).plan_grid(&data).unwrap();
        assert!(grid_bytes(&grid).unwrap() <= 1024);
        assert!(grid.spacing[0] >= 1.0);
    }

    #[test]
    fn test_runaway_pose_is_an_allocation_error() {
        let data = input(
            vec![
                (Transform3D::identity(), 1),
                (Transform3D::from_translation(1e300, 0.0, 0.0), 1),
            ],
            Transform3D::from_translation(0.0, 0.0, 1.0),
        );
        let fixed = ReconstructionSettings::default().with_spacing(1.0);
        let err = VolumeReconstructor::new(fixed.clone()).plan_grid(&data).unwrap_err();
        assert!(matches!(err, UsReconError::Allocation(_)));

        let err = VolumeReconstructor::new(fixed)
            .reconstruct(&data, &CancellationToken::new(), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, UsReconError::Allocation(_)));

        let mut automatic = ReconstructionSettings::default();
        automatic.output_spacing_mm = None;
        let err = VolumeReconstructor::new(automatic).plan_grid(&data).unwrap_err();
        assert!(matches!(err, UsReconError::Allocation(_)));
    }

    #[test]
    fn test_grid_within_ceiling_is_accepted_exactly() {
        // 4x4x1 voxels at 8 bytes each
        let data = input(
            vec![(Transform3D::identity(), 1)],
            Transform3D::from_translation(0.0, 0.0, 1.0),
        );
        let mut s = ReconstructionSettings::default().with_spacing(1.0);
        s.max_volume_bytes = 16 * BYTES_PER_VOXEL;
        assert!(VolumeReconstructor::new(s.clone()).plan_grid(&data).is_ok());
        s.max_volume_bytes -= 1;
        assert!(VolumeReconstructor::new(s).plan_grid(&data).is_err());
    }

    #[test]
    fn test_cancellation_before_first_frame() {
        let data = input(vec![(Transform3D::identity(), 1)], Transform3D::identity());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = VolumeReconstructor::new(settings())
            .reconstruct(&data, &cancel, |_, _| {})
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_progress_reported_per_frame() {
        let data = input(
            vec![(Transform3D::identity(), 1); 5],
            Transform3D::identity(),
        );
        let calls = AtomicUsize::new(0);
        VolumeReconstructor::new(settings())
            .reconstruct(&data, &CancellationToken::new(), |processed, total| {
                calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(total, 5);
                assert!(processed <= total);
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_sector_mask_excludes_pixels() {
        let mut data = input(vec![(Transform3D::identity(), 80)], Transform3D::identity());
        // Only the two middle columns lie inside the probe
        data.probe = ProbeDefinition::linear([1.5, 0.0], 0.0, 3.0, 1.0);
        let result = VolumeReconstructor::new(settings())
            .reconstruct(&data, &CancellationToken::new(), |_, _| {})
            .unwrap();

        assert_eq!(result.volume.get(0, 0, 0), Some(0.0));
        assert_eq!(result.volume.get(1, 0, 0), Some(80.0));
        assert_eq!(result.volume.get(2, 3, 0), Some(80.0));
        assert_eq!(result.voxels_filled, 8);
    }

    #[test]
    fn test_bounding_box_uses_calibrated_pose() {
        let data = input(
            vec![(Transform3D::from_translation(10.0, 0.0, 0.0), 1)],
            Transform3D::from_translation(0.0, 5.0, 0.0),
        );
        let (lo, hi) = VolumeReconstructor::bounding_box(&data).unwrap();
        assert_eq!(lo, Point3::new(10.0, 5.0, 0.0));
        assert_eq!(hi, Point3::new(13.0, 8.0, 0.0));
    }
}

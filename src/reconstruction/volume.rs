//! Output voxel grid

use nalgebra::{Point3, Vector3};
use ndarray::{s, Array3, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::types::Transform3D;

/// Largest voxel count allowed along one grid axis
pub const MAX_AXIS_VOXELS: usize = 1 << 24;

/// Placement and size of an axis-aligned voxel grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// Position of voxel `(0, 0, 0)` in volume space (mm)
    pub origin: [f64; 3],
    /// Voxel size `[x, y, z]` in mm
    pub spacing: [f64; 3],
    /// Voxel counts `[x, y, z]`
    pub dims: [usize; 3],
}

impl GridGeometry {
    /// Grid covering `[min, max]` at isotropic `spacing`
    ///
    /// Each axis gets `floor(extent / spacing) + 1` voxels, so the voxel
    /// centres span the box. Returns `None` for non-finite bounds or spacing
    /// and when an axis would exceed [`MAX_AXIS_VOXELS`].
    pub fn covering(min: Point3<f64>, max: Point3<f64>, spacing: f64) -> Option<Self> {
        if !(spacing > 0.0 && spacing.is_finite()) {
            return None;
        }
        let dim = |lo: f64, hi: f64| -> Option<usize> {
            if !(lo.is_finite() && hi.is_finite()) {
                return None;
            }
            let count = ((hi - lo).max(0.0) / spacing).floor() + 1.0;
            (count.is_finite() && count <= MAX_AXIS_VOXELS as f64).then_some(count as usize)
        };
        Some(Self {
            origin: [min.x, min.y, min.z],
            spacing: [spacing; 3],
            dims: [dim(min.x, max.x)?, dim(min.y, max.y)?, dim(min.z, max.z)?],
        })
    }

    /// Total number of voxels, `None` on overflow
    pub fn checked_voxel_count(&self) -> Option<usize> {
        self.dims[0]
            .checked_mul(self.dims[1])?
            .checked_mul(self.dims[2])
    }

    /// Total number of voxels
    pub fn voxel_count(&self) -> usize {
        self.checked_voxel_count().unwrap_or(usize::MAX)
    }

    /// Linear index of voxel `(x, y, z)` in `[z, y, x]` storage order
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.dims[1] + y) * self.dims[0] + x
    }

    /// Continuous voxel coordinates of a volume-space point
    #[inline]
    pub fn to_voxel(&self, p: &Point3<f64>) -> Vector3<f64> {
        Vector3::new(
            (p.x - self.origin[0]) / self.spacing[0],
            (p.y - self.origin[1]) / self.spacing[1],
            (p.z - self.origin[2]) / self.spacing[2],
        )
    }

    /// Volume-space centre of voxel `(x, y, z)`
    pub fn voxel_center(&self, x: usize, y: usize, z: usize) -> Point3<f64> {
        Point3::new(
            self.origin[0] + x as f64 * self.spacing[0],
            self.origin[1] + y as f64 * self.spacing[1],
            self.origin[2] + z as f64 * self.spacing[2],
        )
    }

    /// Check if integer voxel coordinates are inside the grid
    #[inline]
    pub fn contains(&self, x: i64, y: i64, z: i64) -> bool {
        x >= 0
            && y >= 0
            && z >= 0
            && (x as usize) < self.dims[0]
            && (y as usize) < self.dims[1]
            && (z as usize) < self.dims[2]
    }

    /// Centres of the first and last voxel
    pub fn bounds(&self) -> (Point3<f64>, Point3<f64>) {
        (
            self.voxel_center(0, 0, 0),
            self.voxel_center(
                self.dims[0].saturating_sub(1),
                self.dims[1].saturating_sub(1),
                self.dims[2].saturating_sub(1),
            ),
        )
    }
}

/// Reconstructed scalar volume
///
/// `data` is indexed `[z, y, x]`. The grid is axis-aligned in volume space;
/// `orientation` maps volume space into the tracker reference frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Voxel values
    pub data: Array3<f32>,
    /// Voxel size `[x, y, z]` in mm
    pub spacing: [f64; 3],
    /// Position of voxel `(0, 0, 0)` in volume space (mm)
    pub origin: [f64; 3],
    /// Reference-from-volume transform
    pub orientation: Transform3D,
}

impl Volume {
    /// Wrap voxel data laid out on `geometry`
    pub fn new(data: Array3<f32>, geometry: &GridGeometry, orientation: Transform3D) -> Self {
        Self {
            data,
            spacing: geometry.spacing,
            origin: geometry.origin,
            orientation,
        }
    }

    /// Dimensions `(x, y, z)`
    pub fn dimensions(&self) -> (usize, usize, usize) {
        let (z, y, x) = self.data.dim();
        (x, y, z)
    }

    /// Grid placement of this volume
    pub fn geometry(&self) -> GridGeometry {
        let (x, y, z) = self.dimensions();
        GridGeometry {
            origin: self.origin,
            spacing: self.spacing,
            dims: [x, y, z],
        }
    }

    /// Value at voxel `(x, y, z)`
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        self.data.get((z, y, x)).copied()
    }

    /// Axial slice `z`
    pub fn slice_z(&self, z: usize) -> Option<ArrayView2<'_, f32>> {
        (z < self.data.dim().0).then(|| self.data.slice(s![z, .., ..]))
    }

    /// Reference-space position of voxel `(x, y, z)`
    pub fn voxel_to_reference(&self, x: usize, y: usize, z: usize) -> Point3<f64> {
        self.orientation
            .transform_point(&self.geometry().voxel_center(x, y, z))
    }

    /// Number of voxels not equal to `background`
    pub fn count_non_background(&self, background: f32) -> usize {
        self.data.iter().filter(|v| **v != background).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covering_dimensions() {
        let grid = GridGeometry::covering(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 4.9, 0.0), 1.0)
            .unwrap();
        assert_eq!(grid.dims, [11, 5, 1]);
        assert_eq!(grid.voxel_count(), 55);
        let (lo, hi) = grid.bounds();
        assert_eq!(lo, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(hi, Point3::new(10.0, 4.0, 0.0));
    }

    #[test]
    fn test_covering_rejects_unbounded_extent() {
        let origin = Point3::new(0.0, 0.0, 0.0);
        assert!(GridGeometry::covering(origin, Point3::new(1e300, 0.0, 0.0), 1.0).is_none());
        assert!(GridGeometry::covering(origin, Point3::new(f64::INFINITY, 0.0, 0.0), 1.0).is_none());
        assert!(GridGeometry::covering(origin, Point3::new(f64::NAN, 0.0, 0.0), 1.0).is_none());
        assert!(GridGeometry::covering(origin, Point3::new(1.0, 1.0, 1.0), 0.0).is_none());

        // Axes at the limit still overflow the total count
        let grid = GridGeometry {
            origin: [0.0; 3],
            spacing: [1.0; 3],
            dims: [usize::MAX / 2, 3, 1],
        };
        assert_eq!(grid.checked_voxel_count(), None);
        assert_eq!(grid.voxel_count(), usize::MAX);
    }

    #[test]
    fn test_index_matches_array_layout() {
        let grid = GridGeometry {
            origin: [0.0; 3],
            spacing: [1.0; 3],
            dims: [4, 3, 2],
        };
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| grid.index(x, y, z) as f32);
        let flat: Vec<f32> = data.iter().copied().collect();
        let expected: Vec<f32> = (0..24).map(|i| i as f32).collect();
        assert_eq!(flat, expected);
    }

    #[test]
    fn test_voxel_to_reference_applies_orientation() {
        let grid = GridGeometry {
            origin: [1.0, 2.0, 3.0],
            spacing: [0.5; 3],
            dims: [2, 2, 2],
        };
        let volume = Volume::new(
            Array3::zeros((2, 2, 2)),
            &grid,
            Transform3D::from_translation(10.0, 0.0, 0.0),
        );
        assert_eq!(volume.voxel_to_reference(1, 1, 1), Point3::new(11.5, 2.5, 3.5));
        assert_eq!(volume.dimensions(), (2, 2, 2));
        assert!(volume.slice_z(2).is_none());
    }
}

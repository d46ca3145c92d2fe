//! Pixel-to-voxel insertion kernels

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use super::volume::GridGeometry;

/// How one pixel contributes to the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationKernel {
    /// Whole contribution to the nearest voxel
    #[default]
    NearestNeighbor,
    /// Trilinear weights over the 8 surrounding voxels
    DistanceWeighted,
}

impl InterpolationKernel {
    /// Display name
    pub fn display_name(&self) -> &'static str {
        match self {
            InterpolationKernel::NearestNeighbor => "Nearest neighbor",
            InterpolationKernel::DistanceWeighted => "Distance weighted",
        }
    }

    /// Push `(voxel index, weight)` pairs for a volume-space point
    ///
    /// Voxels outside the grid and zero weights are skipped.
    #[inline]
    pub fn splat(&self, grid: &GridGeometry, p: &Point3<f64>, out: &mut Vec<(usize, f32)>) {
        let v = grid.to_voxel(p);
        match self {
            InterpolationKernel::NearestNeighbor => {
                let (x, y, z) = (v.x.round() as i64, v.y.round() as i64, v.z.round() as i64);
                if grid.contains(x, y, z) {
                    out.push((grid.index(x as usize, y as usize, z as usize), 1.0));
                }
            }
            InterpolationKernel::DistanceWeighted => {
                let (x0, y0, z0) = (v.x.floor(), v.y.floor(), v.z.floor());
                let (fx, fy, fz) = (v.x - x0, v.y - y0, v.z - z0);
                let (x0, y0, z0) = (x0 as i64, y0 as i64, z0 as i64);

                for dz in 0..2 {
                    let wz = if dz == 0 { 1.0 - fz } else { fz };
                    for dy in 0..2 {
                        let wy = if dy == 0 { 1.0 - fy } else { fy };
                        for dx in 0..2 {
                            let wx = if dx == 0 { 1.0 - fx } else { fx };
                            let w = wx * wy * wz;
                            let (x, y, z) = (x0 + dx, y0 + dy, z0 + dz);
                            if w > 0.0 && grid.contains(x, y, z) {
                                out.push((grid.index(x as usize, y as usize, z as usize), w as f32));
                            }
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for InterpolationKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

//! Probe geometry
//!
//! A [`ProbeDefinition`] describes where the valid ultrasound data lies in a
//! video frame: a fan-shaped sector for curvilinear/phased probes or a
//! rectangle for linear probes. The reconstructor uses it to build the pixel
//! mask; the assembler uses its temporal calibration.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Shape of the valid image region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Fan shaped sector, `width` is the opening angle in radians
    #[default]
    Sector,
    /// Rectangle, `width` is the lateral extent in mm
    Linear,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Sector => write!(f, "Sector"),
            ProbeKind::Linear => write!(f, "Linear"),
        }
    }
}

/// Geometry of an ultrasound probe as seen in the video frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeDefinition {
    /// Sector or linear
    pub kind: ProbeKind,

    /// Probe origin (sector apex / top centre) in pixel coordinates `[x, y]`
    pub origin: [f64; 2],

    /// Depth where valid data starts, in mm from the origin
    pub depth_start: f64,

    /// Depth where valid data ends, in mm from the origin
    pub depth_end: f64,

    /// Opening angle (radians, sector) or lateral width (mm, linear)
    pub width: f64,

    /// Delay of the video stream relative to tracking, in ms
    ///
    /// Added to every frame timestamp before it is matched against poses.
    #[serde(default)]
    pub temporal_calibration_ms: f64,
}

impl ProbeDefinition {
    /// Sector probe with its apex at `origin`
    pub fn sector(origin: [f64; 2], depth_start: f64, depth_end: f64, angle: f64) -> Self {
        Self {
            kind: ProbeKind::Sector,
            origin,
            depth_start,
            depth_end,
            width: angle,
            temporal_calibration_ms: 0.0,
        }
    }

    /// Linear probe with the top centre of the image at `origin`
    pub fn linear(origin: [f64; 2], depth_start: f64, depth_end: f64, width_mm: f64) -> Self {
        Self {
            kind: ProbeKind::Linear,
            origin,
            depth_start,
            depth_end,
            width: width_mm,
            temporal_calibration_ms: 0.0,
        }
    }

    /// Linear definition covering a whole frame
    pub fn full_frame(width_px: usize, height_px: usize, spacing: [f64; 2]) -> Self {
        let width_mm = width_px.saturating_sub(1) as f64 * spacing[0];
        let depth_mm = height_px.saturating_sub(1) as f64 * spacing[1];
        Self::linear(
            [width_px.saturating_sub(1) as f64 / 2.0, 0.0],
            0.0,
            depth_mm,
            width_mm,
        )
    }

    /// Set the temporal calibration
    pub fn with_temporal_calibration(mut self, shift_ms: f64) -> Self {
        self.temporal_calibration_ms = shift_ms;
        self
    }

    /// Check whether the geometry can produce a non-empty mask
    pub fn is_valid(&self) -> bool {
        let width_ok = match self.kind {
            ProbeKind::Sector => self.width > 0.0 && self.width < std::f64::consts::TAU,
            ProbeKind::Linear => self.width > 0.0,
        };
        width_ok
            && self.depth_start >= 0.0
            && self.depth_end > self.depth_start
            && self.origin.iter().all(|v| v.is_finite())
            && self.temporal_calibration_ms.is_finite()
    }

    /// Check whether pixel `(x, y)` lies inside the valid region
    pub fn contains(&self, x: f64, y: f64, spacing: [f64; 2]) -> bool {
        let dx = (x - self.origin[0]) * spacing[0];
        let dy = (y - self.origin[1]) * spacing[1];

        match self.kind {
            ProbeKind::Linear => {
                dx.abs() <= self.width / 2.0 + 1e-9
                    && dy >= self.depth_start - 1e-9
                    && dy <= self.depth_end + 1e-9
            }
            ProbeKind::Sector => {
                let r = (dx * dx + dy * dy).sqrt();
                if r < self.depth_start - 1e-9 || r > self.depth_end + 1e-9 {
                    return false;
                }
                if r == 0.0 {
                    return true;
                }
                // Angle measured from the beam axis (+y, pointing down the image)
                let angle = dx.atan2(dy);
                angle.abs() <= self.width / 2.0 + 1e-9
            }
        }
    }

    /// Pixel mask for a `width x height` frame, indexed `[y, x]`
    pub fn mask(&self, width: usize, height: usize, spacing: [f64; 2]) -> Array2<bool> {
        Array2::from_shape_fn((height, width), |(y, x)| {
            self.contains(x as f64, y as f64, spacing)
        })
    }
}

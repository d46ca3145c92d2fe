//! Core data types for usrecon-rs
//!
//! This module contains the fundamental data structures shared by the
//! recorders, the assembler and the reconstructor.
//!
//! # Main Types
//!
//! - [`Timestamped`] - A value tagged with a millisecond timestamp
//! - [`Transform3D`] - A 4x4 homogeneous transform (tool pose, calibration)
//! - [`ImageFrame`] - An owned 2D 8-bit ultrasound frame with pixel spacing
//! - [`ToolPose`] - A tracker sample: transform plus tool id
//! - [`TrackedTool`] - Static description of a tool known to the tracker
//!
//! # Timestamps
//!
//! All timestamps are `f64` milliseconds since the Unix epoch. Sources may
//! report their own clock; the recorders translate those into wall-clock time.

use std::ops::Mul;

use nalgebra::{
    Isometry3, Matrix3, Matrix4, Point3, Rotation3, Translation3, UnitQuaternion, Vector3,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UsReconError};
use crate::probe::ProbeDefinition;

/// Milliseconds since the Unix epoch
pub type Timestamp = f64;

/// A value tagged with the time it was sampled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    /// Sample time in milliseconds
    pub timestamp: Timestamp,
    /// The sampled value
    pub value: T,
}

impl<T> Timestamped<T> {
    /// Create a new timestamped value
    #[inline]
    pub fn new(timestamp: Timestamp, value: T) -> Self {
        Self { timestamp, value }
    }

    /// Map the inner value while preserving the timestamp
    #[inline]
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Timestamped<U> {
        Timestamped {
            timestamp: self.timestamp,
            value: f(self.value),
        }
    }

    /// Shift the timestamp by `offset` milliseconds
    #[inline]
    pub fn shifted(mut self, offset: f64) -> Self {
        self.timestamp += offset;
        self
    }
}

// ==================== Transform ====================

/// A 4x4 homogeneous transform
///
/// Used both for tool poses (tool to reference) and for the probe calibration
/// (image to tool). Composition follows matrix multiplication: `a * b` applies
/// `b` first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform3D(Matrix4<f64>);

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform3D {
    /// The identity transform
    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }

    /// Wrap a raw homogeneous matrix
    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self(matrix)
    }

    /// Build from 16 values in row-major order
    pub fn from_row_slice(values: &[f64]) -> Result<Self> {
        if values.len() != 16 {
            return Err(UsReconError::Serialization(format!(
                "expected 16 matrix values, got {}",
                values.len()
            )));
        }
        Ok(Self(Matrix4::from_row_slice(values)))
    }

    /// Pure translation
    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self(Translation3::new(x, y, z).to_homogeneous())
    }

    /// Rigid transform from an isometry
    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self(iso.to_homogeneous())
    }

    /// Rigid transform from a rotation (axis-angle, radians) and a translation
    pub fn from_axis_angle(axis: Vector3<f64>, angle: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_scaled_axis(axis.normalize() * angle);
        Self::from_isometry(&Isometry3::from_parts(translation.into(), rotation))
    }

    /// The underlying matrix
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    /// Values in row-major order (for text persistence)
    pub fn to_row_vec(&self) -> Vec<f64> {
        self.0.transpose().iter().copied().collect()
    }

    /// Translation component
    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.0[(0, 3)], self.0[(1, 3)], self.0[(2, 3)])
    }

    /// Rotation component as a quaternion
    ///
    /// The upper-left 3x3 block is projected onto the closest rotation, so
    /// small numerical drift in tracker matrices does not break slerp.
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        let block: Matrix3<f64> = self.0.fixed_view::<3, 3>(0, 0).into_owned();
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&block))
    }

    /// Rigid part of this transform
    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.translation()), self.rotation())
    }

    /// Apply to a point
    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        let h = self.0 * p.to_homogeneous();
        if h.w.abs() > f64::EPSILON && (h.w - 1.0).abs() > f64::EPSILON {
            Point3::new(h.x / h.w, h.y / h.w, h.z / h.w)
        } else {
            Point3::new(h.x, h.y, h.z)
        }
    }

    /// Inverse, if the matrix is invertible
    pub fn inverse(&self) -> Option<Self> {
        self.0.try_inverse().map(Self)
    }

    /// Check whether this is (numerically) the identity
    pub fn is_identity(&self, epsilon: f64) -> bool {
        (self.0 - Matrix4::identity()).amax() <= epsilon
    }

    /// Interpolate towards `other`: linear in translation, spherical in rotation
    ///
    /// `alpha` is clamped to `[0, 1]`. The endpoints are returned unchanged so
    /// exact sample hits are bit-exact.
    pub fn interpolate(&self, other: &Transform3D, alpha: f64) -> Transform3D {
        let alpha = alpha.clamp(0.0, 1.0);
        if alpha == 0.0 {
            return *self;
        }
        if alpha == 1.0 {
            return *other;
        }

        let q0 = self.rotation();
        let q1 = other.rotation();
        // Opposite quaternions are handled inside try_slerp; it only gives up
        // when the two rotations are numerically indistinguishable.
        let rotation = q0.try_slerp(&q1, alpha, f64::EPSILON).unwrap_or(q0);
        let translation = self.translation().lerp(&other.translation(), alpha);

        Transform3D::from_isometry(&Isometry3::from_parts(translation.into(), rotation))
    }
}

impl Mul for Transform3D {
    type Output = Transform3D;

    fn mul(self, rhs: Transform3D) -> Transform3D {
        Transform3D(self.0 * rhs.0)
    }
}

impl Mul<&Transform3D> for &Transform3D {
    type Output = Transform3D;

    fn mul(self, rhs: &Transform3D) -> Transform3D {
        Transform3D(self.0 * rhs.0)
    }
}

// ==================== Image Frame ====================

/// An owned 8-bit ultrasound frame
///
/// Pixels are stored row-major as `[row, col]` (`[y, x]`). Spacing is in
/// millimetres per pixel as `[x, y]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pixels: Array2<u8>,
    spacing: [f64; 2],
}

impl ImageFrame {
    /// Create a frame from a row-major pixel buffer
    pub fn new(width: usize, height: usize, spacing: [f64; 2], data: Vec<u8>) -> Result<Self> {
        let pixels = Array2::from_shape_vec((height, width), data).map_err(|e| {
            UsReconError::Source(format!("invalid frame buffer {}x{}: {}", width, height, e))
        })?;
        Ok(Self::from_array(pixels, spacing))
    }

    /// Wrap an existing pixel array
    pub fn from_array(pixels: Array2<u8>, spacing: [f64; 2]) -> Self {
        Self { pixels, spacing }
    }

    /// A frame with every pixel set to `value`
    pub fn filled(width: usize, height: usize, spacing: [f64; 2], value: u8) -> Self {
        Self::from_array(Array2::from_elem((height, width), value), spacing)
    }

    /// Width in pixels
    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    /// Height in pixels
    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }

    /// Pixel spacing `[x, y]` in mm
    pub fn spacing(&self) -> [f64; 2] {
        self.spacing
    }

    /// Number of pixels
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    /// Check if the frame has no pixels
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Pixel access
    pub fn pixels(&self) -> &Array2<u8> {
        &self.pixels
    }

    /// Value at `(x, y)`
    pub fn get(&self, x: usize, y: usize) -> Option<u8> {
        self.pixels.get((y, x)).copied()
    }

    /// Position of pixel `(x, y)` in image space (mm, z = 0)
    pub fn pixel_to_image(&self, x: f64, y: f64) -> Point3<f64> {
        Point3::new(x * self.spacing[0], y * self.spacing[1], 0.0)
    }

    /// The four corner pixel centres in image space
    pub fn corners(&self) -> [Point3<f64>; 4] {
        let max_x = self.width().saturating_sub(1) as f64;
        let max_y = self.height().saturating_sub(1) as f64;
        [
            self.pixel_to_image(0.0, 0.0),
            self.pixel_to_image(max_x, 0.0),
            self.pixel_to_image(0.0, max_y),
            self.pixel_to_image(max_x, max_y),
        ]
    }

    /// Take ownership of the pixel storage (used to recycle buffers)
    pub(crate) fn into_raw_vec(self) -> Vec<u8> {
        self.pixels.into_raw_vec_and_offset().0
    }
}

// ==================== Tools ====================

/// A single tracker sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPose {
    /// Tool to reference transform
    pub transform: Transform3D,
    /// Id of the tracked tool
    pub tool_id: String,
}

impl ToolPose {
    /// Create a new pose sample
    pub fn new(tool_id: impl Into<String>, transform: Transform3D) -> Self {
        Self {
            transform,
            tool_id: tool_id.into(),
        }
    }
}

/// Kind of a tracked tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ToolKind {
    /// Ultrasound probe
    Probe,
    /// Patient/reference frame
    Reference,
    /// Navigation pointer
    Pointer,
    /// Anything else
    #[default]
    Other,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolKind::Probe => write!(f, "Probe"),
            ToolKind::Reference => write!(f, "Reference"),
            ToolKind::Pointer => write!(f, "Pointer"),
            ToolKind::Other => write!(f, "Other"),
        }
    }
}

/// Static description of a tool known to the tracking system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedTool {
    /// Tool id, matches `ToolPose::tool_id`
    pub id: String,
    /// Tool kind
    pub kind: ToolKind,
    /// Image-to-tool calibration (identity when uncalibrated)
    #[serde(default)]
    pub calibration: Transform3D,
    /// Probe geometry (probes only)
    #[serde(default)]
    pub probe: Option<ProbeDefinition>,
}

impl TrackedTool {
    /// Create a tool with identity calibration and no probe geometry
    pub fn new(id: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            id: id.into(),
            kind,
            calibration: Transform3D::identity(),
            probe: None,
        }
    }

    /// Set the calibration
    pub fn with_calibration(mut self, calibration: Transform3D) -> Self {
        self.calibration = calibration;
        self
    }

    /// Set the probe geometry
    pub fn with_probe(mut self, probe: ProbeDefinition) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Check if this is a probe with usable geometry
    pub fn is_valid_probe(&self) -> bool {
        self.kind == ToolKind::Probe && self.probe.as_ref().is_some_and(|p| p.is_valid())
    }
}

//! Settings sections of the application configuration
//!
//! Each section is a plain serde struct with defaults for every field, so a
//! partial configuration file only needs to mention what it changes.
//!
//! # Main Types
//!
//! - [`AcquisitionSettings`] - Readiness requirements and frame buffering
//! - [`AssemblySettings`] - Temporal matching of frames and poses
//! - [`ReconstructionSettings`] - Output grid, kernel and memory ceiling
//! - [`PersistenceSettings`] - Where sessions and volumes are written

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UsReconError};
use crate::reconstruction::InterpolationKernel;

/// Default maximum allowed time between the two poses bracketing a frame (ms)
pub const DEFAULT_MAX_GAP_MS: f64 = 250.0;

/// Default drop ratio above which a session-level warning is raised
pub const DEFAULT_DROP_WARNING_RATIO: f64 = 0.25;

/// Default memory ceiling for the reconstruction grid (512 MiB)
pub const DEFAULT_MAX_VOLUME_BYTES: u64 = 512 * 1024 * 1024;

/// Default number of frame buffers kept for reuse
pub const DEFAULT_FRAME_POOL_CAPACITY: usize = 256;

// ==================== Acquisition ====================

/// Settings for starting and running a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Require a probe tool with valid geometry before recording can start
    #[serde(default = "default_true")]
    pub require_probe: bool,

    /// Tool whose poses are recorded; defaults to the first probe tool
    #[serde(default)]
    pub probe_tool_id: Option<String>,

    /// Number of released frame buffers kept for reuse
    #[serde(default = "default_frame_pool_capacity")]
    pub frame_pool_capacity: usize,

    /// Pixel bytes a single stream may buffer (0 = unlimited)
    ///
    /// Exceeding the limit is a fatal recorder fault, like a failed allocation.
    #[serde(default)]
    pub max_recording_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_frame_pool_capacity() -> usize {
    DEFAULT_FRAME_POOL_CAPACITY
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            require_probe: true,
            probe_tool_id: None,
            frame_pool_capacity: DEFAULT_FRAME_POOL_CAPACITY,
            max_recording_bytes: 0,
        }
    }
}

// ==================== Assembly ====================

/// Settings for joining frames with tracking data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblySettings {
    /// Frames whose bracketing poses are further apart than this are dropped (ms)
    #[serde(default = "default_max_gap_ms")]
    pub max_gap_ms: f64,

    /// Ratio of dropped frames above which a warning is published
    #[serde(default = "default_drop_warning_ratio")]
    pub drop_warning_ratio: f64,
}

fn default_max_gap_ms() -> f64 {
    DEFAULT_MAX_GAP_MS
}

fn default_drop_warning_ratio() -> f64 {
    DEFAULT_DROP_WARNING_RATIO
}

impl Default for AssemblySettings {
    fn default() -> Self {
        Self {
            max_gap_ms: DEFAULT_MAX_GAP_MS,
            drop_warning_ratio: DEFAULT_DROP_WARNING_RATIO,
        }
    }
}

impl AssemblySettings {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.max_gap_ms > 0.0 && self.max_gap_ms.is_finite()) {
            return Err(UsReconError::Config(format!(
                "max_gap_ms must be positive, got {}",
                self.max_gap_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.drop_warning_ratio) {
            return Err(UsReconError::Config(format!(
                "drop_warning_ratio must be within [0, 1], got {}",
                self.drop_warning_ratio
            )));
        }
        Ok(())
    }
}

// ==================== Reconstruction ====================

/// Settings for the volume reconstructor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionSettings {
    /// Isotropic output spacing in mm; chosen automatically when unset
    #[serde(default)]
    pub output_spacing_mm: Option<f64>,

    /// How a pixel is distributed into the grid
    #[serde(default)]
    pub kernel: InterpolationKernel,

    /// Upper bound for the grid plus its accumulation buffer, in bytes
    #[serde(default = "default_max_volume_bytes")]
    pub max_volume_bytes: u64,

    /// Value of voxels that receive no contribution
    #[serde(default)]
    pub background: f32,

    /// Only pixels inside the probe sector contribute
    #[serde(default = "default_true")]
    pub use_sector_mask: bool,

    /// Proceed when the probe calibration is identity
    ///
    /// An identity calibration usually means the probe was never calibrated;
    /// uncalibrated test rigs must opt in explicitly.
    #[serde(default)]
    pub allow_identity_calibration: bool,
}

fn default_max_volume_bytes() -> u64 {
    DEFAULT_MAX_VOLUME_BYTES
}

impl Default for ReconstructionSettings {
    fn default() -> Self {
        Self {
            output_spacing_mm: None,
            kernel: InterpolationKernel::default(),
            max_volume_bytes: DEFAULT_MAX_VOLUME_BYTES,
            background: 0.0,
            use_sector_mask: true,
            allow_identity_calibration: false,
        }
    }
}

impl ReconstructionSettings {
    /// Set a fixed isotropic output spacing
    pub fn with_spacing(mut self, spacing_mm: f64) -> Self {
        self.output_spacing_mm = Some(spacing_mm);
        self
    }

    /// Set the kernel
    pub fn with_kernel(mut self, kernel: InterpolationKernel) -> Self {
        self.kernel = kernel;
        self
    }

    /// Accept identity calibrations
    pub fn allowing_identity_calibration(mut self) -> Self {
        self.allow_identity_calibration = true;
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if let Some(spacing) = self.output_spacing_mm {
            if !(spacing > 0.0 && spacing.is_finite()) {
                return Err(UsReconError::Config(format!(
                    "output_spacing_mm must be positive, got {}",
                    spacing
                )));
            }
        }
        if self.max_volume_bytes == 0 {
            return Err(UsReconError::Config(
                "max_volume_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ==================== Persistence ====================

/// Settings for writing sessions to disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceSettings {
    /// Directory receiving one sub-directory per session; app data dir when unset
    #[serde(default)]
    pub session_root: Option<PathBuf>,
}

impl PersistenceSettings {
    /// Resolve the session root, falling back to the app data directory
    pub fn resolve_root(&self) -> Result<PathBuf> {
        match &self.session_root {
            Some(root) => Ok(root.clone()),
            None => super::app_data_dir()
                .map(|dir| dir.join(super::SESSIONS_DIR))
                .ok_or_else(|| {
                    UsReconError::Config("Could not determine app data directory".to_string())
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let acq = AcquisitionSettings::default();
        assert!(acq.require_probe);
        assert!(acq.probe_tool_id.is_none());

        let asm = AssemblySettings::default();
        assert_eq!(asm.max_gap_ms, DEFAULT_MAX_GAP_MS);
        assert!(asm.validate().is_ok());

        let rec = ReconstructionSettings::default();
        assert!(rec.use_sector_mask);
        assert!(!rec.allow_identity_calibration);
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let asm = AssemblySettings {
            max_gap_ms: -1.0,
            ..Default::default()
        };
        assert!(asm.validate().is_err());

        let asm = AssemblySettings {
            drop_warning_ratio: 1.5,
            ..Default::default()
        };
        assert!(asm.validate().is_err());

        let rec = ReconstructionSettings::default().with_spacing(0.0);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_explicit_session_root() {
        let settings = PersistenceSettings {
            session_root: Some(PathBuf::from("/tmp/sessions")),
        };
        assert_eq!(settings.resolve_root().unwrap(), PathBuf::from("/tmp/sessions"));
    }
}

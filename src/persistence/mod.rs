//! Session and volume storage
//!
//! # Layout
//!
//! Each session is written to its own directory named after the session id:
//!
//! ```text
//! <root>/US_01_20240101T120000/
//!     session.json          manifest: metadata, probe tool, stream list
//!     tracking.tts          one pose per line: time tool m00 m01 .. m33
//!     <stream>.fts          one frame per line: time width height sx sy
//!     <stream>.frames.bin   8-bit pixels of every frame, concatenated
//!     <stream>.volume.json  volume header (after reconstruction)
//!     <stream>.volume.raw   little-endian f32 voxels, x fastest
//! ```
//!
//! All times on disk are wall-clock milliseconds; the sync shift of each
//! stream has already been applied.

pub mod file_store;

pub use file_store::FilePersistence;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reconstruction::{ReconstructInputData, Volume};
use crate::session::position_recorder::PoseTrack;
use crate::session::{AcquisitionSession, SessionMetadata};
use crate::types::{ImageFrame, Timestamped, TrackedTool};

/// Manifest file name inside a session directory
pub const MANIFEST_FILE: &str = "session.json";

/// Pose file name inside a session directory
pub const TRACKING_FILE: &str = "tracking.tts";

/// Current manifest format
pub const FORMAT_VERSION: u32 = 1;

/// Contents of `session.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    /// Manifest format
    pub format_version: u32,
    /// Session metadata
    pub metadata: SessionMetadata,
    /// Probe tool at recording time
    #[serde(default)]
    pub probe_tool: Option<TrackedTool>,
    /// Pose file, relative to the session directory
    pub tracking_file: String,
    /// Recorded video streams
    pub streams: Vec<StreamManifest>,
}

/// One video stream in a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamManifest {
    /// Stream id
    pub stream_id: String,
    /// Sync shift latched while recording (ms)
    #[serde(default)]
    pub sync_shift: f64,
    /// Number of frames written
    pub frame_count: usize,
    /// Frame time file
    pub timestamps_file: String,
    /// Pixel data file
    pub frames_file: String,
}

/// Header written next to a `.raw` voxel file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeHeader {
    /// Voxel counts `[x, y, z]`
    pub dimensions: [usize; 3],
    /// Voxel size in mm
    pub spacing: [f64; 3],
    /// Position of the first voxel (mm)
    pub origin: [f64; 3],
    /// Reference-from-volume transform, row-major
    pub orientation: Vec<f64>,
    /// Voxel type, always `f32`
    pub element_type: String,
    /// Byte order, always `little`
    pub byte_order: String,
    /// Voxel file, relative to the header
    pub data_file: String,
}

/// A session read back from disk, before assembly
#[derive(Debug, Clone)]
pub struct LoadedSession {
    /// Manifest
    pub manifest: SessionManifest,
    /// Frames per stream in wall-clock time
    pub streams: Vec<(String, Vec<Timestamped<Arc<ImageFrame>>>)>,
    /// Probe poses
    pub track: PoseTrack,
}

/// Storage for recorded sessions and reconstructed volumes
pub trait SessionPersistence {
    /// Write a stopped session; returns the session directory
    fn write_session(&self, session: &AcquisitionSession) -> Result<PathBuf>;

    /// Read a session directory and assemble every stream
    fn read_session(&self, path: &Path) -> Result<Vec<ReconstructInputData>>;

    /// Write a volume as `<dir>/<name>.volume.{json,raw}`; returns the header path
    fn write_volume(&self, volume: &Volume, dir: &Path, name: &str) -> Result<PathBuf>;

    /// Read a volume from its header path
    fn read_volume(&self, header: &Path) -> Result<Volume>;
}

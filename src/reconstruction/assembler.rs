//! Frame/pose time join
//!
//! For every frame of a recording window the assembler looks up the probe
//! pose at the frame's wall-clock time (plus the probe's temporal
//! calibration). Frames outside the tracked interval, or whose bracketing
//! poses are too far apart, are dropped rather than given a guessed pose.

use std::sync::Arc;

use crate::config::AssemblySettings;
use crate::error::{Result, UsReconError};
use crate::probe::ProbeDefinition;
use crate::session::position_recorder::PoseTrack;
use crate::session::RecordingWindow;
use crate::types::{ImageFrame, Timestamp, Timestamped, TrackedTool, Transform3D};

/// A frame with the probe pose at its acquisition time
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledFrame {
    /// Position of the frame in the recording window
    pub frame_index: usize,
    /// Wall-clock acquisition time (ms), temporal calibration applied
    pub timestamp: Timestamp,
    /// Probe-to-reference transform
    pub pose: Transform3D,
    /// Pixel data
    pub frame: Arc<ImageFrame>,
}

/// Why frames were dropped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropStats {
    /// Before the first or after the last pose
    pub outside_tracking: usize,
    /// Bracketing poses further apart than the allowed gap
    pub tracking_gap: usize,
}

impl DropStats {
    /// Total dropped frames
    pub fn total(&self) -> usize {
        self.outside_tracking + self.tracking_gap
    }
}

/// Frames of one stream ready for reconstruction
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructInputData {
    /// Video stream id
    pub stream_id: String,
    /// Frames in increasing time, each with a pose
    pub frames: Vec<AssembledFrame>,
    /// Valid image region of the probe
    pub probe: ProbeDefinition,
    /// Image-to-probe calibration
    pub calibration: Transform3D,
    /// Frames in the window before dropping
    pub frames_total: usize,
    /// Dropped frame counts
    pub dropped: DropStats,
}

impl ReconstructInputData {
    /// Fraction of the window that was dropped
    pub fn drop_ratio(&self) -> f64 {
        if self.frames_total == 0 {
            0.0
        } else {
            self.dropped.total() as f64 / self.frames_total as f64
        }
    }

    /// Number of assembled frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check if no frame survived
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Joins frames with interpolated probe poses
#[derive(Debug, Clone, Default)]
pub struct ReconstructionInputAssembler {
    settings: AssemblySettings,
}

impl ReconstructionInputAssembler {
    /// Create an assembler
    pub fn new(settings: AssemblySettings) -> Self {
        Self { settings }
    }

    /// Settings in use
    pub fn settings(&self) -> &AssemblySettings {
        &self.settings
    }

    /// Assemble a recording window
    ///
    /// `probe_tool` supplies geometry and calibration. Without it the whole
    /// frame is used with an identity calibration.
    pub fn assemble(
        &self,
        stream_id: &str,
        window: &RecordingWindow<Arc<ImageFrame>>,
        track: &PoseTrack,
        probe_tool: Option<&TrackedTool>,
    ) -> Result<ReconstructInputData> {
        let frames: Vec<Timestamped<Arc<ImageFrame>>> = window
            .wall_clock()
            .map(|(t, frame)| Timestamped::new(t, frame.clone()))
            .collect();
        self.assemble_frames(stream_id, frames, track, probe_tool)
    }

    /// Assemble frames already stamped in wall-clock time
    pub fn assemble_frames(
        &self,
        stream_id: &str,
        frames: Vec<Timestamped<Arc<ImageFrame>>>,
        track: &PoseTrack,
        probe_tool: Option<&TrackedTool>,
    ) -> Result<ReconstructInputData> {
        let frames_total = frames.len();
        if frames_total == 0 {
            return Err(UsReconError::StaleTracking {
                stream: stream_id.to_string(),
                dropped: 0,
            });
        }

        let (probe, calibration) = match probe_tool.and_then(|t| t.probe.clone().map(|p| (p, t.calibration))) {
            Some(pair) => pair,
            None => {
                let first = &frames[0].value;
                tracing::debug!(
                    "Stream {}: no probe geometry, using the full {}x{} frame",
                    stream_id,
                    first.width(),
                    first.height()
                );
                let calibration = probe_tool.map(|t| t.calibration).unwrap_or_default();
                (
                    ProbeDefinition::full_frame(first.width(), first.height(), first.spacing()),
                    calibration,
                )
            }
        };

        let delay = probe.temporal_calibration_ms;
        let mut dropped = DropStats::default();
        let mut assembled = Vec::with_capacity(frames_total);

        for (frame_index, sample) in frames.into_iter().enumerate() {
            let t = sample.timestamp + delay;
            let Some(bracket) = track.bracket(t) else {
                tracing::trace!("Stream {}: frame {} outside tracking", stream_id, frame_index);
                dropped.outside_tracking += 1;
                continue;
            };
            if bracket.gap() > self.settings.max_gap_ms {
                tracing::trace!(
                    "Stream {}: frame {} in a {:.1} ms tracking gap",
                    stream_id,
                    frame_index,
                    bracket.gap()
                );
                dropped.tracking_gap += 1;
                continue;
            }
            assembled.push(AssembledFrame {
                frame_index,
                timestamp: t,
                pose: bracket.interpolate(t),
                frame: sample.value,
            });
        }

        // Temporal calibration shifts every frame equally, so order is kept
        let data = ReconstructInputData {
            stream_id: stream_id.to_string(),
            frames: assembled,
            probe,
            calibration,
            frames_total,
            dropped,
        };

        if data.is_empty() {
            tracing::error!(
                "Stream {}: all {} frames dropped (outside tracking: {}, gaps: {})",
                stream_id,
                frames_total,
                dropped.outside_tracking,
                dropped.tracking_gap
            );
            return Err(UsReconError::StaleTracking {
                stream: stream_id.to_string(),
                dropped: dropped.total(),
            });
        }

        if self.exceeds_drop_warning(&data) {
            tracing::warn!(
                "Stream {}: dropped {} of {} frames ({:.0}%)",
                stream_id,
                dropped.total(),
                frames_total,
                data.drop_ratio() * 100.0
            );
        } else {
            tracing::debug!(
                "Stream {}: assembled {} of {} frames",
                stream_id,
                data.len(),
                frames_total
            );
        }

        Ok(data)
    }

    /// Check if the drop ratio is high enough to warn the user
    pub fn exceeds_drop_warning(&self, data: &ReconstructInputData) -> bool {
        data.drop_ratio() > self.settings.drop_warning_ratio
    }
}

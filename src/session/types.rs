//! Session data types

use serde::{Deserialize, Serialize};

use crate::types::{Timestamp, Timestamped};

/// State of an acquisition session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, nothing recorded yet
    #[default]
    Idle,
    /// Frames and poses are being buffered
    Recording,
    /// Recording finished, ready for post-processing
    Stopped,
    /// Reconstruction running on the worker
    PostProcessing,
    /// Recording discarded
    Cancelled,
    /// Reconstruction finished
    Complete,
}

impl SessionState {
    /// Check if currently recording
    pub fn is_recording(&self) -> bool {
        matches!(self, SessionState::Recording)
    }

    /// Check if the session holds a finished recording
    pub fn has_recording(&self) -> bool {
        matches!(
            self,
            SessionState::Stopped | SessionState::PostProcessing | SessionState::Complete
        )
    }

    /// No further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Cancelled | SessionState::Complete)
    }

    /// Display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Recording => "Recording",
            SessionState::Stopped => "Stopped",
            SessionState::PostProcessing => "PostProcessing",
            SessionState::Cancelled => "Cancelled",
            SessionState::Complete => "Complete",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Metadata for a recorded session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Session id (`US_<nn>_<YYYYMMDDTHHMMSS>`)
    pub name: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// When the recording started
    pub recorded_at: chrono::DateTime<chrono::Utc>,
    /// Recording start (wall clock, ms)
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    /// Recording stop (wall clock, ms)
    #[serde(default)]
    pub stop_time: Option<Timestamp>,
    /// Tool whose poses were recorded
    #[serde(default)]
    pub probe_tool_id: Option<String>,
    /// Recorded video streams
    #[serde(default)]
    pub stream_ids: Vec<String>,
}

impl SessionMetadata {
    /// Metadata for a new session
    pub fn new(name: impl Into<String>, recorded_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            name: name.into(),
            description: None,
            recorded_at,
            start_time: None,
            stop_time: None,
            probe_tool_id: None,
            stream_ids: Vec::new(),
        }
    }

    /// Recording duration in ms, once stopped
    pub fn duration_ms(&self) -> Option<f64> {
        match (self.start_time, self.stop_time) {
            (Some(start), Some(stop)) => Some(stop - start),
            _ => None,
        }
    }
}

/// A copy of buffered samples between two wall-clock bounds
///
/// Sample timestamps are the values stored by the recorder (source clock for
/// video). `sync_shift` translates them into wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingWindow<T> {
    /// Offset added to stored timestamps to get wall-clock time (ms)
    pub sync_shift: f64,
    /// Samples in increasing timestamp order
    pub samples: Vec<Timestamped<T>>,
}

impl<T> Default for RecordingWindow<T> {
    fn default() -> Self {
        Self {
            sync_shift: 0.0,
            samples: Vec::new(),
        }
    }
}

impl<T> RecordingWindow<T> {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Iterate samples with wall-clock timestamps
    pub fn wall_clock(&self) -> impl Iterator<Item = (Timestamp, &T)> + '_ {
        self.samples
            .iter()
            .map(move |s| (s.timestamp + self.sync_shift, &s.value))
    }

    /// Consume into samples re-stamped in wall-clock time
    pub fn into_wall_clock(self) -> Vec<Timestamped<T>> {
        let shift = self.sync_shift;
        self.samples.into_iter().map(|s| s.shifted(shift)).collect()
    }
}

//! Tracker pose recorder
//!
//! Buffers tool poses delivered by a [`TrackingSource`] and answers "where was
//! the probe at time T" by interpolating between the two bracketing samples.
//! Tracker timestamps are already wall-clock, so no sync shift is applied.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::source_trait::{SharedTrackingSource, TransformEvent};
use crate::events::SubscriptionToken;
use crate::types::{Timestamp, Timestamped, ToolPose, Transform3D};

use super::buffer::SampleBuffer;

/// The two samples around a query time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseBracket {
    /// Latest sample at or before the query
    pub before: Timestamped<Transform3D>,
    /// Earliest sample at or after the query
    pub after: Timestamped<Transform3D>,
}

impl PoseBracket {
    /// Time between the bracketing samples (0 on an exact hit)
    pub fn gap(&self) -> f64 {
        self.after.timestamp - self.before.timestamp
    }

    /// Interpolated pose at `t`
    pub fn interpolate(&self, t: Timestamp) -> Transform3D {
        let span = self.gap();
        if span <= 0.0 {
            return self.before.value;
        }
        let alpha = (t - self.before.timestamp) / span;
        self.before.value.interpolate(&self.after.value, alpha)
    }
}

/// Bracket `t` in time-sorted samples; `None` outside the recorded range
fn bracket_in(samples: &[Timestamped<Transform3D>], t: Timestamp) -> Option<PoseBracket> {
    let (first, last) = (samples.first()?, samples.last()?);
    if !(first.timestamp <= t && t <= last.timestamp) {
        return None;
    }
    let idx = samples.partition_point(|s| s.timestamp < t);
    let after = samples[idx];
    if after.timestamp == t {
        return Some(PoseBracket { before: after, after });
    }
    // t > first, so idx >= 1
    let before = samples[idx - 1];
    Some(PoseBracket { before, after })
}

/// Pose at `t`, clamped to the first/last sample outside the recorded range
fn interpolate_in(samples: &[Timestamped<Transform3D>], t: Timestamp) -> Option<Transform3D> {
    let (first, last) = (samples.first()?, samples.last()?);
    if t <= first.timestamp {
        return Some(first.value);
    }
    if t >= last.timestamp {
        return Some(last.value);
    }
    bracket_in(samples, t).map(|b| b.interpolate(t))
}

/// Immutable snapshot of one tool's recorded poses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseTrack {
    tool_id: Option<String>,
    samples: Vec<Timestamped<Transform3D>>,
}

impl PoseTrack {
    /// Build a track from samples in any order
    pub fn from_samples(tool_id: Option<String>, samples: Vec<Timestamped<Transform3D>>) -> Self {
        let mut buffer = SampleBuffer::new();
        for s in samples {
            buffer.insert(s.timestamp, s.value);
        }
        Self {
            tool_id,
            samples: buffer.take(),
        }
    }

    /// Tool the poses belong to
    pub fn tool_id(&self) -> Option<&str> {
        self.tool_id.as_deref()
    }

    /// Samples in time order
    pub fn samples(&self) -> &[Timestamped<Transform3D>] {
        &self.samples
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// First and last sample time
    pub fn time_range(&self) -> Option<(Timestamp, Timestamp)> {
        Some((self.samples.first()?.timestamp, self.samples.last()?.timestamp))
    }

    /// Bracketing samples of `t`
    pub fn bracket(&self, t: Timestamp) -> Option<PoseBracket> {
        bracket_in(&self.samples, t)
    }

    /// Most probable pose at `t`
    pub fn interpolate_at(&self, t: Timestamp) -> Option<Transform3D> {
        interpolate_in(&self.samples, t)
    }
}

#[derive(Default)]
struct PositionInner {
    poses: SampleBuffer<ToolPose>,
    source: Option<SharedTrackingSource>,
    token: Option<SubscriptionToken>,
}

/// Recorder for tracker transforms
pub struct PositionRecorder {
    tool_filter: Option<String>,
    recording: AtomicBool,
    ignored: AtomicUsize,
    inner: Mutex<PositionInner>,
}

impl std::fmt::Debug for PositionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionRecorder")
            .field("tool_filter", &self.tool_filter)
            .field("recording", &self.is_recording())
            .field("poses", &self.len())
            .finish()
    }
}

impl Default for PositionRecorder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PositionRecorder {
    /// Create a recorder; with a filter only that tool's poses are kept
    pub fn new(tool_filter: Option<String>) -> Self {
        Self {
            tool_filter,
            recording: AtomicBool::new(false),
            ignored: AtomicUsize::new(0),
            inner: Mutex::new(PositionInner::default()),
        }
    }

    /// Tool whose poses are kept
    pub fn tool_filter(&self) -> Option<&str> {
        self.tool_filter.as_deref()
    }

    /// Check if recording
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Start recording from `source`, clearing previous samples
    pub fn start_record(self: &Arc<Self>, source: Option<SharedTrackingSource>) {
        let Some(source) = source else {
            tracing::warn!("No tracking source, pose recording skipped");
            return;
        };

        self.detach();
        self.clear();

        let weak: Weak<PositionRecorder> = Arc::downgrade(self);
        let token = source.subscribe_transforms(Box::new(move |event: &TransformEvent| {
            if let Some(recorder) = weak.upgrade() {
                recorder.on_transform(event.timestamp, &event.tool_id, event.transform);
            }
        }));

        {
            let mut inner = self.lock();
            inner.source = Some(source);
            inner.token = Some(token);
            self.recording.store(true, Ordering::Release);
        }
        tracing::debug!("Pose recording started (tool filter: {:?})", self.tool_filter);
    }

    /// Stop recording; samples stay available
    pub fn stop_record(&self) {
        let was_recording = {
            let _inner = self.lock();
            self.recording.swap(false, Ordering::AcqRel)
        };
        self.detach();
        if was_recording {
            tracing::debug!("Pose recording stopped with {} samples", self.len());
        }
    }

    /// Store a transform delivered by the tracker
    pub fn on_transform(&self, timestamp: Timestamp, tool_id: &str, transform: Transform3D) {
        if !self.is_recording() {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(filter) = &self.tool_filter {
            if filter != tool_id {
                return;
            }
        }
        let mut inner = self.lock();
        // Stop may have run since the first check
        if !self.is_recording() {
            drop(inner);
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !inner.poses.insert(timestamp, ToolPose::new(tool_id, transform)) {
            drop(inner);
            tracing::warn!("Non-finite pose timestamp for {} dropped", tool_id);
            self.ignored.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Poses with `start <= timestamp <= stop`
    pub fn get_recording(&self, start: Timestamp, stop: Timestamp) -> Vec<Timestamped<ToolPose>> {
        self.lock().poses.window(start, stop)
    }

    /// Snapshot of the recorded poses for off-thread use
    ///
    /// Without a tool filter, poses of every tool end up in one track.
    pub fn track(&self) -> PoseTrack {
        let inner = self.lock();
        let samples = inner
            .poses
            .as_slice()
            .iter()
            .map(|s| Timestamped::new(s.timestamp, s.value.transform))
            .collect();
        PoseTrack {
            tool_id: self.tool_filter.clone(),
            samples,
        }
    }

    /// Bracketing samples of `t`
    pub fn bracket(&self, t: Timestamp) -> Option<PoseBracket> {
        self.track().bracket(t)
    }

    /// Most probable pose at `t`; `None` only if nothing was recorded
    ///
    /// Takes a snapshot per call; use [`PositionRecorder::track`] for
    /// repeated queries.
    pub fn interpolate_at(&self, t: Timestamp) -> Option<Transform3D> {
        self.track().interpolate_at(t)
    }

    /// Number of stored samples
    pub fn len(&self) -> usize {
        self.lock().poses.len()
    }

    /// Check if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples ignored while not recording
    pub fn ignored(&self) -> usize {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Discard all samples
    pub fn clear(&self) {
        self.lock().poses.clear();
        self.ignored.store(0, Ordering::Relaxed);
    }

    fn detach(&self) {
        let (source, token) = {
            let mut inner = self.lock();
            (inner.source.take(), inner.token.take())
        };
        if let (Some(source), Some(token)) = (source, token) {
            source.unsubscribe(token);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PositionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PositionRecorder {
    fn drop(&mut self) {
        self.detach();
    }
}

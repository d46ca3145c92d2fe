//! Acquisition session state machine
//!
//! ```text
//! Idle -> Recording -> Stopped -> PostProcessing -> Complete
//!             |           |             |
//!             +-----------+-> Cancelled +-> Stopped (failure / cancel)
//! ```
//!
//! A session owns one [`FrameRecorder`] per connected video stream and one
//! [`PositionRecorder`] for the probe tool. Post-processing is packaged as a
//! [`PostProcessingJob`] that runs on the reconstruction worker; the session
//! itself never blocks on reconstruction.

use std::sync::{Arc, Mutex};

use crate::backend::source_trait::{SharedTrackingSource, SharedVideoSource};
use crate::clock::{format_compact, to_datetime, Clock};
use crate::config::{AcquisitionSettings, AssemblySettings, ReconstructionSettings};
use crate::error::{Result, UsReconError};
use crate::events::{AcquisitionEvent, EventBus, StreamSummary};
use crate::reconstruction::{
    CancellationToken, ReconstructionInputAssembler, ReconstructionResult, VolumeReconstructor,
};
use crate::types::{Timestamp, ToolKind, TrackedTool};

use super::frame_pool::FramePool;
use super::frame_recorder::FrameRecorder;
use super::position_recorder::{PoseTrack, PositionRecorder};
use super::readiness;
use super::types::{SessionMetadata, SessionState};

/// Sources and shared services a session records from
pub struct AcquisitionContext {
    /// Tracking system
    pub tracking: Option<SharedTrackingSource>,
    /// Video streams
    pub video_sources: Vec<SharedVideoSource>,
    /// Wall clock
    pub clock: Arc<dyn Clock>,
    /// Notification channel
    pub events: EventBus,
    /// Recording settings
    pub settings: AcquisitionSettings,
    /// Buffers for frame copies
    pub frame_pool: Arc<FramePool>,
}

impl std::fmt::Debug for AcquisitionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionContext")
            .field("tracking", &self.tracking.is_some())
            .field(
                "video_sources",
                &self.video_sources.iter().map(|v| v.id().to_string()).collect::<Vec<_>>(),
            )
            .field("settings", &self.settings)
            .finish()
    }
}

impl AcquisitionContext {
    /// Context without sources
    pub fn new(clock: Arc<dyn Clock>, events: EventBus) -> Self {
        let settings = AcquisitionSettings::default();
        Self {
            tracking: None,
            video_sources: Vec::new(),
            clock,
            events,
            frame_pool: Arc::new(FramePool::new(settings.frame_pool_capacity)),
            settings,
        }
    }

    /// Set the tracking source
    pub fn with_tracking(mut self, tracking: SharedTrackingSource) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Add a video source
    pub fn with_video_source(mut self, source: SharedVideoSource) -> Self {
        self.video_sources.push(source);
        self
    }

    /// Replace the settings (the frame pool is resized accordingly)
    pub fn with_settings(mut self, settings: AcquisitionSettings) -> Self {
        self.frame_pool = Arc::new(FramePool::new(settings.frame_pool_capacity));
        self.settings = settings;
        self
    }

    /// The tool whose poses are recorded
    ///
    /// The configured tool id wins; otherwise the first probe with valid
    /// geometry, then any tool of kind probe.
    pub fn probe_tool(&self) -> Option<TrackedTool> {
        let tools = self.tracking.as_ref()?.tools();
        if let Some(id) = &self.settings.probe_tool_id {
            return tools.into_iter().find(|t| &t.id == id);
        }
        tools
            .iter()
            .find(|t| t.is_valid_probe())
            .or_else(|| tools.iter().find(|t| t.kind == ToolKind::Probe))
            .cloned()
    }
}

struct SessionInner {
    state: SessionState,
    metadata: SessionMetadata,
    streams: Vec<Arc<FrameRecorder>>,
    positions: Option<Arc<PositionRecorder>>,
    probe_tool: Option<TrackedTool>,
    results: Vec<ReconstructionResult>,
    last_error: Option<String>,
    cancel: Option<CancellationToken>,
}

/// One recording and its post-processing
pub struct AcquisitionSession {
    id: String,
    context: Arc<AcquisitionContext>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for AcquisitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl AcquisitionSession {
    /// Create an idle session; `index` numbers sessions within a run
    pub fn new(index: u32, context: Arc<AcquisitionContext>) -> Arc<Self> {
        let now = context.clock.now();
        let id = format!("US_{:02}_{}", index, format_compact(now));
        Arc::new(Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                metadata: SessionMetadata::new(id.clone(), to_datetime(now)),
                streams: Vec::new(),
                positions: None,
                probe_tool: None,
                results: Vec::new(),
                last_error: None,
                cancel: None,
            }),
            id,
            context,
        })
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Copy of the metadata
    pub fn metadata(&self) -> SessionMetadata {
        self.lock().metadata.clone()
    }

    /// Set a free-text description
    pub fn set_description(&self, description: impl Into<String>) {
        self.lock().metadata.description = Some(description.into());
    }

    /// Recording interval, once stopped
    pub fn time_range(&self) -> Option<(Timestamp, Timestamp)> {
        let inner = self.lock();
        Some((inner.metadata.start_time?, inner.metadata.stop_time?))
    }

    /// Video recorders
    pub fn streams(&self) -> Vec<Arc<FrameRecorder>> {
        self.lock().streams.clone()
    }

    /// Pose recorder
    pub fn positions(&self) -> Option<Arc<PositionRecorder>> {
        self.lock().positions.clone()
    }

    /// Probe tool captured at recording start
    pub fn probe_tool(&self) -> Option<TrackedTool> {
        self.lock().probe_tool.clone()
    }

    /// Error of the last failed post-processing run
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Number of reconstructed volumes held
    pub fn result_count(&self) -> usize {
        self.lock().results.len()
    }

    /// Borrow the reconstructed volumes
    pub fn with_results<R>(&self, f: impl FnOnce(&[ReconstructionResult]) -> R) -> R {
        f(&self.lock().results)
    }

    /// Take ownership of the reconstructed volumes
    pub fn take_results(&self) -> Vec<ReconstructionResult> {
        std::mem::take(&mut self.lock().results)
    }

    /// Start recording
    ///
    /// Only valid from `Idle`. Fails with [`UsReconError::NotReady`] when the
    /// sources do not meet the readiness requirements.
    pub fn start_record(&self) -> Result<()> {
        let mut inner = self.lock();
        self.expect_state(&inner, "start recording", &[SessionState::Idle])?;

        let readiness = readiness::evaluate(&self.context);
        if !readiness.ready {
            let reason = readiness.reason.unwrap_or_else(|| "unknown".to_string());
            tracing::warn!("Session {}: cannot start recording: {}", self.id, reason);
            return Err(UsReconError::NotReady(reason));
        }

        let probe_tool = self.context.probe_tool();
        let settings = &self.context.settings;
        let start = self.context.clock.now();

        let positions = Arc::new(PositionRecorder::new(probe_tool.as_ref().map(|t| t.id.clone())));
        positions.start_record(self.context.tracking.clone());

        let mut streams = Vec::new();
        for source in &self.context.video_sources {
            if !source.is_connected() {
                tracing::warn!("Session {}: stream {} not connected, skipped", self.id, source.id());
                continue;
            }
            let recorder = Arc::new(
                FrameRecorder::new(
                    source.id(),
                    self.context.clock.clone(),
                    self.context.frame_pool.clone(),
                )
                .with_max_bytes(settings.max_recording_bytes),
            );
            let events = self.context.events.clone();
            let session_id = self.id.clone();
            recorder.set_fault_hook(Box::new(move |stream_id, error| {
                events.publish(AcquisitionEvent::RecordingFault {
                    session_id: session_id.clone(),
                    stream_id: stream_id.to_string(),
                    message: error.to_string(),
                });
            }));
            recorder.start_record(Some(source.clone()));
            streams.push(recorder);
        }

        inner.metadata.start_time = Some(start);
        inner.metadata.stop_time = None;
        inner.metadata.recorded_at = to_datetime(start);
        inner.metadata.probe_tool_id = probe_tool.as_ref().map(|t| t.id.clone());
        inner.metadata.stream_ids = streams.iter().map(|s| s.stream_id().to_string()).collect();
        inner.streams = streams;
        inner.positions = Some(positions);
        inner.probe_tool = probe_tool;

        tracing::info!(
            "Session {}: recording {} stream(s), probe {:?}",
            self.id,
            inner.streams.len(),
            inner.metadata.probe_tool_id
        );
        self.set_state(&mut inner, SessionState::Recording);
        Ok(())
    }

    /// Stop recording
    ///
    /// Returns [`UsReconError::Allocation`] if a recorder failed to store a
    /// frame; the session is `Stopped` either way.
    pub fn stop_record(&self) -> Result<()> {
        let mut inner = self.lock();
        self.expect_state(&inner, "stop recording", &[SessionState::Recording])?;

        for stream in &inner.streams {
            stream.stop_record();
        }
        if let Some(positions) = &inner.positions {
            positions.stop_record();
        }
        let stop = self.context.clock.now();
        inner.metadata.stop_time = Some(stop);

        tracing::info!(
            "Session {}: recording stopped after {:.0} ms, frames {:?}, poses {}",
            self.id,
            inner.metadata.duration_ms().unwrap_or_default(),
            inner.streams.iter().map(|s| s.len()).collect::<Vec<_>>(),
            inner.positions.as_ref().map(|p| p.len()).unwrap_or_default()
        );
        self.set_state(&mut inner, SessionState::Stopped);

        match Self::recorder_fault(&inner) {
            Some(fault) => Err(UsReconError::Allocation(fault)),
            None => Ok(()),
        }
    }

    /// Discard the recording
    pub fn cancel_record(&self) -> Result<()> {
        let mut inner = self.lock();
        self.expect_state(
            &inner,
            "cancel recording",
            &[SessionState::Recording, SessionState::Stopped],
        )?;

        for stream in inner.streams.drain(..) {
            stream.stop_record();
            stream.clear();
        }
        if let Some(positions) = inner.positions.take() {
            positions.stop_record();
            positions.clear();
        }

        tracing::info!("Session {}: recording cancelled", self.id);
        self.set_state(&mut inner, SessionState::Cancelled);
        self.context.events.publish(AcquisitionEvent::RecordingCancelled {
            session_id: self.id.clone(),
        });
        Ok(())
    }

    /// Enter `PostProcessing` and package the work for the worker
    pub fn begin_post_processing(
        self: &Arc<Self>,
        assembly: AssemblySettings,
        reconstruction: ReconstructionSettings,
    ) -> Result<PostProcessingJob> {
        let mut inner = self.lock();
        self.expect_state(&inner, "start post-processing", &[SessionState::Stopped])?;

        if let Some(fault) = Self::recorder_fault(&inner) {
            tracing::warn!("Session {}: refusing to process a faulted recording", self.id);
            return Err(UsReconError::Allocation(fault));
        }

        let cancel = CancellationToken::new();
        inner.cancel = Some(cancel.clone());
        inner.last_error = None;
        inner.results.clear();
        self.set_state(&mut inner, SessionState::PostProcessing);

        Ok(PostProcessingJob {
            session: Arc::clone(self),
            assembler: ReconstructionInputAssembler::new(assembly),
            reconstructor: VolumeReconstructor::new(reconstruction),
            cancel,
        })
    }

    /// Request cancellation of the running post-processing
    pub fn stop_post_processing(&self) -> Result<()> {
        let inner = self.lock();
        self.expect_state(&inner, "stop post-processing", &[SessionState::PostProcessing])?;
        if let Some(cancel) = &inner.cancel {
            cancel.cancel();
        }
        tracing::info!("Session {}: post-processing cancellation requested", self.id);
        Ok(())
    }

    /// Return to `Stopped` when the job owning `cancel` will never run
    ///
    /// Does nothing once that job has finished or a newer job has started.
    fn abort_post_processing(&self, cancel: &CancellationToken, message: &str) {
        let mut inner = self.lock();
        let owned = inner.cancel.as_ref().is_some_and(|c| c.same_as(cancel));
        if inner.state != SessionState::PostProcessing || !owned {
            return;
        }
        tracing::warn!("Session {}: post-processing abandoned: {}", self.id, message);
        inner.cancel = None;
        inner.last_error = Some(message.to_string());
        self.set_state(&mut inner, SessionState::Stopped);
        drop(inner);
        self.context.events.publish(AcquisitionEvent::ReconstructionFailed {
            session_id: self.id.clone(),
            message: message.to_string(),
        });
    }

    fn finish_post_processing(&self, outcome: JobOutcome) {
        let mut inner = self.lock();
        if inner.state != SessionState::PostProcessing {
            tracing::warn!(
                "Session {}: post-processing finished while {}",
                self.id,
                inner.state
            );
            return;
        }
        inner.cancel = None;

        let event = match outcome {
            JobOutcome::Complete { results, summaries } => {
                inner.results = results;
                self.set_state(&mut inner, SessionState::Complete);
                AcquisitionEvent::ReconstructionFinished {
                    session_id: self.id.clone(),
                    streams: summaries,
                }
            }
            JobOutcome::Failed(message) => {
                inner.last_error = Some(message.clone());
                self.set_state(&mut inner, SessionState::Stopped);
                AcquisitionEvent::ReconstructionFailed {
                    session_id: self.id.clone(),
                    message,
                }
            }
            JobOutcome::Cancelled => {
                self.set_state(&mut inner, SessionState::Stopped);
                AcquisitionEvent::ReconstructionCancelled {
                    session_id: self.id.clone(),
                }
            }
        };
        drop(inner);
        self.context.events.publish(event);
    }

    fn recorder_fault(inner: &SessionInner) -> Option<String> {
        inner
            .streams
            .iter()
            .find_map(|s| s.fault().map(|f| format!("stream {}: {}", s.stream_id(), f)))
    }

    fn expect_state(
        &self,
        inner: &SessionInner,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<()> {
        if allowed.contains(&inner.state) {
            return Ok(());
        }
        tracing::warn!("Session {}: cannot {} while {}", self.id, operation, inner.state);
        Err(UsReconError::InvalidTransition {
            operation,
            state: inner.state,
        })
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        tracing::debug!("Session {}: {} -> {}", self.id, inner.state, state);
        inner.state = state;
        self.context.events.publish(AcquisitionEvent::StateChanged {
            session_id: self.id.clone(),
            state,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum JobOutcome {
    Complete {
        results: Vec<ReconstructionResult>,
        summaries: Vec<StreamSummary>,
    },
    Failed(String),
    Cancelled,
}

/// Reconstruction of a stopped session, run on the worker thread
pub struct PostProcessingJob {
    session: Arc<AcquisitionSession>,
    assembler: ReconstructionInputAssembler,
    reconstructor: VolumeReconstructor,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PostProcessingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessingJob")
            .field("session", &self.session.id())
            .finish()
    }
}

impl PostProcessingJob {
    /// Session being processed
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Token cancelling this job
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Give the job up without running it; the session returns to `Stopped`
    pub fn abandon(self, reason: &str) {
        self.session.abort_post_processing(&self.cancel, reason);
    }

    /// Assemble and reconstruct every stream
    ///
    /// Streams fail independently; the job fails only if no stream produced
    /// a volume. On success the session becomes `Complete`, otherwise it
    /// returns to `Stopped` with the recording intact.
    pub fn run(self) -> Result<Vec<StreamSummary>> {
        let session = &self.session;
        let events = &session.context.events;
        let session_id = session.id().to_string();

        let (streams, track, probe_tool, range) = {
            let inner = session.lock();
            (
                inner.streams.clone(),
                inner.positions.as_ref().map(|p| p.track()).unwrap_or_default(),
                inner.probe_tool.clone(),
                inner.metadata.start_time.zip(inner.metadata.stop_time),
            )
        };
        let (start, stop) = range.unwrap_or((f64::NEG_INFINITY, f64::INFINITY));

        tracing::info!(
            "Session {}: post-processing {} stream(s) against {} poses",
            session_id,
            streams.len(),
            track.len()
        );

        let mut results = Vec::new();
        let mut summaries = Vec::new();
        let mut failures: Vec<UsReconError> = Vec::new();

        for stream in &streams {
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }
            let stream_id = stream.stream_id().to_string();
            let window = stream.get_recording(start, stop);

            let outcome = self
                .assembler
                .assemble(&stream_id, &window, &track, probe_tool.as_ref())
                .and_then(|input| {
                    if self.assembler.exceeds_drop_warning(&input) {
                        events.warn(format!(
                            "Stream {}: {} of {} frames had no usable tracking",
                            stream_id,
                            input.dropped.total(),
                            input.frames_total
                        ));
                    }
                    self.reconstruct(&session_id, &stream_id, &input)
                });

            match outcome {
                Ok(result) => {
                    let volume = &result.volume;
                    summaries.push(StreamSummary {
                        stream_id: stream_id.clone(),
                        frames_used: result.frames_used,
                        frames_dropped: result.frames_dropped,
                        dimensions: volume.dimensions(),
                        spacing: volume.spacing[0],
                        error: None,
                    });
                    results.push(result);
                }
                Err(e) if e.is_cancelled() => return self.cancelled(),
                Err(e) => {
                    tracing::error!("Session {}: stream {} failed: {}", session_id, stream_id, e);
                    summaries.push(StreamSummary {
                        stream_id: stream_id.clone(),
                        frames_used: 0,
                        frames_dropped: window.len(),
                        dimensions: (0, 0, 0),
                        spacing: 0.0,
                        error: Some(e.to_string()),
                    });
                    failures.push(e.with_context(format!("stream {}", stream_id)));
                }
            }
        }

        if results.is_empty() {
            let error = failures
                .into_iter()
                .next()
                .unwrap_or_else(|| UsReconError::Source("session has no video streams".to_string()));
            tracing::error!("Session {}: post-processing failed: {}", session_id, error);
            session.finish_post_processing(JobOutcome::Failed(error.to_string()));
            return Err(error);
        }

        tracing::info!(
            "Session {}: post-processing complete, {} volume(s)",
            session_id,
            results.len()
        );
        session.finish_post_processing(JobOutcome::Complete {
            results,
            summaries: summaries.clone(),
        });
        Ok(summaries)
    }

    fn reconstruct(
        &self,
        session_id: &str,
        stream_id: &str,
        input: &crate::reconstruction::ReconstructInputData,
    ) -> Result<ReconstructionResult> {
        let events = &self.session.context.events;
        let mut last_percent = None;
        self.reconstructor.reconstruct(input, &self.cancel, |processed, total| {
            let percent = processed * 100 / total.max(1);
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                events.publish(AcquisitionEvent::ReconstructionProgress {
                    session_id: session_id.to_string(),
                    stream_id: stream_id.to_string(),
                    processed,
                    total,
                });
            }
        })
    }

    fn cancelled(&self) -> Result<Vec<StreamSummary>> {
        tracing::info!("Session {}: post-processing cancelled", self.session.id());
        self.session.finish_post_processing(JobOutcome::Cancelled);
        Err(UsReconError::Cancelled)
    }
}

impl Drop for PostProcessingJob {
    fn drop(&mut self) {
        // No-op after run, which already released the session
        self.session
            .abort_post_processing(&self.cancel, "post-processing job dropped before it ran");
    }
}

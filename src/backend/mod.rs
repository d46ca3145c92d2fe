//! Backend module: sources and the reconstruction worker
//!
//! Acquisition is driven by callbacks from video and tracking sources, while
//! post-processing runs on a dedicated worker thread so recording control
//! stays responsive.
//!
//! # Architecture
//!
//! - [`VideoSource`] / [`TrackingSource`] - Collaborator traits for grabbers and trackers
//! - [`MockVideoSource`] / [`MockTracker`] - Synthetic sources for tests and demos
//! - [`WorkerCommand`] - Messages sent to the reconstruction worker
//! - [`WorkerClient`] - Caller-side handle for submitting jobs
//! - [`ReconstructionBackend`] - Entry point that owns and runs the worker
//!
//! # Example
//!
//! ```ignore
//! use usrecon_rs::backend::ReconstructionBackend;
//! use usrecon_rs::events::EventBus;
//!
//! let (events, event_rx) = EventBus::new();
//! let (backend, client) = ReconstructionBackend::new(events);
//! let handle = backend.spawn()?;
//!
//! client.submit(session.begin_post_processing(assembly, reconstruction)?)?;
//!
//! client.shutdown();
//! handle.join().ok();
//! ```

pub mod mock_source;
pub mod source_trait;
pub mod worker;

pub use mock_source::{MockImagePattern, MockTracker, MockTrajectory, MockVideoSource};
pub use source_trait::{
    FrameEvent, FrameHandler, SharedTrackingSource, SharedVideoSource, StatusEvent, StatusHandler,
    TrackingSource, TransformEvent, TransformHandler, VideoSource,
};
pub use worker::{ReconstructionWorker, WorkerCommand, WorkerStats};

use crate::error::{Result, UsReconError};
use crate::events::EventBus;
use crate::session::PostProcessingJob;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Jobs that may wait for the worker
const COMMAND_QUEUE: usize = 16;

/// Caller-side handle to the reconstruction worker
#[derive(Debug, Clone)]
pub struct WorkerClient {
    /// Sender for commands to the worker
    command_sender: Sender<WorkerCommand>,
    /// Running flag shared with the worker
    running: Arc<AtomicBool>,
}

impl WorkerClient {
    /// Queue a post-processing job
    ///
    /// Fails with [`UsReconError::Channel`] if the worker has stopped or its
    /// queue is full. The job is abandoned in that case and its session
    /// returns to `Stopped`.
    pub fn submit(&self, job: PostProcessingJob) -> Result<()> {
        if !self.is_running() {
            let error = UsReconError::Channel("reconstruction worker is not running".to_string());
            job.abandon(&error.to_string());
            return Err(error);
        }
        let (command, error) = match self.command_sender.try_send(WorkerCommand::Reconstruct(job)) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(command)) => (
                command,
                UsReconError::Channel("reconstruction queue is full".to_string()),
            ),
            Err(TrySendError::Disconnected(command)) => (
                command,
                UsReconError::Channel("reconstruction worker disconnected".to_string()),
            ),
        };
        if let WorkerCommand::Reconstruct(job) = command {
            job.abandon(&error.to_string());
        }
        Err(error)
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        let _ = self.command_sender.send(WorkerCommand::Shutdown);
    }

    /// Check if the worker loop is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The reconstruction backend that runs in a separate thread
pub struct ReconstructionBackend {
    /// Receiver for commands from the client
    command_receiver: Receiver<WorkerCommand>,
    /// Event sink
    events: EventBus,
    /// Running flag
    running: Arc<AtomicBool>,
}

impl ReconstructionBackend {
    /// Create a new backend with its client handle
    pub fn new(events: EventBus) -> (Self, WorkerClient) {
        let (cmd_tx, cmd_rx) = bounded(COMMAND_QUEUE);
        let running = Arc::new(AtomicBool::new(true));

        let backend = Self {
            command_receiver: cmd_rx,
            events,
            running: running.clone(),
        };
        let client = WorkerClient {
            command_sender: cmd_tx,
            running,
        };

        (backend, client)
    }

    /// Run the worker loop on the current thread
    pub fn run(self) {
        let mut worker = ReconstructionWorker::new(self.command_receiver, self.events, self.running);
        worker.run();
    }

    /// Run the worker loop on a named thread
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("reconstruction-worker".to_string())
            .spawn(move || self.run())
            .map_err(UsReconError::from)
    }

    /// Get a handle to stop the backend
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AcquisitionSettings, AssemblySettings, ReconstructionSettings};
    use crate::events::AcquisitionEvent;
    use crate::session::{AcquisitionContext, AcquisitionSession, SessionState};

    #[test]
    fn test_backend_creation() {
        let (events, _rx) = EventBus::new();
        let (backend, client) = ReconstructionBackend::new(events);

        assert!(backend.stop_handle().load(Ordering::SeqCst));
        assert!(client.is_running());
    }

    #[test]
    fn test_spawned_worker_shuts_down() {
        let (events, rx) = EventBus::new();
        let (backend, client) = ReconstructionBackend::new(events);
        let handle = backend.spawn().unwrap();

        client.shutdown();
        handle.join().unwrap();

        assert!(!client.is_running());
        assert!(crate::events::drain(&rx).contains(&crate::events::AcquisitionEvent::Shutdown));
    }

    fn stopped_session(events: EventBus) -> Arc<AcquisitionSession> {
        let settings = AcquisitionSettings {
            require_probe: false,
            ..Default::default()
        };
        let context = AcquisitionContext::new(Arc::new(ManualClock::new(0.0)), events)
            .with_tracking(Arc::new(MockTracker::new()))
            .with_video_source(Arc::new(MockVideoSource::new("us0")))
            .with_settings(settings);
        let session = AcquisitionSession::new(1, Arc::new(context));
        session.start_record().unwrap();
        session.stop_record().unwrap();
        session
    }

    fn begin(session: &Arc<AcquisitionSession>) -> PostProcessingJob {
        session
            .begin_post_processing(AssemblySettings::default(), ReconstructionSettings::default())
            .unwrap()
    }

    #[test]
    fn test_rejected_job_releases_session() {
        let (events, rx) = EventBus::new();
        let session = stopped_session(events.clone());
        let (backend, client) = ReconstructionBackend::new(events);

        backend.stop_handle().store(false, Ordering::SeqCst);
        let err = client.submit(begin(&session)).unwrap_err();
        assert!(matches!(err, UsReconError::Channel(_)));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.last_error().unwrap().contains("not running"));

        // Worker gone while the client still believes it runs
        backend.stop_handle().store(true, Ordering::SeqCst);
        drop(backend);
        assert!(client.submit(begin(&session)).is_err());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.last_error().unwrap().contains("disconnected"));

        let failures = crate::events::drain(&rx)
            .into_iter()
            .filter(|e| matches!(e, AcquisitionEvent::ReconstructionFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_queued_job_released_when_worker_exits() {
        let (events, _rx) = EventBus::new();
        let session = stopped_session(events.clone());
        let (backend, client) = ReconstructionBackend::new(events);

        // Shutdown is handled before the job behind it is received
        client.shutdown();
        client.submit(begin(&session)).unwrap();
        assert_eq!(session.state(), SessionState::PostProcessing);

        backend.run();
        drop(client);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.last_error().is_some());
    }
}

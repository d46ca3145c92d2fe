//! Command surface for acquisition
//!
//! [`AcquisitionService`] owns the readiness monitor, the reconstruction
//! worker and the most recent session. Every command returns an explicit
//! result; nothing panics across this boundary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::backend::{ReconstructionBackend, WorkerClient};
use crate::config::{AppConfig, AssemblySettings, ReconstructionSettings};
use crate::error::{Result, UsReconError};
use crate::persistence::{FilePersistence, SessionPersistence};

use super::acquisition::{AcquisitionContext, AcquisitionSession};
use super::readiness::{Readiness, ReadinessMonitor};
use super::types::SessionState;

/// Acquisition commands over the latest session
pub struct AcquisitionService {
    context: Arc<AcquisitionContext>,
    monitor: Arc<ReadinessMonitor>,
    latest: Mutex<Option<Arc<AcquisitionSession>>>,
    session_counter: AtomicU32,
    worker: WorkerClient,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    assembly: AssemblySettings,
    reconstruction: ReconstructionSettings,
    persistence: FilePersistence,
}

impl std::fmt::Debug for AcquisitionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionService")
            .field("state", &self.state())
            .field("worker_running", &self.worker.is_running())
            .finish()
    }
}

impl AcquisitionService {
    /// Validate `config`, start the reconstruction worker and the readiness monitor
    pub fn new(context: AcquisitionContext, config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(context.with_settings(config.acquisition.clone()));
        let persistence = FilePersistence::from_settings(&config.persistence, config.assembly.clone())?;

        let (backend, worker) = ReconstructionBackend::new(context.events.clone());
        let handle = backend.spawn()?;

        let monitor = Arc::new(ReadinessMonitor::new(context.clone()));
        monitor.start();

        tracing::info!(
            "Acquisition service started with {} video source(s), sessions in {}",
            context.video_sources.len(),
            persistence.root().display()
        );

        Ok(Self {
            context,
            monitor,
            latest: Mutex::new(None),
            session_counter: AtomicU32::new(0),
            worker,
            worker_handle: Mutex::new(Some(handle)),
            assembly: config.assembly.clone(),
            reconstruction: config.reconstruction.clone(),
            persistence,
        })
    }

    /// Shared sources and settings
    pub fn context(&self) -> &Arc<AcquisitionContext> {
        &self.context
    }

    /// Session storage
    pub fn persistence(&self) -> &FilePersistence {
        &self.persistence
    }

    /// Start a new session and begin recording
    ///
    /// Refused while the latest session is still recording or processing.
    pub fn start_record(&self) -> Result<Arc<AcquisitionSession>> {
        let mut latest = self.lock_latest();
        if let Some(session) = latest.as_ref() {
            let state = session.state();
            if matches!(state, SessionState::Recording | SessionState::PostProcessing) {
                tracing::warn!("Cannot start recording: session {} is {}", session.id(), state);
                return Err(UsReconError::InvalidTransition {
                    operation: "start recording",
                    state,
                });
            }
        }

        let index = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session = AcquisitionSession::new(index, self.context.clone());
        session.start_record()?;
        *latest = Some(session.clone());
        Ok(session)
    }

    /// Stop recording the latest session
    pub fn stop_record(&self) -> Result<()> {
        self.require_latest("stop recording")?.stop_record()
    }

    /// Discard the latest recording
    pub fn cancel_record(&self) -> Result<()> {
        self.require_latest("cancel recording")?.cancel_record()
    }

    /// Queue reconstruction of the latest session
    pub fn start_post_processing(&self) -> Result<()> {
        let session = self.require_latest("start post-processing")?;
        let job = session.begin_post_processing(self.assembly.clone(), self.reconstruction.clone())?;
        // A rejected job returns the session to Stopped
        self.worker.submit(job).map_err(|e| {
            tracing::error!("Session {}: could not queue post-processing: {}", session.id(), e);
            e
        })
    }

    /// Cancel reconstruction of the latest session
    pub fn stop_post_processing(&self) -> Result<()> {
        self.require_latest("stop post-processing")?.stop_post_processing()
    }

    /// Most recently started session
    pub fn latest_session(&self) -> Option<Arc<AcquisitionSession>> {
        self.lock_latest().clone()
    }

    /// State of the latest session (`Idle` before the first one)
    pub fn state(&self) -> SessionState {
        self.lock_latest()
            .as_ref()
            .map(|s| s.state())
            .unwrap_or_default()
    }

    /// Check if recording could start now
    pub fn is_ready(&self) -> bool {
        self.readiness().ready
    }

    /// Readiness with the first unmet requirement
    pub fn readiness(&self) -> Readiness {
        self.monitor.current()
    }

    /// Write the latest session and any reconstructed volumes
    pub fn save_latest_session(&self) -> Result<PathBuf> {
        let session = self.require_latest("save session")?;
        let dir = self.persistence.write_session(&session)?;
        session.with_results(|results| {
            results.iter().try_for_each(|result| {
                self.persistence
                    .write_volume(&result.volume, &dir, &result.stream_id)
                    .map(|_| ())
            })
        })?;
        Ok(dir)
    }

    /// Stop the monitor and the worker
    ///
    /// A running reconstruction is cancelled first. Safe to call twice.
    pub fn shutdown(&self) {
        self.monitor.stop();
        if let Some(session) = self.latest_session() {
            if session.state() == SessionState::PostProcessing {
                let _ = session.stop_post_processing();
            }
        }

        let handle = self
            .worker_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            self.worker.shutdown();
            if handle.join().is_err() {
                tracing::error!("Reconstruction worker panicked");
            }
            tracing::info!("Acquisition service stopped");
        }
    }

    fn require_latest(&self, operation: &'static str) -> Result<Arc<AcquisitionSession>> {
        self.latest_session().ok_or_else(|| {
            tracing::warn!("Cannot {}: no session", operation);
            UsReconError::InvalidTransition {
                operation,
                state: SessionState::Idle,
            }
        })
    }

    fn lock_latest(&self) -> std::sync::MutexGuard<'_, Option<Arc<AcquisitionSession>>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for AcquisitionService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock_source::{MockTracker, MockVideoSource};
    use crate::clock::ManualClock;
    use crate::config::PersistenceSettings;
    use crate::events::EventBus;
    use tempfile::tempdir;

    fn service(root: &std::path::Path) -> (AcquisitionService, Arc<MockTracker>) {
        let (events, _rx) = EventBus::new();
        let tracker = Arc::new(MockTracker::new());
        let context = AcquisitionContext::new(Arc::new(ManualClock::new(0.0)), events)
            .with_tracking(tracker.clone())
            .with_video_source(Arc::new(MockVideoSource::new("us0")));
        let mut config = AppConfig::default();
        config.acquisition.require_probe = false;
        config.persistence = PersistenceSettings {
            session_root: Some(root.to_path_buf()),
        };
        (AcquisitionService::new(context, &config).unwrap(), tracker)
    }

    #[test]
    fn test_commands_without_session() {
        let dir = tempdir().unwrap();
        let (service, _) = service(dir.path());

        assert_eq!(service.state(), SessionState::Idle);
        assert!(service.latest_session().is_none());
        assert!(service.stop_record().is_err());
        assert!(service.cancel_record().is_err());
        assert!(service.start_post_processing().is_err());
        assert!(service.stop_post_processing().is_err());
        assert!(service.save_latest_session().is_err());
    }

    #[test]
    fn test_new_session_per_recording() {
        let dir = tempdir().unwrap();
        let (service, _) = service(dir.path());
        assert!(service.is_ready());

        let first = service.start_record().unwrap();
        assert!(service.start_record().is_err());
        service.cancel_record().unwrap();

        let second = service.start_record().unwrap();
        assert_ne!(first.id(), second.id());
        assert!(second.id().starts_with("US_02_"));
        assert_eq!(service.state(), SessionState::Recording);

        service.shutdown();
        service.shutdown();
    }

    #[test]
    fn test_not_ready_creates_no_session() {
        let dir = tempdir().unwrap();
        let (service, tracker) = service(dir.path());
        tracker.set_tracking(false);

        assert!(!service.is_ready());
        assert!(matches!(service.start_record(), Err(UsReconError::NotReady(_))));
        assert!(service.latest_session().is_none());
    }
}

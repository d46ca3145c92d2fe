//! Reconstruction worker thread
//!
//! Post-processing can take seconds per stream, so it never runs on the
//! thread that drives acquisition. The worker receives packaged
//! [`PostProcessingJob`]s over a crossbeam channel and runs them one at a
//! time. Progress and results reach the caller through the session's
//! [`EventBus`]; the worker itself only reports that it shut down.
//!
//! # Cancellation
//!
//! A running job is cancelled through its session
//! ([`AcquisitionSession::stop_post_processing`](crate::session::AcquisitionSession::stop_post_processing)).
//! The reconstructor checks the token between frames, so the worker becomes
//! available again shortly after.

use crate::events::{AcquisitionEvent, EventBus};
use crate::session::PostProcessingJob;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long the loop waits for a command before re-checking the running flag
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Commands accepted by the reconstruction worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Run a post-processing job
    Reconstruct(PostProcessingJob),
    /// Stop the worker after the current job
    Shutdown,
}

/// Counters kept by the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs that produced at least one volume
    pub completed: usize,
    /// Jobs that failed
    pub failed: usize,
    /// Jobs cancelled before finishing
    pub cancelled: usize,
}

/// The worker that runs post-processing jobs
pub struct ReconstructionWorker {
    /// Command receiver
    command_rx: Receiver<WorkerCommand>,
    /// Event sink for the shutdown notice
    events: EventBus,
    /// Running flag
    running: Arc<AtomicBool>,
    /// Job counters
    stats: WorkerStats,
}

impl ReconstructionWorker {
    /// Create a new worker
    pub fn new(command_rx: Receiver<WorkerCommand>, events: EventBus, running: Arc<AtomicBool>) -> Self {
        Self {
            command_rx,
            events,
            running,
            stats: WorkerStats::default(),
        }
    }

    /// Job counters so far
    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Run the main worker loop
    pub fn run(&mut self) {
        tracing::info!("Reconstruction worker started");

        while self.running.load(Ordering::SeqCst) {
            match self.command_rx.recv_timeout(IDLE_POLL) {
                Ok(cmd) => self.handle_command(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.running.store(false, Ordering::SeqCst);
                }
            }
        }

        self.events.publish(AcquisitionEvent::Shutdown);
        tracing::info!(
            "Reconstruction worker stopped ({} completed, {} failed, {} cancelled)",
            self.stats.completed,
            self.stats.failed,
            self.stats.cancelled
        );
    }

    /// Handle a single command
    fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Reconstruct(job) => self.run_job(job),
            WorkerCommand::Shutdown => {
                tracing::info!("Reconstruction worker shutdown requested");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn run_job(&mut self, job: PostProcessingJob) {
        let session_id = job.session_id().to_string();
        let started = Instant::now();
        tracing::info!("Running post-processing for session {}", session_id);

        match job.run() {
            Ok(summaries) => {
                self.stats.completed += 1;
                tracing::info!(
                    "Session {}: {} stream(s) processed in {:.2?}",
                    session_id,
                    summaries.len(),
                    started.elapsed()
                );
            }
            Err(e) if e.is_cancelled() => {
                self.stats.cancelled += 1;
                tracing::info!("Session {}: post-processing cancelled", session_id);
            }
            Err(e) => {
                self.stats.failed += 1;
                tracing::warn!("Session {}: post-processing failed: {}", session_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn create_test_worker() -> (
        ReconstructionWorker,
        Receiver<AcquisitionEvent>,
        crossbeam_channel::Sender<WorkerCommand>,
    ) {
        let (cmd_tx, cmd_rx) = bounded(4);
        let (events, event_rx) = EventBus::new();
        let running = Arc::new(AtomicBool::new(true));
        (ReconstructionWorker::new(cmd_rx, events, running), event_rx, cmd_tx)
    }

    #[test]
    fn test_shutdown_command() {
        let (mut worker, event_rx, cmd_tx) = create_test_worker();
        cmd_tx.send(WorkerCommand::Shutdown).unwrap();
        worker.run();

        assert!(!worker.running.load(Ordering::SeqCst));
        assert_eq!(event_rx.try_recv().ok(), Some(AcquisitionEvent::Shutdown));
    }

    #[test]
    fn test_disconnected_channel_stops_worker() {
        let (mut worker, _event_rx, cmd_tx) = create_test_worker();
        drop(cmd_tx);
        worker.run();
        assert!(!worker.running.load(Ordering::SeqCst));
        assert_eq!(worker.stats(), WorkerStats::default());
    }
}

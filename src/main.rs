//! usrecon-rs - Main Entry Point
//!
//! Runs a simulated freehand sweep against mock sources: records three
//! seconds of video and tracking, reconstructs a volume on the worker thread
//! and saves the session. An optional first argument overrides the session
//! root directory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use usrecon_rs::{
    backend::{MockImagePattern, MockTracker, MockTrajectory, MockVideoSource},
    clock::{Clock, ManualClock, SystemClock},
    config::{AppConfig, LOGS_DIR},
    events::AcquisitionEvent,
    probe::ProbeDefinition,
    session::{AcquisitionContext, AcquisitionService},
    types::{ToolKind, TrackedTool, Transform3D},
    EventBus,
};

const SWEEP_MS: u64 = 3_000;
const FRAME_INTERVAL_MS: u64 = 33;
const POSE_INTERVAL_MS: u64 = 50;

fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = init_logging();

    tracing::info!("Starting usrecon-rs demo sweep");

    let mut config = AppConfig::load_or_default();
    if let Some(root) = std::env::args().nth(1) {
        config.persistence.session_root = Some(root.into());
    }

    let start = SystemClock::new().now();
    let clock = Arc::new(ManualClock::new(start));
    let (events, event_rx) = EventBus::new();

    let probe = TrackedTool::new("probe", ToolKind::Probe)
        .with_probe(ProbeDefinition::sector([64.0, 0.0], 5.0, 60.0, 60f64.to_radians()))
        .with_calibration(Transform3D::from_translation(0.0, 0.0, 12.5));
    let tracker = Arc::new(MockTracker::new().with_tool(probe));
    tracker.set_trajectory(
        "probe",
        Transform3D::identity(),
        MockTrajectory::LinearSweep {
            velocity: [0.0, 0.0, 10.0],
        },
    );
    let video = Arc::new(
        MockVideoSource::new("us0")
            .with_size(128, 128, [0.5, 0.5])
            .with_pattern(MockImagePattern::Gradient)
            .with_clock_offset(-start),
    );

    let context = AcquisitionContext::new(clock.clone(), events)
        .with_tracking(tracker.clone())
        .with_video_source(video.clone());
    let service = AcquisitionService::new(context, &config).context("starting acquisition service")?;

    if !service.is_ready() {
        bail!("not ready: {:?}", service.readiness().reason);
    }

    let session = service.start_record()?;
    for ms in 0..=SWEEP_MS {
        clock.set(start + ms as f64);
        if ms % POSE_INTERVAL_MS == 0 {
            tracker.generate(clock.now());
        }
        if ms % FRAME_INTERVAL_MS == 0 {
            video.generate(clock.now());
        }
    }
    service.stop_record()?;
    tracing::info!(
        "Recorded {} frames and {} poses",
        session.streams().iter().map(|s| s.len()).sum::<usize>(),
        session.positions().map(|p| p.len()).unwrap_or_default()
    );

    service.start_post_processing()?;
    loop {
        let event = event_rx
            .recv_timeout(Duration::from_secs(60))
            .context("waiting for reconstruction")?;
        match event {
            AcquisitionEvent::ReconstructionProgress { processed, total, .. } => {
                tracing::debug!("Reconstruction {}/{}", processed, total);
            }
            AcquisitionEvent::ReconstructionFinished { streams, .. } => {
                for s in &streams {
                    tracing::info!(
                        "Stream {}: {:?} voxels at {:.2} mm from {} frames ({} dropped)",
                        s.stream_id,
                        s.dimensions,
                        s.spacing,
                        s.frames_used,
                        s.frames_dropped
                    );
                }
                break;
            }
            AcquisitionEvent::ReconstructionFailed { message, .. } => {
                bail!("reconstruction failed: {}", message);
            }
            AcquisitionEvent::ReconstructionCancelled { .. } => {
                bail!("reconstruction cancelled");
            }
            AcquisitionEvent::Warning { message } => tracing::warn!("{}", message),
            _ => {}
        }
    }

    let path = service.save_latest_session().context("saving session")?;
    tracing::info!("Session saved to {}", path.display());
    println!("{}", path.display());

    service.shutdown();
    Ok(())
}

/// Stderr logging plus a daily log file in the app data directory
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,usrecon_rs=debug"));

    let file = usrecon_rs::config::ensure_app_data_dir().ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir.join(LOGS_DIR), "usrecon.log");
        tracing_appender::non_blocking(appender)
    });

    match file {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    }
}

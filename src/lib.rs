//! # usrecon-rs: Tracked Ultrasound Acquisition and Reconstruction
//!
//! Records 2D ultrasound video together with the pose of a tracked probe and
//! reconstructs a 3D voxel volume from the recording. Video and tracking
//! arrive on independent clocks and threads; every stream is mapped onto a
//! common wall clock before frames and poses are joined.
//!
//! ## Architecture
//!
//! - **Sources**: Video grabbers and trackers are injected through the
//!   [`backend::VideoSource`] / [`backend::TrackingSource`] traits
//! - **Session**: Recorders buffer frames and poses between start and stop;
//!   a state machine guards every transition
//! - **Reconstruction**: Frames are time-joined with interpolated poses, then
//!   inserted into an axis-aligned voxel grid
//! - **Worker**: Post-processing runs on a dedicated thread fed through
//!   crossbeam channels; progress is published on the [`events::EventBus`]
//! - **Persistence**: Sessions and volumes are written to a directory per
//!   session
//!
//! ## Configuration
//!
//! Configuration and the default session root live in the platform-appropriate
//! data directory under `dev.usrecon.usrecon-rs`:
//!
//! - **Linux**: `~/.local/share/dev.usrecon.usrecon-rs/`
//! - **macOS**: `~/Library/Application Support/dev.usrecon.usrecon-rs/`
//! - **Windows**: `%APPDATA%\dev.usrecon.usrecon-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use usrecon_rs::{
//!     clock::SystemClock,
//!     config::AppConfig,
//!     events::EventBus,
//!     session::{AcquisitionContext, AcquisitionService},
//! };
//!
//! let (events, event_rx) = EventBus::new();
//! let context = AcquisitionContext::new(Arc::new(SystemClock::new()), events)
//!     .with_tracking(tracker)
//!     .with_video_source(grabber);
//! let service = AcquisitionService::new(context, &AppConfig::load_or_default())?;
//!
//! service.start_record()?;
//! // ...
//! service.stop_record()?;
//! service.start_post_processing()?;
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod persistence;
pub mod probe;
pub mod reconstruction;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use backend::{ReconstructionBackend, TrackingSource, VideoSource, WorkerClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{Result, ResultExt, UsReconError};
pub use events::{AcquisitionEvent, EventBus};
pub use persistence::{FilePersistence, SessionPersistence};
pub use probe::ProbeDefinition;
pub use reconstruction::{ReconstructionInputAssembler, Volume, VolumeReconstructor};
pub use session::{AcquisitionContext, AcquisitionService, AcquisitionSession, SessionState};
pub use types::{ImageFrame, Timestamp, Timestamped, TrackedTool, Transform3D};

//! Session recording module
//!
//! This module records tracked ultrasound sessions: video frames and probe
//! poses are buffered with timestamps between a start and a stop command,
//! then handed to post-processing.
//!
//! # Features
//!
//! - Per-stream frame recording with a sync shift latched on the first frame
//! - Pose recording with bracketing and interpolation queries
//! - Readiness evaluation from live source status
//! - Session state machine with cancellation at every stage
//! - A command surface ([`AcquisitionService`]) over the latest session

pub mod acquisition;
pub mod buffer;
pub mod frame_pool;
pub mod frame_recorder;
pub mod position_recorder;
pub mod readiness;
pub mod service;
pub mod types;

pub use acquisition::{AcquisitionContext, AcquisitionSession, PostProcessingJob};
pub use buffer::SampleBuffer;
pub use frame_pool::FramePool;
pub use frame_recorder::FrameRecorder;
pub use position_recorder::{PoseBracket, PoseTrack, PositionRecorder};
pub use readiness::{Readiness, ReadinessMonitor};
pub use service::AcquisitionService;
pub use types::{RecordingWindow, SessionMetadata, SessionState};

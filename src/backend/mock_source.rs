//! Mock Video and Tracking Sources
//!
//! This module provides in-process sources that can be used to exercise the
//! acquisition pipeline without hardware. Frames and poses are pushed
//! explicitly (`emit_*`) or generated from patterns for a given wall time.
//!
//! # Image Patterns
//!
//! - [`MockImagePattern::Constant`] - Every pixel has the same value
//! - [`MockImagePattern::Gradient`] - Intensity increases with depth
//! - [`MockImagePattern::Checkerboard`] - Alternating squares
//! - [`MockImagePattern::FrameCounter`] - Value equals the frame number (mod 256)
//!
//! # Trajectories
//!
//! - [`MockTrajectory::Static`] - The probe does not move
//! - [`MockTrajectory::LinearSweep`] - Constant-velocity translation
//! - [`MockTrajectory::Tilt`] - Rotation about an axis through the probe origin
//!
//! # Example
//!
//! ```ignore
//! use usrecon_rs::backend::mock_source::{MockVideoSource, MockTracker, MockTrajectory};
//!
//! let video = MockVideoSource::new("us0").with_clock_offset(-5_000.0);
//! let tracker = MockTracker::new().with_tool(probe_tool);
//! tracker.set_trajectory(
//!     "probe",
//!     Transform3D::identity(),
//!     MockTrajectory::LinearSweep { velocity: [0.0, 0.0, 10.0] },
//! );
//!
//! video.generate(now);
//! tracker.generate(now);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use nalgebra::Vector3;

use crate::events::{Signal, SubscriptionToken};
use crate::types::{ImageFrame, Timestamp, TrackedTool, Transform3D};

use super::source_trait::{
    FrameEvent, FrameHandler, StatusEvent, StatusHandler, TrackingSource, TransformEvent,
    TransformHandler, VideoSource,
};

/// Pattern for generating mock frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockImagePattern {
    /// Constant value
    Constant(u8),
    /// Linear ramp from 0 at the top row to 255 at the bottom row
    Gradient,
    /// Squares of `size` pixels alternating between 0 and 255
    Checkerboard { size: usize },
    /// Every pixel equals the frame number modulo 256
    FrameCounter,
}

impl Default for MockImagePattern {
    fn default() -> Self {
        MockImagePattern::Constant(128)
    }
}

impl MockImagePattern {
    /// Generate a frame for the given frame number
    pub fn generate(&self, width: usize, height: usize, spacing: [f64; 2], n: u64) -> ImageFrame {
        let data: Vec<u8> = match *self {
            MockImagePattern::Constant(v) => vec![v; width * height],
            MockImagePattern::Gradient => (0..height)
                .flat_map(|y| {
                    let v = if height > 1 {
                        (y * 255 / (height - 1)) as u8
                    } else {
                        0
                    };
                    std::iter::repeat(v).take(width)
                })
                .collect(),
            MockImagePattern::Checkerboard { size } => {
                let size = size.max(1);
                (0..height)
                    .flat_map(|y| {
                        (0..width).map(move |x| {
                            if (x / size + y / size) % 2 == 0 {
                                255
                            } else {
                                0
                            }
                        })
                    })
                    .collect()
            }
            MockImagePattern::FrameCounter => vec![(n % 256) as u8; width * height],
        };
        ImageFrame::from_array(
            ndarray::Array2::from_shape_vec((height, width), data)
                .unwrap_or_else(|_| ndarray::Array2::zeros((height, width))),
            spacing,
        )
    }
}

/// Mock ultrasound video stream
///
/// The source reports timestamps on its own clock: `wall + clock_offset`.
pub struct MockVideoSource {
    id: String,
    connected: AtomicBool,
    latest: Mutex<Option<Timestamp>>,
    frames: Signal<FrameEvent>,
    status: Signal<StatusEvent>,
    pattern: MockImagePattern,
    width: usize,
    height: usize,
    spacing: [f64; 2],
    clock_offset: f64,
    frame_counter: AtomicU64,
}

impl std::fmt::Debug for MockVideoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVideoSource")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("pattern", &self.pattern)
            .finish()
    }
}

impl MockVideoSource {
    /// Create a connected 64x48 source with 0.5 mm pixels
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connected: AtomicBool::new(true),
            latest: Mutex::new(None),
            frames: Signal::new(),
            status: Signal::new(),
            pattern: MockImagePattern::default(),
            width: 64,
            height: 48,
            spacing: [0.5, 0.5],
            clock_offset: 0.0,
            frame_counter: AtomicU64::new(0),
        }
    }

    /// Set the frame size and pixel spacing
    pub fn with_size(mut self, width: usize, height: usize, spacing: [f64; 2]) -> Self {
        self.width = width;
        self.height = height;
        self.spacing = spacing;
        self
    }

    /// Set the image pattern
    pub fn with_pattern(mut self, pattern: MockImagePattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Offset of the source clock relative to wall time (ms)
    pub fn with_clock_offset(mut self, offset_ms: f64) -> Self {
        self.clock_offset = offset_ms;
        self
    }

    /// Source clock offset (ms)
    pub fn clock_offset(&self) -> f64 {
        self.clock_offset
    }

    /// Change connection state and notify status subscribers
    pub fn set_connected(&self, connected: bool) {
        let previous = self.connected.swap(connected, Ordering::SeqCst);
        if previous != connected {
            self.status.emit(&StatusEvent {
                source_id: self.id.clone(),
                active: connected,
            });
        }
    }

    /// Deliver a frame with an explicit source timestamp
    pub fn emit_frame(&self, source_timestamp: Timestamp, frame: ImageFrame) {
        if !self.is_connected() {
            return;
        }
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(source_timestamp);
        }
        self.frame_counter.fetch_add(1, Ordering::Relaxed);
        self.frames.emit(&FrameEvent {
            timestamp: source_timestamp,
            frame,
        });
    }

    /// Generate and deliver a frame captured at wall time `wall`
    pub fn generate(&self, wall: Timestamp) {
        let n = self.frame_counter.load(Ordering::Relaxed);
        let frame = self
            .pattern
            .generate(self.width, self.height, self.spacing, n);
        self.emit_frame(wall + self.clock_offset, frame);
    }

    /// Number of frames delivered so far
    pub fn frames_emitted(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }
}

impl VideoSource for MockVideoSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn latest_timestamp(&self) -> Option<Timestamp> {
        self.latest.lock().ok().and_then(|l| *l)
    }

    fn subscribe_frames(&self, handler: FrameHandler) -> SubscriptionToken {
        self.frames.subscribe(handler)
    }

    fn subscribe_status(&self, handler: StatusHandler) -> SubscriptionToken {
        self.status.subscribe(handler)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        if !self.frames.unsubscribe(token) {
            self.status.unsubscribe(token);
        }
    }
}

/// Motion pattern of a mock tool
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockTrajectory {
    /// Fixed pose
    Static,
    /// Translation with constant velocity (mm/s) starting at the base pose
    LinearSweep { velocity: [f64; 3] },
    /// Rotation about `axis` with constant angular velocity (rad/s)
    Tilt { axis: [f64; 3], angular_velocity: f64 },
}

#[derive(Debug, Clone)]
struct MockToolState {
    base: Transform3D,
    trajectory: MockTrajectory,
}

/// Mock tracking system
pub struct MockTracker {
    tracking: AtomicBool,
    tools: Mutex<Vec<TrackedTool>>,
    motion: Mutex<HashMap<String, MockToolState>>,
    start_time: Mutex<Option<Timestamp>>,
    transforms: Signal<TransformEvent>,
    status: Signal<StatusEvent>,
}

impl std::fmt::Debug for MockTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTracker")
            .field("tracking", &self.is_tracking())
            .finish()
    }
}

impl Default for MockTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTracker {
    /// Create a tracker that is already tracking and has no tools
    pub fn new() -> Self {
        Self {
            tracking: AtomicBool::new(true),
            tools: Mutex::new(Vec::new()),
            motion: Mutex::new(HashMap::new()),
            start_time: Mutex::new(None),
            transforms: Signal::new(),
            status: Signal::new(),
        }
    }

    /// Add a tool (builder form)
    pub fn with_tool(self, tool: TrackedTool) -> Self {
        self.add_tool(tool);
        self
    }

    /// Add or replace a tool
    pub fn add_tool(&self, tool: TrackedTool) {
        if let Ok(mut tools) = self.tools.lock() {
            tools.retain(|t| t.id != tool.id);
            tools.push(tool);
        }
        self.status.emit(&StatusEvent {
            source_id: "tracker".to_string(),
            active: self.is_tracking(),
        });
    }

    /// Remove a tool
    pub fn remove_tool(&self, id: &str) {
        if let Ok(mut tools) = self.tools.lock() {
            tools.retain(|t| t.id != id);
        }
        self.status.emit(&StatusEvent {
            source_id: "tracker".to_string(),
            active: self.is_tracking(),
        });
    }

    /// Configure how a tool moves when poses are generated
    pub fn set_trajectory(&self, tool_id: &str, base: Transform3D, trajectory: MockTrajectory) {
        if let Ok(mut motion) = self.motion.lock() {
            motion.insert(tool_id.to_string(), MockToolState { base, trajectory });
        }
    }

    /// Start or stop tracking and notify status subscribers
    pub fn set_tracking(&self, tracking: bool) {
        let previous = self.tracking.swap(tracking, Ordering::SeqCst);
        if previous != tracking {
            self.status.emit(&StatusEvent {
                source_id: "tracker".to_string(),
                active: tracking,
            });
        }
    }

    /// Deliver a transform for a tool
    pub fn emit_pose(&self, timestamp: Timestamp, tool_id: &str, transform: Transform3D) {
        if !self.is_tracking() {
            return;
        }
        self.transforms.emit(&TransformEvent {
            timestamp,
            tool_id: tool_id.to_string(),
            transform,
        });
    }

    /// Pose of a tool at wall time `wall` according to its trajectory
    pub fn pose_at(&self, tool_id: &str, wall: Timestamp) -> Option<Transform3D> {
        let state = self.motion.lock().ok()?.get(tool_id).cloned()?;
        let t0 = {
            let mut start = self.start_time.lock().ok()?;
            *start.get_or_insert(wall)
        };
        let secs = (wall - t0) / 1000.0;

        let offset = match state.trajectory {
            MockTrajectory::Static => Transform3D::identity(),
            MockTrajectory::LinearSweep { velocity } => Transform3D::from_translation(
                velocity[0] * secs,
                velocity[1] * secs,
                velocity[2] * secs,
            ),
            MockTrajectory::Tilt {
                axis,
                angular_velocity,
            } => Transform3D::from_axis_angle(
                Vector3::new(axis[0], axis[1], axis[2]),
                angular_velocity * secs,
                Vector3::zeros(),
            ),
        };
        Some(match state.trajectory {
            // Sweeps move in the reference frame, tilts rotate the tool in place
            MockTrajectory::LinearSweep { .. } => offset * state.base,
            _ => state.base * offset,
        })
    }

    /// Generate and deliver poses for every tool with a trajectory
    pub fn generate(&self, wall: Timestamp) {
        let ids: Vec<String> = match self.motion.lock() {
            Ok(motion) => motion.keys().cloned().collect(),
            Err(_) => return,
        };
        for id in ids {
            if let Some(pose) = self.pose_at(&id, wall) {
                self.emit_pose(wall, &id, pose);
            }
        }
    }
}

impl TrackingSource for MockTracker {
    fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    fn tools(&self) -> Vec<TrackedTool> {
        self.tools.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn subscribe_transforms(&self, handler: TransformHandler) -> SubscriptionToken {
        self.transforms.subscribe(handler)
    }

    fn subscribe_status(&self, handler: StatusHandler) -> SubscriptionToken {
        self.status.subscribe(handler)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        if !self.transforms.unsubscribe(token) {
            self.status.unsubscribe(token);
        }
    }
}

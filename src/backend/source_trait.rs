//! Collaborator traits for video and tracking sources
//!
//! The acquisition core never talks to hardware directly. Video grabbers and
//! tracking systems are injected as trait objects, so both real devices and
//! the mock sources in [`super::mock_source`] can be used.

use std::sync::Arc;

use crate::events::SubscriptionToken;
use crate::types::{ImageFrame, Timestamp, TrackedTool, Transform3D};

/// A new video frame, as reported by the source
#[derive(Debug, Clone)]
pub struct FrameEvent {
    /// Timestamp on the source's own clock (ms)
    pub timestamp: Timestamp,
    /// The frame; the source may reuse this buffer after the event returns
    pub frame: ImageFrame,
}

/// A new tool transform, as reported by the tracker
#[derive(Debug, Clone)]
pub struct TransformEvent {
    /// Timestamp (ms, wall clock)
    pub timestamp: Timestamp,
    /// Tracked tool id
    pub tool_id: String,
    /// Tool to reference transform
    pub transform: Transform3D,
}

/// Connection/tracking status change of a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Source id
    pub source_id: String,
    /// Connected (video) or tracking (tracker)
    pub active: bool,
}

/// Callback receiving frames
pub type FrameHandler = Box<dyn Fn(&FrameEvent) + Send + Sync>;

/// Callback receiving tool transforms
pub type TransformHandler = Box<dyn Fn(&TransformEvent) + Send + Sync>;

/// Callback receiving status changes
pub type StatusHandler = Box<dyn Fn(&StatusEvent) + Send + Sync>;

/// A stream of ultrasound video frames
///
/// Implementations deliver frames on their own thread. Handlers must return
/// quickly and must copy the frame if they keep it.
pub trait VideoSource: Send + Sync {
    /// Stable stream id (used in file names and events)
    fn id(&self) -> &str;

    /// Check if the stream is connected and delivering frames
    fn is_connected(&self) -> bool;

    /// Source timestamp of the most recent frame
    fn latest_timestamp(&self) -> Option<Timestamp>;

    /// Register a frame handler
    fn subscribe_frames(&self, handler: FrameHandler) -> SubscriptionToken;

    /// Register a connection status handler
    fn subscribe_status(&self, handler: StatusHandler) -> SubscriptionToken;

    /// Remove a handler registered with either subscribe method
    fn unsubscribe(&self, token: SubscriptionToken);
}

/// A tracking system reporting tool poses
pub trait TrackingSource: Send + Sync {
    /// Check if the tracker is currently tracking
    fn is_tracking(&self) -> bool;

    /// Tools known to the tracker
    fn tools(&self) -> Vec<TrackedTool>;

    /// Register a transform handler
    fn subscribe_transforms(&self, handler: TransformHandler) -> SubscriptionToken;

    /// Register a tracking status handler
    fn subscribe_status(&self, handler: StatusHandler) -> SubscriptionToken;

    /// Remove a handler registered with either subscribe method
    fn unsubscribe(&self, token: SubscriptionToken);
}

/// Shared video source handle
pub type SharedVideoSource = Arc<dyn VideoSource>;

/// Shared tracking source handle
pub type SharedTrackingSource = Arc<dyn TrackingSource>;

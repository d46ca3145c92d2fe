//! Mock construction helpers

use std::sync::Arc;

use crossbeam_channel::Receiver;
use usrecon_rs::backend::{MockImagePattern, MockTracker, MockTrajectory, MockVideoSource};
use usrecon_rs::clock::{Clock, ManualClock};
use usrecon_rs::events::{AcquisitionEvent, EventBus};
use usrecon_rs::session::AcquisitionContext;
use usrecon_rs::types::{TrackedTool, Transform3D};

use super::builders::ProbeToolBuilder;

/// Wall-clock start of every simulated recording
pub const T0: f64 = 1_700_000_000_000.0;

/// Mock sources wired into a context
pub struct MockRig {
    pub clock: Arc<ManualClock>,
    pub tracker: Arc<MockTracker>,
    pub video: Arc<MockVideoSource>,
    pub events: EventBus,
    pub event_rx: Receiver<AcquisitionEvent>,
}

impl MockRig {
    /// 32x32 frames at 1 mm, one probe tool sweeping +z at 10 mm/s
    pub fn new() -> Self {
        Self::with_tool(ProbeToolBuilder::new("probe").build())
    }

    pub fn with_tool(tool: TrackedTool) -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let (events, event_rx) = EventBus::new();
        let tool_id = tool.id.clone();
        let tracker = Arc::new(MockTracker::new().with_tool(tool));
        tracker.set_trajectory(
            &tool_id,
            Transform3D::identity(),
            MockTrajectory::LinearSweep {
                velocity: [0.0, 0.0, 10.0],
            },
        );
        // Video clock starts at zero when the wall clock is at T0
        let video = Arc::new(
            MockVideoSource::new("us0")
                .with_size(32, 32, [1.0, 1.0])
                .with_pattern(MockImagePattern::Constant(200))
                .with_clock_offset(-T0),
        );
        Self {
            clock,
            tracker,
            video,
            events,
            event_rx,
        }
    }

    /// Context over the rig's sources
    pub fn context(&self) -> AcquisitionContext {
        AcquisitionContext::new(self.clock.clone(), self.events.clone())
            .with_tracking(self.tracker.clone())
            .with_video_source(self.video.clone())
    }

    /// Advance the clock in 1 ms steps for `duration_ms`, emitting frames and
    /// poses at their intervals
    pub fn run(&self, duration_ms: u64, frame_interval_ms: u64, pose_interval_ms: u64) {
        let start = self.clock.now();
        for ms in 0..=duration_ms {
            self.clock.set(start + ms as f64);
            if ms % pose_interval_ms == 0 {
                self.tracker.generate(self.clock.now());
            }
            if ms % frame_interval_ms == 0 {
                self.video.generate(self.clock.now());
            }
        }
    }
}
